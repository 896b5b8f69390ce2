//! Bounded fan-out for independent fetches.

use crate::client::GraphFetcher;
use crate::models::{FetchOutcome, FetchRequest};
use crate::storage::ArtifactKey;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{debug, error, warn};

/// One independent fetch, e.g. the insights of one ad for one window.
#[derive(Debug, Clone)]
pub struct FetchTask {
    pub label: String,
    pub request: FetchRequest,
    pub key: ArtifactKey,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskFailure {
    pub label: String,
    pub error: String,
}

/// Outcome of a drained batch. `succeeded` includes tasks that returned no
/// data; `written` counts only those that produced an artifact.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub succeeded: usize,
    pub written: usize,
    pub failures: Vec<TaskFailure>,
}

impl BatchReport {
    pub fn total(&self) -> usize {
        self.succeeded + self.failures.len()
    }

    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Runs every task with at most `pool_size` in flight and waits for all of
/// them. A failed task never cancels its siblings.
pub async fn run_bounded(
    fetcher: Arc<GraphFetcher>,
    tasks: Vec<FetchTask>,
    pool_size: usize,
) -> BatchReport {
    let sem = Arc::new(Semaphore::new(pool_size.max(1)));
    let mut handles = Vec::with_capacity(tasks.len());

    for task in tasks {
        let fetcher = Arc::clone(&fetcher);
        let sem = Arc::clone(&sem);
        let label = task.label.clone();

        let handle = tokio::spawn(async move {
            let _permit = sem
                .acquire_owned()
                .await
                .map_err(|e| format!("worker pool closed: {e}"))?;
            debug!(task = %task.label, "worker start");
            fetcher
                .fetch(&task.request, &task.key)
                .await
                .map_err(|e| e.to_string())
        });

        handles.push((label, handle));
    }

    let mut report = BatchReport::default();
    for (label, handle) in handles {
        match handle.await {
            Ok(Ok(outcome)) => {
                report.succeeded += 1;
                if let FetchOutcome::Written { .. } = outcome {
                    report.written += 1;
                }
            }
            Ok(Err(error)) => report.failures.push(TaskFailure { label, error }),
            Err(e) => {
                error!(task = %label, "Task panic: {}", e);
                report.failures.push(TaskFailure {
                    label,
                    error: format!("task panicked: {e}"),
                });
            }
        }
    }

    for failure in &report.failures {
        warn!(task = %failure.label, "{}", failure.error);
    }

    report
}
