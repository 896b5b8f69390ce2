use std::time::{Duration, Instant};
use tracing::info;

/// Logs when a labelled piece of work starts and, on drop, how long it took.
pub struct Timer {
    label: String,
    start: Instant,
}

impl Timer {
    pub fn start(label: impl Into<String>) -> Self {
        let label = label.into();
        info!(task = %label, "⏱  Starting");
        Self {
            label,
            start: Instant::now(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        info!(task = %self.label, "⏱  Finished (took {:.2?})", self.elapsed());
    }
}

/// Comma-joined list for log lines; `(none)` when empty.
pub fn fmt_list<T: std::fmt::Display>(items: &[T]) -> String {
    if items.is_empty() {
        return "(none)".to_string();
    }
    items
        .iter()
        .map(|i| i.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}
