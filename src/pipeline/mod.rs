//! Pipeline orchestrator: sequences dependent fetch stages into artifacts.
//!
//! ## Workflows
//!
//! `Engagement` (`social`):
//!   1. Page metrics per window
//!   2. Posts per window
//!   3. Insights for every post found in step 2, one at a time
//!   4. Instagram business account → media list → per-media insights (once per run)
//!
//! `Advertising` (`ads`):
//!   1. Campaign, adset and ad listings (once per run)
//!   2. Creative details for every ad carrying a creative
//!   3. Insights per (entity, window), fanned out on a bounded pool
//!
//! Stages hand entity IDs to their dependants in memory. When a run starts
//! from a later stage, the skipped producers' artifacts are read back from the
//! store instead; a missing artifact means that branch has nothing to do.

mod advertising;
mod engagement;
pub mod pool;
pub mod state;

use crate::client::{FetchError, GraphFetcher};
use crate::config::GraphConfig;
use crate::intervals::TimeWindow;
use crate::models::{FetchOutcome, FetchRequest, data_array};
use crate::storage::{ArtifactKey, ArtifactStore, StoreError};
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

use self::pool::BatchReport;
use self::state::{StateMachine, WorkflowState};

/// Artifact domains, one directory each under the artifact base.
pub mod domain {
    pub const PAGE_METRICS: &str = "facebook_page_metrics";
    pub const POSTS: &str = "facebook_posts";
    pub const POST_METRICS: &str = "facebook_post_metrics";
    pub const IG_ACCOUNT: &str = "instagram_business_account";
    pub const IG_MEDIA: &str = "instagram_media";
    pub const IG_MEDIA_METRICS: &str = "instagram_media_metrics";
    pub const AD_CREATIVES: &str = "ad_creatives";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum Workflow {
    #[value(name = "social", alias = "engagement")]
    Engagement,
    #[value(name = "ads", alias = "advertising")]
    Advertising,
}

impl Workflow {
    pub fn stages(&self) -> &'static [Stage] {
        match self {
            Workflow::Engagement => &[
                Stage::PageMetrics,
                Stage::Posts,
                Stage::PostMetrics,
                Stage::InstagramAccount,
                Stage::InstagramMedia,
                Stage::InstagramMediaMetrics,
            ],
            Workflow::Advertising => &[Stage::AdListings, Stage::AdCreatives, Stage::AdInsights],
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Workflow::Engagement => "social",
            Workflow::Advertising => "ads",
        }
    }
}

impl std::fmt::Display for Workflow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(self.as_str())
    }
}

/// Declaration order is dependency order within each workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, clap::ValueEnum)]
pub enum Stage {
    PageMetrics,
    Posts,
    PostMetrics,
    InstagramAccount,
    InstagramMedia,
    InstagramMediaMetrics,
    AdListings,
    AdCreatives,
    AdInsights,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::PageMetrics => "page-metrics",
            Stage::Posts => "posts",
            Stage::PostMetrics => "post-metrics",
            Stage::InstagramAccount => "instagram-account",
            Stage::InstagramMedia => "instagram-media",
            Stage::InstagramMediaMetrics => "instagram-media-metrics",
            Stage::AdListings => "ad-listings",
            Stage::AdCreatives => "ad-creatives",
            Stage::AdInsights => "ad-insights",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("stage {stage} failed: {source}")]
    Stage {
        stage: Stage,
        #[source]
        source: FetchError,
    },

    #[error("stage {stage} could not read an upstream artifact: {source}")]
    Upstream {
        stage: Stage,
        #[source]
        source: StoreError,
    },

    #[error("{} of {} tasks failed in stage {stage}", .report.failures.len(), .report.total())]
    BatchFailed { stage: Stage, report: BatchReport },

    #[error("stage {stage} is not part of the {workflow} workflow")]
    InvalidResume { workflow: Workflow, stage: Stage },
}

/// A run that stopped early, with everything it did before stopping.
#[derive(Debug, Error)]
#[error("{} workflow aborted", .report.workflow)]
pub struct RunError {
    #[source]
    pub source: PipelineError,
    pub report: RunReport,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunReport {
    pub workflow: Workflow,
    pub windows: usize,
    pub artifacts_written: usize,
    pub empty_results: usize,
    /// Branches skipped because an upstream stage left no data.
    pub skipped_branches: usize,
    pub stages_run: Vec<Stage>,
    pub batch: Option<BatchReport>,
    pub final_state: WorkflowState,
    pub history: Vec<WorkflowState>,
}

/// Bookkeeping for one workflow run.
pub(crate) struct Run {
    workflow: Workflow,
    start: Option<Stage>,
    state: StateMachine,
    report: RunReport,
}

impl Run {
    fn new(workflow: Workflow, start: Option<Stage>, windows: usize) -> Self {
        Self {
            workflow,
            start,
            state: StateMachine::new(),
            report: RunReport {
                workflow,
                windows,
                artifacts_written: 0,
                empty_results: 0,
                skipped_branches: 0,
                stages_run: Vec::new(),
                batch: None,
                final_state: WorkflowState::Init,
                history: Vec::new(),
            },
        }
    }

    /// Enters `stage` unless the run was resumed past it.
    fn enter(&mut self, stage: Stage) -> bool {
        if self.start.is_some_and(|start| stage < start) {
            info!(workflow = %self.workflow, "Skipping stage {} (resumed later)", stage);
            return false;
        }
        info!("=== Stage: {} ===", stage);
        self.state.advance(WorkflowState::Running(stage));
        self.report.stages_run.push(stage);
        true
    }

    fn record(&mut self, outcome: &FetchOutcome) {
        if outcome.is_written() {
            self.report.artifacts_written += 1;
        } else {
            self.report.empty_results += 1;
        }
    }

    fn missing_upstream(&mut self, stage: Stage, key: &ArtifactKey) {
        warn!(stage = %stage, artifact = %key, "MissingUpstreamArtifact: nothing to do for this branch");
        self.report.skipped_branches += 1;
    }

    fn finish(&mut self) {
        self.report.final_state = self.state.current();
        self.report.history = self.state.history().to_vec();
    }
}

pub struct Orchestrator {
    graph: Arc<GraphConfig>,
    fetcher: Arc<GraphFetcher>,
    store: ArtifactStore,
    pool_size: usize,
}

impl Orchestrator {
    pub fn new(graph: GraphConfig, fetcher: Arc<GraphFetcher>, pool_size: usize) -> Self {
        let store = fetcher.store().clone();
        Self {
            graph: Arc::new(graph),
            fetcher,
            store,
            pool_size: pool_size.max(1),
        }
    }

    /// Runs `workflow` over `windows`, optionally starting from a later stage.
    ///
    /// The first unrecoverable stage error ends the run; artifacts written
    /// before it stay on disk and are counted in the error's report.
    pub async fn run(
        &self,
        workflow: Workflow,
        windows: &[TimeWindow],
        from: Option<Stage>,
    ) -> Result<RunReport, RunError> {
        let mut run = Run::new(workflow, from, windows.len());

        if let Some(stage) = from
            && !workflow.stages().contains(&stage)
        {
            run.finish();
            return Err(RunError {
                source: PipelineError::InvalidResume { workflow, stage },
                report: run.report,
            });
        }

        match self.execute(&mut run, windows).await {
            Ok(()) => Ok(run.report),
            Err(source) => Err(RunError {
                source,
                report: run.report,
            }),
        }
    }

    pub(crate) async fn execute(&self, run: &mut Run, windows: &[TimeWindow]) -> Result<(), PipelineError> {
        info!(
            workflow = %run.workflow,
            windows = windows.len(),
            from = ?run.start,
            "Starting workflow"
        );
        run.state.advance(WorkflowState::IntervalsComputed);

        let outcome = match run.workflow {
            Workflow::Engagement => engagement::run(self, run, windows).await,
            Workflow::Advertising => advertising::run(self, run, windows).await,
        };

        match outcome {
            Ok(()) => {
                run.state.advance(WorkflowState::Done);
                run.finish();
                debug!(history = ?run.report.history, "workflow history");
                info!(
                    workflow = %run.workflow,
                    written = run.report.artifacts_written,
                    empty = run.report.empty_results,
                    skipped = run.report.skipped_branches,
                    "Workflow done"
                );
                Ok(())
            }
            Err(e) => {
                if let Some(stage) = run.state.fail() {
                    warn!(workflow = %run.workflow, stage = %stage, "Workflow failed, remaining stages aborted");
                }
                run.finish();
                Err(e)
            }
        }
    }

    /// Sequential fetch within the current stage; any error ends the stage.
    async fn fetch(
        &self,
        run: &mut Run,
        stage: Stage,
        request: &FetchRequest,
        key: ArtifactKey,
    ) -> Result<FetchOutcome, PipelineError> {
        let outcome = self
            .fetcher
            .fetch(request, &key)
            .await
            .map_err(|source| PipelineError::Stage { stage, source })?;
        run.record(&outcome);
        Ok(outcome)
    }

    /// Artifact produced by a stage this run skipped. `None` when absent.
    fn load_upstream(
        &self,
        run: &mut Run,
        stage: Stage,
        key: &ArtifactKey,
    ) -> Result<Option<Value>, PipelineError> {
        match self.store.read(key) {
            Ok(value) => Ok(Some(value)),
            Err(StoreError::NotFound(_)) => {
                run.missing_upstream(stage, key);
                Ok(None)
            }
            Err(source) => Err(PipelineError::Upstream { stage, source }),
        }
    }

    /// `data` records of an upstream artifact. `None` when absent.
    fn load_upstream_records(
        &self,
        run: &mut Run,
        stage: Stage,
        key: &ArtifactKey,
    ) -> Result<Option<Vec<Value>>, PipelineError> {
        Ok(self
            .load_upstream(run, stage, key)?
            .map(|value| data_array(&value).to_vec()))
    }
}
