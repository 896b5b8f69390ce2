mod auth;
mod client;
mod config;
mod intervals;
mod models;
mod pipeline;
mod storage;
#[cfg(test)]
mod testing;
mod utils;

use anyhow::{Context, Result, bail};
use chrono::Local;
use clap::{Parser, Subcommand};
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

use crate::auth::EnvCredentials;
use crate::client::GraphFetcher;
use crate::config::AppConfig;
use crate::intervals::IntervalMode;
use crate::pipeline::{Orchestrator, PipelineError, RunError, Stage, Workflow};

#[derive(Parser)]
#[command(name = "graph-etl", about = "Facebook Graph API page and ads harvester", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Command {
    /// Harvest one workflow over the configured history
    Run {
        /// `social` (page, posts, Instagram) or `ads` (campaigns, adsets, ads)
        #[arg(short, long, env = "ETL_MODE", value_enum, ignore_case = true)]
        mode: Workflow,

        /// Months of history before the current month
        #[arg(long, env = "NUM_MONTHS_DATA")]
        months: Option<u32>,

        /// Window granularity (defaults to the configured mode)
        #[arg(long, value_enum)]
        intervals: Option<IntervalMode>,

        /// Start from this stage, reading earlier stages' artifacts from disk
        #[arg(long, value_enum)]
        from_stage: Option<Stage>,

        #[arg(long, env = "PAGE_ID")]
        page_id: Option<String>,

        #[arg(long, env = "PAGE_NAME")]
        page_name: Option<String>,

        #[arg(long, env = "ADS_ACCOUNT")]
        ads_account: Option<String>,
    },

    /// Print the windows a run would cover
    Intervals {
        #[arg(long, env = "NUM_MONTHS_DATA")]
        months: Option<u32>,

        #[arg(long, value_enum)]
        mode: Option<IntervalMode>,
    },

    /// List the stages of each workflow, in dependency order
    Stages,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 => "graph_etl=info,warn",
        1 => "graph_etl=debug,info",
        _ => "trace",
    };

    tracing_subscriber::registry()
        .with(fmt::layer().compact().with_target(false))
        .with(EnvFilter::new(filter))
        .init();

    let mut config = AppConfig::load()?;

    match cli.command {
        Command::Run {
            mode,
            months,
            intervals: interval_mode,
            from_stage,
            page_id,
            page_name,
            ads_account,
        } => {
            if let Some(id) = page_id {
                config.graph.page_id = id;
            }
            if let Some(name) = page_name {
                config.graph.page_name = name;
            }
            if let Some(account) = ads_account {
                config.graph.ads_account = account;
            }
            match mode {
                Workflow::Engagement if config.graph.page_id.is_empty() => {
                    bail!("PAGE_ID is required for the social workflow")
                }
                Workflow::Advertising if config.graph.ads_account.is_empty() => {
                    bail!("ADS_ACCOUNT is required for the ads workflow")
                }
                _ => {}
            }

            let _t = utils::Timer::start(format!("{mode} ETL"));
            let windows = intervals::generate(
                interval_mode.unwrap_or(config.pipeline.interval_mode),
                Local::now().date_naive(),
                months.unwrap_or(config.pipeline.num_months),
            )?;
            info!(
                "{} windows: {}",
                windows.len(),
                utils::fmt_list(&windows)
            );

            let credentials = Arc::new(EnvCredentials::new(config.graph.token_env.clone()));
            let fetcher = Arc::new(
                GraphFetcher::from_config(&config, credentials)
                    .context("Failed to build Graph API fetcher")?,
            );
            info!("Artifacts under {}", fetcher.store().base().display());

            let orchestrator =
                Orchestrator::new(config.graph.clone(), fetcher, config.pipeline.concurrency);

            match orchestrator.run(mode, &windows, from_stage).await {
                Ok(report) => {
                    info!(
                        "Done: {} artifacts written | {} empty | {} skipped branches | stages: {}",
                        report.artifacts_written,
                        report.empty_results,
                        report.skipped_branches,
                        utils::fmt_list(&report.stages_run)
                    );
                }
                Err(RunError { source, report }) => {
                    error!(
                        "Stopped in state {:?}: {} artifacts written | {} empty | {} skipped branches",
                        report.final_state,
                        report.artifacts_written,
                        report.empty_results,
                        report.skipped_branches
                    );
                    if let PipelineError::BatchFailed { stage, report } = &source {
                        error!(
                            "{}: {} of {} tasks failed",
                            stage,
                            report.failures.len(),
                            report.total()
                        );
                        bail!("{mode} ETL finished with failed tasks");
                    }
                    error!("{:#}", source);
                    return Err(source).context(format!("{mode} ETL failed"));
                }
            }
        }

        Command::Intervals { months, mode } => {
            let mode = mode.unwrap_or(config.pipeline.interval_mode);
            let windows = intervals::generate(
                mode,
                Local::now().date_naive(),
                months.unwrap_or(config.pipeline.num_months),
            )?;
            println!("{} windows ({:?}):", windows.len(), mode);
            for w in &windows {
                println!("  since {}  until {}  key {}", w.since, w.until, w.window_key());
            }
        }

        Command::Stages => {
            for workflow in [Workflow::Engagement, Workflow::Advertising] {
                println!("{:<7} {}", workflow, utils::fmt_list(workflow.stages()));
            }
        }
    }

    Ok(())
}
