use super::pool::{FetchTask, run_bounded};
use super::{Orchestrator, PipelineError, Run, Stage, domain};
use crate::intervals::TimeWindow;
use crate::models::{AdCategory, AdEntity, FetchRequest};
use crate::storage::ArtifactKey;
use serde_json::{Value, json};
use std::collections::BTreeSet;
use tracing::info;

pub(super) async fn run(
    orch: &Orchestrator,
    run: &mut Run,
    windows: &[TimeWindow],
) -> Result<(), PipelineError> {
    let entities = if run.enter(Stage::AdListings) {
        Some(listings(orch, run).await?)
    } else {
        None
    };
    let entities = match entities {
        Some(entities) => entities,
        None => stored_listings(orch, run)?,
    };

    if run.enter(Stage::AdCreatives) {
        creatives(orch, run, &entities).await?;
    }

    if run.enter(Stage::AdInsights) {
        insights(orch, run, &entities, windows).await?;
    }

    Ok(())
}

fn listing_fields(orch: &Orchestrator, category: AdCategory) -> &str {
    match category {
        AdCategory::Campaigns => &orch.graph.campaign_fields,
        AdCategory::Adsets => &orch.graph.adset_fields,
        AdCategory::Ads => &orch.graph.ad_fields,
    }
}

fn listing_key(category: AdCategory) -> ArtifactKey {
    ArtifactKey::new(category.as_str(), category.listing_key())
}

fn entities_from(category: AdCategory, records: &[Value]) -> Vec<AdEntity> {
    records
        .iter()
        .filter_map(|r| AdEntity::from_record(category, r))
        .collect()
}

async fn listings(orch: &Orchestrator, run: &mut Run) -> Result<Vec<AdEntity>, PipelineError> {
    let mut entities = Vec::new();

    for category in AdCategory::ALL {
        let request = FetchRequest::first_page(format!(
            "act_{}/{}",
            orch.graph.ads_account,
            category.as_str()
        ))
        .param("fields", listing_fields(orch, category))
        .param("limit", orch.graph.listing_limit.to_string());

        let outcome = orch
            .fetch(run, Stage::AdListings, &request, listing_key(category))
            .await?;
        let found = outcome
            .result()
            .map(|r| entities_from(category, r.records()))
            .unwrap_or_default();
        info!("{}: {} entities", category.as_str(), found.len());
        entities.extend(found);
    }

    Ok(entities)
}

fn stored_listings(orch: &Orchestrator, run: &mut Run) -> Result<Vec<AdEntity>, PipelineError> {
    let stage = run.start.unwrap_or(Stage::AdCreatives);
    let mut entities = Vec::new();
    for category in AdCategory::ALL {
        if let Some(records) = orch.load_upstream_records(run, stage, &listing_key(category))? {
            entities.extend(entities_from(category, &records));
        }
    }
    Ok(entities)
}

async fn creatives(
    orch: &Orchestrator,
    run: &mut Run,
    entities: &[AdEntity],
) -> Result<(), PipelineError> {
    // ads sharing a creative map to the same artifact
    let creative_ids: BTreeSet<&str> = entities
        .iter()
        .filter(|e| e.category == AdCategory::Ads)
        .filter_map(|e| e.creative_id.as_deref())
        .collect();
    info!(creatives = creative_ids.len(), "fetching ad creatives");

    for id in creative_ids {
        let request =
            FetchRequest::object(id).param("fields", orch.graph.creative_fields.as_str());
        let key = ArtifactKey::new(domain::AD_CREATIVES, id);
        orch.fetch(run, Stage::AdCreatives, &request, key).await?;
    }
    Ok(())
}

fn insight_task(orch: &Orchestrator, entity: &AdEntity, window: &TimeWindow) -> FetchTask {
    let time_range = json!({"since": window.since_str(), "until": window.until_str()});
    let request = FetchRequest::first_page(format!("{}/insights", entity.id))
        .param("fields", orch.graph.insights_fields.as_str())
        .param("time_range", time_range.to_string())
        .param("time_increment", "monthly");

    FetchTask {
        label: format!("{} {} {}", entity.category.as_str(), entity.id, window),
        request,
        key: ArtifactKey::new(entity.category.insights_domain(), window.entity_key(&entity.id)),
    }
}

async fn insights(
    orch: &Orchestrator,
    run: &mut Run,
    entities: &[AdEntity],
    windows: &[TimeWindow],
) -> Result<(), PipelineError> {
    let tasks: Vec<FetchTask> = windows
        .iter()
        .flat_map(|w| entities.iter().map(move |e| insight_task(orch, e, w)))
        .collect();
    info!(
        tasks = tasks.len(),
        entities = entities.len(),
        windows = windows.len(),
        pool = orch.pool_size,
        "fanning out ad insights"
    );

    let report = run_bounded(orch.fetcher.clone(), tasks, orch.pool_size).await;
    run.report.artifacts_written += report.written;
    run.report.empty_results += report.succeeded - report.written;
    run.report.batch = Some(report.clone());

    info!(
        succeeded = report.succeeded,
        failed = report.failures.len(),
        "ad insights drained"
    );

    if report.is_clean() {
        Ok(())
    } else {
        Err(PipelineError::BatchFailed {
            stage: Stage::AdInsights,
            report,
        })
    }
}
