use super::{Orchestrator, PipelineError, Run, Stage, domain};
use crate::intervals::TimeWindow;
use crate::models::{FetchRequest, FetchResult, MediaItem, record_ids};
use crate::storage::ArtifactKey;
use serde_json::Value;
use tracing::{debug, info};

pub(super) async fn run(
    orch: &Orchestrator,
    run: &mut Run,
    windows: &[TimeWindow],
) -> Result<(), PipelineError> {
    if run.enter(Stage::PageMetrics) {
        page_metrics(orch, run, windows).await?;
    }

    let posts = if run.enter(Stage::Posts) {
        Some(posts(orch, run, windows).await?)
    } else {
        None
    };

    if run.enter(Stage::PostMetrics) {
        let posts = match posts {
            Some(posts) => posts,
            None => stored_posts(orch, run, windows)?,
        };
        post_metrics(orch, run, &posts).await?;
    }

    // Instagram stages run once per run, not per window.
    let ig_account = if run.enter(Stage::InstagramAccount) {
        Some(instagram_account(orch, run).await?)
    } else {
        None
    };

    let media = if run.enter(Stage::InstagramMedia) {
        let account = match ig_account {
            Some(account) => account,
            None => stored_instagram_account(orch, run)?,
        };
        match account {
            Some(id) => Some(instagram_media(orch, run, &id).await?),
            None => Some(Vec::new()),
        }
    } else {
        None
    };

    if run.enter(Stage::InstagramMediaMetrics) {
        let media = match media {
            Some(media) => media,
            None => stored_media(orch, run)?,
        };
        media_metrics(orch, run, &media).await?;
    }

    Ok(())
}

async fn page_metrics(
    orch: &Orchestrator,
    run: &mut Run,
    windows: &[TimeWindow],
) -> Result<(), PipelineError> {
    let graph = &orch.graph;
    for window in windows {
        let request = FetchRequest::paged(format!("{}/insights", graph.page_id))
            .param("metric", graph.page_metrics.join(","))
            .param("since", window.since_str())
            .param("until", window.until_str())
            .param("period", "day");
        let key = ArtifactKey::new(domain::PAGE_METRICS, window.window_key());
        orch.fetch(run, Stage::PageMetrics, &request, key).await?;
    }
    Ok(())
}

async fn posts(
    orch: &Orchestrator,
    run: &mut Run,
    windows: &[TimeWindow],
) -> Result<Vec<(TimeWindow, Vec<String>)>, PipelineError> {
    let graph = &orch.graph;
    let mut by_window = Vec::with_capacity(windows.len());

    for window in windows {
        let request = FetchRequest::paged(format!("{}/posts", graph.page_id))
            .param("fields", graph.post_fields.as_str())
            .param("since", window.since_str())
            .param("until", window.until_str());
        let key = ArtifactKey::new(domain::POSTS, window.window_key());
        let outcome = orch.fetch(run, Stage::Posts, &request, key).await?;

        let ids = outcome
            .result()
            .map(|r| record_ids(r.records()))
            .unwrap_or_default();
        info!(window = %window, posts = ids.len(), "posts discovered");
        by_window.push((*window, ids));
    }

    Ok(by_window)
}

fn stored_posts(
    orch: &Orchestrator,
    run: &mut Run,
    windows: &[TimeWindow],
) -> Result<Vec<(TimeWindow, Vec<String>)>, PipelineError> {
    let mut by_window = Vec::with_capacity(windows.len());
    for window in windows {
        let key = ArtifactKey::new(domain::POSTS, window.window_key());
        if let Some(records) = orch.load_upstream_records(run, Stage::PostMetrics, &key)? {
            by_window.push((*window, record_ids(&records)));
        }
    }
    Ok(by_window)
}

async fn post_metrics(
    orch: &Orchestrator,
    run: &mut Run,
    posts: &[(TimeWindow, Vec<String>)],
) -> Result<(), PipelineError> {
    let metrics = orch.graph.post_metrics.join(",");
    for (window, ids) in posts {
        debug!(window = %window, posts = ids.len(), "fetching post insights");
        for id in ids {
            let request =
                FetchRequest::paged(format!("{id}/insights")).param("metric", metrics.as_str());
            let key = ArtifactKey::new(domain::POST_METRICS, id.as_str());
            orch.fetch(run, Stage::PostMetrics, &request, key).await?;
        }
    }
    Ok(())
}

fn ig_account_key() -> ArtifactKey {
    ArtifactKey::new(domain::IG_ACCOUNT, domain::IG_ACCOUNT)
}

fn ig_media_key() -> ArtifactKey {
    ArtifactKey::new(domain::IG_MEDIA, domain::IG_MEDIA)
}

/// `instagram_business_account.id` of the page object.
fn account_id(body: &Value) -> Option<String> {
    crate::models::record_id(body.get("instagram_business_account")?)
}

async fn instagram_account(orch: &Orchestrator, run: &mut Run) -> Result<Option<String>, PipelineError> {
    let request = FetchRequest::object(orch.graph.page_id.as_str())
        .param("fields", "instagram_business_account");
    let key = ig_account_key();
    let outcome = orch.fetch(run, Stage::InstagramAccount, &request, key.clone()).await?;

    let id = match outcome.result() {
        Some(FetchResult::Single(body)) => account_id(body),
        _ => None,
    };
    if id.is_none() {
        run.missing_upstream(Stage::InstagramAccount, &key);
    }
    Ok(id)
}

fn stored_instagram_account(orch: &Orchestrator, run: &mut Run) -> Result<Option<String>, PipelineError> {
    let key = ig_account_key();
    Ok(orch
        .load_upstream(run, Stage::InstagramMedia, &key)?
        .as_ref()
        .and_then(account_id))
}

async fn instagram_media(
    orch: &Orchestrator,
    run: &mut Run,
    account_id: &str,
) -> Result<Vec<MediaItem>, PipelineError> {
    let request = FetchRequest::paged(format!("{account_id}/media"))
        .param("fields", orch.graph.media_fields.as_str());
    let outcome = orch.fetch(run, Stage::InstagramMedia, &request, ig_media_key()).await?;

    let media: Vec<MediaItem> = outcome
        .result()
        .map(|r| r.records().iter().filter_map(MediaItem::from_record).collect())
        .unwrap_or_default();
    info!(account = account_id, media = media.len(), "Instagram media discovered");
    Ok(media)
}

fn stored_media(orch: &Orchestrator, run: &mut Run) -> Result<Vec<MediaItem>, PipelineError> {
    Ok(orch
        .load_upstream_records(run, Stage::InstagramMediaMetrics, &ig_media_key())?
        .map(|records| records.iter().filter_map(MediaItem::from_record).collect())
        .unwrap_or_default())
}

async fn media_metrics(
    orch: &Orchestrator,
    run: &mut Run,
    media: &[MediaItem],
) -> Result<(), PipelineError> {
    let reel_metrics = orch.graph.insta_reel_metrics.join(",");
    let post_metrics = orch.graph.insta_post_metrics.join(",");

    for item in media {
        let metrics = if item.is_video() {
            &reel_metrics
        } else {
            &post_metrics
        };
        let request =
            FetchRequest::paged(format!("{}/insights", item.id)).param("metric", metrics.as_str());
        let key = ArtifactKey::new(domain::IG_MEDIA_METRICS, item.id.as_str());
        orch.fetch(run, Stage::InstagramMediaMetrics, &request, key).await?;
    }
    Ok(())
}
