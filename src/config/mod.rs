use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::intervals::IntervalMode;

/// Top-level application configuration
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub graph: GraphConfig,
}

/// HTTP client and retry configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ApiConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,

    #[serde(default = "default_api_version")]
    pub version: String,

    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    #[serde(default = "default_user_agent")]
    pub user_agent: String,

    /// Total attempts per fetch when the API answers with a rate-limit error
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_initial_wait_secs")]
    pub initial_wait_secs: u64,
}

/// Artifact storage configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StorageConfig {
    #[serde(default = "default_output_root")]
    pub output_root: PathBuf,
}

/// Pipeline configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PipelineConfig {
    #[serde(default = "default_num_months")]
    pub num_months: u32,

    #[serde(default)]
    pub interval_mode: IntervalMode,

    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
}

/// Endpoint identifiers, metric lists and field selections for the Graph API.
///
/// Built once at startup and handed to the orchestrator; nothing reads these
/// values from process state afterwards.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GraphConfig {
    #[serde(default)]
    pub page_id: String,

    #[serde(default)]
    pub page_name: String,

    #[serde(default)]
    pub ads_account: String,

    #[serde(default = "default_token_env")]
    pub token_env: String,

    #[serde(default = "default_page_metrics")]
    pub page_metrics: Vec<String>,

    #[serde(default = "default_post_metrics")]
    pub post_metrics: Vec<String>,

    #[serde(default = "default_insta_post_metrics")]
    pub insta_post_metrics: Vec<String>,

    #[serde(default = "default_insta_reel_metrics")]
    pub insta_reel_metrics: Vec<String>,

    // Configured but not fetched by any workflow yet.
    #[serde(default = "default_insta_page_metrics")]
    pub insta_page_metrics: Vec<String>,

    #[serde(default = "default_post_fields")]
    pub post_fields: String,

    #[serde(default = "default_media_fields")]
    pub media_fields: String,

    #[serde(default = "default_campaign_fields")]
    pub campaign_fields: String,

    #[serde(default = "default_adset_fields")]
    pub adset_fields: String,

    #[serde(default = "default_ad_fields")]
    pub ad_fields: String,

    #[serde(default = "default_creative_fields")]
    pub creative_fields: String,

    #[serde(default = "default_insights_fields")]
    pub insights_fields: String,

    #[serde(default = "default_listing_limit")]
    pub listing_limit: u32,
}

// ── Defaults ─────────────────────────────────────────────────────────────────

fn default_base_url() -> String {
    "https://graph.facebook.com".to_string()
}
fn default_api_version() -> String {
    "v21.0".to_string()
}
fn default_timeout_secs() -> u64 {
    200
}
fn default_user_agent() -> String {
    "graph-etl/0.1 (page and ads insights harvester)".to_string()
}
fn default_max_attempts() -> u32 {
    5
}
fn default_initial_wait_secs() -> u64 {
    60
}
fn default_output_root() -> PathBuf {
    PathBuf::from("/datalake/raw/graph")
}
fn default_num_months() -> u32 {
    1
}
fn default_concurrency() -> usize {
    10
}
fn default_token_env() -> String {
    "PAGE_ACCESS_TOKEN".to_string()
}
fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}
fn default_page_metrics() -> Vec<String> {
    strings(&["page_views_total", "page_impressions_unique"])
}
fn default_post_metrics() -> Vec<String> {
    strings(&[
        "post_impressions",
        "post_impressions_unique",
        "post_clicks",
        "post_reactions_by_type_total",
    ])
}
fn default_insta_post_metrics() -> Vec<String> {
    strings(&["impressions", "reach", "saved", "likes", "comments", "shares"])
}
fn default_insta_reel_metrics() -> Vec<String> {
    strings(&["plays", "reach", "saved", "likes", "comments", "shares", "total_interactions"])
}
fn default_insta_page_metrics() -> Vec<String> {
    strings(&["impressions", "reach", "follower_count"])
}
fn default_post_fields() -> String {
    "id,message,created_time,attachments{media_type,media,url}".to_string()
}
fn default_media_fields() -> String {
    "id,caption,media_type,media_url,timestamp,permalink".to_string()
}
fn default_campaign_fields() -> String {
    "id,name,objective,status".to_string()
}
fn default_adset_fields() -> String {
    "id,name,campaign_id,targeting,budget,status".to_string()
}
fn default_ad_fields() -> String {
    "id,name,creative{id},campaign_id,adset_id,status".to_string()
}
fn default_creative_fields() -> String {
    "id,name,title,body,object_story_spec,thumbnail_url".to_string()
}
fn default_insights_fields() -> String {
    "spend,clicks,impressions,reach,ctr,cpc".to_string()
}
fn default_listing_limit() -> u32 {
    100
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            version: default_api_version(),
            timeout_secs: default_timeout_secs(),
            user_agent: default_user_agent(),
            max_attempts: default_max_attempts(),
            initial_wait_secs: default_initial_wait_secs(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            output_root: default_output_root(),
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            num_months: default_num_months(),
            interval_mode: IntervalMode::default(),
            concurrency: default_concurrency(),
        }
    }
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            page_id: String::new(),
            page_name: String::new(),
            ads_account: String::new(),
            token_env: default_token_env(),
            page_metrics: default_page_metrics(),
            post_metrics: default_post_metrics(),
            insta_post_metrics: default_insta_post_metrics(),
            insta_reel_metrics: default_insta_reel_metrics(),
            insta_page_metrics: default_insta_page_metrics(),
            post_fields: default_post_fields(),
            media_fields: default_media_fields(),
            campaign_fields: default_campaign_fields(),
            adset_fields: default_adset_fields(),
            ad_fields: default_ad_fields(),
            creative_fields: default_creative_fields(),
            insights_fields: default_insights_fields(),
            listing_limit: default_listing_limit(),
        }
    }
}

impl ApiConfig {
    /// Versioned API root, e.g. `https://graph.facebook.com/v21.0/`
    pub fn api_root(&self) -> String {
        format!("{}/{}/", self.base_url.trim_end_matches('/'), self.version.trim_matches('/'))
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn initial_wait(&self) -> Duration {
        Duration::from_secs(self.initial_wait_secs)
    }
}

impl StorageConfig {
    /// Per-page artifact base: `<output_root>/<page_name>`
    pub fn artifact_base(&self, page_name: &str) -> PathBuf {
        if page_name.is_empty() {
            self.output_root.clone()
        } else {
            self.output_root.join(page_name)
        }
    }
}

// ── Loader ───────────────────────────────────────────────────────────────────

impl AppConfig {
    /// Load configuration from file + environment overrides
    pub fn load() -> Result<Self> {
        dotenv::dotenv().ok();

        let cfg = config::Config::builder()
            .add_source(
                config::File::with_name("config/default")
                    .required(false)
                    .format(config::FileFormat::Toml),
            )
            .add_source(
                config::File::with_name("config/local")
                    .required(false)
                    .format(config::FileFormat::Toml),
            )
            .add_source(
                config::Environment::with_prefix("GRAPH_ETL")
                    .prefix_separator("__")
                    .separator("__"),
            )
            .build()
            .context("Failed to assemble configuration sources")?;

        cfg.try_deserialize()
            .context("Configuration does not match the expected layout")
    }
}
