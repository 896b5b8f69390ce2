use serde::Deserialize;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::path::PathBuf;

// ── Fetch request ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaginationMode {
    /// Follow `paging.next` until the API stops returning one.
    Paged,
    /// First page only.
    Single,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccumulateMode {
    /// Collect the `data` arrays of every page.
    Extend,
    /// Keep the response body as-is.
    Replace,
}

/// One logical collection retrieval against the Graph API.
#[derive(Debug, Clone)]
pub struct FetchRequest {
    pub endpoint: String,
    pub query_params: BTreeMap<String, String>,
    pub pagination: PaginationMode,
    pub accumulate: AccumulateMode,
}

impl FetchRequest {
    /// Paged, extending request. The common case for lists and insights.
    pub fn paged(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            query_params: BTreeMap::new(),
            pagination: PaginationMode::Paged,
            accumulate: AccumulateMode::Extend,
        }
    }

    /// First page only, still collected as records.
    pub fn first_page(endpoint: impl Into<String>) -> Self {
        Self {
            pagination: PaginationMode::Single,
            ..Self::paged(endpoint)
        }
    }

    /// Whole response body kept verbatim.
    pub fn object(endpoint: impl Into<String>) -> Self {
        Self {
            pagination: PaginationMode::Single,
            accumulate: AccumulateMode::Replace,
            ..Self::paged(endpoint)
        }
    }

    pub fn param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query_params.insert(key.into(), value.into());
        self
    }
}

// ── Fetch result ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub enum FetchResult {
    Records(Vec<Value>),
    Single(Value),
}

impl FetchResult {
    /// Nothing worth persisting: no records, or a body that is `null`, `{}` or
    /// carries an empty `data` array.
    pub fn is_empty(&self) -> bool {
        match self {
            FetchResult::Records(records) => records.is_empty(),
            FetchResult::Single(Value::Null) => true,
            FetchResult::Single(Value::Object(map)) => {
                map.is_empty()
                    || matches!(map.get("data"), Some(Value::Array(items)) if items.is_empty())
            }
            FetchResult::Single(_) => false,
        }
    }

    /// JSON document persisted for this result.
    pub fn to_artifact(&self) -> Value {
        match self {
            FetchResult::Records(records) => {
                let mut map = Map::new();
                map.insert("data".to_string(), Value::Array(records.clone()));
                Value::Object(map)
            }
            FetchResult::Single(body) => body.clone(),
        }
    }

    /// Records of this result: the accumulated list, or the `data` array of a
    /// single body.
    pub fn records(&self) -> &[Value] {
        match self {
            FetchResult::Records(records) => records,
            FetchResult::Single(body) => data_array(body),
        }
    }
}

/// What one fetcher invocation left behind.
#[derive(Debug, Clone, PartialEq)]
pub enum FetchOutcome {
    Written { path: PathBuf, result: FetchResult },
    /// The API answered with no data; nothing was written.
    Empty,
}

impl FetchOutcome {
    pub fn result(&self) -> Option<&FetchResult> {
        match self {
            FetchOutcome::Written { result, .. } => Some(result),
            FetchOutcome::Empty => None,
        }
    }

    pub fn is_written(&self) -> bool {
        matches!(self, FetchOutcome::Written { .. })
    }
}

/// `data` array of an artifact or response body; empty when absent.
pub fn data_array(body: &Value) -> &[Value] {
    body.get("data")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or(&[])
}

// ── Wire envelopes ────────────────────────────────────────────────────────────

/// `{"data": [...], "paging": {"next": "..."}}`
#[derive(Debug, Deserialize)]
pub struct PageEnvelope {
    #[serde(default)]
    pub data: Vec<Value>,
    #[serde(default)]
    pub paging: Option<Paging>,
}

#[derive(Debug, Deserialize)]
pub struct Paging {
    #[serde(default)]
    pub next: Option<String>,
}

impl PageEnvelope {
    pub fn next_cursor(&self) -> Option<&str> {
        self.paging
            .as_ref()
            .and_then(|p| p.next.as_deref())
            .filter(|next| !next.is_empty())
    }
}

/// `{"error": {"code": 17, "error_subcode": 2446079, "message": "..."}}`
#[derive(Debug, Deserialize)]
pub struct ErrorEnvelope {
    pub error: GraphErrorBody,
}

#[derive(Debug, Deserialize)]
pub struct GraphErrorBody {
    #[serde(default)]
    pub code: Option<i64>,
    #[serde(default)]
    pub error_subcode: Option<i64>,
    #[serde(default)]
    pub message: Option<String>,
}

// ── Entities ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AdCategory {
    Campaigns,
    Adsets,
    Ads,
}

impl AdCategory {
    pub const ALL: [AdCategory; 3] = [AdCategory::Campaigns, AdCategory::Adsets, AdCategory::Ads];

    /// Listing edge on the ads account, also the listing artifact domain.
    pub fn as_str(&self) -> &'static str {
        match self {
            AdCategory::Campaigns => "campaigns",
            AdCategory::Adsets => "adsets",
            AdCategory::Ads => "ads",
        }
    }

    pub fn listing_key(&self) -> String {
        format!("{}_list", self.as_str())
    }

    pub fn insights_domain(&self) -> String {
        format!("{}_insights", self.as_str())
    }
}

/// One campaign, adset or ad from a listing artifact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdEntity {
    pub category: AdCategory,
    pub id: String,
    pub creative_id: Option<String>,
}

impl AdEntity {
    pub fn from_record(category: AdCategory, record: &Value) -> Option<Self> {
        let id = record_id(record)?;
        let creative_id = record
            .get("creative")
            .and_then(record_id);
        Some(Self {
            category,
            id,
            creative_id,
        })
    }
}

/// One Instagram media item from the media list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaItem {
    pub id: String,
    pub media_type: Option<String>,
}

impl MediaItem {
    pub fn from_record(record: &Value) -> Option<Self> {
        Some(Self {
            id: record_id(record)?,
            media_type: record
                .get("media_type")
                .and_then(Value::as_str)
                .map(str::to_string),
        })
    }

    pub fn is_video(&self) -> bool {
        self.media_type
            .as_deref()
            .is_some_and(|t| t.eq_ignore_ascii_case("VIDEO"))
    }
}

/// `id` of a Graph object; numeric IDs are accepted as well as strings.
pub fn record_id(record: &Value) -> Option<String> {
    match record.get("id")? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// IDs of every record carrying one, in listing order.
pub fn record_ids(records: &[Value]) -> Vec<String> {
    records.iter().filter_map(record_id).collect()
}
