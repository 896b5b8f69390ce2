pub mod error;
pub mod http_client;
pub mod retry;

use crate::auth::CredentialProvider;
use crate::config::AppConfig;
use crate::models::{
    AccumulateMode, ErrorEnvelope, FetchOutcome, FetchRequest, FetchResult, GraphErrorBody,
    PageEnvelope, PaginationMode,
};
use crate::storage::{ArtifactKey, ArtifactStore};
use anyhow::Context;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info, warn};
use url::Url;

pub use self::error::FetchError;
use self::http_client::{HttpResponse, HttpTransport, ReqwestTransport};
use self::retry::{RetryPolicy, Sleeper, TokioSleeper};

/// Graph API error code for application-level throttling.
const RATE_LIMIT_CODE: i64 = 17;
/// Ad-account throttling subcode.
const RATE_LIMIT_SUBCODE: i64 = 2446079;

/// Executes one collection retrieval against the Graph API and persists it
/// as an artifact.
///
/// Cheap to share behind an `Arc`: workers hold the transport and the
/// credential provider read-only, and each `fetch` keeps its own retry state.
pub struct GraphFetcher {
    api_root: Url,
    transport: Arc<dyn HttpTransport>,
    credentials: Arc<dyn CredentialProvider>,
    policy: RetryPolicy,
    sleeper: Arc<dyn Sleeper>,
    store: ArtifactStore,
}

impl GraphFetcher {
    pub fn new(
        api_root: Url,
        transport: Arc<dyn HttpTransport>,
        credentials: Arc<dyn CredentialProvider>,
        store: ArtifactStore,
    ) -> Self {
        Self {
            api_root,
            transport,
            credentials,
            policy: RetryPolicy::new(5, std::time::Duration::from_secs(60)),
            sleeper: Arc::new(TokioSleeper),
            store,
        }
    }

    /// Production fetcher: reqwest transport, configured retry policy, artifact
    /// base `<output_root>/<page_name>`.
    pub fn from_config(
        config: &AppConfig,
        credentials: Arc<dyn CredentialProvider>,
    ) -> anyhow::Result<Self> {
        let root = config.api.api_root();
        let api_root =
            Url::parse(&root).with_context(|| format!("Invalid API base URL {root}"))?;
        let transport = ReqwestTransport::new(&config.api)?;
        let store = ArtifactStore::new(config.storage.artifact_base(&config.graph.page_name));

        Ok(Self::new(api_root, Arc::new(transport), credentials, store).with_retry(
            RetryPolicy::new(config.api.max_attempts, config.api.initial_wait()),
            Arc::new(TokioSleeper),
        ))
    }

    pub fn with_retry(mut self, policy: RetryPolicy, sleeper: Arc<dyn Sleeper>) -> Self {
        self.policy = policy;
        self.sleeper = sleeper;
        self
    }

    pub fn store(&self) -> &ArtifactStore {
        &self.store
    }

    /// Runs `request` to completion and writes the accumulated result under `key`.
    ///
    /// Nothing is written when the API returns no data. Rate-limit responses
    /// are retried with backoff on the same URL; any other failure ends the
    /// call.
    pub async fn fetch(
        &self,
        request: &FetchRequest,
        key: &ArtifactKey,
    ) -> Result<FetchOutcome, FetchError> {
        let token = self.credentials.access_token();
        if token.is_empty() {
            return Err(FetchError::Auth);
        }

        let mut next = Some(self.request_url(request, &token)?);
        let mut records: Vec<Value> = Vec::new();
        let mut single: Option<Value> = None;
        let mut rate_limited = 0u32;
        let mut pages = 0usize;

        while let Some(url) = next.take() {
            let shown = redact(&url);
            let resp = self
                .transport
                .get(&url)
                .await
                .map_err(|e| FetchError::Transport {
                    url: shown.clone(),
                    source: e.into(),
                })?;

            if resp.status == 200 {
                pages += 1;
                match request.accumulate {
                    AccumulateMode::Replace => {
                        single = Some(decode(&resp, &shown)?);
                    }
                    AccumulateMode::Extend => {
                        let page: PageEnvelope = decode(&resp, &shown)?;
                        debug!(url = %shown, page = pages, records = page.data.len(), "page received");
                        let cursor = match request.pagination {
                            PaginationMode::Paged => page.next_cursor().map(str::to_string),
                            PaginationMode::Single => None,
                        };
                        records.extend(page.data);

                        if let Some(cursor) = cursor {
                            next = Some(Url::parse(&cursor).map_err(|e| FetchError::InvalidUrl {
                                url: cursor.clone(),
                                message: e.to_string(),
                            })?);
                        }
                    }
                }
                continue;
            }

            if let Some(throttle) = rate_limit_error(resp.status, &resp.body) {
                rate_limited += 1;
                if !self.policy.allows_retry(rate_limited) {
                    return Err(FetchError::RateLimitExhausted {
                        url: shown,
                        attempts: rate_limited,
                    });
                }
                let wait = self.policy.delay_for(rate_limited);
                warn!(
                    url = %shown,
                    attempt = rate_limited,
                    max_attempts = self.policy.max_attempts,
                    "Rate limited ({}), retrying in {:?}",
                    throttle.message.as_deref().unwrap_or("no message"),
                    wait
                );
                self.sleeper.sleep(wait).await;
                next = Some(url);
                continue;
            }

            return Err(FetchError::RemoteApi {
                status: resp.status,
                body: resp.body,
            });
        }

        let result = match single {
            Some(body) => FetchResult::Single(body),
            None => FetchResult::Records(records),
        };

        if result.is_empty() {
            info!(endpoint = %request.endpoint, artifact = %key, "No data returned, skipping write");
            return Ok(FetchOutcome::Empty);
        }

        let path = self.store.write(key, &result.to_artifact())?;
        Ok(FetchOutcome::Written { path, result })
    }

    fn request_url(&self, request: &FetchRequest, token: &str) -> Result<Url, FetchError> {
        let endpoint = request.endpoint.trim_start_matches('/');
        let mut url = self
            .api_root
            .join(endpoint)
            .map_err(|e| FetchError::InvalidUrl {
                url: format!("{}{}", self.api_root, endpoint),
                message: e.to_string(),
            })?;

        url.query_pairs_mut()
            .extend_pairs(request.query_params.iter())
            .append_pair("access_token", token);
        Ok(url)
    }
}

fn decode<T: serde::de::DeserializeOwned>(resp: &HttpResponse, url: &str) -> Result<T, FetchError> {
    serde_json::from_str(&resp.body).map_err(|e| FetchError::Decode {
        url: url.to_string(),
        message: e.to_string(),
    })
}

/// Throttling is signalled inside a 4xx body, either by code or by subcode.
fn rate_limit_error(status: u16, body: &str) -> Option<GraphErrorBody> {
    if !(400..500).contains(&status) {
        return None;
    }
    let env: ErrorEnvelope = serde_json::from_str(body).ok()?;
    (env.error.code == Some(RATE_LIMIT_CODE) || env.error.error_subcode == Some(RATE_LIMIT_SUBCODE))
        .then_some(env.error)
}

/// URL for logs and errors, without the access token.
fn redact(url: &Url) -> String {
    let mut shown = url.clone();
    let kept: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(k, _)| k != "access_token")
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();

    if kept.is_empty() {
        shown.set_query(None);
    } else {
        shown.query_pairs_mut().clear().extend_pairs(kept);
    }
    shown.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MockTransport, fetcher_with};
    use serde_json::json;
    use std::time::Duration;
    use tokio_test::{assert_err, assert_ok};

    const RATE_LIMIT_BODY: &str =
        r#"{"error":{"message":"User request limit reached","type":"OAuthException","code":17}}"#;

    #[tokio::test]
    async fn test_follows_cursor_across_three_pages() {
        let transport = MockTransport::new()
            .on_json(
                "page/posts",
                json!({"data": [{"id": "1"}, {"id": "2"}],
                       "paging": {"next": "https://graph.test/v21.0/page/posts?after=c2&access_token=tok"}}),
            )
            .on_json(
                "page/posts",
                json!({"data": [{"id": "3"}],
                       "paging": {"next": "https://graph.test/v21.0/page/posts?after=c3&access_token=tok"}}),
            )
            .on_json("page/posts", json!({"data": [{"id": "4"}, {"id": "5"}], "paging": {}}));
        let (fetcher, transport, _sleeper, dir) = fetcher_with(transport);

        let request = FetchRequest::paged("page/posts").param("since", "2024-01-31");
        let key = ArtifactKey::new("facebook_posts", "2024-02-01_2024-02-29");
        let outcome = assert_ok!(fetcher.fetch(&request, &key).await);

        assert_eq!(outcome.result().unwrap().records().len(), 5);
        let urls = transport.requested();
        assert_eq!(urls.len(), 3);
        assert_eq!(urls[0].query(), Some("since=2024-01-31&access_token=tok"));
        assert_eq!(
            urls[1].as_str(),
            "https://graph.test/v21.0/page/posts?after=c2&access_token=tok"
        );
        assert_eq!(
            urls[2].as_str(),
            "https://graph.test/v21.0/page/posts?after=c3&access_token=tok"
        );

        let written: Value = serde_json::from_slice(
            &std::fs::read(dir.path().join("facebook_posts/2024-02-01_2024-02-29.json")).unwrap(),
        )
        .unwrap();
        assert_eq!(written["data"].as_array().unwrap().len(), 5);
    }

    #[tokio::test]
    async fn test_rate_limit_backs_off_then_succeeds() {
        let transport = MockTransport::new()
            .on("act_1/ads", 400, RATE_LIMIT_BODY)
            .on("act_1/ads", 400, RATE_LIMIT_BODY)
            .on_json("act_1/ads", json!({"data": [{"id": "a1"}]}));
        let (fetcher, transport, sleeper, _dir) = fetcher_with(transport);
        let fetcher = fetcher.with_retry(RetryPolicy::new(5, Duration::from_secs(1)), sleeper.clone());

        let outcome = assert_ok!(
            fetcher
                .fetch(&FetchRequest::first_page("act_1/ads"), &ArtifactKey::new("ads", "ads_list"))
                .await
        );

        assert!(outcome.is_written());
        assert_eq!(transport.requested().len(), 3);
        assert_eq!(sleeper.waits(), vec![Duration::from_secs(1), Duration::from_secs(2)]);
        // every retry re-issues the same URL
        let urls = transport.requested();
        assert!(urls.iter().all(|u| u == &urls[0]));
    }

    #[tokio::test]
    async fn test_rate_limited_cursor_page_is_retried_in_place() {
        let next = "https://graph.test/v21.0/page/p2?after=c2";
        let transport = MockTransport::new()
            .on_json("page/posts", json!({"data": [{"id": "1"}], "paging": {"next": next}}))
            .on("page/p2", 400, RATE_LIMIT_BODY)
            .on_json("page/p2", json!({"data": [{"id": "2"}]}));
        let (fetcher, transport, sleeper, _dir) = fetcher_with(transport);

        let outcome = assert_ok!(
            fetcher
                .fetch(&FetchRequest::paged("page/posts"), &ArtifactKey::new("facebook_posts", "k"))
                .await
        );

        assert_eq!(outcome.result().unwrap().records().len(), 2);
        let urls: Vec<String> = transport.requested().iter().map(Url::to_string).collect();
        assert_eq!(
            urls,
            vec!["https://graph.test/v21.0/page/posts?access_token=tok", next, next]
        );
        assert_eq!(sleeper.waits(), vec![Duration::from_secs(1)]);
    }

    #[tokio::test]
    async fn test_backoff_restarts_for_each_fetch() {
        let transport = MockTransport::new()
            .on("act_1/ads", 400, RATE_LIMIT_BODY)
            .on_json("act_1/ads", json!({"data": [{"id": "a1"}]}))
            .on("act_1/adsets", 400, RATE_LIMIT_BODY)
            .on_json("act_1/adsets", json!({"data": [{"id": "s1"}]}));
        let (fetcher, _transport, sleeper, _dir) = fetcher_with(transport);

        for (endpoint, domain) in [("act_1/ads", "ads"), ("act_1/adsets", "adsets")] {
            assert_ok!(
                fetcher
                    .fetch(&FetchRequest::first_page(endpoint), &ArtifactKey::new(domain, "list"))
                    .await
            );
        }

        assert_eq!(
            sleeper.waits(),
            vec![Duration::from_secs(1), Duration::from_secs(1)]
        );
    }

    #[tokio::test]
    async fn test_rate_limit_subcode_is_retried() {
        let body = r#"{"error":{"code":80004,"error_subcode":2446079}}"#;
        let transport = MockTransport::new()
            .on("act_1/insights", 400, body)
            .on_json("act_1/insights", json!({"data": [{"spend": "1.0"}]}));
        let (fetcher, transport, _sleeper, _dir) = fetcher_with(transport);

        assert_ok!(
            fetcher
                .fetch(&FetchRequest::first_page("act_1/insights"), &ArtifactKey::new("x", "y"))
                .await
        );
        assert_eq!(transport.requested().len(), 2);
    }

    #[tokio::test]
    async fn test_rate_limit_exhaustion() {
        let transport = MockTransport::new().on("page/insights", 400, RATE_LIMIT_BODY);
        let (fetcher, transport, sleeper, dir) = fetcher_with(transport);
        let fetcher = fetcher.with_retry(RetryPolicy::new(3, Duration::from_secs(1)), sleeper.clone());

        let err = assert_err!(
            fetcher
                .fetch(&FetchRequest::paged("page/insights"), &ArtifactKey::new("m", "k"))
                .await
        );

        assert!(matches!(err, FetchError::RateLimitExhausted { attempts: 3, .. }));
        assert_eq!(transport.requested().len(), 3);
        assert_eq!(sleeper.waits(), vec![Duration::from_secs(1), Duration::from_secs(2)]);
        assert!(!dir.path().join("m/k.json").exists());
    }

    #[tokio::test]
    async fn test_other_client_error_is_not_retried() {
        let body = r#"{"error":{"message":"Invalid OAuth access token","code":190}}"#;
        let transport = MockTransport::new().on("page/insights", 400, body);
        let (fetcher, transport, sleeper, _dir) = fetcher_with(transport);

        let err = assert_err!(
            fetcher
                .fetch(&FetchRequest::paged("page/insights"), &ArtifactKey::new("m", "k"))
                .await
        );

        match err {
            FetchError::RemoteApi { status, body } => {
                assert_eq!(status, 400);
                assert!(body.contains("190"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(transport.requested().len(), 1);
        assert!(sleeper.waits().is_empty());
    }

    #[tokio::test]
    async fn test_server_error_is_terminal() {
        let transport = MockTransport::new().on("page/insights", 500, "oops");
        let (fetcher, _transport, _sleeper, _dir) = fetcher_with(transport);
        let err = assert_err!(
            fetcher
                .fetch(&FetchRequest::paged("page/insights"), &ArtifactKey::new("m", "k"))
                .await
        );
        assert!(matches!(err, FetchError::RemoteApi { status: 500, .. }));
    }

    #[tokio::test]
    async fn test_transport_failure_is_not_retried() {
        let transport = MockTransport::new().fail("page/insights", "connection reset");
        let (fetcher, transport, _sleeper, _dir) = fetcher_with(transport);
        let err = assert_err!(
            fetcher
                .fetch(&FetchRequest::paged("page/insights"), &ArtifactKey::new("m", "k"))
                .await
        );
        match &err {
            FetchError::Transport { url, .. } => assert!(!url.contains("access_token")),
            other => panic!("unexpected error: {other:?}"),
        }
        // the transport's cause chain survives into the fetch error
        let chain: Vec<String> =
            std::iter::successors(Some(&err as &dyn std::error::Error), |e| e.source())
                .map(|e| e.to_string())
                .collect();
        assert_eq!(chain.last().map(String::as_str), Some("connection reset"));
        assert!(chain.iter().any(|m| m == "GET failed"));
        assert_eq!(transport.requested().len(), 1);
    }

    #[tokio::test]
    async fn test_empty_data_writes_nothing() {
        let transport = MockTransport::new().on_json("page/posts", json!({"data": []}));
        let (fetcher, _transport, _sleeper, dir) = fetcher_with(transport);

        let outcome = assert_ok!(
            fetcher
                .fetch(&FetchRequest::paged("page/posts"), &ArtifactKey::new("facebook_posts", "k"))
                .await
        );
        assert_eq!(outcome, FetchOutcome::Empty);
        assert!(!dir.path().join("facebook_posts").exists());
    }

    #[tokio::test]
    async fn test_replace_writes_body_verbatim() {
        let body = json!({"instagram_business_account": {"id": "1784"}, "id": "page"});
        let transport = MockTransport::new().on_json("page", body.clone());
        let (fetcher, transport, _sleeper, dir) = fetcher_with(transport);

        let request = FetchRequest::object("page").param("fields", "instagram_business_account");
        let key = ArtifactKey::new("instagram_business_account", "instagram_business_account");
        assert_ok!(fetcher.fetch(&request, &key).await);

        let written: Value = serde_json::from_slice(
            &std::fs::read(dir.path().join("instagram_business_account/instagram_business_account.json"))
                .unwrap(),
        )
        .unwrap();
        assert_eq!(written, body);
        assert_eq!(transport.requested().len(), 1);
    }

    #[tokio::test]
    async fn test_single_page_mode_ignores_cursor() {
        let transport = MockTransport::new().on_json(
            "act_1/campaigns",
            json!({"data": [{"id": "c1"}], "paging": {"next": "https://graph.test/v21.0/act_1/campaigns?after=x"}}),
        );
        let (fetcher, transport, _sleeper, _dir) = fetcher_with(transport);
        assert_ok!(
            fetcher
                .fetch(&FetchRequest::first_page("act_1/campaigns"), &ArtifactKey::new("campaigns", "l"))
                .await
        );
        assert_eq!(transport.requested().len(), 1);
    }

    #[tokio::test]
    async fn test_missing_token_issues_no_request() {
        let dir = tempfile::tempdir().unwrap();
        let transport = Arc::new(MockTransport::new());
        let fetcher = GraphFetcher::new(
            Url::parse("https://graph.test/v21.0/").unwrap(),
            transport.clone(),
            Arc::new(crate::testing::StaticCredentials::new("")),
            ArtifactStore::new(dir.path()),
        );

        let err = assert_err!(
            fetcher
                .fetch(&FetchRequest::paged("page/posts"), &ArtifactKey::new("a", "b"))
                .await
        );
        assert!(matches!(err, FetchError::Auth));
        assert!(transport.requested().is_empty());
    }

    #[tokio::test]
    async fn test_malformed_body_is_decode_error() {
        let transport = MockTransport::new().on("page/posts", 200, "<html>");
        let (fetcher, _transport, _sleeper, _dir) = fetcher_with(transport);
        let err = assert_err!(
            fetcher
                .fetch(&FetchRequest::paged("page/posts"), &ArtifactKey::new("a", "b"))
                .await
        );
        assert!(matches!(err, FetchError::Decode { .. }));
    }

    #[test]
    fn test_rate_limit_classification() {
        assert!(rate_limit_error(400, RATE_LIMIT_BODY).is_some());
        assert!(rate_limit_error(403, r#"{"error":{"code":4,"error_subcode":2446079}}"#).is_some());
        assert!(rate_limit_error(500, RATE_LIMIT_BODY).is_none());
        assert!(rate_limit_error(400, r#"{"error":{"code":100}}"#).is_none());
        assert!(rate_limit_error(429, "Too Many Requests").is_none());
    }

    #[test]
    fn test_redact_drops_token() {
        let url = Url::parse("https://graph.test/v21.0/p?metric=a&access_token=secret").unwrap();
        assert_eq!(redact(&url), "https://graph.test/v21.0/p?metric=a");
        let url = Url::parse("https://graph.test/v21.0/p?access_token=secret").unwrap();
        assert_eq!(redact(&url), "https://graph.test/v21.0/p");
    }
}
