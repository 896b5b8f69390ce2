// Test doubles for the fetch engine.
//
// - MockTransport (HttpTransport) : per-path queue of canned replies
// - RecordingSleeper (Sleeper) : records requested waits, never sleeps
// - StaticCredentials (CredentialProvider) : fixed token
//
// Plus `fetcher_with`, which wires them into a GraphFetcher backed by a
// temp-dir artifact store.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use serde_json::Value;
use tempfile::TempDir;
use url::Url;

use crate::auth::CredentialProvider;
use crate::client::GraphFetcher;
use crate::client::http_client::{HttpResponse, HttpTransport};
use crate::client::retry::{RetryPolicy, Sleeper};
use crate::storage::ArtifactStore;

pub const TEST_API_ROOT: &str = "https://graph.test/v21.0/";
const TEST_PATH_PREFIX: &str = "/v21.0/";

#[derive(Debug, Clone)]
enum Reply {
    Response(HttpResponse),
    Fail(String),
}

// ---------------------------------------------------------------------------
// MockTransport
// ---------------------------------------------------------------------------

/// Replies are keyed by endpoint path (relative to the API root, query
/// ignored) and served in registration order; the last reply for a path
/// repeats forever. Unregistered paths fail like a dead network.
pub struct MockTransport {
    routes: Mutex<HashMap<String, VecDeque<Reply>>>,
    requests: Mutex<Vec<Url>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self {
            routes: Mutex::new(HashMap::new()),
            requests: Mutex::new(Vec::new()),
        }
    }

    fn push(self, path: &str, reply: Reply) -> Self {
        self.routes
            .lock()
            .unwrap()
            .entry(path.trim_start_matches('/').to_string())
            .or_default()
            .push_back(reply);
        self
    }

    pub fn on(self, path: &str, status: u16, body: &str) -> Self {
        self.push(
            path,
            Reply::Response(HttpResponse {
                status,
                body: body.to_string(),
            }),
        )
    }

    pub fn on_json(self, path: &str, body: Value) -> Self {
        self.on(path, 200, &body.to_string())
    }

    pub fn fail(self, path: &str, message: &str) -> Self {
        self.push(path, Reply::Fail(message.to_string()))
    }

    pub fn requested(&self) -> Vec<Url> {
        self.requests.lock().unwrap().clone()
    }

    /// Requests whose endpoint path equals `path`.
    pub fn requested_path(&self, path: &str) -> usize {
        self.requested()
            .iter()
            .filter(|u| relative_path(u) == path)
            .count()
    }
}

fn relative_path(url: &Url) -> &str {
    url.path().strip_prefix(TEST_PATH_PREFIX).unwrap_or(url.path())
}

#[async_trait]
impl HttpTransport for MockTransport {
    async fn get(&self, url: &Url) -> anyhow::Result<HttpResponse> {
        self.requests.lock().unwrap().push(url.clone());

        let reply = {
            let mut routes = self.routes.lock().unwrap();
            let queue = routes
                .get_mut(relative_path(url))
                .ok_or_else(|| anyhow!("MockTransport: no route for {}", url.path()))?;
            if queue.len() > 1 {
                queue.pop_front()
            } else {
                queue.front().cloned()
            }
        };

        match reply {
            Some(Reply::Response(resp)) => Ok(resp),
            Some(Reply::Fail(message)) => {
                let cause = io::Error::new(io::ErrorKind::ConnectionReset, message);
                Err(anyhow::Error::new(cause).context("GET failed"))
            }
            None => Err(anyhow!("MockTransport: empty route for {}", url.path())),
        }
    }
}

// ---------------------------------------------------------------------------
// RecordingSleeper
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct RecordingSleeper {
    waits: Mutex<Vec<Duration>>,
}

impl RecordingSleeper {
    pub fn waits(&self) -> Vec<Duration> {
        self.waits.lock().unwrap().clone()
    }
}

#[async_trait]
impl Sleeper for RecordingSleeper {
    async fn sleep(&self, duration: Duration) {
        self.waits.lock().unwrap().push(duration);
    }
}

// ---------------------------------------------------------------------------
// StaticCredentials
// ---------------------------------------------------------------------------

pub struct StaticCredentials(String);

impl StaticCredentials {
    pub fn new(token: &str) -> Self {
        Self(token.to_string())
    }
}

impl CredentialProvider for StaticCredentials {
    fn access_token(&self) -> String {
        self.0.clone()
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Fetcher over `transport` with token `tok`, a 1s/5-attempt retry policy
/// and a fresh temp-dir store.
pub fn fetcher_with(
    transport: MockTransport,
) -> (GraphFetcher, Arc<MockTransport>, Arc<RecordingSleeper>, TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let transport = Arc::new(transport);
    let sleeper = Arc::new(RecordingSleeper::default());

    let fetcher = GraphFetcher::new(
        Url::parse(TEST_API_ROOT).unwrap(),
        transport.clone(),
        Arc::new(StaticCredentials::new("tok")),
        ArtifactStore::new(dir.path()),
    )
    .with_retry(RetryPolicy::new(5, Duration::from_secs(1)), sleeper.clone());

    (fetcher, transport, sleeper, dir)
}
