use crate::config::ApiConfig;
use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::debug;
use url::Url;

/// Status and body of one HTTP exchange. Non-2xx statuses are still a
/// response: classifying them is the fetcher's job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub body: String,
}

/// GET transport shared by every fetch, including concurrent workers.
#[async_trait]
pub trait HttpTransport: Send + Sync {
    /// Only network-level failures (connect, timeout, body read) are errors.
    async fn get(&self, url: &Url) -> Result<HttpResponse>;
}

pub struct ReqwestTransport {
    inner: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new(config: &ApiConfig) -> Result<Self> {
        let inner = reqwest::Client::builder()
            .user_agent(&config.user_agent)
            .timeout(config.timeout())
            .gzip(true)
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self { inner })
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn get(&self, url: &Url) -> Result<HttpResponse> {
        debug!(host = url.host_str().unwrap_or_default(), path = url.path(), "GET");

        // reqwest errors embed the URL, and with it the access token
        let resp = self
            .inner
            .get(url.clone())
            .send()
            .await
            .map_err(reqwest::Error::without_url)
            .context("request failed")?;

        let status = resp.status().as_u16();
        let body = resp
            .text()
            .await
            .map_err(reqwest::Error::without_url)
            .context("failed to read response body")?;

        Ok(HttpResponse { status, body })
    }
}
