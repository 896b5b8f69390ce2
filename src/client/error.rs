use crate::storage::StoreError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("no access token available")]
    Auth,

    #[error("invalid request URL {url}: {message}")]
    InvalidUrl { url: String, message: String },

    #[error("transport error for {url}: {source}")]
    Transport {
        url: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("rate limit still active after {attempts} attempts on {url}")]
    RateLimitExhausted { url: String, attempts: u32 },

    #[error("API error (status {status}): {body}")]
    RemoteApi { status: u16, body: String },

    #[error("unexpected response body from {url}: {message}")]
    Decode { url: String, message: String },

    #[error(transparent)]
    Store(#[from] StoreError),
}
