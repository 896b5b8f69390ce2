//! JSON artifact store: one file per `(domain, key)` under a base directory.

use serde_json::Value;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("artifact not found: {0}")]
    NotFound(PathBuf),

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("invalid JSON in {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Address of one artifact: `<base>/<domain>/<key>.json`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ArtifactKey {
    pub domain: String,
    pub key: String,
}

impl ArtifactKey {
    pub fn new(domain: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            domain: domain.into(),
            key: key.into(),
        }
    }
}

impl std::fmt::Display for ArtifactKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}.json", self.domain, self.key)
    }
}

#[derive(Debug, Clone)]
pub struct ArtifactStore {
    base: PathBuf,
}

impl ArtifactStore {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    pub fn path_for(&self, key: &ArtifactKey) -> PathBuf {
        self.base.join(&key.domain).join(format!("{}.json", key.key))
    }

    /// Writes `value`, replacing any previous artifact under the same key.
    ///
    /// The document goes to a sibling temp file first and is renamed into
    /// place, so readers never see a half-written artifact.
    pub fn write(&self, key: &ArtifactKey, value: &Value) -> Result<PathBuf, StoreError> {
        let path = self.path_for(key);
        let dir = path.parent().unwrap_or(&self.base);
        std::fs::create_dir_all(dir).map_err(|source| StoreError::Io {
            path: dir.to_path_buf(),
            source,
        })?;

        let body = serde_json::to_vec_pretty(value).map_err(|source| StoreError::Json {
            path: path.clone(),
            source,
        })?;

        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, body).map_err(|source| StoreError::Io {
            path: tmp.clone(),
            source,
        })?;
        std::fs::rename(&tmp, &path).map_err(|source| StoreError::Io {
            path: path.clone(),
            source,
        })?;

        info!(artifact = %key, "Data saved to {}", path.display());
        Ok(path)
    }

    pub fn read(&self, key: &ArtifactKey) -> Result<Value, StoreError> {
        let path = self.path_for(key);
        let raw = match std::fs::read(&path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!(artifact = %key, "artifact absent");
                return Err(StoreError::NotFound(path));
            }
            Err(source) => return Err(StoreError::Io { path, source }),
        };
        serde_json::from_slice(&raw).map_err(|source| StoreError::Json { path, source })
    }
}
