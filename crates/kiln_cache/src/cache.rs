//! The artifact cache contract.
//!
//! Implementations own their concurrency: concurrent `store` calls for one
//! key are safe, and an artifact is never visible half written.

use crate::artifact::Artifact;
use async_trait::async_trait;
use kiln_core::CacheKey;
use std::path::PathBuf;

/// Cache result type
pub type CacheResult<T> = Result<T, CacheError>;

/// Cache errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CacheError {
    /// No artifact under this key
    #[error("artifact {key} not found")]
    NotFound {
        /// The key
        key: CacheKey,
    },

    /// Another writer already published this key
    #[error("artifact {key} already exists")]
    Conflict {
        /// The key
        key: CacheKey,
    },

    /// Local storage failed
    #[error("cache I/O error at {}: {reason}", path.display())]
    Io {
        /// Offending path
        path: PathBuf,
        /// OS message
        reason: String,
    },

    /// A stored artifact failed verification
    #[error("artifact {key} is corrupt: {reason}")]
    Corrupt {
        /// The key
        key: CacheKey,
        /// What did not verify
        reason: String,
    },

    /// Metadata could not be encoded
    #[error("cannot encode artifact {key}: {reason}")]
    Encoding {
        /// The key
        key: CacheKey,
        /// Encoder message
        reason: String,
    },

    /// A remote could not be reached
    #[error("cache '{remote}' unavailable: {reason}")]
    Unavailable {
        /// Remote name
        remote: String,
        /// Transport message
        reason: String,
    },
}

impl CacheError {
    pub(crate) fn io(path: impl Into<PathBuf>, err: &std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            reason: err.to_string(),
        }
    }

    /// Whether retrying could help
    #[must_use]
    pub fn is_network(&self) -> bool {
        matches!(self, Self::Io { .. } | Self::Unavailable { .. })
    }
}

/// Content-addressed artifact storage
#[async_trait]
pub trait ArtifactCache: Send + Sync {
    /// Name for logs and errors
    fn name(&self) -> &str;

    /// Whether `key` is present
    async fn has(&self, key: &CacheKey) -> CacheResult<bool>;

    /// Fetch the artifact stored under `key`
    ///
    /// Fails with [`CacheError::NotFound`] if absent.
    async fn retrieve(&self, key: &CacheKey) -> CacheResult<Artifact>;

    /// Make `key` available locally, returning whether it exists anywhere
    ///
    /// Caches without remotes only check presence.
    async fn pull(&self, key: &CacheKey) -> CacheResult<bool> {
        self.has(key).await
    }

    /// Publish `artifact` under `key`
    ///
    /// Fails with [`CacheError::Conflict`] if the key is already present.
    async fn store(&self, key: &CacheKey, artifact: &Artifact) -> CacheResult<()>;
}
