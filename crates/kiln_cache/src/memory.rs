//! Process-local artifact cache.

use crate::artifact::Artifact;
use crate::cache::{ArtifactCache, CacheError, CacheResult};
use async_trait::async_trait;
use kiln_core::CacheKey;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// In-memory cache; the first writer of a key wins
#[derive(Debug)]
pub struct MemoryCache {
    name: String,
    artifacts: RwLock<HashMap<CacheKey, Arc<Artifact>>>,
}

impl Default for MemoryCache {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryCache {
    /// Create an empty cache
    #[must_use]
    pub fn new() -> Self {
        Self::named("memory")
    }

    /// Create an empty cache with a display name
    #[must_use]
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            artifacts: RwLock::new(HashMap::new()),
        }
    }

    /// Number of stored keys
    pub async fn len(&self) -> usize {
        self.artifacts.read().await.len()
    }

    /// Check if nothing is stored
    pub async fn is_empty(&self) -> bool {
        self.artifacts.read().await.is_empty()
    }
}

#[async_trait]
impl ArtifactCache for MemoryCache {
    fn name(&self) -> &str {
        &self.name
    }

    async fn has(&self, key: &CacheKey) -> CacheResult<bool> {
        Ok(self.artifacts.read().await.contains_key(key))
    }

    async fn retrieve(&self, key: &CacheKey) -> CacheResult<Artifact> {
        self.artifacts
            .read()
            .await
            .get(key)
            .map(|a| Artifact::clone(a))
            .ok_or(CacheError::NotFound { key: *key })
    }

    async fn store(&self, key: &CacheKey, artifact: &Artifact) -> CacheResult<()> {
        let mut artifacts = self.artifacts.write().await;
        if artifacts.contains_key(key) {
            return Err(CacheError::Conflict { key: *key });
        }
        artifacts.insert(*key, Arc::new(artifact.clone()));
        tracing::debug!(cache = %self.name, key = %key.short(), "stored artifact");
        Ok(())
    }
}
