//! A local cache in front of pull and push remotes.

use crate::artifact::Artifact;
use crate::cache::{ArtifactCache, CacheError, CacheResult};
use async_trait::async_trait;
use kiln_core::CacheKey;
use std::sync::Arc;

/// Local cache plus ordered remotes
///
/// Lookups try the local cache, then each pull remote in order. `has` only
/// asks; `retrieve` and `pull` copy a remote hit into the local cache.
/// Stores go to the local cache and every push remote.
pub struct TieredCache {
    local: Arc<dyn ArtifactCache>,
    pull: Vec<Arc<dyn ArtifactCache>>,
    push: Vec<Arc<dyn ArtifactCache>>,
}

impl std::fmt::Debug for TieredCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TieredCache")
            .field("local", &self.local.name())
            .field("pull", &self.pull.iter().map(|c| c.name()).collect::<Vec<_>>())
            .field("push", &self.push.iter().map(|c| c.name()).collect::<Vec<_>>())
            .finish()
    }
}

impl TieredCache {
    /// Wrap a local cache with no remotes
    #[must_use]
    pub fn new(local: Arc<dyn ArtifactCache>) -> Self {
        Self {
            local,
            pull: Vec::new(),
            push: Vec::new(),
        }
    }

    /// Add a pull remote
    #[must_use]
    pub fn with_pull(mut self, remote: Arc<dyn ArtifactCache>) -> Self {
        self.pull.push(remote);
        self
    }

    /// Add a push remote
    #[must_use]
    pub fn with_push(mut self, remote: Arc<dyn ArtifactCache>) -> Self {
        self.push.push(remote);
        self
    }

    /// The local tier
    #[must_use]
    pub fn local(&self) -> &Arc<dyn ArtifactCache> {
        &self.local
    }
}

#[async_trait]
impl ArtifactCache for TieredCache {
    fn name(&self) -> &str {
        self.local.name()
    }

    async fn has(&self, key: &CacheKey) -> CacheResult<bool> {
        if self.local.has(key).await? {
            return Ok(true);
        }
        for remote in &self.pull {
            if remote.has(key).await? {
                tracing::debug!(remote = remote.name(), key = %key.short(), "remote hit");
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn retrieve(&self, key: &CacheKey) -> CacheResult<Artifact> {
        match self.local.retrieve(key).await {
            Err(CacheError::NotFound { .. }) => {}
            other => return other,
        }
        for remote in &self.pull {
            match remote.retrieve(key).await {
                Ok(artifact) => {
                    match self.local.store(key, &artifact).await {
                        Ok(()) | Err(CacheError::Conflict { .. }) => {}
                        Err(err) => return Err(err),
                    }
                    tracing::info!(remote = remote.name(), key = %key.short(), "pulled artifact");
                    return Ok(artifact);
                }
                Err(CacheError::NotFound { .. }) => continue,
                Err(err) => return Err(err),
            }
        }
        Err(CacheError::NotFound { key: *key })
    }

    async fn pull(&self, key: &CacheKey) -> CacheResult<bool> {
        if self.local.has(key).await? {
            return Ok(true);
        }
        match self.retrieve(key).await {
            Ok(_) => Ok(true),
            Err(CacheError::NotFound { .. }) => Ok(false),
            Err(err) => Err(err),
        }
    }

    async fn store(&self, key: &CacheKey, artifact: &Artifact) -> CacheResult<()> {
        let mut stored = match self.local.store(key, artifact).await {
            Ok(()) => true,
            Err(CacheError::Conflict { .. }) => false,
            Err(err) => return Err(err),
        };
        for remote in &self.push {
            match remote.store(key, artifact).await {
                Ok(()) => {
                    tracing::info!(remote = remote.name(), key = %key.short(), "pushed artifact");
                    stored = true;
                }
                Err(CacheError::Conflict { .. }) => {}
                Err(err) => return Err(err),
            }
        }
        if stored {
            Ok(())
        } else {
            Err(CacheError::Conflict { key: *key })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::ArtifactMeta;
    use crate::memory::MemoryCache;
    use kiln_core::FileTree;

    struct Offline;

    #[async_trait]
    impl ArtifactCache for Offline {
        fn name(&self) -> &str {
            "offline"
        }

        async fn has(&self, _key: &CacheKey) -> CacheResult<bool> {
            Err(self.down())
        }

        async fn retrieve(&self, _key: &CacheKey) -> CacheResult<Artifact> {
            Err(self.down())
        }

        async fn store(&self, _key: &CacheKey, _artifact: &Artifact) -> CacheResult<()> {
            Err(self.down())
        }
    }

    impl Offline {
        fn down(&self) -> CacheError {
            CacheError::Unavailable {
                remote: "offline".into(),
                reason: "connection refused".into(),
            }
        }
    }

    fn artifact() -> Artifact {
        let key = CacheKey::digest(b"a");
        Artifact::new(ArtifactMeta::new("a", key, key), FileTree::new())
    }

    #[tokio::test]
    async fn test_remote_hit_is_pulled_locally() {
        let local = Arc::new(MemoryCache::named("local"));
        let remote = Arc::new(MemoryCache::named("remote"));
        let key = CacheKey::digest(b"a");
        remote.store(&key, &artifact()).await.unwrap();

        let tiered = TieredCache::new(local.clone()).with_pull(remote);
        assert!(tiered.has(&key).await.unwrap());
        assert!(!local.has(&key).await.unwrap());
        assert_eq!(tiered.retrieve(&key).await.unwrap(), artifact());
        assert!(local.has(&key).await.unwrap());
    }

    #[tokio::test]
    async fn test_pull_copies_remote_hit() {
        let local = Arc::new(MemoryCache::named("local"));
        let remote = Arc::new(MemoryCache::named("remote"));
        let key = CacheKey::digest(b"a");
        remote.store(&key, &artifact()).await.unwrap();

        let tiered = TieredCache::new(local.clone()).with_pull(remote);
        assert!(tiered.pull(&key).await.unwrap());
        assert_eq!(local.retrieve(&key).await.unwrap(), artifact());
        assert!(tiered.pull(&key).await.unwrap());
        assert!(!tiered.pull(&CacheKey::digest(b"absent")).await.unwrap());
    }

    #[tokio::test]
    async fn test_pull_through_offline_remote_fails() {
        let tiered = TieredCache::new(Arc::new(MemoryCache::named("local"))).with_pull(Arc::new(Offline));
        let err = tiered.pull(&CacheKey::digest(b"a")).await.unwrap_err();
        assert!(err.is_network());
    }

    #[tokio::test]
    async fn test_store_pushes_to_remotes() {
        let local = Arc::new(MemoryCache::named("local"));
        let remote = Arc::new(MemoryCache::named("remote"));
        let key = CacheKey::digest(b"a");
        let tiered = TieredCache::new(local.clone()).with_push(remote.clone());

        tiered.store(&key, &artifact()).await.unwrap();
        assert!(local.has(&key).await.unwrap());
        assert!(remote.has(&key).await.unwrap());
        assert_eq!(
            tiered.store(&key, &artifact()).await.unwrap_err(),
            CacheError::Conflict { key }
        );
    }

    #[tokio::test]
    async fn test_remote_failure_is_network_class() {
        let local = Arc::new(MemoryCache::named("local"));
        let key = CacheKey::digest(b"a");
        let tiered = TieredCache::new(local).with_pull(Arc::new(Offline));
        let err = tiered.has(&key).await.unwrap_err();
        assert!(err.is_network());
    }
}
