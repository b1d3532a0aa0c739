//! Source fetching.

use async_trait::async_trait;
use kiln_core::FileTree;
use kiln_plan::SourceSpec;
use std::collections::HashMap;
use std::sync::Arc;

/// Source errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FetchError {
    /// No fetcher handles this kind
    #[error("no fetcher for source kind '{0}'")]
    UnknownKind(String),

    /// The source is misconfigured
    #[error("invalid source '{location}': {reason}")]
    InvalidSource {
        /// Source location
        location: String,
        /// What is wrong
        reason: String,
    },

    /// Fetched content does not match the pinned ref
    #[error("source '{location}' does not match ref {expected} (got {actual})")]
    RefMismatch {
        /// Source location
        location: String,
        /// Pinned ref
        expected: String,
        /// What was found
        actual: String,
    },

    /// Transfer or storage failure
    #[error("fetching '{location}' failed: {reason}")]
    Network {
        /// Source location
        location: String,
        /// Transport message
        reason: String,
    },
}

impl FetchError {
    /// Whether retrying could help
    #[must_use]
    pub fn is_network(&self) -> bool {
        matches!(self, Self::Network { .. })
    }
}

/// Resolves and retrieves sources of one or more kinds
#[async_trait]
pub trait SourceFetcher: Send + Sync {
    /// Resolve the source's floating target to a concrete ref
    async fn track(&self, source: &SourceSpec) -> Result<String, FetchError>;

    /// Retrieve the source content at `reference`
    async fn fetch(&self, source: &SourceSpec, reference: &str) -> Result<FileTree, FetchError>;
}

/// Dispatches to a fetcher by source kind
#[derive(Default, Clone)]
pub struct FetcherRegistry {
    fetchers: HashMap<String, Arc<dyn SourceFetcher>>,
}

impl std::fmt::Debug for FetcherRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut kinds: Vec<_> = self.fetchers.keys().collect();
        kinds.sort();
        f.debug_struct("FetcherRegistry").field("kinds", &kinds).finish()
    }
}

impl FetcherRegistry {
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a fetcher for `kind`
    #[must_use]
    pub fn with(mut self, kind: impl Into<String>, fetcher: Arc<dyn SourceFetcher>) -> Self {
        self.fetchers.insert(kind.into(), fetcher);
        self
    }

    fn get(&self, source: &SourceSpec) -> Result<&Arc<dyn SourceFetcher>, FetchError> {
        self.fetchers
            .get(&source.kind)
            .ok_or_else(|| FetchError::UnknownKind(source.kind.clone()))
    }
}

#[async_trait]
impl SourceFetcher for FetcherRegistry {
    async fn track(&self, source: &SourceSpec) -> Result<String, FetchError> {
        self.get(source)?.track(source).await
    }

    async fn fetch(&self, source: &SourceSpec, reference: &str) -> Result<FileTree, FetchError> {
        self.get(source)?.fetch(source, reference).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_core::FileEntry;

    struct Fixed;

    #[async_trait]
    impl SourceFetcher for Fixed {
        async fn track(&self, _source: &SourceSpec) -> Result<String, FetchError> {
            Ok("v1".to_string())
        }

        async fn fetch(&self, _source: &SourceSpec, reference: &str) -> Result<FileTree, FetchError> {
            let mut tree = FileTree::new();
            tree.insert("VERSION", FileEntry::new(reference.to_string()))
                .map_err(|e| FetchError::InvalidSource {
                    location: String::new(),
                    reason: e.to_string(),
                })?;
            Ok(tree)
        }
    }

    #[tokio::test]
    async fn test_dispatch_by_kind() {
        let registry = FetcherRegistry::new().with("fixed", Arc::new(Fixed));
        let source = SourceSpec::new("fixed", "anywhere");
        assert_eq!(registry.track(&source).await.unwrap(), "v1");
        let tree = registry.fetch(&source, "v1").await.unwrap();
        assert_eq!(tree.get("VERSION").unwrap().data.as_ref(), b"v1");

        let other = SourceSpec::new("git", "x");
        assert_eq!(
            registry.track(&other).await.unwrap_err(),
            FetchError::UnknownKind("git".into())
        );
    }

    #[test]
    fn test_network_class() {
        let err = FetchError::Network {
            location: "x".into(),
            reason: "timeout".into(),
        };
        assert!(err.is_network());
        assert!(!FetchError::UnknownKind("x".into()).is_network());
    }
}
