//! Built artifacts.

use chrono::{DateTime, Utc};
use kiln_core::{CacheKey, FileTree, Hash};
use kiln_plan::ConfigMap;
use serde::{Deserialize, Serialize};

/// A dependency an artifact was built against
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyRecord {
    /// Dependency identity (`name` or `name:variant`)
    pub element: String,
    /// Its strong key at build time
    pub key: CacheKey,
}

/// Everything about an artifact except its files
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactMeta {
    /// Element name
    pub element: String,
    /// Active variant
    pub variant: Option<String>,
    /// Strong key
    pub strong_key: CacheKey,
    /// Weak key
    pub weak_key: CacheKey,
    /// Build scope keys
    pub dependencies: Vec<DependencyRecord>,
    /// Element public data
    pub public: ConfigMap,
    /// Combined command output
    pub build_log: String,
    /// When the build finished
    pub built_at: DateTime<Utc>,
}

impl ArtifactMeta {
    /// Metadata stamped with the current time
    #[must_use]
    pub fn new(element: impl Into<String>, strong_key: CacheKey, weak_key: CacheKey) -> Self {
        Self {
            element: element.into(),
            variant: None,
            strong_key,
            weak_key,
            dependencies: Vec::new(),
            public: ConfigMap::new(),
            build_log: String::new(),
            built_at: Utc::now(),
        }
    }
}

/// Output of one build
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Artifact {
    /// Metadata
    pub meta: ArtifactMeta,
    /// Output files
    pub files: FileTree,
}

impl Artifact {
    /// Create an artifact
    #[must_use]
    pub fn new(meta: ArtifactMeta, files: FileTree) -> Self {
        Self { meta, files }
    }

    /// Digest of the file tree
    #[must_use]
    pub fn content_digest(&self) -> Hash {
        self.files.digest()
    }

    /// Total size of the files
    #[must_use]
    pub fn size(&self) -> u64 {
        self.files.total_size()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_core::FileEntry;

    #[test]
    fn test_meta_json() {
        let key = CacheKey::digest(b"k");
        let mut meta = ArtifactMeta::new("app", key, key);
        meta.dependencies.push(DependencyRecord {
            element: "lib".to_string(),
            key,
        });
        let json = serde_json::to_string(&meta).unwrap();
        let back: ArtifactMeta = serde_json::from_str(&json).unwrap();
        assert_eq!(back, meta);
    }

    #[test]
    fn test_size_and_digest() {
        let key = CacheKey::digest(b"k");
        let mut files = FileTree::new();
        files.insert("usr/bin/app", FileEntry::executable("12345")).unwrap();
        let one = Artifact::new(ArtifactMeta::new("app", key, key), files.clone());
        let two = Artifact::new(ArtifactMeta::new("other", key, key), files);
        assert_eq!(one.size(), 5);
        assert_eq!(one.content_digest(), two.content_digest());
    }
}
