//! The `local` source kind: a directory inside the project.
//!
//! The ref of a local source is the hex digest of its file tree, so
//! tracking pins the exact content and fetching verifies it.

use crate::fs_tree::read_tree;
use async_trait::async_trait;
use kiln_core::FileTree;
use kiln_plan::SourceSpec;
use kiln_runtime::{FetchError, SourceFetcher};
use std::path::{Component, Path, PathBuf};

/// Source kind name
pub const LOCAL_KIND: &str = "local";

/// Fetches directories relative to the project root
#[derive(Debug, Clone)]
pub struct LocalSourceFetcher {
    root: PathBuf,
}

impl LocalSourceFetcher {
    /// Fetcher for sources under `project_root`
    #[must_use]
    pub fn new(project_root: impl Into<PathBuf>) -> Self {
        Self {
            root: project_root.into(),
        }
    }

    fn resolve(&self, source: &SourceSpec) -> Result<PathBuf, FetchError> {
        let location = Path::new(&source.location);
        let escapes = location
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
        if escapes {
            return Err(FetchError::InvalidSource {
                location: source.location.clone(),
                reason: "must be a relative path inside the project".to_string(),
            });
        }
        Ok(self.root.join(location))
    }

    async fn read(&self, source: &SourceSpec) -> Result<FileTree, FetchError> {
        let dir = self.resolve(source)?;
        let location = source.location.clone();
        let invalid = move |reason: String| FetchError::InvalidSource {
            location: location.clone(),
            reason,
        };
        if !tokio::fs::metadata(&dir).await.is_ok_and(|m| m.is_dir()) {
            return Err(invalid("not a directory".to_string()));
        }
        tokio::task::spawn_blocking(move || read_tree(&dir))
            .await
            .map_err(|e| invalid(e.to_string()))?
            .map_err(|e| invalid(e.to_string()))
    }
}

#[async_trait]
impl SourceFetcher for LocalSourceFetcher {
    async fn track(&self, source: &SourceSpec) -> Result<String, FetchError> {
        let tree = self.read(source).await?;
        Ok(tree.digest().to_hex())
    }

    async fn fetch(&self, source: &SourceSpec, reference: &str) -> Result<FileTree, FetchError> {
        let tree = self.read(source).await?;
        let actual = tree.digest().to_hex();
        if actual != reference {
            return Err(FetchError::RefMismatch {
                location: source.location.clone(),
                expected: reference.to_string(),
                actual,
            });
        }
        Ok(tree)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn project() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("src/hello")).unwrap();
        std::fs::write(dir.path().join("src/hello/main.c"), "int main() {}\n").unwrap();
        dir
    }

    #[tokio::test]
    async fn test_track_then_fetch() {
        let dir = project();
        let fetcher = LocalSourceFetcher::new(dir.path());
        let source = SourceSpec::new(LOCAL_KIND, "src/hello");

        let reference = fetcher.track(&source).await.unwrap();
        let tree = fetcher.fetch(&source, &reference).await.unwrap();
        assert!(tree.get("main.c").is_some());
    }

    #[tokio::test]
    async fn test_changed_content_mismatches() {
        let dir = project();
        let fetcher = LocalSourceFetcher::new(dir.path());
        let source = SourceSpec::new(LOCAL_KIND, "src/hello");
        let reference = fetcher.track(&source).await.unwrap();

        std::fs::write(dir.path().join("src/hello/main.c"), "int main() { return 1; }\n").unwrap();
        let err = fetcher.fetch(&source, &reference).await.unwrap_err();
        assert!(matches!(err, FetchError::RefMismatch { .. }));
    }

    #[tokio::test]
    async fn test_rejects_paths_outside_project() {
        let dir = project();
        let fetcher = LocalSourceFetcher::new(dir.path());
        for location in ["../elsewhere", "/etc"] {
            let err = fetcher
                .track(&SourceSpec::new(LOCAL_KIND, location))
                .await
                .unwrap_err();
            assert!(matches!(err, FetchError::InvalidSource { .. }), "{location}");
        }
    }

    #[tokio::test]
    async fn test_missing_directory() {
        let dir = project();
        let fetcher = LocalSourceFetcher::new(dir.path());
        let err = fetcher
            .track(&SourceSpec::new(LOCAL_KIND, "src/absent"))
            .await
            .unwrap_err();
        assert!(!err.is_network());
    }
}
