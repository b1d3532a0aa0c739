//! On-disk artifact cache.
//!
//! Layout under the cache root:
//!
//! ```text
//! artifacts/<key>/meta.json
//! artifacts/<key>/manifest.json
//! artifacts/<key>/files/...
//! tmp/<uuid>/
//! ```
//!
//! An artifact is assembled under `tmp/` and published with one `rename`,
//! so `artifacts/<key>` existing means the artifact is complete.

use crate::artifact::{Artifact, ArtifactMeta};
use crate::cache::{ArtifactCache, CacheError, CacheResult};
use async_trait::async_trait;
use bytes::Bytes;
use kiln_core::tree::normalize_path;
use kiln_core::{CacheKey, FileEntry, FileTree, Hash};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;
use uuid::Uuid;

const ARTIFACTS_DIR: &str = "artifacts";
const TMP_DIR: &str = "tmp";
const META_FILE: &str = "meta.json";
const MANIFEST_FILE: &str = "manifest.json";
const FILES_DIR: &str = "files";

#[derive(Debug, Serialize, Deserialize)]
struct ManifestEntry {
    path: String,
    executable: bool,
    size: u64,
    digest: String,
}

/// Directory backed cache
#[derive(Debug, Clone)]
pub struct LocalCache {
    name: String,
    root: PathBuf,
}

impl LocalCache {
    /// Open (creating if needed) a cache rooted at `root`
    ///
    /// # Errors
    ///
    /// Returns error if the directories cannot be created
    pub fn open(root: impl Into<PathBuf>) -> CacheResult<Self> {
        let root = root.into();
        for dir in [ARTIFACTS_DIR, TMP_DIR] {
            let path = root.join(dir);
            std::fs::create_dir_all(&path).map_err(|e| CacheError::io(&path, &e))?;
        }
        Ok(Self {
            name: root.display().to_string(),
            root,
        })
    }

    /// Override the display name
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Cache root
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn artifact_dir(&self, key: &CacheKey) -> PathBuf {
        self.root.join(ARTIFACTS_DIR).join(key.to_hex())
    }

    async fn exists(path: &Path) -> CacheResult<bool> {
        fs::try_exists(path).await.map_err(|e| CacheError::io(path, &e))
    }

    async fn write_staging(&self, staging: &Path, key: &CacheKey, artifact: &Artifact) -> CacheResult<()> {
        let files_dir = staging.join(FILES_DIR);
        fs::create_dir_all(&files_dir)
            .await
            .map_err(|e| CacheError::io(&files_dir, &e))?;

        let mut manifest = Vec::with_capacity(artifact.files.len());
        for (path, entry) in artifact.files.iter() {
            let dest = files_dir.join(path);
            if let Some(parent) = dest.parent() {
                fs::create_dir_all(parent)
                    .await
                    .map_err(|e| CacheError::io(parent, &e))?;
            }
            fs::write(&dest, &entry.data)
                .await
                .map_err(|e| CacheError::io(&dest, &e))?;
            manifest.push(ManifestEntry {
                path: path.to_string(),
                executable: entry.executable,
                size: entry.size() as u64,
                digest: Hash::compute(&entry.data).to_hex(),
            });
        }

        let encoding = |e: serde_json::Error| CacheError::Encoding {
            key: *key,
            reason: e.to_string(),
        };
        let manifest_path = staging.join(MANIFEST_FILE);
        let manifest = serde_json::to_vec_pretty(&manifest).map_err(encoding)?;
        fs::write(&manifest_path, manifest)
            .await
            .map_err(|e| CacheError::io(&manifest_path, &e))?;

        let meta_path = staging.join(META_FILE);
        let meta = serde_json::to_vec_pretty(&artifact.meta).map_err(encoding)?;
        fs::write(&meta_path, meta)
            .await
            .map_err(|e| CacheError::io(&meta_path, &e))?;
        Ok(())
    }

    async fn discard(staging: &Path) {
        if let Err(e) = fs::remove_dir_all(staging).await {
            tracing::warn!(path = %staging.display(), error = %e, "failed to remove staging directory");
        }
    }
}

#[async_trait]
impl ArtifactCache for LocalCache {
    fn name(&self) -> &str {
        &self.name
    }

    async fn has(&self, key: &CacheKey) -> CacheResult<bool> {
        Self::exists(&self.artifact_dir(key)).await
    }

    async fn retrieve(&self, key: &CacheKey) -> CacheResult<Artifact> {
        let dir = self.artifact_dir(key);
        if !Self::exists(&dir).await? {
            return Err(CacheError::NotFound { key: *key });
        }
        let corrupt = |reason: String| CacheError::Corrupt { key: *key, reason };

        let meta_path = dir.join(META_FILE);
        let meta = fs::read(&meta_path)
            .await
            .map_err(|e| CacheError::io(&meta_path, &e))?;
        let meta: ArtifactMeta = serde_json::from_slice(&meta).map_err(|e| corrupt(format!("meta: {}", e)))?;

        let manifest_path = dir.join(MANIFEST_FILE);
        let manifest = fs::read(&manifest_path)
            .await
            .map_err(|e| CacheError::io(&manifest_path, &e))?;
        let manifest: Vec<ManifestEntry> =
            serde_json::from_slice(&manifest).map_err(|e| corrupt(format!("manifest: {}", e)))?;

        let files_dir = dir.join(FILES_DIR);
        let mut files = FileTree::new();
        for entry in manifest {
            let path = normalize_path(&entry.path).map_err(|e| corrupt(e.to_string()))?;
            let source = files_dir.join(&path);
            let data = fs::read(&source)
                .await
                .map_err(|e| CacheError::io(&source, &e))?;
            let digest = Hash::from_hex(&entry.digest).map_err(|e| corrupt(format!("{}: {}", path, e)))?;
            if !digest.verify(&data) {
                return Err(corrupt(format!("{} does not match its digest", path)));
            }
            let data = Bytes::from(data);
            let file = if entry.executable {
                FileEntry::executable(data)
            } else {
                FileEntry::new(data)
            };
            files.insert(&path, file).map_err(|e| corrupt(e.to_string()))?;
        }

        Ok(Artifact::new(meta, files))
    }

    async fn store(&self, key: &CacheKey, artifact: &Artifact) -> CacheResult<()> {
        let final_dir = self.artifact_dir(key);
        if Self::exists(&final_dir).await? {
            return Err(CacheError::Conflict { key: *key });
        }

        let staging = self.root.join(TMP_DIR).join(Uuid::new_v4().to_string());
        if let Err(err) = self.write_staging(&staging, key, artifact).await {
            Self::discard(&staging).await;
            return Err(err);
        }

        match fs::rename(&staging, &final_dir).await {
            Ok(()) => {
                tracing::debug!(cache = %self.name, key = %key.short(), files = artifact.files.len(), "published artifact");
                Ok(())
            }
            Err(err) => {
                Self::discard(&staging).await;
                if Self::exists(&final_dir).await? {
                    Err(CacheError::Conflict { key: *key })
                } else {
                    Err(CacheError::io(&final_dir, &err))
                }
            }
        }
    }
}
