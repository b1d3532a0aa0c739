//! In-memory file trees.
//!
//! A `FileTree` is the unit exchanged between sources, the sandbox and the
//! artifact cache. Paths are normalized, relative, `/`-separated and sorted,
//! so a tree has a single canonical digest.

use crate::error::{CoreError, CoreResult};
use crate::hash::Hash;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A regular file in a tree
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    /// File contents
    pub data: Bytes,
    /// Whether the executable bit is set
    pub executable: bool,
}

impl FileEntry {
    /// Create a non-executable file
    #[must_use]
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self {
            data: data.into(),
            executable: false,
        }
    }

    /// Create an executable file
    #[must_use]
    pub fn executable(data: impl Into<Bytes>) -> Self {
        Self {
            data: data.into(),
            executable: true,
        }
    }

    /// Size in bytes
    #[must_use]
    pub fn size(&self) -> usize {
        self.data.len()
    }
}

/// A set of files keyed by normalized relative path
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileTree {
    entries: BTreeMap<String, FileEntry>,
}

impl FileTree {
    /// Create an empty tree
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a file, replacing any file at the same path
    ///
    /// # Errors
    ///
    /// Returns error if the path is empty or escapes the tree
    pub fn insert(&mut self, path: &str, entry: FileEntry) -> CoreResult<()> {
        let path = normalize_path(path)?;
        self.entries.insert(path, entry);
        Ok(())
    }

    /// Look up a file
    #[must_use]
    pub fn get(&self, path: &str) -> Option<&FileEntry> {
        normalize_path(path).ok().and_then(|p| self.entries.get(&p))
    }

    /// Number of files
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if the tree has no files
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterate files in path order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &FileEntry)> {
        self.entries.iter().map(|(p, e)| (p.as_str(), e))
    }

    /// Total size of all file contents
    #[must_use]
    pub fn total_size(&self) -> u64 {
        self.entries.values().map(|e| e.size() as u64).sum()
    }

    /// Copy every file of `other` into this tree; `other` wins on collisions
    pub fn overlay(&mut self, other: &FileTree) {
        for (path, entry) in &other.entries {
            self.entries.insert(path.clone(), entry.clone());
        }
    }

    /// The files below `dir`, re-rooted at `dir`
    ///
    /// # Errors
    ///
    /// Returns error if `dir` escapes the tree
    pub fn subtree(&self, dir: &str) -> CoreResult<FileTree> {
        let dir = normalize_dir(dir)?;
        if dir.is_empty() {
            return Ok(self.clone());
        }
        let prefix = format!("{}/", dir);
        let entries = self
            .entries
            .iter()
            .filter_map(|(path, entry)| {
                path.strip_prefix(&prefix)
                    .map(|rest| (rest.to_string(), entry.clone()))
            })
            .collect();
        Ok(Self { entries })
    }

    /// This tree moved below `dir`
    ///
    /// # Errors
    ///
    /// Returns error if `dir` escapes the tree
    pub fn prefixed(&self, dir: &str) -> CoreResult<FileTree> {
        let dir = normalize_dir(dir)?;
        if dir.is_empty() {
            return Ok(self.clone());
        }
        let entries = self
            .entries
            .iter()
            .map(|(path, entry)| (format!("{}/{}", dir, path), entry.clone()))
            .collect();
        Ok(Self { entries })
    }

    /// Keep only the files for which `keep` returns true
    #[must_use]
    pub fn filtered(&self, mut keep: impl FnMut(&str) -> bool) -> FileTree {
        let entries = self
            .entries
            .iter()
            .filter(|(path, _)| keep(path.as_str()))
            .map(|(p, e)| (p.clone(), e.clone()))
            .collect();
        Self { entries }
    }

    /// Canonical digest over paths, modes and contents
    #[must_use]
    pub fn digest(&self) -> Hash {
        let mut hasher = blake3::Hasher::new();
        for (path, entry) in &self.entries {
            hasher.update(&(path.len() as u64).to_le_bytes());
            hasher.update(path.as_bytes());
            hasher.update(&[u8::from(entry.executable)]);
            hasher.update(Hash::compute(&entry.data).as_bytes());
        }
        Hash::from_bytes(*hasher.finalize().as_bytes())
    }
}

/// Normalize a file path: relative, no `.`/`..` components, no empty segments
///
/// # Errors
///
/// Returns error if the path is empty or contains `..`
pub fn normalize_path(path: &str) -> CoreResult<String> {
    let dir = normalize_dir(path)?;
    if dir.is_empty() {
        return Err(CoreError::InvalidPath {
            path: path.to_string(),
            reason: "empty path".to_string(),
        });
    }
    Ok(dir)
}

/// Normalize a directory path; the root normalizes to the empty string
///
/// # Errors
///
/// Returns error if the path contains `..`
pub fn normalize_dir(path: &str) -> CoreResult<String> {
    let mut parts = Vec::new();
    for part in path.split('/') {
        match part {
            "" | "." => continue,
            ".." => {
                return Err(CoreError::InvalidPath {
                    path: path.to_string(),
                    reason: "parent directory reference".to_string(),
                });
            }
            other => parts.push(other),
        }
    }
    Ok(parts.join("/"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> FileTree {
        let mut tree = FileTree::new();
        tree.insert("/usr/bin/hello", FileEntry::executable("#!/bin/sh\n")).unwrap();
        tree.insert("usr/share/doc/README", FileEntry::new("hi")).unwrap();
        tree
    }

    #[test]
    fn test_insert_normalizes() {
        let tree = sample();
        assert!(tree.get("usr/bin/hello").is_some());
        assert!(tree.get("/usr/bin/./hello").is_some());
        assert_eq!(tree.len(), 2);
    }

    #[test]
    fn test_insert_rejects_escape() {
        let mut tree = FileTree::new();
        assert!(tree.insert("../etc/passwd", FileEntry::new("x")).is_err());
        assert!(tree.insert("/", FileEntry::new("x")).is_err());
    }

    #[test]
    fn test_subtree_and_prefixed() {
        let tree = sample();
        let usr = tree.subtree("/usr").unwrap();
        assert!(usr.get("bin/hello").is_some());
        assert_eq!(usr.len(), 2);

        let back = usr.prefixed("usr").unwrap();
        assert_eq!(back, tree);
    }

    #[test]
    fn test_overlay_later_wins() {
        let mut base = sample();
        let mut top = FileTree::new();
        top.insert("usr/share/doc/README", FileEntry::new("replaced")).unwrap();
        base.overlay(&top);
        assert_eq!(base.get("usr/share/doc/README").unwrap().data, Bytes::from("replaced"));
    }

    #[test]
    fn test_digest_sensitivity() {
        let tree = sample();
        assert_eq!(tree.digest(), sample().digest());

        let mut changed = sample();
        changed.insert("usr/bin/hello", FileEntry::new("#!/bin/sh\n")).unwrap();
        assert_ne!(tree.digest(), changed.digest());
    }

    #[test]
    fn test_filtered() {
        let tree = sample();
        let docs = tree.filtered(|p| p.starts_with("usr/share"));
        assert_eq!(docs.len(), 1);
    }

    proptest::proptest! {
        #[test]
        fn prop_digest_ignores_insertion_order(
            paths in proptest::collection::btree_set("[a-c]{1,3}(/[a-c]{1,3}){0,2}", 1..8)
        ) {
            let paths: Vec<String> = paths.into_iter().collect();
            let mut forward = FileTree::new();
            for path in &paths {
                forward.insert(path, FileEntry::new(path.clone())).unwrap();
            }
            let mut backward = FileTree::new();
            for path in paths.iter().rev() {
                backward.insert(&format!("./{}", path), FileEntry::new(path.clone())).unwrap();
            }
            proptest::prop_assert_eq!(forward.digest(), backward.digest());
        }
    }
}
