//! Moving file trees between memory and disk.

use kiln_core::{FileEntry, FileTree};
use std::io;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// Read every regular file under `dir` into a tree
///
/// Symlinks and special files are ignored.
///
/// # Errors
///
/// Returns error if the directory cannot be walked or a file read
pub fn read_tree(dir: &Path) -> io::Result<FileTree> {
    let mut tree = FileTree::new();
    for entry in WalkDir::new(dir).follow_links(false) {
        let entry = entry.map_err(io::Error::other)?;
        if !entry.file_type().is_file() {
            continue;
        }
        let Ok(relative) = entry.path().strip_prefix(dir) else {
            continue;
        };
        let path = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        let data = std::fs::read(entry.path())?;
        let file = if is_executable(&entry.metadata().map_err(io::Error::other)?) {
            FileEntry::executable(data)
        } else {
            FileEntry::new(data)
        };
        tree.insert(&path, file)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    }
    Ok(tree)
}

/// Write a tree under `dir`, creating directories as needed
///
/// # Errors
///
/// Returns error if any file cannot be written
pub fn write_tree(dir: &Path, tree: &FileTree) -> io::Result<()> {
    std::fs::create_dir_all(dir)?;
    for (path, entry) in tree.iter() {
        let target = dir.join(path);
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&target, &entry.data)?;
        if entry.executable {
            set_executable(&target)?;
        }
    }
    Ok(())
}

/// Host location of an absolute sandbox path under a staging root
#[must_use]
pub fn host_path(root: &Path, sandbox_path: &str) -> PathBuf {
    root.join(sandbox_path.trim_start_matches('/'))
}

#[cfg(unix)]
fn is_executable(meta: &std::fs::Metadata) -> bool {
    use std::os::unix::fs::PermissionsExt;
    meta.permissions().mode() & 0o111 != 0
}

#[cfg(not(unix))]
fn is_executable(_meta: &std::fs::Metadata) -> bool {
    false
}

#[cfg(unix)]
fn set_executable(path: &Path) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755))
}

#[cfg(not(unix))]
fn set_executable(_path: &Path) -> io::Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_then_read() {
        let dir = tempfile::tempdir().unwrap();
        let mut tree = FileTree::new();
        tree.insert("usr/bin/hello", FileEntry::executable("#!/bin/sh\necho hi\n"))
            .unwrap();
        tree.insert("usr/share/doc/README", FileEntry::new("docs")).unwrap();

        write_tree(dir.path(), &tree).unwrap();
        let back = read_tree(dir.path()).unwrap();
        assert_eq!(back, tree);
        #[cfg(unix)]
        assert!(back.get("usr/bin/hello").unwrap().executable);
    }

    #[test]
    fn test_read_missing_dir() {
        let dir = tempfile::tempdir().unwrap();
        assert!(read_tree(&dir.path().join("absent")).is_err());
    }

    #[test]
    fn test_host_path() {
        let root = Path::new("/tmp/stage");
        assert_eq!(host_path(root, "/kiln/build"), PathBuf::from("/tmp/stage/kiln/build"));
    }
}
