/*!
Depth-first traversal of a snapshot directory.

Entries are produced lazily, each directory before its children, with
siblings sorted by file name so that repeated walks over an unchanged tree
yield the same sequence. Symbolic links are never followed.
*/

use std::fs::{FileType, Metadata};
use std::path::{Path, PathBuf};

use walkdir::WalkDir;

use crate::{Result, SnapkeepError};

/// Classification of a directory entry for archiving
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryKind {
    Directory,
    File,
    /// Anything else (symlinks, sockets, devices, fifos)
    Other(String),
}

impl EntryKind {
    fn from_file_type(ft: FileType) -> Self {
        if ft.is_dir() {
            EntryKind::Directory
        } else if ft.is_file() {
            EntryKind::File
        } else {
            EntryKind::Other(describe_file_type(ft).to_string())
        }
    }
}

#[cfg(unix)]
fn describe_file_type(ft: FileType) -> &'static str {
    use std::os::unix::fs::FileTypeExt;

    if ft.is_symlink() {
        "symlink"
    } else if ft.is_socket() {
        "socket"
    } else if ft.is_fifo() {
        "named pipe"
    } else if ft.is_block_device() {
        "block device"
    } else if ft.is_char_device() {
        "character device"
    } else {
        "unknown"
    }
}

#[cfg(not(unix))]
fn describe_file_type(ft: FileType) -> &'static str {
    if ft.is_symlink() {
        "symlink"
    } else {
        "unknown"
    }
}

/// A single entry produced by [`DirectoryWalker`]
#[derive(Debug)]
pub struct WalkEntry {
    inner: walkdir::DirEntry,
    archive_name: PathBuf,
    kind: EntryKind,
}

impl WalkEntry {
    /// Location on the filesystem
    pub fn path(&self) -> &Path {
        self.inner.path()
    }

    /// Root-relative path prefixed with the walker's base name
    pub fn archive_name(&self) -> &Path {
        &self.archive_name
    }

    pub fn kind(&self) -> &EntryKind {
        &self.kind
    }

    /// Distance from the walk root (the root itself is 0)
    pub fn depth(&self) -> usize {
        self.inner.depth()
    }

    /// Metadata of the entry itself, not of a link target.
    pub fn metadata(&self) -> Result<Metadata> {
        self.inner
            .metadata()
            .map_err(|e| SnapkeepError::EntryMetadata {
                path: self.archive_name.clone(),
                source: e.into(),
            })
    }
}

/// Lazy, single-pass walker over a snapshot directory tree
#[derive(Debug, Clone)]
pub struct DirectoryWalker {
    root: PathBuf,
    base: PathBuf,
}

impl DirectoryWalker {
    /// Walk `root`, naming entries relative to `base`.
    pub fn new<P: Into<PathBuf>, B: Into<PathBuf>>(root: P, base: B) -> Self {
        Self {
            root: root.into(),
            base: base.into(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Start a fresh pass over the tree.
    ///
    /// A failure to read a directory is yielded as an error item; the
    /// caller decides whether it ends the walk.
    pub fn entries(&self) -> impl Iterator<Item = Result<WalkEntry>> + '_ {
        WalkDir::new(&self.root)
            .follow_links(false)
            .sort_by_file_name()
            .into_iter()
            .map(move |item| {
                let inner = item.map_err(|e| SnapkeepError::Io(e.into()))?;
                let archive_name = match inner.path().strip_prefix(&self.root) {
                    Ok(rel) if rel.as_os_str().is_empty() => self.base.clone(),
                    Ok(rel) => self.base.join(rel),
                    Err(_) => self.base.join(inner.file_name()),
                };
                let kind = EntryKind::from_file_type(inner.file_type());

                Ok(WalkEntry {
                    inner,
                    archive_name,
                    kind,
                })
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn names(walker: &DirectoryWalker) -> Vec<String> {
        walker
            .entries()
            .map(|e| e.unwrap().archive_name().to_string_lossy().into_owned())
            .collect()
    }

    #[test]
    fn test_empty_directory_yields_root_only() {
        let temp_dir = TempDir::new().unwrap();
        let walker = DirectoryWalker::new(temp_dir.path(), "snap");

        let entries: Vec<_> = walker.entries().collect::<Result<_>>().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].archive_name(), Path::new("snap"));
        assert_eq!(entries[0].kind(), &EntryKind::Directory);
        assert_eq!(entries[0].depth(), 0);
    }

    #[test]
    fn test_parent_before_child() {
        let temp_dir = TempDir::new().unwrap();
        fs::create_dir_all(temp_dir.path().join("a/b/c")).unwrap();
        fs::write(temp_dir.path().join("a/b/c/file.txt"), b"data").unwrap();
        fs::write(temp_dir.path().join("top.txt"), b"data").unwrap();

        let walker = DirectoryWalker::new(temp_dir.path(), "snap");
        let names = names(&walker);

        let pos = |n: &str| names.iter().position(|x| x == n).unwrap();
        assert!(pos("snap") < pos("snap/a"));
        assert!(pos("snap/a") < pos("snap/a/b"));
        assert!(pos("snap/a/b") < pos("snap/a/b/c"));
        assert!(pos("snap/a/b/c") < pos("snap/a/b/c/file.txt"));
        assert!(names.contains(&"snap/top.txt".to_string()));
        assert_eq!(names.len(), 6);
    }

    #[test]
    fn test_order_is_stable() {
        let temp_dir = TempDir::new().unwrap();
        for name in ["zeta", "alpha", "mid"] {
            fs::create_dir(temp_dir.path().join(name)).unwrap();
            fs::write(temp_dir.path().join(name).join("x"), name).unwrap();
        }

        let walker = DirectoryWalker::new(temp_dir.path(), "snap");
        assert_eq!(names(&walker), names(&walker));
    }

    #[cfg(unix)]
    #[test]
    fn test_symlink_is_not_followed() {
        let temp_dir = TempDir::new().unwrap();
        fs::create_dir(temp_dir.path().join("target")).unwrap();
        fs::write(temp_dir.path().join("target/inner"), b"x").unwrap();
        std::os::unix::fs::symlink("target", temp_dir.path().join("link")).unwrap();

        let walker = DirectoryWalker::new(temp_dir.path(), "snap");
        let link = walker
            .entries()
            .map(|e| e.unwrap())
            .find(|e| e.archive_name() == Path::new("snap/link"))
            .unwrap();

        assert_eq!(link.kind(), &EntryKind::Other("symlink".to_string()));
        assert!(!names(&walker).contains(&"snap/link/inner".to_string()));
    }

    #[test]
    fn test_missing_root_is_an_error() {
        let temp_dir = TempDir::new().unwrap();
        let walker = DirectoryWalker::new(temp_dir.path().join("missing"), "snap");

        let first = walker.entries().next().unwrap();
        assert!(matches!(first, Err(SnapkeepError::Io(_))));
    }
}
