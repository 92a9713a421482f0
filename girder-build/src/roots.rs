//! Source roots
//!
//! The analyzer reads sources through this interface only; the actual
//! backing (filesystem scan, git tree, remote root) is an external
//! collaborator. The in-memory implementation backs tests and
//! synthesized roots.

use girder_core::{compute_hash, Digest};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Listing of one directory, split by entry kind.
#[derive(Debug, Clone, Default)]
pub struct DirectoryEntries {
    pub files: Vec<String>,
    pub symlinks: Vec<String>,
    pub directories: Vec<String>,
}

/// Errors from reading a source root.
#[derive(Debug, Clone, thiserror::Error)]
pub enum RootError {
    #[error("Directory {path} does not exist")]
    NoSuchDirectory { path: String },

    #[error("File {path} does not exist")]
    NoSuchFile { path: String },
}

/// Read-only view of one repository's source tree.
pub trait FileRoot: Send + Sync {
    /// Listing of a directory, by `/`-separated path relative to the
    /// root (empty string is the root itself).
    fn directory_entries(&self, path: &str) -> Result<DirectoryEntries, RootError>;

    /// Content of a regular file.
    fn read_file(&self, path: &str) -> Option<Vec<u8>>;

    /// Target of a symlink.
    fn symlink_content(&self, path: &str) -> Option<String>;

    /// An absent root has no local content; analysis must be delegated
    /// to the serve endpoint.
    fn is_absent(&self) -> bool {
        false
    }

    /// Content digest of a file, for roots that know it cheaply.
    fn file_digest(&self, path: &str) -> Option<Digest> {
        self.read_file(path).map(|content| compute_hash(&content))
    }
}

/// In-memory root: a map from file path to content plus a map from
/// symlink path to target.
#[derive(Debug, Default, Clone)]
pub struct InMemoryFileRoot {
    files: BTreeMap<String, Vec<u8>>,
    symlinks: BTreeMap<String, String>,
}

impl InMemoryFileRoot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_file(mut self, path: impl Into<String>, content: impl Into<Vec<u8>>) -> Self {
        self.files.insert(path.into(), content.into());
        self
    }

    pub fn with_symlink(mut self, path: impl Into<String>, target: impl Into<String>) -> Self {
        self.symlinks.insert(path.into(), target.into());
        self
    }

    pub fn into_root(self) -> Arc<dyn FileRoot> {
        Arc::new(self)
    }

    fn entries_under<'a>(
        paths: impl Iterator<Item = &'a String>,
        dir: &str,
    ) -> (Vec<String>, Vec<String>) {
        let prefix = if dir.is_empty() {
            String::new()
        } else {
            format!("{}/", dir)
        };
        let mut direct = Vec::new();
        let mut subdirs = Vec::new();
        for path in paths {
            if let Some(rest) = path.strip_prefix(&prefix) {
                match rest.split_once('/') {
                    None => direct.push(rest.to_string()),
                    Some((first, _)) => subdirs.push(first.to_string()),
                }
            }
        }
        subdirs.sort();
        subdirs.dedup();
        (direct, subdirs)
    }
}

impl FileRoot for InMemoryFileRoot {
    fn directory_entries(&self, path: &str) -> Result<DirectoryEntries, RootError> {
        let (files, mut directories) = Self::entries_under(self.files.keys(), path);
        let (symlinks, symlink_dirs) = Self::entries_under(self.symlinks.keys(), path);
        directories.extend(symlink_dirs);
        directories.sort();
        directories.dedup();
        if files.is_empty() && symlinks.is_empty() && directories.is_empty() {
            return Err(RootError::NoSuchDirectory {
                path: path.to_string(),
            });
        }
        Ok(DirectoryEntries {
            files,
            symlinks,
            directories,
        })
    }

    fn read_file(&self, path: &str) -> Option<Vec<u8>> {
        self.files.get(path).cloned()
    }

    fn symlink_content(&self, path: &str) -> Option<String> {
        self.symlinks.get(path).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_directory_listing() {
        let root = InMemoryFileRoot::new()
            .with_file("src/main.c", "int main() {}")
            .with_file("src/lib/util.c", "")
            .with_symlink("src/link", "main.c");
        let entries = root.directory_entries("src").expect("src exists");
        assert_eq!(entries.files, vec!["main.c"]);
        assert_eq!(entries.symlinks, vec!["link"]);
        assert_eq!(entries.directories, vec!["lib"]);
        assert!(root.directory_entries("nope").is_err());
    }

    #[test]
    fn test_read_file_and_symlink() {
        let root = InMemoryFileRoot::new()
            .with_file("a", "content")
            .with_symlink("l", "a");
        assert_eq!(root.read_file("a"), Some(b"content".to_vec()));
        assert_eq!(root.symlink_content("l"), Some("a".to_string()));
        assert!(root.read_file("missing").is_none());
    }
}
