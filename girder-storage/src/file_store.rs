//! Content-addressed file store
//!
//! Files are named by the digest of their content and sharded into
//! two-hex-digit subdirectories. Writes go through a temporary file
//! and an atomic rename, so concurrent readers never observe partial
//! content.

use girder_core::Digest;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

/// Overwrite discipline of a store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreMode {
    /// Keep the existing entry; used for read-only older generations.
    FirstWins,
    /// Replace the existing entry; used for the newest generation.
    LastWins,
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Failed to write store entry {digest}: {source}")]
    Write {
        digest: Digest,
        source: std::io::Error,
    },

    #[error("Failed to create store directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        source: std::io::Error,
    },
}

#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
    mode: StoreMode,
}

impl FileStore {
    pub fn new(root: impl Into<PathBuf>, mode: StoreMode) -> Self {
        Self {
            root: root.into(),
            mode,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn entry_path(&self, digest: &Digest) -> PathBuf {
        let hex = digest.hex();
        self.root.join(&hex[..2]).join(&hex[2..])
    }

    /// Store content under its digest name; atomic rename into place.
    /// Returns the final path.
    pub fn add(&self, digest: &Digest, content: &[u8]) -> Result<PathBuf, StoreError> {
        let target = self.entry_path(digest);
        if self.mode == StoreMode::FirstWins && target.exists() {
            return Ok(target);
        }
        let dir = target.parent().expect("entry path always has a parent");
        fs::create_dir_all(dir).map_err(|source| StoreError::CreateDir {
            path: dir.to_path_buf(),
            source,
        })?;
        let mut temp = NamedTempFile::new_in(dir).map_err(|source| StoreError::Write {
            digest: *digest,
            source,
        })?;
        temp.write_all(content).map_err(|source| StoreError::Write {
            digest: *digest,
            source,
        })?;
        temp.persist(&target)
            .map_err(|err| StoreError::Write {
                digest: *digest,
                source: err.error,
            })?;
        Ok(target)
    }

    /// Path of an existing entry.
    pub fn lookup(&self, digest: &Digest) -> Option<PathBuf> {
        let target = self.entry_path(digest);
        target.exists().then_some(target)
    }

    /// Content of an existing entry.
    pub fn read(&self, digest: &Digest) -> Option<Vec<u8>> {
        fs::read(self.entry_path(digest)).ok()
    }
}
