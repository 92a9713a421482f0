//! Garbage collection and storage locking
//!
//! Storage is organized in numbered generations under one base
//! directory. Garbage collection rotates generations (the oldest is
//! deleted, every other one moves down, a fresh newest is created)
//! under an exclusive advisory lock; every analysis run holds a shared
//! lock for its duration, so collection never races live work.

use std::fs::{self, File, OpenOptions};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

#[derive(Debug, thiserror::Error)]
pub enum GcError {
    #[error("Failed to acquire {kind} lock on {path}: {source}")]
    Lock {
        kind: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to rotate generations: {source}")]
    Rotate { source: std::io::Error },
}

/// An acquired advisory file lock; released on drop.
#[derive(Debug)]
pub struct LockFile {
    file: File,
    path: PathBuf,
}

impl LockFile {
    fn acquire(path: &Path, exclusive: bool) -> Result<Self, GcError> {
        let kind = if exclusive { "exclusive" } else { "shared" };
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|source| GcError::Lock {
                kind,
                path: path.to_path_buf(),
                source,
            })?;
        }
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(path)
            .map_err(|source| GcError::Lock {
                kind,
                path: path.to_path_buf(),
                source,
            })?;
        let operation = if exclusive {
            libc::LOCK_EX
        } else {
            libc::LOCK_SH
        };
        // SAFETY: flock on an owned, open file descriptor
        let rc = unsafe { libc::flock(file.as_raw_fd(), operation) };
        if rc != 0 {
            return Err(GcError::Lock {
                kind,
                path: path.to_path_buf(),
                source: std::io::Error::last_os_error(),
            });
        }
        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for LockFile {
    fn drop(&mut self) {
        // SAFETY: unlocking the descriptor we locked; errors on unlock
        // are ignored since close releases the lock anyway
        unsafe {
            libc::flock(self.file.as_raw_fd(), libc::LOCK_UN);
        }
    }
}

pub struct GarbageCollector {
    base_dir: PathBuf,
    generations: usize,
}

impl GarbageCollector {
    pub fn new(base_dir: impl Into<PathBuf>, generations: usize) -> Self {
        Self {
            base_dir: base_dir.into(),
            generations: generations.max(1),
        }
    }

    fn lock_file_path(&self) -> PathBuf {
        self.base_dir.join("gc.lock")
    }

    fn generation_path(&self, index: usize) -> PathBuf {
        self.base_dir.join(format!("generation-{}", index))
    }

    /// Shared lock held by analysis work to keep collection out.
    pub fn shared_lock(&self) -> Result<LockFile, GcError> {
        LockFile::acquire(&self.lock_file_path(), false)
    }

    fn exclusive_lock(&self) -> Result<LockFile, GcError> {
        LockFile::acquire(&self.lock_file_path(), true)
    }

    /// Rotate generations and delete the oldest. With `no_rotation`,
    /// only the exclusive lock round-trip is performed (used to wait
    /// out all running analyses).
    pub fn trigger_garbage_collection(&self, no_rotation: bool) -> Result<(), GcError> {
        let _lock = self.exclusive_lock()?;
        if no_rotation {
            return Ok(());
        }
        let oldest = self.generation_path(self.generations - 1);
        if oldest.exists() {
            fs::remove_dir_all(&oldest).map_err(|source| GcError::Rotate { source })?;
        }
        for index in (0..self.generations - 1).rev() {
            let from = self.generation_path(index);
            if from.exists() {
                fs::rename(&from, self.generation_path(index + 1))
                    .map_err(|source| GcError::Rotate { source })?;
            }
        }
        fs::create_dir_all(self.generation_path(0))
            .map_err(|source| GcError::Rotate { source })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rotation_shifts_generations() {
        let dir = tempfile::tempdir().expect("tempdir");
        let gc = GarbageCollector::new(dir.path(), 3);
        fs::create_dir_all(dir.path().join("generation-0/payload")).expect("seed gen0");
        fs::create_dir_all(dir.path().join("generation-2/stale")).expect("seed gen2");
        gc.trigger_garbage_collection(false).expect("rotates");
        assert!(dir.path().join("generation-1/payload").exists());
        assert!(!dir.path().join("generation-2/stale").exists());
        assert!(dir.path().join("generation-0").exists());
    }

    #[test]
    fn test_no_rotation_leaves_layout() {
        let dir = tempfile::tempdir().expect("tempdir");
        let gc = GarbageCollector::new(dir.path(), 2);
        fs::create_dir_all(dir.path().join("generation-0/payload")).expect("seed");
        gc.trigger_garbage_collection(true).expect("locks only");
        assert!(dir.path().join("generation-0/payload").exists());
    }

    #[test]
    fn test_shared_locks_are_concurrent() {
        let dir = tempfile::tempdir().expect("tempdir");
        let gc = GarbageCollector::new(dir.path(), 2);
        let first = gc.shared_lock().expect("first shared lock");
        let second = gc.shared_lock().expect("second shared lock");
        drop(first);
        drop(second);
    }
}
