//! File-based locking to prevent concurrent pipeline runs.
//!
//! Apply and restore both open the fail-open window on shared global policy
//! state, so two runs must never overlap. A second run finding the lock held
//! fails immediately instead of queueing behind the first.

use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::error::LockError;

/// Default lock location.
pub const DEFAULT_LOCK_FILE: &str = "/run/geoallow.lock";

/// Holds an exclusive advisory lock until dropped.
#[derive(Debug)]
pub struct LockGuard {
    _file: File,
    path: PathBuf,
}

impl LockGuard {
    /// Try to take the lock without blocking.
    ///
    /// The file is opened create+read+write without truncation so creation
    /// and locking cannot race.
    pub fn acquire(path: &Path) -> Result<Self, LockError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).ok();
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(|source| LockError::Io {
                path: path.to_path_buf(),
                source,
            })?;

        fs::set_permissions(path, fs::Permissions::from_mode(0o600)).map_err(|source| {
            LockError::Io {
                path: path.to_path_buf(),
                source,
            }
        })?;

        file.try_lock_exclusive()
            .map_err(|_| LockError::Held(path.to_path_buf()))?;

        debug!("Acquired lock {:?}", path);
        Ok(Self {
            _file: file,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        debug!("Released lock {:?}", self.path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_lock_acquire_release() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("run.lock");

        let guard = LockGuard::acquire(&path).unwrap();
        assert_eq!(guard.path(), path.as_path());
        drop(guard);

        assert!(LockGuard::acquire(&path).is_ok());
    }

    #[test]
    fn test_second_acquire_fails_fast() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("run.lock");

        let _held = LockGuard::acquire(&path).unwrap();
        let second = LockGuard::acquire(&path);
        assert!(matches!(second, Err(LockError::Held(_))));
    }

    #[test]
    fn test_lock_creates_parent_directory() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested/dir/run.lock");
        assert!(LockGuard::acquire(&path).is_ok());
        assert!(path.exists());
    }
}
