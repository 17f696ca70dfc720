// src/lock.rs

//! Process-wide exclusive lock
//!
//! Package-manager hooks and explicit invocations can overlap; the whole
//! run happens under one `flock(LOCK_EX)` on a file in the state directory
//! so two processes never reconcile the same system concurrently. Released
//! when the handle drops.

use crate::error::{Error, Result};
use fs2::FileExt;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use tracing::debug;

pub struct ProcessLock {
    /// Kept open to hold the lock
    #[allow(dead_code)]
    file: File,
    path: PathBuf,
}

impl ProcessLock {
    /// Acquire the lock, blocking until available.
    pub fn acquire(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let file = File::create(path)?;

        file.lock_exclusive().map_err(|e| {
            Error::InitError(format!("Failed to acquire lock {}: {}", path.display(), e))
        })?;

        debug!(path = %path.display(), "Acquired process lock");
        Ok(Self { file, path: path.to_path_buf() })
    }

    /// Try to acquire without blocking; `None` when another process holds it.
    pub fn try_acquire(path: &Path) -> Result<Option<Self>> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let file = File::create(path)?;

        match file.try_lock_exclusive() {
            Ok(()) => {
                debug!(path = %path.display(), "Acquired process lock");
                Ok(Some(Self { file, path: path.to_path_buf() }))
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(Error::InitError(format!(
                "Failed to acquire lock {}: {}",
                path.display(),
                e
            ))),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for ProcessLock {
    fn drop(&mut self) {
        debug!(path = %self.path.display(), "Released process lock");
    }
}
