// Copyright (C) 2025 Pyra contributors
// SPDX-License-Identifier: GPL-3.0-or-later
//! Cross-process advisory file locks.
//!
//! The config and state documents are shared between the supervisor, the
//! operator CLI and tests. All writers go through [`FileLock::acquire`],
//! which serializes transactions across processes. The lock is released on
//! drop, so every exit path (including panics unwinding out of a
//! transaction closure) releases it.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use fs2::FileExt;

/// How long acquire() waits before giving up.
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(10);

/// How often acquire() retries while the lock is held elsewhere.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Errors from lock acquisition.
#[derive(Debug, thiserror::Error)]
pub enum LockError {
    /// The lock file could not be opened or created.
    #[error("cannot open lock file {path}: {source}")]
    Open {
        /// Path of the lock file.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// Another process held the lock for the whole timeout window.
    #[error("timed out after {timeout:?} waiting for lock {path}")]
    Timeout {
        /// Path of the lock file.
        path: PathBuf,
        /// The timeout that elapsed.
        timeout: Duration,
    },
}

/// An exclusive advisory lock on a sidecar `.lock` file.
///
/// Held for the duration of a read-modify-write transaction. Dropping the
/// guard unlocks the file.
#[derive(Debug)]
pub struct FileLock {
    file: File,
    path: PathBuf,
}

impl FileLock {
    /// Acquire the lock, polling until `timeout` elapses.
    pub fn acquire(
        path: &Path,
        timeout: Duration,
        poll_interval: Duration,
    ) -> Result<Self, LockError> {
        if let Some(parent) = path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(path)
            .map_err(|source| LockError::Open {
                path: path.to_path_buf(),
                source,
            })?;

        let deadline = Instant::now() + timeout;
        loop {
            match file.try_lock_exclusive() {
                Ok(()) => {
                    return Ok(Self {
                        file,
                        path: path.to_path_buf(),
                    });
                }
                Err(_) if Instant::now() < deadline => {
                    std::thread::sleep(poll_interval);
                }
                Err(_) => {
                    return Err(LockError::Timeout {
                        path: path.to_path_buf(),
                        timeout,
                    });
                }
            }
        }
    }

    /// Acquire with the default timeout and poll interval.
    pub fn acquire_default(path: &Path) -> Result<Self, LockError> {
        Self::acquire(path, DEFAULT_LOCK_TIMEOUT, DEFAULT_POLL_INTERVAL)
    }

    /// Path of the lock file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        let _ = fs2::FileExt::unlock(&self.file);
    }
}
