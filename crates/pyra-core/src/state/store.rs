// Copyright (C) 2025 Pyra contributors
// SPDX-License-Identifier: GPL-3.0-or-later
//! The locked on-disk state store.

use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::warn;

use super::models::StateDocument;
use crate::error::{PyraError, Result};
use crate::locks::FileLock;
use crate::util::atomic_write_json;

/// Store for the runtime-state document at `runtime-data/state.json`.
///
/// Cloneable handle; every transaction re-acquires the cross-process lock,
/// so clones in different workers (or processes) serialize against each
/// other.
#[derive(Debug, Clone)]
pub struct StateStore {
    state_path: PathBuf,
    lock_path: PathBuf,
    lock_timeout: Duration,
    lock_poll_interval: Duration,
}

impl StateStore {
    /// Store rooted at `dir`, using `dir/state.json`.
    pub fn new(dir: &Path) -> Self {
        Self {
            state_path: dir.join("state.json"),
            lock_path: dir.join(".state.lock"),
            lock_timeout: crate::locks::DEFAULT_LOCK_TIMEOUT,
            lock_poll_interval: crate::locks::DEFAULT_POLL_INTERVAL,
        }
    }

    /// Override the lock timing (tests).
    pub fn with_lock_timing(mut self, timeout: Duration, poll_interval: Duration) -> Self {
        self.lock_timeout = timeout;
        self.lock_poll_interval = poll_interval;
        self
    }

    /// Path of the state document.
    pub fn path(&self) -> &Path {
        &self.state_path
    }

    /// Reset the transient parts of the document, preserving the exception
    /// ledger and the activity counters. Called once on supervisor start.
    pub fn initialize(&self) -> Result<()> {
        let _lock = self.acquire_lock()?;
        let previous = self.read_or_default();
        let fresh = StateDocument::reset_from(previous);
        atomic_write_json(&self.state_path, &fresh)?;
        Ok(())
    }

    /// Read the current document without taking the write lock.
    ///
    /// Because writers replace the file atomically, a reader sees either
    /// the pre- or post-image of any transaction.
    pub fn load(&self) -> Result<StateDocument> {
        let text = std::fs::read_to_string(&self.state_path)?;
        Ok(serde_json::from_str(&text)?)
    }

    /// Scoped transaction: lock, load, mutate, write-then-rename.
    ///
    /// When the closure returns an error the write is aborted and the
    /// on-disk document stays untouched. The lock is released on every exit
    /// path because the guard unlocks on drop.
    pub fn update_state<T>(
        &self,
        mutate: impl FnOnce(&mut StateDocument) -> Result<T>,
    ) -> Result<T> {
        let _lock = self.acquire_lock()?;
        let mut document = self.read_or_default();
        let result = mutate(&mut document)?;
        atomic_write_json(&self.state_path, &document)?;
        Ok(result)
    }

    fn acquire_lock(&self) -> Result<FileLock> {
        FileLock::acquire(&self.lock_path, self.lock_timeout, self.lock_poll_interval).map_err(
            |e| PyraError::Runtime {
                details: format!("state lock: {}", e),
            },
        )
    }

    fn read_or_default(&self) -> StateDocument {
        match std::fs::read_to_string(&self.state_path) {
            Ok(text) => serde_json::from_str(&text).unwrap_or_else(|e| {
                warn!(error = %e, "State file is corrupt, starting from an empty document");
                StateDocument::default()
            }),
            Err(_) => StateDocument::default(),
        }
    }
}
