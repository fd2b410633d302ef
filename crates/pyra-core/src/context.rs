// Copyright (C) 2025 Pyra contributors
// SPDX-License-Identifier: GPL-3.0-or-later
//! Shared context handed to every worker.

use std::path::{Path, PathBuf};

use crate::astronomy::AstronomyService;
use crate::config::{Config, ConfigStore};
use crate::error::{PyraError, Result};
use crate::state::StateStore;

/// Everything a worker needs: the stores, the astronomy service and the
/// directory layout. Drivers receive the state store explicitly; they never
/// talk to each other.
#[derive(Debug, Clone)]
pub struct CoreContext {
    /// Config store at `<root>/config`.
    pub config_store: ConfigStore,
    /// State store at `<root>/runtime-data`.
    pub state_store: StateStore,
    /// Solar geometry, initialized once per process.
    pub astronomy: AstronomyService,
    /// Directory for per-day activity files.
    pub activity_dir: PathBuf,
    /// Directory the supervisor logs into (quoted by error emails).
    pub logs_dir: PathBuf,
}

impl CoreContext {
    /// Context rooted at the project directory.
    pub fn new(root: &Path) -> Self {
        Self {
            config_store: ConfigStore::new(&root.join("config")),
            state_store: StateStore::new(&root.join("runtime-data")),
            astronomy: AstronomyService::initialize(),
            activity_dir: root.join("logs").join("activity"),
            logs_dir: root.join("logs").join("core"),
        }
    }

    /// Load and validate the current config.
    pub fn load_config(&self) -> Result<Config> {
        self.config_store.load().map_err(|e| PyraError::Config {
            reason: e.to_string(),
        })
    }

    /// Record an error in the ledger under `origin`.
    pub fn record_exception(&self, origin: &str, error: &PyraError) -> Result<()> {
        self.state_store.update_state(|state| {
            state.exceptions_state.add_exception(origin, error, true);
            Ok(())
        })
    }

    /// Drop all ledger items of `origin`.
    pub fn clear_exceptions(&self, origin: &str) -> Result<()> {
        self.state_store.update_state(|state| {
            state.exceptions_state.clear_exception_origin(origin);
            Ok(())
        })
    }
}
