// Copyright (C) 2025 Pyra contributors
// SPDX-License-Identifier: GPL-3.0-or-later
//! On-disk config store with atomic updates.

use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::info;

use super::{Config, ConfigError, merge_patch};
use crate::locks::FileLock;
use crate::util::atomic_write_json;

/// Store for the operator-facing config document.
///
/// Reads happen on each caller's own cadence; there is no push
/// notification. Updates hold the config lock for the entire
/// read-modify-write.
#[derive(Debug, Clone)]
pub struct ConfigStore {
    config_path: PathBuf,
    lock_path: PathBuf,
}

impl ConfigStore {
    /// Store rooted at `dir`, using `dir/config.json`.
    pub fn new(dir: &Path) -> Self {
        Self {
            config_path: dir.join("config.json"),
            lock_path: dir.join(".config.lock"),
        }
    }

    /// Path of the config document.
    pub fn path(&self) -> &Path {
        &self.config_path
    }

    /// Load and fully validate the current document.
    pub fn load(&self) -> Result<Config, ConfigError> {
        self.load_with(false)
    }

    /// Load, optionally skipping path-existence checks.
    pub fn load_with(&self, ignore_path_existence: bool) -> Result<Config, ConfigError> {
        let config = self.read_document()?;
        config.validate(ignore_path_existence)?;
        Ok(config)
    }

    /// Atomically merge a partial document onto the current one.
    ///
    /// The merged document must validate; otherwise nothing is written and
    /// the on-disk file is untouched.
    pub fn update(&self, patch: &Value, ignore_path_existence: bool) -> Result<Config, ConfigError> {
        let _lock = FileLock::acquire_default(&self.lock_path)?;

        let current = self.read_raw()?;
        let merged_value = merge_patch(&current, patch)?;
        let merged: Config =
            serde_json::from_value(merged_value).map_err(|e| ConfigError::SchemaError {
                details: e.to_string(),
            })?;
        merged.validate(ignore_path_existence)?;

        atomic_write_json(&self.config_path, &merged)?;
        info!(path = %self.config_path.display(), "Config updated");
        Ok(merged)
    }

    /// Write a full document (used by tests and first-time setup).
    pub fn write(&self, config: &Config) -> Result<(), ConfigError> {
        let _lock = FileLock::acquire_default(&self.lock_path)?;
        atomic_write_json(&self.config_path, config)?;
        Ok(())
    }

    fn read_raw(&self) -> Result<Value, ConfigError> {
        let text = std::fs::read_to_string(&self.config_path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ConfigError::FileMissing {
                    path: self.config_path.clone(),
                }
            } else {
                ConfigError::Io(e)
            }
        })?;
        serde_json::from_str(&text).map_err(|e| ConfigError::ParseError {
            details: e.to_string(),
        })
    }

    fn read_document(&self) -> Result<Config, ConfigError> {
        let raw = self.read_raw()?;
        serde_json::from_value(raw).map_err(|e| ConfigError::SchemaError {
            details: e.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::schema::test_fixtures;
    use serde_json::json;

    fn store_with_fixture() -> (tempfile::TempDir, ConfigStore, Config) {
        let dir = tempfile::tempdir().unwrap();
        let config = test_fixtures::config_in_dir(dir.path());
        let store = ConfigStore::new(dir.path());
        store.write(&config).unwrap();
        (dir, store, config)
    }

    #[test]
    fn test_load_roundtrip() {
        let (_dir, store, config) = store_with_fixture();
        let loaded = store.load().unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_load_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConfigStore::new(dir.path());
        assert!(matches!(
            store.load(),
            Err(ConfigError::FileMissing { .. })
        ));
    }

    #[test]
    fn test_load_garbage_is_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("config.json"), "{not json").unwrap();
        let store = ConfigStore::new(dir.path());
        assert!(matches!(
            store.load(),
            Err(ConfigError::ParseError { .. })
        ));
    }

    #[test]
    fn test_update_merges_and_persists() {
        let (_dir, store, _config) = store_with_fixture();
        let updated = store
            .update(&json!({"general": {"test_mode": true}}), false)
            .unwrap();
        assert!(updated.general.test_mode);

        let reloaded = store.load().unwrap();
        assert!(reloaded.general.test_mode);
        assert_eq!(reloaded.general.seconds_per_core_interval, 30);
    }

    #[test]
    fn test_invalid_update_leaves_file_untouched() {
        let (_dir, store, _config) = store_with_fixture();
        let before = std::fs::read(store.path()).unwrap();

        let result = store.update(
            &json!({"general": {"seconds_per_core_interval": false}}),
            false,
        );
        assert!(result.is_err());

        let after = std::fs::read(store.path()).unwrap();
        assert_eq!(before, after, "rejected update must not modify the file");
    }

    #[test]
    fn test_update_out_of_range_rejected() {
        let (_dir, store, _config) = store_with_fixture();
        let result = store.update(
            &json!({"general": {"seconds_per_core_interval": 1}}),
            false,
        );
        assert!(matches!(result, Err(ConfigError::SchemaError { .. })));
    }

    #[test]
    fn test_update_unknown_key_rejected() {
        let (_dir, store, _config) = store_with_fixture();
        let result = store.update(&json!({"general": {"nope": 1}}), false);
        assert!(result.is_err());
    }
}
