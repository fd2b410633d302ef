// Copyright (C) 2025 Pyra contributors
// SPDX-License-Identifier: GPL-3.0-or-later
//! Typed configuration document, validation and the on-disk store.
//!
//! A single JSON document at `config/config.json` drives the whole station.
//! The UI and CLI apply partial updates through [`ConfigStore::update`],
//! which merges recursively, preserves leaf types, rejects unknown keys and
//! writes atomically under the cross-process config lock.

mod merge;
pub(crate) mod schema;
mod store;

pub use merge::merge_patch;
pub use schema::{
    AemetEnclosureConfig, CamTrackerConfig, Config, ConfigError, DecisionMode, ErrorEmailConfig,
    GeneralConfig, HeliosConfig, MeasurementDecisionConfig, MeasurementTriggersConfig, OpusConfig,
    PowerPlugConfig, TimeOfDay, TumEnclosureConfig, UploadConfig, UploadStreamConfig,
    UploadVariant,
};
pub use store::ConfigStore;
