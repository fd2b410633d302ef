// Copyright (C) 2025 Pyra contributors
// SPDX-License-Identifier: GPL-3.0-or-later
//! Upload manifests and content digests.
//!
//! Every transfer unit carries a sidecar manifest on the remote. A unit
//! counts as uploaded only once its digest matches; the manifest flips to
//! `complete` at that point and never before.

use std::fs;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{PyraError, Result};

/// Name of the sidecar document next to each uploaded unit.
pub const MANIFEST_NAME: &str = ".upload-manifest.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadManifest {
    /// True only after every file in `file_list` is byte-identical on the
    /// remote.
    pub complete: bool,
    /// File names of the unit, sorted.
    pub file_list: Vec<String>,
    pub created_time: DateTime<Utc>,
    pub last_modified_time: DateTime<Utc>,
}

impl UploadManifest {
    pub fn new(file_list: Vec<String>) -> Self {
        let now = Utc::now();
        let mut file_list = file_list;
        file_list.sort();
        Self {
            complete: false,
            file_list,
            created_time: now,
            last_modified_time: now,
        }
    }

    pub fn mark_complete(&mut self) {
        self.complete = true;
        self.last_modified_time = Utc::now();
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec_pretty(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(|e| PyraError::Upload {
            details: format!("manifest unparsable: {}", e),
        })
    }
}

/// Hex SHA-256 of a byte slice.
pub fn digest_bytes(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Hex SHA-256 of a file's content.
pub fn digest_file(path: &Path) -> Result<String> {
    let bytes = fs::read(path).map_err(|e| PyraError::Upload {
        details: format!("cannot read '{}': {}", path.display(), e),
    })?;
    Ok(digest_bytes(&bytes))
}

/// Stable digest of a whole day folder: per-file digests sorted by file
/// name, concatenated as `name:digest` lines, hashed again.
pub fn digest_file_set(entries: &[(String, String)]) -> String {
    let mut sorted: Vec<&(String, String)> = entries.iter().collect();
    sorted.sort_by(|a, b| a.0.cmp(&b.0));
    let mut concatenation = String::new();
    for (name, digest) in sorted {
        concatenation.push_str(name);
        concatenation.push(':');
        concatenation.push_str(digest);
        concatenation.push('\n');
    }
    digest_bytes(concatenation.as_bytes())
}
