// Copyright (C) 2025 Pyra contributors
// SPDX-License-Identifier: GPL-3.0-or-later
//! Recursive, type-preserving merge of partial config documents.
//!
//! Rules:
//! - Objects merge key by key; everything else replaces.
//! - A key present in the patch but absent from the current document is
//!   rejected at any depth.
//! - The JSON kind of a leaf may not change. The only exception is `null`:
//!   optional sections (enclosures, helios, upload) may be switched between
//!   `null` and an object.

use serde_json::Value;

use super::ConfigError;

fn kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Merge `patch` onto `current`, returning the merged document.
pub fn merge_patch(current: &Value, patch: &Value) -> Result<Value, ConfigError> {
    merge_at("$", current, patch)
}

fn merge_at(path: &str, current: &Value, patch: &Value) -> Result<Value, ConfigError> {
    // null on either side means "section appears or disappears"; the
    // schema validation after the merge decides whether the shape is legal.
    if current.is_null() || patch.is_null() {
        return Ok(patch.clone());
    }

    match (current, patch) {
        (Value::Object(cur), Value::Object(new)) => {
            let mut merged = cur.clone();
            for (key, new_value) in new {
                let child_path = format!("{}.{}", path, key);
                match cur.get(key) {
                    Some(cur_value) => {
                        merged.insert(key.clone(), merge_at(&child_path, cur_value, new_value)?);
                    }
                    None => {
                        return Err(ConfigError::SchemaError {
                            details: format!("unknown key '{}'", child_path),
                        });
                    }
                }
            }
            Ok(Value::Object(merged))
        }
        _ if kind(current) == kind(patch) => Ok(patch.clone()),
        _ => Err(ConfigError::SchemaError {
            details: format!(
                "type of '{}' may not change from {} to {}",
                path,
                kind(current),
                kind(patch)
            ),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_leaf_replacement() {
        let current = json!({"general": {"seconds_per_core_interval": 30, "test_mode": false}});
        let patch = json!({"general": {"test_mode": true}});
        let merged = merge_patch(&current, &patch).unwrap();
        assert_eq!(merged["general"]["seconds_per_core_interval"], 30);
        assert_eq!(merged["general"]["test_mode"], true);
    }

    #[test]
    fn test_untouched_leaves_survive() {
        let current = json!({"a": {"b": 1, "c": "x"}, "d": [1, 2]});
        let patch = json!({"a": {"b": 2}});
        let merged = merge_patch(&current, &patch).unwrap();
        assert_eq!(merged["a"]["c"], "x");
        assert_eq!(merged["d"], json!([1, 2]));
    }

    #[test]
    fn test_unknown_key_rejected() {
        let current = json!({"general": {"test_mode": false}});
        let patch = json!({"general": {"frobnicate": 1}});
        let err = merge_patch(&current, &patch).unwrap_err();
        assert!(err.to_string().contains("$.general.frobnicate"));
    }

    #[test]
    fn test_unknown_top_level_key_rejected() {
        let current = json!({"general": {}});
        let patch = json!({"extra_section": {}});
        assert!(merge_patch(&current, &patch).is_err());
    }

    #[test]
    fn test_leaf_type_change_rejected() {
        let current = json!({"general": {"seconds_per_core_interval": 30}});
        let patch = json!({"general": {"seconds_per_core_interval": false}});
        let err = merge_patch(&current, &patch).unwrap_err();
        assert!(err.to_string().contains("may not change"));
    }

    #[test]
    fn test_nullable_section_can_appear_and_disappear() {
        let current = json!({"helios": null});
        let patch = json!({"helios": {"camera_id": 0}});
        let merged = merge_patch(&current, &patch).unwrap();
        assert_eq!(merged["helios"]["camera_id"], 0);

        let back = merge_patch(&merged, &json!({"helios": null})).unwrap();
        assert!(back["helios"].is_null());
    }

    #[test]
    fn test_arrays_replace_wholesale() {
        let current = json!({"upload": {"streams": [{"is_active": true}]}});
        let patch = json!({"upload": {"streams": []}});
        let merged = merge_patch(&current, &patch).unwrap();
        assert_eq!(merged["upload"]["streams"], json!([]));
    }
}
