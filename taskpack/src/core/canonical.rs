//! Canonical JSON serialization and content hashing.
//!
//! Canonical form: object keys sorted recursively, two-space indentation and a
//! trailing newline. The output depends only on the structured value, never on
//! struct field order or map iteration order.

use anyhow::{Context, Result};
use serde::Serialize;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

/// Serialize `value` to canonical JSON text.
pub fn to_canonical_string<T: Serialize>(value: &T) -> Result<String> {
    let raw = serde_json::to_value(value).context("serialize to json value")?;
    let sorted = sort_keys(raw);
    let mut out = serde_json::to_string_pretty(&sorted).context("serialize canonical json")?;
    out.push('\n');
    Ok(out)
}

/// Lowercase hex SHA-256 of `bytes`.
pub fn sha256_hex(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    hex::encode(digest)
}

fn sort_keys(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(String, Value)> = map.into_iter().collect();
            entries.sort_by(|a, b| a.0.cmp(&b.0));
            let mut sorted = Map::new();
            for (key, inner) in entries {
                sorted.insert(key, sort_keys(inner));
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.into_iter().map(sort_keys).collect()),
        other => other,
    }
}
