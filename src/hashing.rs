//! Hashing - SHA-256 digests for render manifests
//!
//! Canonical JSON makes digests independent of map ordering, so the same
//! rules and inputs always hash the same.

use serde::Serialize;
use serde_json::{to_string, Value};
use sha2::{Digest, Sha256};

pub fn sha256_hex(data: &[u8]) -> String {
    Sha256::digest(data).iter().map(|b| format!("{:02x}", b)).collect()
}

/// Canonical JSON (sorted keys, no whitespace).
pub fn canonical_json<T: Serialize>(value: &T) -> Result<String, serde_json::Error> {
    let v: Value = serde_json::to_value(value)?;
    to_string(&sort_value(&v))
}

fn sort_value(v: &Value) -> Value {
    match v {
        Value::Object(map) => {
            let mut entries: Vec<_> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            Value::Object(entries.into_iter().map(|(k, v)| (k.clone(), sort_value(v))).collect())
        }
        Value::Array(arr) => Value::Array(arr.iter().map(sort_value).collect()),
        _ => v.clone(),
    }
}

pub fn compute_rule_set_hash<T: Serialize>(rules: &T) -> Result<String, serde_json::Error> {
    Ok(sha256_hex(canonical_json(rules)?.as_bytes()))
}

/// render digest = sha256(template_id : rule_set_hash : transformation : engine_version)
pub fn compute_render_digest(
    template_id: &str,
    rule_set_hash: &str,
    transformation: &str,
    engine_version: &str,
) -> String {
    let combined =
        format!("{}:{}:{}:{}", template_id, rule_set_hash, transformation, engine_version);
    sha256_hex(combined.as_bytes())
}
