//! Stable hashing of stage inputs.

use sha2::{Digest, Sha256};

/// Hashes a JSON value into a short hex digest.
///
/// Object keys serialize in sorted order, so equal inputs hash equally
/// regardless of the order fields were inserted.
#[must_use]
pub fn hash_input(input: &serde_json::Value) -> String {
    let json = serde_json::to_string(input).unwrap_or_default();
    let mut hasher = Sha256::new();
    hasher.update(json.as_bytes());
    let result = hasher.finalize();
    hex::encode(&result[..16])
}

/// Builds an idempotency key from components.
#[must_use]
pub fn idempotency_key(components: &[&str]) -> String {
    let combined = components.join(":");
    let mut hasher = Sha256::new();
    hasher.update(combined.as_bytes());
    let result = hasher.finalize();
    format!("idem:{}", hex::encode(&result[..16]))
}
