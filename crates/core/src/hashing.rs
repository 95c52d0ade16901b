//! Shared SHA-256 hex digest utilities.
//!
//! Used for `source_ids_hash` (the storage key derived from a source key)
//! and for source row content hashes.

use sha2::{Digest, Sha256};

/// Compute a SHA-256 hex digest of the given bytes.
pub fn sha256_hex(data: &[u8]) -> String {
    let hash = Sha256::digest(data);
    format!("{hash:x}")
}

/// Hash a JSON payload in canonical form.
///
/// `serde_json::Value` objects are backed by a sorted map, so two payloads
/// with the same fields in different insertion order hash identically.
pub fn json_hash(value: &serde_json::Value) -> String {
    sha256_hex(value.to_string().as_bytes())
}
