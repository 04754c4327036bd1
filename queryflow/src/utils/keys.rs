//! Content-derived keys for limiter and dedup state.

use serde_json::Value;
use sha2::{Digest, Sha256};

/// Derives a stable key from a params value: the hex-encoded SHA-256 of its
/// JSON serialization.
///
/// Logically identical params always produce the same key, so callers that
/// supply no explicit key still share limiter/cache state per request shape.
#[must_use]
pub fn content_key(params: &Value) -> String {
    let serialized = params.to_string();
    let mut hasher = Sha256::new();
    hasher.update(serialized.as_bytes());
    hex::encode(hasher.finalize())
}
