//! Deterministic hashing of operations.
//!
//! Every committed or failed source records the digest of the operation it
//! came from, so operators can tell whether two submissions carried the same
//! content. The digest is:
//! - SHA-256 over the canonical JSON bytes
//! - rendered as lowercase hex
//!
//! Canonical JSON here means object keys sorted and no insignificant
//! whitespace. `serde_json::Map` is ordered by key in this workspace (the
//! `preserve_order` feature is never enabled), so compact serialization of a
//! `serde_json::Value` is canonical.

use sha2::{Digest, Sha256};

use crate::errors::{EngineError, EngineResult};

/// Hash raw bytes with SHA-256.
pub fn hash_bytes(bytes: &[u8]) -> Vec<u8> {
    let mut h = Sha256::new();
    h.update(bytes);
    h.finalize().to_vec()
}

/// Hash raw bytes and return lowercase hex string.
pub fn hash_bytes_hex(bytes: &[u8]) -> String {
    hex::encode(hash_bytes(bytes))
}

/// Canonical JSON bytes of a value.
pub fn canonical_json_bytes(value: &serde_json::Value) -> EngineResult<Vec<u8>> {
    serde_json::to_vec(value)
        .map_err(|e| EngineError::invariant(format!("failed to serialize JSON: {e}")))
}

/// Digest of one operation's JSON.
pub fn operation_digest(value: &serde_json::Value) -> EngineResult<String> {
    Ok(hash_bytes_hex(&canonical_json_bytes(value)?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_bytes_stable() {
        assert_eq!(hash_bytes_hex(b"abc"), hash_bytes_hex(b"abc"));
        assert_eq!(
            hash_bytes_hex(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn digest_ignores_key_order_and_whitespace() {
        let a: serde_json::Value = serde_json::from_str(r#"{"b": 1, "a": [1, 2]}"#).unwrap();
        let b: serde_json::Value = serde_json::from_str(r#"{"a":[1,2],"b":1}"#).unwrap();
        assert_eq!(operation_digest(&a).unwrap(), operation_digest(&b).unwrap());

        let c: serde_json::Value = serde_json::from_str(r#"{"a":[2,1],"b":1}"#).unwrap();
        assert_ne!(operation_digest(&a).unwrap(), operation_digest(&c).unwrap());
    }
}
