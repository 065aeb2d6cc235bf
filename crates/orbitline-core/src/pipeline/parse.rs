//! Parsing of submitted operation bytes.
//!
//! Core crate avoids filesystem/network I/O. Parsing helpers in this module operate on:
//! - in-memory bytes
//! - in-memory JSON values
//!
//! This module provides:
//! - strict JSON parsing with size limits
//! - shape detection (single operation or `{"operations": [...]}` batch)
//! - per-operation decoding, so one malformed entry does not sink its batch
//! - a best-effort source identity for operations that fail to decode, used
//!   for the failure audit record

use serde_json::Value;

use crate::config::LimitsConfig;
use crate::determinism::hashing::operation_digest;
use crate::errors::{EngineError, EngineResult};
use crate::model::wire::WireOperation;
use crate::model::SourceIdentity;
use crate::pipeline::Submitted;

/// Input shape classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadKind {
    Operation,
    Batch,
    Unknown,
}

/// One entry of a parsed payload.
#[derive(Debug)]
pub struct ParsedOperation {
    /// Position inside the batch.
    pub index: usize,
    pub result: EngineResult<Submitted>,
    /// Identity read from the raw JSON, when it can be.
    pub hint: Option<SourceIdentity>,
}

/// Parse JSON bytes into `serde_json::Value` with a hard size limit.
pub fn parse_json_bytes(bytes: &[u8], max_bytes: usize) -> EngineResult<Value> {
    if bytes.len() > max_bytes {
        return Err(EngineError::parsing(format!(
            "payload too large ({} bytes > limit {})",
            bytes.len(),
            max_bytes
        )));
    }

    serde_json::from_slice(bytes).map_err(|e| EngineError::parsing(format!("failed to parse JSON: {e}")))
}

/// Detect whether a payload is one operation or a batch.
///
/// - batch: object with an `operations` array
/// - operation: object with `dim_signature` and `source`
pub fn detect_kind(v: &Value) -> PayloadKind {
    let obj = match v.as_object() {
        Some(o) => o,
        None => return PayloadKind::Unknown,
    };

    if obj.get("operations").map(Value::is_array).unwrap_or(false) {
        return PayloadKind::Batch;
    }

    if obj.contains_key("dim_signature") && obj.contains_key("source") {
        return PayloadKind::Operation;
    }

    PayloadKind::Unknown
}

/// Parse a payload into its operations.
///
/// Errors that concern the whole payload (size, invalid JSON, unknown shape)
/// are returned directly. Errors of one entry are reported in that entry.
pub fn parse_operations(bytes: &[u8], limits: &LimitsConfig) -> EngineResult<Vec<ParsedOperation>> {
    let v = parse_json_bytes(bytes, limits.max_operation_bytes)?;
    split_payload(v)
}

/// Same as [`parse_operations`] for an already decoded value.
pub fn split_payload(v: Value) -> EngineResult<Vec<ParsedOperation>> {
    let entries = match detect_kind(&v) {
        PayloadKind::Operation => vec![v],
        PayloadKind::Batch => match v {
            Value::Object(mut obj) => match obj.remove("operations") {
                Some(Value::Array(items)) => items,
                _ => Vec::new(),
            },
            _ => Vec::new(),
        },
        PayloadKind::Unknown => {
            return Err(EngineError::parsing(
                "payload is neither an operation nor an {\"operations\": [...]} batch",
            ))
        }
    };

    Ok(entries
        .into_iter()
        .enumerate()
        .map(|(index, entry)| {
            let hint = identity_hint(&entry);
            ParsedOperation {
                index,
                result: decode_operation(entry),
                hint,
            }
        })
        .collect())
}

/// Decode one operation value and compute its digest.
pub fn decode_operation(v: Value) -> EngineResult<Submitted> {
    let digest = operation_digest(&v)?;
    let wire: WireOperation = serde_json::from_value(v)
        .map_err(|e| EngineError::parsing(format!("failed to decode operation: {e}")))?;
    Ok(Submitted { wire, digest })
}

/// Read `source.name` and `dim_signature.{name, exec, version}` if present.
pub fn identity_hint(v: &Value) -> Option<SourceIdentity> {
    let text = |ptr: &str| v.pointer(ptr).and_then(Value::as_str).map(str::to_string);
    Some(SourceIdentity {
        name: text("/source/name")?,
        dim_signature: text("/dim_signature/name")?,
        processor: text("/dim_signature/exec")?,
        version: text("/dim_signature/version")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ErrorKind;
    use assert_matches::assert_matches;

    fn op_json(name: &str) -> Value {
        serde_json::json!({
            "dim_signature": {"name": "S2A_PLAN", "exec": "ingest_nppf", "version": "1.0"},
            "source": {"name": name, "generation_time": "2018-06-05T02:07:03"}
        })
    }

    #[test]
    fn single_operation_is_detected() {
        let bytes = serde_json::to_vec(&op_json("A.xml")).unwrap();
        let parsed = parse_operations(&bytes, &LimitsConfig::default()).unwrap();
        assert_eq!(parsed.len(), 1);
        let sub = parsed[0].result.as_ref().unwrap();
        assert_eq!(sub.wire.source.name, "A.xml");
        assert_eq!(sub.digest.len(), 64);
    }

    #[test]
    fn batch_entries_fail_independently() {
        let payload = serde_json::json!({
            "operations": [op_json("A.xml"), {"source": {"name": "B.xml"}}, op_json("C.xml")]
        });
        let parsed = split_payload(payload).unwrap();
        assert_eq!(parsed.len(), 3);
        assert!(parsed[0].result.is_ok());
        assert_matches!(&parsed[1].result, Err(EngineError::ErrorParsingDictionary { .. }));
        assert!(parsed[1].hint.is_none());
        assert!(parsed[2].result.is_ok());
        assert_eq!(parsed[2].index, 2);
    }

    #[test]
    fn hint_survives_decode_failure() {
        let mut v = op_json("A.xml");
        v["events"] = serde_json::json!("not a list");
        let parsed = split_payload(v).unwrap();
        assert!(parsed[0].result.is_err());
        assert_eq!(parsed[0].hint.as_ref().map(|h| h.name.as_str()), Some("A.xml"));
    }

    #[test]
    fn size_limit_and_garbage_are_parsing_errors() {
        let limits = LimitsConfig {
            max_operation_bytes: 4,
            ..LimitsConfig::default()
        };
        let err = parse_operations(br#"{"a": 1}"#, &limits).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ErrorParsingDictionary);
        assert!(err.to_string().contains("too large"));

        let err = parse_operations(b"{not json", &LimitsConfig::default()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ErrorParsingDictionary);

        let err = parse_operations(b"[1, 2]", &LimitsConfig::default()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ErrorParsingDictionary);
    }
}
