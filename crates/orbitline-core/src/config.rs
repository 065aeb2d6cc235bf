//! Configuration structures for orbitline-core.
//!
//! This module defines explicit, serializable configuration objects used by
//! the store and orchestrator to control limits, lock waiting and policy
//! defaults.
//!
//! The core crate itself does not read environment variables or files. All
//! configuration must be provided explicitly by the caller.

use serde::{Deserialize, Serialize};

use crate::errors::{EngineError, EngineResult};

/// Global configuration container.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub limits: LimitsConfig,
    pub locking: LockingConfig,
    pub policy: PolicyConfig,
}

/// Resource and complexity limits applied while parsing an operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// Maximum size of one serialized operation (or batch).
    pub max_operation_bytes: usize,
    /// Maximum number of events in one operation.
    pub max_events: usize,
    /// Maximum nesting depth of `object` values.
    pub max_value_depth: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_operation_bytes: 64 * 1024 * 1024,
            max_events: 500_000,
            max_value_depth: 16,
        }
    }
}

/// Gauge lock acquisition settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LockingConfig {
    /// Bounded wait for the whole lock set of one operation.
    pub timeout_ms: u64,
    /// Retries of an operation that failed with a retryable error.
    pub max_retries: u32,
    /// Base backoff between retries; doubled on every attempt.
    pub backoff_ms: u64,
}

impl Default for LockingConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 30_000,
            max_retries: 3,
            backoff_ms: 200,
        }
    }
}

/// Insertion policy defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    /// Priority assigned to a source that does not declare one.
    pub default_priority: i64,
}

/// Validate a full configuration object.
pub fn validate_config(cfg: &EngineConfig) -> EngineResult<()> {
    if cfg.limits.max_operation_bytes == 0 {
        return Err(EngineError::invariant(
            "max_operation_bytes must be greater than zero",
        ));
    }

    if cfg.limits.max_events == 0 {
        return Err(EngineError::invariant("max_events must be greater than zero"));
    }

    if cfg.limits.max_value_depth == 0 {
        return Err(EngineError::invariant(
            "max_value_depth must be greater than zero",
        ));
    }

    if cfg.locking.timeout_ms == 0 {
        return Err(EngineError::invariant("lock timeout must be greater than zero"));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let cfg = EngineConfig::default();
        validate_config(&cfg).unwrap();
    }

    #[test]
    fn zero_limits_detected() {
        let mut cfg = EngineConfig::default();
        cfg.limits.max_events = 0;
        assert!(validate_config(&cfg).is_err());

        let mut cfg = EngineConfig::default();
        cfg.locking.timeout_ms = 0;
        assert!(validate_config(&cfg).is_err());
    }

    #[test]
    fn partial_json_fills_defaults() {
        let cfg: EngineConfig =
            serde_json::from_str(r#"{"locking":{"timeout_ms":50},"policy":{"default_priority":5}}"#)
                .unwrap();
        assert_eq!(cfg.locking.timeout_ms, 50);
        assert_eq!(cfg.locking.max_retries, 3);
        assert_eq!(cfg.policy.default_priority, 5);
        assert_eq!(cfg.limits.max_operation_bytes, 64 * 1024 * 1024);
    }
}
