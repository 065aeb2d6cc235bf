//! Store configuration.
//!
//! A [`StoreConfig`] bundles where the database lives, how long SQLite may
//! wait on a busy database, the engine configuration from `orbitline-core`
//! and logging settings. It can be built in code or read from a JSON file;
//! missing fields take their defaults.

use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::{Deserialize, Serialize};

use orbitline_core::config::{validate_config, EngineConfig};
use orbitline_core::{EngineError, EngineResult};

use crate::logging::LoggingConfig;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Directory holding the database file.
    pub root: PathBuf,
    pub db_file: String,
    /// SQLite busy handler timeout per connection.
    pub busy_timeout_ms: u64,
    pub engine: EngineConfig,
    pub logging: LoggingConfig,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from(".orbitline"),
            db_file: "orbitline.db".to_string(),
            busy_timeout_ms: 5_000,
            engine: EngineConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl StoreConfig {
    /// Defaults rooted at `root`.
    pub fn local_dev(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            ..Self::default()
        }
    }

    /// Read a JSON configuration file.
    pub fn from_json_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
        let cfg: Self =
            serde_json::from_slice(&raw).with_context(|| format!("invalid store config in {}", path.display()))?;
        cfg.validate()
            .with_context(|| format!("rejected store config in {}", path.display()))?;
        Ok(cfg)
    }

    pub fn db_path(&self) -> PathBuf {
        self.root.join(&self.db_file)
    }

    pub fn validate(&self) -> EngineResult<()> {
        if self.db_file.trim().is_empty() {
            return Err(EngineError::invariant("db_file must not be empty"));
        }
        if self.busy_timeout_ms == 0 {
            return Err(EngineError::invariant("busy_timeout_ms must be greater than zero"));
        }
        validate_config(&self.engine)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_dev_points_into_root() {
        let cfg = StoreConfig::local_dev("/tmp/orbitline-test");
        assert_eq!(cfg.db_path(), PathBuf::from("/tmp/orbitline-test/orbitline.db"));
        cfg.validate().unwrap();
    }

    #[test]
    fn json_file_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.json");
        std::fs::write(
            &path,
            r#"{"root": "/data/timeline", "engine": {"locking": {"timeout_ms": 250}}, "logging": {"format": "json"}}"#,
        )
        .unwrap();

        let cfg = StoreConfig::from_json_file(&path).unwrap();
        assert_eq!(cfg.root, PathBuf::from("/data/timeline"));
        assert_eq!(cfg.db_file, "orbitline.db");
        assert_eq!(cfg.engine.locking.timeout_ms, 250);
        assert_eq!(cfg.engine.locking.max_retries, 3);
        assert_eq!(cfg.logging.format, crate::logging::LogFormat::Json);
    }

    #[test]
    fn invalid_file_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.json");
        std::fs::write(&path, r#"{"busy_timeout_ms": 0}"#).unwrap();
        let err = StoreConfig::from_json_file(&path).unwrap_err();
        assert!(format!("{err:#}").contains("busy_timeout_ms"));

        assert!(StoreConfig::from_json_file(dir.path().join("missing.json")).is_err());
    }
}
