// src/config.rs

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid config: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Settings of a `DownloadManager`.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ManagerConfig {
    /// Where completed files are written.
    pub download_dir: PathBuf,
    /// Fallback period of the queue loop when no wake-up arrives.
    pub poll_interval_ms: u64,
    /// Bytes per second over all transfers; 0 is unlimited.
    pub speed_limit: u64,
    pub user_agent: String,
    /// Check `sha256` of a job, when it has one, before saving.
    pub verify_checksums: bool,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            download_dir: PathBuf::from("."),
            poll_interval_ms: 500,
            speed_limit: 0,
            user_agent: concat!("odm-queue/", env!("CARGO_PKG_VERSION")).to_string(),
            verify_checksums: true,
        }
    }
}

impl ManagerConfig {
    pub fn from_json_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json_str(&raw)
    }

    pub fn from_json_str(raw: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(raw)?)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_fields_fall_back_to_defaults() {
        let config = ManagerConfig::from_json_str(r#"{ "download_dir": "/tmp/dl", "speed_limit": 1024 }"#).unwrap();
        assert_eq!(config.download_dir, PathBuf::from("/tmp/dl"));
        assert_eq!(config.speed_limit, 1024);
        assert_eq!(config.poll_interval(), Duration::from_millis(500));
        assert!(config.verify_checksums);
    }

    #[test]
    fn rejects_malformed_json() {
        assert!(matches!(
            ManagerConfig::from_json_str("{ download_dir"),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn reads_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("odm.json");
        std::fs::write(&path, r#"{ "poll_interval_ms": 50 }"#).unwrap();
        let config = ManagerConfig::from_json_file(&path).unwrap();
        assert_eq!(config.poll_interval(), Duration::from_millis(50));
    }
}
