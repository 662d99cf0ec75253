//! Adapter configuration.
//!
//! [`AdapterConfig`] deserializes from JSON with a default for every field,
//! so `{}` is a complete configuration. Durations are stored in milliseconds.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::channel::DEFAULT_PREFIX;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdapterConfig {
    /// Channel prefix shared by every node of one cluster.
    #[serde(default = "default_key")]
    pub key: String,
    /// How long a cluster-wide request waits for its quorum.
    #[serde(default = "default_requests_timeout_ms")]
    pub requests_timeout_ms: u64,
    /// Name of the log collection holding the records.
    #[serde(default = "default_collection_name")]
    pub collection_name: String,
    /// Size cap of the log collection, in bytes.
    #[serde(default = "default_collection_size")]
    pub collection_size: usize,
    /// Presence heartbeat period. `None` disables heartbeats and stale-node
    /// pruning.
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: Option<u64>,
    /// Silence after which a peer is dropped from the quorum.
    #[serde(default = "default_node_timeout_ms")]
    pub node_timeout_ms: u64,
}

fn default_key() -> String {
    DEFAULT_PREFIX.to_string()
}

fn default_requests_timeout_ms() -> u64 {
    5000
}

fn default_collection_name() -> String {
    "socket.io-message-queue".to_string()
}

fn default_collection_size() -> usize {
    1_000_000
}

fn default_heartbeat_interval_ms() -> Option<u64> {
    Some(5000)
}

fn default_node_timeout_ms() -> u64 {
    15000
}

impl Default for AdapterConfig {
    fn default() -> Self {
        Self {
            key: default_key(),
            requests_timeout_ms: default_requests_timeout_ms(),
            collection_name: default_collection_name(),
            collection_size: default_collection_size(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            node_timeout_ms: default_node_timeout_ms(),
        }
    }
}

impl AdapterConfig {
    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json(&text)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.key.is_empty() {
            return Err(ConfigError::Invalid("key must not be empty".into()));
        }
        if self.requests_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "requests_timeout_ms must be positive".into(),
            ));
        }
        if self.collection_size == 0 {
            return Err(ConfigError::Invalid(
                "collection_size must be positive".into(),
            ));
        }
        if let Some(interval) = self.heartbeat_interval_ms {
            if interval == 0 {
                return Err(ConfigError::Invalid(
                    "heartbeat_interval_ms must be positive".into(),
                ));
            }
            if self.node_timeout_ms <= interval {
                return Err(ConfigError::Invalid(format!(
                    "node_timeout_ms ({}) must exceed heartbeat_interval_ms ({interval})",
                    self.node_timeout_ms
                )));
            }
        }
        Ok(())
    }

    pub fn requests_timeout(&self) -> Duration {
        Duration::from_millis(self.requests_timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Option<Duration> {
        self.heartbeat_interval_ms.map(Duration::from_millis)
    }

    pub fn node_timeout(&self) -> Duration {
        Duration::from_millis(self.node_timeout_ms)
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = key.into();
        self
    }

    pub fn with_requests_timeout(mut self, timeout: Duration) -> Self {
        self.requests_timeout_ms = millis(timeout);
        self
    }

    /// Sets the heartbeat period and the silence after which peers are dropped.
    pub fn with_heartbeat(mut self, interval: Duration, node_timeout: Duration) -> Self {
        self.heartbeat_interval_ms = Some(millis(interval));
        self.node_timeout_ms = millis(node_timeout);
        self
    }

    pub fn without_heartbeat(mut self) -> Self {
        self.heartbeat_interval_ms = None;
        self
    }
}

/// Whole milliseconds, saturating at `u64::MAX`.
fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_object_yields_defaults() {
        let config = AdapterConfig::from_json("{}").expect("parse");
        assert_eq!(config, AdapterConfig::default());
        assert_eq!(config.key, "socket.io");
        assert_eq!(config.requests_timeout(), Duration::from_secs(5));
        assert_eq!(config.collection_size, 1_000_000);
    }

    #[test]
    fn explicit_null_disables_heartbeat() {
        let config =
            AdapterConfig::from_json(r#"{"key":"app","heartbeat_interval_ms":null}"#)
                .expect("parse");
        assert_eq!(config.key, "app");
        assert_eq!(config.heartbeat_interval(), None);
    }

    #[test]
    fn validation_rejects_bad_values() {
        assert!(matches!(
            AdapterConfig::from_json(r#"{"key":""}"#),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            AdapterConfig::from_json(r#"{"requests_timeout_ms":0}"#),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            AdapterConfig::from_json(r#"{"heartbeat_interval_ms":100,"node_timeout_ms":50}"#),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            AdapterConfig::from_json("not json"),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn builders_adjust_durations() {
        let config = AdapterConfig::default()
            .with_requests_timeout(Duration::from_millis(250))
            .with_heartbeat(Duration::from_millis(50), Duration::from_millis(200));
        assert_eq!(config.requests_timeout_ms, 250);
        assert_eq!(config.heartbeat_interval(), Some(Duration::from_millis(50)));
        assert!(config.validate().is_ok());
        assert_eq!(config.without_heartbeat().heartbeat_interval_ms, None);
    }

    #[test]
    fn oversized_durations_saturate() {
        let config = AdapterConfig::default()
            .with_requests_timeout(Duration::MAX)
            .with_heartbeat(Duration::from_secs(1), Duration::MAX);
        assert_eq!(config.requests_timeout_ms, u64::MAX);
        assert_eq!(config.node_timeout_ms, u64::MAX);
        assert_eq!(config.heartbeat_interval_ms, Some(1000));
    }
}
