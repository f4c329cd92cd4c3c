//! Configuration management for SonicWave nodes.
//!
//! A node is configured from a single TOML file. Every section has defaults,
//! so the smallest useful file is:
//!
//! ```toml
//! [node]
//! node_id = "node-7"
//! ```

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{ConfigError, CoreError};

/// Top-level node configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub node: NodeConfig,
    pub relay: RelayConfig,
    pub fanout: FanoutConfig,
    pub upload: UploadConfig,
    pub udp: UdpConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Identity this node appends to relay paths.
    pub node_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Maximum number of content hashes remembered by the dedup index.
    pub dedup_capacity: usize,
    /// How long a content hash is remembered after it was first seen.
    pub retention_secs: u64,
    /// New packets accepted per sender per minute; `0` disables the limiter.
    pub max_new_per_sender_per_minute: u32,
    /// Maximum number of emergency threads tracked.
    pub thread_capacity: usize,
    /// Period of the dedup/limiter housekeeping task.
    pub maintenance_interval_secs: u64,
    /// Originate an ACK packet into the mesh after a successful upload.
    pub announce_acks: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FanoutConfig {
    /// Upper bound on a single transport send.
    pub send_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UploadConfig {
    pub enabled: bool,
    /// Primary backend URL accepting `POST` of a serialized packet.
    pub endpoint: Option<String>,
    /// Tried in order after the primary endpoint fails.
    pub backup_endpoints: Vec<String>,
    pub request_timeout_secs: u64,
    pub max_attempts: u32,
    pub base_backoff_ms: u64,
    pub max_backoff_ms: u64,
    /// Packets whose thread saw no activity for this long are dropped.
    pub max_age_secs: u64,
    /// Flush period for MEDIUM/LOW packets.
    pub batch_interval_secs: u64,
    pub queue_capacity: usize,
    pub max_in_flight: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UdpConfig {
    pub enabled: bool,
    pub multicast_group: String,
    pub port: u16,
    pub max_datagram_bytes: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter directive used when `RUST_LOG` is unset.
    pub level: String,
    pub json: bool,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_id: "node-001".to_string(),
        }
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            dedup_capacity: 1024,
            retention_secs: 3600,
            max_new_per_sender_per_minute: 10,
            thread_capacity: 512,
            maintenance_interval_secs: 60,
            announce_acks: true,
        }
    }
}

impl Default for FanoutConfig {
    fn default() -> Self {
        Self {
            send_timeout_ms: 5_000,
        }
    }
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            endpoint: None,
            backup_endpoints: Vec::new(),
            request_timeout_secs: 10,
            max_attempts: 8,
            base_backoff_ms: 1_000,
            max_backoff_ms: 60_000,
            max_age_secs: 3600,
            batch_interval_secs: 10,
            queue_capacity: 256,
            max_in_flight: 4,
        }
    }
}

impl Default for UdpConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            multicast_group: "224.1.1.1".to_string(),
            port: 9999,
            max_datagram_bytes: 4096,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

impl Config {
    /// Load and validate a configuration file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, CoreError> {
        let content = std::fs::read_to_string(path)?;
        Ok(Self::from_toml_str(&content)?)
    }

    /// Parse and validate configuration from TOML text.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Configuration with every default and the given node id.
    pub fn for_node(node_id: impl Into<String>) -> Self {
        Self {
            node: NodeConfig {
                node_id: node_id.into(),
            },
            ..Self::default()
        }
    }

    /// Check cross-field constraints that serde cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.node.node_id.trim().is_empty() {
            return Err(invalid("node.node_id", "must not be empty"));
        }
        if self.relay.dedup_capacity == 0 {
            return Err(invalid("relay.dedup_capacity", "must be greater than zero"));
        }
        // Every pending upload pins one dedup entry.
        if self.upload.enabled && self.relay.dedup_capacity <= self.upload.queue_capacity {
            return Err(invalid(
                "relay.dedup_capacity",
                format!(
                    "must exceed upload.queue_capacity ({})",
                    self.upload.queue_capacity
                ),
            ));
        }
        if self.relay.thread_capacity == 0 {
            return Err(invalid("relay.thread_capacity", "must be greater than zero"));
        }
        if self.upload.max_attempts == 0 {
            return Err(invalid("upload.max_attempts", "must be at least 1"));
        }
        if self.upload.base_backoff_ms > self.upload.max_backoff_ms {
            return Err(invalid(
                "upload.base_backoff_ms",
                "must not exceed upload.max_backoff_ms",
            ));
        }
        if self.upload.enabled && self.upload.endpoint.is_none() {
            return Err(invalid("upload.endpoint", "required when upload is enabled"));
        }
        if self.upload.queue_capacity == 0 || self.upload.max_in_flight == 0 {
            return Err(invalid(
                "upload.queue_capacity",
                "queue capacity and max_in_flight must be greater than zero",
            ));
        }
        if self.udp.enabled && self.udp.max_datagram_bytes < 512 {
            return Err(invalid("udp.max_datagram_bytes", "must be at least 512"));
        }
        if self.udp.enabled {
            match self.udp.multicast_group.parse::<std::net::Ipv4Addr>() {
                Ok(group) if group.is_multicast() => {}
                _ => {
                    return Err(invalid(
                        "udp.multicast_group",
                        format!("{} is not an IPv4 multicast address", self.udp.multicast_group),
                    ))
                }
            }
        }
        Ok(())
    }
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_file_uses_defaults() {
        let config = Config::from_toml_str("[node]\nnode_id = \"n1\"\n").unwrap();
        assert_eq!(config.node.node_id, "n1");
        assert_eq!(config.relay.dedup_capacity, 1024);
        assert_eq!(config.udp.multicast_group, "224.1.1.1");
        assert_eq!(config.udp.port, 9999);
        assert!(!config.upload.enabled);
    }

    #[test]
    fn test_upload_requires_endpoint() {
        let err = Config::from_toml_str("[upload]\nenabled = true\n").unwrap_err();
        assert!(err.to_string().contains("upload.endpoint"));
    }

    #[test]
    fn test_dedup_capacity_must_exceed_upload_queue() {
        let toml = r#"
            [relay]
            dedup_capacity = 16

            [upload]
            enabled = true
            endpoint = "http://localhost:8000/api/sos"
            queue_capacity = 16
        "#;
        let err = Config::from_toml_str(toml).unwrap_err();
        assert!(err.to_string().contains("relay.dedup_capacity"));
    }

    #[test]
    fn test_backoff_bounds_checked() {
        let mut config = Config::for_node("n1");
        config.upload.base_backoff_ms = 10_000;
        config.upload.max_backoff_ms = 1_000;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_multicast_group_must_be_multicast() {
        let mut config = Config::for_node("n1");
        config.udp.multicast_group = "10.0.0.1".to_string();
        assert!(config.validate().is_err());
        config.udp.enabled = false;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_empty_node_id_rejected() {
        let config = Config::for_node("  ");
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_from_file_roundtrip() {
        let path = std::env::temp_dir().join(format!(
            "sonicwave-config-{}.toml",
            std::process::id()
        ));
        std::fs::write(
            &path,
            "[node]\nnode_id = \"relay-4\"\n[upload]\nenabled = true\nendpoint = \"http://b/api/sos\"\n",
        )
        .unwrap();
        let config = Config::from_file(&path).unwrap();
        std::fs::remove_file(&path).ok();
        assert_eq!(config.node.node_id, "relay-4");
        assert_eq!(config.upload.endpoint.as_deref(), Some("http://b/api/sos"));
    }
}
