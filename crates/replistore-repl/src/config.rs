//! Configuration for the coordinator, replicas and the `replistore` binary.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use replistore_transport::tcp::DEFAULT_MAX_FRAME_BYTES;
use replistore_transport::{TcpTransport, TcpTransportConfig};

use crate::registry::RegistryConfig;

/// Coordinator and registry settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Port the coordinator listens on for clients.
    pub tcp_port: u16,
    /// Host the coordinator dials replicas on.
    pub replica_host: String,
    /// Seconds between health sweeps.
    pub health_check_interval_secs: u64,
    /// A member not seen for this long gets pinged.
    pub stale_after_secs: u64,
    /// Seconds to wait for a pong before evicting.
    pub health_check_timeout_secs: u64,
    /// Dial timeout towards replicas.
    pub connect_timeout_ms: u64,
    /// Whether eviction also removes the node from the durable alive-set.
    pub purge_durable_on_evict: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            tcp_port: 3000,
            replica_host: String::from("127.0.0.1"),
            health_check_interval_secs: 300,
            stale_after_secs: 600,
            health_check_timeout_secs: 5,
            connect_timeout_ms: 5000,
            purge_durable_on_evict: true,
        }
    }
}

impl ServerConfig {
    /// Registry timing derived from this config.
    pub fn registry_config(&self) -> RegistryConfig {
        RegistryConfig {
            health_check_interval: Duration::from_secs(self.health_check_interval_secs),
            stale_after: Duration::from_secs(self.stale_after_secs),
            health_check_timeout: Duration::from_secs(self.health_check_timeout_secs),
            purge_durable_on_evict: self.purge_durable_on_evict,
        }
    }

    /// Transport used to dial replicas.
    pub fn transport(&self) -> TcpTransport {
        TcpTransport::new(TcpTransportConfig {
            connect_timeout_ms: self.connect_timeout_ms,
            ..TcpTransportConfig::default()
        })
    }
}

/// Settings of one storage replica.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Fixed node id; a random one is generated when absent.
    pub node_id: Option<String>,
    /// Port to listen on (0 picks a free port).
    pub port: u16,
    /// Interface to bind.
    pub bind_host: String,
    /// Host other replicas are reached on during catch-up.
    pub peer_host: String,
    /// Root of `uploads/`, `logs/` and `backups/`.
    pub data_dir: PathBuf,
    /// Dial timeout towards the predecessor.
    pub connect_timeout_ms: u64,
    /// Largest frame accepted from clients, the coordinator or a predecessor.
    pub max_frame_bytes: u64,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_id: None,
            port: 4000,
            bind_host: String::from("0.0.0.0"),
            peer_host: String::from("127.0.0.1"),
            data_dir: PathBuf::from("/var/lib/replistore/node"),
            connect_timeout_ms: 5000,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
        }
    }
}

impl NodeConfig {
    /// Transport used to dial the predecessor.
    pub fn transport(&self) -> TcpTransport {
        TcpTransport::new(TcpTransportConfig {
            connect_timeout_ms: self.connect_timeout_ms,
            max_frame_bytes: self.max_frame_bytes,
            ..TcpTransportConfig::default()
        })
    }
}

/// Everything `replistore serve` runs in one process.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    /// Coordinator settings.
    pub server: ServerConfig,
    /// Replicas started alongside the coordinator.
    pub nodes: Vec<NodeConfig>,
}

impl ClusterConfig {
    /// Load from a `.toml` or `.json` file.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        match ext.to_lowercase().as_str() {
            "toml" => {
                let config: ClusterConfig = toml::from_str(&contents)?;
                Ok(config)
            }
            "json" => {
                let config: ClusterConfig = serde_json::from_str(&contents)?;
                Ok(config)
            }
            _ => anyhow::bail!("Unsupported config file extension: {}", ext),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_values() {
        let config = ServerConfig::default();
        assert_eq!(config.health_check_interval_secs, 300);
        assert_eq!(config.stale_after_secs, 600);
        assert_eq!(config.health_check_timeout_secs, 5);
        assert!(config.purge_durable_on_evict);

        let node = NodeConfig::default();
        assert!(node.node_id.is_none());
        assert_eq!(node.peer_host, "127.0.0.1");
    }

    #[test]
    fn test_registry_config_durations() {
        let config = ServerConfig {
            health_check_interval_secs: 2,
            stale_after_secs: 3,
            health_check_timeout_secs: 1,
            purge_durable_on_evict: false,
            ..ServerConfig::default()
        };
        let registry = config.registry_config();
        assert_eq!(registry.health_check_interval, Duration::from_secs(2));
        assert_eq!(registry.stale_after, Duration::from_secs(3));
        assert_eq!(registry.health_check_timeout, Duration::from_secs(1));
        assert!(!registry.purge_durable_on_evict);
    }

    #[test]
    fn test_from_file_toml() {
        let mut file = NamedTempFile::with_suffix(".toml").unwrap();
        writeln!(
            file,
            r#"
[server]
tcp_port = 7000
replica_host = "10.0.0.5"
purge_durable_on_evict = false

[[nodes]]
node_id = "r1"
port = 7101
data_dir = "/data/r1"

[[nodes]]
port = 7102
data_dir = "/data/r2"
            "#
        )
        .unwrap();

        let config = ClusterConfig::from_file(file.path()).unwrap();
        assert_eq!(config.server.tcp_port, 7000);
        assert_eq!(config.server.replica_host, "10.0.0.5");
        assert!(!config.server.purge_durable_on_evict);
        assert_eq!(config.server.stale_after_secs, 600);
        assert_eq!(config.nodes.len(), 2);
        assert_eq!(config.nodes[0].node_id.as_deref(), Some("r1"));
        assert_eq!(config.nodes[1].node_id, None);
        assert_eq!(config.nodes[1].data_dir, PathBuf::from("/data/r2"));
        assert_eq!(config.nodes[1].max_frame_bytes, DEFAULT_MAX_FRAME_BYTES);
        assert_eq!(config.nodes[1].transport().config().max_frame_bytes, DEFAULT_MAX_FRAME_BYTES);
    }

    #[test]
    fn test_from_file_json() {
        let mut file = NamedTempFile::with_suffix(".json").unwrap();
        writeln!(
            file,
            r#"{{
                "server": {{ "tcp_port": 7500, "health_check_timeout_secs": 2 }},
                "nodes": [{{ "port": 7600, "data_dir": "/tmp/n1" }}]
            }}"#
        )
        .unwrap();

        let config = ClusterConfig::from_file(file.path()).unwrap();
        assert_eq!(config.server.tcp_port, 7500);
        assert_eq!(config.server.health_check_timeout_secs, 2);
        assert_eq!(config.nodes[0].port, 7600);
    }

    #[test]
    fn test_unsupported_extension() {
        let file = NamedTempFile::with_suffix(".yaml").unwrap();
        assert!(ClusterConfig::from_file(file.path()).is_err());
    }

    #[test]
    fn test_serialization_round_trip() {
        let config = ClusterConfig {
            server: ServerConfig {
                tcp_port: 9000,
                ..ServerConfig::default()
            },
            nodes: vec![NodeConfig {
                node_id: Some(String::from("n1")),
                ..NodeConfig::default()
            }],
        };
        let json = serde_json::to_string(&config).unwrap();
        let decoded: ClusterConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(config, decoded);
    }
}
