//! Configuration types for meridian-node.
//! Parsed from ~/.meridian/config.toml.

use meridian_protocol::{ReplicationTiming, DEFAULT_TIMING};
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    #[serde(default)]
    pub node: NodeSection,
    #[serde(default)]
    pub network: NetworkSection,
    #[serde(default)]
    pub replication: ReplicationSection,
    #[serde(default)]
    pub tls: TlsSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSection {
    /// Node name; also the certificate identity.
    #[serde(default = "default_name")]
    pub name: String,
    /// Url peers use to reach this node.
    #[serde(default)]
    pub url: Option<String>,
    /// SQLite file holding the node registry.
    #[serde(default = "default_registry")]
    pub registry: String,
    /// Databases hosted locally.
    #[serde(default)]
    pub databases: Vec<String>,
    #[serde(default = "default_api_addr")]
    pub api_addr: String,
    /// Optional Unix socket serving the same API to local tooling.
    #[serde(default)]
    pub api_socket: Option<String>,
    #[serde(default = "default_token_path")]
    pub token_path: String,
    /// Network-serving replication workers.
    #[serde(default = "default_workers")]
    pub workers: usize,
}

impl Default for NodeSection {
    fn default() -> Self {
        Self {
            name: default_name(),
            url: None,
            registry: default_registry(),
            databases: Vec::new(),
            api_addr: default_api_addr(),
            api_socket: None,
            token_path: default_token_path(),
            workers: default_workers(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkSection {
    /// UDP address of the QUIC replication endpoint.
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
}

impl Default for NetworkSection {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationSection {
    #[serde(default = "default_reconnect_delay")]
    pub reconnect_delay_ms: u64,
    #[serde(default = "default_subscribe_debounce")]
    pub subscribe_debounce_ms: u64,
    #[serde(default = "default_confirm_interval")]
    pub confirm_interval_ms: u64,
    #[serde(default = "default_max_frame")]
    pub max_frame_bytes: usize,
}

impl Default for ReplicationSection {
    fn default() -> Self {
        Self {
            reconnect_delay_ms: default_reconnect_delay(),
            subscribe_debounce_ms: default_subscribe_debounce(),
            confirm_interval_ms: default_confirm_interval(),
            max_frame_bytes: default_max_frame(),
        }
    }
}

impl ReplicationSection {
    /// Protocol timing with the locally overridable fields applied.
    pub fn timing(&self) -> ReplicationTiming {
        ReplicationTiming {
            reconnect_delay_ms: self.reconnect_delay_ms,
            subscribe_debounce_ms: self.subscribe_debounce_ms,
            confirm_interval_ms: self.confirm_interval_ms,
            max_frame_bytes: self.max_frame_bytes,
            ..DEFAULT_TIMING
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TlsSection {
    /// Stored CA and leaf certificate for this node.
    #[serde(default = "default_identity_path")]
    pub identity: String,
}

impl Default for TlsSection {
    fn default() -> Self {
        Self {
            identity: default_identity_path(),
        }
    }
}

// Default value functions
fn default_name() -> String {
    "meridian".into()
}
fn default_registry() -> String {
    "~/.meridian/registry.db".into()
}
fn default_api_addr() -> String {
    "127.0.0.1:9925".into()
}
fn default_token_path() -> String {
    "~/.meridian/node-token".into()
}
fn default_workers() -> usize {
    2
}
fn default_listen_addr() -> String {
    "0.0.0.0:9925".into()
}
fn default_reconnect_delay() -> u64 {
    DEFAULT_TIMING.reconnect_delay_ms
}
fn default_subscribe_debounce() -> u64 {
    DEFAULT_TIMING.subscribe_debounce_ms
}
fn default_confirm_interval() -> u64 {
    DEFAULT_TIMING.confirm_interval_ms
}
fn default_max_frame() -> usize {
    DEFAULT_TIMING.max_frame_bytes
}
fn default_identity_path() -> String {
    "~/.meridian/identity.json".into()
}

impl NodeConfig {
    /// Load config from file, or create default if missing.
    pub fn load_or_default(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: NodeConfig = toml::from_str(&content)?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }

    /// Url advertised to peers; falls back to the API address.
    pub fn advertised_url(&self) -> String {
        self.node
            .url
            .clone()
            .unwrap_or_else(|| format!("http://{}", self.node.api_addr))
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node: NodeSection::default(),
            network: NetworkSection::default(),
            replication: ReplicationSection::default(),
            tls: TlsSection::default(),
        }
    }
}
