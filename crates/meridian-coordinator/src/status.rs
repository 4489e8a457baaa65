//! `cluster_status` report shapes.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterStatus {
    pub node_name: String,
    pub is_enabled: bool,
    pub connections: Vec<NodeConnection>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeConnection {
    pub node_name: String,
    pub url: String,
    pub database_sockets: Vec<DatabaseSocket>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatabaseSocket {
    pub database: String,
    pub connected: bool,
    /// Last observed round trip in milliseconds.
    pub latency: Option<f64>,
    /// Origin nodes the socket currently carries.
    pub nodes: Vec<String>,
    pub state: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redirecting_to: Option<String>,
}

impl ClusterStatus {
    pub fn connection(&self, node_name: &str) -> Option<&NodeConnection> {
        self.connections.iter().find(|c| c.node_name == node_name)
    }
}

impl NodeConnection {
    pub fn socket(&self, database: &str) -> Option<&DatabaseSocket> {
        self.database_sockets.iter().find(|s| s.database == database)
    }
}
