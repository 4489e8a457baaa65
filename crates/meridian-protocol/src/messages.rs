//! Control-plane message types.
//!
//! Coordinator <-> worker commands travel over in-process channels; the
//! registration request/response pair travels over the peer HTTP API.

use serde::{Deserialize, Serialize};

use crate::tls::CaInfo;
use crate::{DatabaseName, NodeName, TxnTime};

/// Index of a worker in the worker pool.
pub type WorkerId = usize;

// ============================================================================
// Coordinator -> worker
// ============================================================================

/// One origin node serviced by a subscription.
///
/// The first entry of a subscription's node list is its primary: the peer the
/// worker actually dials. Further entries are origins whose records the
/// primary is asked to forward (failover redirection, self-catchup).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionNode {
    pub name: NodeName,
    /// Where to dial; only meaningful for the primary entry.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<TxnTime>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<TxnTime>,
}

impl SubscriptionNode {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            url: None,
            start_time: None,
            end_time: None,
        }
    }
}

/// Which tables a subscription applies.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TableSelection {
    /// Apply every table unless listed otherwise (full replication).
    pub replicate_by_default: bool,
    /// Explicitly subscribed tables when not replicating by default.
    #[serde(default)]
    pub tables: Vec<String>,
}

impl TableSelection {
    pub fn all() -> Self {
        Self {
            replicate_by_default: true,
            tables: Vec::new(),
        }
    }

    pub fn includes(&self, table: &str) -> bool {
        self.replicate_by_default || self.tables.iter().any(|t| t == table)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerCommand {
    /// Open (or refresh) the subscription for `database` whose primary is `nodes[0]`.
    Subscribe {
        database: DatabaseName,
        nodes: Vec<SubscriptionNode>,
        tables: TableSelection,
    },
    /// Stop the subscription for `database` whose primary is `node`.
    Unsubscribe {
        database: DatabaseName,
        node: NodeName,
    },
    Shutdown,
}

// ============================================================================
// Worker -> coordinator
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerReport {
    Connected {
        database: DatabaseName,
        node: NodeName,
        latency_ms: f64,
    },
    Disconnected {
        database: DatabaseName,
        node: NodeName,
        reason: String,
    },
}

impl WorkerReport {
    pub fn database(&self) -> &str {
        match self {
            WorkerReport::Connected { database, .. }
            | WorkerReport::Disconnected { database, .. } => database,
        }
    }

    pub fn node(&self) -> &str {
        match self {
            WorkerReport::Connected { node, .. } | WorkerReport::Disconnected { node, .. } => node,
        }
    }
}

// ============================================================================
// Peer registration (HTTP)
// ============================================================================

/// Capacity/version snapshot a node reports about itself.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SystemInfo {
    pub version: String,
    #[serde(default)]
    pub databases: Vec<DatabaseName>,
    #[serde(default)]
    pub workers: usize,
}

/// Identity a node presents when registering with a peer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerIdentity {
    pub name: NodeName,
    pub url: String,
    /// CA certificate, DER encoded.
    #[serde(with = "crate::base64_bytes", default)]
    pub ca: Vec<u8>,
    #[serde(default)]
    pub ca_info: Option<CaInfo>,
    #[serde(default)]
    pub system_info: Option<SystemInfo>,
}

/// Sent to `/api/v1/replication/register` by the node running `add_node`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterRequest {
    pub identity: PeerIdentity,
    /// Subscriptions as seen from the receiver: publish/subscribe swapped.
    #[serde(default)]
    pub subscriptions: Option<serde_json::Value>,
    /// Whether the caller fully replicates with the receiver.
    #[serde(default)]
    pub replicates: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterResponse {
    pub identity: PeerIdentity,
}

/// Sent to `/api/v1/replication/remove` when a node drops a peer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoveRequest {
    pub name: NodeName,
}
