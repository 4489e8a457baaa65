//! Per (peer url, database) replication assignments.

use std::fmt;

use meridian_protocol::{SubscriptionNode, TableSelection, WorkerId};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AssignmentKey {
    pub url: String,
    pub database: String,
}

impl AssignmentKey {
    pub fn new(url: impl Into<String>, database: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            database: database.into(),
        }
    }
}

impl fmt::Display for AssignmentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.url, self.database)
    }
}

/// Connection lifecycle of one assignment.
///
/// ```text
/// Pending -> Assigned -> Connected -> [Disconnected -> Redirected -> Connected]*
/// ```
#[derive(Debug, Clone, PartialEq)]
pub enum LinkState {
    /// Created; the debounce timer has not yet fired.
    Pending,
    /// The worker has been told to subscribe.
    Assigned,
    Connected,
    /// Lost, and no failover target was found.
    Disconnected,
    /// Lost; the primary's origins are being pulled through another assignment.
    /// `merged` names the entries added to the target, withdrawn on reconnect.
    Redirected {
        to: AssignmentKey,
        merged: Vec<String>,
    },
}

impl LinkState {
    pub fn name(&self) -> &'static str {
        match self {
            LinkState::Pending => "pending",
            LinkState::Assigned => "assigned",
            LinkState::Connected => "connected",
            LinkState::Disconnected => "disconnected",
            LinkState::Redirected { .. } => "redirected",
        }
    }

    /// Usable as a failover target.
    pub fn is_live(&self) -> bool {
        matches!(
            self,
            LinkState::Pending | LinkState::Assigned | LinkState::Connected
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Assignment {
    pub key: AssignmentKey,
    /// Owning network worker; `None` runs the subscription in the coordinating process.
    pub worker: Option<WorkerId>,
    /// Origins serviced by this subscription. The first entry is the primary.
    pub nodes: Vec<SubscriptionNode>,
    pub tables: TableSelection,
    pub state: LinkState,
    pub latency_ms: Option<f64>,
}

impl Assignment {
    pub fn new(
        key: AssignmentKey,
        worker: Option<WorkerId>,
        primary: SubscriptionNode,
        tables: TableSelection,
    ) -> Self {
        Self {
            key,
            worker,
            nodes: vec![primary],
            tables,
            state: LinkState::Pending,
            latency_ms: None,
        }
    }

    pub fn primary(&self) -> &str {
        self.nodes.first().map_or("", |n| n.name.as_str())
    }

    pub fn database(&self) -> &str {
        &self.key.database
    }

    pub fn contains(&self, name: &str) -> bool {
        self.nodes.iter().any(|n| n.name == name)
    }

    pub fn is_connected(&self) -> bool {
        self.state == LinkState::Connected
    }
}
