//! Node records and the patch/merge rule.

use chrono::{DateTime, Utc};
use meridian_protocol::{CaInfo, PeerIdentity, SystemInfo, TxnTime};
use serde::{Deserialize, Serialize};

/// How a peer participates in full (all-database) replication.
///
/// On the wire and in JSON this is `true`, `false` or `{"sends": bool}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "ReplicatesRepr", into = "ReplicatesRepr")]
pub enum Replicates {
    /// Bidirectional replication of every database (`true`).
    Full,
    /// Every database, but the peer only sends (`{"sends": true}`).
    SendOnly,
    /// Explicitly not replicating (`false` or `{"sends": false}`).
    Disabled,
}

impl Replicates {
    /// Whether this value turns on replication of every local database.
    pub fn is_active(self) -> bool {
        match self {
            Replicates::Full | Replicates::SendOnly => true,
            Replicates::Disabled => false,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(untagged)]
enum ReplicatesRepr {
    Flag(bool),
    Sends { sends: bool },
}

impl From<ReplicatesRepr> for Replicates {
    fn from(repr: ReplicatesRepr) -> Self {
        match repr {
            ReplicatesRepr::Flag(true) => Replicates::Full,
            ReplicatesRepr::Sends { sends: true } => Replicates::SendOnly,
            ReplicatesRepr::Flag(false) | ReplicatesRepr::Sends { sends: false } => {
                Replicates::Disabled
            }
        }
    }
}

impl From<Replicates> for ReplicatesRepr {
    fn from(r: Replicates) -> Self {
        match r {
            Replicates::Full => ReplicatesRepr::Flag(true),
            Replicates::SendOnly => ReplicatesRepr::Sends { sends: true },
            Replicates::Disabled => ReplicatesRepr::Flag(false),
        }
    }
}

/// Per-database (or per-table) replication intent toward one peer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subscription {
    pub database: String,
    /// `None` covers the whole database.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub table: Option<String>,
    #[serde(default)]
    pub publish: bool,
    #[serde(default)]
    pub subscribe: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<TxnTime>,
}

impl Subscription {
    fn key(&self) -> (&str, Option<&str>) {
        (&self.database, self.table.as_deref())
    }

    /// The same entry as seen from the other side of the link.
    pub fn mirrored(&self) -> Self {
        Self {
            publish: self.subscribe,
            subscribe: self.publish,
            ..self.clone()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeRecord {
    pub name: String,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub subscriptions: Vec<Subscription>,
    #[serde(default)]
    pub replicates: Option<Replicates>,
    #[serde(default)]
    pub shard: Option<u32>,
    /// CA certificate, DER.
    #[serde(with = "meridian_protocol::base64_bytes", default)]
    pub ca: Vec<u8>,
    #[serde(default)]
    pub ca_info: Option<CaInfo>,
    #[serde(default)]
    pub system_info: Option<SystemInfo>,
    #[serde(default)]
    pub revoked_certificates: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl NodeRecord {
    pub fn new(name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            name: name.into(),
            url: None,
            subscriptions: Vec::new(),
            replicates: None,
            shard: None,
            ca: Vec::new(),
            ca_info: None,
            system_info: None,
            revoked_certificates: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// True when the peer takes part in full replication.
    pub fn replicates_fully(&self) -> bool {
        self.replicates.is_some_and(Replicates::is_active)
    }

    /// Merge `patch` into this record.
    ///
    /// Subscriptions merge by `(database, table)`: a patched entry replaces the
    /// stored entry with the same key, new keys are appended in order.
    /// Revoked certificates accumulate without duplicates. Fields absent from
    /// the patch are left alone.
    pub fn apply(&mut self, patch: &NodePatch) {
        if let Some(url) = &patch.url {
            self.url = Some(url.clone());
        }
        if let Some(subs) = &patch.subscriptions {
            for sub in subs {
                match self.subscriptions.iter_mut().find(|s| s.key() == sub.key()) {
                    Some(existing) => *existing = sub.clone(),
                    None => self.subscriptions.push(sub.clone()),
                }
            }
        }
        if let Some(replicates) = patch.replicates {
            self.replicates = Some(replicates);
        }
        if let Some(shard) = patch.shard {
            self.shard = Some(shard);
        }
        if let Some(ca) = &patch.ca {
            self.ca = ca.clone();
        }
        if let Some(info) = &patch.ca_info {
            self.ca_info = Some(info.clone());
        }
        if let Some(info) = &patch.system_info {
            self.system_info = Some(info.clone());
        }
        if let Some(revoked) = &patch.revoked_certificates {
            for serial in revoked {
                if !self.revoked_certificates.contains(serial) {
                    self.revoked_certificates.push(serial.clone());
                }
            }
        }
        self.updated_at = Utc::now();
    }
}

/// Partial update for a node record; `None` fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodePatch {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub subscriptions: Option<Vec<Subscription>>,
    #[serde(default)]
    pub replicates: Option<Replicates>,
    #[serde(default)]
    pub shard: Option<u32>,
    #[serde(default)]
    pub ca: Option<Vec<u8>>,
    #[serde(default)]
    pub ca_info: Option<CaInfo>,
    #[serde(default)]
    pub system_info: Option<SystemInfo>,
    #[serde(default)]
    pub revoked_certificates: Option<Vec<String>>,
}

impl NodePatch {
    /// Patch carrying a peer's self-reported identity.
    pub fn from_identity(identity: &PeerIdentity) -> Self {
        Self {
            url: Some(identity.url.clone()),
            ca: (!identity.ca.is_empty()).then(|| identity.ca.clone()),
            ca_info: identity.ca_info.clone(),
            system_info: identity.system_info.clone(),
            ..Self::default()
        }
    }
}
