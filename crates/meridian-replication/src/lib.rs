//! Meridian Replication -- streaming committed writes between nodes.
//!
//! A session moves audit entries from a source node to a subscriber over one
//! bidirectional byte stream:
//!   - the subscriber sends SUBSCRIBE naming the database, a start time and
//!     the origin nodes it wants
//!   - the source replays its audit log from that point, then streams live
//!     commits, grouping records of one transaction under a single time
//!   - the subscriber applies each transaction atomically and idempotently and
//!     periodically reports RECEIVED_UP_TO, which feeds the confirmation tracker

pub mod audit;
pub mod confirm;
pub mod decoder;
pub mod encoder;
pub mod source;
pub mod store;
pub mod subscriber;

pub use audit::{AuditEntry, AuditOp, Transaction};
pub use confirm::{ConfirmationError, ConfirmationTracker, ConfirmationWriter, PendingConfirmation};
pub use decoder::TableDecoder;
pub use encoder::TransactionEncoder;
pub use source::serve_subscriber;
pub use store::{AuditStore, MemoryAuditStore};
pub use subscriber::{run_subscription, SubscriptionPlan};

use meridian_protocol::ProtocolError;

#[derive(Debug, thiserror::Error)]
pub enum ReplicationError {
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("store error: {0}")]
    Store(String),
    #[error("record decode error: {0}")]
    Decode(String),
    #[error("frame for unknown table id {0}")]
    UnknownTable(u16),
    #[error("unexpected frame: {0}")]
    UnexpectedFrame(&'static str),
    #[error("subscriber fell behind by {0} commits")]
    Lagged(u64),
}
