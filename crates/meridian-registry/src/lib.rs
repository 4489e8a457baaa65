//! Meridian Registry -- the durable table of known peers.
//!
//! One row per node name. Deleted nodes leave a tombstone so that a stale
//! `ensure` cannot bring them back; only an explicit `restore` does.
//! Every write is pushed, in write order, to registered listeners.

pub mod record;
pub mod routing;
pub mod store;

pub use record::{NodePatch, NodeRecord, Replicates, Subscription};
pub use routing::{should_replicate_to_node, subscription_start_time, table_selection};
pub use store::{Lookup, NodeRegistry, RegistryEvent};

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("corrupt record for {name}: {source}")]
    Corrupt {
        name: String,
        source: serde_json::Error,
    },
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid node name: {0:?}")]
    InvalidName(String),
    #[error("lock poisoned")]
    LockPoisoned,
}

pub type Result<T> = std::result::Result<T, RegistryError>;
