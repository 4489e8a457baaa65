//! Meridian Protocol -- replication wire format, worker messages, TLS identities.
//!
//! One bidirectional stream per (peer, database) replication session.
//! Every frame is a 4-byte big-endian length prefix followed by a binary body.
//! Subscriber -> source frames start with an opcode; source -> subscriber
//! frames start with an 8-byte transaction time (negative = control frame).

pub mod codec;
pub mod frame;
pub mod messages;
pub mod timing;
pub mod tls;

pub use codec::{FrameCodec, SourceCodec, SubscriberCodec};
pub use frame::{
    DownstreamFrame, RecordPayload, RequestedNode, SubscribeRequest, TableStructure,
    UpstreamFrame, WireFrame,
};
pub use messages::*;
pub use timing::{ReplicationTiming, DEFAULT_TIMING};
pub use tls::{CaInfo, ConnectionIdentity, IdentityProvider, LocalIdentity};

/// Subscriber asks the source to stream a database.
pub const SUBSCRIBE: u8 = 129;

/// Source announces the name of a table id.
pub const SEND_TABLE_NAME: u8 = 130;

/// Source announces the primary key and attribute list of a table id.
pub const SEND_TABLE_STRUCTURE: u8 = 131;

/// Source announces the record-shape dictionary (field order) of a table id.
pub const SEND_TABLE_FIXED_STRUCTURE: u8 = 132;

/// Subscriber reports the latest transaction time it has applied.
pub const RECEIVED_UP_TO: u8 = 133;

/// Transaction time carried by out-of-band control frames.
pub const CONTROL_TIME: f64 = -1.0;

/// Maximum frame size (sourced from the default timing table).
pub const MAX_FRAME_BYTES: usize = DEFAULT_TIMING.max_frame_bytes;

/// Database name (opaque string, at most 255 bytes on the wire).
pub type DatabaseName = String;

/// Node name; equals the node's certificate identity.
pub type NodeName = String;

/// Logical commit timestamp (milliseconds since the Unix epoch).
pub type TxnTime = f64;

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: usize, max: usize },
    #[error("truncated frame: needed {needed} more bytes for {field}")]
    Truncated { field: &'static str, needed: usize },
    #[error("unexpected opcode {0}")]
    UnexpectedOpcode(u8),
    #[error("database name too long: {0} bytes")]
    NameTooLong(usize),
    #[error("{field} of {len} does not fit its length prefix")]
    LengthOverflow { field: &'static str, len: usize },
    #[error("invalid utf-8 in {0}")]
    InvalidUtf8(&'static str),
    #[error("prefix of {shared} bytes exceeds previous payload of {previous} bytes")]
    BadPrefix { shared: usize, previous: usize },
    #[error("tls error: {0}")]
    Tls(String),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Serde helper: `Vec<u8>` as a standard base64 string.
pub mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD, Engine};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        STANDARD.decode(&s).map_err(serde::de::Error::custom)
    }
}
