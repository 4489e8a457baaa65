//! Frame bodies for both directions of a replication session.
//!
//! Upstream (subscriber -> source):
//!   SUBSCRIBE       [129, u8 len, database, f64 start_time] [u16 n, n x node]?
//!   RECEIVED_UP_TO  [133, f64 time]
//!
//! Downstream (source -> subscriber):
//!   transaction     [f64 txn_time >= 0, u32 n, n x record]
//!   control         [f64 -1, opcode, ...]
//!
//! A record is `[u16 table_id, u16 shared, u32 len, suffix]`: the first
//! `shared` bytes of its payload equal the start of the previous record's
//! payload in the same transaction and are not repeated on the wire.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::{
    ProtocolError, TxnTime, CONTROL_TIME, RECEIVED_UP_TO, SEND_TABLE_FIXED_STRUCTURE,
    SEND_TABLE_NAME, SEND_TABLE_STRUCTURE, SUBSCRIBE,
};

/// Encoding of a missing `end_time` in a requested node entry.
const OPEN_END: f64 = -1.0;

/// A frame body that knows its own binary layout.
pub trait WireFrame: Sized {
    fn encode_body(&self, dst: &mut BytesMut) -> Result<(), ProtocolError>;
    fn decode_body(src: Bytes) -> Result<Self, ProtocolError>;
}

/// One origin node whose records the subscriber wants from this source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestedNode {
    pub name: String,
    pub start_time: TxnTime,
    /// Exclusive upper bound; `None` keeps the stream open.
    pub end_time: Option<TxnTime>,
}

/// Handshake sent once by the subscribing side.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscribeRequest {
    pub database: String,
    /// Replay everything committed at or after this time; 0 = from the beginning.
    pub start_time: TxnTime,
    /// Origins to stream. Empty means "the source's own records from `start_time`".
    #[serde(default)]
    pub nodes: Vec<RequestedNode>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum UpstreamFrame {
    Subscribe(SubscribeRequest),
    ReceivedUpTo(TxnTime),
}

/// Table description sent with SEND_TABLE_STRUCTURE.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TableStructure {
    pub primary_key: String,
    pub attributes: Vec<String>,
}

/// One already-encoded audit entry belonging to a transaction.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordPayload {
    pub table_id: u16,
    pub payload: Bytes,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DownstreamFrame {
    Transaction {
        txn_time: TxnTime,
        records: Vec<RecordPayload>,
    },
    TableName {
        table_id: u16,
        name: String,
    },
    TableStructure {
        table_id: u16,
        structure: TableStructure,
    },
    TableFixedStructure {
        table_id: u16,
        fields: Vec<String>,
    },
}

// ============================================================================
// Primitive readers/writers
// ============================================================================

fn need(src: &Bytes, n: usize, field: &'static str) -> Result<(), ProtocolError> {
    if src.remaining() < n {
        return Err(ProtocolError::Truncated {
            field,
            needed: n - src.remaining(),
        });
    }
    Ok(())
}

fn get_u8(src: &mut Bytes, field: &'static str) -> Result<u8, ProtocolError> {
    need(src, 1, field)?;
    Ok(src.get_u8())
}

fn get_u16(src: &mut Bytes, field: &'static str) -> Result<u16, ProtocolError> {
    need(src, 2, field)?;
    Ok(src.get_u16())
}

fn get_u32(src: &mut Bytes, field: &'static str) -> Result<u32, ProtocolError> {
    need(src, 4, field)?;
    Ok(src.get_u32())
}

fn get_f64(src: &mut Bytes, field: &'static str) -> Result<f64, ProtocolError> {
    need(src, 8, field)?;
    Ok(src.get_f64())
}

fn get_bytes(src: &mut Bytes, len: usize, field: &'static str) -> Result<Bytes, ProtocolError> {
    need(src, len, field)?;
    Ok(src.split_to(len))
}

fn get_str16(src: &mut Bytes, field: &'static str) -> Result<String, ProtocolError> {
    let len = get_u16(src, field)? as usize;
    let raw = get_bytes(src, len, field)?;
    String::from_utf8(raw.to_vec()).map_err(|_| ProtocolError::InvalidUtf8(field))
}

fn put_str16(dst: &mut BytesMut, s: &str) -> Result<(), ProtocolError> {
    let len = u16::try_from(s.len()).map_err(|_| ProtocolError::NameTooLong(s.len()))?;
    dst.put_u16(len);
    dst.put_slice(s.as_bytes());
    Ok(())
}

fn put_len16(dst: &mut BytesMut, len: usize, field: &'static str) -> Result<(), ProtocolError> {
    let len = u16::try_from(len).map_err(|_| ProtocolError::LengthOverflow { field, len })?;
    dst.put_u16(len);
    Ok(())
}

fn put_len32(dst: &mut BytesMut, len: usize, field: &'static str) -> Result<(), ProtocolError> {
    let len = u32::try_from(len).map_err(|_| ProtocolError::LengthOverflow { field, len })?;
    dst.put_u32(len);
    Ok(())
}

fn shared_prefix(a: &[u8], b: &[u8]) -> usize {
    a.iter()
        .zip(b.iter())
        .take(u16::MAX as usize)
        .take_while(|(x, y)| x == y)
        .count()
}

// ============================================================================
// Upstream
// ============================================================================

impl WireFrame for UpstreamFrame {
    fn encode_body(&self, dst: &mut BytesMut) -> Result<(), ProtocolError> {
        match self {
            UpstreamFrame::Subscribe(req) => {
                let name = req.database.as_bytes();
                let len =
                    u8::try_from(name.len()).map_err(|_| ProtocolError::NameTooLong(name.len()))?;
                dst.put_u8(SUBSCRIBE);
                dst.put_u8(len);
                dst.put_slice(name);
                dst.put_f64(req.start_time);
                if !req.nodes.is_empty() {
                    put_len16(dst, req.nodes.len(), "node count")?;
                    for node in &req.nodes {
                        put_str16(dst, &node.name)?;
                        dst.put_f64(node.start_time);
                        dst.put_f64(node.end_time.unwrap_or(OPEN_END));
                    }
                }
            }
            UpstreamFrame::ReceivedUpTo(time) => {
                dst.put_u8(RECEIVED_UP_TO);
                dst.put_f64(*time);
            }
        }
        Ok(())
    }

    fn decode_body(mut src: Bytes) -> Result<Self, ProtocolError> {
        match get_u8(&mut src, "opcode")? {
            SUBSCRIBE => {
                let len = get_u8(&mut src, "database length")? as usize;
                let raw = get_bytes(&mut src, len, "database")?;
                let database = String::from_utf8(raw.to_vec())
                    .map_err(|_| ProtocolError::InvalidUtf8("database"))?;
                let start_time = get_f64(&mut src, "start time")?;

                // Older subscribers stop here; the node list is optional.
                let mut nodes = Vec::new();
                if src.has_remaining() {
                    let count = get_u16(&mut src, "node count")?;
                    for _ in 0..count {
                        let name = get_str16(&mut src, "node name")?;
                        let start_time = get_f64(&mut src, "node start time")?;
                        let end = get_f64(&mut src, "node end time")?;
                        nodes.push(RequestedNode {
                            name,
                            start_time,
                            end_time: (end >= 0.0).then_some(end),
                        });
                    }
                }
                Ok(UpstreamFrame::Subscribe(SubscribeRequest {
                    database,
                    start_time,
                    nodes,
                }))
            }
            RECEIVED_UP_TO => Ok(UpstreamFrame::ReceivedUpTo(get_f64(
                &mut src,
                "received time",
            )?)),
            other => Err(ProtocolError::UnexpectedOpcode(other)),
        }
    }
}

// ============================================================================
// Downstream
// ============================================================================

impl WireFrame for DownstreamFrame {
    fn encode_body(&self, dst: &mut BytesMut) -> Result<(), ProtocolError> {
        match self {
            DownstreamFrame::Transaction { txn_time, records } => {
                dst.put_f64(*txn_time);
                put_len32(dst, records.len(), "record count")?;
                let mut previous: &[u8] = &[];
                for record in records {
                    let shared = shared_prefix(previous, &record.payload);
                    let suffix = &record.payload[shared..];
                    dst.put_u16(record.table_id);
                    put_len16(dst, shared, "shared prefix")?;
                    put_len32(dst, suffix.len(), "record length")?;
                    dst.put_slice(suffix);
                    previous = &record.payload;
                }
            }
            DownstreamFrame::TableName { table_id, name } => {
                dst.put_f64(CONTROL_TIME);
                dst.put_u8(SEND_TABLE_NAME);
                dst.put_u16(*table_id);
                put_str16(dst, name)?;
            }
            DownstreamFrame::TableStructure {
                table_id,
                structure,
            } => {
                let json = serde_json::to_vec(structure)?;
                dst.put_f64(CONTROL_TIME);
                dst.put_u8(SEND_TABLE_STRUCTURE);
                dst.put_u16(*table_id);
                put_len32(dst, json.len(), "table structure")?;
                dst.put_slice(&json);
            }
            DownstreamFrame::TableFixedStructure { table_id, fields } => {
                dst.put_f64(CONTROL_TIME);
                dst.put_u8(SEND_TABLE_FIXED_STRUCTURE);
                dst.put_u16(*table_id);
                put_len16(dst, fields.len(), "field count")?;
                for field in fields {
                    put_str16(dst, field)?;
                }
            }
        }
        Ok(())
    }

    fn decode_body(mut src: Bytes) -> Result<Self, ProtocolError> {
        let time = get_f64(&mut src, "transaction time")?;
        if time >= 0.0 {
            let count = get_u32(&mut src, "record count")?;
            let mut records: Vec<RecordPayload> = Vec::new();
            for _ in 0..count {
                let table_id = get_u16(&mut src, "table id")?;
                let shared = get_u16(&mut src, "shared prefix")? as usize;
                let len = get_u32(&mut src, "record length")? as usize;
                let suffix = get_bytes(&mut src, len, "record payload")?;

                let payload = if shared == 0 {
                    suffix
                } else {
                    let previous = records.last().map(|r| &r.payload[..]).unwrap_or(&[]);
                    if shared > previous.len() {
                        return Err(ProtocolError::BadPrefix {
                            shared,
                            previous: previous.len(),
                        });
                    }
                    let mut full = BytesMut::with_capacity(shared + suffix.len());
                    full.put_slice(&previous[..shared]);
                    full.put_slice(&suffix);
                    full.freeze()
                };
                records.push(RecordPayload { table_id, payload });
            }
            return Ok(DownstreamFrame::Transaction {
                txn_time: time,
                records,
            });
        }

        match get_u8(&mut src, "control opcode")? {
            SEND_TABLE_NAME => {
                let table_id = get_u16(&mut src, "table id")?;
                let name = get_str16(&mut src, "table name")?;
                Ok(DownstreamFrame::TableName { table_id, name })
            }
            SEND_TABLE_STRUCTURE => {
                let table_id = get_u16(&mut src, "table id")?;
                let len = get_u32(&mut src, "structure length")? as usize;
                let json = get_bytes(&mut src, len, "structure")?;
                let structure = serde_json::from_slice(&json)?;
                Ok(DownstreamFrame::TableStructure {
                    table_id,
                    structure,
                })
            }
            SEND_TABLE_FIXED_STRUCTURE => {
                let table_id = get_u16(&mut src, "table id")?;
                let count = get_u16(&mut src, "field count")?;
                let fields = (0..count)
                    .map(|_| get_str16(&mut src, "field name"))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(DownstreamFrame::TableFixedStructure { table_id, fields })
            }
            other => Err(ProtocolError::UnexpectedOpcode(other)),
        }
    }
}
