//! Audit entries and their record payload encoding.
//!
//! Payload layout: `[op u8][origin str16][key str16][values]` where `values`
//! is a JSON array of `[field_index, value]` pairs indexed into the table's
//! fixed-structure dictionary. Origin and key come first so consecutive
//! entries from one origin share a long prefix.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use meridian_protocol::TxnTime;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::ReplicationError;

const OP_PUT: u8 = 1;
const OP_DELETE: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuditOp {
    Put,
    Delete,
}

/// One committed write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub table: String,
    pub key: String,
    /// Node where the write was first committed.
    pub origin: String,
    /// Transaction time; doubles as the record version for last-writer-wins.
    pub version: TxnTime,
    pub op: AuditOp,
    /// Record body for puts; empty for deletes.
    #[serde(default)]
    pub record: Map<String, Value>,
}

/// All entries committed together at one transaction time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub txn_time: TxnTime,
    pub entries: Vec<AuditEntry>,
}

impl Transaction {
    /// Group entries (already sorted by version) into transactions.
    pub fn group(entries: Vec<AuditEntry>) -> Vec<Transaction> {
        let mut out: Vec<Transaction> = Vec::new();
        for entry in entries {
            match out.last_mut() {
                Some(txn) if txn.txn_time == entry.version => txn.entries.push(entry),
                _ => out.push(Transaction {
                    txn_time: entry.version,
                    entries: vec![entry],
                }),
            }
        }
        out
    }
}

fn put_str16(dst: &mut BytesMut, s: &str) -> Result<(), ReplicationError> {
    let len = u16::try_from(s.len())
        .map_err(|_| ReplicationError::Decode(format!("string of {} bytes too long", s.len())))?;
    dst.put_u16(len);
    dst.put_slice(s.as_bytes());
    Ok(())
}

fn get_str16(src: &mut Bytes, what: &str) -> Result<String, ReplicationError> {
    if src.remaining() < 2 {
        return Err(ReplicationError::Decode(format!("truncated {what}")));
    }
    let len = src.get_u16() as usize;
    if src.remaining() < len {
        return Err(ReplicationError::Decode(format!("truncated {what}")));
    }
    String::from_utf8(src.split_to(len).to_vec())
        .map_err(|_| ReplicationError::Decode(format!("invalid utf-8 in {what}")))
}

/// Encode an entry against `fields`. Every record field must already be in `fields`.
pub fn encode_payload(entry: &AuditEntry, fields: &[String]) -> Result<Bytes, ReplicationError> {
    let mut buf = BytesMut::new();
    buf.put_u8(match entry.op {
        AuditOp::Put => OP_PUT,
        AuditOp::Delete => OP_DELETE,
    });
    put_str16(&mut buf, &entry.origin)?;
    put_str16(&mut buf, &entry.key)?;

    let mut values = Vec::with_capacity(entry.record.len());
    for (name, value) in &entry.record {
        let idx = fields
            .iter()
            .position(|f| f == name)
            .ok_or_else(|| ReplicationError::Decode(format!("field {name} missing from structure")))?;
        values.push(Value::Array(vec![Value::from(idx), value.clone()]));
    }
    serde_json::to_writer((&mut buf).writer(), &values)?;
    Ok(buf.freeze())
}

/// Decode a payload produced by [`encode_payload`] with the same dictionary.
pub fn decode_payload(
    mut payload: Bytes,
    table: &str,
    version: TxnTime,
    fields: &[String],
) -> Result<AuditEntry, ReplicationError> {
    if !payload.has_remaining() {
        return Err(ReplicationError::Decode("empty payload".into()));
    }
    let op = match payload.get_u8() {
        OP_PUT => AuditOp::Put,
        OP_DELETE => AuditOp::Delete,
        other => return Err(ReplicationError::Decode(format!("unknown op {other}"))),
    };
    let origin = get_str16(&mut payload, "origin")?;
    let key = get_str16(&mut payload, "key")?;

    let pairs: Vec<(usize, Value)> = serde_json::from_slice(&payload)?;
    let mut record = Map::new();
    for (idx, value) in pairs {
        let name = fields.get(idx).ok_or_else(|| {
            ReplicationError::Decode(format!("field index {idx} outside structure of {table}"))
        })?;
        record.insert(name.clone(), value);
    }

    Ok(AuditEntry {
        table: table.to_string(),
        key,
        origin,
        version,
        op,
        record,
    })
}
