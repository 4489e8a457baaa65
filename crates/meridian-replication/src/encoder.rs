//! Source-side transaction encoder.
//!
//! Buffers records of the current transaction and emits table metadata the
//! first time a table is referenced or whenever its field dictionary grows.
//! Metadata frames are always queued ahead of the transaction that needs them.

use std::collections::hash_map::Entry;
use std::collections::HashMap;

use meridian_protocol::{DownstreamFrame, RecordPayload, TableStructure, TxnTime};

use crate::audit::{encode_payload, AuditEntry};
use crate::ReplicationError;

struct TableSlot {
    id: u16,
    fields: Vec<String>,
}

#[derive(Default)]
pub struct TransactionEncoder {
    tables: HashMap<String, TableSlot>,
    current: Option<(TxnTime, Vec<RecordPayload>)>,
    ready: Vec<DownstreamFrame>,
}

impl TransactionEncoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add one entry. A change of transaction time closes the buffered transaction.
    pub fn push(
        &mut self,
        entry: &AuditEntry,
        structure: Option<&TableStructure>,
    ) -> Result<(), ReplicationError> {
        if self
            .current
            .as_ref()
            .is_some_and(|(time, _)| *time != entry.version)
        {
            self.flush();
        }

        let next_id = self.tables.len();
        let ready = &mut self.ready;
        let slot = match self.tables.entry(entry.table.clone()) {
            Entry::Occupied(occupied) => occupied.into_mut(),
            Entry::Vacant(vacant) => {
                let id = u16::try_from(next_id)
                    .map_err(|_| ReplicationError::Decode("too many tables in one session".into()))?;
                ready.push(DownstreamFrame::TableName {
                    table_id: id,
                    name: entry.table.clone(),
                });
                ready.push(DownstreamFrame::TableStructure {
                    table_id: id,
                    structure: structure.cloned().unwrap_or_default(),
                });
                vacant.insert(TableSlot {
                    id,
                    fields: Vec::new(),
                })
            }
        };

        let before = slot.fields.len();
        for field in entry.record.keys() {
            if !slot.fields.contains(field) {
                slot.fields.push(field.clone());
            }
        }
        if slot.fields.len() != before {
            self.ready.push(DownstreamFrame::TableFixedStructure {
                table_id: slot.id,
                fields: slot.fields.clone(),
            });
        }

        let payload = encode_payload(entry, &slot.fields)?;
        let table_id = slot.id;
        self.current
            .get_or_insert_with(|| (entry.version, Vec::new()))
            .1
            .push(RecordPayload { table_id, payload });
        Ok(())
    }

    /// Close the buffered transaction, if any.
    pub fn flush(&mut self) {
        if let Some((txn_time, records)) = self.current.take() {
            self.ready.push(DownstreamFrame::Transaction { txn_time, records });
        }
    }

    /// Frames ready to be written, in order.
    pub fn drain(&mut self) -> Vec<DownstreamFrame> {
        std::mem::take(&mut self.ready)
    }
}
