//! Subscriber-side table state: turns received frames back into transactions.

use std::collections::HashMap;

use meridian_protocol::{DownstreamFrame, RecordPayload, TableSelection, TableStructure, TxnTime};

use crate::audit::{decode_payload, AuditEntry, Transaction};
use crate::ReplicationError;

#[derive(Debug, Default)]
struct TableState {
    name: Option<String>,
    structure: TableStructure,
    fields: Vec<String>,
}

/// Per-session decoder; table ids are only meaningful within one session.
#[derive(Debug, Default)]
pub struct TableDecoder {
    tables: HashMap<u16, TableState>,
}

/// A table whose metadata changed and should exist locally.
#[derive(Debug, Clone, PartialEq)]
pub struct TableUpdate {
    pub name: String,
    pub structure: TableStructure,
}

impl TableDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a control frame. Returns the table's current shape once its name is known.
    pub fn on_control(&mut self, frame: DownstreamFrame) -> Option<TableUpdate> {
        let (table_id, state) = match frame {
            DownstreamFrame::TableName { table_id, name } => {
                let state = self.tables.entry(table_id).or_default();
                state.name = Some(name);
                (table_id, state)
            }
            DownstreamFrame::TableStructure {
                table_id,
                structure,
            } => {
                let state = self.tables.entry(table_id).or_default();
                state.structure = structure;
                (table_id, state)
            }
            DownstreamFrame::TableFixedStructure { table_id, fields } => {
                let state = self.tables.entry(table_id).or_default();
                state.fields = fields;
                (table_id, state)
            }
            DownstreamFrame::Transaction { .. } => return None,
        };
        tracing::trace!(table_id, name = ?state.name, "table metadata");

        let name = state.name.clone()?;
        let mut structure = state.structure.clone();
        for field in &state.fields {
            if !structure.attributes.contains(field) {
                structure.attributes.push(field.clone());
            }
        }
        Some(TableUpdate { name, structure })
    }

    /// Decode a transaction's records, dropping tables outside `selection`.
    pub fn decode(
        &self,
        txn_time: TxnTime,
        records: Vec<RecordPayload>,
        selection: &TableSelection,
    ) -> Result<Transaction, ReplicationError> {
        let mut entries: Vec<AuditEntry> = Vec::with_capacity(records.len());
        for record in records {
            let state = self
                .tables
                .get(&record.table_id)
                .ok_or(ReplicationError::UnknownTable(record.table_id))?;
            let name = state
                .name
                .as_deref()
                .ok_or(ReplicationError::UnknownTable(record.table_id))?;
            if !selection.includes(name) {
                continue;
            }
            entries.push(decode_payload(record.payload, name, txn_time, &state.fields)?);
        }
        Ok(Transaction { txn_time, entries })
    }
}
