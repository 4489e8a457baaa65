//! Storage engine boundary.
//!
//! The replication layer only needs to read the audit log, apply received
//! transactions and be told about new commits. `MemoryAuditStore` is a
//! complete in-process engine used by the node and by tests.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use meridian_protocol::{TableStructure, TxnTime};
use serde_json::{Map, Value};
use tokio::sync::broadcast;

use crate::audit::{AuditEntry, AuditOp, Transaction};
use crate::ReplicationError;

/// Capacity of the per-database commit feed. A session that falls further
/// behind is dropped and resumes from its last received time.
const COMMIT_FEED_CAPACITY: usize = 1024;

pub trait AuditStore: Send + Sync + 'static {
    /// Locally hosted databases.
    fn databases(&self) -> Vec<String>;

    fn tables(&self, database: &str) -> Vec<String>;

    fn table_structure(&self, database: &str, table: &str) -> Option<TableStructure>;

    /// Create `table` if it does not exist yet.
    fn ensure_table(
        &self,
        database: &str,
        table: &str,
        structure: &TableStructure,
    ) -> Result<(), ReplicationError>;

    /// Latest transaction time present in the database's audit log.
    fn last_applied_time(&self, database: &str) -> Option<TxnTime>;

    /// Latest transaction time received from `origin` through replication.
    fn last_received_time(&self, database: &str, origin: &str) -> Option<TxnTime>;

    /// Apply one received transaction atomically.
    ///
    /// Entries whose version is not newer than the stored record are skipped,
    /// so reapplying a transaction is a no-op. Returns the number applied.
    fn apply_transaction(&self, database: &str, txn: &Transaction)
        -> Result<usize, ReplicationError>;

    /// Snapshot of audit entries for `table` at or after `since`, in version order.
    fn audit_entries_since(
        &self,
        database: &str,
        table: &str,
        since: TxnTime,
    ) -> Result<Vec<AuditEntry>, ReplicationError>;

    /// Entries of every table at or after `since`, read as one consistent
    /// cut and ordered by version.
    fn database_entries_since(
        &self,
        database: &str,
        since: TxnTime,
    ) -> Result<Vec<AuditEntry>, ReplicationError>;

    /// Live feed of transactions committed (locally or by apply) from now on.
    fn subscribe_commits(&self, database: &str) -> Result<broadcast::Receiver<Arc<Transaction>>, ReplicationError>;
}

#[derive(Debug, Clone)]
struct StoredRow {
    version: TxnTime,
    origin: String,
    value: Option<Map<String, Value>>,
}

#[derive(Default)]
struct TableState {
    structure: TableStructure,
    rows: HashMap<String, StoredRow>,
    log: Vec<AuditEntry>,
}

struct DatabaseState {
    tables: BTreeMap<String, TableState>,
    received: HashMap<String, TxnTime>,
    last_time: Option<TxnTime>,
    feed: broadcast::Sender<Arc<Transaction>>,
}

impl DatabaseState {
    fn new() -> Self {
        let (feed, _) = broadcast::channel(COMMIT_FEED_CAPACITY);
        Self {
            tables: BTreeMap::new(),
            received: HashMap::new(),
            last_time: None,
            feed,
        }
    }

    fn record(&mut self, entry: &AuditEntry) -> bool {
        let Some(table) = self.tables.get_mut(&entry.table) else {
            return false;
        };
        if let Some(existing) = table.rows.get(&entry.key) {
            // Same version from the same origin is a replay; older loses.
            if existing.version > entry.version
                || (existing.version == entry.version && existing.origin >= entry.origin)
            {
                return false;
            }
        }
        table.rows.insert(
            entry.key.clone(),
            StoredRow {
                version: entry.version,
                origin: entry.origin.clone(),
                value: match entry.op {
                    AuditOp::Put => Some(entry.record.clone()),
                    AuditOp::Delete => None,
                },
            },
        );
        let pos = table.log.partition_point(|e| e.version <= entry.version);
        table.log.insert(pos, entry.clone());
        self.last_time = Some(self.last_time.map_or(entry.version, |t| t.max(entry.version)));
        true
    }
}

/// In-memory storage engine with a per-table audit log.
pub struct MemoryAuditStore {
    node_name: String,
    databases: Mutex<BTreeMap<String, DatabaseState>>,
}

impl MemoryAuditStore {
    pub fn new(node_name: impl Into<String>) -> Self {
        Self {
            node_name: node_name.into(),
            databases: Mutex::new(BTreeMap::new()),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, BTreeMap<String, DatabaseState>>, ReplicationError> {
        self.databases
            .lock()
            .map_err(|_| ReplicationError::Store("lock poisoned".into()))
    }

    pub fn node_name(&self) -> &str {
        &self.node_name
    }

    pub fn create_database(&self, database: &str) -> Result<(), ReplicationError> {
        self.lock()?
            .entry(database.to_string())
            .or_insert_with(DatabaseState::new);
        Ok(())
    }

    /// Commit a local write touching one or more records; returns its transaction time.
    ///
    /// `None` as the value deletes the record.
    pub fn commit(
        &self,
        database: &str,
        writes: Vec<(String, String, Option<Map<String, Value>>)>,
    ) -> Result<TxnTime, ReplicationError> {
        let mut dbs = self.lock()?;
        let db = dbs
            .get_mut(database)
            .ok_or_else(|| ReplicationError::Store(format!("unknown database {database}")))?;

        // Strictly increasing even when the wall clock stalls.
        let now = chrono::Utc::now().timestamp_micros() as f64 / 1000.0;
        let txn_time = match db.last_time {
            Some(last) if last >= now => last + 0.001,
            _ => now,
        };

        let mut entries = Vec::with_capacity(writes.len());
        for (table, key, value) in writes {
            if !db.tables.contains_key(&table) {
                return Err(ReplicationError::Store(format!(
                    "unknown table {database}.{table}"
                )));
            }
            entries.push(AuditEntry {
                table,
                key,
                origin: self.node_name.clone(),
                version: txn_time,
                op: if value.is_some() {
                    AuditOp::Put
                } else {
                    AuditOp::Delete
                },
                record: value.unwrap_or_default(),
            });
        }

        for entry in &entries {
            if let Some(table) = db.tables.get_mut(&entry.table) {
                for field in entry.record.keys() {
                    if !table.structure.attributes.contains(field) {
                        table.structure.attributes.push(field.clone());
                    }
                }
            }
            db.record(entry);
        }
        let _ = db.feed.send(Arc::new(Transaction { txn_time, entries }));
        Ok(txn_time)
    }

    /// Current value of a record, `None` if absent or deleted.
    pub fn get(&self, database: &str, table: &str, key: &str) -> Option<Map<String, Value>> {
        let dbs = self.lock().ok()?;
        dbs.get(database)?
            .tables
            .get(table)?
            .rows
            .get(key)?
            .value
            .clone()
    }

    /// Number of live records in a table.
    pub fn count(&self, database: &str, table: &str) -> usize {
        self.lock()
            .ok()
            .and_then(|dbs| {
                dbs.get(database)
                    .and_then(|db| db.tables.get(table))
                    .map(|t| t.rows.values().filter(|r| r.value.is_some()).count())
            })
            .unwrap_or(0)
    }
}

impl AuditStore for MemoryAuditStore {
    fn databases(&self) -> Vec<String> {
        self.lock()
            .map(|dbs| dbs.keys().cloned().collect())
            .unwrap_or_default()
    }

    fn tables(&self, database: &str) -> Vec<String> {
        self.lock()
            .ok()
            .and_then(|dbs| dbs.get(database).map(|db| db.tables.keys().cloned().collect()))
            .unwrap_or_default()
    }

    fn table_structure(&self, database: &str, table: &str) -> Option<TableStructure> {
        let dbs = self.lock().ok()?;
        Some(dbs.get(database)?.tables.get(table)?.structure.clone())
    }

    fn ensure_table(
        &self,
        database: &str,
        table: &str,
        structure: &TableStructure,
    ) -> Result<(), ReplicationError> {
        let mut dbs = self.lock()?;
        let db = dbs
            .entry(database.to_string())
            .or_insert_with(DatabaseState::new);
        let state = db.tables.entry(table.to_string()).or_default();
        if state.structure.primary_key.is_empty() {
            state.structure.primary_key = structure.primary_key.clone();
        }
        for attr in &structure.attributes {
            if !state.structure.attributes.contains(attr) {
                state.structure.attributes.push(attr.clone());
            }
        }
        Ok(())
    }

    fn last_applied_time(&self, database: &str) -> Option<TxnTime> {
        self.lock().ok()?.get(database)?.last_time
    }

    fn last_received_time(&self, database: &str, origin: &str) -> Option<TxnTime> {
        self.lock().ok()?.get(database)?.received.get(origin).copied()
    }

    fn apply_transaction(
        &self,
        database: &str,
        txn: &Transaction,
    ) -> Result<usize, ReplicationError> {
        // One lock for the whole transaction: readers never see part of it.
        let mut dbs = self.lock()?;
        let db = dbs
            .get_mut(database)
            .ok_or_else(|| ReplicationError::Store(format!("unknown database {database}")))?;

        let mut applied = Vec::new();
        for entry in &txn.entries {
            if !db.tables.contains_key(&entry.table) {
                return Err(ReplicationError::Store(format!(
                    "unknown table {database}.{}",
                    entry.table
                )));
            }
        }
        for entry in &txn.entries {
            if db.record(entry) {
                applied.push(entry.clone());
            }
            let mark = db.received.entry(entry.origin.clone()).or_insert(entry.version);
            *mark = mark.max(entry.version);
        }

        let count = applied.len();
        if count > 0 {
            let _ = db.feed.send(Arc::new(Transaction {
                txn_time: txn.txn_time,
                entries: applied,
            }));
        }
        Ok(count)
    }

    fn audit_entries_since(
        &self,
        database: &str,
        table: &str,
        since: TxnTime,
    ) -> Result<Vec<AuditEntry>, ReplicationError> {
        let dbs = self.lock()?;
        let Some(state) = dbs.get(database).and_then(|db| db.tables.get(table)) else {
            return Ok(Vec::new());
        };
        let start = state.log.partition_point(|e| e.version < since);
        Ok(state.log[start..].to_vec())
    }

    fn database_entries_since(
        &self,
        database: &str,
        since: TxnTime,
    ) -> Result<Vec<AuditEntry>, ReplicationError> {
        let dbs = self.lock()?;
        let Some(db) = dbs.get(database) else {
            return Ok(Vec::new());
        };
        let mut entries: Vec<AuditEntry> = db
            .tables
            .values()
            .flat_map(|state| {
                let start = state.log.partition_point(|e| e.version < since);
                state.log[start..].iter().cloned()
            })
            .collect();
        entries.sort_by(|a, b| a.version.total_cmp(&b.version));
        Ok(entries)
    }

    fn subscribe_commits(
        &self,
        database: &str,
    ) -> Result<broadcast::Receiver<Arc<Transaction>>, ReplicationError> {
        let dbs = self.lock()?;
        let db = dbs
            .get(database)
            .ok_or_else(|| ReplicationError::Store(format!("unknown database {database}")))?;
        Ok(db.feed.subscribe())
    }
}
