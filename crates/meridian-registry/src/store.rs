//! SQLite-backed node registry.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use tokio::sync::mpsc;

use crate::record::{NodePatch, NodeRecord};
use crate::{RegistryError, Result};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS nodes (
    name        TEXT PRIMARY KEY,
    record      TEXT,
    deleted     INTEGER NOT NULL DEFAULT 0,
    updated_at  TEXT NOT NULL
);
";

/// Result of a lookup by name.
#[derive(Debug, Clone, PartialEq)]
pub enum Lookup {
    Present(NodeRecord),
    /// Explicitly deleted; `ensure` will not recreate it.
    Deleted,
    /// Never existed.
    Absent,
}

impl Lookup {
    pub fn record(self) -> Option<NodeRecord> {
        match self {
            Lookup::Present(record) => Some(record),
            Lookup::Deleted | Lookup::Absent => None,
        }
    }
}

/// Change notification delivered to listeners.
#[derive(Debug, Clone, PartialEq)]
pub enum RegistryEvent {
    Put(NodeRecord),
    Delete { name: String },
}

impl RegistryEvent {
    pub fn name(&self) -> &str {
        match self {
            RegistryEvent::Put(record) => &record.name,
            RegistryEvent::Delete { name } => name,
        }
    }
}

struct Inner {
    conn: Connection,
    listeners: Vec<mpsc::UnboundedSender<RegistryEvent>>,
}

impl Inner {
    fn notify(&mut self, event: RegistryEvent) {
        self.listeners.retain(|l| l.send(event.clone()).is_ok());
    }

    fn lookup(&self, name: &str) -> Result<Lookup> {
        let row: Option<(Option<String>, bool)> = self
            .conn
            .query_row(
                "SELECT record, deleted FROM nodes WHERE name = ?1",
                params![name],
                |row| Ok((row.get(0)?, row.get::<_, i64>(1)? != 0)),
            )
            .optional()?;
        match row {
            None => Ok(Lookup::Absent),
            Some((_, true)) | Some((None, false)) => Ok(Lookup::Deleted),
            Some((Some(json), false)) => {
                let record = serde_json::from_str(&json).map_err(|source| {
                    RegistryError::Corrupt {
                        name: name.to_string(),
                        source,
                    }
                })?;
                Ok(Lookup::Present(record))
            }
        }
    }

    fn write(&mut self, record: NodeRecord) -> Result<NodeRecord> {
        let json = serde_json::to_string(&record)?;
        self.conn.execute(
            "INSERT INTO nodes (name, record, deleted, updated_at)
             VALUES (?1, ?2, 0, ?3)
             ON CONFLICT(name) DO UPDATE SET
               record = excluded.record,
               deleted = 0,
               updated_at = excluded.updated_at",
            params![record.name, json, record.updated_at.to_rfc3339()],
        )?;
        self.notify(RegistryEvent::Put(record.clone()));
        Ok(record)
    }
}

/// Registry of known peers.
///
/// All mutations go through one lock, so listeners see events in the order
/// writes were committed.
pub struct NodeRegistry {
    inner: Mutex<Inner>,
}

impl NodeRegistry {
    fn lock(&self) -> Result<MutexGuard<'_, Inner>> {
        self.inner.lock().map_err(|_| RegistryError::LockPoisoned)
    }

    /// Open (or create) the registry at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA busy_timeout = 5000;",
        )?;
        Self::with_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            inner: Mutex::new(Inner {
                conn,
                listeners: Vec::new(),
            }),
        })
    }

    pub fn get(&self, name: &str) -> Result<Lookup> {
        self.lock()?.lookup(name)
    }

    /// Insert or merge. Returns `None` (and writes nothing) for a tombstoned name.
    pub fn ensure(&self, name: &str, patch: &NodePatch) -> Result<Option<NodeRecord>> {
        validate_name(name)?;
        let mut inner = self.lock()?;
        let mut record = match inner.lookup(name)? {
            Lookup::Deleted => {
                tracing::debug!(node = %name, "ensure skipped, node was deleted");
                return Ok(None);
            }
            Lookup::Absent => NodeRecord::new(name),
            Lookup::Present(record) => record,
        };
        record.apply(patch);
        inner.write(record).map(Some)
    }

    /// Insert or merge, clearing any tombstone. Used for explicit operator adds.
    pub fn restore(&self, name: &str, patch: &NodePatch) -> Result<NodeRecord> {
        validate_name(name)?;
        let mut inner = self.lock()?;
        let mut record = inner.lookup(name)?.record().unwrap_or_else(|| NodeRecord::new(name));
        record.apply(patch);
        inner.write(record)
    }

    /// Tombstone `name`. Returns false if there was no live record.
    pub fn delete(&self, name: &str) -> Result<bool> {
        let mut inner = self.lock()?;
        let live = matches!(inner.lookup(name)?, Lookup::Present(_));
        inner.conn.execute(
            "INSERT INTO nodes (name, record, deleted, updated_at)
             VALUES (?1, NULL, 1, ?2)
             ON CONFLICT(name) DO UPDATE SET
               record = NULL,
               deleted = 1,
               updated_at = excluded.updated_at",
            params![name, Utc::now().to_rfc3339()],
        )?;
        if live {
            inner.notify(RegistryEvent::Delete {
                name: name.to_string(),
            });
        }
        Ok(live)
    }

    /// All live records, ordered by name.
    pub fn list(&self) -> Result<Vec<NodeRecord>> {
        let inner = self.lock()?;
        let mut stmt = inner
            .conn
            .prepare("SELECT name, record FROM nodes WHERE deleted = 0 AND record IS NOT NULL ORDER BY name")?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        rows.into_iter()
            .map(|(name, json)| {
                serde_json::from_str(&json).map_err(|source| RegistryError::Corrupt { name, source })
            })
            .collect()
    }

    /// Find a live record by url.
    pub fn find_by_url(&self, url: &str) -> Result<Option<NodeRecord>> {
        Ok(self
            .list()?
            .into_iter()
            .find(|r| r.url.as_deref() == Some(url)))
    }

    /// Register a listener for future puts/deletes.
    ///
    /// With `include_current`, every live row is delivered as a `Put` first,
    /// before any event written after this call.
    pub fn subscribe(&self, include_current: bool) -> Result<mpsc::UnboundedReceiver<RegistryEvent>> {
        let (tx, rx) = mpsc::unbounded_channel();
        if include_current {
            // Hold the lock across the snapshot so no write slips in between.
            let mut inner = self.lock()?;
            let mut stmt = inner
                .conn
                .prepare("SELECT name, record FROM nodes WHERE deleted = 0 AND record IS NOT NULL ORDER BY name")?;
            let rows = stmt
                .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            drop(stmt);
            for (name, json) in rows {
                match serde_json::from_str::<NodeRecord>(&json) {
                    Ok(record) => {
                        let _ = tx.send(RegistryEvent::Put(record));
                    }
                    Err(e) => tracing::warn!(node = %name, error = %e, "skipping corrupt registry row"),
                }
            }
            inner.listeners.push(tx);
        } else {
            self.lock()?.listeners.push(tx);
        }
        Ok(rx)
    }
}

fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() || name.len() > u8::MAX as usize || name.chars().any(char::is_whitespace) {
        return Err(RegistryError::InvalidName(name.to_string()));
    }
    Ok(())
}
