//! Restarting a node with its data intact: the first subscription after a
//! start asks a peer for the node's own recent writes, and replaying them
//! changes nothing.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use meridian_protocol::{TableStructure, TxnTime};
use meridian_replication::{
    AuditEntry, AuditStore, MemoryAuditStore, ReplicationError, Transaction,
};
use serde_json::json;
use tokio::sync::broadcast;

use crate::harness::{TestMesh, DB};

const TIMEOUT: Duration = Duration::from_secs(10);

/// Counts received entries that originated on the store's own node.
struct EchoCounter {
    inner: Arc<MemoryAuditStore>,
    echoed: Arc<AtomicUsize>,
}

impl AuditStore for EchoCounter {
    fn databases(&self) -> Vec<String> {
        self.inner.databases()
    }

    fn tables(&self, database: &str) -> Vec<String> {
        self.inner.tables(database)
    }

    fn table_structure(&self, database: &str, table: &str) -> Option<TableStructure> {
        self.inner.table_structure(database, table)
    }

    fn ensure_table(
        &self,
        database: &str,
        table: &str,
        structure: &TableStructure,
    ) -> Result<(), ReplicationError> {
        self.inner.ensure_table(database, table, structure)
    }

    fn last_applied_time(&self, database: &str) -> Option<TxnTime> {
        self.inner.last_applied_time(database)
    }

    fn last_received_time(&self, database: &str, origin: &str) -> Option<TxnTime> {
        self.inner.last_received_time(database, origin)
    }

    fn apply_transaction(
        &self,
        database: &str,
        txn: &Transaction,
    ) -> Result<usize, ReplicationError> {
        let own = txn
            .entries
            .iter()
            .filter(|e| e.origin == self.inner.node_name())
            .count();
        self.echoed.fetch_add(own, Ordering::SeqCst);
        self.inner.apply_transaction(database, txn)
    }

    fn audit_entries_since(
        &self,
        database: &str,
        table: &str,
        since: TxnTime,
    ) -> Result<Vec<AuditEntry>, ReplicationError> {
        self.inner.audit_entries_since(database, table, since)
    }

    fn database_entries_since(
        &self,
        database: &str,
        since: TxnTime,
    ) -> Result<Vec<AuditEntry>, ReplicationError> {
        self.inner.database_entries_since(database, since)
    }

    fn subscribe_commits(
        &self,
        database: &str,
    ) -> Result<broadcast::Receiver<Arc<Transaction>>, ReplicationError> {
        self.inner.subscribe_commits(database)
    }
}

/// Stop `name` and start it again on the same store, counting echoes.
async fn restart(mesh: &mut TestMesh, name: &str) -> anyhow::Result<Arc<AtomicUsize>> {
    let idx = mesh
        .nodes
        .iter()
        .position(|n| n.name == name)
        .ok_or_else(|| anyhow::anyhow!("no test node named {name}"))?;
    let builder = mesh.nodes.remove(idx).stop().await;

    let echoed = Arc::new(AtomicUsize::new(0));
    let counter = echoed.clone();
    let node = builder
        .engine(move |store| {
            let engine: Arc<dyn AuditStore> = Arc::new(EchoCounter {
                inner: store,
                echoed: counter,
            });
            engine
        })
        .build(&mesh.network)
        .await?;
    mesh.nodes.push(node);
    Ok(echoed)
}

#[tokio::test]
async fn test_restart_catchup_is_idempotent() -> anyhow::Result<()> {
    let mut mesh = TestMesh::full_mesh(&["alpha", "beta"]).await?;
    mesh.wait_converged(TIMEOUT).await?;

    let t = {
        let (a, b) = (mesh.node("alpha"), mesh.node("beta"));
        a.put("dog", "1", json!({"id": "1", "name": "rex"}))?;
        let t = a.put("dog", "2", json!({"id": "2", "name": "fido"}))?;
        b.wait_received("alpha", t, TIMEOUT).await?;
        t
    };
    let alpha_log = mesh.node("alpha").store.database_entries_since(DB, 0.0)?;
    let beta_log = mesh.node("beta").store.database_entries_since(DB, 0.0)?;
    assert_eq!(alpha_log.len(), 2);
    assert_eq!(mesh.node("alpha").store.last_applied_time(DB), Some(t));
    assert_eq!(mesh.node("alpha").store.last_received_time(DB, "alpha"), None);

    for _ in 0..2 {
        let echoed = restart(&mut mesh, "alpha").await?;
        let (a, b) = (mesh.node("alpha"), mesh.node("beta"));
        a.wait_connected("beta", TIMEOUT).await?;
        b.wait_connected("alpha", TIMEOUT).await?;

        // beta hands alpha's newest write back.
        let deadline = tokio::time::Instant::now() + TIMEOUT;
        while echoed.load(Ordering::SeqCst) == 0 {
            anyhow::ensure!(
                tokio::time::Instant::now() < deadline,
                "alpha never received its own writes back"
            );
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        a.wait_received("alpha", t, TIMEOUT).await?;

        assert_eq!(a.store.count(DB, "dog"), 2);
        assert_eq!(b.store.count(DB, "dog"), 2);
        assert_eq!(a.store.last_applied_time(DB), Some(t));
        assert_eq!(a.store.database_entries_since(DB, 0.0)?, alpha_log);
        assert_eq!(b.store.database_entries_since(DB, 0.0)?, beta_log);
    }

    // Replication carries on normally after the restarts.
    let t2 = mesh
        .node("alpha")
        .put("dog", "3", json!({"id": "3"}))?;
    assert!(t2 > t);
    mesh.node("beta").wait_record("dog", "3", TIMEOUT).await?;

    mesh.shutdown().await;
    Ok(())
}
