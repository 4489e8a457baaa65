//! Test harness for in-process meridian-node integration tests.
//!
//! Provides TestNode (single node), TestNodeBuilder (config), and TestMesh
//! (N-node orchestrator). Replication runs over a shared MemoryNetwork; the
//! HTTP API is real axum on a loopback port so membership goes through the
//! same register/remove handshake a deployment uses.

use std::sync::Arc;
use std::time::Duration;

use meridian_api::{AppState, HttpPeerClient};
use meridian_coordinator::{ClusterStatus, DatabaseSocket};
use meridian_node::identity::peer_identity;
use meridian_node::memory_transport::MemoryNetwork;
use meridian_node::node::{Node, NodeSettings};
use meridian_protocol::{LocalIdentity, ReplicationTiming, TableStructure, TxnTime, DEFAULT_TIMING};
use meridian_registry::NodeRegistry;
use meridian_replication::{AuditStore, MemoryAuditStore};
use serde_json::{Map, Value};
use tokio::task::JoinHandle;

/// Database every test node carries.
pub const DB: &str = "data";

/// Short timers so failover and reconnects happen within a test's patience.
pub fn fast_timing() -> ReplicationTiming {
    ReplicationTiming {
        reconnect_delay_ms: 100,
        subscribe_debounce_ms: 20,
        confirm_interval_ms: 20,
        ..DEFAULT_TIMING
    }
}

/// A running in-process node with its API server attached.
pub struct TestNode {
    pub name: String,
    pub url: String,
    pub api_addr: String,
    pub bearer_token: String,
    pub store: Arc<MemoryAuditStore>,
    pub registry: Arc<NodeRegistry>,
    pub node: Node,
    workers: usize,
    timing: ReplicationTiming,
    network: MemoryNetwork,
    api_handle: JoinHandle<()>,
}

#[allow(dead_code)]
impl TestNode {
    pub async fn shutdown(self) {
        self.network.detach(&self.url);
        self.node.stop().await;
        let _ = self.api_handle.await;
    }

    /// Stop the node and hand back a builder that brings it up again on the
    /// same store, registry and address.
    pub async fn stop(self) -> TestNodeBuilder {
        let builder = TestNodeBuilder::new(&self.name)
            .workers(self.workers)
            .timing(self.timing)
            .store(self.store.clone())
            .registry(self.registry.clone())
            .api_addr(&self.api_addr);
        self.shutdown().await;
        builder
    }

    /// Take this node's replication endpoint off the network.
    pub fn disconnect(&self) -> bool {
        self.network.detach(&self.url)
    }

    pub fn reconnect(&self) {
        self.network.attach(&self.url, self.node.source_context());
    }

    /// Stop this node reaching `other` for replication (one direction only).
    pub fn partition_from(&self, other: &TestNode) {
        self.network.partition(&self.name, &other.url);
    }

    pub fn heal_from(&self, other: &TestNode) {
        self.network.heal(&self.name, &other.url);
    }

    /// Commit one record locally.
    pub fn put(&self, table: &str, key: &str, value: Value) -> anyhow::Result<TxnTime> {
        let record = value
            .as_object()
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("record must be a JSON object"))?;
        Ok(self
            .store
            .commit(DB, vec![(table.into(), key.into(), Some(record))])?)
    }

    pub fn delete(&self, table: &str, key: &str) -> anyhow::Result<TxnTime> {
        Ok(self.store.commit(DB, vec![(table.into(), key.into(), None)])?)
    }

    pub fn get(&self, table: &str, key: &str) -> Option<Map<String, Value>> {
        self.store.get(DB, table, key)
    }

    /// Poll the local store until `table/key` exists, or timeout.
    pub async fn wait_record(
        &self,
        table: &str,
        key: &str,
        timeout: Duration,
    ) -> anyhow::Result<Map<String, Value>> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(record) = self.get(table, key) {
                return Ok(record);
            }
            if tokio::time::Instant::now() > deadline {
                anyhow::bail!("{}: timeout waiting for record {}/{}", self.name, table, key);
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    /// Poll the local store until `table/key` is gone, or timeout.
    pub async fn wait_absent(&self, table: &str, key: &str, timeout: Duration) -> anyhow::Result<()> {
        let deadline = tokio::time::Instant::now() + timeout;
        while self.get(table, key).is_some() {
            if tokio::time::Instant::now() > deadline {
                anyhow::bail!("{}: record {}/{} still present", self.name, table, key);
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        Ok(())
    }

    /// Wait until this node has received `origin`'s writes up to `time`.
    pub async fn wait_received(&self, origin: &str, time: TxnTime, timeout: Duration) -> anyhow::Result<()> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let have = self.store.last_received_time(DB, origin);
            if have.is_some_and(|t| t >= time) {
                return Ok(());
            }
            if tokio::time::Instant::now() > deadline {
                anyhow::bail!(
                    "{}: timeout waiting for {} up to {} (have {:?})",
                    self.name,
                    origin,
                    time,
                    have
                );
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    pub async fn status(&self) -> anyhow::Result<ClusterStatus> {
        Ok(self.node.coordinator.cluster_status().await?)
    }

    /// Poll cluster status until the socket for (`peer`, DB) satisfies `check`.
    pub async fn wait_socket(
        &self,
        peer: &str,
        what: &str,
        timeout: Duration,
        check: impl Fn(&DatabaseSocket) -> bool,
    ) -> anyhow::Result<DatabaseSocket> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let status = self.status().await?;
            let socket = status
                .connection(peer)
                .and_then(|c| c.socket(DB))
                .cloned();
            if let Some(socket) = &socket {
                if check(socket) {
                    return Ok(socket.clone());
                }
            }
            if tokio::time::Instant::now() > deadline {
                anyhow::bail!(
                    "{}: timeout waiting for {} socket to be {} (have {:?})",
                    self.name,
                    peer,
                    what,
                    socket
                );
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    pub async fn wait_connected(&self, peer: &str, timeout: Duration) -> anyhow::Result<DatabaseSocket> {
        self.wait_socket(peer, "connected", timeout, |s| s.connected)
            .await
    }

    /// Poll cluster status until `peer` has no socket left for DB.
    pub async fn wait_no_socket(&self, peer: &str, timeout: Duration) -> anyhow::Result<()> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let status = self.status().await?;
            if status.connection(peer).and_then(|c| c.socket(DB)).is_none() {
                return Ok(());
            }
            if tokio::time::Instant::now() > deadline {
                anyhow::bail!("{}: {} still has a socket: {:?}", self.name, peer, status);
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    /// POST /api/v1/add_node for `other`. `intent` carries replicates/subscriptions.
    pub async fn add_node(&self, other: &TestNode, intent: Value) -> anyhow::Result<(u16, Value)> {
        let mut body = serde_json::json!({
            "url": other.url,
            "authorization": other.bearer_token,
        });
        if let (Some(body), Some(intent)) = (body.as_object_mut(), intent.as_object()) {
            body.extend(intent.clone());
        }
        self.api_post_raw("/api/v1/add_node", body).await
    }

    /// POST /api/v1/remove_node for `other` by name.
    pub async fn remove_node(&self, other: &TestNode) -> anyhow::Result<(u16, Value)> {
        let body = serde_json::json!({
            "name": other.name,
            "authorization": other.bearer_token,
        });
        self.api_post_raw("/api/v1/remove_node", body).await
    }

    pub async fn api_cluster_status(&self) -> anyhow::Result<Value> {
        self.api_post("/api/v1/cluster_status", serde_json::json!({}))
            .await
    }

    /// Raw POST returning (status_code, body_json).
    pub async fn api_post_raw(&self, path: &str, body: Value) -> anyhow::Result<(u16, Value)> {
        let url = format!("http://{}{}", self.api_addr, path);
        let client = reqwest::Client::new();
        let resp = client
            .post(&url)
            .header("Content-Type", "application/json")
            .header("Authorization", format!("Bearer {}", self.bearer_token))
            .json(&body)
            .send()
            .await?;
        let status = resp.status().as_u16();
        let text = resp.text().await?;
        let val: Value = serde_json::from_str(&text).unwrap_or(serde_json::json!({"_raw": text}));
        Ok((status, val))
    }

    async fn api_post(&self, path: &str, body: Value) -> anyhow::Result<Value> {
        let (_, val) = self.api_post_raw(path, body).await?;
        Ok(val)
    }
}

/// Builder for configuring and spawning a TestNode.
pub struct TestNodeBuilder {
    name: String,
    tables: Vec<String>,
    workers: usize,
    timing: ReplicationTiming,
    store: Option<Arc<MemoryAuditStore>>,
    registry: Option<Arc<NodeRegistry>>,
    api_addr: Option<String>,
    engine: Option<Arc<dyn AuditStore>>,
}

#[allow(dead_code)]
impl TestNodeBuilder {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.into(),
            tables: vec!["dog".into(), "cat".into()],
            workers: 2,
            timing: fast_timing(),
            store: None,
            registry: None,
            api_addr: None,
            engine: None,
        }
    }

    /// Reuse an existing store instead of starting empty.
    pub fn store(mut self, store: Arc<MemoryAuditStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn registry(mut self, registry: Arc<NodeRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Bind the API (and so the node url) to a fixed address.
    pub fn api_addr(mut self, addr: &str) -> Self {
        self.api_addr = Some(addr.to_string());
        self
    }

    /// Run the node over `wrap(store)` rather than the bare store.
    pub fn engine(
        mut self,
        wrap: impl FnOnce(Arc<MemoryAuditStore>) -> Arc<dyn AuditStore>,
    ) -> Self {
        let store = self
            .store
            .get_or_insert_with(|| Arc::new(MemoryAuditStore::new(self.name.clone())))
            .clone();
        self.engine = Some(wrap(store));
        self
    }

    pub fn tables(mut self, tables: &[&str]) -> Self {
        self.tables = tables.iter().map(|t| t.to_string()).collect();
        self
    }

    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn timing(mut self, timing: ReplicationTiming) -> Self {
        self.timing = timing;
        self
    }

    pub async fn build(self, network: &MemoryNetwork) -> anyhow::Result<TestNode> {
        let registry = match self.registry {
            Some(registry) => registry,
            None => Arc::new(NodeRegistry::open_in_memory()?),
        };

        let store = self
            .store
            .unwrap_or_else(|| Arc::new(MemoryAuditStore::new(self.name.clone())));
        store.create_database(DB)?;
        for table in &self.tables {
            store.ensure_table(
                DB,
                table,
                &TableStructure {
                    primary_key: "id".into(),
                    attributes: vec!["id".into()],
                },
            )?;
        }

        // Bind API on ephemeral port; its address doubles as the node url.
        let bind = self.api_addr.as_deref().unwrap_or("127.0.0.1:0");
        let api_listener = tokio::net::TcpListener::bind(bind).await?;
        let api_addr = api_listener.local_addr()?.to_string();
        let url = format!("http://{api_addr}");

        let engine: Arc<dyn AuditStore> = match self.engine {
            Some(engine) => engine,
            None => store.clone(),
        };
        let node = Node::spawn(
            NodeSettings {
                name: self.name.clone(),
                url: url.clone(),
                databases: vec![DB.into()],
                workers: self.workers,
                timing: self.timing,
            },
            registry.clone(),
            engine,
            Arc::new(network.clone()),
        )?;
        network.attach(&url, node.source_context());

        let local = LocalIdentity::generate(&self.name)?;
        let bearer_token = format!("test-token-{}", self.name);
        let state = Arc::new(AppState {
            registry: registry.clone(),
            identity: peer_identity(&local, &url, &[DB.into()], self.workers),
            bearer_token: bearer_token.clone(),
            coordinator: Some(node.coordinator.clone()),
            peers: Arc::new(HttpPeerClient::new()),
        });
        let router = meridian_api::router(state);
        let api_handle = {
            let mut shutdown = node.shutdown_signal();
            tokio::spawn(async move {
                axum::serve(api_listener, router)
                    .with_graceful_shutdown(async move {
                        let _ = shutdown.recv().await;
                    })
                    .await
                    .ok();
            })
        };

        Ok(TestNode {
            name: self.name,
            url,
            api_addr,
            bearer_token,
            store,
            registry,
            node,
            workers: self.workers,
            timing: self.timing,
            network: network.clone(),
            api_handle,
        })
    }
}

/// N nodes on one in-memory network.
pub struct TestMesh {
    pub nodes: Vec<TestNode>,
    pub network: MemoryNetwork,
}

#[allow(dead_code)]
impl TestMesh {
    /// Spawn nodes without wiring any membership.
    pub async fn new(names: &[&str]) -> anyhow::Result<Self> {
        let network = MemoryNetwork::new();
        let mut nodes = Vec::with_capacity(names.len());
        for name in names {
            nodes.push(TestNodeBuilder::new(name).build(&network).await?);
        }
        Ok(Self { nodes, network })
    }

    /// Spawn nodes and register every pair for full replication.
    pub async fn full_mesh(names: &[&str]) -> anyhow::Result<Self> {
        let mesh = Self::new(names).await?;
        for i in 0..mesh.nodes.len() {
            for j in (i + 1)..mesh.nodes.len() {
                let (status, body) = mesh.nodes[i]
                    .add_node(&mesh.nodes[j], serde_json::json!({"replicates": true}))
                    .await?;
                anyhow::ensure!(
                    status == 200,
                    "{} add_node {} failed ({}): {}",
                    mesh.nodes[i].name,
                    mesh.nodes[j].name,
                    status,
                    body
                );
            }
        }
        Ok(mesh)
    }

    /// Wait until every node holds a connected socket to every other node.
    pub async fn wait_converged(&self, timeout: Duration) -> anyhow::Result<()> {
        for node in &self.nodes {
            for peer in &self.nodes {
                if peer.name != node.name {
                    node.wait_connected(&peer.name, timeout).await?;
                }
            }
        }
        Ok(())
    }

    pub fn node(&self, name: &str) -> &TestNode {
        self.nodes
            .iter()
            .find(|n| n.name == name)
            .unwrap_or_else(|| panic!("no test node named {name}"))
    }

    pub async fn shutdown(self) {
        for node in self.nodes {
            node.shutdown().await;
        }
    }
}
