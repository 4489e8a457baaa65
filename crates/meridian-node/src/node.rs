//! Node assembly: registry feed, coordinator, worker pool and event plumbing.
//!
//! Transports and the HTTP API are attached by the caller; the binary uses
//! QUIC and axum, the integration tests use the in-memory network.

use std::sync::Arc;

use meridian_coordinator::{spawn_coordinator, CoordinatorHandle, SubscriptionCoordinator};
use meridian_protocol::ReplicationTiming;
use meridian_registry::{NodePatch, NodeRegistry};
use meridian_replication::{AuditStore, ConfirmationTracker};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use crate::transport::{Connector, SourceContext};
use crate::worker::{spawn_workers, WorkerContext, WorkerEvent, WorkerPool};

#[derive(Debug, Clone)]
pub struct NodeSettings {
    pub name: String,
    pub url: String,
    pub databases: Vec<String>,
    pub workers: usize,
    pub timing: ReplicationTiming,
}

/// A running node without its outer surfaces.
pub struct Node {
    pub name: String,
    pub url: String,
    pub registry: Arc<NodeRegistry>,
    pub store: Arc<dyn AuditStore>,
    pub tracker: ConfirmationTracker,
    pub coordinator: CoordinatorHandle,
    pub pool: WorkerPool,
    max_frame_bytes: usize,
    shutdown: broadcast::Sender<()>,
    handles: Vec<JoinHandle<()>>,
}

impl Node {
    /// Start the coordinator and workers. Must be called inside a tokio runtime.
    pub fn spawn(
        settings: NodeSettings,
        registry: Arc<NodeRegistry>,
        store: Arc<dyn AuditStore>,
        connector: Arc<dyn Connector>,
    ) -> anyhow::Result<Self> {
        let NodeSettings {
            name,
            url,
            databases,
            workers,
            timing,
        } = settings;

        registry.ensure(
            &name,
            &NodePatch {
                url: Some(url.clone()),
                ..NodePatch::default()
            },
        )?;

        let (pool, inboxes) = WorkerPool::new(workers);
        let mut coordinator = SubscriptionCoordinator::new(
            name.clone(),
            databases.clone(),
            pool.worker_ids(),
            timing.subscribe_debounce(),
        );
        for database in &databases {
            if let Some(last) = store.last_applied_time(database) {
                coordinator.set_catchup(database, last);
            }
        }

        let (shutdown, _) = broadcast::channel(1);
        let feed = registry.subscribe(true)?;
        let (coordinator, coordinator_task) =
            spawn_coordinator(coordinator, pool.clone(), feed, shutdown.subscribe());

        let max_frame_bytes = timing.max_frame_bytes;
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let ctx = Arc::new(WorkerContext {
            local_name: name.clone(),
            store: store.clone(),
            connector,
            timing,
            events: events_tx,
        });
        let mut handles = spawn_workers(inboxes, ctx, &shutdown);
        handles.push(coordinator_task);
        handles.push(tokio::spawn(forward_events(
            events_rx,
            coordinator.clone(),
            shutdown.subscribe(),
        )));

        tracing::info!(
            node = %name,
            url = %url,
            databases = ?databases,
            workers,
            "node started"
        );

        Ok(Self {
            name,
            url,
            registry,
            store,
            tracker: ConfirmationTracker::default(),
            coordinator,
            pool,
            max_frame_bytes,
            shutdown,
            handles,
        })
    }

    /// What an inbound replication stream is served with.
    pub fn source_context(&self) -> SourceContext {
        SourceContext {
            local_name: self.name.clone(),
            store: self.store.clone(),
            tracker: self.tracker.clone(),
            max_frame_bytes: self.max_frame_bytes,
        }
    }

    pub fn shutdown_signal(&self) -> broadcast::Receiver<()> {
        self.shutdown.subscribe()
    }

    /// Stop every task and fail pending confirmation waiters.
    pub async fn stop(self) {
        let _ = self.shutdown.send(());
        self.tracker.shutdown();
        for handle in self.handles {
            let _ = handle.await;
        }
        tracing::info!(node = %self.name, "node stopped");
    }
}

/// Relay worker events into the coordinator's queue.
async fn forward_events(
    mut events: mpsc::UnboundedReceiver<WorkerEvent>,
    coordinator: CoordinatorHandle,
    mut shutdown: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else { break };
                let sent = match event {
                    WorkerEvent::Report { worker, report } => coordinator.report(worker, report).await,
                    WorkerEvent::Exited(worker) => coordinator.worker_exited(worker).await,
                };
                if let Err(e) = sent {
                    tracing::debug!(error = %e, "coordinator gone, dropping worker events");
                    break;
                }
            }
            _ = shutdown.recv() => break,
        }
    }
}
