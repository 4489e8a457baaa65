//! Replication workers -- the process manager boundary.
//!
//! Each worker is a task holding the subscriptions the coordinator assigned
//! to it, one session per (database, primary node). A session dials its
//! primary, runs the subscriber half of the protocol and, when the stream
//! drops for any reason, waits the flat reconnect delay and dials again.
//! Only an `Unsubscribe` (or the worker stopping) ends the retries.
//!
//! Workers never talk to the coordinator directly: connection changes and
//! worker exits are posted as `WorkerEvent`s which the node forwards.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use meridian_coordinator::{CoordinatorError, WorkerDispatch};
use meridian_protocol::{ReplicationTiming, WorkerCommand, WorkerId, WorkerReport};
use meridian_replication::{run_subscription, AuditStore, SubscriptionPlan};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;

use crate::transport::Connector;

#[derive(Debug, Clone, PartialEq)]
pub enum WorkerEvent {
    Report {
        worker: Option<WorkerId>,
        report: WorkerReport,
    },
    /// A network worker stopped while the node was still running.
    Exited(WorkerId),
}

/// Shared by every worker of a node.
pub struct WorkerContext {
    pub local_name: String,
    pub store: Arc<dyn AuditStore>,
    pub connector: Arc<dyn Connector>,
    pub timing: ReplicationTiming,
    pub events: mpsc::UnboundedSender<WorkerEvent>,
}

impl WorkerContext {
    fn post(&self, event: WorkerEvent) {
        if self.events.send(event).is_err() {
            tracing::debug!("worker event dropped, node is stopping");
        }
    }
}

type Inboxes = HashMap<Option<WorkerId>, mpsc::UnboundedSender<WorkerCommand>>;

/// Command side of the pool; the coordinator's dispatch target.
#[derive(Clone)]
pub struct WorkerPool {
    inboxes: Arc<Mutex<Inboxes>>,
}

/// Receiving end of one worker's command channel.
pub struct WorkerInbox {
    pub id: Option<WorkerId>,
    rx: mpsc::UnboundedReceiver<WorkerCommand>,
}

impl WorkerPool {
    /// Channels for `count` network workers plus the in-process runner (`None`).
    pub fn new(count: usize) -> (Self, Vec<WorkerInbox>) {
        let mut inboxes = HashMap::new();
        let mut receivers = Vec::with_capacity(count + 1);
        let ids = (0..count).map(Some).chain(std::iter::once(None));
        for id in ids {
            let (tx, rx) = mpsc::unbounded_channel();
            inboxes.insert(id, tx);
            receivers.push(WorkerInbox { id, rx });
        }
        (
            Self {
                inboxes: Arc::new(Mutex::new(inboxes)),
            },
            receivers,
        )
    }

    /// Network-serving worker ids, ascending.
    pub fn worker_ids(&self) -> Vec<WorkerId> {
        let mut ids: Vec<WorkerId> = self
            .inboxes
            .lock()
            .map(|m| m.keys().filter_map(|id| *id).collect())
            .unwrap_or_default();
        ids.sort_unstable();
        ids
    }
}

impl WorkerDispatch for WorkerPool {
    fn dispatch(&self, worker: Option<WorkerId>, command: WorkerCommand) -> meridian_coordinator::Result<()> {
        let inboxes = self
            .inboxes
            .lock()
            .map_err(|_| CoordinatorError::WorkerUnavailable(worker))?;
        inboxes
            .get(&worker)
            .ok_or(CoordinatorError::WorkerUnavailable(worker))?
            .send(command)
            .map_err(|_| CoordinatorError::WorkerUnavailable(worker))
    }
}

/// Spawn every worker. Network workers get a monitor that posts
/// `WorkerEvent::Exited` if they stop before `shutdown` fires.
pub fn spawn_workers(
    inboxes: Vec<WorkerInbox>,
    ctx: Arc<WorkerContext>,
    shutdown: &broadcast::Sender<()>,
) -> Vec<JoinHandle<()>> {
    let mut handles = Vec::with_capacity(inboxes.len());
    for inbox in inboxes {
        let id = inbox.id;
        let task = tokio::spawn(run_worker(id, inbox.rx, ctx.clone(), shutdown.subscribe()));
        let Some(worker) = id else {
            handles.push(task);
            continue;
        };

        let ctx = ctx.clone();
        let mut stopping = shutdown.subscribe();
        handles.push(tokio::spawn(async move {
            if let Err(e) = task.await {
                tracing::error!(worker, "worker task failed: {e}");
            }
            if stopping.try_recv().is_ok() {
                return;
            }
            tracing::warn!(worker, "worker exited");
            ctx.post(WorkerEvent::Exited(worker));
        }));
    }
    handles
}

struct Session {
    plan: watch::Sender<SubscriptionPlan>,
    /// Dropping the sender stops the session as well.
    stop: broadcast::Sender<()>,
    task: JoinHandle<()>,
}

impl Session {
    fn start(worker: Option<WorkerId>, plan: SubscriptionPlan, ctx: Arc<WorkerContext>) -> Self {
        let (plan, plan_rx) = watch::channel(plan);
        let (stop, stop_rx) = broadcast::channel(1);
        let task = tokio::spawn(run_session(worker, plan_rx, stop_rx, ctx));
        Self { plan, stop, task }
    }

    /// Replace the plan; a changed plan makes the session resubscribe.
    fn update(&self, plan: SubscriptionPlan) -> bool {
        self.plan.send_if_modified(|current| {
            if *current == plan {
                return false;
            }
            *current = plan;
            true
        })
    }

    fn stop(self) {
        let _ = self.stop.send(());
    }
}

/// Worker main loop: apply coordinator commands to the session table.
pub async fn run_worker(
    worker: Option<WorkerId>,
    mut inbox: mpsc::UnboundedReceiver<WorkerCommand>,
    ctx: Arc<WorkerContext>,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut sessions: HashMap<(String, String), Session> = HashMap::new();
    tracing::debug!(worker = ?worker, "replication worker started");

    loop {
        tokio::select! {
            cmd = inbox.recv() => match cmd {
                Some(WorkerCommand::Subscribe { database, nodes, tables }) => {
                    let Some(primary) = nodes.first() else {
                        tracing::warn!(worker = ?worker, database = %database, "subscribe without nodes ignored");
                        continue;
                    };
                    let key = (database.clone(), primary.name.clone());
                    let plan = SubscriptionPlan { database, nodes, tables };
                    match sessions.get(&key) {
                        Some(session) if !session.task.is_finished() => {
                            if session.update(plan) {
                                tracing::info!(worker = ?worker, database = %key.0, node = %key.1, "subscription updated");
                            }
                        }
                        _ => {
                            tracing::info!(worker = ?worker, database = %key.0, node = %key.1, "subscribing");
                            sessions.insert(key, Session::start(worker, plan, ctx.clone()));
                        }
                    }
                }
                Some(WorkerCommand::Unsubscribe { database, node }) => {
                    match sessions.remove(&(database.clone(), node.clone())) {
                        Some(session) => {
                            tracing::info!(worker = ?worker, database = %database, node = %node, "unsubscribing");
                            session.stop();
                        }
                        None => {
                            tracing::debug!(worker = ?worker, database = %database, node = %node, "unsubscribe for unknown session");
                        }
                    }
                }
                Some(WorkerCommand::Shutdown) | None => break,
            },
            _ = shutdown.recv() => break,
        }
    }

    for (_, session) in sessions.drain() {
        session.stop();
    }
    tracing::debug!(worker = ?worker, "replication worker stopped");
}

/// Dial, subscribe, and redial after the flat reconnect delay until stopped.
async fn run_session(
    worker: Option<WorkerId>,
    mut plan_rx: watch::Receiver<SubscriptionPlan>,
    mut stop: broadcast::Receiver<()>,
    ctx: Arc<WorkerContext>,
) {
    loop {
        let plan = plan_rx.borrow_and_update().clone();
        let Some(primary) = plan.primary().cloned() else {
            return;
        };
        let database = plan.database.clone();

        let reason = match primary.url.as_deref() {
            None => format!("peer {} has no url", primary.name),
            Some(url) => {
                let started = Instant::now();
                tokio::select! {
                    connected = ctx.connector.connect(&primary.name, url, &ctx.local_name) => match connected {
                        Ok(stream) => {
                            let latency_ms = started.elapsed().as_secs_f64() * 1000.0;
                            tracing::info!(worker = ?worker, database = %database, node = %primary.name, latency_ms, "connected");
                            ctx.post(WorkerEvent::Report {
                                worker,
                                report: WorkerReport::Connected {
                                    database: database.clone(),
                                    node: primary.name.clone(),
                                    latency_ms,
                                },
                            });

                            tokio::select! {
                                result = run_subscription(
                                    ctx.store.clone(),
                                    &plan,
                                    ctx.timing.confirm_interval(),
                                    ctx.timing.max_frame_bytes,
                                    stream.reader,
                                    stream.writer,
                                    stop.resubscribe(),
                                ) => match result {
                                    Ok(()) => "connection closed".to_string(),
                                    Err(e) => e.to_string(),
                                },
                                changed = plan_rx.changed() => {
                                    if changed.is_err() {
                                        return;
                                    }
                                    tracing::debug!(worker = ?worker, database = %database, node = %primary.name, "resubscribing with new node list");
                                    continue;
                                }
                                _ = stop.recv() => return,
                            }
                        }
                        Err(e) => e.to_string(),
                    },
                    changed = plan_rx.changed() => {
                        if changed.is_err() {
                            return;
                        }
                        continue;
                    }
                    _ = stop.recv() => return,
                }
            }
        };

        let delay = ctx.timing.reconnect_delay();
        tracing::warn!(worker = ?worker, database = %database, node = %primary.name, reason = %reason, "replication connection lost, retrying in {delay:?}");
        ctx.post(WorkerEvent::Report {
            worker,
            report: WorkerReport::Disconnected {
                database: database.clone(),
                node: primary.name.clone(),
                reason,
            },
        });

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            changed = plan_rx.changed() => {
                if changed.is_err() {
                    return;
                }
            }
            _ = stop.recv() => return,
        }
    }
}
