//! Coordinator actor.
//!
//! One task owns the `SubscriptionCoordinator`. Registry events, worker
//! reports, worker lifecycle changes, timer expiries and status queries are
//! all serialised through it, so no other task ever touches the assignment
//! map. Debounce timers are spawned tasks whose handles are kept per
//! assignment key and aborted when the assignment goes away.

use std::collections::HashMap;
use std::time::Duration;

use meridian_protocol::{WorkerCommand, WorkerId, WorkerReport};
use meridian_registry::RegistryEvent;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::assignment::AssignmentKey;
use crate::coordinator::{Directive, SubscriptionCoordinator};
use crate::status::ClusterStatus;
use crate::{CoordinatorError, Result};

const COMMAND_QUEUE: usize = 256;

#[derive(Debug)]
pub enum CoordinatorCommand {
    Report {
        worker: Option<WorkerId>,
        report: WorkerReport,
    },
    WorkerStarted(WorkerId),
    WorkerExited(WorkerId),
    /// A debounce timer fired.
    Activate { key: AssignmentKey, timer: u64 },
    ClusterStatus(oneshot::Sender<ClusterStatus>),
}

/// Delivers commands to workers (the process manager boundary).
pub trait WorkerDispatch: Send + Sync + 'static {
    /// `None` addresses the subscription runner inside the coordinating process.
    fn dispatch(&self, worker: Option<WorkerId>, command: WorkerCommand) -> Result<()>;
}

impl WorkerDispatch for mpsc::UnboundedSender<(Option<WorkerId>, WorkerCommand)> {
    fn dispatch(&self, worker: Option<WorkerId>, command: WorkerCommand) -> Result<()> {
        self.send((worker, command))
            .map_err(|_| CoordinatorError::WorkerUnavailable(worker))
    }
}

/// Cloneable front door to the actor.
#[derive(Debug, Clone)]
pub struct CoordinatorHandle {
    tx: mpsc::Sender<CoordinatorCommand>,
}

impl CoordinatorHandle {
    pub async fn report(&self, worker: Option<WorkerId>, report: WorkerReport) -> Result<()> {
        self.send(CoordinatorCommand::Report { worker, report }).await
    }

    pub async fn worker_started(&self, worker: WorkerId) -> Result<()> {
        self.send(CoordinatorCommand::WorkerStarted(worker)).await
    }

    pub async fn worker_exited(&self, worker: WorkerId) -> Result<()> {
        self.send(CoordinatorCommand::WorkerExited(worker)).await
    }

    pub async fn cluster_status(&self) -> Result<ClusterStatus> {
        let (tx, rx) = oneshot::channel();
        self.send(CoordinatorCommand::ClusterStatus(tx)).await?;
        rx.await.map_err(|_| CoordinatorError::Stopped)
    }

    async fn send(&self, cmd: CoordinatorCommand) -> Result<()> {
        self.tx.send(cmd).await.map_err(|_| CoordinatorError::Stopped)
    }
}

/// Debounce timers keyed by assignment.
struct Timers {
    pending: HashMap<AssignmentKey, (u64, JoinHandle<()>)>,
    next_id: u64,
    tx: mpsc::WeakSender<CoordinatorCommand>,
}

impl Timers {
    fn new(tx: mpsc::WeakSender<CoordinatorCommand>) -> Self {
        Self {
            pending: HashMap::new(),
            next_id: 0,
            tx,
        }
    }

    fn schedule(&mut self, key: AssignmentKey, delay: Duration) {
        self.next_id += 1;
        let timer = self.next_id;
        let tx = self.tx.clone();
        let fire_key = key.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(tx) = tx.upgrade() {
                let _ = tx
                    .send(CoordinatorCommand::Activate {
                        key: fire_key,
                        timer,
                    })
                    .await;
            }
        });
        if let Some((_, old)) = self.pending.insert(key, (timer, handle)) {
            old.abort();
        }
    }

    fn cancel(&mut self, key: &AssignmentKey) {
        if let Some((_, handle)) = self.pending.remove(key) {
            handle.abort();
        }
    }

    /// True if `timer` is still the live timer for `key`.
    fn fired(&mut self, key: &AssignmentKey, timer: u64) -> bool {
        match self.pending.get(key) {
            Some((id, _)) if *id == timer => {
                self.pending.remove(key);
                true
            }
            _ => false,
        }
    }
}

impl Drop for Timers {
    fn drop(&mut self) {
        for (_, (_, handle)) in self.pending.drain() {
            handle.abort();
        }
    }
}

/// Start the actor. Stops on `shutdown` or once every handle is dropped.
pub fn spawn_coordinator<D: WorkerDispatch>(
    coordinator: SubscriptionCoordinator,
    dispatch: D,
    registry: mpsc::UnboundedReceiver<RegistryEvent>,
    shutdown: broadcast::Receiver<()>,
) -> (CoordinatorHandle, JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(COMMAND_QUEUE);
    let timers = tx.downgrade();
    let task = tokio::spawn(run_coordinator(
        coordinator,
        dispatch,
        rx,
        timers,
        registry,
        shutdown,
    ));
    (CoordinatorHandle { tx }, task)
}

/// Actor loop. `scheduler` is how timers post back into `commands`.
pub async fn run_coordinator<D: WorkerDispatch>(
    mut coordinator: SubscriptionCoordinator,
    dispatch: D,
    mut commands: mpsc::Receiver<CoordinatorCommand>,
    scheduler: mpsc::WeakSender<CoordinatorCommand>,
    mut registry: mpsc::UnboundedReceiver<RegistryEvent>,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut timers = Timers::new(scheduler);
    let mut registry_open = true;
    tracing::info!(node = coordinator.node_name(), "coordinator started");

    loop {
        tokio::select! {
            event = registry.recv(), if registry_open => match event {
                Some(event) => {
                    let name = event.name().to_string();
                    match coordinator.on_registry_event(event) {
                        Ok(directives) => execute(directives, &dispatch, &mut timers),
                        Err(e) => tracing::warn!(node = %name, error = %e, "registry event handler failed"),
                    }
                }
                None => {
                    tracing::info!("registry feed closed");
                    registry_open = false;
                }
            },
            cmd = commands.recv() => match cmd {
                Some(cmd) => handle_command(&mut coordinator, cmd, &dispatch, &mut timers),
                None => break,
            },
            _ = shutdown.recv() => {
                tracing::info!("coordinator shutting down");
                break;
            }
        }
    }
}

fn handle_command<D: WorkerDispatch>(
    coordinator: &mut SubscriptionCoordinator,
    cmd: CoordinatorCommand,
    dispatch: &D,
    timers: &mut Timers,
) {
    match cmd {
        CoordinatorCommand::Report { worker, report } => {
            match coordinator.on_worker_report(worker, report) {
                Ok(directives) => execute(directives, dispatch, timers),
                Err(e) => tracing::warn!(worker = ?worker, error = %e, "worker report handler failed"),
            }
        }
        CoordinatorCommand::WorkerStarted(worker) => coordinator.add_worker(worker),
        CoordinatorCommand::WorkerExited(worker) => {
            tracing::warn!(worker, "worker exited");
            let directives = coordinator.on_worker_exit(worker);
            execute(directives, dispatch, timers);
        }
        CoordinatorCommand::Activate { key, timer } => {
            if timers.fired(&key, timer) {
                let directives = coordinator.activate(&key);
                execute(directives, dispatch, timers);
            }
        }
        CoordinatorCommand::ClusterStatus(reply) => {
            let _ = reply.send(coordinator.cluster_status());
        }
    }
}

fn execute<D: WorkerDispatch>(directives: Vec<Directive>, dispatch: &D, timers: &mut Timers) {
    for directive in directives {
        match directive {
            Directive::Send { worker, command } => {
                tracing::debug!(worker = ?worker, command = ?command, "dispatching");
                if let Err(e) = dispatch.dispatch(worker, command) {
                    tracing::warn!(error = %e, "worker dispatch failed");
                }
            }
            Directive::Schedule { key, delay } => timers.schedule(key, delay),
            Directive::Cancel { key } => timers.cancel(&key),
        }
    }
}
