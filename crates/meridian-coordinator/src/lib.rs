//! Meridian Coordinator -- decides which worker replicates which peer.
//!
//! The coordinator turns node registry state into a minimal set of
//! subscriptions, one per (peer url, database), spread round-robin over the
//! network workers. It is split in two:
//!   - `SubscriptionCoordinator`: a synchronous state machine. Every input
//!     (registry event, worker report, worker exit, timer) returns the
//!     `Directive`s the driver must carry out.
//!   - `run_coordinator`: the actor that owns the state machine, drains a
//!     command queue and turns directives into worker messages and
//!     cancellable debounce timers.

pub mod actor;
pub mod assignment;
pub mod coordinator;
pub mod status;

pub use actor::{
    run_coordinator, spawn_coordinator, CoordinatorCommand, CoordinatorHandle, WorkerDispatch,
};
pub use assignment::{Assignment, AssignmentKey, LinkState};
pub use coordinator::{Directive, SubscriptionCoordinator};
pub use status::{ClusterStatus, DatabaseSocket, NodeConnection};

use meridian_protocol::WorkerId;

#[derive(Debug, thiserror::Error)]
pub enum CoordinatorError {
    #[error("topology error for node {node}: {reason}")]
    Topology { node: String, reason: String },
    #[error("worker {0:?} is not reachable")]
    WorkerUnavailable(Option<WorkerId>),
    #[error("coordinator has stopped")]
    Stopped,
}

pub type Result<T> = std::result::Result<T, CoordinatorError>;
