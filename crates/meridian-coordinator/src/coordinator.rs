//! Subscription coordinator state machine.
//!
//! Owns the assignment map. Every input returns the `Directive`s the driver
//! must carry out; nothing here performs I/O or sleeps, so the same sequence
//! of inputs always produces the same sequence of directives.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use meridian_protocol::{SubscriptionNode, TxnTime, WorkerCommand, WorkerId, WorkerReport};
use meridian_registry::{
    should_replicate_to_node, subscription_start_time, table_selection, NodeRecord,
    RegistryEvent, Replicates,
};

use crate::assignment::{Assignment, AssignmentKey, LinkState};
use crate::status::{ClusterStatus, DatabaseSocket, NodeConnection};
use crate::{CoordinatorError, Result};

/// Work the driver must carry out after an input.
#[derive(Debug, Clone, PartialEq)]
pub enum Directive {
    /// Deliver `command` to `worker` (`None` is the coordinating process).
    Send {
        worker: Option<WorkerId>,
        command: WorkerCommand,
    },
    /// Call `activate(key)` after `delay`, replacing any timer already set for `key`.
    Schedule { key: AssignmentKey, delay: Duration },
    /// Drop the timer for `key`, if any.
    Cancel { key: AssignmentKey },
}

pub struct SubscriptionCoordinator {
    node_name: String,
    local_databases: Vec<String>,
    own_replicates: Option<Replicates>,
    /// Known peers, sorted by name. The sort order is the failover order.
    nodes: BTreeMap<String, NodeRecord>,
    assignments: BTreeMap<AssignmentKey, Assignment>,
    workers: Vec<WorkerId>,
    next_worker: usize,
    /// Last locally applied time per database, consumed by the first assignment.
    catchup: HashMap<String, TxnTime>,
    debounce: Duration,
}

impl SubscriptionCoordinator {
    pub fn new(
        node_name: impl Into<String>,
        local_databases: Vec<String>,
        workers: Vec<WorkerId>,
        debounce: Duration,
    ) -> Self {
        Self {
            node_name: node_name.into(),
            local_databases,
            own_replicates: None,
            nodes: BTreeMap::new(),
            assignments: BTreeMap::new(),
            workers,
            next_worker: 0,
            catchup: HashMap::new(),
            debounce,
        }
    }

    /// Ask the first peer assigned `database` to replay our own records from `last_local` on.
    pub fn set_catchup(&mut self, database: &str, last_local: TxnTime) {
        self.catchup.insert(database.to_string(), last_local);
    }

    pub fn node_name(&self) -> &str {
        &self.node_name
    }

    pub fn assignment(&self, key: &AssignmentKey) -> Option<&Assignment> {
        self.assignments.get(key)
    }

    pub fn assignments(&self) -> impl Iterator<Item = &Assignment> {
        self.assignments.values()
    }

    /// Key of the assignment whose primary is `node` for `database`.
    pub fn find(&self, node: &str, database: &str) -> Option<AssignmentKey> {
        self.assignments
            .values()
            .find(|a| a.primary() == node && a.database() == database)
            .map(|a| a.key.clone())
    }

    pub fn add_worker(&mut self, worker: WorkerId) {
        if !self.workers.contains(&worker) {
            self.workers.push(worker);
        }
    }

    // ========================================================================
    // Registry events
    // ========================================================================

    pub fn on_registry_event(&mut self, event: RegistryEvent) -> Result<Vec<Directive>> {
        match event {
            RegistryEvent::Put(record) => self.on_node_put(record),
            RegistryEvent::Delete { name } => Ok(self.on_node_delete(&name)),
        }
    }

    fn on_node_put(&mut self, record: NodeRecord) -> Result<Vec<Directive>> {
        if record.name == self.node_name {
            if self.own_replicates == record.replicates {
                return Ok(Vec::new());
            }
            self.own_replicates = record.replicates;
            tracing::info!(replicates = ?self.own_replicates, "own replication flag changed, re-evaluating peers");

            let peers: Vec<NodeRecord> = self.nodes.values().cloned().collect();
            let mut directives = Vec::new();
            for peer in &peers {
                match self.sync_node(peer) {
                    Ok(d) => directives.extend(d),
                    Err(e) => tracing::warn!(node = %peer.name, error = %e, "skipping node"),
                }
            }
            return Ok(directives);
        }

        self.nodes.insert(record.name.clone(), record.clone());
        self.sync_node(&record)
    }

    /// Bring every (node, local database) assignment in line with `record`.
    fn sync_node(&mut self, record: &NodeRecord) -> Result<Vec<Directive>> {
        let wanted: Vec<(String, bool)> = self
            .local_databases
            .iter()
            .map(|db| {
                let want = should_replicate_to_node(
                    record,
                    db,
                    &self.local_databases,
                    self.own_replicates,
                );
                (db.clone(), want)
            })
            .collect();

        let url = match &record.url {
            Some(url) => url.clone(),
            None if wanted.iter().any(|(_, want)| *want) => {
                return Err(CoordinatorError::Topology {
                    node: record.name.clone(),
                    reason: "replication requested but node has no url".into(),
                })
            }
            None => String::new(),
        };

        let mut directives = Vec::new();
        for (database, want) in wanted {
            match (want, self.find(&record.name, &database)) {
                (true, Some(key)) if key.url == url => {
                    directives.extend(self.refresh(&key, record));
                }
                (true, Some(key)) => {
                    tracing::info!(node = %record.name, database = %database, old = %key.url, new = %url, "node url changed");
                    let worker = self.assignments.get(&key).and_then(|a| a.worker);
                    directives.extend(self.remove(&key));
                    directives.extend(self.create(AssignmentKey::new(&url, &database), worker, record));
                }
                (true, None) => {
                    let worker = self.pick_worker();
                    directives.extend(self.create(AssignmentKey::new(&url, &database), worker, record));
                }
                (false, Some(key)) => {
                    tracing::info!(
                        node = %record.name,
                        database = %database,
                        replicates = ?record.replicates,
                        subscriptions = record.subscriptions.len(),
                        "node no longer replicates database, unsubscribing"
                    );
                    directives.extend(self.remove(&key));
                }
                (false, None) => {}
            }
        }
        Ok(directives)
    }

    fn on_node_delete(&mut self, name: &str) -> Vec<Directive> {
        self.nodes.remove(name);
        let mut directives = Vec::new();

        let owned: Vec<AssignmentKey> = self
            .assignments
            .values()
            .filter(|a| a.primary() == name)
            .map(|a| a.key.clone())
            .collect();
        for key in owned {
            tracing::info!(node = name, key = %key, "node deleted, unsubscribing");
            directives.extend(self.remove(&key));
        }

        // Stop forwarding the deleted node's records through other peers.
        for a in self.assignments.values_mut() {
            if a.contains(name) {
                a.nodes.retain(|n| n.name != name);
                if let LinkState::Redirected { merged, .. } = &mut a.state {
                    merged.retain(|n| n != name);
                }
                if a.state != LinkState::Pending {
                    directives.push(subscribe_directive(a));
                }
            }
        }
        directives
    }

    fn pick_worker(&mut self) -> Option<WorkerId> {
        if self.workers.is_empty() {
            return None;
        }
        let worker = self.workers.get(self.next_worker % self.workers.len()).copied();
        self.next_worker = self.next_worker.wrapping_add(1);
        worker
    }

    fn create(
        &mut self,
        key: AssignmentKey,
        worker: Option<WorkerId>,
        record: &NodeRecord,
    ) -> Vec<Directive> {
        let mut assignment = Assignment::new(
            key.clone(),
            worker,
            primary_entry(record, &key.database),
            table_selection(record, &key.database),
        );
        if let Some(last) = self.catchup.remove(&key.database) {
            tracing::info!(database = %key.database, node = %record.name, from = last, "requesting self-catchup");
            assignment.nodes.push(SubscriptionNode {
                name: self.node_name.clone(),
                url: None,
                start_time: Some(last),
                end_time: Some(now_ms()),
            });
        }
        tracing::info!(node = %record.name, key = %key, worker = ?worker, "assignment created");
        self.assignments.insert(key.clone(), assignment);
        vec![Directive::Schedule {
            key,
            delay: self.debounce,
        }]
    }

    /// Update the primary entry and table selection in place, keeping the worker.
    fn refresh(&mut self, key: &AssignmentKey, record: &NodeRecord) -> Vec<Directive> {
        let primary = primary_entry(record, &key.database);
        let tables = table_selection(record, &key.database);
        let Some(a) = self.assignments.get_mut(key) else {
            return Vec::new();
        };
        let mut changed = a.tables != tables;
        a.tables = tables;
        if let Some(first) = a.nodes.first_mut() {
            if *first != primary {
                *first = primary;
                changed = true;
            }
        }
        if !changed || a.state == LinkState::Pending {
            return Vec::new();
        }
        vec![subscribe_directive(a)]
    }

    fn remove(&mut self, key: &AssignmentKey) -> Vec<Directive> {
        let Some(a) = self.assignments.remove(key) else {
            return Vec::new();
        };
        let mut directives = Vec::new();
        if let LinkState::Redirected { to, merged } = &a.state {
            directives.extend(self.withdraw(to, merged));
        }
        if a.state == LinkState::Pending {
            directives.push(Directive::Cancel { key: key.clone() });
        } else {
            directives.push(Directive::Send {
                worker: a.worker,
                command: WorkerCommand::Unsubscribe {
                    database: a.key.database.clone(),
                    node: a.primary().to_string(),
                },
            });
        }

        // Anything redirected through the removed assignment has lost its path.
        let orphaned: Vec<AssignmentKey> = self
            .assignments
            .values()
            .filter(|o| matches!(&o.state, LinkState::Redirected { to, .. } if to == key))
            .map(|o| o.key.clone())
            .collect();
        for orphan in orphaned {
            if let Some(o) = self.assignments.get_mut(&orphan) {
                o.state = LinkState::Disconnected;
            }
            directives.extend(self.failover(&orphan));
        }
        directives
    }

    /// Remove `names` from `target`'s secondary entries.
    fn withdraw(&mut self, target: &AssignmentKey, names: &[String]) -> Vec<Directive> {
        let Some(t) = self.assignments.get_mut(target) else {
            return Vec::new();
        };
        let before = t.nodes.len();
        let primary = t.primary().to_string();
        t.nodes
            .retain(|n| n.name == primary || !names.contains(&n.name));
        if t.nodes.len() == before || t.state == LinkState::Pending {
            return Vec::new();
        }
        vec![subscribe_directive(t)]
    }

    // ========================================================================
    // Timers
    // ========================================================================

    /// Debounce elapsed: tell the owning worker to subscribe.
    pub fn activate(&mut self, key: &AssignmentKey) -> Vec<Directive> {
        let Some(a) = self.assignments.get_mut(key) else {
            return Vec::new();
        };
        if a.state != LinkState::Pending {
            return Vec::new();
        }
        a.state = LinkState::Assigned;
        let directive = subscribe_directive(a);
        // The self-catchup entry is requested once.
        let own = &self.node_name;
        a.nodes.retain(|n| &n.name != own);
        tracing::debug!(key = %key, worker = ?a.worker, "assignment activated");
        vec![directive]
    }

    // ========================================================================
    // Worker events
    // ========================================================================

    pub fn on_worker_report(
        &mut self,
        worker: Option<WorkerId>,
        report: WorkerReport,
    ) -> Result<Vec<Directive>> {
        let Some(key) = self.find(report.node(), report.database()) else {
            tracing::debug!(worker = ?worker, node = report.node(), database = report.database(), "report for unknown assignment ignored");
            return Ok(Vec::new());
        };
        if self.assignments.get(&key).is_some_and(|a| a.worker != worker) {
            tracing::debug!(worker = ?worker, key = %key, "report from previous owner ignored");
            return Ok(Vec::new());
        }
        match report {
            WorkerReport::Connected { latency_ms, .. } => Ok(self.on_connected(&key, latency_ms)),
            WorkerReport::Disconnected { reason, .. } => {
                tracing::warn!(key = %key, reason = %reason, "replication connection lost");
                Ok(self.on_disconnected(&key))
            }
        }
    }

    fn on_connected(&mut self, key: &AssignmentKey, latency_ms: f64) -> Vec<Directive> {
        let Some(a) = self.assignments.get_mut(key) else {
            return Vec::new();
        };
        a.latency_ms = Some(latency_ms);
        match std::mem::replace(&mut a.state, LinkState::Connected) {
            LinkState::Redirected { to, merged } => {
                tracing::info!(key = %key, target = %to, "reconnected, ending failover redirect");
                self.withdraw(&to, &merged)
            }
            _ => Vec::new(),
        }
    }

    fn on_disconnected(&mut self, key: &AssignmentKey) -> Vec<Directive> {
        let Some(a) = self.assignments.get_mut(key) else {
            return Vec::new();
        };
        if !a.state.is_live() {
            return Vec::new();
        }
        a.state = LinkState::Disconnected;
        self.failover(key)
    }

    /// Pull a lost assignment's origins through the next live peer in name order.
    fn failover(&mut self, key: &AssignmentKey) -> Vec<Directive> {
        let Some(lost) = self.assignments.get(key) else {
            return Vec::new();
        };
        let primary = lost.primary().to_string();
        let database = lost.key.database.clone();
        let entries = lost.nodes.clone();

        let names: Vec<String> = self.nodes.keys().cloned().collect();
        let target = failover_walk(&names, &primary).find_map(|name| {
            self.find(name, &database)
                .filter(|k| k != key)
                .filter(|k| self.assignments.get(k).is_some_and(|t| t.state.is_live()))
        });
        let Some(target) = target else {
            tracing::warn!(node = %primary, database = %database, "no peer available for failover");
            return Vec::new();
        };

        let mut merged = Vec::new();
        let mut directives = Vec::new();
        if let Some(t) = self.assignments.get_mut(&target) {
            for entry in entries {
                if !t.contains(&entry.name) {
                    merged.push(entry.name.clone());
                    t.nodes.push(SubscriptionNode { url: None, ..entry });
                }
            }
            if !merged.is_empty() && t.state != LinkState::Pending {
                directives.push(subscribe_directive(t));
            }
        }
        tracing::info!(node = %primary, database = %database, target = %target, merged = ?merged, "failing over");
        if let Some(a) = self.assignments.get_mut(key) {
            a.state = LinkState::Redirected { to: target, merged };
        }
        directives
    }

    /// Re-create every assignment owned by `worker` on the remaining workers.
    pub fn on_worker_exit(&mut self, worker: WorkerId) -> Vec<Directive> {
        self.workers.retain(|w| *w != worker);
        let owned: Vec<AssignmentKey> = self
            .assignments
            .values()
            .filter(|a| a.worker == Some(worker))
            .map(|a| a.key.clone())
            .collect();

        let mut directives = Vec::new();
        for key in owned {
            let Some(old) = self.assignments.remove(&key) else {
                continue;
            };
            if let LinkState::Redirected { to, merged } = &old.state {
                directives.extend(self.withdraw(to, merged));
            }
            let replacement = self.pick_worker();
            tracing::info!(key = %key, exited = worker, worker = ?replacement, "reassigning after worker exit");
            self.assignments.insert(
                key.clone(),
                Assignment {
                    worker: replacement,
                    state: LinkState::Pending,
                    latency_ms: None,
                    ..old
                },
            );
            directives.push(Directive::Schedule {
                key,
                delay: self.debounce,
            });
        }
        directives
    }

    // ========================================================================
    // Status
    // ========================================================================

    pub fn cluster_status(&self) -> ClusterStatus {
        let mut connections = Vec::new();
        for node in self.nodes.values() {
            let Some(url) = &node.url else {
                tracing::warn!(node = %node.name, "node has no url, omitted from cluster status");
                continue;
            };
            let database_sockets = self
                .assignments
                .values()
                .filter(|a| a.primary() == node.name)
                .map(|a| DatabaseSocket {
                    database: a.key.database.clone(),
                    connected: a.is_connected(),
                    latency: a.latency_ms,
                    nodes: a.nodes.iter().map(|n| n.name.clone()).collect(),
                    state: a.state.name().to_string(),
                    redirecting_to: match &a.state {
                        LinkState::Redirected { to, .. } => Some(to.to_string()),
                        _ => None,
                    },
                })
                .collect();
            connections.push(NodeConnection {
                node_name: node.name.clone(),
                url: url.clone(),
                database_sockets,
            });
        }
        ClusterStatus {
            node_name: self.node_name.clone(),
            is_enabled: self.own_replicates != Some(Replicates::Disabled),
            connections,
        }
    }
}

/// Names after `from` in circular order, excluding `from`. Empty if `from` is unknown.
fn failover_walk<'a>(names: &'a [String], from: &str) -> impl Iterator<Item = &'a String> {
    let start = names.iter().position(|n| n == from);
    let len = if start.is_some() { names.len() } else { 0 };
    let start = start.unwrap_or(0);
    (1..len).map(move |step| &names[(start + step) % len])
}

fn primary_entry(record: &NodeRecord, database: &str) -> SubscriptionNode {
    SubscriptionNode {
        name: record.name.clone(),
        url: record.url.clone(),
        start_time: subscription_start_time(record, database),
        end_time: None,
    }
}

fn subscribe_directive(a: &Assignment) -> Directive {
    Directive::Send {
        worker: a.worker,
        command: WorkerCommand::Subscribe {
            database: a.key.database.clone(),
            nodes: a.nodes.clone(),
            tables: a.tables.clone(),
        },
    }
}

fn now_ms() -> TxnTime {
    chrono::Utc::now().timestamp_micros() as f64 / 1000.0
}
