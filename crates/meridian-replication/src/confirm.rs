//! Confirmation tracker: wait until enough peers have received a write.
//!
//! Each (database, peer) pair owns one slot in a fixed arena of atomic
//! counters, addressed by index. A slot holds the bits of the highest
//! transaction time the peer has confirmed. Only the holder of the slot's
//! [`ConfirmationWriter`] may advance it; anyone may read it.
//!
//! Transaction times are non-negative, so the IEEE-754 bit patterns order the
//! same way as the values and `fetch_max` on the raw bits is a float max.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use meridian_protocol::TxnTime;
use tokio::sync::oneshot;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfirmationError {
    #[error("confirmation slot for {database}/{peer} is already held")]
    AlreadyClaimed { database: String, peer: String },
    #[error("confirmation arena full ({0} slots)")]
    ArenaFull(usize),
    #[error("confirmation tracker shut down")]
    Shutdown,
    #[error("lock poisoned")]
    LockPoisoned,
}

/// Default number of (database, peer) slots.
pub const DEFAULT_SLOTS: usize = 1024;

struct Slot {
    confirmed: AtomicU64,
    claimed: AtomicBool,
}

struct Waiter {
    txn_time: TxnTime,
    required: usize,
    confirmed_by: Vec<usize>,
    resolve: oneshot::Sender<Result<(), ConfirmationError>>,
}

#[derive(Default)]
struct Registry {
    index: HashMap<(String, String), usize>,
    by_database: HashMap<String, Vec<usize>>,
    waiters: HashMap<String, Vec<Waiter>>,
    shutdown: bool,
}

struct Arena {
    slots: Box<[Slot]>,
    registry: Mutex<Registry>,
}

impl Arena {
    fn registry(&self) -> Result<MutexGuard<'_, Registry>, ConfirmationError> {
        self.registry
            .lock()
            .map_err(|_| ConfirmationError::LockPoisoned)
    }

    fn load(&self, idx: usize) -> TxnTime {
        f64::from_bits(self.slots[idx].confirmed.load(Ordering::Acquire))
    }
}

#[derive(Clone)]
pub struct ConfirmationTracker {
    arena: Arc<Arena>,
}

impl Default for ConfirmationTracker {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_SLOTS)
    }
}

impl ConfirmationTracker {
    pub fn with_capacity(slots: usize) -> Self {
        let slots = (0..slots)
            .map(|_| Slot {
                confirmed: AtomicU64::new(0f64.to_bits()),
                claimed: AtomicBool::new(false),
            })
            .collect();
        Self {
            arena: Arc::new(Arena {
                slots,
                registry: Mutex::new(Registry::default()),
            }),
        }
    }

    fn slot_index(
        &self,
        registry: &mut Registry,
        database: &str,
        peer: &str,
    ) -> Result<usize, ConfirmationError> {
        let key = (database.to_string(), peer.to_string());
        if let Some(&idx) = registry.index.get(&key) {
            return Ok(idx);
        }
        let idx = registry.index.len();
        if idx >= self.arena.slots.len() {
            return Err(ConfirmationError::ArenaFull(self.arena.slots.len()));
        }
        registry.index.insert(key, idx);
        registry
            .by_database
            .entry(database.to_string())
            .or_default()
            .push(idx);
        Ok(idx)
    }

    /// Take the single writable handle for `(database, peer)`.
    pub fn claim(&self, database: &str, peer: &str) -> Result<ConfirmationWriter, ConfirmationError> {
        let mut registry = self.arena.registry()?;
        let idx = self.slot_index(&mut registry, database, peer)?;
        if self.arena.slots[idx].claimed.swap(true, Ordering::AcqRel) {
            return Err(ConfirmationError::AlreadyClaimed {
                database: database.to_string(),
                peer: peer.to_string(),
            });
        }
        Ok(ConfirmationWriter {
            arena: self.arena.clone(),
            database: database.to_string(),
            idx,
        })
    }

    /// Highest time `peer` has confirmed for `database`.
    pub fn confirmed_time(&self, database: &str, peer: &str) -> Option<TxnTime> {
        let registry = self.arena.registry().ok()?;
        let idx = *registry
            .index
            .get(&(database.to_string(), peer.to_string()))?;
        Some(self.arena.load(idx))
    }

    /// Register a waiter for `required` distinct peers reaching `txn_time`.
    ///
    /// Peers already at or past `txn_time` count immediately.
    pub fn register(
        &self,
        database: &str,
        txn_time: TxnTime,
        required: usize,
    ) -> Result<PendingConfirmation, ConfirmationError> {
        let (tx, rx) = oneshot::channel();
        let mut registry = self.arena.registry()?;
        if registry.shutdown {
            return Err(ConfirmationError::Shutdown);
        }

        let confirmed_by: Vec<usize> = registry
            .by_database
            .get(database)
            .into_iter()
            .flatten()
            .copied()
            .filter(|&idx| self.arena.load(idx) >= txn_time)
            .collect();

        if confirmed_by.len() >= required {
            let _ = tx.send(Ok(()));
        } else {
            registry
                .waiters
                .entry(database.to_string())
                .or_default()
                .push(Waiter {
                    txn_time,
                    required,
                    confirmed_by,
                    resolve: tx,
                });
        }
        Ok(PendingConfirmation { rx })
    }

    /// Number of unresolved waiters across all databases.
    pub fn pending(&self) -> usize {
        self.arena
            .registry()
            .map(|r| r.waiters.values().map(Vec::len).sum())
            .unwrap_or(0)
    }

    /// Fail every pending waiter and refuse new ones.
    pub fn shutdown(&self) {
        let Ok(mut registry) = self.arena.registry() else {
            return;
        };
        registry.shutdown = true;
        let mut failed = 0;
        for (_, waiters) in registry.waiters.drain() {
            for waiter in waiters {
                failed += 1;
                let _ = waiter.resolve.send(Err(ConfirmationError::Shutdown));
            }
        }
        if failed > 0 {
            tracing::info!(failed, "confirmation tracker shut down with pending waiters");
        }
    }
}

/// Future side of a registered waiter.
pub struct PendingConfirmation {
    rx: oneshot::Receiver<Result<(), ConfirmationError>>,
}

impl PendingConfirmation {
    pub async fn wait(self) -> Result<(), ConfirmationError> {
        self.rx.await.unwrap_or(Err(ConfirmationError::Shutdown))
    }
}

/// Exclusive writer for one (database, peer) counter. Released on drop.
pub struct ConfirmationWriter {
    arena: Arc<Arena>,
    database: String,
    idx: usize,
}

impl std::fmt::Debug for ConfirmationWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfirmationWriter")
            .field("database", &self.database)
            .field("slot", &self.idx)
            .finish()
    }
}

impl ConfirmationWriter {
    /// Raise the counter to `time`; lower values are ignored.
    pub fn advance(&self, time: TxnTime) {
        // -0.0 has the sign bit set and would outrank every positive time
        // under an unsigned max.
        if time.is_nan() || time.is_sign_negative() {
            return;
        }
        let new_bits = time.to_bits();
        let old = f64::from_bits(
            self.arena.slots[self.idx]
                .confirmed
                .fetch_max(new_bits, Ordering::AcqRel),
        );
        if time <= old {
            return;
        }

        let Ok(mut registry) = self.arena.registry() else {
            return;
        };
        let Some(waiters) = registry.waiters.get_mut(&self.database) else {
            return;
        };
        // Registration order; resolved waiters are removed in place.
        let idx = self.idx;
        waiters.retain_mut(|waiter| {
            if time >= waiter.txn_time && !waiter.confirmed_by.contains(&idx) {
                waiter.confirmed_by.push(idx);
            }
            if waiter.confirmed_by.len() >= waiter.required {
                let (tx, _) = oneshot::channel();
                let resolve = std::mem::replace(&mut waiter.resolve, tx);
                let _ = resolve.send(Ok(()));
                false
            } else {
                true
            }
        });
    }

    pub fn current(&self) -> TxnTime {
        self.arena.load(self.idx)
    }
}

impl Drop for ConfirmationWriter {
    fn drop(&mut self) {
        self.arena.slots[self.idx]
            .claimed
            .store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    async fn resolved(p: PendingConfirmation) -> Option<Result<(), ConfirmationError>> {
        tokio::time::timeout(Duration::from_millis(50), p.wait()).await.ok()
    }

    #[tokio::test]
    async fn test_two_distinct_peers_required() {
        let tracker = ConfirmationTracker::default();
        let b = tracker.claim("data", "node-b").unwrap();
        let c = tracker.claim("data", "node-c").unwrap();

        let pending = tracker.register("data", 100.0, 2).unwrap();
        b.advance(200.0);
        b.advance(250.0);
        assert_eq!(tracker.pending(), 1, "one peer twice must not resolve");

        c.advance(100.0);
        assert_eq!(tracker.pending(), 0);
        assert_eq!(resolved(pending).await, Some(Ok(())));
    }

    #[tokio::test]
    async fn test_never_resolves_early() {
        let tracker = ConfirmationTracker::default();
        let b = tracker.claim("data", "node-b").unwrap();
        let pending = tracker.register("data", 100.0, 1).unwrap();
        b.advance(99.9);
        assert!(resolved(pending).await.is_none());
    }

    #[tokio::test]
    async fn test_already_confirmed_peers_count() {
        let tracker = ConfirmationTracker::default();
        let b = tracker.claim("data", "node-b").unwrap();
        b.advance(500.0);
        let pending = tracker.register("data", 100.0, 1).unwrap();
        assert_eq!(tracker.pending(), 0);
        assert_eq!(resolved(pending).await, Some(Ok(())));
    }

    #[tokio::test]
    async fn test_other_database_does_not_count() {
        let tracker = ConfirmationTracker::default();
        let other = tracker.claim("other", "node-b").unwrap();
        let pending = tracker.register("data", 1.0, 1).unwrap();
        other.advance(10.0);
        assert_eq!(tracker.pending(), 1);
        tracker.shutdown();
        assert_eq!(resolved(pending).await, Some(Err(ConfirmationError::Shutdown)));
    }

    #[tokio::test]
    async fn test_waiters_resolve_in_registration_order() {
        let tracker = ConfirmationTracker::default();
        let b = tracker.claim("data", "node-b").unwrap();
        let early = tracker.register("data", 10.0, 1).unwrap();
        let late = tracker.register("data", 20.0, 1).unwrap();
        b.advance(15.0);
        assert_eq!(tracker.pending(), 1);
        assert_eq!(resolved(early).await, Some(Ok(())));
        b.advance(20.0);
        assert_eq!(resolved(late).await, Some(Ok(())));
    }

    #[test]
    fn test_single_writer() {
        let tracker = ConfirmationTracker::default();
        let writer = tracker.claim("data", "node-b").unwrap();
        assert!(matches!(
            tracker.claim("data", "node-b"),
            Err(ConfirmationError::AlreadyClaimed { .. })
        ));
        drop(writer);
        let again = tracker.claim("data", "node-b").unwrap();
        // The confirmed time survives a handover.
        again.advance(3.0);
        drop(again);
        assert_eq!(tracker.confirmed_time("data", "node-b"), Some(3.0));
    }

    #[test]
    fn test_counter_is_monotonic() {
        let tracker = ConfirmationTracker::default();
        let b = tracker.claim("data", "node-b").unwrap();
        b.advance(5.0);
        b.advance(2.0);
        b.advance(f64::NAN);
        assert_eq!(b.current(), 5.0);
    }

    #[test]
    fn test_negative_zero_ignored() {
        let tracker = ConfirmationTracker::default();
        let b = tracker.claim("data", "node-b").unwrap();
        b.advance(-0.0);
        assert_eq!(b.current().to_bits(), 0f64.to_bits());
        b.advance(500.0);
        assert_eq!(b.current(), 500.0);
        assert_eq!(tracker.confirmed_time("data", "node-b"), Some(500.0));
    }

    #[test]
    fn test_arena_full() {
        let tracker = ConfirmationTracker::with_capacity(1);
        let _a = tracker.claim("data", "a").unwrap();
        assert_eq!(
            tracker.claim("data", "b").unwrap_err(),
            ConfirmationError::ArenaFull(1)
        );
    }

    #[tokio::test]
    async fn test_register_after_shutdown() {
        let tracker = ConfirmationTracker::default();
        tracker.shutdown();
        assert!(matches!(
            tracker.register("data", 1.0, 1),
            Err(ConfirmationError::Shutdown)
        ));
    }

    #[test]
    fn test_zero_required_resolves_immediately() {
        let tracker = ConfirmationTracker::default();
        tracker.register("data", 1.0, 0).unwrap();
        assert_eq!(tracker.pending(), 0);
    }

    proptest::proptest! {
        #[test]
        fn prop_counter_holds_the_maximum(times in proptest::collection::vec(0.0f64..1e12, 1..40)) {
            let tracker = ConfirmationTracker::default();
            let writer = tracker.claim("data", "node-b").unwrap();
            for t in &times {
                writer.advance(*t);
            }
            let max = times.iter().copied().fold(0.0, f64::max);
            proptest::prop_assert_eq!(writer.current(), max);
        }
    }
}
