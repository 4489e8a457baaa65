//! Replication timing parameters.
//!
//! Every node in a cluster should run with the same values; the reconnect
//! delay and debounce may be overridden locally from `[replication]` config.

use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplicationTiming {
    /// Flat delay before a dropped session is re-dialled.
    pub reconnect_delay_ms: u64,
    /// Delay between creating an assignment and telling its worker to subscribe.
    pub subscribe_debounce_ms: u64,
    /// How often a subscriber reports RECEIVED_UP_TO to its source.
    pub confirm_interval_ms: u64,

    // -- Transport --
    /// QUIC idle timeout in seconds (must be > keepalive interval).
    pub idle_timeout_secs: u64,
    /// QUIC keepalive interval in seconds.
    pub keepalive_interval_secs: u64,
    /// Maximum frame body size in bytes.
    pub max_frame_bytes: usize,
}

impl ReplicationTiming {
    pub const fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub const fn subscribe_debounce(&self) -> Duration {
        Duration::from_millis(self.subscribe_debounce_ms)
    }

    pub const fn confirm_interval(&self) -> Duration {
        Duration::from_millis(self.confirm_interval_ms)
    }
}

pub const DEFAULT_TIMING: ReplicationTiming = ReplicationTiming {
    reconnect_delay_ms: 1000,
    subscribe_debounce_ms: 200,
    confirm_interval_ms: 100,

    idle_timeout_secs: 60,
    keepalive_interval_secs: 10,
    max_frame_bytes: 16 * 1024 * 1024, // 16 MB -- large initial snapshots
};
