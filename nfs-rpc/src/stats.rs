//! Engine-wide RPC counters.
//!
//! Updated lock-free from call tasks and the timer; read with
//! [`RpcStats::snapshot`].

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct RpcStats {
    requests: AtomicU64,
    retries: AtomicU64,
    timeouts: AtomicU64,
    unexpected: AtomicU64,
    invalid: AtomicU64,
}

/// Point-in-time copy of [`RpcStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    /// Calls started.
    pub requests: u64,
    /// Timer retransmissions.
    pub retries: u64,
    /// Calls given up after exhausting their retry budget.
    pub timeouts: u64,
    /// Replies matching no outstanding call.
    pub unexpected: u64,
    /// Received messages that were not RPC replies.
    pub invalid: u64,
}

impl RpcStats {
    pub fn request(&self) {
        self.requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn retry(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn timeout(&self) {
        self.timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn unexpected(&self) {
        self.unexpected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn invalid(&self) {
        self.invalid.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            requests: self.requests.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            unexpected: self.unexpected.load(Ordering::Relaxed),
            invalid: self.invalid.load(Ordering::Relaxed),
        }
    }
}
