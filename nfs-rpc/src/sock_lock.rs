//! Receive lock for connection-oriented mounts.
//!
//! Held for one full "receive a record, reconnecting on failure" sequence so
//! that two callers waiting on the same stream never interleave a reconnect
//! with a partial read. It guards no data; registry and congestion state live
//! behind the mount's own mutex, which must never be held while waiting here.

use std::future::Future;

use tokio::sync::{Mutex, MutexGuard};

#[derive(Debug, Default)]
pub struct SocketLock {
    inner: Mutex<()>,
}

/// Proof that the holder owns the receive side of the socket.
pub type SocketGuard<'a> = MutexGuard<'a, ()>;

impl SocketLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for the lock, abandoning the wait if `give_up` resolves first.
    ///
    /// `give_up` is the waiter's own "my reply arrived or I was terminated"
    /// condition; in that case `None` is returned and the caller re-checks its
    /// state without ever touching the socket.
    pub async fn acquire<F>(&self, give_up: F) -> Option<SocketGuard<'_>>
    where
        F: Future<Output = ()>,
    {
        tokio::select! {
            biased;
            guard = self.inner.lock() => Some(guard),
            _ = give_up => None,
        }
    }
}
