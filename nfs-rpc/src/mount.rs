//! One mounted server: its socket, congestion state and outstanding calls.
//!
//! ```text
//!  Mount (cheap clone) ──▶ MountInner
//!                           ├─ state: Mutex<MountState>   registry + congestion + socket slot
//!                           ├─ sock_lock                  receive-or-reconnect (streams)
//!                           ├─ stats                      shared with the engine
//!                           └─ events                     not responding / reconnect notices
//! ```
//!
//! The state mutex is a plain `std::sync::Mutex`. It is taken for short,
//! non-async critical sections only and is never held across an `.await`.
//! Callers never hold it while waiting for the socket lock.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::broadcast;

use crate::config::MountConfig;
use crate::congestion::{Congestion, Notice};
use crate::error::RpcError;
use crate::registry::Registry;
use crate::sock_lock::SocketLock;
use crate::stats::RpcStats;
use crate::transport::{self, SocketType, Transport};

const EVENT_CAPACITY: usize = 16;

/// Notable connection transitions, broadcast to subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MountEvent {
    NotResponding,
    Responding,
    Reconnecting,
    Reconnected,
}

/// A call that has been claimed for transmission and must now be written
/// to the socket outside the state lock.
pub(crate) struct PendingSend {
    pub transport: Arc<dyn Transport>,
    pub generation: u64,
    pub bytes: Arc<[u8]>,
}

pub(crate) struct MountState {
    /// `None` while disconnected.
    pub transport: Option<Arc<dyn Transport>>,
    /// Bumped on every (re)connect so a stale failure cannot tear down a
    /// newer socket.
    pub generation: u64,
    pub cong: Congestion,
    pub calls: Registry,
}

impl MountState {
    /// Flag `xid` as on the wire and, if nobody else is being timed, make it
    /// the RTT sample.
    pub fn mark_sent(&mut self, xid: u32) {
        let Some(rec) = self.calls.find_mut(xid) else {
            return;
        };
        if !rec.sent {
            rec.sent = true;
            self.cong.sent += 1;
        }
        rec.transmitted = true;
        if !rec.timing && self.cong.start_timing() {
            rec.timing = true;
        }
    }

    /// Take `xid` for transmission right now.
    pub fn claim_send(&mut self, xid: u32) -> Option<PendingSend> {
        let transport = self.transport.clone()?;
        let bytes = self.calls.find(xid)?.request.clone();
        self.mark_sent(xid);
        Some(PendingSend {
            transport,
            generation: self.generation,
            bytes,
        })
    }

    /// Unlink `xid`, keeping the connection counters consistent.
    pub fn unlink(&mut self, xid: u32) {
        if let Some(rec) = self.calls.remove(xid) {
            if rec.sent {
                self.cong.sent = self.cong.sent.saturating_sub(1);
            }
            if rec.timing {
                self.cong.stop_timing();
            }
        }
    }
}

pub(crate) struct MountInner {
    pub config: MountConfig,
    pub sotype: SocketType,
    /// Receives go through the socket lock.
    pub conn_required: bool,
    pub state: Mutex<MountState>,
    pub sock_lock: SocketLock,
    pub stats: Arc<RpcStats>,
    events: broadcast::Sender<MountEvent>,
}

impl MountInner {
    pub fn lock_state(&self) -> MutexGuard<'_, MountState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn current_transport(&self) -> Option<(Arc<dyn Transport>, u64)> {
        let st = self.lock_state();
        st.transport.clone().map(|t| (t, st.generation))
    }

    /// Drop the socket if it is still the one that failed.
    pub fn disconnect(&self, generation: u64) {
        let mut st = self.lock_state();
        if st.generation == generation && st.transport.take().is_some() {
            log::info!("[mount] {}: disconnected", self.config.server);
        }
    }

    /// Put a fresh socket in place. Nothing is on the wire any more, so the
    /// congestion state starts over and every outstanding call is resent.
    pub fn install(&self, transport: Arc<dyn Transport>) {
        let mut st = self.lock_state();
        st.transport = Some(transport);
        st.generation += 1;
        st.cong.reset(self.config.timeo);
        st.calls.mark_all_resend();
    }

    pub fn emit(&self, event: MountEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    pub fn notify(&self, notice: Notice) {
        match notice {
            Notice::NotResponding => {
                log::warn!("nfs server {}: not responding", self.config.server);
                self.emit(MountEvent::NotResponding);
            }
            Notice::Responding => {
                log::info!("nfs server {}: is alive again", self.config.server);
                self.emit(MountEvent::Responding);
            }
        }
    }
}

/// Handle to a mounted server. Clones share the same connection.
#[derive(Clone)]
pub struct Mount {
    pub(crate) inner: Arc<MountInner>,
}

impl std::fmt::Debug for Mount {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mount")
            .field("server", &self.inner.config.server)
            .field("sotype", &self.inner.sotype)
            .finish()
    }
}

impl Mount {
    /// Open the socket described by `config`.
    pub async fn connect(config: MountConfig, stats: Arc<RpcStats>) -> Result<Self, RpcError> {
        let transport = transport::connect(&config).await?;
        log::info!(
            "[mount] {}: connected over {}",
            config.server,
            transport.socket_type()
        );
        Ok(Self::with_transport(config, transport, stats))
    }

    /// Mount over an already open transport. Its socket type overrides the
    /// one in `config`.
    pub fn with_transport(
        mut config: MountConfig,
        transport: Arc<dyn Transport>,
        stats: Arc<RpcStats>,
    ) -> Self {
        let sotype = transport.socket_type();
        let conn_required = transport.conn_required();
        config.sotype = sotype;
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let state = MountState {
            transport: Some(transport),
            generation: 0,
            cong: Congestion::new(config.timeo),
            calls: Registry::new(),
        };
        Self {
            inner: Arc::new(MountInner {
                config,
                sotype,
                conn_required,
                state: Mutex::new(state),
                sock_lock: SocketLock::new(),
                stats,
                events,
            }),
        }
    }

    pub fn config(&self) -> &MountConfig {
        &self.inner.config
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MountEvent> {
        self.inner.events.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.inner.lock_state().transport.is_some()
    }

    /// Copy of the current congestion state.
    pub fn congestion(&self) -> Congestion {
        self.inner.lock_state().cong.clone()
    }

    /// Calls currently registered.
    pub fn outstanding(&self) -> usize {
        self.inner.lock_state().calls.len()
    }

    /// Calls currently clocking the RTT (never more than one).
    pub fn timing_calls(&self) -> usize {
        self.inner.lock_state().calls.timing_count()
    }

    /// Drop the socket. The next caller that needs it reconnects.
    pub fn disconnect(&self) {
        let generation = self.inner.lock_state().generation;
        self.inner.disconnect(generation);
    }
}
