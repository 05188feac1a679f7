//! Periodic retransmit timer.
//!
//! One task per engine ticks every [`TICK`](crate::congestion::TICK) and
//! walks each live mount's calls oldest-first:
//!
//! - finished calls are skipped; cancelled (on `intr` mounts) or overdue
//!   calls are given up,
//! - the timed call advances the connection's RTT clock,
//! - a call whose own timer reaches the RTO has expired: it backs the
//!   connection off if it was being timed, leaves the in-flight count, and
//!   is either given up (more expiries on the wire than its retry budget)
//!   or, on datagram mounts only, sent again if the window allows. A call
//!   the window has held back since registration is not charged.

use std::io;
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::congestion::NFS_MAXREXMIT;
use crate::error::RpcError;
use crate::mount::MountInner;
use crate::registry::SoftTerm;
use crate::transport::SocketType;

/// Mounts the timer walks, in creation order.
pub(crate) type MountList = Arc<Mutex<Vec<Weak<MountInner>>>>;

/// Start the timer task. It runs until aborted.
pub(crate) fn spawn(mounts: MountList, tick: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(tick);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            let live: Vec<Arc<MountInner>> = {
                let mut list = mounts.lock().unwrap_or_else(PoisonError::into_inner);
                list.retain(|m| m.strong_count() > 0);
                list.iter().filter_map(Weak::upgrade).collect()
            };
            for mount in live {
                mount.tick();
            }
        }
    })
}

impl MountInner {
    /// One timer tick for this mount.
    pub(crate) fn tick(&self) {
        let mut notices = Vec::new();
        {
            let mut guard = self.lock_state();
            let st = &mut *guard;
            let Some(transport) = st.transport.clone() else {
                return;
            };
            let now = Instant::now();

            for xid in st.calls.xids() {
                let Some(rec) = st.calls.find_mut(xid) else {
                    continue;
                };
                if rec.is_done() {
                    continue;
                }
                if rec.cancel.as_ref().is_some_and(|t| t.is_cancelled()) {
                    rec.terminate(SoftTerm::Interrupted);
                    continue;
                }
                if rec.deadline.is_some_and(|d| now >= d) {
                    rec.terminate(SoftTerm::DeadlineExceeded);
                    continue;
                }

                if rec.timing {
                    st.cong.tick_rtt();
                }
                rec.timer += 1;
                if rec.timer < st.cong.rto {
                    continue;
                }

                // Expired.
                if rec.timing {
                    st.cong.back_off();
                    st.cong.stop_timing();
                    rec.timing = false;
                }
                if rec.sent {
                    rec.sent = false;
                    st.cong.sent = st.cong.sent.saturating_sub(1);
                }
                if rec.transmitted {
                    rec.rexmit = (rec.rexmit + 1).min(NFS_MAXREXMIT);
                    if let Some(notice) = st.cong.note_depth(rec.rexmit) {
                        notices.push(notice);
                    }
                }
                rec.rearm();

                if rec.rexmit > rec.retry {
                    log::debug!("[timer] xid {xid:#010x}: giving up after {} tries", rec.rexmit);
                    self.stats.timeout();
                    rec.terminate(SoftTerm::RetriesExhausted);
                    continue;
                }
                if self.sotype == SocketType::Stream || st.cong.sent >= st.cong.window {
                    continue;
                }

                match transport.try_send(&rec.request) {
                    Ok(()) => {
                        if rec.transmitted {
                            self.stats.retry();
                        }
                        rec.sent = true;
                        rec.transmitted = true;
                        st.cong.sent += 1;
                        if st.cong.start_timing() {
                            rec.timing = true;
                        }
                        log::debug!(
                            "[timer] xid {xid:#010x}: retransmit {} (rto {})",
                            rec.rexmit,
                            st.cong.rto
                        );
                    }
                    Err(RpcError::Io(e)) if e.kind() == io::ErrorKind::WouldBlock => {
                        rec.must_resend = true;
                        rec.wake.notify_one();
                    }
                    Err(e) => {
                        log::debug!("[timer] xid {xid:#010x}: retransmit failed: {e}");
                    }
                }
            }
        }
        for notice in notices {
            self.notify(notice);
        }
    }
}
