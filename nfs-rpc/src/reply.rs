//! Receive side: waiting callers read replies and route them by xid.
//!
//! There is no dedicated receive task. Every caller blocked in
//! [`Mount::call`](crate::mount::Mount::call) takes a turn at reading the
//! socket, hands whatever arrives to [`MountInner::dispatch`], and goes back
//! to checking whether its own reply has turned up.
//!
//! ```text
//!  loop:
//!    own reply attached?        ──▶ return it
//!    given up / cancelled?      ──▶ return the error
//!    flagged for resend?        ──▶ send it again
//!    stream: take socket lock   (abandoned if woken first)
//!      no socket                ──▶ reconnect, flag every call for resend
//!    receive one message        ──▶ dispatch to its owner
//! ```

use tokio::sync::Notify;
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;

use crate::envelope;
use crate::error::{is_transient_io_error, RpcError};
use crate::mount::{MountEvent, MountInner, PendingSend};
use crate::transport::{self, RECEIVE_POLL};

/// What a waiter should do next.
enum Step {
    Done(Result<Vec<u8>, RpcError>),
    Resend(PendingSend),
    Receive,
}

/// Per-call wait parameters, cloned out of the record once.
pub(crate) struct Waiter {
    pub xid: u32,
    wake: std::sync::Arc<Notify>,
    cancel: Option<CancellationToken>,
    deadline: Option<Instant>,
}

impl Waiter {
    pub fn is_stopped(&self) -> bool {
        self.cancel.as_ref().is_some_and(|t| t.is_cancelled())
            || self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    fn stop_reason(&self) -> RpcError {
        match &self.cancel {
            Some(token) if token.is_cancelled() => RpcError::Interrupted,
            _ => RpcError::DeadlineExceeded,
        }
    }

    /// Resolves when the call is cancelled or its deadline passes; never
    /// resolves if it has neither.
    async fn stopped(&self) {
        let cancelled = async {
            match &self.cancel {
                Some(token) => token.cancelled().await,
                None => std::future::pending().await,
            }
        };
        let expired = async {
            match self.deadline {
                Some(at) => time::sleep_until(at).await,
                None => std::future::pending().await,
            }
        };
        tokio::select! {
            _ = cancelled => {}
            _ = expired => {}
        }
    }

    /// Something happened that the owner should look at.
    pub async fn interrupted(&self) {
        tokio::select! {
            _ = self.wake.notified() => {}
            _ = self.stopped() => {}
        }
    }
}

impl MountInner {
    pub(crate) fn waiter(&self, xid: u32) -> Result<Waiter, RpcError> {
        let st = self.lock_state();
        let rec = st.calls.find(xid).ok_or(RpcError::NotConnected)?;
        Ok(Waiter {
            xid,
            wake: rec.wake.clone(),
            cancel: rec.cancel.clone(),
            deadline: rec.deadline,
        })
    }

    /// Answered, given up, or already unlinked.
    pub(crate) fn is_settled(&self, xid: u32) -> bool {
        self.lock_state().calls.find(xid).is_none_or(|rec| rec.is_done())
    }

    /// Block until the call is answered or given up.
    pub(crate) async fn wait_for_reply(&self, waiter: &Waiter) -> Result<Vec<u8>, RpcError> {
        let xid = waiter.xid;
        loop {
            match self.poll_call(waiter) {
                Step::Done(result) => return result,
                Step::Resend(pending) => {
                    log::debug!("[reply] xid {xid:#010x}: resending");
                    self.transmit(waiter, pending).await?;
                    continue;
                }
                Step::Receive => {}
            }

            if self.conn_required {
                let Some(_sock) = self.sock_lock.acquire(waiter.interrupted()).await else {
                    continue;
                };
                // The reply may have been dispatched while we queued.
                if !self.still_waiting(waiter) {
                    continue;
                }
                self.receive_stream(waiter).await?;
            } else {
                self.receive_datagram(waiter).await?;
            }
        }
    }

    fn poll_call(&self, waiter: &Waiter) -> Step {
        let xid = waiter.xid;
        let mut guard = self.lock_state();
        let st = &mut *guard;
        let Some(rec) = st.calls.find_mut(xid) else {
            return Step::Done(Err(RpcError::NotConnected));
        };

        if let Some(reply) = rec.reply.take() {
            st.unlink(xid);
            return Step::Done(Ok(reply));
        }
        if let Some(why) = rec.soft_term {
            st.unlink(xid);
            return Step::Done(Err(why.into()));
        }
        if waiter.is_stopped() {
            st.unlink(xid);
            return Step::Done(Err(waiter.stop_reason()));
        }
        if rec.must_resend && st.transport.is_some() {
            rec.must_resend = false;
            if let Some(pending) = st.claim_send(xid) {
                return Step::Resend(pending);
            }
        }
        Step::Receive
    }

    fn still_waiting(&self, waiter: &Waiter) -> bool {
        let st = self.lock_state();
        match st.calls.find(waiter.xid) {
            Some(rec) => {
                !rec.is_done()
                    && !(rec.must_resend && st.transport.is_some())
                    && !waiter.is_stopped()
            }
            None => false,
        }
    }

    /// One turn at the stream socket. Called with the socket lock held.
    async fn receive_stream(&self, waiter: &Waiter) -> Result<(), RpcError> {
        let Some((transport, generation)) = self.current_transport() else {
            return self.reconnect(waiter).await;
        };
        tokio::select! {
            _ = waiter.interrupted() => {}
            res = time::timeout(RECEIVE_POLL, transport.receive()) => match res {
                Err(_elapsed) => {}
                Ok(Ok(msg)) => self.dispatch(msg),
                Ok(Err(e)) => {
                    log::warn!("[reply] {}: receive failed: {e}", self.config.server);
                    self.disconnect(generation);
                }
            },
        }
        Ok(())
    }

    /// One turn at the datagram socket. Errors that only mean "nothing for
    /// us yet" are swallowed; the timer keeps the call moving.
    async fn receive_datagram(&self, waiter: &Waiter) -> Result<(), RpcError> {
        let Some((transport, _)) = self.current_transport() else {
            let Some(_sock) = self.sock_lock.acquire(waiter.interrupted()).await else {
                return Ok(());
            };
            if self.current_transport().is_some() {
                return Ok(());
            }
            return self.reconnect(waiter).await;
        };
        tokio::select! {
            _ = waiter.interrupted() => {}
            res = time::timeout(RECEIVE_POLL, transport.receive()) => match res {
                Err(_elapsed) => {}
                Ok(Ok(msg)) => self.dispatch(msg),
                Ok(Err(RpcError::Io(e))) if is_transient_io_error(&e) => {
                    log::debug!("[reply] {}: receive error ignored: {e}", self.config.server);
                }
                Ok(Err(RpcError::RecordTooLarge(n))) => {
                    self.stats.invalid();
                    log::debug!("[reply] {}: dropping {n}-byte datagram", self.config.server);
                }
                Ok(Err(e)) => return Err(e),
            },
        }
        Ok(())
    }

    /// Route one received message to the call it answers.
    pub(crate) fn dispatch(&self, msg: Vec<u8>) {
        let Some(xid) = envelope::reply_xid(&msg) else {
            self.stats.invalid();
            log::debug!("[reply] {}: dropping non-reply message", self.config.server);
            return;
        };

        let notice = {
            let mut guard = self.lock_state();
            let st = &mut *guard;
            match st.calls.find_mut(xid) {
                Some(rec) if rec.reply.is_none() => {
                    if rec.timing {
                        st.cong.on_success(rec.rexmit > 0);
                        rec.timing = false;
                    }
                    if rec.sent {
                        rec.sent = false;
                        st.cong.sent = st.cong.sent.saturating_sub(1);
                    }
                    rec.set_reply(msg);
                    st.cong.on_reply_matched()
                }
                _ => {
                    self.stats.unexpected();
                    log::debug!(
                        "[reply] {}: unexpected reply xid {xid:#010x}",
                        self.config.server
                    );
                    return;
                }
            }
        };
        if let Some(notice) = notice {
            self.notify(notice);
        }
    }

    /// Keep connecting until it works, or until the waiting call is
    /// cancelled or runs out of time. Called with the socket lock held.
    async fn reconnect(&self, waiter: &Waiter) -> Result<(), RpcError> {
        log::info!("[reply] {}: reconnecting", self.config.server);
        self.emit(MountEvent::Reconnecting);
        loop {
            let attempt = tokio::select! {
                res = transport::connect(&self.config) => res,
                _ = waiter.stopped() => return Err(waiter.stop_reason()),
            };
            match attempt {
                Ok(t) => {
                    self.install(t);
                    log::info!("[reply] {}: reconnected", self.config.server);
                    self.emit(MountEvent::Reconnected);
                    return Ok(());
                }
                Err(e) => {
                    log::warn!("[reply] {}: connect failed: {e}", self.config.server);
                    tokio::select! {
                        _ = time::sleep(self.config.reconnect_delay) => {}
                        _ = waiter.stopped() => return Err(waiter.stop_reason()),
                    }
                }
            }
        }
    }
}
