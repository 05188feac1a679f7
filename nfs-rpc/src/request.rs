//! The public call path: [`Mount::call`].
//!
//! 1. Work out the retry budget and initial timer bias for the call.
//! 2. Build the envelope (record-marked on streams) and register it.
//! 3. Send it straight away if the connection has room, otherwise leave it
//!    for the timer.
//! 4. Wait for the reply, driving the receive side while waiting.
//! 5. Unlink and decode the reply envelope.

use std::io;
use std::sync::Arc;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::RetryPolicy;
use crate::congestion::{NFS_MAXREXMIT, NFS_MINIDEMTIMEO, NFS_RELIABLETIMEO};
use crate::envelope::{self, Credentials};
use crate::error::{is_transient_io_error, RpcError};
use crate::mount::{Mount, MountInner, PendingSend};
use crate::procs;
use crate::record;
use crate::registry::CallRecord;
use crate::reply::Waiter;
use crate::transport::SocketType;

/// What to call.
#[derive(Debug, Clone)]
pub struct CallRequest {
    pub program: u32,
    pub version: u32,
    pub procedure: u32,
    pub credentials: Credentials,
    /// Marshaled procedure arguments.
    pub body: Vec<u8>,
    /// Repeating the call is harmless.
    pub idempotent: bool,
    /// The results start with a status word; non-zero becomes
    /// [`RpcError::Server`].
    pub status_word: bool,
}

impl CallRequest {
    /// A generic call with no credentials, treated as idempotent.
    pub fn new(program: u32, version: u32, procedure: u32, body: Vec<u8>) -> Self {
        Self {
            program,
            version,
            procedure,
            credentials: Credentials::None,
            body,
            idempotent: true,
            status_word: false,
        }
    }

    /// An NFS version 2 call. Idempotency comes from the procedure table and
    /// every procedure but `null` carries a status word.
    pub fn nfs(procedure: u32, credentials: Credentials, body: Vec<u8>) -> Self {
        Self {
            program: procs::NFS_PROG,
            version: procs::NFS_VER2,
            procedure,
            credentials,
            body,
            idempotent: procs::is_idempotent(procedure),
            status_word: procedure != procs::NFSPROC_NULL,
        }
    }
}

/// How long to keep trying.
#[derive(Debug, Clone, Default)]
pub struct CallPolicy {
    /// Cancels the call. Only honoured on interruptible (`intr`) mounts.
    pub cancel: Option<CancellationToken>,
    /// Give up with [`RpcError::DeadlineExceeded`] at this instant.
    pub deadline: Option<Instant>,
    /// Retry as if the mount were hard.
    pub force_hard: bool,
}

/// Retransmissions allowed before a call is given up.
pub fn retry_budget(policy: RetryPolicy, retry: u32, force_hard: bool) -> u32 {
    match policy {
        _ if force_hard => NFS_MAXREXMIT + 1,
        RetryPolicy::Hard => NFS_MAXREXMIT + 1,
        RetryPolicy::Soft | RetryPolicy::Spongy => retry,
    }
}

/// Initial per-call timer offset, in ticks.
pub fn timer_bias(sotype: SocketType, idempotent: bool) -> i32 {
    match sotype {
        SocketType::Stream => NFS_RELIABLETIMEO,
        SocketType::Datagram if idempotent => 0,
        SocketType::Datagram => NFS_MINIDEMTIMEO,
    }
}

/// Unlinks the call however the call future ends, including being dropped.
struct CallGuard<'a> {
    inner: &'a MountInner,
    xid: u32,
}

impl Drop for CallGuard<'_> {
    fn drop(&mut self) {
        self.inner.lock_state().unlink(self.xid);
    }
}

impl Mount {
    /// Perform one RPC and return the procedure results.
    pub async fn call(&self, req: CallRequest, policy: CallPolicy) -> Result<Vec<u8>, RpcError> {
        let inner = &*self.inner;
        inner.stats.request();

        let retry = retry_budget(inner.config.policy, inner.config.retry, policy.force_hard);
        let bias = timer_bias(inner.sotype, req.idempotent);
        let cancel = if inner.config.intr { policy.cancel } else { None };

        let (xid, pending) = {
            let mut st = inner.lock_state();
            let xid = st.calls.register(|xid| {
                let msg = envelope::encode_call(
                    xid,
                    req.program,
                    req.version,
                    req.procedure,
                    &req.credentials,
                    &req.body,
                );
                let request: Arc<[u8]> = match inner.sotype {
                    SocketType::Stream => record::frame(&msg).into(),
                    SocketType::Datagram => msg.into(),
                };
                let mut rec = CallRecord::new(xid, request, retry, bias);
                rec.cancel = cancel;
                rec.deadline = policy.deadline;
                rec
            });

            let pending = match (inner.sotype, st.transport.is_some()) {
                (SocketType::Stream, true) => st.claim_send(xid),
                (SocketType::Datagram, true) if st.cong.can_send() => st.claim_send(xid),
                (SocketType::Datagram, true) => None,
                (_, false) => {
                    if let Some(rec) = st.calls.find_mut(xid) {
                        rec.must_resend = true;
                    }
                    None
                }
            };
            (xid, pending)
        };
        let _guard = CallGuard { inner, xid };

        let proc_name = match req.program {
            procs::NFS_PROG => procs::name(req.procedure),
            _ => "-",
        };
        log::debug!(
            "[call] xid {xid:#010x} prog {} vers {} proc {} {proc_name} ({}) {}",
            req.program,
            req.version,
            req.procedure,
            if pending.is_some() { "sent" } else { "deferred" },
            inner.config.server,
        );

        let waiter = inner.waiter(xid)?;
        if let Some(pending) = pending {
            inner.transmit(&waiter, pending).await?;
        }
        let reply = inner.wait_for_reply(&waiter).await?;
        envelope::decode_reply(&reply, req.status_word)
    }
}

/// Drops the stream if a record write stops part way through. A half
/// written record leaves the peer unable to find the next record mark.
struct WriteGuard<'a> {
    inner: &'a MountInner,
    generation: u64,
    armed: bool,
}

impl Drop for WriteGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            log::warn!(
                "[call] {}: record write abandoned, dropping connection",
                self.inner.config.server
            );
            self.inner.disconnect(self.generation);
        }
    }
}

impl MountInner {
    /// Write a claimed call to the socket.
    ///
    /// The write gives way once the call is stopped or given up, and a
    /// stream write given up on takes the connection with it.
    ///
    /// "Would block" flags the call for resend. On a stream any other error
    /// drops the socket so the next receiver reconnects; on a datagram
    /// socket transient errors are ignored and the timer retransmits.
    pub(crate) async fn transmit(
        &self,
        waiter: &Waiter,
        pending: PendingSend,
    ) -> Result<(), RpcError> {
        let xid = waiter.xid;
        let PendingSend {
            transport,
            generation,
            bytes,
        } = pending;

        let mut guard = WriteGuard {
            inner: self,
            generation,
            armed: transport.conn_required(),
        };
        let send = transport.send(&bytes);
        tokio::pin!(send);
        let res = loop {
            tokio::select! {
                res = &mut send => break res,
                _ = waiter.interrupted() => {
                    if waiter.is_stopped() || self.is_settled(xid) {
                        log::debug!("[call] xid {xid:#010x}: send abandoned");
                        // The guard drops the stream; the owner's next poll
                        // reports why.
                        return Ok(());
                    }
                }
            }
        };
        guard.armed = false;

        match res {
            Ok(()) => Ok(()),
            Err(RpcError::Io(e)) if e.kind() == io::ErrorKind::WouldBlock => {
                if let Some(rec) = self.lock_state().calls.find_mut(xid) {
                    rec.must_resend = true;
                }
                Ok(())
            }
            Err(e) if transport.conn_required() => {
                log::warn!("[call] {}: send failed: {e}", self.config.server);
                self.disconnect(generation);
                Ok(())
            }
            Err(RpcError::Io(e)) if is_transient_io_error(&e) => {
                log::debug!("[call] xid {xid:#010x}: send error ignored: {e}");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    use crate::config::MountConfig;
    use crate::congestion::{NFS_FISHY, NFS_RETRANS};
    use crate::mount::MountEvent;
    use crate::stats::RpcStats;
    use crate::transport::mock::MockTransport;

    type Replies = tokio::sync::mpsc::UnboundedSender<Vec<u8>>;

    fn mount(sotype: SocketType, cfg: MountConfig) -> (Mount, Arc<MockTransport>, Replies) {
        let (t, replies) = MockTransport::new(sotype);
        let m = Mount::with_transport(cfg, t.clone(), Arc::new(RpcStats::default()));
        (m, t, replies)
    }

    fn spawn_call(m: &Mount) -> tokio::task::JoinHandle<Result<Vec<u8>, RpcError>> {
        let m = m.clone();
        tokio::spawn(async move {
            m.call(CallRequest::new(7, 1, 1, Vec::new()), CallPolicy::default())
                .await
        })
    }

    async fn until<F: Fn() -> bool>(cond: F) {
        for _ in 0..1000 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        panic!("condition never became true");
    }

    fn check_counters(m: &Mount) {
        let st = m.inner.lock_state();
        assert_eq!(st.cong.sent as usize, st.calls.sent_count());
        assert!(st.calls.timing_count() <= 1);
        assert_eq!(st.calls.timing_count() == 1, st.cong.rtt.is_some());
    }

    #[test]
    fn budgets() {
        assert_eq!(retry_budget(RetryPolicy::Hard, 3, false), NFS_MAXREXMIT + 1);
        assert_eq!(retry_budget(RetryPolicy::Soft, 3, false), 3);
        assert_eq!(retry_budget(RetryPolicy::Soft, 3, true), NFS_MAXREXMIT + 1);
        assert_eq!(retry_budget(RetryPolicy::Spongy, 3, false), 3);
        assert_eq!(retry_budget(RetryPolicy::Spongy, 3, true), NFS_MAXREXMIT + 1);
    }

    #[test]
    fn biases() {
        assert_eq!(timer_bias(SocketType::Stream, true), NFS_RELIABLETIMEO);
        assert_eq!(timer_bias(SocketType::Datagram, false), NFS_MINIDEMTIMEO);
        assert_eq!(timer_bias(SocketType::Datagram, true), 0);
    }

    #[test]
    fn nfs_requests_use_procedure_table() {
        let write = CallRequest::nfs(procs::NFSPROC_WRITE, Credentials::None, Vec::new());
        assert!(!write.idempotent);
        assert!(write.status_word);
        let null = CallRequest::nfs(procs::NFSPROC_NULL, Credentials::None, Vec::new());
        assert!(null.idempotent);
        assert!(!null.status_word);
    }

    #[tokio::test]
    async fn third_call_waits_for_window() {
        let (m, t, replies) = mount(SocketType::Datagram, MountConfig::default());
        m.inner.lock_state().cong.rto = 25;

        let calls: Vec<_> = (0..3).map(|_| spawn_call(&m)).collect();
        until(|| m.outstanding() == 3).await;

        assert_eq!(t.sent().len(), 2);
        assert_eq!(m.congestion().sent, 2);
        assert_eq!(m.timing_calls(), 1);
        check_counters(&m);

        // Answer everything that went out; the third call is still parked.
        for xid in t.sent_xids() {
            replies.send(envelope::encode_success(xid, b"ok")).unwrap();
        }
        until(|| m.outstanding() == 1).await;
        assert_eq!(t.sent().len(), 2);
        check_counters(&m);

        // The timer picks it up once its own timer expires.
        for _ in 0..25 {
            if t.sent().len() == 3 {
                break;
            }
            m.inner.tick();
        }
        assert_eq!(t.sent().len(), 3);
        let last = *t.sent_xids().last().unwrap();
        replies.send(envelope::encode_success(last, b"ok")).unwrap();

        for c in calls {
            assert_eq!(c.await.unwrap().unwrap(), b"ok");
        }
        assert_eq!(m.outstanding(), 0);
        check_counters(&m);
    }

    #[tokio::test]
    async fn one_timing_call_under_concurrency() {
        let (m, t, replies) = mount(SocketType::Datagram, MountConfig::default());
        m.inner.lock_state().cong.window = 64;

        let calls: Vec<_> = (0..8).map(|_| spawn_call(&m)).collect();
        until(|| m.outstanding() == 8).await;
        assert_eq!(t.sent().len(), 8);
        assert_eq!(m.timing_calls(), 1);
        check_counters(&m);

        for xid in t.sent_xids() {
            replies.send(envelope::encode_success(xid, &[])).unwrap();
            tokio::task::yield_now().await;
            check_counters(&m);
        }
        for c in calls {
            c.await.unwrap().unwrap();
        }
        check_counters(&m);
        assert!(m.congestion().rtt.is_none());
    }

    #[tokio::test]
    async fn soft_call_gives_up_after_budget() {
        let cfg = MountConfig {
            policy: RetryPolicy::Soft,
            retry: 3,
            ..MountConfig::default()
        };
        let (m, t, _replies) = mount(SocketType::Datagram, cfg);
        let call = spawn_call(&m);
        until(|| m.outstanding() == 1).await;

        for _ in 0..500 {
            m.inner.tick();
        }
        assert!(matches!(call.await.unwrap(), Err(RpcError::TimedOut)));
        // The first transmission plus `retry` retransmits.
        assert_eq!(t.sent().len(), 4);
        let stats = m.inner.stats.snapshot();
        assert_eq!(stats.retries, 3);
        assert_eq!(stats.timeouts, 1);
        assert_eq!(m.outstanding(), 0);
        check_counters(&m);
    }

    #[tokio::test]
    async fn retrans_one_allows_one_retransmit() {
        let cfg = MountConfig {
            policy: RetryPolicy::Soft,
            retry: 1,
            ..MountConfig::default()
        };
        let (m, t, _replies) = mount(SocketType::Datagram, cfg);
        let call = spawn_call(&m);
        until(|| m.outstanding() == 1).await;

        for _ in 0..500 {
            m.inner.tick();
        }
        assert!(matches!(call.await.unwrap(), Err(RpcError::TimedOut)));
        assert_eq!(t.sent().len(), 2);
        let stats = m.inner.stats.snapshot();
        assert_eq!(stats.retries, 1);
        assert_eq!(stats.timeouts, 1);
    }

    #[tokio::test]
    async fn window_held_call_is_not_charged_until_sent() {
        let cfg = MountConfig {
            policy: RetryPolicy::Soft,
            retry: 1,
            ..MountConfig::default()
        };
        let (m, t, _replies) = mount(SocketType::Datagram, cfg);
        m.inner.lock_state().cong.window = 1;

        let first = spawn_call(&m);
        until(|| m.outstanding() == 1).await;
        let second = spawn_call(&m);
        until(|| m.outstanding() == 2).await;
        assert_eq!(t.sent().len(), 1);

        // The second call expires several times while the first holds the
        // window, and only starts spending its budget once it is out.
        for _ in 0..2000 {
            m.inner.tick();
        }
        assert!(matches!(first.await.unwrap(), Err(RpcError::TimedOut)));
        assert!(matches!(second.await.unwrap(), Err(RpcError::TimedOut)));

        let xids = t.sent_xids();
        assert_eq!(xids.len(), 4, "sent {xids:x?}");
        assert_eq!(xids[0], xids[1]);
        assert_eq!(xids[2], xids[3]);
        assert_ne!(xids[0], xids[2]);
        let stats = m.inner.stats.snapshot();
        assert_eq!(stats.retries, 2);
        assert_eq!(stats.timeouts, 2);
        check_counters(&m);
    }

    #[tokio::test]
    async fn hard_call_keeps_retrying() {
        let (m, t, replies) = mount(SocketType::Datagram, MountConfig::default());
        let call = spawn_call(&m);
        until(|| m.outstanding() == 1).await;
        for _ in 0..(NFS_RETRANS as usize * 700) {
            m.inner.tick();
        }
        assert!(!call.is_finished());
        assert!(t.sent().len() > NFS_RETRANS as usize);
        let xid = t.sent_xids()[0];
        replies.send(envelope::encode_success(xid, &[])).unwrap();
        call.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn unexpected_reply_changes_nothing() {
        let (m, _t, _replies) = mount(SocketType::Datagram, MountConfig::default());
        let call = spawn_call(&m);
        until(|| m.outstanding() == 1).await;
        let before = m.congestion();

        m.inner.dispatch(envelope::encode_success(0xdead_beef, b"stray"));
        m.inner
            .dispatch(envelope::encode_call(1, 2, 3, 4, &Credentials::None, &[]));

        let snap = m.inner.stats.snapshot();
        assert_eq!(snap.unexpected, 1);
        assert_eq!(snap.invalid, 1);
        assert_eq!(m.congestion(), before);
        {
            let st = m.inner.lock_state();
            assert!(st.calls.iter().all(|r| r.reply.is_none()));
        }
        call.abort();
    }

    #[tokio::test]
    async fn duplicate_reply_is_unexpected() {
        let (m, t, replies) = mount(SocketType::Datagram, MountConfig::default());
        let call = spawn_call(&m);
        until(|| t.sent().len() == 1).await;
        let xid = t.sent_xids()[0];
        m.inner.dispatch(envelope::encode_success(xid, b"first"));
        m.inner.dispatch(envelope::encode_success(xid, b"second"));
        assert_eq!(call.await.unwrap().unwrap(), b"first");
        assert_eq!(m.inner.stats.snapshot().unexpected, 1);
        drop(replies);
    }

    #[tokio::test]
    async fn dropped_call_unlinks() {
        let (m, _t, _replies) = mount(SocketType::Datagram, MountConfig::default());
        let call = spawn_call(&m);
        until(|| m.outstanding() == 1).await;
        assert_eq!(m.congestion().sent, 1);
        call.abort();
        let _ = call.await;
        assert_eq!(m.outstanding(), 0);
        let c = m.congestion();
        assert_eq!(c.sent, 0);
        assert!(c.rtt.is_none());
    }

    #[tokio::test]
    async fn would_block_retransmit_is_resent_by_owner() {
        let (m, t, replies) = mount(SocketType::Datagram, MountConfig::default());
        let call = spawn_call(&m);
        until(|| t.sent().len() == 1).await;

        t.block_try_send.store(true, Ordering::SeqCst);
        for _ in 0..10 {
            m.inner.tick();
        }
        // The owner wakes up and sends it with a blocking send.
        until(|| t.sent().len() == 2).await;
        let xid = t.sent_xids()[1];
        replies.send(envelope::encode_success(xid, &[])).unwrap();
        call.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn one_notice_each_way() {
        let (m, t, replies) = mount(SocketType::Datagram, MountConfig::default());
        let mut events = m.subscribe();
        let call = spawn_call(&m);
        until(|| m.outstanding() == 1).await;

        let mut ticks = 0;
        while !m.congestion().not_responding {
            m.inner.tick();
            ticks += 1;
            assert!(ticks < 10_000, "never went fishy");
        }
        // Keep going well past the threshold.
        for _ in 0..2000 {
            m.inner.tick();
        }
        assert_eq!(events.try_recv().unwrap(), MountEvent::NotResponding);
        assert!(events.try_recv().is_err());
        assert!(m.inner.lock_state().calls.iter().all(|r| r.rexmit > NFS_FISHY));

        let xid = t.sent_xids()[0];
        replies.send(envelope::encode_success(xid, &[])).unwrap();
        call.await.unwrap().unwrap();
        assert_eq!(events.try_recv().unwrap(), MountEvent::Responding);
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn interrupted_only_on_intr_mounts() {
        let token = CancellationToken::new();
        let policy = CallPolicy {
            cancel: Some(token.clone()),
            ..CallPolicy::default()
        };

        let cfg = MountConfig {
            intr: true,
            ..MountConfig::default()
        };
        let (m, _t, _r) = mount(SocketType::Datagram, cfg);
        let m2 = m.clone();
        let p = policy.clone();
        let call =
            tokio::spawn(async move { m2.call(CallRequest::new(7, 1, 1, Vec::new()), p).await });
        until(|| m.outstanding() == 1).await;
        token.cancel();
        assert!(matches!(call.await.unwrap(), Err(RpcError::Interrupted)));

        let (m, _t, _r) = mount(SocketType::Datagram, MountConfig::default());
        let m2 = m.clone();
        let call = tokio::spawn(async move {
            m2.call(CallRequest::new(7, 1, 1, Vec::new()), policy)
                .await
        });
        until(|| m.outstanding() == 1).await;
        for _ in 0..50 {
            m.inner.tick();
        }
        assert!(!call.is_finished());
        call.abort();
    }

    #[tokio::test]
    async fn deadline_ends_call() {
        let (m, _t, _r) = mount(SocketType::Datagram, MountConfig::default());
        let policy = CallPolicy {
            deadline: Some(Instant::now() + Duration::from_millis(20)),
            ..CallPolicy::default()
        };
        let res = m.call(CallRequest::new(7, 1, 1, Vec::new()), policy).await;
        assert!(matches!(res, Err(RpcError::DeadlineExceeded)));
        assert_eq!(m.outstanding(), 0);
    }

    #[tokio::test]
    async fn stream_calls_are_framed_and_never_retransmitted_by_timer() {
        let (m, t, replies) = mount(SocketType::Stream, MountConfig::default());
        let call = spawn_call(&m);
        until(|| t.sent().len() == 1).await;
        let first = &t.sent()[0];
        let mark = u32::from_be_bytes(first[..4].try_into().unwrap());
        assert_eq!(mark, record::LAST_FRAGMENT | (first.len() as u32 - 4));

        for _ in 0..2000 {
            m.inner.tick();
        }
        assert_eq!(t.sent().len(), 1);
        let xid = t.sent_xids()[0];
        replies.send(envelope::encode_success(xid, b"done")).unwrap();
        assert_eq!(call.await.unwrap().unwrap(), b"done");
    }

    #[tokio::test]
    async fn server_status_word_is_surfaced() {
        let (m, t, replies) = mount(SocketType::Datagram, MountConfig::default());
        let m2 = m.clone();
        let call = tokio::spawn(async move {
            let req = CallRequest::nfs(procs::NFSPROC_GETATTR, Credentials::None, vec![0; 32]);
            m2.call(req, CallPolicy::default()).await
        });
        until(|| t.sent().len() == 1).await;
        let xid = t.sent_xids()[0];
        replies
            .send(envelope::encode_success(xid, &70u32.to_be_bytes()))
            .unwrap();
        assert!(matches!(call.await.unwrap(), Err(RpcError::Server(70))));
    }

    // -----------------------------------------------------------------------
    // Sends that never finish
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn stalled_stream_send_gives_way_to_deadline() {
        let (m, t, _replies) = mount(SocketType::Stream, MountConfig::default());
        t.stall_send.store(true, Ordering::SeqCst);

        let policy = CallPolicy {
            deadline: Some(Instant::now() + Duration::from_millis(30)),
            ..CallPolicy::default()
        };
        let res = tokio::time::timeout(
            Duration::from_secs(5),
            m.call(CallRequest::new(7, 1, 1, Vec::new()), policy),
        )
        .await
        .expect("send never gave way");
        assert!(matches!(res, Err(RpcError::DeadlineExceeded)), "got {res:?}");
        // Part of a record may be on the wire.
        assert!(!m.is_connected());
        assert_eq!(m.outstanding(), 0);
    }

    #[tokio::test]
    async fn stalled_datagram_send_keeps_socket() {
        let (m, t, _replies) = mount(SocketType::Datagram, MountConfig::default());
        t.stall_send.store(true, Ordering::SeqCst);

        let policy = CallPolicy {
            deadline: Some(Instant::now() + Duration::from_millis(30)),
            ..CallPolicy::default()
        };
        let res = tokio::time::timeout(
            Duration::from_secs(5),
            m.call(CallRequest::new(7, 1, 1, Vec::new()), policy),
        )
        .await
        .expect("send never gave way");
        assert!(matches!(res, Err(RpcError::DeadlineExceeded)), "got {res:?}");
        assert!(m.is_connected());
        check_counters(&m);
    }

    #[tokio::test]
    async fn soft_termination_abandons_stalled_send() {
        let cfg = MountConfig {
            policy: RetryPolicy::Soft,
            retry: 1,
            ..MountConfig::default()
        };
        let (m, t, _replies) = mount(SocketType::Stream, cfg);
        t.stall_send.store(true, Ordering::SeqCst);
        let call = spawn_call(&m);
        until(|| m.outstanding() == 1).await;

        for _ in 0..1000 {
            m.inner.tick();
        }
        let res = tokio::time::timeout(Duration::from_secs(5), call)
            .await
            .expect("send never gave way")
            .expect("call panicked");
        assert!(matches!(res, Err(RpcError::TimedOut)), "got {res:?}");
        assert!(!m.is_connected());
        assert!(t.sent().is_empty());
    }

    #[tokio::test]
    async fn call_dropped_mid_write_drops_stream() {
        let (m, t, _replies) = mount(SocketType::Stream, MountConfig::default());
        t.stall_send.store(true, Ordering::SeqCst);
        let call = spawn_call(&m);
        until(|| m.outstanding() == 1).await;
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(m.is_connected());

        call.abort();
        assert!(call.await.unwrap_err().is_cancelled());
        assert!(!m.is_connected());
        assert_eq!(m.outstanding(), 0);
    }
}
