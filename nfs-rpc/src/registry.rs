//! Outstanding-call table for one mount.
//!
//! Calls are keyed by xid for reply matching and kept in an age-ordered
//! queue so the timer can visit them oldest-first.
//!
//! ```text
//!   order:  front ─▶ [xid 17] [xid 18] [xid 19] ◀─ back (newest)
//!                       │        │        │
//!   calls:           HashMap<xid, CallRecord>
//! ```
//!
//! The registry only stores state. Locking, sending and waking are the
//! caller's business; every method here runs under the mount's state mutex.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use rand::Rng;
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

// ---------------------------------------------------------------------------
// CallRecord
// ---------------------------------------------------------------------------

/// Why the timer gave up on a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SoftTerm {
    RetriesExhausted,
    Interrupted,
    DeadlineExceeded,
}

/// One outstanding call.
#[derive(Debug)]
pub struct CallRecord {
    pub xid: u32,
    /// Retransmissions allowed before the call is given up.
    pub retry: u32,
    /// Elapsed ticks since the last (re)arm. Starts at `-bias`.
    pub timer: i32,
    pub bias: i32,
    /// Expiries counted against the retry budget. Only expiries after the
    /// call has been on the wire count.
    pub rexmit: u32,
    /// This call is clocking the connection's RTT.
    pub timing: bool,
    pub sent: bool,
    /// Written to a socket at least once.
    pub transmitted: bool,
    pub must_resend: bool,
    pub soft_term: Option<SoftTerm>,
    /// Marshaled request, record mark included on stream mounts.
    pub request: Arc<[u8]>,
    pub reply: Option<Vec<u8>>,
    /// Only present on interruptible mounts.
    pub cancel: Option<CancellationToken>,
    pub deadline: Option<Instant>,
    pub wake: Arc<Notify>,
}

impl CallRecord {
    pub fn new(xid: u32, request: Arc<[u8]>, retry: u32, bias: i32) -> Self {
        Self {
            xid,
            retry,
            timer: -bias,
            bias,
            rexmit: 0,
            timing: false,
            sent: false,
            transmitted: false,
            must_resend: false,
            soft_term: None,
            request,
            reply: None,
            cancel: None,
            deadline: None,
            wake: Arc::new(Notify::new()),
        }
    }

    /// Matched or given up: the owner has something to act on.
    pub fn is_done(&self) -> bool {
        self.reply.is_some() || self.soft_term.is_some()
    }

    /// Restart the per-call timer.
    pub fn rearm(&mut self) {
        self.timer = -self.bias;
    }

    /// Attach the reply. Returns `false` if one was already attached.
    pub fn set_reply(&mut self, reply: Vec<u8>) -> bool {
        if self.reply.is_some() {
            return false;
        }
        self.reply = Some(reply);
        self.wake.notify_one();
        true
    }

    pub fn terminate(&mut self, why: SoftTerm) {
        if self.soft_term.is_none() {
            self.soft_term = Some(why);
            self.wake.notify_one();
        }
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct Registry {
    calls: HashMap<u32, CallRecord>,
    order: VecDeque<u32>,
    next_xid: u32,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    /// Empty registry whose xids start at a random point.
    pub fn new() -> Self {
        Self::with_first_xid(rand::rng().random())
    }

    pub fn with_first_xid(xid: u32) -> Self {
        Self {
            calls: HashMap::new(),
            order: VecDeque::new(),
            next_xid: xid,
        }
    }

    /// Assign a fresh xid, build the record for it and link it at the tail.
    pub fn register<F>(&mut self, build: F) -> u32
    where
        F: FnOnce(u32) -> CallRecord,
    {
        let mut xid = self.next_xid;
        while self.calls.contains_key(&xid) {
            xid = xid.wrapping_add(1);
        }
        self.next_xid = xid.wrapping_add(1);

        let record = build(xid);
        debug_assert_eq!(record.xid, xid);
        self.calls.insert(xid, record);
        self.order.push_back(xid);
        xid
    }

    pub fn find(&self, xid: u32) -> Option<&CallRecord> {
        self.calls.get(&xid)
    }

    pub fn find_mut(&mut self, xid: u32) -> Option<&mut CallRecord> {
        self.calls.get_mut(&xid)
    }

    /// Unlink a call. Returns the record if it was still registered.
    pub fn remove(&mut self, xid: u32) -> Option<CallRecord> {
        let record = self.calls.remove(&xid)?;
        if let Some(pos) = self.order.iter().position(|&x| x == xid) {
            self.order.remove(pos);
        }
        Some(record)
    }

    /// Snapshot of the registered xids, oldest first.
    pub fn xids(&self) -> Vec<u32> {
        self.order.iter().copied().collect()
    }

    /// Records in age order, oldest first.
    pub fn iter(&self) -> impl Iterator<Item = &CallRecord> + '_ {
        self.order.iter().filter_map(move |xid| self.calls.get(xid))
    }

    /// After a reconnect nothing is on the wire any more: clear the sent and
    /// timing flags and ask every owner to retransmit.
    pub fn mark_all_resend(&mut self) {
        for record in self.calls.values_mut() {
            record.sent = false;
            record.timing = false;
            if !record.is_done() {
                record.must_resend = true;
                record.wake.notify_one();
            }
        }
    }

    pub fn len(&self) -> usize {
        self.calls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }

    pub fn timing_count(&self) -> usize {
        self.iter().filter(|r| r.timing).count()
    }

    pub fn sent_count(&self) -> usize {
        self.iter().filter(|r| r.sent).count()
    }
}
