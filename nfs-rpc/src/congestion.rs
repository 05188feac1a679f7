//! Per-connection congestion control.
//!
//! RTT smoothing and window management in the style of the classic BSD NFS
//! client, which borrows Van Jacobson's TCP algorithms:
//!
//! - `srtt` is kept scaled by 8 and `rttvar` unscaled, both in ticks, so
//!   `RTO = srtt/8 + rttvar`.
//! - The window (calls allowed in flight) opens by 4 per clean reply below
//!   `ssthresh` (slow start) and by roughly one per window above it
//!   (congestion avoidance).
//! - Every timeout of the call being timed backs the RTO off exponentially
//!   and slams the window shut to 1.
//!
//! All times are in timer ticks; there are [`NFS_HZ`] ticks per second.

use std::time::Duration;

pub const NFS_HZ: u32 = 10;
/// Length of one timer tick.
pub const TICK: Duration = Duration::from_millis(1000 / NFS_HZ as u64);

/// Default initial RTO.
pub const NFS_TIMEO: i32 = NFS_HZ as i32;
pub const NFS_MINTIMEO: i32 = NFS_HZ as i32;
pub const NFS_MAXTIMEO: i32 = 60 * NFS_HZ as i32;
/// Timer bias for non-idempotent calls on datagram mounts.
pub const NFS_MINIDEMTIMEO: i32 = 2 * NFS_HZ as i32;
/// Timer bias for every call on a stream mount.
pub const NFS_RELIABLETIMEO: i32 = 5 * NFS_HZ as i32;
pub const NFS_MAXREXMIT: u32 = 100;
pub const NFS_MAXWINDOW: u32 = 1024;
/// Default soft-mount retry count.
pub const NFS_RETRANS: u32 = 10;
/// Retransmit depth after which the server is declared not responding and
/// the RTT estimate is thrown away.
pub const NFS_FISHY: u32 = 8;

pub const NFS_MAXPKTHDR: usize = 404;
pub const NFS_MAXDATA: usize = 8192;
pub const NFS_MAXPACKET: usize = NFS_MAXPKTHDR + NFS_MAXDATA;

/// Backoff shift is clipped to the bit width of the RTO.
const MAX_BACKOFF_SHIFT: u32 = i32::BITS;

/// Server liveness transitions worth telling a human about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Notice {
    NotResponding,
    Responding,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Congestion {
    pub rto: i32,
    /// Smoothed RTT, scaled by 8. Zero means "no estimate yet".
    pub srtt: i32,
    pub rttvar: i32,
    /// Ticks elapsed for the call currently being timed, if any.
    pub rtt: Option<i32>,
    pub window: u32,
    pub ssthresh: u32,
    pub winext: u32,
    /// Backoff shift count.
    pub rexmit: u32,
    /// Worst retransmit depth seen since the last clean sample.
    pub currexmit: u32,
    /// Calls currently flagged sent.
    pub sent: u32,
    pub not_responding: bool,
}

impl Congestion {
    pub fn new(timeo: i32) -> Self {
        let rto = timeo.clamp(NFS_MINTIMEO, NFS_MAXTIMEO);
        Self {
            rto,
            srtt: 0,
            rttvar: rto << 1,
            rtt: None,
            window: 2,
            ssthresh: NFS_MAXWINDOW,
            winext: 0,
            rexmit: 0,
            currexmit: 0,
            sent: 0,
            not_responding: false,
        }
    }

    /// State for a freshly (re)connected socket. The smoothed estimate and
    /// the liveness flag carry over; everything in flight is forgotten.
    pub fn reset(&mut self, timeo: i32) {
        let fresh = Self::new(timeo);
        *self = Self {
            srtt: self.srtt,
            not_responding: self.not_responding,
            ..fresh
        };
    }

    /// Whether a new call may go out right now.
    pub fn can_send(&self) -> bool {
        self.sent < self.window && self.currexmit == 0
    }

    /// Start clocking a call. Returns `false` if another call already holds
    /// the RTT sample.
    pub fn start_timing(&mut self) -> bool {
        if self.rtt.is_some() {
            return false;
        }
        self.rtt = Some(0);
        true
    }

    pub fn stop_timing(&mut self) {
        self.rtt = None;
    }

    pub fn tick_rtt(&mut self) {
        if let Some(rtt) = self.rtt.as_mut() {
            *rtt = rtt.saturating_add(1);
        }
    }

    fn base_rto(&self) -> i32 {
        (self.srtt >> 3) + self.rttvar
    }

    /// A reply matched the timed call. Feeds the RTT sample into the
    /// estimators and opens the window, unless anything about the exchange
    /// was retransmitted, in which case the sample is ambiguous and only the
    /// retransmit bookkeeping is cleared.
    pub fn on_success(&mut self, retransmitted: bool) {
        let Some(rtt) = self.rtt.take() else {
            return;
        };
        if retransmitted || self.rexmit != 0 || self.currexmit != 0 {
            self.rexmit = 0;
            self.currexmit = 0;
            return;
        }

        if self.srtt != 0 {
            let mut delta = rtt - (self.srtt >> 3);
            self.srtt += delta;
            if self.srtt <= 0 {
                self.srtt = 1;
            }
            if delta < 0 {
                delta = -delta;
            }
            delta -= self.rttvar >> 2;
            self.rttvar += delta;
            if self.rttvar <= 0 {
                self.rttvar = 1;
            }
        } else {
            self.rttvar = (rtt << 1).max(2);
            self.srtt = self.rttvar << 2;
        }
        self.rto = self.base_rto().clamp(NFS_MINTIMEO, NFS_MAXTIMEO);

        if self.window < self.ssthresh {
            self.window += 4;
        } else {
            self.winext += 1;
            if self.winext * self.winext / self.window > 0 {
                self.winext = 0;
                self.window += 1;
            }
        }
        self.window = self.window.min(NFS_MAXWINDOW);
    }

    /// The timed call expired.
    pub fn back_off(&mut self) {
        self.rexmit = (self.rexmit + 1).min(MAX_BACKOFF_SHIFT);

        let base = self.base_rto().max(0) as u64;
        self.rto = match base.checked_shl(self.rexmit - 1) {
            Some(rto) if rto != 0 && rto <= NFS_MAXTIMEO as u64 => rto as i32,
            _ => NFS_MAXTIMEO,
        };

        if self.currexmit < self.rexmit {
            self.currexmit = self.rexmit;
            if self.currexmit == NFS_FISHY {
                self.rttvar += self.srtt >> 2;
                self.srtt = 0;
            }
        }

        self.ssthresh = ((self.window * 3) / 4).max(1);
        self.window = 1;
        self.winext = 0;
    }

    /// Check a retransmit depth against the fishy threshold.
    pub fn note_depth(&mut self, call_rexmit: u32) -> Option<Notice> {
        let depth = call_rexmit.max(self.currexmit);
        if depth >= NFS_FISHY && !self.not_responding {
            self.not_responding = true;
            return Some(Notice::NotResponding);
        }
        None
    }

    /// Any reply matched on this connection.
    pub fn on_reply_matched(&mut self) -> Option<Notice> {
        if self.not_responding {
            self.not_responding = false;
            return Some(Notice::Responding);
        }
        None
    }
}

/// Convert a tick count into wall time.
pub fn ticks(n: i32) -> Duration {
    TICK * n.max(0) as u32
}
