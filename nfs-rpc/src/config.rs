//! Mount configuration.
//!
//! [`MountConfig`] is a plain struct with sensible defaults; callers either
//! fill in fields directly or parse a classic comma-separated mount option
//! string with [`MountConfig::parse`]:
//!
//! ```text
//! soft,intr,proto=tcp,retrans=4,timeo=7,rsize=4096,wsize=4096,resvport
//! ```

use std::net::SocketAddr;
use std::time::Duration;

use crate::congestion::{
    NFS_MAXDATA, NFS_MAXPACKET, NFS_MAXPKTHDR, NFS_MAXREXMIT, NFS_MAXTIMEO, NFS_MINTIMEO,
    NFS_RETRANS, NFS_TIMEO,
};
use crate::error::RpcError;
use crate::transport::SocketType;

/// Transfer sizes are rounded down to a multiple of this.
pub const NFS_FABLKSIZE: usize = 512;

/// How persistently a failed call is retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RetryPolicy {
    /// Retry (almost) forever.
    #[default]
    Hard,
    /// Give up after `retry` retransmissions.
    Soft,
    /// Retried like soft; callers force hard retries per call.
    Spongy,
}

#[derive(Debug, Clone)]
pub struct MountConfig {
    pub addr: SocketAddr,
    /// Label used in log messages and events.
    pub server: String,
    pub sotype: SocketType,
    /// Bind the client socket to a port below 1024.
    pub resvport: bool,
    /// Leave datagram sockets unconnected.
    pub noconn: bool,
    pub policy: RetryPolicy,
    /// Calls may be cancelled through their cancellation token.
    pub intr: bool,
    /// Soft-mount retransmit budget.
    pub retry: u32,
    /// Initial RTO in ticks.
    pub timeo: i32,
    pub rsize: usize,
    pub wsize: usize,
    /// Pause between reconnect attempts.
    pub reconnect_delay: Duration,
}

impl Default for MountConfig {
    fn default() -> Self {
        let addr = SocketAddr::from(([127, 0, 0, 1], 2049));
        Self {
            addr,
            server: addr.to_string(),
            sotype: SocketType::Datagram,
            resvport: false,
            noconn: false,
            policy: RetryPolicy::Hard,
            intr: false,
            retry: NFS_RETRANS,
            timeo: NFS_TIMEO,
            rsize: NFS_MAXDATA,
            wsize: NFS_MAXDATA,
            reconnect_delay: Duration::from_secs(1),
        }
    }
}

impl MountConfig {
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            server: addr.to_string(),
            ..Self::default()
        }
    }

    /// Build a config from a mount option string. Unknown options are an
    /// error; later options override earlier ones.
    pub fn parse(addr: SocketAddr, opts: &str) -> Result<Self, RpcError> {
        let mut cfg = Self::new(addr);
        for opt in opts.split(',').map(str::trim).filter(|o| !o.is_empty()) {
            let (key, value) = match opt.split_once('=') {
                Some((k, v)) => (k, Some(v)),
                None => (opt, None),
            };
            match (key, value) {
                ("hard", None) => cfg.policy = RetryPolicy::Hard,
                ("soft", None) => cfg.policy = RetryPolicy::Soft,
                ("spongy", None) => cfg.policy = RetryPolicy::Spongy,
                ("intr", None) => cfg.intr = true,
                ("nointr", None) => cfg.intr = false,
                ("tcp", None) => cfg.sotype = SocketType::Stream,
                ("udp", None) => cfg.sotype = SocketType::Datagram,
                ("proto", Some("tcp")) => cfg.sotype = SocketType::Stream,
                ("proto", Some("udp")) => cfg.sotype = SocketType::Datagram,
                ("resvport", None) => cfg.resvport = true,
                ("noresvport", None) => cfg.resvport = false,
                ("conn", None) => cfg.noconn = false,
                ("noconn", None) => cfg.noconn = true,
                ("retrans", Some(v)) => {
                    cfg.retry = number(key, v)?.min(NFS_MAXREXMIT as usize) as u32;
                }
                ("timeo", Some(v)) => {
                    let t = number(key, v)?.min(NFS_MAXTIMEO as usize) as i32;
                    cfg.timeo = t.max(NFS_MINTIMEO);
                }
                ("rsize", Some(v)) => cfg.rsize = transfer_size(number(key, v)?),
                ("wsize", Some(v)) => cfg.wsize = transfer_size(number(key, v)?),
                ("server", Some(v)) => cfg.server = v.to_string(),
                _ => return Err(RpcError::Config(format!("unknown mount option '{opt}'"))),
            }
        }
        Ok(cfg)
    }

    /// Largest reply record accepted on this mount.
    pub fn max_record(&self) -> usize {
        (self.rsize.max(self.wsize) + NFS_MAXPKTHDR).max(NFS_MAXPACKET)
    }
}

fn number(key: &str, v: &str) -> Result<usize, RpcError> {
    v.parse()
        .map_err(|_| RpcError::Config(format!("{key}: '{v}' is not a number")))
}

fn transfer_size(n: usize) -> usize {
    let n = n & !(NFS_FABLKSIZE - 1);
    n.clamp(NFS_FABLKSIZE, NFS_MAXDATA)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr() -> SocketAddr {
        "10.0.0.1:2049".parse().unwrap()
    }

    #[test]
    fn defaults_are_hard_udp() {
        let cfg = MountConfig::parse(addr(), "").unwrap();
        assert_eq!(cfg.policy, RetryPolicy::Hard);
        assert_eq!(cfg.sotype, SocketType::Datagram);
        assert_eq!(cfg.retry, NFS_RETRANS);
        assert_eq!(cfg.timeo, NFS_TIMEO);
        assert_eq!(cfg.server, "10.0.0.1:2049");
    }

    #[test]
    fn full_option_string() {
        let cfg = MountConfig::parse(
            addr(),
            "soft, intr,proto=tcp,retrans=4,timeo=7,rsize=4096,wsize=1000,resvport,server=fs1",
        )
        .unwrap();
        assert_eq!(cfg.policy, RetryPolicy::Soft);
        assert!(cfg.intr);
        assert!(cfg.resvport);
        assert_eq!(cfg.sotype, SocketType::Stream);
        assert_eq!(cfg.retry, 4);
        assert_eq!(cfg.timeo, NFS_MINTIMEO);
        assert_eq!(cfg.rsize, 4096);
        assert_eq!(cfg.wsize, 512);
        assert_eq!(cfg.server, "fs1");
    }

    #[test]
    fn later_options_win() {
        let cfg = MountConfig::parse(addr(), "soft,spongy,tcp,udp").unwrap();
        assert_eq!(cfg.policy, RetryPolicy::Spongy);
        assert_eq!(cfg.sotype, SocketType::Datagram);
    }

    #[test]
    fn limits_are_enforced() {
        let cfg = MountConfig::parse(addr(), "retrans=5000,timeo=99999,rsize=1,wsize=65536").unwrap();
        assert_eq!(cfg.retry, NFS_MAXREXMIT);
        assert_eq!(cfg.timeo, NFS_MAXTIMEO);
        assert_eq!(cfg.rsize, NFS_FABLKSIZE);
        assert_eq!(cfg.wsize, NFS_MAXDATA);
    }

    #[test]
    fn bad_options_are_rejected() {
        assert!(matches!(MountConfig::parse(addr(), "bogus"), Err(RpcError::Config(_))));
        assert!(MountConfig::parse(addr(), "retrans=x").is_err());
        assert!(MountConfig::parse(addr(), "proto=sctp").is_err());
        assert!(MountConfig::parse(addr(), "soft=1").is_err());
    }

    #[test]
    fn max_record_covers_largest_transfer() {
        let cfg = MountConfig::new(addr());
        assert_eq!(cfg.max_record(), NFS_MAXPACKET);
    }
}
