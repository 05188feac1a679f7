//! `nfs-rpc`: a Sun RPC call engine for NFS-style clients and servers.
//!
//! Many concurrent calls share one connection per mount. Replies are matched
//! to calls by xid, and a TCP-like congestion controller (slow start,
//! exponential backoff, RTT smoothing) decides when and how often to
//! retransmit.
//!
//! # Architecture
//!
//! ```text
//!   caller tasks                                   timer task
//!  ┌─────────────┐                               ┌────────────┐
//!  │ Mount::call │                               │   timer    │ every tick:
//!  └──────┬──────┘                               └─────┬──────┘ expire, back off,
//!         │ register / send-now?                       │        retransmit
//!  ┌──────▼──────────────────────────────────────────▼──────┐
//!  │  MountState (one mutex): registry + congestion + socket │
//!  └──────┬──────────────────────────────────────────▲──────┘
//!         │ wait: take a turn at the socket            │ match xid, wake owner
//!  ┌──────▼──────┐   socket lock (streams only)  ┌─────┴──────┐
//!  │  transport  │──────────────────────────────▶│   reply    │
//!  └─────────────┘        one message            └────────────┘
//! ```
//!
//! Modules:
//! - [`client`]:      engine: timer task, statistics, mount list
//! - [`mount`]:       one server connection and its shared state
//! - [`request`]:     the public call path
//! - [`reply`]:       receive, demultiplex, reconnect
//! - [`timer`]:       periodic expiry and retransmission
//! - [`congestion`]:  RTT estimation and window control
//! - [`registry`]:    outstanding calls by xid, oldest first
//! - [`sock_lock`]:   receive-or-reconnect serialisation for streams
//! - [`transport`]:   UDP and TCP sockets behind one trait
//! - [`record`]:      record marking on streams
//! - [`envelope`]:    RPC call/reply headers and credentials
//! - [`xdr`]:         the few XDR primitives the envelope needs
//! - [`server`]:      answering calls
//! - [`config`]:      mount options
//! - [`procs`]:       NFS v2 procedure table
//! - [`stats`]:       engine counters
//! - [`error`]:       error type

pub mod client;
pub mod config;
pub mod congestion;
pub mod envelope;
pub mod error;
pub mod mount;
pub mod procs;
pub mod record;
pub mod registry;
pub mod reply;
pub mod request;
pub mod server;
pub mod sock_lock;
pub mod stats;
pub mod timer;
pub mod transport;
pub mod xdr;

pub use client::RpcClient;
pub use config::{MountConfig, RetryPolicy};
pub use envelope::Credentials;
pub use error::RpcError;
pub use mount::{Mount, MountEvent};
pub use request::{CallPolicy, CallRequest};
pub use server::{RpcServer, Service};
pub use transport::SocketType;
