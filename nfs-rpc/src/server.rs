//! Server side of the RPC envelope.
//!
//! [`RpcServer`] parses incoming calls, answers envelope-level problems
//! itself (wrong RPC version, unsupported credentials, unknown program or
//! version) and hands everything else to the registered [`Service`].
//!
//! ```text
//!  datagram / record ──▶ decode_call ──▶ find program ──▶ check version ──▶ Service::dispatch
//!        ▲                    │ reject          │ PROG_UNAVAIL   │ PROG_MISMATCH     │
//!        └──────────── reply ◀┴─────────────────┴────────────────┴───────────────────┘
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio_util::sync::CancellationToken;

use crate::congestion::NFS_MAXPACKET;
use crate::envelope::{self, AcceptStat, CallHeader, IncomingCall};
use crate::error::RpcError;
use crate::record::{self, RecordReader};

/// One RPC program.
#[async_trait]
pub trait Service: Send + Sync + 'static {
    fn program(&self) -> u32;

    /// Lowest and highest supported version.
    fn versions(&self) -> (u32, u32);

    /// Run a procedure and return its marshaled results.
    async fn dispatch(&self, call: &CallHeader, args: &[u8]) -> Result<Vec<u8>, AcceptStat>;
}

/// Answers procedure 0 (the conventional null ping) with empty results and
/// everything else with `PROC_UNAVAIL`.
#[derive(Debug, Clone, Copy)]
pub struct NullService {
    pub program: u32,
    pub version: u32,
}

#[async_trait]
impl Service for NullService {
    fn program(&self) -> u32 {
        self.program
    }

    fn versions(&self) -> (u32, u32) {
        (self.version, self.version)
    }

    async fn dispatch(&self, call: &CallHeader, _args: &[u8]) -> Result<Vec<u8>, AcceptStat> {
        match call.procedure {
            0 => Ok(Vec::new()),
            _ => Err(AcceptStat::ProcUnavail),
        }
    }
}

#[derive(Default)]
pub struct RpcServer {
    services: HashMap<u32, Arc<dyn Service>>,
}

impl RpcServer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a program. A later service for the same program replaces the
    /// earlier one.
    pub fn register(mut self, service: Arc<dyn Service>) -> Self {
        self.services.insert(service.program(), service);
        self
    }

    /// Answer one call message. `None` means the message was not worth a
    /// reply and should be dropped.
    pub async fn handle(&self, msg: &[u8]) -> Option<Vec<u8>> {
        let (header, args) = match envelope::decode_call(msg) {
            Ok(IncomingCall::Call(header, args)) => (header, args),
            Ok(IncomingCall::Reject { xid, stat }) => {
                log::debug!("[server] xid {xid:#010x}: rejected ({stat:?})");
                return Some(envelope::encode_denied(xid, stat));
            }
            Err(e) => {
                log::debug!("[server] dropping bad call: {e}");
                return None;
            }
        };
        let xid = header.xid;

        let Some(service) = self.services.get(&header.program) else {
            return Some(envelope::encode_accept_error(xid, AcceptStat::ProgUnavail));
        };
        let (low, high) = service.versions();
        if header.version < low || header.version > high {
            let stat = AcceptStat::ProgMismatch { low, high };
            return Some(envelope::encode_accept_error(xid, stat));
        }

        match service.dispatch(&header, args).await {
            Ok(results) => Some(envelope::encode_success(xid, &results)),
            Err(stat) => Some(envelope::encode_accept_error(xid, stat)),
        }
    }

    /// Serve datagrams until `shutdown` fires. Each call is handled on its
    /// own task.
    pub async fn serve_udp(
        self: Arc<Self>,
        socket: UdpSocket,
        shutdown: CancellationToken,
    ) -> Result<(), RpcError> {
        let socket = Arc::new(socket);
        let mut buf = vec![0u8; NFS_MAXPACKET];
        loop {
            let (n, from) = tokio::select! {
                res = socket.recv_from(&mut buf) => res?,
                _ = shutdown.cancelled() => return Ok(()),
            };
            let msg = buf[..n].to_vec();
            let server = self.clone();
            let socket = socket.clone();
            tokio::spawn(async move {
                if let Some(reply) = server.handle(&msg).await {
                    if let Err(e) = socket.send_to(&reply, from).await {
                        log::warn!("[server] reply to {from} failed: {e}");
                    }
                }
            });
        }
    }

    /// Accept stream connections until `shutdown` fires.
    pub async fn serve_tcp(
        self: Arc<Self>,
        listener: TcpListener,
        shutdown: CancellationToken,
    ) -> Result<(), RpcError> {
        loop {
            let (stream, peer) = tokio::select! {
                res = listener.accept() => res?,
                _ = shutdown.cancelled() => return Ok(()),
            };
            log::debug!("[server] connection from {peer}");
            let server = self.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                if let Err(e) = server.serve_connection(stream, shutdown).await {
                    log::debug!("[server] connection from {peer} closed: {e}");
                }
            });
        }
    }

    /// Answer records on one connection, in order.
    pub async fn serve_connection(
        &self,
        stream: TcpStream,
        shutdown: CancellationToken,
    ) -> Result<(), RpcError> {
        let (rd, mut wr) = stream.into_split();
        let mut reader = RecordReader::new(rd, NFS_MAXPACKET);
        loop {
            let msg = tokio::select! {
                res = reader.read_record() => res?,
                _ = shutdown.cancelled() => return Ok(()),
            };
            if let Some(reply) = self.handle(&msg).await {
                wr.write_all(&record::frame(&reply)).await?;
            }
        }
    }
}
