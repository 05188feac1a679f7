//! Network transports.
//!
//! A [`Transport`] owns one socket and moves whole RPC messages. Two
//! implementations exist:
//!
//! - [`DatagramTransport`]: UDP, one message per datagram. Connected unless
//!   the mount asked for `noconn`.
//! - [`StreamTransport`]: TCP, messages delimited by record marks. The caller
//!   hands [`Transport::send`] a message that already carries its mark
//!   (see [`crate::record::frame`]); [`Transport::receive`] strips it.
//!
//! Everything above this module is written against the trait and only asks
//! [`Transport::socket_type`] where the two really behave differently.

use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpSocket, UdpSocket};
use tokio::sync::Mutex;

use crate::config::MountConfig;
use crate::congestion::NFS_MAXPKTHDR;
use crate::error::RpcError;
use crate::record::{RecordReader, MARK_LEN};

/// Upper bound on a single blocking receive; waiters re-check their own
/// state at least this often.
pub const RECEIVE_POLL: Duration = Duration::from_secs(5);

/// Reserved ports are tried from the top of the range down.
const RESVPORT_HIGH: u16 = 1023;
const RESVPORT_LOW: u16 = 513;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SocketType {
    #[default]
    Datagram,
    Stream,
}

impl std::fmt::Display for SocketType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SocketType::Datagram => f.write_str("udp"),
            SocketType::Stream => f.write_str("tcp"),
        }
    }
}

#[async_trait]
pub trait Transport: Send + Sync + 'static {
    fn socket_type(&self) -> SocketType;

    /// Receives must be serialised through the mount's socket lock.
    fn conn_required(&self) -> bool {
        self.socket_type() == SocketType::Stream
    }

    /// Send one message.
    async fn send(&self, msg: &[u8]) -> Result<(), RpcError>;

    /// Send without waiting. Fails with an `Io` error of kind `WouldBlock`
    /// when the socket cannot take the whole message right now.
    fn try_send(&self, msg: &[u8]) -> Result<(), RpcError>;

    /// Wait for the next whole message.
    async fn receive(&self) -> Result<Vec<u8>, RpcError>;
}

/// Open a transport for `cfg`.
pub async fn connect(cfg: &MountConfig) -> Result<Arc<dyn Transport>, RpcError> {
    match cfg.sotype {
        SocketType::Datagram => Ok(Arc::new(DatagramTransport::connect(cfg)?)),
        SocketType::Stream => Ok(Arc::new(StreamTransport::connect(cfg).await?)),
    }
}

fn unspecified(peer: &SocketAddr, port: u16) -> SocketAddr {
    let ip = match peer {
        SocketAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        SocketAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
    };
    SocketAddr::new(ip, port)
}

/// Bind to the highest free port in the reserved range.
fn bind_resvport<F>(peer: &SocketAddr, mut bind: F) -> io::Result<u16>
where
    F: FnMut(SocketAddr) -> io::Result<()>,
{
    for port in (RESVPORT_LOW..=RESVPORT_HIGH).rev() {
        match bind(unspecified(peer, port)) {
            Ok(()) => return Ok(port),
            Err(e) if e.kind() == io::ErrorKind::AddrInUse => continue,
            Err(e) => return Err(e),
        }
    }
    Err(io::Error::new(io::ErrorKind::AddrInUse, "no free reserved port"))
}

// ---------------------------------------------------------------------------
// Datagram
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct DatagramTransport {
    socket: UdpSocket,
    peer: SocketAddr,
    connected: bool,
    max_datagram: usize,
}

impl DatagramTransport {
    pub fn connect(cfg: &MountConfig) -> Result<Self, RpcError> {
        let sock = Socket::new(
            Domain::for_address(cfg.addr),
            Type::DGRAM,
            Some(Protocol::UDP),
        )?;
        if cfg.resvport {
            let port = bind_resvport(&cfg.addr, |a| sock.bind(&a.into()))?;
            log::debug!("[transport] bound reserved port {port}");
        } else {
            sock.bind(&unspecified(&cfg.addr, 0).into())?;
        }
        sock.set_send_buffer_size(cfg.wsize + NFS_MAXPKTHDR)?;
        sock.set_recv_buffer_size((cfg.rsize + NFS_MAXPKTHDR) * 2)?;
        sock.set_nonblocking(true)?;
        if !cfg.noconn {
            sock.connect(&cfg.addr.into())?;
        }
        let socket = UdpSocket::from_std(sock.into())?;
        Ok(Self {
            socket,
            peer: cfg.addr,
            connected: !cfg.noconn,
            max_datagram: cfg.max_record(),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }
}

#[async_trait]
impl Transport for DatagramTransport {
    fn socket_type(&self) -> SocketType {
        SocketType::Datagram
    }

    async fn send(&self, msg: &[u8]) -> Result<(), RpcError> {
        if self.connected {
            self.socket.send(msg).await?;
        } else {
            self.socket.send_to(msg, self.peer).await?;
        }
        Ok(())
    }

    fn try_send(&self, msg: &[u8]) -> Result<(), RpcError> {
        if self.connected {
            self.socket.try_send(msg)?;
        } else {
            self.socket.try_send_to(msg, self.peer)?;
        }
        Ok(())
    }

    /// One datagram from the server. Anything longer than the largest
    /// legal reply is reported as [`RpcError::RecordTooLarge`] rather than
    /// handed on cut short.
    async fn receive(&self) -> Result<Vec<u8>, RpcError> {
        let mut buf = vec![0u8; self.max_datagram + 1];
        loop {
            let n = if self.connected {
                self.socket.recv(&mut buf).await?
            } else {
                let (n, from) = self.socket.recv_from(&mut buf).await?;
                if from.ip() != self.peer.ip() {
                    log::debug!("[transport] dropping datagram from stranger {from}");
                    continue;
                }
                n
            };
            if n > self.max_datagram {
                return Err(RpcError::RecordTooLarge(n));
            }
            buf.truncate(n);
            return Ok(buf);
        }
    }
}

// ---------------------------------------------------------------------------
// Stream
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct StreamTransport {
    reader: Mutex<RecordReader<OwnedReadHalf>>,
    writer: Mutex<OwnedWriteHalf>,
}

impl StreamTransport {
    pub async fn connect(cfg: &MountConfig) -> Result<Self, RpcError> {
        if cfg.noconn {
            return Err(RpcError::NotConnected);
        }
        let socket = if cfg.addr.is_ipv6() {
            TcpSocket::new_v6()?
        } else {
            TcpSocket::new_v4()?
        };
        if cfg.resvport {
            let port = bind_resvport(&cfg.addr, |a| socket.bind(a))?;
            log::debug!("[transport] bound reserved port {port}");
        }
        socket.set_send_buffer_size(((cfg.wsize + NFS_MAXPKTHDR + MARK_LEN) * 2) as u32)?;
        socket.set_recv_buffer_size(((cfg.rsize + NFS_MAXPKTHDR + MARK_LEN) * 2) as u32)?;
        socket.set_keepalive(true)?;
        let stream = socket.connect(cfg.addr).await?;
        stream.set_nodelay(true)?;

        let (rd, wr) = stream.into_split();
        Ok(Self {
            reader: Mutex::new(RecordReader::new(rd, cfg.max_record())),
            writer: Mutex::new(wr),
        })
    }
}

#[async_trait]
impl Transport for StreamTransport {
    fn socket_type(&self) -> SocketType {
        SocketType::Stream
    }

    async fn send(&self, msg: &[u8]) -> Result<(), RpcError> {
        let mut wr = self.writer.lock().await;
        wr.write_all(msg).await?;
        Ok(())
    }

    /// A stream cannot take half a record and back out, so records are never
    /// written without waiting. The caller falls back to flagging the call
    /// for resend, and its owner sends it with [`Transport::send`].
    fn try_send(&self, _msg: &[u8]) -> Result<(), RpcError> {
        Err(RpcError::Io(io::ErrorKind::WouldBlock.into()))
    }

    async fn receive(&self) -> Result<Vec<u8>, RpcError> {
        self.reader.lock().await.read_record().await
    }
}

// ---------------------------------------------------------------------------
// Test double
// ---------------------------------------------------------------------------

/// In-memory transport: records everything sent and hands back whatever the
/// test pushes into its reply channel.
#[cfg(test)]
pub(crate) mod mock {
    use std::sync::atomic::{AtomicBool, Ordering};

    use tokio::sync::mpsc;

    use super::*;

    pub(crate) struct MockTransport {
        sotype: SocketType,
        sent: std::sync::Mutex<Vec<Vec<u8>>>,
        replies: Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
        pub(crate) block_try_send: AtomicBool,
        /// `send` never completes, like a peer that stopped reading.
        pub(crate) stall_send: AtomicBool,
    }

    impl MockTransport {
        pub(crate) fn new(sotype: SocketType) -> (Arc<Self>, mpsc::UnboundedSender<Vec<u8>>) {
            let (tx, rx) = mpsc::unbounded_channel();
            let t = Arc::new(Self {
                sotype,
                sent: std::sync::Mutex::new(Vec::new()),
                replies: Mutex::new(rx),
                block_try_send: AtomicBool::new(false),
                stall_send: AtomicBool::new(false),
            });
            (t, tx)
        }

        pub(crate) fn sent(&self) -> Vec<Vec<u8>> {
            self.sent.lock().unwrap().clone()
        }

        /// xids of everything sent so far, in order.
        pub(crate) fn sent_xids(&self) -> Vec<u32> {
            let offset = match self.sotype {
                SocketType::Datagram => 0,
                SocketType::Stream => MARK_LEN,
            };
            self.sent()
                .iter()
                .map(|m| u32::from_be_bytes(m[offset..offset + 4].try_into().unwrap()))
                .collect()
        }
    }

    #[async_trait]
    impl Transport for MockTransport {
        fn socket_type(&self) -> SocketType {
            self.sotype
        }

        async fn send(&self, msg: &[u8]) -> Result<(), RpcError> {
            if self.stall_send.load(Ordering::SeqCst) {
                std::future::pending::<()>().await;
            }
            self.sent.lock().unwrap().push(msg.to_vec());
            Ok(())
        }

        fn try_send(&self, msg: &[u8]) -> Result<(), RpcError> {
            if self.block_try_send.load(Ordering::SeqCst) {
                return Err(RpcError::Io(io::ErrorKind::WouldBlock.into()));
            }
            self.sent.lock().unwrap().push(msg.to_vec());
            Ok(())
        }

        async fn receive(&self) -> Result<Vec<u8>, RpcError> {
            self.replies
                .lock()
                .await
                .recv()
                .await
                .ok_or(RpcError::NotConnected)
        }
    }
}
