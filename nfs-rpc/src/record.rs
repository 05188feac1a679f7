//! Record marking for RPC over byte streams (RFC 5531 §11).
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-------------------------------------------------------------+
//! |L|                   fragment length (31 bits)                 |
//! +-+-------------------------------------------------------------+
//! |                     fragment bytes …                          |
//! ```
//!
//! `L` marks the last fragment of a record. Outgoing records are always a
//! single last fragment. Incoming records may be split into several fragments
//! and are reassembled, bounded by a maximum record size.

use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::RpcError;

pub const LAST_FRAGMENT: u32 = 0x8000_0000;
pub const MARK_LEN: usize = 4;

const READ_CHUNK: usize = 8192;

/// Prefix `msg` with a record mark.
pub fn frame(msg: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(MARK_LEN + msg.len());
    out.extend_from_slice(&(LAST_FRAGMENT | msg.len() as u32).to_be_bytes());
    out.extend_from_slice(msg);
    out
}

/// Buffers raw stream bytes and yields complete records.
#[derive(Debug)]
pub struct Reassembler {
    buf: Vec<u8>,
    record: Vec<u8>,
    max: usize,
}

impl Reassembler {
    pub fn new(max: usize) -> Self {
        Self {
            buf: Vec::new(),
            record: Vec::new(),
            max,
        }
    }

    pub fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Pop the next complete record, if one is buffered.
    ///
    /// A record (or fragment) that would exceed the maximum size is a framing
    /// error; the stream cannot be resynchronised after it.
    pub fn next_record(&mut self) -> Result<Option<Vec<u8>>, RpcError> {
        loop {
            if self.buf.len() < MARK_LEN {
                return Ok(None);
            }
            let mark = u32::from_be_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]]);
            let len = (mark & !LAST_FRAGMENT) as usize;
            let total = self.record.len() + len;
            if total > self.max {
                return Err(RpcError::RecordTooLarge(total));
            }
            if self.buf.len() < MARK_LEN + len {
                return Ok(None);
            }
            self.record
                .extend_from_slice(&self.buf[MARK_LEN..MARK_LEN + len]);
            self.buf.drain(..MARK_LEN + len);
            if mark & LAST_FRAGMENT != 0 {
                return Ok(Some(std::mem::take(&mut self.record)));
            }
        }
    }
}

/// Reads whole records from a stream.
///
/// Partially read data lives in the reader, not in the future, so dropping
/// an in-progress [`RecordReader::read_record`] loses nothing.
#[derive(Debug)]
pub struct RecordReader<R> {
    inner: R,
    pending: Reassembler,
}

impl<R: AsyncRead + Unpin> RecordReader<R> {
    pub fn new(inner: R, max: usize) -> Self {
        Self {
            inner,
            pending: Reassembler::new(max),
        }
    }

    pub async fn read_record(&mut self) -> Result<Vec<u8>, RpcError> {
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            if let Some(record) = self.pending.next_record()? {
                return Ok(record);
            }
            let n = self.inner.read(&mut chunk).await?;
            if n == 0 {
                return Err(RpcError::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "stream closed mid-record",
                )));
            }
            self.pending.push(&chunk[..n]);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    #[test]
    fn frame_sets_last_fragment_bit() {
        let framed = frame(b"hello");
        assert_eq!(&framed[..4], &[0x80, 0, 0, 5]);
        assert_eq!(&framed[4..], b"hello");
    }

    #[test]
    fn incomplete_record_yields_nothing() {
        let mut r = Reassembler::new(64);
        let framed = frame(b"abcdef");
        r.push(&framed[..3]);
        assert_eq!(r.next_record().unwrap(), None);
        r.push(&framed[3..7]);
        assert_eq!(r.next_record().unwrap(), None);
        r.push(&framed[7..]);
        assert_eq!(r.next_record().unwrap().as_deref(), Some(&b"abcdef"[..]));
        assert_eq!(r.next_record().unwrap(), None);
    }

    #[test]
    fn fragments_are_joined() {
        let mut r = Reassembler::new(64);
        r.push(&3u32.to_be_bytes());
        r.push(b"abc");
        r.push(&(LAST_FRAGMENT | 2).to_be_bytes());
        r.push(b"de");
        assert_eq!(r.next_record().unwrap().as_deref(), Some(&b"abcde"[..]));
    }

    #[test]
    fn two_records_in_one_push() {
        let mut r = Reassembler::new(64);
        let mut bytes = frame(b"one");
        bytes.extend(frame(b"two"));
        r.push(&bytes);
        assert_eq!(r.next_record().unwrap().as_deref(), Some(&b"one"[..]));
        assert_eq!(r.next_record().unwrap().as_deref(), Some(&b"two"[..]));
    }

    #[test]
    fn oversized_record_is_rejected() {
        let mut r = Reassembler::new(8);
        r.push(&(LAST_FRAGMENT | 9).to_be_bytes());
        assert!(matches!(r.next_record(), Err(RpcError::RecordTooLarge(9))));
    }

    #[test]
    fn oversized_fragment_chain_is_rejected() {
        let mut r = Reassembler::new(8);
        r.push(&6u32.to_be_bytes());
        r.push(b"xxxxxx");
        r.push(&(LAST_FRAGMENT | 6).to_be_bytes());
        assert!(matches!(r.next_record(), Err(RpcError::RecordTooLarge(12))));
    }

    #[tokio::test]
    async fn record_split_across_reads_is_reassembled() {
        let (client, mut server) = tokio::io::duplex(64);
        let mut reader = RecordReader::new(client, 1024);

        let writer = tokio::spawn(async move {
            let framed = frame(b"split payload");
            server.write_all(&framed[..4]).await.unwrap();
            server.flush().await.unwrap();
            tokio::task::yield_now().await;
            server.write_all(&framed[4..9]).await.unwrap();
            server.flush().await.unwrap();
            tokio::task::yield_now().await;
            server.write_all(&framed[9..]).await.unwrap();
            server
        });

        let record = reader.read_record().await.unwrap();
        assert_eq!(record, b"split payload");
        drop(writer.await.unwrap());
    }

    #[tokio::test]
    async fn eof_mid_record_is_an_error() {
        let (client, mut server) = tokio::io::duplex(64);
        let mut reader = RecordReader::new(client, 1024);
        server.write_all(&frame(b"abcdef")[..6]).await.unwrap();
        drop(server);
        assert!(matches!(reader.read_record().await, Err(RpcError::Io(_))));
    }
}
