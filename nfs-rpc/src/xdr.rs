//! Just enough XDR (RFC 4506) to build and pick apart RPC envelopes.
//!
//! All quantities are big-endian 32-bit words; opaque data is length-prefixed
//! and zero-padded to a 4-byte boundary.

use crate::error::RpcError;

/// Round `len` up to the next multiple of four.
#[inline]
pub fn rndup(len: usize) -> usize {
    (len + 3) & !3
}

pub fn put_u32(out: &mut Vec<u8>, v: u32) {
    out.extend_from_slice(&v.to_be_bytes());
}

/// Append variable-length opaque data: length word, bytes, padding.
pub fn put_opaque(out: &mut Vec<u8>, data: &[u8]) {
    put_u32(out, data.len() as u32);
    out.extend_from_slice(data);
    out.resize(out.len() + rndup(data.len()) - data.len(), 0);
}

/// Read-only cursor over an XDR buffer.
#[derive(Debug)]
pub struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn u32(&mut self) -> Result<u32, RpcError> {
        let end = self
            .pos
            .checked_add(4)
            .filter(|&end| end <= self.buf.len())
            .ok_or_else(|| RpcError::Malformed(format!("truncated at offset {}", self.pos)))?;
        let word = u32::from_be_bytes([
            self.buf[self.pos],
            self.buf[self.pos + 1],
            self.buf[self.pos + 2],
            self.buf[self.pos + 3],
        ]);
        self.pos = end;
        Ok(word)
    }

    /// Variable-length opaque with an upper bound on the declared length.
    pub fn opaque(&mut self, max: usize) -> Result<&'a [u8], RpcError> {
        let len = self.u32()? as usize;
        if len > max {
            return Err(RpcError::Malformed(format!("opaque length {len} exceeds {max}")));
        }
        let padded = rndup(len);
        if self.remaining() < padded {
            return Err(RpcError::Malformed("opaque body truncated".into()));
        }
        let data = &self.buf[self.pos..self.pos + len];
        self.pos += padded;
        Ok(data)
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    /// Everything not yet consumed.
    pub fn rest(&self) -> &'a [u8] {
        &self.buf[self.pos..]
    }
}
