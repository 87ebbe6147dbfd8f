//! XDR (External Data Representation) encoding/decoding
//!
//! RFC 4506 primitives used for attribute values. Decoding failures surface
//! as `io::ErrorKind::UnexpectedEof` or `InvalidData`; callers turn them into
//! `NFS4ERR_BADXDR`.

use std::io;

#[cfg(test)]
use bytes::{BufMut, Bytes, BytesMut};

/// Upper bound on array lengths accepted from the wire
const MAX_ARRAY_LEN: usize = 1024;

fn padding(len: usize) -> usize {
    (4 - (len % 4)) % 4
}

/// XDR encoder for building attribute blobs in tests
#[cfg(test)]
pub(crate) struct XdrEncoder {
    buf: BytesMut,
}

#[cfg(test)]
impl XdrEncoder {
    pub(crate) fn new() -> Self {
        Self {
            buf: BytesMut::with_capacity(256),
        }
    }

    pub(crate) fn encode_u32(&mut self, value: u32) {
        self.buf.put_u32(value);
    }

    pub(crate) fn encode_u64(&mut self, value: u64) {
        self.buf.put_u64(value);
    }

    pub(crate) fn encode_i64(&mut self, value: i64) {
        self.buf.put_i64(value);
    }

    pub(crate) fn encode_bool(&mut self, value: bool) {
        self.encode_u32(u32::from(value));
    }

    pub(crate) fn encode_opaque_fixed(&mut self, data: &[u8]) {
        self.buf.put_slice(data);
        self.buf.put_bytes(0, padding(data.len()));
    }

    pub(crate) fn encode_string(&mut self, s: &str) {
        self.encode_u32(s.len() as u32);
        self.encode_opaque_fixed(s.as_bytes());
    }

    pub(crate) fn finish(self) -> Bytes {
        self.buf.freeze()
    }
}

/// XDR decoder
pub struct XdrDecoder<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> XdrDecoder<'a> {
    /// Create a new decoder
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    /// Get remaining bytes
    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    /// Get current position
    pub fn position(&self) -> usize {
        self.pos
    }

    fn take(&mut self, len: usize, what: &str) -> io::Result<&'a [u8]> {
        if self.remaining() < len {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("not enough data for {what}"),
            ));
        }
        let slice = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    fn take_array<const N: usize>(&mut self, what: &str) -> io::Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N, what)?);
        Ok(out)
    }

    /// Decode a 32-bit integer
    pub fn decode_u32(&mut self) -> io::Result<u32> {
        self.take_array::<4>("u32").map(u32::from_be_bytes)
    }

    /// Decode a 64-bit integer
    pub fn decode_u64(&mut self) -> io::Result<u64> {
        self.take_array::<8>("u64").map(u64::from_be_bytes)
    }

    /// Decode a 32-bit signed integer
    pub fn decode_i32(&mut self) -> io::Result<i32> {
        self.take_array::<4>("i32").map(i32::from_be_bytes)
    }

    /// Decode a 64-bit signed integer
    pub fn decode_i64(&mut self) -> io::Result<i64> {
        self.take_array::<8>("i64").map(i64::from_be_bytes)
    }

    /// Decode a boolean
    pub fn decode_bool(&mut self) -> io::Result<bool> {
        match self.decode_u32()? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("invalid boolean {other}"),
            )),
        }
    }

    /// Decode a variable-length opaque
    pub fn decode_opaque(&mut self) -> io::Result<Vec<u8>> {
        let len = self.decode_u32()? as usize;
        self.decode_opaque_fixed(len)
    }

    /// Decode a fixed-length opaque
    pub fn decode_opaque_fixed(&mut self, len: usize) -> io::Result<Vec<u8>> {
        let data = self.take(len, "opaque")?.to_vec();
        self.take(padding(len), "opaque padding")?;
        Ok(data)
    }

    /// Decode a string
    pub fn decode_string(&mut self) -> io::Result<String> {
        let bytes = self.decode_opaque()?;
        String::from_utf8(bytes).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }

    /// Decode a counted array of 32-bit words
    pub fn decode_u32_array(&mut self) -> io::Result<Vec<u32>> {
        let len = self.decode_u32()? as usize;
        if len > MAX_ARRAY_LEN {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("array length {len} too large"),
            ));
        }
        (0..len).map(|_| self.decode_u32()).collect()
    }

    /// Skip bytes
    pub fn skip(&mut self, n: usize) -> io::Result<()> {
        self.take(n, "skip").map(|_| ())
    }
}
