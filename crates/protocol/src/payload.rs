//! Reader and writer for SSH channel request payloads.
//!
//! # Wire Format
//!
//! Channel request payloads are built from two primitive types:
//! - `uint32`: 4 bytes, big-endian
//! - `string`: a `uint32` length followed by that many bytes
//!
//! A length prefix that points past the end of the payload is rejected
//! instead of being clamped, so a malformed request never reads foreign bytes.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{ProtocolError, Result};

/// Size of a `uint32` field in bytes.
pub const U32_SIZE: usize = 4;

/// Cursor over a request payload.
#[derive(Debug, Clone)]
pub struct PayloadReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> PayloadReader<'a> {
    /// Create a reader positioned at the start of `buf`.
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// Number of unread bytes.
    #[inline]
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    /// Whether every byte has been consumed.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    /// Read a big-endian `uint32`.
    pub fn read_u32(&mut self, field: &'static str) -> Result<u32> {
        let available = self.remaining();
        if available < U32_SIZE {
            return Err(ProtocolError::Truncated {
                field,
                needed: U32_SIZE,
                available,
            });
        }

        let mut raw = [0u8; U32_SIZE];
        raw.copy_from_slice(&self.buf[self.pos..self.pos + U32_SIZE]);
        self.pos += U32_SIZE;
        Ok(u32::from_be_bytes(raw))
    }

    /// Read a length-prefixed byte string.
    pub fn read_bytes(&mut self, field: &'static str) -> Result<&'a [u8]> {
        let declared = self.read_u32(field)?;
        let available = self.remaining();

        let len = usize::try_from(declared).unwrap_or(usize::MAX);
        if len > available {
            return Err(ProtocolError::LengthOutOfRange {
                field,
                declared,
                available,
            });
        }

        let bytes = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(bytes)
    }

    /// Read a length-prefixed UTF-8 string.
    pub fn read_string(&mut self, field: &'static str) -> Result<String> {
        let bytes = self.read_bytes(field)?;
        std::str::from_utf8(bytes)
            .map(str::to_owned)
            .map_err(|_| ProtocolError::InvalidUtf8 { field })
    }

    /// Return the unread tail without consuming it.
    pub fn rest(&self) -> &'a [u8] {
        &self.buf[self.pos..]
    }
}

/// Builder for request payloads.
#[derive(Debug, Default)]
pub struct PayloadWriter {
    buf: BytesMut,
}

impl PayloadWriter {
    /// Create an empty writer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a big-endian `uint32`.
    pub fn put_u32(&mut self, value: u32) -> &mut Self {
        self.buf.put_u32(value);
        self
    }

    /// Append a length-prefixed byte string.
    ///
    /// # Panics
    ///
    /// Panics if `bytes` is longer than `u32::MAX`, which no SSH packet can carry.
    pub fn put_bytes(&mut self, bytes: &[u8]) -> &mut Self {
        let len = u32::try_from(bytes.len()).expect("payload string longer than u32::MAX");
        self.buf.put_u32(len);
        self.buf.put_slice(bytes);
        self
    }

    /// Append a length-prefixed UTF-8 string.
    pub fn put_string(&mut self, value: &str) -> &mut Self {
        self.put_bytes(value.as_bytes())
    }

    /// Finish and return the encoded payload.
    pub fn finish(&mut self) -> Bytes {
        self.buf.split().freeze()
    }
}
