//! Primitive wire codec
//!
//! [`WireBuffer`] appends protocol primitives to a growable byte buffer;
//! [`WireCursor`] reads them back from a bounded region. Reads past the
//! declared region always fail with [`WireError::Bounds`] instead of
//! truncating.

use bytes::Bytes;
use thiserror::Error;

/// Initial writer capacity; the buffer doubles whenever an append would
/// overflow it.
const INITIAL_CAPACITY: usize = 8;

/// Codec errors
#[derive(Debug, Error)]
pub enum WireError {
    #[error("need {needed} bytes, {remaining} remaining")]
    Bounds { needed: usize, remaining: usize },

    #[error("invalid UTF-8 in wire string")]
    Utf8(#[from] std::str::Utf8Error),

    #[error("unknown request tag: {0}")]
    UnknownTag(u8),

    #[error("unknown transport kind: {0}")]
    UnknownKind(u8),

    #[error("flags byte {0:#04x} is not a response")]
    NotAResponse(u8),

    #[error("payload does not carry the expected magic")]
    BadMagic,
}

/// Byte order of a multi-byte integer. The protocol's wire order is
/// big-endian; every call site states the order it uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteOrder {
    Big,
    Little,
}

/// Growable write buffer with chainable put-operations.
#[derive(Debug)]
pub struct WireBuffer {
    buf: Vec<u8>,
}

impl WireBuffer {
    pub fn new() -> Self {
        Self {
            buf: Vec::with_capacity(INITIAL_CAPACITY),
        }
    }

    /// Double the capacity until `extra` more bytes fit.
    fn make_room(&mut self, extra: usize) {
        let needed = self.buf.len() + extra;
        if needed <= self.buf.capacity() {
            return;
        }
        let mut cap = self.buf.capacity().max(INITIAL_CAPACITY);
        while cap < needed {
            cap *= 2;
        }
        self.buf.reserve_exact(cap - self.buf.len());
    }

    fn put_raw(&mut self, bytes: &[u8]) -> &mut Self {
        self.make_room(bytes.len());
        self.buf.extend_from_slice(bytes);
        self
    }

    pub fn put_u8(&mut self, v: u8) -> &mut Self {
        self.put_raw(&[v])
    }

    pub fn put_i8(&mut self, v: i8) -> &mut Self {
        self.put_raw(&[v as u8])
    }

    pub fn put_u16(&mut self, v: u16, order: ByteOrder) -> &mut Self {
        match order {
            ByteOrder::Big => self.put_raw(&v.to_be_bytes()),
            ByteOrder::Little => self.put_raw(&v.to_le_bytes()),
        }
    }

    pub fn put_i16(&mut self, v: i16, order: ByteOrder) -> &mut Self {
        self.put_u16(v as u16, order)
    }

    pub fn put_u32(&mut self, v: u32, order: ByteOrder) -> &mut Self {
        match order {
            ByteOrder::Big => self.put_raw(&v.to_be_bytes()),
            ByteOrder::Little => self.put_raw(&v.to_le_bytes()),
        }
    }

    pub fn put_i32(&mut self, v: i32, order: ByteOrder) -> &mut Self {
        self.put_u32(v as u32, order)
    }

    /// Length-prefixed UTF-8 string: u32 byte count (big-endian) + bytes.
    pub fn put_str(&mut self, s: &str) -> &mut Self {
        self.put_u32(s.len() as u32, ByteOrder::Big);
        self.put_raw(s.as_bytes())
    }

    /// Fixed-width string: padded with `fill` or truncated to exactly
    /// `width` bytes.
    pub fn put_fixed_str(&mut self, s: &str, width: usize, fill: u8) -> &mut Self {
        let bytes = s.as_bytes();
        if bytes.len() >= width {
            self.put_raw(&bytes[..width])
        } else {
            self.put_raw(bytes);
            self.make_room(width - bytes.len());
            self.buf.resize(self.buf.len() + (width - bytes.len()), fill);
            self
        }
    }

    /// Count-prefixed homogeneous list: u32 count (big-endian), then one
    /// callback invocation per element.
    pub fn put_list<T>(&mut self, items: &[T], mut encode: impl FnMut(&mut Self, &T)) -> &mut Self {
        self.put_u32(items.len() as u32, ByteOrder::Big);
        for item in items {
            encode(self, item);
        }
        self
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Immutable view trimmed to exactly the bytes written.
    pub fn finish(self) -> Bytes {
        Bytes::from(self.buf)
    }
}

impl Default for WireBuffer {
    fn default() -> Self {
        Self::new()
    }
}

/// Sequential read cursor over a fixed byte region.
#[derive(Debug)]
pub struct WireCursor {
    data: Bytes,
    pos: usize,
}

impl WireCursor {
    pub fn new(data: Bytes) -> Self {
        Self { data, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    /// Advance past `n` bytes, failing when fewer remain.
    fn take(&mut self, n: usize) -> Result<&[u8], WireError> {
        if self.remaining() < n {
            return Err(WireError::Bounds {
                needed: n,
                remaining: self.remaining(),
            });
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    pub fn get_u8(&mut self) -> Result<u8, WireError> {
        Ok(self.take(1)?[0])
    }

    pub fn get_i8(&mut self) -> Result<i8, WireError> {
        Ok(self.take(1)?[0] as i8)
    }

    pub fn get_u16(&mut self, order: ByteOrder) -> Result<u16, WireError> {
        let b = self.take(2)?;
        let raw = [b[0], b[1]];
        Ok(match order {
            ByteOrder::Big => u16::from_be_bytes(raw),
            ByteOrder::Little => u16::from_le_bytes(raw),
        })
    }

    pub fn get_i16(&mut self, order: ByteOrder) -> Result<i16, WireError> {
        Ok(self.get_u16(order)? as i16)
    }

    pub fn get_u32(&mut self, order: ByteOrder) -> Result<u32, WireError> {
        let b = self.take(4)?;
        let raw = [b[0], b[1], b[2], b[3]];
        Ok(match order {
            ByteOrder::Big => u32::from_be_bytes(raw),
            ByteOrder::Little => u32::from_le_bytes(raw),
        })
    }

    pub fn get_i32(&mut self, order: ByteOrder) -> Result<i32, WireError> {
        Ok(self.get_u32(order)? as i32)
    }

    /// Length-prefixed UTF-8 string written by [`WireBuffer::put_str`].
    pub fn get_str(&mut self) -> Result<String, WireError> {
        let len = self.get_u32(ByteOrder::Big)? as usize;
        let bytes = self.take(len)?;
        Ok(std::str::from_utf8(bytes)?.to_owned())
    }

    /// Fixed-width string; trailing `fill` bytes are stripped so the value
    /// written by [`WireBuffer::put_fixed_str`] round-trips.
    pub fn get_fixed_str(&mut self, width: usize, fill: u8) -> Result<String, WireError> {
        let bytes = self.take(width)?;
        let end = bytes
            .iter()
            .rposition(|&b| b != fill)
            .map(|i| i + 1)
            .unwrap_or(0);
        Ok(std::str::from_utf8(&bytes[..end])?.to_owned())
    }

    /// Count-prefixed list; the decode callback runs exactly `count` times.
    pub fn get_list<T>(
        &mut self,
        mut decode: impl FnMut(&mut Self) -> Result<T, WireError>,
    ) -> Result<Vec<T>, WireError> {
        let count = self.get_u32(ByteOrder::Big)? as usize;
        let mut items = Vec::with_capacity(count.min(1024));
        for _ in 0..count {
            items.push(decode(self)?);
        }
        Ok(items)
    }
}
