//! Binary reading and writing for the wire protocol.
//!
//! All values are little-endian.

use bytes::{Buf, BufMut, Bytes, BytesMut};

/// A cursor for parsing binary frames.
#[derive(Debug)]
pub struct Reader {
    buf: Bytes,
}

impl Reader {
    /// Create a new reader from raw bytes.
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self { buf: data.into() }
    }

    /// Returns remaining bytes.
    #[inline]
    pub fn remaining(&self) -> usize {
        self.buf.remaining()
    }

    #[inline]
    pub fn try_get_u8(&mut self) -> Option<u8> {
        (self.buf.remaining() >= 1).then(|| self.buf.get_u8())
    }

    #[inline]
    pub fn try_get_u16(&mut self) -> Option<u16> {
        (self.buf.remaining() >= 2).then(|| self.buf.get_u16_le())
    }

    #[inline]
    pub fn try_get_i16(&mut self) -> Option<i16> {
        (self.buf.remaining() >= 2).then(|| self.buf.get_i16_le())
    }

    #[inline]
    pub fn try_get_f32(&mut self) -> Option<f32> {
        (self.buf.remaining() >= 4).then(|| self.buf.get_f32_le())
    }
}

/// A writer for building binary frames.
#[derive(Debug, Default)]
pub struct Writer {
    buf: BytesMut,
}

impl Writer {
    /// Create a new writer with default capacity.
    pub fn new() -> Self {
        Self::with_capacity(256)
    }

    /// Create a new writer with the specified capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(capacity),
        }
    }

    /// Returns the current length.
    #[inline]
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// Returns true if empty.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    #[inline]
    pub fn put_u8(&mut self, v: u8) {
        self.buf.put_u8(v);
    }

    #[inline]
    pub fn put_u16(&mut self, v: u16) {
        self.buf.put_u16_le(v);
    }

    #[inline]
    pub fn put_i16(&mut self, v: i16) {
        self.buf.put_i16_le(v);
    }

    #[inline]
    pub fn put_f32(&mut self, v: f32) {
        self.buf.put_f32_le(v);
    }

    /// Consume the writer and return the built buffer.
    pub fn finish(self) -> Bytes {
        self.buf.freeze()
    }

    /// Get current buffer as a slice.
    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_scalars() {
        let mut w = Writer::new();
        w.put_u8(0x04);
        w.put_u16(0xBEEF);
        w.put_i16(-1234);
        w.put_f32(31.5);
        let data = w.finish();

        let mut r = Reader::new(data);
        assert_eq!(r.try_get_u8(), Some(0x04));
        assert_eq!(r.try_get_u16(), Some(0xBEEF));
        assert_eq!(r.try_get_i16(), Some(-1234));
        assert_eq!(r.try_get_f32(), Some(31.5));
        assert_eq!(r.try_get_u8(), None);
    }

    #[test]
    fn short_reads_return_none() {
        let mut r = Reader::new(vec![0x01u8]);
        assert_eq!(r.try_get_u16(), None);
        // The failed read must not consume the byte.
        assert_eq!(r.try_get_u8(), Some(0x01));
    }
}
