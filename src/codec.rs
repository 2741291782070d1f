//! Wire primitives for the 0.8 protocol: big-endian integers,
//! length-prefixed strings and byte blocks, and the back-patched length and
//! CRC fields used by message sets and request framing.

use bytes::{BufMut, Bytes, BytesMut};

/// Low-level codec failures. These surface to callers as
/// [`ClientError::Encoding`](crate::error::ClientError::Encoding).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("input is truncated")]
    Truncated,
    #[error("invalid length prefix: {0}")]
    InvalidLength(i32),
    #[error("invalid UTF-8 string")]
    InvalidUtf8,
    #[error("CRC32 mismatch: record carries {expected:#010x}, computed {computed:#010x}")]
    CrcMismatch { expected: u32, computed: u32 },
    #[error("unknown message magic byte: {0}")]
    UnknownMagic(i8),
    #[error("unknown compression attribute: {0}")]
    UnknownCompression(i8),
    #[error("compression failed: {0}")]
    Compression(String),
    #[error("value too large for the {0} length prefix")]
    Oversized(&'static str),
}

/// Append-only encoder over a `BytesMut`.
///
/// Length and CRC fields whose value depends on bytes appended later are
/// reserved with `begin_*` and patched with the matching `finish_*` once the
/// covered region is complete.
#[derive(Debug, Default)]
pub struct Encoder {
    buf: BytesMut,
}

impl Encoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(capacity),
        }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn put_i8(&mut self, value: i8) {
        self.buf.put_i8(value);
    }

    pub fn put_i16(&mut self, value: i16) {
        self.buf.put_i16(value);
    }

    pub fn put_i32(&mut self, value: i32) {
        self.buf.put_i32(value);
    }

    pub fn put_i64(&mut self, value: i64) {
        self.buf.put_i64(value);
    }

    pub fn put_raw(&mut self, bytes: &[u8]) {
        self.buf.put_slice(bytes);
    }

    /// i16-length-prefixed UTF-8 string; `None` encodes as length -1.
    pub fn put_string(&mut self, value: Option<&str>) -> Result<(), WireError> {
        match value {
            None => self.buf.put_i16(-1),
            Some(s) => {
                if s.len() > i16::MAX as usize {
                    return Err(WireError::Oversized("string"));
                }
                self.buf.put_i16(s.len() as i16);
                self.buf.put_slice(s.as_bytes());
            }
        }
        Ok(())
    }

    /// i32-length-prefixed byte block; `None` encodes as length -1.
    pub fn put_bytes(&mut self, value: Option<&[u8]>) -> Result<(), WireError> {
        match value {
            None => self.buf.put_i32(-1),
            Some(bytes) => {
                if bytes.len() > i32::MAX as usize {
                    return Err(WireError::Oversized("bytes"));
                }
                self.buf.put_i32(bytes.len() as i32);
                self.buf.put_slice(bytes);
            }
        }
        Ok(())
    }

    /// i32 element-count prefix for a homogeneous array.
    pub fn put_array_len(&mut self, len: usize) -> Result<(), WireError> {
        if len > i32::MAX as usize {
            return Err(WireError::Oversized("array"));
        }
        self.buf.put_i32(len as i32);
        Ok(())
    }

    /// Reserves an i32 size field; returns its offset for `finish_length`.
    pub fn begin_length(&mut self) -> usize {
        let at = self.buf.len();
        self.buf.put_i32(0);
        at
    }

    /// Patches the reserved size field with the number of bytes appended
    /// since the matching `begin_length`.
    pub fn finish_length(&mut self, at: usize) {
        let len = (self.buf.len() - at - 4) as i32;
        self.buf[at..at + 4].copy_from_slice(&len.to_be_bytes());
    }

    /// Reserves an i32 CRC field; returns its offset for `finish_crc`.
    pub fn begin_crc(&mut self) -> usize {
        let at = self.buf.len();
        self.buf.put_i32(0);
        at
    }

    /// Patches the reserved CRC field with the CRC32 (IEEE) of the bytes
    /// appended since the matching `begin_crc`.
    pub fn finish_crc(&mut self, at: usize) {
        let crc = crc32fast::hash(&self.buf[at + 4..]);
        self.buf[at..at + 4].copy_from_slice(&crc.to_be_bytes());
    }

    pub fn into_bytes(self) -> Bytes {
        self.buf.freeze()
    }
}

/// Cursor-based decoder over an immutable `Bytes` buffer.
///
/// Sub-structures with their own length prefix are decoded through
/// [`Decoder::slice`], which hands back a cheap zero-copy view that can seed
/// a nested decoder.
#[derive(Debug)]
pub struct Decoder {
    buf: Bytes,
    pos: usize,
}

impl Decoder {
    pub fn new(buf: Bytes) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn check(&self, needed: usize) -> Result<(), WireError> {
        if self.remaining() < needed {
            Err(WireError::Truncated)
        } else {
            Ok(())
        }
    }

    pub fn get_i8(&mut self) -> Result<i8, WireError> {
        self.check(1)?;
        let value = self.buf[self.pos] as i8;
        self.pos += 1;
        Ok(value)
    }

    pub fn get_i16(&mut self) -> Result<i16, WireError> {
        self.check(2)?;
        let mut raw = [0u8; 2];
        raw.copy_from_slice(&self.buf[self.pos..self.pos + 2]);
        self.pos += 2;
        Ok(i16::from_be_bytes(raw))
    }

    pub fn get_i32(&mut self) -> Result<i32, WireError> {
        self.check(4)?;
        let mut raw = [0u8; 4];
        raw.copy_from_slice(&self.buf[self.pos..self.pos + 4]);
        self.pos += 4;
        Ok(i32::from_be_bytes(raw))
    }

    pub fn get_i64(&mut self) -> Result<i64, WireError> {
        self.check(8)?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&self.buf[self.pos..self.pos + 8]);
        self.pos += 8;
        Ok(i64::from_be_bytes(raw))
    }

    /// i16-length-prefixed UTF-8 string; length -1 decodes as `None`.
    pub fn get_string(&mut self) -> Result<Option<String>, WireError> {
        let len = self.get_i16()?;
        if len == -1 {
            return Ok(None);
        }
        if len < 0 {
            return Err(WireError::InvalidLength(len as i32));
        }
        let raw = self.slice(len as usize)?;
        let s = std::str::from_utf8(&raw).map_err(|_| WireError::InvalidUtf8)?;
        Ok(Some(s.to_owned()))
    }

    /// i32-length-prefixed byte block; length -1 decodes as `None`.
    pub fn get_bytes(&mut self) -> Result<Option<Bytes>, WireError> {
        let len = self.get_i32()?;
        if len == -1 {
            return Ok(None);
        }
        if len < 0 {
            return Err(WireError::InvalidLength(len));
        }
        Ok(Some(self.slice(len as usize)?))
    }

    pub fn get_array_len(&mut self) -> Result<usize, WireError> {
        let len = self.get_i32()?;
        if len < 0 {
            return Err(WireError::InvalidLength(len));
        }
        Ok(len as usize)
    }

    /// Takes the next `len` bytes as a zero-copy view.
    pub fn slice(&mut self, len: usize) -> Result<Bytes, WireError> {
        self.check(len)?;
        let out = self.buf.slice(self.pos..self.pos + len);
        self.pos += len;
        Ok(out)
    }
}
