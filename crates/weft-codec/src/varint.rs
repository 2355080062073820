//! Variable-length integers and primitive values.
//!
//! Unsigned integers use 7 payload bits per byte with the high bit as the
//! continuation flag. Signed integers spend the first byte on a continuation
//! flag (`0x80`), a sign flag (`0x40`) and 6 payload bits; further bytes carry
//! 7 bits each. Because the sign is stored apart from the magnitude, a signed
//! zero can be written as "negative zero", which the run-length codecs use as
//! an extra flag.

use crate::error::{CodecError, Result};

/// Growable output buffer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Encoder {
    buf: Vec<u8>,
}

impl Encoder {
    pub fn new() -> Self {
        Self { buf: Vec::new() }
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: Vec::with_capacity(capacity),
        }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.buf
    }

    pub fn write_u8(&mut self, byte: u8) {
        self.buf.push(byte);
    }

    /// Append raw bytes without a length prefix.
    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    pub fn write_var_u64(&mut self, mut num: u64) {
        while num > 0x7f {
            self.buf.push(0x80 | (num & 0x7f) as u8);
            num >>= 7;
        }
        self.buf.push(num as u8);
    }

    pub fn write_var_i64(&mut self, num: i64) {
        self.write_signed(num.unsigned_abs(), num < 0);
    }

    /// Write a signed varint from its magnitude and sign. Passing
    /// `negative = true` with a zero magnitude writes negative zero.
    pub fn write_signed(&mut self, magnitude: u64, negative: bool) {
        let mut first = (magnitude & 0x3f) as u8;
        if negative {
            first |= 0x40;
        }
        let mut rest = magnitude >> 6;
        if rest > 0 {
            first |= 0x80;
        }
        self.buf.push(first);
        while rest > 0 {
            let mut byte = (rest & 0x7f) as u8;
            rest >>= 7;
            if rest > 0 {
                byte |= 0x80;
            }
            self.buf.push(byte);
        }
    }

    pub fn write_var_string(&mut self, s: &str) {
        self.write_var_buf(s.as_bytes());
    }

    pub fn write_var_buf(&mut self, bytes: &[u8]) {
        self.write_var_u64(bytes.len() as u64);
        self.buf.extend_from_slice(bytes);
    }

    pub fn write_f32(&mut self, value: f32) {
        self.buf.extend_from_slice(&value.to_be_bytes());
    }

    pub fn write_f64(&mut self, value: f64) {
        self.buf.extend_from_slice(&value.to_be_bytes());
    }

    pub fn write_i64(&mut self, value: i64) {
        self.buf.extend_from_slice(&value.to_be_bytes());
    }
}

/// Cursor over a borrowed byte slice.
#[derive(Debug, Clone)]
pub struct Decoder<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Decoder<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// Whether unread bytes remain.
    pub fn has_content(&self) -> bool {
        self.pos < self.buf.len()
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    /// Consume and return everything that has not been read yet.
    pub fn read_rest(&mut self) -> &'a [u8] {
        let rest = &self.buf[self.pos..];
        self.pos = self.buf.len();
        rest
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        match self.buf.get(self.pos) {
            Some(&byte) => {
                self.pos += 1;
                Ok(byte)
            }
            None => Err(CodecError::UnexpectedEnd {
                needed: 1,
                remaining: 0,
            }),
        }
    }

    pub fn read_bytes(&mut self, len: usize) -> Result<&'a [u8]> {
        let remaining = self.buf.len() - self.pos;
        if len > remaining {
            return Err(CodecError::UnexpectedEnd {
                needed: len,
                remaining,
            });
        }
        let bytes = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(bytes)
    }

    pub fn read_var_u64(&mut self) -> Result<u64> {
        let mut num = 0u64;
        let mut shift = 0u32;
        loop {
            let byte = self.read_u8()?;
            let bits = (byte & 0x7f) as u64;
            if shift >= 64 || (shift > 57 && bits >> (64 - shift) != 0) {
                return Err(CodecError::VarIntOverflow);
            }
            num |= bits << shift;
            if byte < 0x80 {
                return Ok(num);
            }
            shift += 7;
        }
    }

    /// Read an unsigned varint that is used as a length or count.
    pub fn read_len(&mut self) -> Result<usize> {
        let len = self.read_var_u64()?;
        usize::try_from(len).map_err(|_| CodecError::LengthOverflow(len))
    }

    /// Read a signed varint as `(magnitude, negative)`. Negative zero is
    /// reported as `(0, true)`.
    pub fn read_signed(&mut self) -> Result<(u64, bool)> {
        let first = self.read_u8()?;
        let negative = first & 0x40 != 0;
        let mut num = (first & 0x3f) as u64;
        if first & 0x80 != 0 {
            let mut shift = 6u32;
            loop {
                let byte = self.read_u8()?;
                let bits = (byte & 0x7f) as u64;
                if shift >= 64 || (shift > 57 && bits >> (64 - shift) != 0) {
                    return Err(CodecError::VarIntOverflow);
                }
                num |= bits << shift;
                if byte < 0x80 {
                    break;
                }
                shift += 7;
            }
        }
        Ok((num, negative))
    }

    pub fn read_var_i64(&mut self) -> Result<i64> {
        let (magnitude, negative) = self.read_signed()?;
        let value = if negative {
            -(magnitude as i128)
        } else {
            magnitude as i128
        };
        i64::try_from(value).map_err(|_| CodecError::VarIntOverflow)
    }

    pub fn read_var_buf(&mut self) -> Result<&'a [u8]> {
        let len = self.read_len()?;
        self.read_bytes(len)
    }

    pub fn read_var_string(&mut self) -> Result<&'a str> {
        let bytes = self.read_var_buf()?;
        std::str::from_utf8(bytes).map_err(|_| CodecError::InvalidUtf8)
    }

    pub fn read_f32(&mut self) -> Result<f32> {
        let mut raw = [0u8; 4];
        raw.copy_from_slice(self.read_bytes(4)?);
        Ok(f32::from_be_bytes(raw))
    }

    pub fn read_f64(&mut self) -> Result<f64> {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(self.read_bytes(8)?);
        Ok(f64::from_be_bytes(raw))
    }

    pub fn read_i64(&mut self) -> Result<i64> {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(self.read_bytes(8)?);
        Ok(i64::from_be_bytes(raw))
    }
}
