//! String table: all strings of a stream concatenated into one blob, followed
//! by a [`UintOptRleEncoder`] stream of their lengths.
//!
//! Lengths are counted in UTF-16 code units so that the format stays
//! compatible with peers whose strings are UTF-16 natively.

use crate::error::{CodecError, Result};
use crate::rle::{UintOptRleDecoder, UintOptRleEncoder};
use crate::varint::{Decoder, Encoder};

#[derive(Debug, Default)]
pub struct StringEncoder {
    blob: String,
    lens: UintOptRleEncoder,
}

impl StringEncoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn write(&mut self, s: &str) {
        self.blob.push_str(s);
        self.lens.write(s.encode_utf16().count() as u64);
    }

    pub fn finish(self) -> Vec<u8> {
        let mut enc = Encoder::with_capacity(self.blob.len() + 8);
        enc.write_var_string(&self.blob);
        enc.write_bytes(&self.lens.finish());
        enc.into_vec()
    }
}

#[derive(Debug)]
pub struct StringDecoder<'a> {
    blob: &'a str,
    pos: usize,
    lens: UintOptRleDecoder<'a>,
}

impl<'a> StringDecoder<'a> {
    pub fn new(buf: &'a [u8]) -> Result<Self> {
        let mut dec = Decoder::new(buf);
        let blob = dec.read_var_string()?;
        Ok(Self {
            blob,
            pos: 0,
            lens: UintOptRleDecoder::from_decoder(dec),
        })
    }

    /// Next string of the table.
    pub fn read(&mut self) -> Result<&'a str> {
        let units = self.lens.read()?;
        let rest = &self.blob[self.pos..];
        let mut taken = 0u64;
        let mut end = 0usize;
        for ch in rest.chars() {
            if taken >= units {
                break;
            }
            taken += ch.len_utf16() as u64;
            end += ch.len_utf8();
        }
        if taken < units {
            return Err(CodecError::UnexpectedEnd {
                needed: (units - taken) as usize,
                remaining: 0,
            });
        }
        if taken != units {
            return Err(CodecError::MisalignedString { requested: units });
        }
        let s = &rest[..end];
        self.pos += end;
        Ok(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_string_table_round_trip() {
        let words = ["hello", "", "wörld", "🎉x", "hello"];
        let mut enc = StringEncoder::new();
        for w in words {
            enc.write(w);
        }
        let bytes = enc.finish();

        let mut dec = StringDecoder::new(&bytes).unwrap();
        for w in words {
            assert_eq!(dec.read().unwrap(), w);
        }
    }

    #[test]
    fn test_lengths_are_utf16_units() {
        let mut enc = StringEncoder::new();
        enc.write("🎉");
        let bytes = enc.finish();
        // blob: len 4 + 4 bytes, then the length stream holds 2
        assert_eq!(&bytes[5..], &[0x02]);
    }

    #[test]
    fn test_length_past_blob_fails() {
        let mut enc = Encoder::new();
        enc.write_var_string("ab");
        enc.write_signed(5, false);
        let bytes = enc.into_vec();

        let mut dec = StringDecoder::new(&bytes).unwrap();
        assert!(dec.read().is_err());
    }
}
