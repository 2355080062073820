//! Run-length and delta integer streams.
//!
//! Each update column is written through one of these encoders and read back
//! with the matching decoder. Encoders buffer the current run, so the stream
//! is only complete after [`finish`](RleEncoder::finish) has been called.
//!
//! | Codec          | Good at                                   |
//! |----------------|-------------------------------------------|
//! | `Rle`          | repeated bytes (info flags)               |
//! | `UintOptRle`   | repeated unsigned values (clients, lens)  |
//! | `IntDiff`      | slowly drifting signed values             |
//! | `IntDiffOptRle`| runs of equal deltas (key clocks, origins)|
//! | `RleIntDiff`   | runs of equal values stored as deltas     |
//! | `IncUintOptRle`| runs of consecutive values                |

use crate::error::Result;
use crate::varint::{Decoder, Encoder};

/// Byte values with run lengths. The final run length is implicit.
#[derive(Debug, Default)]
pub struct RleEncoder {
    enc: Encoder,
    state: Option<u8>,
    count: u64,
}

impl RleEncoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn write(&mut self, value: u8) {
        if self.state == Some(value) {
            self.count += 1;
        } else {
            if self.count > 0 {
                self.enc.write_var_u64(self.count - 1);
            }
            self.count = 1;
            self.enc.write_u8(value);
            self.state = Some(value);
        }
    }

    pub fn finish(self) -> Vec<u8> {
        self.enc.into_vec()
    }
}

#[derive(Debug)]
pub struct RleDecoder<'a> {
    dec: Decoder<'a>,
    state: u8,
    count: i64,
}

impl<'a> RleDecoder<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self {
            dec: Decoder::new(buf),
            state: 0,
            count: 0,
        }
    }

    pub fn read(&mut self) -> Result<u8> {
        if self.count == 0 {
            self.state = self.dec.read_u8()?;
            self.count = if self.dec.has_content() {
                (self.dec.read_var_u64()? as i64).saturating_add(1)
            } else {
                // last run repeats forever
                -1
            };
        }
        self.count -= 1;
        Ok(self.state)
    }
}

fn flush_opt_run(enc: &mut Encoder, value: u64, count: u64) {
    if count == 1 {
        enc.write_signed(value, false);
    } else if count > 1 {
        // a negative sign flags that a run length follows
        enc.write_signed(value, true);
        enc.write_var_u64(count - 2);
    }
}

/// Unsigned values where a run of repeats costs one extra varint.
#[derive(Debug, Default)]
pub struct UintOptRleEncoder {
    enc: Encoder,
    state: u64,
    count: u64,
}

impl UintOptRleEncoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn write(&mut self, value: u64) {
        if self.count > 0 && self.state == value {
            self.count += 1;
        } else {
            flush_opt_run(&mut self.enc, self.state, self.count);
            self.count = 1;
            self.state = value;
        }
    }

    pub fn finish(mut self) -> Vec<u8> {
        flush_opt_run(&mut self.enc, self.state, self.count);
        self.enc.into_vec()
    }
}

#[derive(Debug)]
pub struct UintOptRleDecoder<'a> {
    dec: Decoder<'a>,
    state: u64,
    count: u64,
}

impl<'a> UintOptRleDecoder<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self::from_decoder(Decoder::new(buf))
    }

    pub(crate) fn from_decoder(dec: Decoder<'a>) -> Self {
        Self {
            dec,
            state: 0,
            count: 0,
        }
    }

    pub fn read(&mut self) -> Result<u64> {
        if self.count == 0 {
            let (value, negative) = self.dec.read_signed()?;
            self.state = value;
            self.count = if negative {
                self.dec.read_var_u64()?.saturating_add(2)
            } else {
                1
            };
        }
        self.count -= 1;
        Ok(self.state)
    }
}

/// Signed values stored as the difference to the previous value.
#[derive(Debug, Default)]
pub struct IntDiffEncoder {
    enc: Encoder,
    state: i64,
}

impl IntDiffEncoder {
    pub fn new(start: i64) -> Self {
        Self {
            enc: Encoder::new(),
            state: start,
        }
    }

    pub fn write(&mut self, value: i64) {
        self.enc.write_var_i64(value.wrapping_sub(self.state));
        self.state = value;
    }

    pub fn finish(self) -> Vec<u8> {
        self.enc.into_vec()
    }
}

#[derive(Debug)]
pub struct IntDiffDecoder<'a> {
    dec: Decoder<'a>,
    state: i64,
}

impl<'a> IntDiffDecoder<'a> {
    pub fn new(buf: &'a [u8], start: i64) -> Self {
        Self {
            dec: Decoder::new(buf),
            state: start,
        }
    }

    pub fn read(&mut self) -> Result<i64> {
        self.state = self.state.wrapping_add(self.dec.read_var_i64()?);
        Ok(self.state)
    }
}

/// Deltas with run lengths. The low bit of each encoded delta says whether a
/// run length follows.
#[derive(Debug, Default)]
pub struct IntDiffOptRleEncoder {
    enc: Encoder,
    state: i64,
    count: u64,
    diff: i64,
}

impl IntDiffOptRleEncoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn write(&mut self, value: i64) {
        let diff = value.wrapping_sub(self.state);
        if self.count > 0 && self.diff == diff {
            self.count += 1;
        } else {
            self.flush();
            self.count = 1;
            self.diff = diff;
        }
        self.state = value;
    }

    fn flush(&mut self) {
        if self.count > 0 {
            let has_count = i64::from(self.count > 1);
            self.enc.write_var_i64(self.diff.wrapping_mul(2) + has_count);
            if self.count > 1 {
                self.enc.write_var_u64(self.count - 2);
            }
        }
    }

    pub fn finish(mut self) -> Vec<u8> {
        self.flush();
        self.enc.into_vec()
    }
}

#[derive(Debug)]
pub struct IntDiffOptRleDecoder<'a> {
    dec: Decoder<'a>,
    state: i64,
    count: u64,
    diff: i64,
}

impl<'a> IntDiffOptRleDecoder<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self {
            dec: Decoder::new(buf),
            state: 0,
            count: 0,
            diff: 0,
        }
    }

    pub fn read(&mut self) -> Result<i64> {
        if self.count == 0 {
            let encoded = self.dec.read_var_i64()?;
            self.diff = encoded >> 1;
            self.count = if encoded & 1 == 1 {
                self.dec.read_var_u64()?.saturating_add(2)
            } else {
                1
            };
        }
        self.state = self.state.wrapping_add(self.diff);
        self.count -= 1;
        Ok(self.state)
    }
}

/// Runs of equal values where each new value is stored as a delta.
#[derive(Debug, Default)]
pub struct RleIntDiffEncoder {
    enc: Encoder,
    state: i64,
    count: u64,
}

impl RleIntDiffEncoder {
    pub fn new(start: i64) -> Self {
        Self {
            enc: Encoder::new(),
            state: start,
            count: 0,
        }
    }

    pub fn write(&mut self, value: i64) {
        if self.count > 0 && self.state == value {
            self.count += 1;
        } else {
            if self.count > 0 {
                self.enc.write_var_u64(self.count - 1);
            }
            self.count = 1;
            self.enc.write_var_i64(value.wrapping_sub(self.state));
            self.state = value;
        }
    }

    pub fn finish(self) -> Vec<u8> {
        self.enc.into_vec()
    }
}

#[derive(Debug)]
pub struct RleIntDiffDecoder<'a> {
    dec: Decoder<'a>,
    state: i64,
    count: i64,
}

impl<'a> RleIntDiffDecoder<'a> {
    pub fn new(buf: &'a [u8], start: i64) -> Self {
        Self {
            dec: Decoder::new(buf),
            state: start,
            count: 0,
        }
    }

    pub fn read(&mut self) -> Result<i64> {
        if self.count == 0 {
            self.state = self.state.wrapping_add(self.dec.read_var_i64()?);
            self.count = if self.dec.has_content() {
                (self.dec.read_var_u64()? as i64).saturating_add(1)
            } else {
                -1
            };
        }
        self.count -= 1;
        Ok(self.state)
    }
}

/// Runs of consecutive unsigned values (`n, n + 1, n + 2, ...`).
#[derive(Debug, Default)]
pub struct IncUintOptRleEncoder {
    enc: Encoder,
    state: u64,
    count: u64,
}

impl IncUintOptRleEncoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn write(&mut self, value: u64) {
        if self.count > 0 && self.state.wrapping_add(self.count) == value {
            self.count += 1;
        } else {
            flush_opt_run(&mut self.enc, self.state, self.count);
            self.count = 1;
            self.state = value;
        }
    }

    pub fn finish(mut self) -> Vec<u8> {
        flush_opt_run(&mut self.enc, self.state, self.count);
        self.enc.into_vec()
    }
}

#[derive(Debug)]
pub struct IncUintOptRleDecoder<'a> {
    dec: Decoder<'a>,
    state: u64,
    count: u64,
}

impl<'a> IncUintOptRleDecoder<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self {
            dec: Decoder::new(buf),
            state: 0,
            count: 0,
        }
    }

    pub fn read(&mut self) -> Result<u64> {
        if self.count == 0 {
            let (value, negative) = self.dec.read_signed()?;
            self.state = value;
            self.count = if negative {
                self.dec.read_var_u64()?.saturating_add(2)
            } else {
                1
            };
        }
        self.count -= 1;
        let value = self.state;
        self.state = self.state.wrapping_add(1);
        Ok(value)
    }
}
