//! # Weft Codec
//!
//! Binary building blocks shared by every Weft wire format:
//!
//! - **varint**: unsigned and signed variable-length integers, length-prefixed
//!   strings and buffers, big-endian floats
//! - **rle**: run-length and delta streams used to compress the column
//!   layout of an update
//! - **string**: a string table that stores all strings of a stream in one
//!   blob and slices it by UTF-16 length
//! - **any**: the tagged, JSON-like [`Any`] value
//!
//! Encoders never fail. Decoders return [`CodecError`] on truncated or
//! malformed input and never panic.
//!
//! ```rust
//! use weft_codec::{Decoder, Encoder};
//!
//! let mut enc = Encoder::new();
//! enc.write_var_u64(300);
//! enc.write_var_string("weft");
//! let bytes = enc.into_vec();
//!
//! let mut dec = Decoder::new(&bytes);
//! assert_eq!(dec.read_var_u64().unwrap(), 300);
//! assert_eq!(dec.read_var_string().unwrap(), "weft");
//! ```

pub mod any;
pub mod error;
pub mod rle;
pub mod string;
pub mod varint;

pub use any::Any;
pub use error::{CodecError, Result};
pub use rle::{
    IncUintOptRleDecoder, IncUintOptRleEncoder, IntDiffDecoder, IntDiffEncoder,
    IntDiffOptRleDecoder, IntDiffOptRleEncoder, RleDecoder, RleEncoder, RleIntDiffDecoder,
    RleIntDiffEncoder, UintOptRleDecoder, UintOptRleEncoder,
};
pub use string::{StringDecoder, StringEncoder};
pub use varint::{Decoder, Encoder};
