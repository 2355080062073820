//! Error types for the binary codecs.

use thiserror::Error;

/// Errors raised while decoding a byte stream.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("Unexpected end of input: needed {needed} byte(s), {remaining} left")]
    UnexpectedEnd { needed: usize, remaining: usize },

    #[error("Variable-length integer does not fit in 64 bits")]
    VarIntOverflow,

    #[error("Invalid UTF-8 in string payload")]
    InvalidUtf8,

    #[error("String table slice of {requested} UTF-16 units does not land on a character boundary")]
    MisalignedString { requested: u64 },

    #[error("Unknown value tag: {0}")]
    UnknownAnyTag(u8),

    #[error("Invalid JSON payload: {0}")]
    InvalidJson(String),

    #[error("Values nested deeper than {0} levels")]
    NestingTooDeep(usize),

    #[error("Length {0} exceeds the addressable range")]
    LengthOverflow(u64),
}

pub type Result<T> = std::result::Result<T, CodecError>;
