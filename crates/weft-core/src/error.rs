//! Error types for the replication engine.

use crate::id::ID;
use thiserror::Error;
use weft_codec::CodecError;

/// Errors surfaced by document operations.
///
/// Causal gaps are not errors: blocks that depend on missing updates are
/// parked in the store until the gap closes.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("Malformed update: {0}")]
    Codec(#[from] CodecError),

    #[error("Unknown content reference: {0}")]
    UnknownContentRef(u8),

    #[error("Unknown shared type reference: {0}")]
    UnknownTypeRef(u64),

    #[error("Invalid update: {0}")]
    InvalidUpdate(String),

    #[error("Invalid index: {index} (length: {length})")]
    IndexOutOfBounds { index: u64, length: u64 },

    #[error("Cannot redo {0}: its content was garbage collected")]
    RedoUnavailable(ID),

    #[error("Invalid relative position: {0}")]
    InvalidPosition(String),

    #[error("Struct store integrity violated: {0}")]
    Integrity(String),

    #[error("Restoring a snapshot requires a document with garbage collection disabled")]
    GcEnabled,
}

pub type Result<T> = std::result::Result<T, Error>;
