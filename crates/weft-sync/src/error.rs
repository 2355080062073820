//! Error types for the sync layer.

use thiserror::Error;
use weft_codec::CodecError;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SyncError {
    #[error("Malformed sync message: {0}")]
    Codec(#[from] CodecError),

    #[error("Document rejected the update: {0}")]
    Document(#[from] weft_core::Error),

    #[error("Unknown sync message tag: {0}")]
    UnknownMessage(u64),

    #[error("Peer not found: {0}")]
    PeerNotFound(usize),
}

pub type Result<T> = std::result::Result<T, SyncError>;
