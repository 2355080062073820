//! # weft-sync
//!
//! Replication between Weft documents.
//!
//! This crate provides:
//! - The three-message sync handshake (state vector, missing update,
//!   incremental update) and its binary encoding
//! - A [`Protocol`] trait with the standard handler as default methods
//! - [`SyncPeer`], a document that queues its local updates for sending
//! - [`SyncCluster`], an in-memory network with message loss, duplication
//!   and reordering for convergence tests
//!
//! Transport is left to the embedding application: messages are plain
//! byte buffers.
//!
//! ## Example
//!
//! ```rust
//! use weft_sync::{NetworkConfig, SyncCluster};
//!
//! let mut cluster = SyncCluster::new(3, NetworkConfig::chaotic());
//! for i in 0..3 {
//!     cluster.edit(i, |doc| {
//!         let text = doc.get_text("notes");
//!         let mut txn = doc.transact_mut();
//!         text.push(&mut txn, "hi ").unwrap();
//!     });
//! }
//! while !cluster.is_converged() {
//!     cluster.full_sync_round().unwrap();
//!     cluster.retransmit_and_process().unwrap();
//! }
//! ```

pub mod cluster;
pub mod error;
pub mod peer;
pub mod protocol;

pub use cluster::{Envelope, NetworkConfig, NetworkSimulator, SyncCluster};
pub use error::{Result, SyncError};
pub use peer::{PeerId, SyncPeer};
pub use protocol::{DefaultProtocol, Protocol, SyncMessage, MSG_SYNC_STEP_1, MSG_SYNC_STEP_2, MSG_UPDATE};
