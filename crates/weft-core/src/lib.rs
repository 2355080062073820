//! # weft-core
//!
//! Sequence CRDT replication engine based on YATA.
//!
//! This crate provides:
//! - A per-client struct store of items and garbage-collected ranges
//! - Conflict-free integration of concurrent inserts into sequences and maps
//! - Delete sets, state vectors and the binary update format used to
//!   exchange changes between replicas
//! - Transactions with observers, garbage collection and block merging
//! - Shared array, map and text types with nested values
//! - Snapshots for historical reads, and an undo manager
//! - Relative positions that stay attached to an element across edits
//!
//! Updates can be applied in any order and any number of times: blocks that
//! depend on missing updates are held back until their dependencies arrive.
//!
//! ## Example
//!
//! ```rust
//! use weft_core::{Doc, DocOptions, ReadTxn, SharedRef};
//!
//! let mut a = Doc::with_options(DocOptions::builder().client_id(1).build());
//! let mut b = Doc::with_options(DocOptions::builder().client_id(2).build());
//! let (list_a, list_b) = (a.get_array("todo"), b.get_array("todo"));
//! {
//!     let mut txn = a.transact_mut();
//!     list_a.push_back(&mut txn, "milk").unwrap();
//! }
//! {
//!     let mut txn = b.transact_mut();
//!     list_b.push_back(&mut txn, "eggs").unwrap();
//! }
//!
//! let to_b = a.encode_state_as_update_v2(&b.state_vector());
//! let to_a = b.encode_state_as_update_v2(&a.state_vector());
//! a.apply_update_v2(&to_a).unwrap();
//! b.apply_update_v2(&to_b).unwrap();
//!
//! assert_eq!(list_a.to_json(&a), list_b.to_json(&b));
//! ```

pub mod block;
pub mod branch;
pub mod content;
pub mod delete_set;
pub mod doc;
pub mod error;
pub mod event;
pub mod id;
mod integrate;
mod map;
mod markers;
pub mod position;
mod sequence;
pub mod snapshot;
pub mod store;
pub mod transaction;
pub mod types;
pub mod undo;
pub mod update;

pub use block::{Block, BlockPtr, Item};
pub use branch::{TypeKind, TypePtr};
pub use content::ItemContent;
pub use delete_set::{DeleteItem, DeleteSet};
pub use doc::{generate_client_id, Doc, DocOptions, DocOptionsBuilder, GcFilter, Origin, SubscriptionId};
pub use error::{Error, Result};
pub use event::{Delta, EntryChange, PathSegment, TypeEvent, UpdateEvent};
pub use id::{ClientId, StateVector, ID};
pub use position::{AbsolutePosition, Anchor, Assoc, RelativePosition};
pub use snapshot::Snapshot;
pub use store::{PendingStructs, Store};
pub use transaction::{ReadTxn, TransactionMut};
pub use types::{ArrayRef, In, MapRef, SharedRef, TextRef, Value};
pub use undo::{DeleteFilter, StackItem, UndoManager, UndoOptions};
pub use update::Update;
pub use weft_codec::Any;
