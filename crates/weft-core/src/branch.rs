//! Shared type storage.
//!
//! A [`Branch`] is the state behind every shared type: the head of its
//! element sequence, the latest item per map key, the visible sequence
//! length and a search-marker cache. Root branches are owned by the store
//! and addressed by name; nested branches live inside the `Type` content of
//! the item that created them.

use crate::block::BlockPtr;
use crate::markers::{SearchMarkers, DEFAULT_MARKER_CAPACITY};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

/// Stable handle to a branch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TypePtr {
    /// Index into the store's root table.
    Root(u32),
    /// Item whose content holds the branch.
    Nested(BlockPtr),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TypeKind {
    /// Root created by a remote update before any local accessor claimed it.
    Undefined,
    Array,
    Map,
    Text,
}

impl TypeKind {
    pub fn type_ref(self) -> u64 {
        match self {
            TypeKind::Undefined | TypeKind::Array => 0,
            TypeKind::Map => 1,
            TypeKind::Text => 2,
        }
    }

    pub fn from_type_ref(type_ref: u64) -> Option<Self> {
        match type_ref {
            0 => Some(TypeKind::Array),
            1 => Some(TypeKind::Map),
            2 => Some(TypeKind::Text),
            _ => None,
        }
    }

    pub fn is_sequence(self) -> bool {
        matches!(self, TypeKind::Array | TypeKind::Text)
    }
}

#[derive(Debug)]
pub struct Branch {
    pub(crate) start: Option<BlockPtr>,
    pub(crate) map: HashMap<Arc<str>, BlockPtr>,
    pub(crate) len: u64,
    pub(crate) kind: TypeKind,
    /// Item holding this branch, `None` for roots.
    pub(crate) item: Option<BlockPtr>,
    pub(crate) markers: Mutex<SearchMarkers>,
}

impl Branch {
    pub fn new(kind: TypeKind) -> Self {
        Self {
            start: None,
            map: HashMap::new(),
            len: 0,
            kind,
            item: None,
            markers: Mutex::new(SearchMarkers::new(DEFAULT_MARKER_CAPACITY)),
        }
    }

    pub fn kind(&self) -> TypeKind {
        self.kind
    }

    /// Number of visible sequence elements.
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn start(&self) -> Option<BlockPtr> {
        self.start
    }

    pub fn item(&self) -> Option<BlockPtr> {
        self.item
    }

    pub(crate) fn map_entry(&self, key: &str) -> Option<BlockPtr> {
        self.map.get(key).copied()
    }

    pub(crate) fn set_marker_capacity(&mut self, capacity: usize) {
        self.markers.get_mut().set_capacity(capacity);
    }

    pub(crate) fn clear_markers(&self) {
        self.markers.lock().clear();
    }
}
