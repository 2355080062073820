//! Blocks: the unit of storage in the struct store.
//!
//! A block is either an [`Item`] (content plus its position in a type) or a
//! [`Gc`] range whose content and links have been discarded. Blocks live in
//! the store's arena and are addressed by [`BlockPtr`]; `left`/`right` links
//! are arena indices rather than references, so splitting a block only needs
//! a new slot and two updated indices.

use crate::branch::TypePtr;
use crate::content::ItemContent;
use crate::id::ID;
use std::sync::Arc;

/// Index of a block in the store arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockPtr(pub(crate) u32);

impl BlockPtr {
    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }
}

/// Where an item belongs.
///
/// Decoded items reference their parent by root name or by the id of the
/// item holding the nested type; the reference is resolved to a
/// [`TypePtr`] when the item is integrated. `Unknown` means the parent is
/// inherited from the item's neighbours.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Parent {
    Type(TypePtr),
    Named(Arc<str>),
    Id(ID),
    Unknown,
}

const ITEM_KEEP: u8 = 0b0001;
const ITEM_COUNTABLE: u8 = 0b0010;
const ITEM_DELETED: u8 = 0b0100;

#[derive(Debug)]
pub struct Item {
    pub id: ID,
    pub len: u64,
    pub left: Option<BlockPtr>,
    pub right: Option<BlockPtr>,
    /// Last id of the left neighbour at creation time.
    pub origin: Option<ID>,
    /// Id of the right neighbour at creation time.
    pub right_origin: Option<ID>,
    pub content: ItemContent,
    pub parent: Parent,
    /// Map key for map entries, `None` for sequence elements.
    pub parent_sub: Option<Arc<str>>,
    /// Id of the item that restored this one after a delete.
    pub redone: Option<ID>,
    pub(crate) info: u8,
}

impl Item {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: ID,
        left: Option<BlockPtr>,
        origin: Option<ID>,
        right: Option<BlockPtr>,
        right_origin: Option<ID>,
        parent: Parent,
        parent_sub: Option<Arc<str>>,
        content: ItemContent,
    ) -> Self {
        let info = if content.is_countable() {
            ITEM_COUNTABLE
        } else {
            0
        };
        Self {
            id,
            len: content.len(),
            left,
            right,
            origin,
            right_origin,
            content,
            parent,
            parent_sub,
            redone: None,
            info,
        }
    }

    pub fn is_deleted(&self) -> bool {
        self.info & ITEM_DELETED != 0
    }

    pub fn is_countable(&self) -> bool {
        self.info & ITEM_COUNTABLE != 0
    }

    /// Protected from garbage collection.
    pub fn is_keep(&self) -> bool {
        self.info & ITEM_KEEP != 0
    }

    /// Counts towards the sequence length of its parent.
    pub fn is_visible_element(&self) -> bool {
        !self.is_deleted() && self.is_countable()
    }

    pub(crate) fn mark_deleted(&mut self) {
        self.info |= ITEM_DELETED;
    }

    pub(crate) fn set_keep(&mut self, keep: bool) {
        if keep {
            self.info |= ITEM_KEEP;
        } else {
            self.info &= !ITEM_KEEP;
        }
    }

    pub fn last_id(&self) -> ID {
        ID::new(self.id.client, self.id.clock + self.len - 1)
    }

    pub fn parent_type(&self) -> Option<TypePtr> {
        match self.parent {
            Parent::Type(ptr) => Some(ptr),
            _ => None,
        }
    }

    pub fn content(&self) -> &ItemContent {
        &self.content
    }
}

/// A garbage-collected id range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Gc {
    pub id: ID,
    pub len: u64,
}

#[derive(Debug)]
pub enum Block {
    Item(Item),
    Gc(Gc),
}

impl Block {
    pub fn id(&self) -> ID {
        match self {
            Block::Item(item) => item.id,
            Block::Gc(gc) => gc.id,
        }
    }

    pub fn len(&self) -> u64 {
        match self {
            Block::Item(item) => item.len,
            Block::Gc(gc) => gc.len,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn last_id(&self) -> ID {
        let id = self.id();
        ID::new(id.client, id.clock + self.len() - 1)
    }

    /// Gc ranges always count as deleted.
    pub fn is_deleted(&self) -> bool {
        match self {
            Block::Item(item) => item.is_deleted(),
            Block::Gc(_) => true,
        }
    }

    pub fn contains(&self, id: &ID) -> bool {
        let own = self.id();
        own.client == id.client && own.clock <= id.clock && id.clock < own.clock + self.len()
    }

    pub fn as_item(&self) -> Option<&Item> {
        match self {
            Block::Item(item) => Some(item),
            Block::Gc(_) => None,
        }
    }

    pub fn as_item_mut(&mut self) -> Option<&mut Item> {
        match self {
            Block::Item(item) => Some(item),
            Block::Gc(_) => None,
        }
    }

    pub fn is_gc(&self) -> bool {
        matches!(self, Block::Gc(_))
    }

    /// Drop the first `offset` elements. Used when part of a decoded block
    /// is already known locally.
    pub(crate) fn trim_start(&mut self, offset: u64) {
        if offset == 0 {
            return;
        }
        match self {
            Block::Item(item) => {
                item.id.clock += offset;
                item.content = item.content.splice(offset);
                item.len -= offset;
            }
            Block::Gc(gc) => {
                gc.id.clock += offset;
                gc.len -= offset;
            }
        }
    }
}
