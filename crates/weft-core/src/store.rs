//! Struct store: the authoritative per-client timelines.
//!
//! Blocks are kept in an arena. For every client the store keeps the arena
//! indices of its blocks ordered by clock, without gaps: block `n + 1`
//! starts where block `n` ends. Lookups by id binary-search that list.
//!
//! Blocks that cannot be integrated yet because a causal dependency is
//! missing are parked in [`PendingStructs`] and retried whenever new blocks
//! land.

use crate::block::{Block, BlockPtr, Gc, Item, Parent};
use crate::branch::{Branch, TypeKind, TypePtr};
use crate::delete_set::DeleteSet;
use crate::error::{Error, Result};
use crate::id::{ClientId, StateVector, ID};
use crate::markers::DEFAULT_MARKER_CAPACITY;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

/// Decoded blocks waiting for a causal dependency.
#[derive(Debug, Default)]
pub struct PendingStructs {
    pub(crate) blocks: HashMap<ClientId, VecDeque<Block>>,
    /// Lowest missing clock per client that blocks progress.
    pub(crate) missing: StateVector,
}

impl PendingStructs {
    pub fn is_empty(&self) -> bool {
        self.blocks.values().all(VecDeque::is_empty)
    }

    /// Number of parked blocks.
    pub fn len(&self) -> usize {
        self.blocks.values().map(VecDeque::len).sum()
    }

    pub fn missing(&self) -> &StateVector {
        &self.missing
    }

    pub(crate) fn merge(&mut self, other: PendingStructs) {
        for (client, clock) in other.missing.iter() {
            self.missing.set_min(client, clock);
        }
        for (client, blocks) in other.blocks {
            let queue = self.blocks.entry(client).or_default();
            queue.extend(blocks);
            queue
                .make_contiguous()
                .sort_by_key(|block| block.id().clock);
        }
    }
}

#[derive(Debug)]
pub struct Store {
    blocks: Vec<Block>,
    free: Vec<BlockPtr>,
    clients: HashMap<ClientId, Vec<BlockPtr>>,
    roots: Vec<Branch>,
    root_names: Vec<Arc<str>>,
    root_index: HashMap<Arc<str>, u32>,
    /// Right halves produced by splits since the last commit.
    pub(crate) split_log: Vec<ID>,
    pub(crate) pending: Option<PendingStructs>,
    pub(crate) pending_ds: Option<DeleteSet>,
    marker_capacity: usize,
}

impl Default for Store {
    fn default() -> Self {
        Self::new(DEFAULT_MARKER_CAPACITY)
    }
}

impl Store {
    pub fn new(marker_capacity: usize) -> Self {
        Self {
            blocks: Vec::new(),
            free: Vec::new(),
            clients: HashMap::new(),
            roots: Vec::new(),
            root_names: Vec::new(),
            root_index: HashMap::new(),
            split_log: Vec::new(),
            pending: None,
            pending_ds: None,
            marker_capacity,
        }
    }

    pub fn marker_capacity(&self) -> usize {
        self.marker_capacity
    }

    // ------------------------------------------------------------------
    // Arena
    // ------------------------------------------------------------------

    pub(crate) fn alloc(&mut self, block: Block) -> BlockPtr {
        match self.free.pop() {
            Some(ptr) => {
                self.blocks[ptr.index()] = block;
                ptr
            }
            None => {
                let ptr = BlockPtr(self.blocks.len() as u32);
                self.blocks.push(block);
                ptr
            }
        }
    }

    /// Return a slot to the free list once nothing links to it anymore.
    fn release(&mut self, ptr: BlockPtr) {
        self.blocks[ptr.index()] = Block::Gc(Gc {
            id: ID::new(0, 0),
            len: 0,
        });
        self.free.push(ptr);
    }

    pub fn block(&self, ptr: BlockPtr) -> &Block {
        &self.blocks[ptr.index()]
    }

    pub(crate) fn block_mut(&mut self, ptr: BlockPtr) -> &mut Block {
        &mut self.blocks[ptr.index()]
    }

    /// The item at `ptr`. Panics if the block was garbage collected, which
    /// never happens for blocks reachable from a live type.
    pub fn item(&self, ptr: BlockPtr) -> &Item {
        match &self.blocks[ptr.index()] {
            Block::Item(item) => item,
            Block::Gc(gc) => panic!("expected an item at {ptr:?}, found gc range {}", gc.id),
        }
    }

    pub(crate) fn item_mut(&mut self, ptr: BlockPtr) -> &mut Item {
        match &mut self.blocks[ptr.index()] {
            Block::Item(item) => item,
            Block::Gc(gc) => panic!("expected an item at {ptr:?}, found gc range {}", gc.id),
        }
    }

    // ------------------------------------------------------------------
    // Client timelines
    // ------------------------------------------------------------------

    /// Next expected clock for `client`.
    pub fn get_state(&self, client: ClientId) -> u64 {
        self.clients
            .get(&client)
            .and_then(|blocks| blocks.last())
            .map(|ptr| {
                let block = self.block(*ptr);
                block.id().clock + block.len()
            })
            .unwrap_or(0)
    }

    pub fn state_vector(&self) -> StateVector {
        self.clients
            .keys()
            .map(|client| (*client, self.get_state(*client)))
            .filter(|(_, clock)| *clock > 0)
            .collect()
    }

    pub fn clients(&self) -> impl Iterator<Item = ClientId> + '_ {
        self.clients.keys().copied()
    }

    pub fn blocks_of(&self, client: ClientId) -> &[BlockPtr] {
        self.clients.get(&client).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Position of the block containing `clock` within `client`'s timeline.
    pub fn find_index(&self, client: ClientId, clock: u64) -> Option<usize> {
        let blocks = self.clients.get(&client)?;
        let pos = blocks.partition_point(|ptr| self.block(*ptr).id().clock <= clock);
        if pos == 0 {
            return None;
        }
        let block = self.block(blocks[pos - 1]);
        (clock < block.id().clock + block.len()).then_some(pos - 1)
    }

    /// Block containing `id`, without splitting.
    pub fn find(&self, id: &ID) -> Option<BlockPtr> {
        let index = self.find_index(id.client, id.clock)?;
        Some(self.clients[&id.client][index])
    }

    /// Append a freshly integrated block to its client's timeline.
    pub(crate) fn push_block(&mut self, ptr: BlockPtr) {
        let id = self.block(ptr).id();
        let state = self.get_state(id.client);
        assert_eq!(
            id.clock, state,
            "block {id} does not continue client {} at clock {state}",
            id.client
        );
        self.clients.entry(id.client).or_default().push(ptr);
    }

    /// Block whose range starts exactly at `id`, splitting if needed.
    pub fn get_item_clean_start(&mut self, id: &ID) -> Option<BlockPtr> {
        let index = self.find_index(id.client, id.clock)?;
        let ptr = self.clients[&id.client][index];
        let block = self.block(ptr);
        if block.id().clock < id.clock && !block.is_gc() {
            let diff = id.clock - block.id().clock;
            Some(self.split_at(id.client, index, diff))
        } else {
            Some(ptr)
        }
    }

    /// Block whose range ends exactly at `id`, splitting if needed.
    pub fn get_item_clean_end(&mut self, id: &ID) -> Option<BlockPtr> {
        let index = self.find_index(id.client, id.clock)?;
        let ptr = self.clients[&id.client][index];
        let block = self.block(ptr);
        if id.clock != block.last_id().clock && !block.is_gc() {
            let diff = id.clock - block.id().clock + 1;
            self.split_at(id.client, index, diff);
        }
        Some(ptr)
    }

    /// Split the item at `index` of `client`'s timeline after `diff`
    /// elements. Returns the new right half.
    fn split_at(&mut self, client: ClientId, index: usize, diff: u64) -> BlockPtr {
        let left_ptr = self.clients[&client][index];
        let right_ptr = self.split_item(left_ptr, diff);
        if let Some(blocks) = self.clients.get_mut(&client) {
            blocks.insert(index + 1, right_ptr);
        }
        right_ptr
    }

    fn split_item(&mut self, left_ptr: BlockPtr, diff: u64) -> BlockPtr {
        let left = self.item_mut(left_ptr);
        let client = left.id.client;
        let clock = left.id.clock;
        let content = left.content.splice(diff);
        let mut right = Item::new(
            ID::new(client, clock + diff),
            Some(left_ptr),
            Some(ID::new(client, clock + diff - 1)),
            left.right,
            left.right_origin,
            left.parent.clone(),
            left.parent_sub.clone(),
            content,
        );
        right.info = left.info;
        right.redone = left.redone.map(|r| ID::new(r.client, r.clock + diff));
        left.len = diff;

        let right_id = right.id;
        let old_right = right.right;
        let parent = right.parent_type();
        let key = right.parent_sub.clone();
        let right_ptr = self.alloc(Block::Item(right));
        self.item_mut(left_ptr).right = Some(right_ptr);
        match old_right {
            Some(next) => self.item_mut(next).left = Some(right_ptr),
            None => {
                if let (Some(parent), Some(key)) = (parent, key) {
                    if let Some(branch) = self.branch_mut(parent) {
                        branch.map.insert(key, right_ptr);
                    }
                }
            }
        }
        self.split_log.push(right_id);
        right_ptr
    }

    /// Swap a collected item for a gc range occupying the same slot.
    pub(crate) fn replace_with_gc(&mut self, ptr: BlockPtr) {
        let block = self.block_mut(ptr);
        let gc = Gc {
            id: block.id(),
            len: block.len(),
        };
        *block = Block::Gc(gc);
    }

    /// Try to merge the block at `pos` of `client`'s timeline into its left
    /// neighbour. Returns whether a merge happened.
    pub(crate) fn try_merge_with_left(&mut self, client: ClientId, pos: usize) -> bool {
        if pos == 0 {
            return false;
        }
        let Some(blocks) = self.clients.get(&client) else {
            return false;
        };
        if pos >= blocks.len() {
            return false;
        }
        let left_ptr = blocks[pos - 1];
        let right_ptr = blocks[pos];

        match (self.block(left_ptr), self.block(right_ptr)) {
            (Block::Gc(_), Block::Gc(right)) => {
                let extra = right.len;
                if let Block::Gc(left) = self.block_mut(left_ptr) {
                    left.len += extra;
                }
            }
            (Block::Item(left), Block::Item(right)) => {
                if !can_merge(left, right_ptr, right) {
                    return false;
                }
                let shift = if left.is_visible_element() { left.len } else { 0 };
                let parent = left.parent_type();
                let right = self.item_mut(right_ptr);
                let content = std::mem::replace(&mut right.content, crate::content::ItemContent::Deleted(0));
                let (right_len, right_keep, next, key) =
                    (right.len, right.is_keep(), right.right, right.parent_sub.clone());

                let left = self.item_mut(left_ptr);
                left.content.merge(content);
                left.len += right_len;
                left.right = next;
                if right_keep {
                    left.set_keep(true);
                }
                if let Some(next) = next {
                    self.item_mut(next).left = Some(left_ptr);
                }
                if let Some(parent) = parent {
                    if let Some(branch) = self.branch_mut(parent) {
                        if let Some(key) = key {
                            if branch.map.get(&key) == Some(&right_ptr) {
                                branch.map.insert(key, left_ptr);
                            }
                        }
                        branch.markers.get_mut().repoint(right_ptr, left_ptr, shift);
                    }
                }
            }
            _ => return false,
        }
        if let Some(blocks) = self.clients.get_mut(&client) {
            blocks.remove(pos);
        }
        self.release(right_ptr);
        true
    }

    // ------------------------------------------------------------------
    // Shared types
    // ------------------------------------------------------------------

    /// Root type called `name`, created on first access. A root created by a
    /// remote update has kind `Undefined` until a local accessor claims it.
    pub fn get_or_create_root(&mut self, name: &str, kind: TypeKind) -> TypePtr {
        if let Some(&index) = self.root_index.get(name) {
            let branch = &mut self.roots[index as usize];
            if branch.kind == TypeKind::Undefined {
                branch.kind = kind;
            }
            return TypePtr::Root(index);
        }
        let index = self.roots.len() as u32;
        let mut branch = Branch::new(kind);
        branch.set_marker_capacity(self.marker_capacity);
        self.roots.push(branch);
        let name: Arc<str> = name.into();
        self.root_names.push(name.clone());
        self.root_index.insert(name, index);
        TypePtr::Root(index)
    }

    pub fn root(&self, name: &str) -> Option<TypePtr> {
        self.root_index.get(name).map(|i| TypePtr::Root(*i))
    }

    pub fn root_name(&self, index: u32) -> Option<&Arc<str>> {
        self.root_names.get(index as usize)
    }

    pub fn roots(&self) -> impl Iterator<Item = (&Arc<str>, TypePtr)> + '_ {
        self.root_names
            .iter()
            .enumerate()
            .map(|(i, name)| (name, TypePtr::Root(i as u32)))
    }

    /// Branch behind `ptr`, `None` if its item was garbage collected.
    pub fn branch(&self, ptr: TypePtr) -> Option<&Branch> {
        match ptr {
            TypePtr::Root(index) => self.roots.get(index as usize),
            TypePtr::Nested(item) => self.block(item).as_item()?.content.as_branch(),
        }
    }

    pub(crate) fn branch_mut(&mut self, ptr: TypePtr) -> Option<&mut Branch> {
        match ptr {
            TypePtr::Root(index) => self.roots.get_mut(index as usize),
            TypePtr::Nested(item) => self.block_mut(item).as_item_mut()?.content.as_branch_mut(),
        }
    }

    /// Type containing the nested type `ptr`.
    pub fn parent_of(&self, ptr: TypePtr) -> Option<TypePtr> {
        match ptr {
            TypePtr::Root(_) => None,
            TypePtr::Nested(item) => self.block(item).as_item()?.parent_type(),
        }
    }

    /// Whether the item holding `ptr` has been deleted.
    pub fn is_type_deleted(&self, ptr: TypePtr) -> bool {
        match ptr {
            TypePtr::Root(_) => false,
            TypePtr::Nested(item) => self.block(item).is_deleted(),
        }
    }

    /// Whether `ptr` is `ancestor` or nested somewhere below it.
    pub fn is_descendant_of(&self, mut ptr: TypePtr, ancestor: TypePtr) -> bool {
        loop {
            if ptr == ancestor {
                return true;
            }
            match self.parent_of(ptr) {
                Some(parent) => ptr = parent,
                None => return false,
            }
        }
    }

    /// Resolve the parent reference of a decoded item.
    pub(crate) fn resolve_parent(&mut self, parent: &Parent) -> Option<TypePtr> {
        match parent {
            Parent::Type(ptr) => Some(*ptr),
            Parent::Named(name) => Some(self.get_or_create_root(name, TypeKind::Undefined)),
            Parent::Id(id) => {
                let ptr = self.find(id)?;
                let item = self.block(ptr).as_item()?;
                item.content.as_branch().map(|_| TypePtr::Nested(ptr))
            }
            Parent::Unknown => None,
        }
    }

    // ------------------------------------------------------------------
    // Diagnostics
    // ------------------------------------------------------------------

    /// Blocks parked because of missing dependencies.
    pub fn pending(&self) -> Option<&PendingStructs> {
        self.pending.as_ref()
    }

    /// Deletions that target blocks this store has not seen yet.
    pub fn pending_delete_set(&self) -> Option<&DeleteSet> {
        self.pending_ds.as_ref()
    }

    /// Verify that every client timeline is contiguous and that neighbour
    /// links are symmetric.
    pub fn integrity_check(&self) -> Result<()> {
        for (client, blocks) in &self.clients {
            let mut expected = 0u64;
            for ptr in blocks {
                let block = self.block(*ptr);
                let id = block.id();
                if id.client != *client || id.clock != expected {
                    return Err(Error::Integrity(format!(
                        "client {client}: expected clock {expected}, found {id}"
                    )));
                }
                if block.len() == 0 {
                    return Err(Error::Integrity(format!("empty block {id}")));
                }
                expected += block.len();
                if let Block::Item(item) = block {
                    if let Some(left) = item.left {
                        if self.block(left).as_item().and_then(|l| l.right) != Some(*ptr) {
                            return Err(Error::Integrity(format!("{id}: left link not mirrored")));
                        }
                    }
                    if let Some(right) = item.right {
                        if self.block(right).as_item().and_then(|r| r.left) != Some(*ptr) {
                            return Err(Error::Integrity(format!("{id}: right link not mirrored")));
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Count of adjacent block pairs that could still be merged.
    pub fn unmerged_neighbours(&self) -> usize {
        self.clients
            .values()
            .flat_map(|blocks| blocks.windows(2))
            .filter(|pair| match (self.block(pair[0]), self.block(pair[1])) {
                (Block::Item(l), Block::Item(r)) => can_merge(l, pair[1], r),
                (Block::Gc(_), Block::Gc(_)) => true,
                _ => false,
            })
            .count()
    }
}

fn can_merge(left: &Item, right_ptr: BlockPtr, right: &Item) -> bool {
    left.is_deleted() == right.is_deleted()
        && left.is_keep() == right.is_keep()
        && right.origin == Some(left.last_id())
        && left.right == Some(right_ptr)
        && left.right_origin == right.right_origin
        && left.id.client == right.id.client
        && left.id.clock + left.len == right.id.clock
        && left.redone.is_none()
        && right.redone.is_none()
        && left.content.can_merge(&right.content)
}
