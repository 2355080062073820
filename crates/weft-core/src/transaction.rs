//! Transactions: the only way to mutate a document.
//!
//! A [`TransactionMut`] borrows its [`Doc`] mutably, so at most one is open
//! per document. It records the state vector at open time, the deletions it
//! performed and the types it touched. Dropping it commits:
//!
//! 1. deletions are sorted and merged, the after-state is taken
//! 2. observers run, shallow first, then deep observers up the parent chain
//! 3. after-transaction hooks run (undo tracking)
//! 4. deleted content is garbage collected when the document allows it
//! 5. blocks split or produced by this transaction are merged back where
//!    possible
//! 6. local transactions publish their update to update listeners

use crate::block::{Block, BlockPtr, Item, Parent};
use crate::branch::TypePtr;
use crate::content::ItemContent;
use crate::delete_set::DeleteSet;
use crate::doc::{generate_client_id, Doc, Origin};
use crate::error::{Error, Result};
use crate::event::{TypeEvent, UpdateEvent};
use crate::id::{ClientId, StateVector, ID};
use crate::integrate::gc_item;
use crate::snapshot::Snapshot;
use crate::store::{PendingStructs, Store};
use crate::update::{self, Update, UpdateEncoderV2};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// Read access shared by documents and open transactions.
pub trait ReadTxn {
    fn store(&self) -> &Store;

    fn state_vector(&self) -> StateVector {
        self.store().state_vector()
    }

    fn encode_state_vector(&self) -> Vec<u8> {
        self.state_vector().encode()
    }

    /// Update containing everything a replica at `sv` has not seen, plus
    /// all known deletions.
    fn encode_state_as_update_v2(&self, sv: &StateVector) -> Vec<u8> {
        update::encode_state_as_update(self.store(), sv)
    }

    /// Like [`encode_state_as_update_v2`](Self::encode_state_as_update_v2)
    /// with the remote state vector still encoded.
    fn encode_diff_v2(&self, remote_sv: &[u8]) -> Result<Vec<u8>> {
        let sv = StateVector::decode(remote_sv)?;
        Ok(self.encode_state_as_update_v2(&sv))
    }

    fn snapshot(&self) -> Snapshot {
        let store = self.store();
        Snapshot::new(store.state_vector(), DeleteSet::from_store(store))
    }
}

impl ReadTxn for Doc {
    fn store(&self) -> &Store {
        &self.store
    }
}

pub struct TransactionMut<'doc> {
    pub(crate) doc: &'doc mut Doc,
    pub(crate) before_state: StateVector,
    pub(crate) after_state: StateVector,
    pub(crate) delete_set: DeleteSet,
    /// Changed types with the keys that changed; `None` marks a sequence change.
    pub(crate) changed: HashMap<TypePtr, HashSet<Option<Arc<str>>>>,
    pub(crate) changed_parent_types: HashSet<TypePtr>,
    /// Deleted blocks from earlier transactions worth a merge attempt.
    pub(crate) merge_blocks: Vec<ID>,
    origin: Option<Origin>,
    local: bool,
    committed: bool,
}

impl ReadTxn for TransactionMut<'_> {
    fn store(&self) -> &Store {
        &self.doc.store
    }
}

impl<'doc> TransactionMut<'doc> {
    pub(crate) fn new(doc: &'doc mut Doc, origin: Option<Origin>, local: bool) -> Self {
        let before_state = doc.store.state_vector();
        Self {
            doc,
            before_state,
            after_state: StateVector::new(),
            delete_set: DeleteSet::new(),
            changed: HashMap::new(),
            changed_parent_types: HashSet::new(),
            merge_blocks: Vec::new(),
            origin,
            local,
            committed: false,
        }
    }

    pub fn origin(&self) -> Option<&Origin> {
        self.origin.as_ref()
    }

    /// Whether the transaction was opened by a local edit rather than by
    /// applying a remote update.
    pub fn is_local(&self) -> bool {
        self.local
    }

    pub fn client_id(&self) -> ClientId {
        self.doc.client_id()
    }

    pub fn before_state(&self) -> &StateVector {
        &self.before_state
    }

    /// State at commit time. Empty until the transaction commits.
    pub fn after_state(&self) -> &StateVector {
        &self.after_state
    }

    pub fn delete_set(&self) -> &DeleteSet {
        &self.delete_set
    }

    /// Types changed by this transaction together with all their ancestors.
    /// Filled during commit.
    pub fn changed_parent_types(&self) -> &HashSet<TypePtr> {
        &self.changed_parent_types
    }

    pub(crate) fn store_mut(&mut self) -> &mut Store {
        &mut self.doc.store
    }

    /// Id for the next locally created item.
    pub(crate) fn next_id(&self) -> ID {
        let client = self.doc.client_id();
        ID::new(client, self.doc.store.get_state(client))
    }

    pub fn get_item_clean_start(&mut self, id: &ID) -> Option<BlockPtr> {
        self.doc.store.get_item_clean_start(id)
    }

    pub fn get_item_clean_end(&mut self, id: &ID) -> Option<BlockPtr> {
        self.doc.store.get_item_clean_end(id)
    }

    /// Visit every block covered by `ds`, splitting blocks so that each
    /// visited block lies entirely inside a deleted range. Returning `false`
    /// from `f` stops the walk.
    pub fn iterate_deleted_structs<F>(&mut self, ds: &DeleteSet, mut f: F)
    where
        F: FnMut(&Store, BlockPtr) -> bool,
    {
        for (client, ranges) in ds.iter() {
            let state = self.doc.store.get_state(client);
            for range in ranges {
                let end = range.end().min(state);
                if range.clock >= end {
                    continue;
                }
                let store = &mut self.doc.store;
                store.get_item_clean_start(&ID::new(client, range.clock));
                let Some(mut index) = store.find_index(client, range.clock) else {
                    continue;
                };
                loop {
                    let ptr = store.blocks_of(client)[index];
                    let block = store.block(ptr);
                    if end < block.id().clock + block.len() {
                        store.get_item_clean_start(&ID::new(client, end));
                    }
                    if !f(&*store, ptr) {
                        return;
                    }
                    index += 1;
                    let blocks = store.blocks_of(client);
                    if index >= blocks.len() || store.block(blocks[index]).id().clock >= end {
                        break;
                    }
                }
            }
        }
    }

    /// Set or clear the `keep` flag on an item and its ancestors.
    pub fn keep_item(&mut self, ptr: BlockPtr, keep: bool) {
        let mut cursor = Some(ptr);
        while let Some(ptr) = cursor {
            let Some(item) = self.doc.store.block_mut(ptr).as_item_mut() else {
                break;
            };
            if item.is_keep() == keep {
                break;
            }
            item.set_keep(keep);
            cursor = match item.parent_type() {
                Some(TypePtr::Nested(parent)) => Some(parent),
                _ => None,
            };
        }
    }

    // ------------------------------------------------------------------
    // Remote updates
    // ------------------------------------------------------------------

    /// Integrate a decoded update. Blocks with missing dependencies and
    /// deletions of unknown blocks are kept in the store and retried on
    /// every later update.
    pub fn apply_update(&mut self, update: Update) {
        let Update {
            blocks,
            delete_set,
        } = update;
        let mut incoming = blocks;
        loop {
            let rest = self.integrate_structs(incoming);
            let store = &mut self.doc.store;
            match (store.pending.as_mut(), rest) {
                (Some(pending), Some(rest)) => pending.merge(rest),
                (None, rest) => store.pending = rest,
                (Some(_), None) => {}
            }
            let retry = store.pending.as_ref().is_some_and(|pending| {
                pending
                    .missing
                    .iter()
                    .any(|(client, clock)| clock < store.get_state(client))
            });
            if !retry {
                break;
            }
            let Some(pending) = store.pending.take() else {
                break;
            };
            debug!(blocks = pending.len(), "resuming pending structs");
            incoming = pending.blocks;
        }

        let unapplied = self.apply_delete_set(&delete_set);
        let retried = match self.doc.store.pending_ds.take() {
            Some(pending_ds) => self.apply_delete_set(&pending_ds),
            None => None,
        };
        self.doc.store.pending_ds = match (unapplied, retried) {
            (Some(mut a), Some(b)) => {
                a.merge(&b);
                Some(a)
            }
            (a, b) => a.or(b),
        };
        if let Some(pending) = &self.doc.store.pending {
            debug!(
                blocks = pending.len(),
                missing = ?pending.missing(),
                "update left pending structs"
            );
        }
    }

    /// Integrate blocks grouped by client. Returns what could not be
    /// integrated yet, with the lowest missing clock per client.
    pub(crate) fn integrate_structs(
        &mut self,
        mut refs: HashMap<ClientId, VecDeque<Block>>,
    ) -> Option<PendingStructs> {
        let mut client_ids: Vec<ClientId> = refs.keys().copied().collect();
        client_ids.sort_unstable();
        let mut stack: Vec<Block> = Vec::new();
        let mut rest = PendingStructs::default();
        let mut state: HashMap<ClientId, u64> = HashMap::new();

        let mut head = next_ref(&mut client_ids, &mut refs)?;
        loop {
            let client = head.id().client;
            let clock = head.id().clock;
            let local = *state
                .entry(client)
                .or_insert_with(|| self.doc.store.get_state(client));
            if clock > local {
                // an earlier update from the same client is missing
                rest.missing.set_min(client, clock - 1);
                stack.push(head);
                park(&mut stack, &mut refs, &mut client_ids, &mut rest);
            } else {
                let offset = local - clock;
                match head {
                    Block::Gc(gc) => {
                        if offset < gc.len {
                            let end = clock + gc.len;
                            self.integrate_gc(gc, offset);
                            state.insert(client, end);
                        }
                    }
                    Block::Item(mut item) => match self.get_missing(&mut item) {
                        Some(dep) => {
                            stack.push(Block::Item(item));
                            match refs.get_mut(&dep).and_then(VecDeque::pop_front) {
                                Some(next) => {
                                    head = next;
                                    continue;
                                }
                                None => {
                                    let dep_state = self.doc.store.get_state(dep);
                                    rest.missing.set_min(dep, dep_state);
                                    park(&mut stack, &mut refs, &mut client_ids, &mut rest);
                                }
                            }
                        }
                        None => {
                            if offset < item.len {
                                let end = clock + item.len;
                                self.integrate(item, offset);
                                state.insert(client, end);
                            }
                        }
                    },
                }
            }
            head = match stack.pop() {
                Some(block) => block,
                None => match next_ref(&mut client_ids, &mut refs) {
                    Some(block) => block,
                    None => break,
                },
            };
        }

        if rest.is_empty() {
            return None;
        }
        for queue in rest.blocks.values_mut() {
            queue.make_contiguous().sort_by_key(|b| b.id().clock);
        }
        trace!(blocks = rest.len(), "parking blocks with missing dependencies");
        Some(rest)
    }

    /// Apply remote deletions. Ranges beyond the local state are returned.
    pub(crate) fn apply_delete_set(&mut self, ds: &DeleteSet) -> Option<DeleteSet> {
        let mut unapplied = DeleteSet::new();
        for (client, ranges) in ds.iter() {
            let state = self.doc.store.get_state(client);
            for range in ranges {
                let (clock, end) = (range.clock, range.end());
                if clock >= state {
                    unapplied.push(ID::new(client, clock), range.len);
                    continue;
                }
                if state < end {
                    unapplied.push(ID::new(client, state), end - state);
                }
                let Some(mut index) = self.doc.store.find_index(client, clock) else {
                    continue;
                };
                let first = self.doc.store.block(self.doc.store.blocks_of(client)[index]);
                if !first.is_deleted() && first.id().clock < clock {
                    self.doc.store.get_item_clean_start(&ID::new(client, clock));
                    index += 1;
                }
                while let Some(&ptr) = self.doc.store.blocks_of(client).get(index) {
                    let block = self.doc.store.block(ptr);
                    if block.id().clock >= end {
                        break;
                    }
                    if !block.is_deleted() {
                        if end < block.id().clock + block.len() {
                            self.doc.store.get_item_clean_start(&ID::new(client, end));
                        }
                        self.delete_item(ptr);
                    }
                    index += 1;
                }
            }
        }
        if unapplied.is_empty() {
            None
        } else {
            unapplied.sort_and_merge();
            Some(unapplied)
        }
    }

    // ------------------------------------------------------------------
    // Redo
    // ------------------------------------------------------------------

    /// Re-create a deleted item at its original position. Returns the new
    /// item, `None` if a conflicting remote change makes the redo
    /// impossible, and an error if the content was garbage collected.
    ///
    /// `redo_items` is the set of items being restored together; a deleted
    /// parent is only restored if it is part of that set.
    pub fn redo_item(
        &mut self,
        ptr: BlockPtr,
        redo_items: &HashSet<BlockPtr>,
    ) -> Result<Option<BlockPtr>> {
        let own = self.doc.client_id();
        let block = self.doc.store.block(ptr);
        let item = match block {
            Block::Item(item) if !matches!(item.content, ItemContent::Deleted(_)) => item,
            _ => {
                warn!(id = %block.id(), "redo of garbage collected content");
                return Err(Error::RedoUnavailable(block.id()));
            }
        };
        if let Some(redone) = item.redone {
            return Ok(self.doc.store.get_item_clean_start(&redone));
        }
        let id = item.id;
        let Some(original_parent) = item.parent_type() else {
            return Err(Error::RedoUnavailable(id));
        };
        let parent_sub = item.parent_sub.clone();
        let mut parent_item = match original_parent {
            TypePtr::Nested(p) => Some(p),
            TypePtr::Root(_) => None,
        };

        let (mut left, mut right) = if parent_sub.is_none() {
            (item.left, Some(ptr))
        } else {
            let store = &self.doc.store;
            let mut left = ptr;
            while let Some(next) = store.item(left).right {
                left = next;
                if store.item(left).id.client != own {
                    // overwritten by someone else
                    return Ok(None);
                }
            }
            (Some(left), None)
        };

        if let Some(p) = parent_item {
            let parent = self
                .doc
                .store
                .block(p)
                .as_item()
                .ok_or(Error::RedoUnavailable(id))?;
            if parent.is_deleted() && parent.redone.is_none() {
                if !redo_items.contains(&p) || self.redo_item(p, redo_items)?.is_none() {
                    return Ok(None);
                }
            }
            if self.doc.store.item(p).redone.is_some() {
                let mut current = p;
                while let Some(redone) = self.doc.store.item(current).redone {
                    current = self
                        .doc
                        .store
                        .get_item_clean_start(&redone)
                        .ok_or(Error::RedoUnavailable(id))?;
                }
                parent_item = Some(current);
                left = self.trace_redone(left, current, |item| item.left);
                right = self.trace_redone(right, current, |item| item.right);
            }
        }

        let store = &self.doc.store;
        let parent = match parent_item {
            Some(p) => TypePtr::Nested(p),
            None => original_parent,
        };
        let next = self.next_id();
        let origin = left.map(|l| store.block(l).last_id());
        let right_origin = right.map(|r| store.block(r).id());
        let content = store.item(ptr).content.copy();
        let redone = Item::new(
            next,
            left,
            origin,
            right,
            right_origin,
            Parent::Type(parent),
            parent_sub,
            content,
        );
        self.doc.store.item_mut(ptr).redone = Some(next);
        let new_ptr = self.integrate(redone, 0);
        self.keep_item(new_ptr, true);
        trace!(%id, redone = %next, "redo");
        Ok(Some(new_ptr))
    }

    /// Starting at `start`, walk with `step` until an item whose redone
    /// chain leads into `parent` is found.
    fn trace_redone(
        &mut self,
        start: Option<BlockPtr>,
        parent: BlockPtr,
        step: fn(&Item) -> Option<BlockPtr>,
    ) -> Option<BlockPtr> {
        let in_parent = |store: &Store, ptr: BlockPtr| {
            store.block(ptr).as_item().and_then(Item::parent_type) == Some(TypePtr::Nested(parent))
        };
        let mut cursor = start;
        while let Some(candidate) = cursor {
            let mut trace = Some(candidate);
            while let Some(t) = trace {
                if in_parent(&self.doc.store, t) {
                    return Some(t);
                }
                trace = match self.doc.store.block(t).as_item().and_then(|i| i.redone) {
                    Some(redone) => self.doc.store.get_item_clean_start(&redone),
                    None => None,
                };
            }
            cursor = self.doc.store.block(candidate).as_item().and_then(step);
        }
        None
    }

    // ------------------------------------------------------------------
    // Commit
    // ------------------------------------------------------------------

    /// Update covering the blocks created and the deletions performed by
    /// this transaction so far.
    pub fn encode_update_v2(&self) -> Vec<u8> {
        let mut enc = UpdateEncoderV2::new();
        update::write_store_blocks(&mut enc, &self.doc.store, &self.before_state);
        if self.committed {
            self.delete_set.encode(&mut enc);
        } else {
            // deletions are only sorted at commit
            let mut ds = self.delete_set.clone();
            ds.sort_and_merge();
            ds.encode(&mut enc);
        }
        enc.finish()
    }

    pub fn commit(&mut self) {
        if self.committed {
            return;
        }
        self.committed = true;
        self.delete_set.sort_and_merge();
        self.after_state = self.doc.store.state_vector();

        self.collect_changed_parent_types();
        if !self.local {
            for ty in self.changed.keys() {
                if let Some(branch) = self.doc.store.branch(*ty) {
                    branch.clear_markers();
                }
            }
        }
        self.dispatch_events();

        let hooks: Vec<_> = self
            .doc
            .observers
            .after_transaction
            .iter()
            .map(|(_, f)| f.clone())
            .collect();
        for hook in hooks {
            hook(self);
        }

        if self.doc.options.gc {
            self.try_gc_delete_set();
        }
        self.try_merge_delete_set();
        self.merge_new_blocks();

        let own = self.doc.client_id();
        if !self.local && self.after_state.get(own) != self.before_state.get(own) {
            let fresh = generate_client_id();
            warn!(old = own, new = fresh, "another replica used our client id, changing it");
            self.doc.client_id = fresh;
        }

        let state_changed = self.after_state != self.before_state;
        if self.local
            && !self.doc.observers.update.is_empty()
            && (state_changed || !self.delete_set.is_empty())
        {
            let event = UpdateEvent {
                update: self.encode_update_v2(),
                origin: self.origin.clone(),
            };
            let listeners: Vec<_> = self.doc.observers.update.iter().map(|(_, f)| f.clone()).collect();
            for listener in listeners {
                listener(&event);
            }
        }
    }

    fn collect_changed_parent_types(&mut self) {
        let store = &self.doc.store;
        for ty in self.changed.keys() {
            if store.is_type_deleted(*ty) {
                continue;
            }
            let mut cursor = Some(*ty);
            while let Some(ty) = cursor {
                if !self.changed_parent_types.insert(ty) {
                    break;
                }
                cursor = store.parent_of(ty);
            }
        }
    }

    fn dispatch_events(&mut self) {
        let observers = &self.doc.observers;
        if observers.shallow.is_empty() && observers.deep.is_empty() {
            return;
        }
        let store = &self.doc.store;
        let wanted = |ty: TypePtr| {
            observers.shallow.contains_key(&ty)
                || observers.deep.keys().any(|deep| store.is_descendant_of(ty, *deep))
        };
        let mut targets: Vec<(TypePtr, HashSet<Option<Arc<str>>>)> = self
            .changed
            .iter()
            .filter(|(ty, _)| !store.is_type_deleted(**ty) && wanted(**ty))
            .map(|(ty, keys)| (*ty, keys.clone()))
            .collect();
        targets.sort_by_key(|(ty, _)| *ty);
        let events: Vec<TypeEvent> = targets
            .into_iter()
            .map(|(ty, keys)| TypeEvent::new(self, ty, keys))
            .collect();

        for event in &events {
            let callbacks: Vec<_> = self
                .doc
                .observers
                .shallow
                .get(&event.target())
                .map(|subs| subs.iter().map(|(_, f)| f.clone()).collect())
                .unwrap_or_default();
            for callback in callbacks {
                callback(self, event);
            }
        }

        let mut deep: Vec<_> = self
            .doc
            .observers
            .deep
            .iter()
            .map(|(ty, subs)| (*ty, subs.iter().map(|(_, f)| f.clone()).collect::<Vec<_>>()))
            .collect();
        deep.sort_by_key(|(ty, _)| *ty);
        for (ty, callbacks) in deep {
            if !self.changed_parent_types.contains(&ty) || self.doc.store.is_type_deleted(ty) {
                continue;
            }
            let mut related: Vec<TypeEvent> = events
                .iter()
                .filter(|e| self.doc.store.is_descendant_of(e.target(), ty))
                .cloned()
                .collect();
            if related.is_empty() {
                continue;
            }
            related.sort_by_key(|e| e.path().len());
            for callback in callbacks {
                callback(self, &related);
            }
        }
    }

    fn try_gc_delete_set(&mut self) {
        let filter = self.doc.options.gc_filter.clone();
        let mut targets = Vec::new();
        self.delete_set.iterate_blocks(&self.doc.store, |ptr, block| {
            if let Block::Item(item) = block {
                if item.is_deleted() && !item.is_keep() && filter.as_ref().map_or(true, |f| f(item)) {
                    targets.push(ptr);
                }
            }
            true
        });
        if !targets.is_empty() {
            trace!(count = targets.len(), "collecting deleted items");
        }
        for ptr in targets {
            gc_item(&mut self.doc.store, ptr, false);
        }
    }

    fn try_merge_delete_set(&mut self) {
        let store = &mut self.doc.store;
        for (client, ranges) in self.delete_set.iter() {
            for range in ranges.iter().rev() {
                let count = store.blocks_of(client).len();
                let Some(last) = store.find_index(client, range.end() - 1) else {
                    continue;
                };
                let mut index = (count - 1).min(last + 1);
                while index > 0 {
                    let ptr = store.blocks_of(client)[index];
                    if store.block(ptr).id().clock < range.clock {
                        break;
                    }
                    store.try_merge_with_left(client, index);
                    index -= 1;
                }
            }
        }
    }

    fn merge_new_blocks(&mut self) {
        let store = &mut self.doc.store;
        for (client, clock) in self.after_state.iter() {
            let before = self.before_state.get(client);
            if before == clock {
                continue;
            }
            let count = store.blocks_of(client).len();
            let first = store.find_index(client, before).unwrap_or(0).max(1);
            for index in (first..count).rev() {
                store.try_merge_with_left(client, index);
            }
        }
        let mut candidates = std::mem::take(&mut store.split_log);
        candidates.append(&mut self.merge_blocks);
        for id in candidates {
            let Some(pos) = store.find_index(id.client, id.clock) else {
                continue;
            };
            if pos + 1 < store.blocks_of(id.client).len() {
                store.try_merge_with_left(id.client, pos + 1);
            }
            if pos > 0 {
                store.try_merge_with_left(id.client, pos);
            }
        }
    }
}

impl Drop for TransactionMut<'_> {
    fn drop(&mut self) {
        self.commit();
    }
}

fn next_ref(client_ids: &mut Vec<ClientId>, refs: &mut HashMap<ClientId, VecDeque<Block>>) -> Option<Block> {
    while let Some(client) = client_ids.last() {
        if let Some(block) = refs.get_mut(client).and_then(VecDeque::pop_front) {
            return Some(block);
        }
        client_ids.pop();
    }
    None
}

/// Move the stack and every remaining block of the stacked clients to
/// `rest`.
fn park(
    stack: &mut Vec<Block>,
    refs: &mut HashMap<ClientId, VecDeque<Block>>,
    client_ids: &mut Vec<ClientId>,
    rest: &mut PendingStructs,
) {
    for block in stack.drain(..) {
        let client = block.id().client;
        let queue = rest.blocks.entry(client).or_default();
        queue.push_back(block);
        if let Some(remaining) = refs.remove(&client) {
            queue.extend(remaining);
        }
        client_ids.retain(|c| *c != client);
    }
}
