//! Placing blocks into the document.
//!
//! [`TransactionMut::integrate`] implements the YATA ordering rule: a new
//! item is placed between its origins, and concurrent items competing for
//! the same gap are ordered by their own origins first and by client id last
//! (lower ids go left). Every replica runs the same scan over the same
//! causal history, so every replica picks the same position.

use crate::block::{Block, BlockPtr, Gc, Item, Parent};
use crate::branch::TypePtr;
use crate::content::ItemContent;
use crate::id::{ClientId, ID};
use crate::store::Store;
use crate::transaction::TransactionMut;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::trace;

impl<'doc> TransactionMut<'doc> {
    /// Check the causal dependencies of a decoded item. Returns the client
    /// whose blocks are missing, or resolves the item's neighbours and
    /// parent and returns `None`. The item is left untouched when a
    /// dependency is missing.
    pub(crate) fn get_missing(&mut self, item: &mut Item) -> Option<ClientId> {
        let own = item.id.client;
        let store = &self.doc.store;
        let unmet = |id: &ID| id.client != own && id.clock >= store.get_state(id.client);
        if let Some(origin) = item.origin.filter(unmet) {
            return Some(origin.client);
        }
        if let Some(right_origin) = item.right_origin.filter(unmet) {
            return Some(right_origin.client);
        }
        if let Parent::Id(parent) = &item.parent {
            if unmet(parent) {
                return Some(parent.client);
            }
        }

        let store = &mut self.doc.store;
        if let Some(origin) = item.origin {
            let Some(left) = store.get_item_clean_end(&origin) else {
                return Some(origin.client);
            };
            item.origin = Some(store.block(left).last_id());
            item.left = Some(left);
        }
        if let Some(right_origin) = item.right_origin {
            let Some(right) = store.get_item_clean_start(&right_origin) else {
                return Some(right_origin.client);
            };
            item.right_origin = Some(store.block(right).id());
            item.right = Some(right);
        }

        let gc_neighbour = [item.left, item.right]
            .into_iter()
            .flatten()
            .any(|ptr| store.block(ptr).is_gc());
        item.parent = if gc_neighbour {
            Parent::Unknown
        } else if item.parent == Parent::Unknown {
            let mut parent = Parent::Unknown;
            for ptr in [item.left, item.right].into_iter().flatten() {
                if let Some(neighbour) = store.block(ptr).as_item() {
                    parent = neighbour.parent.clone();
                    item.parent_sub = neighbour.parent_sub.clone();
                }
            }
            parent
        } else {
            match store.resolve_parent(&item.parent) {
                Some(ptr) => Parent::Type(ptr),
                None => Parent::Unknown,
            }
        };
        None
    }

    /// Integrate `item`, skipping its first `offset` elements which are
    /// already known. Neighbours and parent must be resolved.
    pub(crate) fn integrate(&mut self, mut item: Item, offset: u64) -> BlockPtr {
        if offset > 0 {
            item.id.clock += offset;
            let left_id = ID::new(item.id.client, item.id.clock - 1);
            let left = self.doc.store.get_item_clean_end(&left_id);
            item.origin = left.map(|l| self.doc.store.block(l).last_id());
            item.left = left;
            let tail = item.content.splice(offset);
            item.content = tail;
            item.len -= offset;
        }

        let parent = match item.parent_type() {
            Some(parent) if self.doc.store.branch(parent).is_some() => parent,
            _ => return self.integrate_gc(Gc { id: item.id, len: item.len }, 0),
        };
        let store = &self.doc.store;
        let points_at_gc = [item.left, item.right]
            .into_iter()
            .flatten()
            .any(|ptr| store.block(ptr).is_gc());
        if points_at_gc {
            return self.integrate_gc(Gc { id: item.id, len: item.len }, 0);
        }

        let conflict = match item.left {
            None => item.right.map_or(true, |r| store.item(r).left.is_some()),
            Some(left) => store.item(left).right != item.right,
        };
        if conflict {
            item.left = resolve_conflicts(store, parent, &item);
        }

        let store = &mut self.doc.store;
        let right = match item.left {
            Some(left) => store.item(left).right,
            None => first_in_parent(store, parent, item.parent_sub.as_deref()),
        };
        item.right = right;

        let id = item.id;
        let left = item.left;
        let parent_sub = item.parent_sub.clone();
        let visible_len = if parent_sub.is_none() && item.is_visible_element() {
            item.len
        } else {
            0
        };
        let ptr = store.alloc(Block::Item(item));

        match left {
            Some(left) => store.item_mut(left).right = Some(ptr),
            None if parent_sub.is_none() => {
                if let Some(branch) = store.branch_mut(parent) {
                    branch.start = Some(ptr);
                }
            }
            None => {}
        }
        let mut replaced = None;
        match right {
            Some(right) => store.item_mut(right).left = Some(ptr),
            None => {
                if let Some(key) = &parent_sub {
                    if let Some(branch) = store.branch_mut(parent) {
                        branch.map.insert(key.clone(), ptr);
                    }
                    replaced = left;
                }
            }
        }
        if let Some(branch) = store.branch_mut(parent) {
            branch.len += visible_len;
        }
        store.push_block(ptr);
        trace!(%id, "integrated item");

        if let Some(previous) = replaced {
            self.delete_item(previous);
        }
        self.integrate_content(ptr);
        self.add_changed_type(parent, parent_sub.clone());

        if self.doc.store.is_type_deleted(parent) || (parent_sub.is_some() && right.is_some()) {
            self.delete_item(ptr);
        }
        ptr
    }

    pub(crate) fn integrate_gc(&mut self, mut gc: Gc, offset: u64) -> BlockPtr {
        if offset > 0 {
            gc.id.clock += offset;
            gc.len -= offset;
        }
        let store = &mut self.doc.store;
        let ptr = store.alloc(Block::Gc(gc));
        store.push_block(ptr);
        ptr
    }

    fn integrate_content(&mut self, ptr: BlockPtr) {
        let capacity = self.doc.store.marker_capacity();
        let item = self.doc.store.item_mut(ptr);
        match &mut item.content {
            ItemContent::Type(branch) => {
                branch.item = Some(ptr);
                branch.set_marker_capacity(capacity);
            }
            ItemContent::Deleted(len) => {
                let len = *len;
                item.mark_deleted();
                let id = item.id;
                self.delete_set.push(id, len);
            }
            _ => {}
        }
    }

    /// Record that `parent` changed at `key` (or in its sequence when `key`
    /// is `None`). Types created in this transaction are not reported.
    pub(crate) fn add_changed_type(&mut self, parent: TypePtr, key: Option<Arc<str>>) {
        let report = match parent {
            TypePtr::Root(_) => true,
            TypePtr::Nested(ptr) => match self.doc.store.block(ptr) {
                Block::Item(item) => {
                    item.id.clock < self.before_state.get(item.id.client) && !item.is_deleted()
                }
                Block::Gc(_) => false,
            },
        };
        if report {
            self.changed.entry(parent).or_default().insert(key);
        }
    }

    /// Tombstone the item at `ptr`. Deleting a nested type deletes its
    /// children. Returns `false` if the item was already deleted.
    pub(crate) fn delete_item(&mut self, ptr: BlockPtr) -> bool {
        let store = &mut self.doc.store;
        let Some(item) = store.block_mut(ptr).as_item_mut() else {
            return false;
        };
        if item.is_deleted() {
            return false;
        }
        let visible = item.is_countable() && item.parent_sub.is_none();
        item.mark_deleted();
        let (id, len, parent, key) = (item.id, item.len, item.parent_type(), item.parent_sub.clone());
        if let Some(parent) = parent {
            if visible {
                if let Some(branch) = store.branch_mut(parent) {
                    branch.len -= len;
                }
            }
        }
        self.delete_set.push(id, len);
        if let Some(parent) = parent {
            self.add_changed_type(parent, key);
        }

        let children = match self.doc.store.item(ptr).content.as_branch() {
            Some(branch) => {
                let store = &self.doc.store;
                let mut children: Vec<BlockPtr> = sequence_items(store, branch.start).collect();
                children.extend(branch.map.values().copied());
                children
            }
            None => return true,
        };
        for child in children {
            let (deleted, child_id) = match self.doc.store.block(child) {
                Block::Item(item) => (item.is_deleted(), item.id),
                Block::Gc(_) => continue,
            };
            if !deleted {
                self.delete_item(child);
            } else if child_id.clock < self.before_state.get(child_id.client) {
                self.merge_blocks.push(child_id);
            }
        }
        self.changed.remove(&TypePtr::Nested(ptr));
        true
    }
}

/// Walk a sequence from `start` following right links.
pub(crate) fn sequence_items(store: &Store, start: Option<BlockPtr>) -> impl Iterator<Item = BlockPtr> + '_ {
    std::iter::successors(start, move |ptr| store.block(*ptr).as_item().and_then(|i| i.right))
}

fn first_in_parent(store: &Store, parent: TypePtr, key: Option<&str>) -> Option<BlockPtr> {
    let branch = store.branch(parent)?;
    match key {
        Some(key) => {
            let mut ptr = branch.map_entry(key)?;
            while let Some(left) = store.item(ptr).left {
                ptr = left;
            }
            Some(ptr)
        }
        None => branch.start,
    }
}

/// Scan the items between the new item's left neighbour and its right
/// origin and return the left neighbour it must be placed after.
fn resolve_conflicts(store: &Store, parent: TypePtr, item: &Item) -> Option<BlockPtr> {
    let mut left = item.left;
    let mut cursor = match left {
        Some(left) => store.item(left).right,
        None => first_in_parent(store, parent, item.parent_sub.as_deref()),
    };
    let mut before_origin: HashSet<BlockPtr> = HashSet::new();
    let mut conflicting: HashSet<BlockPtr> = HashSet::new();

    while let Some(ptr) = cursor {
        if Some(ptr) == item.right {
            break;
        }
        before_origin.insert(ptr);
        conflicting.insert(ptr);
        let other = store.item(ptr);
        if other.origin == item.origin {
            // same left origin: lower client goes first
            if other.id.client < item.id.client {
                left = Some(ptr);
                conflicting.clear();
            } else if other.right_origin == item.right_origin {
                break;
            }
        } else if let Some(other_origin) = other
            .origin
            .and_then(|id| store.find(&id))
            .filter(|p| before_origin.contains(p))
        {
            // other's origin lies inside the scanned range
            if !conflicting.contains(&other_origin) {
                left = Some(ptr);
                conflicting.clear();
            }
        } else {
            break;
        }
        cursor = other.right;
    }
    left
}

/// Discard the content of a deleted item. With `parent_gcd` the whole block
/// is replaced by a gc range, otherwise the item keeps its links and only
/// its content shrinks to a length marker.
pub(crate) fn gc_item(store: &mut Store, ptr: BlockPtr, parent_gcd: bool) {
    let Some(item) = store.block(ptr).as_item() else {
        return;
    };
    let len = item.len;
    if let Some(branch) = item.content.as_branch() {
        let mut children: Vec<BlockPtr> = sequence_items(store, branch.start).collect();
        for head in branch.map.values() {
            children.extend(std::iter::successors(Some(*head), |p| {
                store.block(*p).as_item().and_then(|i| i.left)
            }));
        }
        for child in children {
            gc_item(store, child, true);
        }
        if let Some(branch) = store.item_mut(ptr).content.as_branch_mut() {
            branch.start = None;
            branch.map.clear();
            branch.markers.get_mut().clear();
        }
    }
    if parent_gcd {
        store.replace_with_gc(ptr);
    } else {
        store.item_mut(ptr).content = ItemContent::Deleted(len);
    }
}

#[cfg(test)]
mod tests {
    use crate::doc::{Doc, DocOptions};
    use crate::types::{ArrayRef, In, SharedRef};
    use crate::ReadTxn;
    use weft_codec::Any;

    fn doc(client: u64) -> Doc {
        Doc::with_options(DocOptions::builder().client_id(client).build())
    }

    fn values(doc: &Doc, array: &ArrayRef) -> Vec<Any> {
        match array.to_json(doc) {
            Any::Array(values) => values,
            other => panic!("expected an array, got {other}"),
        }
    }

    #[test]
    fn test_concurrent_inserts_at_same_position_lower_client_first() {
        let mut a = doc(1);
        let mut b = doc(2);
        let array_a = a.get_array("list");
        let array_b = b.get_array("list");
        {
            let mut txn = a.transact_mut();
            array_a.insert(&mut txn, 0, "a").unwrap();
        }
        {
            let mut txn = b.transact_mut();
            array_b.insert(&mut txn, 0, "b").unwrap();
        }
        let update_a = a.encode_state_as_update_v2(&Default::default());
        let update_b = b.encode_state_as_update_v2(&Default::default());
        a.apply_update_v2(&update_b).unwrap();
        b.apply_update_v2(&update_a).unwrap();

        let expected = vec![Any::from("a"), Any::from("b")];
        assert_eq!(values(&a, &array_a), expected);
        assert_eq!(values(&b, &array_b), expected);
    }

    #[test]
    fn test_insert_between_concurrent_runs() {
        let mut a = doc(10);
        let mut b = doc(3);
        let array_a = a.get_array("list");
        let array_b = b.get_array("list");
        {
            let mut txn = a.transact_mut();
            array_a.insert_range(&mut txn, 0, ["x", "y"]).unwrap();
        }
        b.apply_update_v2(&a.encode_state_as_update_v2(&Default::default()))
            .unwrap();
        {
            let mut txn = a.transact_mut();
            array_a.insert(&mut txn, 1, "a1").unwrap();
            array_a.insert(&mut txn, 2, "a2").unwrap();
        }
        {
            let mut txn = b.transact_mut();
            array_b.insert(&mut txn, 1, "b1").unwrap();
        }
        let sv_a = a.state_vector();
        let sv_b = b.state_vector();
        let to_b = a.encode_state_as_update_v2(&sv_b);
        let to_a = b.encode_state_as_update_v2(&sv_a);
        a.apply_update_v2(&to_a).unwrap();
        b.apply_update_v2(&to_b).unwrap();

        let left = values(&a, &array_a);
        assert_eq!(left, values(&b, &array_b));
        // client 3 wins the tie and its run stays contiguous
        assert_eq!(
            left,
            vec![
                Any::from("x"),
                Any::from("b1"),
                Any::from("a1"),
                Any::from("a2"),
                Any::from("y")
            ]
        );
    }

    #[test]
    fn test_deleting_nested_type_deletes_children() {
        let mut d = doc(1);
        let root = d.get_map("root");
        let mut txn = d.transact_mut();
        let nested = root
            .insert(&mut txn, "list", In::Array(vec!["a".into(), "b".into()]))
            .into_array()
            .unwrap();
        assert_eq!(nested.len(&txn), 2);
        root.remove(&mut txn, "list");
        assert_eq!(nested.len(&txn), 0);
        assert!(root.get(&txn, "list").is_none());
    }
}
