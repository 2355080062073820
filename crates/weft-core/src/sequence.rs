//! Sequence primitives shared by arrays and text.
//!
//! Index lookups start from the closest search marker. Inserts and
//! deletes shift the remaining markers before returning.

use crate::block::{Block, BlockPtr, Item, Parent};
use crate::branch::{Branch, TypeKind, TypePtr};
use crate::content::ItemContent;
use crate::error::{Error, Result};
use crate::integrate::sequence_items;
use crate::map;
use crate::markers::find_marker;
use crate::snapshot::Snapshot;
use crate::store::Store;
use crate::transaction::{ReadTxn, TransactionMut};
use crate::types::{item_values, In, Value};
use crate::id::ID;
use weft_codec::Any;

fn branch(store: &Store, parent: TypePtr) -> Result<&Branch> {
    store
        .branch(parent)
        .ok_or_else(|| Error::InvalidUpdate("shared type was garbage collected".into()))
}

/// Insert `content` so that its first element lands at `index`. Returns
/// the created items in order.
pub(crate) fn insert(
    txn: &mut TransactionMut<'_>,
    parent: TypePtr,
    index: u64,
    content: Vec<In>,
) -> Result<Vec<BlockPtr>> {
    let len = content.len() as u64;
    let reference = find_insert_position(txn, parent, index)?;
    shift_markers(txn, parent, index, len as i64);
    Ok(insert_after(txn, parent, reference, content))
}

/// Insert a string at UTF-16 position `index`.
pub(crate) fn insert_text(
    txn: &mut TransactionMut<'_>,
    parent: TypePtr,
    index: u64,
    chunk: &str,
) -> Result<Option<BlockPtr>> {
    if chunk.is_empty() {
        return Ok(None);
    }
    let content = ItemContent::String(chunk.to_owned());
    let reference = find_insert_position(txn, parent, index)?;
    shift_markers(txn, parent, index, content.len() as i64);
    let right = next_of(txn.store(), parent, reference);
    Ok(Some(integrate_new(txn, parent, reference, right, content)))
}

/// Item after which an element inserted at `index` goes, splitting the
/// item covering `index` when needed. `None` means the start.
fn find_insert_position(
    txn: &mut TransactionMut<'_>,
    parent: TypePtr,
    index: u64,
) -> Result<Option<BlockPtr>> {
    let store = txn.store();
    let branch = branch(store, parent)?;
    if index > branch.len {
        return Err(Error::IndexOutOfBounds {
            index,
            length: branch.len,
        });
    }
    if index == 0 {
        return Ok(None);
    }
    let mut remaining = index;
    let mut cursor = branch.start;
    if let Some((ptr, marker_index)) = find_marker(store, branch, index) {
        cursor = Some(ptr);
        remaining -= marker_index;
        if remaining == 0 {
            // insert after the closest visible element on the left
            let mut prev = store.item(ptr).left;
            while let Some(p) = prev {
                let item = store.item(p);
                if !item.is_deleted() {
                    break;
                }
                prev = item.left;
            }
            cursor = prev;
            if let Some(p) = prev {
                let item = store.item(p);
                if item.is_visible_element() {
                    remaining += item.len;
                }
            }
        }
    }
    while let Some(ptr) = cursor {
        let item = store.item(ptr);
        if item.is_visible_element() {
            if remaining <= item.len {
                if remaining < item.len {
                    let id = ID::new(item.id.client, item.id.clock + remaining);
                    txn.get_item_clean_start(&id);
                }
                return Ok(Some(ptr));
            }
            remaining -= item.len;
        }
        cursor = item.right;
    }
    Ok(None)
}

fn shift_markers(txn: &TransactionMut<'_>, parent: TypePtr, index: u64, len: i64) {
    let store = txn.store();
    if let Some(branch) = store.branch(parent) {
        branch.markers.lock().update_marker_changes(store, index, len);
    }
}

fn next_of(store: &Store, parent: TypePtr, left: Option<BlockPtr>) -> Option<BlockPtr> {
    match left {
        Some(left) => store.item(left).right,
        None => store.branch(parent).and_then(|b| b.start),
    }
}

fn integrate_new(
    txn: &mut TransactionMut<'_>,
    parent: TypePtr,
    left: Option<BlockPtr>,
    right: Option<BlockPtr>,
    content: ItemContent,
) -> BlockPtr {
    let store = txn.store();
    let origin = left.map(|l| store.block(l).last_id());
    let right_origin = right.map(|r| store.block(r).id());
    let item = Item::new(
        txn.next_id(),
        left,
        origin,
        right,
        right_origin,
        Parent::Type(parent),
        None,
        content,
    );
    txn.integrate(item, 0)
}

/// Insert `content` right after `reference`. Consecutive primitive values
/// share one item.
pub(crate) fn insert_after(
    txn: &mut TransactionMut<'_>,
    parent: TypePtr,
    reference: Option<BlockPtr>,
    content: Vec<In>,
) -> Vec<BlockPtr> {
    let right = next_of(txn.store(), parent, reference);
    let mut left = reference;
    let mut created = Vec::new();
    let mut pending: Vec<Any> = Vec::new();

    for value in content {
        let single = match value {
            In::Any(Any::Buffer(bytes)) => ItemContent::Binary(bytes),
            In::Any(any) => {
                pending.push(any);
                continue;
            }
            In::Doc(guid) => ItemContent::Doc {
                guid,
                opts: Any::Map(Default::default()),
            },
            prelim => {
                flush_values(txn, parent, &mut left, right, &mut pending, &mut created);
                let ptr = insert_prelim(txn, parent, left, right, None, prelim);
                created.push(ptr);
                left = Some(ptr);
                continue;
            }
        };
        flush_values(txn, parent, &mut left, right, &mut pending, &mut created);
        let ptr = integrate_new(txn, parent, left, right, single);
        created.push(ptr);
        left = Some(ptr);
    }
    flush_values(txn, parent, &mut left, right, &mut pending, &mut created);
    created
}

fn flush_values(
    txn: &mut TransactionMut<'_>,
    parent: TypePtr,
    left: &mut Option<BlockPtr>,
    right: Option<BlockPtr>,
    pending: &mut Vec<Any>,
    created: &mut Vec<BlockPtr>,
) {
    if pending.is_empty() {
        return;
    }
    let values = std::mem::take(pending);
    let ptr = integrate_new(txn, parent, *left, right, ItemContent::Any(values));
    created.push(ptr);
    *left = Some(ptr);
}

/// Create a nested type for `prelim` and fill it with its initial
/// contents. `key` places it in a map.
pub(crate) fn insert_prelim(
    txn: &mut TransactionMut<'_>,
    parent: TypePtr,
    left: Option<BlockPtr>,
    right: Option<BlockPtr>,
    key: Option<std::sync::Arc<str>>,
    prelim: In,
) -> BlockPtr {
    let kind = match &prelim {
        In::Array(_) => TypeKind::Array,
        In::Map(_) => TypeKind::Map,
        In::Text(_) => TypeKind::Text,
        In::Any(_) | In::Doc(_) => unreachable!("primitive values are not nested types"),
    };
    let store = txn.store();
    let origin = left.map(|l| store.block(l).last_id());
    let right_origin = right.map(|r| store.block(r).id());
    let item = Item::new(
        txn.next_id(),
        left,
        origin,
        right,
        right_origin,
        Parent::Type(parent),
        key,
        ItemContent::Type(Box::new(Branch::new(kind))),
    );
    let ptr = txn.integrate(item, 0);
    let nested = TypePtr::Nested(ptr);
    match prelim {
        In::Array(values) => {
            insert_after(txn, nested, None, values);
        }
        In::Map(entries) => {
            let mut entries: Vec<_> = entries.into_iter().collect();
            entries.sort_by(|a, b| a.0.cmp(&b.0));
            for (key, value) in entries {
                map::set(txn, nested, &key, value);
            }
        }
        In::Text(text) => {
            if !text.is_empty() {
                integrate_new(txn, nested, None, None, ItemContent::String(text));
            }
        }
        In::Any(_) | In::Doc(_) => {}
    }
    ptr
}

/// Delete `len` elements starting at `index`. Fails without changing
/// anything if the range exceeds the sequence.
pub(crate) fn remove(txn: &mut TransactionMut<'_>, parent: TypePtr, index: u64, len: u64) -> Result<()> {
    if len == 0 {
        return Ok(());
    }
    let store = txn.store();
    let branch = branch(store, parent)?;
    let end = index.checked_add(len).unwrap_or(u64::MAX);
    if end > branch.len {
        return Err(Error::IndexOutOfBounds {
            index: end,
            length: branch.len,
        });
    }

    let mut remaining = index;
    let mut cursor = branch.start;
    if let Some((ptr, marker_index)) = find_marker(store, branch, index) {
        cursor = Some(ptr);
        remaining -= marker_index;
    }
    // find the first element to delete
    while let Some(ptr) = cursor {
        if remaining == 0 {
            break;
        }
        let item = txn.store().item(ptr);
        if item.is_visible_element() {
            if remaining < item.len {
                let id = ID::new(item.id.client, item.id.clock + remaining);
                txn.get_item_clean_start(&id);
            }
            remaining -= txn.store().item(ptr).len;
        }
        cursor = txn.store().item(ptr).right;
    }

    let mut to_delete = len;
    while let Some(ptr) = cursor {
        if to_delete == 0 {
            break;
        }
        let item = txn.store().item(ptr);
        if item.is_visible_element() {
            if to_delete < item.len {
                let id = ID::new(item.id.client, item.id.clock + to_delete);
                txn.get_item_clean_start(&id);
            }
            let deleted = txn.store().item(ptr).len;
            txn.delete_item(ptr);
            to_delete -= deleted;
        }
        cursor = txn.store().item(ptr).right;
    }
    shift_markers(txn, parent, index, -(len as i64));
    Ok(())
}

/// Element at `index`.
pub(crate) fn get(store: &Store, parent: TypePtr, index: u64) -> Option<Value> {
    let branch = store.branch(parent)?;
    if index >= branch.len {
        return None;
    }
    let mut remaining = index;
    let mut cursor = branch.start;
    if let Some((ptr, marker_index)) = find_marker(store, branch, index) {
        cursor = Some(ptr);
        remaining -= marker_index;
    }
    while let Some(ptr) = cursor {
        let item = store.item(ptr);
        if item.is_visible_element() {
            if remaining < item.len {
                return item_values(store, ptr).into_iter().nth(remaining as usize);
            }
            remaining -= item.len;
        }
        cursor = item.right;
    }
    None
}

/// Visible elements in order, or the elements visible at `snapshot`.
pub(crate) fn values(store: &Store, parent: TypePtr, snapshot: Option<&Snapshot>) -> Vec<Value> {
    let Some(branch) = store.branch(parent) else {
        return Vec::new();
    };
    sequence_items(store, branch.start)
        .filter(|ptr| match store.block(*ptr) {
            Block::Item(item) => {
                item.is_countable()
                    && snapshot.map_or(!item.is_deleted(), |s| s.is_visible(item))
            }
            Block::Gc(_) => false,
        })
        .flat_map(|ptr| item_values(store, ptr))
        .collect()
}

/// Concatenated string content, or the content visible at `snapshot`.
pub(crate) fn text(store: &Store, parent: TypePtr, snapshot: Option<&Snapshot>) -> String {
    let Some(branch) = store.branch(parent) else {
        return String::new();
    };
    let mut out = String::new();
    for ptr in sequence_items(store, branch.start) {
        let Some(item) = store.block(ptr).as_item() else {
            continue;
        };
        let visible = snapshot.map_or(!item.is_deleted(), |s| s.is_visible(item));
        if let (true, ItemContent::String(s)) = (visible, &item.content) {
            out.push_str(s);
        }
    }
    out
}
