//! Keyed-map primitives.
//!
//! Every write to a key creates a new item placed after the current entry
//! for that key; the previous entry is deleted during integration. The
//! live value is the last element of the rightmost item.

use crate::block::{BlockPtr, Item, Parent};
use crate::branch::TypePtr;
use crate::content::ItemContent;
use crate::sequence::insert_prelim;
use crate::snapshot::Snapshot;
use crate::store::Store;
use crate::transaction::TransactionMut;
use crate::types::{item_values, In, Value};
use std::sync::Arc;
use weft_codec::Any;

pub(crate) fn set(txn: &mut TransactionMut<'_>, parent: TypePtr, key: &str, value: In) -> BlockPtr {
    let key: Arc<str> = key.into();
    let store = txn.store_mut();
    let left = store.branch(parent).and_then(|b| b.map_entry(&key));
    let content = match value {
        In::Any(Any::Buffer(bytes)) => ItemContent::Binary(bytes),
        In::Any(any) => ItemContent::Any(vec![any]),
        In::Doc(guid) => ItemContent::Doc {
            guid,
            opts: Any::Map(Default::default()),
        },
        prelim => return insert_prelim(txn, parent, left, None, Some(key), prelim),
    };
    let origin = left.map(|l| txn.store_mut().block(l).last_id());
    let item = Item::new(
        txn.next_id(),
        left,
        origin,
        None,
        None,
        Parent::Type(parent),
        Some(key),
        content,
    );
    txn.integrate(item, 0)
}

pub(crate) fn get(store: &Store, parent: TypePtr, key: &str) -> Option<Value> {
    let ptr = store.branch(parent)?.map_entry(key)?;
    let item = store.block(ptr).as_item()?;
    if item.is_deleted() {
        return None;
    }
    item_values(store, ptr).pop()
}

/// Value of `key` as it was at `snapshot`.
pub(crate) fn get_at(store: &Store, parent: TypePtr, key: &str, snapshot: &Snapshot) -> Option<Value> {
    let mut cursor = store.branch(parent)?.map_entry(key);
    while let Some(ptr) = cursor {
        let item = store.block(ptr).as_item()?;
        if item.id.clock < snapshot.state_vector.get(item.id.client) {
            if !snapshot.is_visible(item) {
                return None;
            }
            return item_values(store, ptr).pop();
        }
        cursor = item.left;
    }
    None
}

/// Delete the entry for `key`. Returns the removed value.
pub(crate) fn remove(txn: &mut TransactionMut<'_>, parent: TypePtr, key: &str) -> Option<Value> {
    let store = txn.store_mut();
    let ptr = store.branch(parent)?.map_entry(key)?;
    if store.block(ptr).is_deleted() {
        return None;
    }
    let previous = item_values(store, ptr).pop();
    txn.delete_item(ptr);
    previous
}

/// Live entries in key order.
pub(crate) fn entries(store: &Store, parent: TypePtr) -> Vec<(Arc<str>, BlockPtr)> {
    let Some(branch) = store.branch(parent) else {
        return Vec::new();
    };
    let mut entries: Vec<_> = branch
        .map
        .iter()
        .filter(|(_, ptr)| !store.block(**ptr).is_deleted())
        .map(|(key, ptr)| (key.clone(), *ptr))
        .collect();
    entries.sort_by(|a, b| a.0.cmp(&b.0));
    entries
}

#[cfg(test)]
mod tests {
    use crate::doc::{Doc, DocOptions};
    use crate::types::{SharedRef, Value};
    use crate::ReadTxn;

    #[test]
    fn test_overwrite_keeps_one_live_entry() {
        let mut d = Doc::with_options(DocOptions::builder().client_id(1).build());
        let map = d.get_map("m");
        {
            let mut txn = d.transact_mut();
            map.insert(&mut txn, "k", "first");
            map.insert(&mut txn, "k", "second");
            assert_eq!(map.get(&txn, "k"), Some(Value::from("second")));
            assert_eq!(map.len(&txn), 1);
        }
        // the overwritten entry is a tombstone in the delete set
        let ds = d.snapshot().delete_set;
        assert!(ds.is_deleted(&crate::ID::new(1, 0)));
        assert!(!ds.is_deleted(&crate::ID::new(1, 1)));
        assert_eq!(d.store().blocks_of(1).len(), 2);
    }

    #[test]
    fn test_remove_returns_previous_value() {
        let mut d = Doc::with_options(DocOptions::builder().client_id(1).build());
        let map = d.get_map("m");
        let mut txn = d.transact_mut();
        map.insert(&mut txn, "k", 7);
        assert_eq!(map.remove(&mut txn, "k"), Some(Value::from(7)));
        assert_eq!(map.remove(&mut txn, "k"), None);
        assert!(!map.contains_key(&txn, "k"));
    }

    #[test]
    fn test_concurrent_writes_converge_on_higher_client() {
        let mut a = Doc::with_options(DocOptions::builder().client_id(1).build());
        let mut b = Doc::with_options(DocOptions::builder().client_id(2).build());
        let map_a = a.get_map("m");
        let map_b = b.get_map("m");
        {
            let mut txn = a.transact_mut();
            map_a.insert(&mut txn, "k", "from a");
        }
        {
            let mut txn = b.transact_mut();
            map_b.insert(&mut txn, "k", "from b");
        }
        let to_b = a.encode_state_as_update_v2(&b.state_vector());
        let to_a = b.encode_state_as_update_v2(&a.state_vector());
        a.apply_update_v2(&to_a).unwrap();
        b.apply_update_v2(&to_b).unwrap();
        assert_eq!(map_a.get(&a, "k"), Some(Value::from("from b")));
        assert_eq!(map_b.get(&b, "k"), Some(Value::from("from b")));
    }
}
