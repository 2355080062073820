//! Change events delivered to observers at commit.

use crate::block::{BlockPtr, Item};
use crate::branch::TypePtr;
use crate::doc::Origin;
use crate::integrate::sequence_items;
use crate::store::Store;
use crate::transaction::TransactionMut;
use crate::types::{item_values, Value};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Step from a root type down to a nested one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathSegment {
    Key(Arc<str>),
    Index(u64),
}

/// How a map entry changed within one transaction.
#[derive(Debug, Clone, PartialEq)]
pub enum EntryChange {
    Inserted(Value),
    Updated(Value, Value),
    Removed(Value),
}

/// One run of a sequence diff.
#[derive(Debug, Clone, PartialEq)]
pub enum Delta {
    Inserted(Vec<Value>),
    Deleted(u64),
    Retain(u64),
}

/// Changes to a single shared type.
#[derive(Debug, Clone)]
pub struct TypeEvent {
    target: TypePtr,
    path: Vec<PathSegment>,
    keys: HashMap<Arc<str>, EntryChange>,
    delta: Vec<Delta>,
}

impl TypeEvent {
    pub(crate) fn new(
        txn: &TransactionMut<'_>,
        target: TypePtr,
        keys_changed: HashSet<Option<Arc<str>>>,
    ) -> Self {
        let store = &txn.doc.store;
        let view = ChangeView { txn };
        let mut keys = HashMap::new();
        let mut sequence_changed = false;
        for key in keys_changed {
            match key {
                Some(key) => {
                    if let Some(change) = view.key_change(target, &key) {
                        keys.insert(key, change);
                    }
                }
                None => sequence_changed = true,
            }
        }
        let delta = if sequence_changed {
            view.delta(target)
        } else {
            Vec::new()
        };
        Self {
            target,
            path: path_to(store, target),
            keys,
            delta,
        }
    }

    pub fn target(&self) -> TypePtr {
        self.target
    }

    /// Location of the target below its root type.
    pub fn path(&self) -> &[PathSegment] {
        &self.path
    }

    pub fn keys(&self) -> &HashMap<Arc<str>, EntryChange> {
        &self.keys
    }

    pub fn delta(&self) -> &[Delta] {
        &self.delta
    }
}

/// Update produced by a committed local transaction.
#[derive(Debug, Clone)]
pub struct UpdateEvent {
    pub update: Vec<u8>,
    pub origin: Option<Origin>,
}

struct ChangeView<'a, 'doc> {
    txn: &'a TransactionMut<'doc>,
}

impl ChangeView<'_, '_> {
    fn store(&self) -> &Store {
        &self.txn.doc.store
    }

    /// Created by this transaction.
    fn adds(&self, item: &Item) -> bool {
        item.id.clock >= self.txn.before_state.get(item.id.client)
    }

    /// Deleted by this transaction.
    fn deletes(&self, item: &Item) -> bool {
        self.txn.delete_set.is_deleted(&item.id)
    }

    fn last_value(&self, ptr: BlockPtr) -> Option<Value> {
        item_values(self.store(), ptr).pop()
    }

    fn key_change(&self, target: TypePtr, key: &str) -> Option<EntryChange> {
        let store = self.store();
        let ptr = store.branch(target)?.map_entry(key)?;
        let item = store.block(ptr).as_item()?;
        if self.adds(item) {
            let mut prev = item.left;
            while let Some(p) = prev {
                match store.block(p).as_item() {
                    Some(left) if self.adds(left) => prev = left.left,
                    _ => break,
                }
            }
            let replaced = prev.filter(|p| {
                store
                    .block(*p)
                    .as_item()
                    .is_some_and(|left| self.deletes(left))
            });
            match (self.deletes(item), replaced) {
                (true, Some(prev)) => Some(EntryChange::Removed(self.last_value(prev)?)),
                (true, None) => None,
                (false, Some(prev)) => Some(EntryChange::Updated(
                    self.last_value(prev)?,
                    self.last_value(ptr)?,
                )),
                (false, None) => Some(EntryChange::Inserted(self.last_value(ptr)?)),
            }
        } else if self.deletes(item) {
            Some(EntryChange::Removed(self.last_value(ptr)?))
        } else {
            None
        }
    }

    fn delta(&self, target: TypePtr) -> Vec<Delta> {
        let store = self.store();
        let Some(branch) = store.branch(target) else {
            return Vec::new();
        };
        let mut delta: Vec<Delta> = Vec::new();
        for ptr in sequence_items(store, branch.start) {
            let Some(item) = store.block(ptr).as_item() else {
                continue;
            };
            if !item.is_countable() {
                continue;
            }
            if item.is_deleted() {
                if self.deletes(item) && !self.adds(item) {
                    match delta.last_mut() {
                        Some(Delta::Deleted(n)) => *n += item.len,
                        _ => delta.push(Delta::Deleted(item.len)),
                    }
                }
            } else if self.adds(item) {
                let values = item_values(store, ptr);
                match delta.last_mut() {
                    Some(Delta::Inserted(existing)) => existing.extend(values),
                    _ => delta.push(Delta::Inserted(values)),
                }
            } else {
                match delta.last_mut() {
                    Some(Delta::Retain(n)) => *n += item.len,
                    _ => delta.push(Delta::Retain(item.len)),
                }
            }
        }
        if matches!(delta.last(), Some(Delta::Retain(_))) {
            delta.pop();
        }
        delta
    }
}

/// Keys and indices leading from the root type to `target`.
fn path_to(store: &Store, target: TypePtr) -> Vec<PathSegment> {
    let mut path = Vec::new();
    let mut current = target;
    while let TypePtr::Nested(ptr) = current {
        let Some(item) = store.block(ptr).as_item() else {
            break;
        };
        let Some(parent) = item.parent_type() else {
            break;
        };
        match &item.parent_sub {
            Some(key) => path.push(PathSegment::Key(key.clone())),
            None => {
                let start = store.branch(parent).and_then(|b| b.start);
                let index = sequence_items(store, start)
                    .take_while(|p| *p != ptr)
                    .filter_map(|p| store.block(p).as_item())
                    .filter(|i| i.is_visible_element())
                    .map(|i| i.len)
                    .sum();
                path.push(PathSegment::Index(index));
            }
        }
        current = parent;
    }
    path.reverse();
    path
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::doc::{Doc, DocOptions};
    use crate::types::In;
    use std::sync::Mutex;
    use weft_codec::Any;

    fn doc(client: u64) -> Doc {
        Doc::with_options(DocOptions::builder().client_id(client).build())
    }

    #[test]
    fn test_sequence_delta() {
        let mut d = doc(1);
        let list = d.get_array("list");
        {
            let mut txn = d.transact_mut();
            list.insert_range(&mut txn, 0, [1, 2, 3, 4]).unwrap();
        }
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        d.observe(&list, move |_, event| sink.lock().unwrap().push(event.delta().to_vec()));
        {
            let mut txn = d.transact_mut();
            list.remove_range(&mut txn, 1, 2).unwrap();
            list.insert(&mut txn, 1, 9).unwrap();
        }
        let seen = seen.lock().unwrap();
        assert_eq!(
            seen[0],
            vec![
                Delta::Retain(1),
                Delta::Inserted(vec![Value::Any(Any::Int(9))]),
                Delta::Deleted(2),
            ]
        );
    }

    #[test]
    fn test_key_changes() {
        let mut d = doc(1);
        let map = d.get_map("m");
        {
            let mut txn = d.transact_mut();
            map.insert(&mut txn, "kept", 1);
            map.insert(&mut txn, "gone", 2);
        }
        let seen = Arc::new(Mutex::new(HashMap::new()));
        let sink = seen.clone();
        d.observe(&map, move |_, event| {
            sink.lock().unwrap().extend(event.keys().clone());
        });
        {
            let mut txn = d.transact_mut();
            map.insert(&mut txn, "kept", 10);
            map.remove(&mut txn, "gone");
            map.insert(&mut txn, "new", 3);
            map.insert(&mut txn, "temp", 4);
            map.remove(&mut txn, "temp");
        }
        let seen = seen.lock().unwrap();
        assert_eq!(
            seen.get("kept"),
            Some(&EntryChange::Updated(Value::from(1), Value::from(10)))
        );
        assert_eq!(seen.get("gone"), Some(&EntryChange::Removed(Value::from(2))));
        assert_eq!(seen.get("new"), Some(&EntryChange::Inserted(Value::from(3))));
        assert!(!seen.contains_key("temp"));
    }

    #[test]
    fn test_deep_observer_receives_nested_paths() {
        let mut d = doc(1);
        let root = d.get_map("root");
        let nested = {
            let mut txn = d.transact_mut();
            root.insert(&mut txn, "items", In::Array(vec![]))
                .into_array()
                .unwrap()
        };
        let paths = Arc::new(Mutex::new(Vec::new()));
        let sink = paths.clone();
        d.observe_deep(&root, move |_, events| {
            let mut sink = sink.lock().unwrap();
            for event in events {
                sink.push(event.path().to_vec());
            }
        });
        {
            let mut txn = d.transact_mut();
            nested.push_back(&mut txn, "x").unwrap();
        }
        assert_eq!(
            *paths.lock().unwrap(),
            vec![vec![PathSegment::Key("items".into())]]
        );
    }
}
