//! Shared type handles.
//!
//! [`ArrayRef`], [`MapRef`] and [`TextRef`] are copyable handles naming a
//! branch in the store. Reads take any [`ReadTxn`]; writes need the open
//! [`TransactionMut`].

use crate::block::BlockPtr;
use crate::branch::{TypeKind, TypePtr};
use crate::content::ItemContent;
use crate::error::Result;
use crate::map;
use crate::sequence;
use crate::snapshot::Snapshot;
use crate::store::Store;
use crate::transaction::{ReadTxn, TransactionMut};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use weft_codec::Any;

/// Behaviour every shared type implements.
pub trait SharedRef {
    fn type_ptr(&self) -> TypePtr;

    fn kind(&self) -> TypeKind;

    /// Sequence length for arrays and text, entry count for maps.
    fn len<T: ReadTxn>(&self, txn: &T) -> u64;

    fn to_json<T: ReadTxn>(&self, txn: &T) -> Any;
}

/// A value read from a shared type.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Any(Any),
    Array(ArrayRef),
    Map(MapRef),
    Text(TextRef),
    /// Reference to an embedded sub-document.
    Doc { guid: Arc<str> },
}

impl Value {
    pub fn into_any(self) -> Option<Any> {
        match self {
            Value::Any(any) => Some(any),
            _ => None,
        }
    }

    pub fn into_array(self) -> Option<ArrayRef> {
        match self {
            Value::Array(array) => Some(array),
            _ => None,
        }
    }

    pub fn into_map(self) -> Option<MapRef> {
        match self {
            Value::Map(map) => Some(map),
            _ => None,
        }
    }

    pub fn into_text(self) -> Option<TextRef> {
        match self {
            Value::Text(text) => Some(text),
            _ => None,
        }
    }

    pub fn to_json<T: ReadTxn>(&self, txn: &T) -> Any {
        match self {
            Value::Any(any) => any.clone(),
            Value::Array(array) => array.to_json(txn),
            Value::Map(map) => map.to_json(txn),
            Value::Text(text) => text.to_json(txn),
            Value::Doc { guid } => Any::String(guid.to_string()),
        }
    }
}

macro_rules! value_from_any {
    ($($t:ty),*) => {
        $(impl From<$t> for Value {
            fn from(value: $t) -> Self {
                Value::Any(Any::from(value))
            }
        })*
    };
}

value_from_any!(bool, i32, i64, f64, &str, String);

impl From<Any> for Value {
    fn from(value: Any) -> Self {
        Value::Any(value)
    }
}

/// Values of an item's content as seen by readers. String content is one
/// value; format markers and collected content have none.
pub(crate) fn item_values(store: &Store, ptr: BlockPtr) -> Vec<Value> {
    let Some(item) = store.block(ptr).as_item() else {
        return Vec::new();
    };
    match &item.content {
        ItemContent::Any(values) | ItemContent::Json(values) => {
            values.iter().cloned().map(Value::Any).collect()
        }
        ItemContent::Binary(bytes) => vec![Value::Any(Any::Buffer(bytes.clone()))],
        ItemContent::String(s) => vec![Value::Any(Any::String(s.clone()))],
        ItemContent::Embed(value) => vec![Value::Any(value.clone())],
        ItemContent::Doc { guid, .. } => vec![Value::Doc { guid: guid.clone() }],
        ItemContent::Type(branch) => {
            let nested = TypePtr::Nested(ptr);
            vec![match branch.kind() {
                TypeKind::Map => Value::Map(MapRef(nested)),
                TypeKind::Text => Value::Text(TextRef(nested)),
                TypeKind::Array | TypeKind::Undefined => Value::Array(ArrayRef(nested)),
            }]
        }
        ItemContent::Format { .. } | ItemContent::Deleted(_) => Vec::new(),
    }
}

/// Preliminary content: what callers hand to insert operations. Nested
/// variants become new shared types filled with their contents.
#[derive(Debug, Clone, PartialEq)]
pub enum In {
    Any(Any),
    Array(Vec<In>),
    Map(HashMap<String, In>),
    Text(String),
    Doc(Arc<str>),
}

macro_rules! in_from_any {
    ($($t:ty),*) => {
        $(impl From<$t> for In {
            fn from(value: $t) -> Self {
                In::Any(Any::from(value))
            }
        })*
    };
}

in_from_any!(bool, i32, i64, f64, &str, String, Vec<u8>);

impl From<Any> for In {
    fn from(value: Any) -> Self {
        In::Any(value)
    }
}

fn sequence_json<T: ReadTxn>(txn: &T, values: Vec<Value>) -> Any {
    Any::Array(values.iter().map(|v| v.to_json(txn)).collect())
}

// ----------------------------------------------------------------------
// Array
// ----------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ArrayRef(TypePtr);

impl From<TypePtr> for ArrayRef {
    fn from(ptr: TypePtr) -> Self {
        Self(ptr)
    }
}

impl SharedRef for ArrayRef {
    fn type_ptr(&self) -> TypePtr {
        self.0
    }

    fn kind(&self) -> TypeKind {
        TypeKind::Array
    }

    fn len<T: ReadTxn>(&self, txn: &T) -> u64 {
        txn.store().branch(self.0).map_or(0, |b| b.len())
    }

    fn to_json<T: ReadTxn>(&self, txn: &T) -> Any {
        sequence_json(txn, self.to_vec(txn))
    }
}

impl ArrayRef {
    /// Insert one value at `index` and return it as stored; nested values
    /// come back as handles to the new type.
    pub fn insert<V: Into<In>>(&self, txn: &mut TransactionMut<'_>, index: u64, value: V) -> Result<Value> {
        let created = sequence::insert(txn, self.0, index, vec![value.into()])?;
        let last = created.last().copied();
        Ok(last
            .and_then(|ptr| item_values(txn.store(), ptr).pop())
            .unwrap_or(Value::Any(Any::Undefined)))
    }

    pub fn insert_range<I, V>(&self, txn: &mut TransactionMut<'_>, index: u64, values: I) -> Result<()>
    where
        I: IntoIterator<Item = V>,
        V: Into<In>,
    {
        let values: Vec<In> = values.into_iter().map(Into::into).collect();
        if values.is_empty() {
            return Ok(());
        }
        sequence::insert(txn, self.0, index, values)?;
        Ok(())
    }

    pub fn push_back<V: Into<In>>(&self, txn: &mut TransactionMut<'_>, value: V) -> Result<Value> {
        let len = self.len(&*txn);
        self.insert(txn, len, value)
    }

    pub fn push_front<V: Into<In>>(&self, txn: &mut TransactionMut<'_>, value: V) -> Result<Value> {
        self.insert(txn, 0, value)
    }

    pub fn remove(&self, txn: &mut TransactionMut<'_>, index: u64) -> Result<()> {
        sequence::remove(txn, self.0, index, 1)
    }

    pub fn remove_range(&self, txn: &mut TransactionMut<'_>, index: u64, len: u64) -> Result<()> {
        sequence::remove(txn, self.0, index, len)
    }

    pub fn get<T: ReadTxn>(&self, txn: &T, index: u64) -> Option<Value> {
        sequence::get(txn.store(), self.0, index)
    }

    pub fn to_vec<T: ReadTxn>(&self, txn: &T) -> Vec<Value> {
        sequence::values(txn.store(), self.0, None)
    }

    /// Contents as they were at `snapshot`. Needs a document with garbage
    /// collection disabled to see deleted elements.
    pub fn to_vec_at(&self, txn: &mut TransactionMut<'_>, snapshot: &Snapshot) -> Vec<Value> {
        txn.split_snapshot_affected_structs(snapshot);
        sequence::values(txn.store(), self.0, Some(snapshot))
    }
}

// ----------------------------------------------------------------------
// Map
// ----------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MapRef(TypePtr);

impl From<TypePtr> for MapRef {
    fn from(ptr: TypePtr) -> Self {
        Self(ptr)
    }
}

impl SharedRef for MapRef {
    fn type_ptr(&self) -> TypePtr {
        self.0
    }

    fn kind(&self) -> TypeKind {
        TypeKind::Map
    }

    fn len<T: ReadTxn>(&self, txn: &T) -> u64 {
        map::entries(txn.store(), self.0).len() as u64
    }

    fn to_json<T: ReadTxn>(&self, txn: &T) -> Any {
        let entries: BTreeMap<String, Any> = self
            .entries(txn)
            .into_iter()
            .map(|(key, value)| (key.to_string(), value.to_json(txn)))
            .collect();
        Any::from(entries)
    }
}

impl MapRef {
    /// Set `key` to `value` and return it as stored.
    pub fn insert<V: Into<In>>(&self, txn: &mut TransactionMut<'_>, key: &str, value: V) -> Value {
        let ptr = map::set(txn, self.0, key, value.into());
        item_values(txn.store(), ptr)
            .pop()
            .unwrap_or(Value::Any(Any::Undefined))
    }

    pub fn get<T: ReadTxn>(&self, txn: &T, key: &str) -> Option<Value> {
        map::get(txn.store(), self.0, key)
    }

    pub fn get_at<T: ReadTxn>(&self, txn: &T, key: &str, snapshot: &Snapshot) -> Option<Value> {
        map::get_at(txn.store(), self.0, key, snapshot)
    }

    pub fn remove(&self, txn: &mut TransactionMut<'_>, key: &str) -> Option<Value> {
        map::remove(txn, self.0, key)
    }

    pub fn contains_key<T: ReadTxn>(&self, txn: &T, key: &str) -> bool {
        self.get(txn, key).is_some()
    }

    pub fn keys<T: ReadTxn>(&self, txn: &T) -> Vec<Arc<str>> {
        map::entries(txn.store(), self.0)
            .into_iter()
            .map(|(key, _)| key)
            .collect()
    }

    /// Live entries sorted by key.
    pub fn entries<T: ReadTxn>(&self, txn: &T) -> Vec<(Arc<str>, Value)> {
        let store = txn.store();
        map::entries(store, self.0)
            .into_iter()
            .filter_map(|(key, ptr)| Some((key, item_values(store, ptr).pop()?)))
            .collect()
    }
}

// ----------------------------------------------------------------------
// Text
// ----------------------------------------------------------------------

/// Collaborative string. Indices and lengths count UTF-16 code units.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TextRef(TypePtr);

impl From<TypePtr> for TextRef {
    fn from(ptr: TypePtr) -> Self {
        Self(ptr)
    }
}

impl SharedRef for TextRef {
    fn type_ptr(&self) -> TypePtr {
        self.0
    }

    fn kind(&self) -> TypeKind {
        TypeKind::Text
    }

    fn len<T: ReadTxn>(&self, txn: &T) -> u64 {
        txn.store().branch(self.0).map_or(0, |b| b.len())
    }

    fn to_json<T: ReadTxn>(&self, txn: &T) -> Any {
        Any::String(self.get_string(txn))
    }
}

impl TextRef {
    pub fn insert(&self, txn: &mut TransactionMut<'_>, index: u64, chunk: &str) -> Result<()> {
        sequence::insert_text(txn, self.0, index, chunk)?;
        Ok(())
    }

    pub fn push(&self, txn: &mut TransactionMut<'_>, chunk: &str) -> Result<()> {
        let len = self.len(&*txn);
        self.insert(txn, len, chunk)
    }

    pub fn remove_range(&self, txn: &mut TransactionMut<'_>, index: u64, len: u64) -> Result<()> {
        sequence::remove(txn, self.0, index, len)
    }

    pub fn get_string<T: ReadTxn>(&self, txn: &T) -> String {
        sequence::text(txn.store(), self.0, None)
    }

    pub fn get_string_at(&self, txn: &mut TransactionMut<'_>, snapshot: &Snapshot) -> String {
        txn.split_snapshot_affected_structs(snapshot);
        sequence::text(txn.store(), self.0, Some(snapshot))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::doc::{Doc, DocOptions};

    fn doc() -> Doc {
        Doc::with_options(DocOptions::builder().client_id(1).build())
    }

    #[test]
    fn test_nested_prelim_values() {
        let mut d = doc();
        let root = d.get_map("root");
        let mut entries = HashMap::new();
        entries.insert("title".to_string(), In::Text("draft".into()));
        entries.insert("tags".to_string(), In::Array(vec!["a".into(), "b".into()]));
        {
            let mut txn = d.transact_mut();
            root.insert(&mut txn, "doc", In::Map(entries));
        }
        let json = root.to_json(&d);
        let expected = Any::from_json_str(r#"{"doc":{"tags":["a","b"],"title":"draft"}}"#).unwrap();
        assert_eq!(json, expected);
    }

    #[test]
    fn test_array_get_and_remove() {
        let mut d = doc();
        let list = d.get_array("list");
        let mut txn = d.transact_mut();
        list.insert_range(&mut txn, 0, ["a", "b", "c", "d"]).unwrap();
        assert_eq!(list.get(&txn, 2), Some(Value::from("c")));
        list.remove(&mut txn, 1).unwrap();
        assert_eq!(list.get(&txn, 1), Some(Value::from("c")));
        assert_eq!(list.get(&txn, 3), None);
        list.push_front(&mut txn, "z").unwrap();
        assert_eq!(
            list.to_json(&txn),
            Any::Array(vec!["z".into(), "a".into(), "c".into(), "d".into()])
        );
    }

    #[test]
    fn test_text_counts_utf16_units() {
        let mut d = doc();
        let text = d.get_text("t");
        let mut txn = d.transact_mut();
        text.insert(&mut txn, 0, "a😀b").unwrap();
        assert_eq!(text.len(&txn), 4);
        text.insert(&mut txn, 3, "!").unwrap();
        assert_eq!(text.get_string(&txn), "a😀!b");
        text.remove_range(&mut txn, 1, 2).unwrap();
        assert_eq!(text.get_string(&txn), "a!b");
    }

    #[test]
    fn test_map_entries_sorted() {
        let mut d = doc();
        let map = d.get_map("m");
        let mut txn = d.transact_mut();
        map.insert(&mut txn, "b", 2);
        map.insert(&mut txn, "a", 1);
        let keys: Vec<String> = map.keys(&txn).iter().map(|k| k.to_string()).collect();
        assert_eq!(keys, vec!["a", "b"]);
        assert_eq!(map.len(&txn), 2);
    }
}
