//! Positions that survive concurrent edits.
//!
//! An index into a sequence goes stale as soon as another replica inserts
//! before it. A [`RelativePosition`] instead names the element the index
//! points at by its [`ID`], so it can be sent to other replicas and
//! resolved back into an [`AbsolutePosition`] against whatever state they
//! have at that time.

use crate::block::{Block, BlockPtr};
use crate::branch::TypePtr;
use crate::error::{Error, Result};
use crate::id::ID;
use crate::store::Store;
use crate::transaction::ReadTxn;
use crate::types::SharedRef;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use weft_codec::{Decoder, Encoder};

const TAG_ITEM: u8 = 0;
const TAG_ROOT: u8 = 1;
const TAG_TYPE: u8 = 2;

/// Which neighbour a position sticks to when an element is inserted at it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Assoc {
    /// Stick to the element at the index; inserts at the index push the
    /// position right.
    #[default]
    After,
    /// Stick to the element before the index.
    Before,
}

impl Assoc {
    fn to_wire(self) -> i64 {
        match self {
            Assoc::After => 0,
            Assoc::Before => -1,
        }
    }

    fn from_wire(value: i64) -> Self {
        if value >= 0 {
            Assoc::After
        } else {
            Assoc::Before
        }
    }
}

/// What a relative position is attached to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Anchor {
    /// A single element of a sequence.
    Item(ID),
    /// The start or end of a root type, depending on the association.
    Root(Arc<str>),
    /// The start or end of the nested type created by the item with this id.
    Type(ID),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RelativePosition {
    pub anchor: Anchor,
    pub assoc: Assoc,
}

/// A relative position resolved against one replica's current state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AbsolutePosition {
    pub type_ptr: TypePtr,
    pub index: u64,
    pub assoc: Assoc,
}

impl RelativePosition {
    /// Capture `index` in `shared`. With [`Assoc::After`] the position is
    /// attached to the element at `index`, with [`Assoc::Before`] to the one
    /// preceding it. Indexes past either end attach to the type itself.
    pub fn from_type_index<T: ReadTxn, S: SharedRef>(txn: &T, shared: &S, mut index: u64, assoc: Assoc) -> Self {
        let store = txn.store();
        let ptr = shared.type_ptr();
        let at_type = || type_anchor(store, ptr);
        if assoc == Assoc::Before {
            if index == 0 {
                return Self::new(at_type(), assoc);
            }
            index -= 1;
        }

        let mut cursor = store.branch(ptr).and_then(|b| b.start());
        while let Some(current) = cursor {
            let Some(item) = store.block(current).as_item() else {
                break;
            };
            if item.is_visible_element() {
                if index < item.len {
                    let id = ID::new(item.id.client, item.id.clock + index);
                    return Self::new(Anchor::Item(id), assoc);
                }
                index -= item.len;
            }
            if item.right.is_none() && assoc == Assoc::Before {
                return Self::new(Anchor::Item(item.last_id()), assoc);
            }
            cursor = item.right;
        }
        Self::new(at_type(), assoc)
    }

    pub fn new(anchor: Anchor, assoc: Assoc) -> Self {
        Self { anchor, assoc }
    }

    /// Resolve against the current state of `txn`. Returns `None` when the
    /// anchor has not been seen yet or its type was garbage collected.
    pub fn to_absolute<T: ReadTxn>(&self, txn: &T) -> Option<AbsolutePosition> {
        let store = txn.store();
        let (type_ptr, index) = match &self.anchor {
            Anchor::Item(id) => {
                if store.get_state(id.client) <= id.clock {
                    return None;
                }
                let (ptr, diff) = follow_redone(store, *id)?;
                let item = store.block(ptr).as_item()?;
                let type_ptr = item.parent_type()?;
                let mut index = 0;
                if !store.is_type_deleted(type_ptr) {
                    if item.is_visible_element() {
                        index = match self.assoc {
                            Assoc::After => diff,
                            Assoc::Before => diff + 1,
                        };
                    }
                    let mut left = item.left;
                    while let Some(current) = left {
                        let Some(neighbour) = store.block(current).as_item() else {
                            break;
                        };
                        if neighbour.is_visible_element() {
                            index += neighbour.len;
                        }
                        left = neighbour.left;
                    }
                }
                (type_ptr, index)
            }
            Anchor::Root(name) => {
                let type_ptr = store.root(name)?;
                (type_ptr, self.end_index(store, type_ptr))
            }
            Anchor::Type(id) => {
                if store.get_state(id.client) <= id.clock {
                    return None;
                }
                let ptr = store.find(id)?;
                store.block(ptr).as_item()?.content.as_branch()?;
                let type_ptr = TypePtr::Nested(ptr);
                (type_ptr, self.end_index(store, type_ptr))
            }
        };
        Some(AbsolutePosition {
            type_ptr,
            index,
            assoc: self.assoc,
        })
    }

    fn end_index(&self, store: &Store, ptr: TypePtr) -> u64 {
        match self.assoc {
            Assoc::After => store.branch(ptr).map_or(0, |b| b.len()),
            Assoc::Before => 0,
        }
    }

    pub fn encode_into(&self, enc: &mut Encoder) {
        match &self.anchor {
            Anchor::Item(id) => {
                enc.write_u8(TAG_ITEM);
                enc.write_var_u64(id.client);
                enc.write_var_u64(id.clock);
            }
            Anchor::Root(name) => {
                enc.write_u8(TAG_ROOT);
                enc.write_var_string(name);
            }
            Anchor::Type(id) => {
                enc.write_u8(TAG_TYPE);
                enc.write_var_u64(id.client);
                enc.write_var_u64(id.clock);
            }
        }
        enc.write_var_i64(self.assoc.to_wire());
    }

    pub fn decode_from(dec: &mut Decoder<'_>) -> Result<Self> {
        let anchor = match dec.read_u8()? {
            TAG_ITEM => Anchor::Item(ID::new(dec.read_var_u64()?, dec.read_var_u64()?)),
            TAG_ROOT => Anchor::Root(dec.read_var_string()?.into()),
            TAG_TYPE => Anchor::Type(ID::new(dec.read_var_u64()?, dec.read_var_u64()?)),
            tag => return Err(Error::InvalidPosition(format!("unknown anchor tag {tag}"))),
        };
        // older encoders omit the association
        let assoc = if dec.has_content() {
            Assoc::from_wire(dec.read_var_i64()?)
        } else {
            Assoc::After
        };
        Ok(Self { anchor, assoc })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut enc = Encoder::new();
        self.encode_into(&mut enc);
        enc.into_vec()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Self::decode_from(&mut Decoder::new(bytes))
    }
}

fn type_anchor(store: &Store, ptr: TypePtr) -> Anchor {
    match ptr {
        TypePtr::Root(index) => Anchor::Root(store.root_name(index).cloned().unwrap_or_else(|| Arc::from(""))),
        TypePtr::Nested(item) => Anchor::Type(store.block(item).id()),
    }
}

/// Block holding `id` after following redo links, plus the offset of `id`
/// inside it.
fn follow_redone(store: &Store, id: ID) -> Option<(BlockPtr, u64)> {
    let mut next = id;
    loop {
        let ptr = store.find(&next)?;
        let block = store.block(ptr);
        let diff = next.clock - block.id().clock;
        match block {
            Block::Item(item) => match item.redone {
                Some(redone) => next = ID::new(redone.client, redone.clock + diff),
                None => return Some((ptr, diff)),
            },
            Block::Gc(_) => return Some((ptr, diff)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::doc::{Doc, DocOptions};
    use crate::types::Value;

    fn doc(client: u64) -> Doc {
        Doc::with_options(DocOptions::builder().client_id(client).build())
    }

    fn sync(a: &mut Doc, b: &mut Doc) {
        let to_b = a.encode_state_as_update_v2(&b.state_vector());
        let to_a = b.encode_state_as_update_v2(&a.state_vector());
        b.apply_update_v2(&to_b).unwrap();
        a.apply_update_v2(&to_a).unwrap();
    }

    #[test]
    fn test_position_follows_element_across_concurrent_inserts() {
        let (mut a, mut b) = (doc(1), doc(2));
        let (text_a, text_b) = (a.get_text("t"), b.get_text("t"));
        {
            let mut txn = a.transact_mut();
            text_a.insert(&mut txn, 0, "hello world").unwrap();
        }
        sync(&mut a, &mut b);

        let pos = RelativePosition::from_type_index(&a, &text_a, 6, Assoc::After);
        let wire = pos.encode();
        {
            let mut txn = a.transact_mut();
            text_a.insert(&mut txn, 2, "!!").unwrap();
        }
        {
            let mut txn = b.transact_mut();
            text_b.insert(&mut txn, 0, "XYZ").unwrap();
        }
        sync(&mut a, &mut b);

        let decoded = RelativePosition::decode(&wire).unwrap();
        assert_eq!(decoded, pos);
        for (d, text) in [(&a, &text_a), (&b, &text_b)] {
            let abs = decoded.to_absolute(d).unwrap();
            assert_eq!(abs.type_ptr, text.type_ptr());
            assert_eq!(abs.index, 11);
            assert_eq!(text.get_string(d).chars().nth(abs.index as usize), Some('w'));
        }
    }

    #[test]
    fn test_before_assoc_sticks_to_preceding_element() {
        let mut d = doc(1);
        let text = d.get_text("t");
        {
            let mut txn = d.transact_mut();
            text.insert(&mut txn, 0, "abcd").unwrap();
        }
        let before = RelativePosition::from_type_index(&d, &text, 2, Assoc::Before);
        let after = RelativePosition::from_type_index(&d, &text, 2, Assoc::After);
        {
            let mut txn = d.transact_mut();
            text.insert(&mut txn, 2, "__").unwrap();
        }
        assert_eq!(before.to_absolute(&d).unwrap().index, 2);
        assert_eq!(after.to_absolute(&d).unwrap().index, 4);
    }

    #[test]
    fn test_deleted_anchor_collapses_to_its_place() {
        let mut d = doc(1);
        let text = d.get_text("t");
        {
            let mut txn = d.transact_mut();
            text.insert(&mut txn, 0, "hello world").unwrap();
        }
        let pos = RelativePosition::from_type_index(&d, &text, 6, Assoc::After);
        {
            let mut txn = d.transact_mut();
            text.remove_range(&mut txn, 4, 4).unwrap();
        }
        assert_eq!(text.get_string(&d), "hellrld");
        assert_eq!(pos.to_absolute(&d).unwrap().index, 4);
    }

    #[test]
    fn test_positions_past_the_ends_attach_to_the_type() {
        let mut d = doc(1);
        let text = d.get_text("t");
        {
            let mut txn = d.transact_mut();
            text.insert(&mut txn, 0, "abc").unwrap();
        }
        let end = RelativePosition::from_type_index(&d, &text, 3, Assoc::After);
        assert_eq!(end.anchor, Anchor::Root("t".into()));
        let start = RelativePosition::from_type_index(&d, &text, 0, Assoc::Before);
        assert_eq!(start.anchor, Anchor::Root("t".into()));
        {
            let mut txn = d.transact_mut();
            text.push(&mut txn, "de").unwrap();
            text.insert(&mut txn, 0, "_").unwrap();
        }
        assert_eq!(end.to_absolute(&d).unwrap().index, 6);
        assert_eq!(start.to_absolute(&d).unwrap().index, 0);
    }

    #[test]
    fn test_nested_type_position_resolves_on_other_replica() {
        let (mut a, mut b) = (doc(1), doc(2));
        let map_a = a.get_map("m");
        let text_a = {
            let mut txn = a.transact_mut();
            let Value::Text(text) = map_a.insert(&mut txn, "body", crate::types::In::Text("abc".into())) else {
                panic!("expected nested text");
            };
            text
        };
        let end = RelativePosition::from_type_index(&a, &text_a, 3, Assoc::After);
        assert!(matches!(end.anchor, Anchor::Type(_)));
        let inner = RelativePosition::from_type_index(&a, &text_a, 1, Assoc::After);
        sync(&mut a, &mut b);

        let map_b = b.get_map("m");
        let text_b = map_b.get(&b, "body").and_then(Value::into_text).unwrap();
        {
            let mut txn = b.transact_mut();
            text_b.insert(&mut txn, 0, "xy").unwrap();
        }
        let end = RelativePosition::decode(&end.encode()).unwrap();
        let abs = end.to_absolute(&b).unwrap();
        assert_eq!(abs.type_ptr, text_b.type_ptr());
        assert_eq!(abs.index, 5);
        assert_eq!(inner.to_absolute(&b).unwrap().index, 3);
    }

    #[test]
    fn test_unseen_anchor_does_not_resolve() {
        let (mut a, b) = (doc(1), doc(2));
        let text = a.get_text("t");
        {
            let mut txn = a.transact_mut();
            text.insert(&mut txn, 0, "abc").unwrap();
        }
        let pos = RelativePosition::from_type_index(&a, &text, 1, Assoc::After);
        assert!(pos.to_absolute(&b).is_none());
        let missing_root = RelativePosition::new(Anchor::Root("nope".into()), Assoc::After);
        assert!(missing_root.to_absolute(&a).is_none());
    }

    #[test]
    fn test_position_serializes_with_named_root() {
        let pos = RelativePosition::new(Anchor::Root("notes".into()), Assoc::Before);
        let json = serde_json::to_string(&pos).unwrap();
        let back: RelativePosition = serde_json::from_str(&json).unwrap();
        assert_eq!(back, pos);
    }

    #[test]
    fn test_decode_rejects_unknown_anchor_tag() {
        assert!(matches!(RelativePosition::decode(&[7, 0]), Err(Error::InvalidPosition(_))));
        let legacy = RelativePosition::decode(&[TAG_ROOT, 1, b't']).unwrap();
        assert_eq!(legacy.assoc, Assoc::After);
    }
}
