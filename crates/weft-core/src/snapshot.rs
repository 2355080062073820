//! Point-in-time views of a document.
//!
//! A snapshot is a state vector plus a delete set. An item is visible at a
//! snapshot if the state vector covers it and the delete set does not. Reads
//! at a snapshot only see the right content while deleted items still carry
//! it, so historical reads need a document with garbage collection off.

use crate::block::Item;
use crate::delete_set::DeleteSet;
use crate::error::{Error, Result};
use crate::id::{StateVector, ID};
use crate::transaction::TransactionMut;
use crate::update::{write_block, UpdateDecoderV2, UpdateEncoderV2};
use serde::{Deserialize, Serialize};
use tracing::trace;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub state_vector: StateVector,
    pub delete_set: DeleteSet,
}

impl Snapshot {
    pub fn new(state_vector: StateVector, delete_set: DeleteSet) -> Self {
        Self {
            state_vector,
            delete_set,
        }
    }

    pub fn is_visible(&self, item: &Item) -> bool {
        item.id.clock < self.state_vector.get(item.id.client)
            && !self.delete_set.is_deleted(&item.id)
    }

    /// Delete set first, then the state vector.
    pub fn encode_v2(&self) -> Vec<u8> {
        let mut enc = UpdateEncoderV2::new();
        self.delete_set.encode(&mut enc);
        self.state_vector.encode_into(&mut enc.rest);
        enc.finish()
    }

    pub fn decode_v2(bytes: &[u8]) -> Result<Self> {
        let mut dec = UpdateDecoderV2::new(bytes)?;
        let delete_set = DeleteSet::decode(&mut dec)?;
        let state_vector = StateVector::decode_from(&mut dec.rest)?;
        Ok(Self::new(state_vector, delete_set))
    }
}

impl TransactionMut<'_> {
    /// Split blocks so that every item is either entirely visible or
    /// entirely invisible at `snapshot`.
    pub fn split_snapshot_affected_structs(&mut self, snapshot: &Snapshot) {
        for (client, clock) in snapshot.state_vector.iter() {
            if clock < self.doc.store.get_state(client) {
                self.get_item_clean_start(&ID::new(client, clock));
            }
        }
        self.iterate_deleted_structs(&snapshot.delete_set, |_, _| true);
    }

    /// Update that recreates the document as it was at `snapshot`. Fails if
    /// the document collects deleted content or has not reached the
    /// snapshot's state.
    pub fn encode_state_from_snapshot(&mut self, snapshot: &Snapshot) -> Result<Vec<u8>> {
        if self.doc.options.gc {
            return Err(Error::GcEnabled);
        }
        let mut clients = snapshot.state_vector.sorted_desc();
        clients.retain(|(_, clock)| *clock > 0);
        for (client, clock) in &clients {
            let state = self.doc.store.get_state(*client);
            if *clock > state {
                return Err(Error::InvalidUpdate(format!(
                    "snapshot expects clock {clock} for client {client}, document is at {state}"
                )));
            }
        }
        self.split_snapshot_affected_structs(snapshot);

        let store = &self.doc.store;
        let mut enc = UpdateEncoderV2::new();
        enc.rest.write_var_u64(clients.len() as u64);
        for (client, clock) in &clients {
            let last = store.find_index(*client, clock - 1).ok_or_else(|| {
                Error::Integrity(format!("no block for clock {} of client {client}", clock - 1))
            })?;
            let blocks = &store.blocks_of(*client)[..=last];
            enc.rest.write_var_u64(blocks.len() as u64);
            enc.write_client(*client);
            enc.rest.write_var_u64(0);
            for ptr in blocks {
                write_block(&mut enc, store.block(*ptr), 0, Some(store));
            }
        }
        snapshot.delete_set.encode(&mut enc);
        trace!(clients = clients.len(), "encoded state from snapshot");
        Ok(enc.finish())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::doc::{Doc, DocOptions};
    use crate::transaction::ReadTxn;
    use crate::types::Value;

    fn doc(gc: bool) -> Doc {
        Doc::with_options(DocOptions::builder().client_id(1).gc(gc).build())
    }

    #[test]
    fn test_snapshot_encoding_round_trip() {
        let mut d = doc(true);
        let text = d.get_text("t");
        {
            let mut txn = d.transact_mut();
            text.insert(&mut txn, 0, "hello").unwrap();
            text.remove_range(&mut txn, 0, 2).unwrap();
        }
        let snapshot = d.snapshot();
        let decoded = Snapshot::decode_v2(&snapshot.encode_v2()).unwrap();
        assert_eq!(decoded, snapshot);
    }

    #[test]
    fn test_text_at_snapshot() {
        let mut d = doc(false);
        let text = d.get_text("t");
        {
            let mut txn = d.transact_mut();
            text.insert(&mut txn, 0, "hello world").unwrap();
        }
        let before = d.snapshot();
        {
            let mut txn = d.transact_mut();
            text.remove_range(&mut txn, 5, 6).unwrap();
            text.push(&mut txn, "!").unwrap();
        }
        let mut txn = d.transact_mut();
        assert_eq!(text.get_string(&txn), "hello!");
        assert_eq!(text.get_string_at(&mut txn, &before), "hello world");
    }

    #[test]
    fn test_array_and_map_at_snapshot() {
        let mut d = doc(false);
        let list = d.get_array("list");
        let map = d.get_map("map");
        {
            let mut txn = d.transact_mut();
            list.insert_range(&mut txn, 0, [1, 2, 3]).unwrap();
            map.insert(&mut txn, "k", "old");
        }
        let before = d.snapshot();
        {
            let mut txn = d.transact_mut();
            list.remove(&mut txn, 1).unwrap();
            map.insert(&mut txn, "k", "new");
        }
        let mut txn = d.transact_mut();
        assert_eq!(
            list.to_vec_at(&mut txn, &before),
            vec![Value::from(1), Value::from(2), Value::from(3)]
        );
        assert_eq!(map.get_at(&txn, "k", &before), Some(Value::from("old")));
        assert_eq!(map.get(&txn, "k"), Some(Value::from("new")));
    }

    #[test]
    fn test_restore_from_snapshot() {
        let mut d = doc(false);
        let text = d.get_text("t");
        {
            let mut txn = d.transact_mut();
            text.insert(&mut txn, 0, "abc").unwrap();
        }
        let before = d.snapshot();
        {
            let mut txn = d.transact_mut();
            text.insert(&mut txn, 3, "def").unwrap();
            text.remove_range(&mut txn, 0, 1).unwrap();
        }
        let restored_update = d.encode_state_from_snapshot(&before).unwrap();

        let mut restored = Doc::with_options(DocOptions::builder().client_id(2).build());
        restored.apply_update_v2(&restored_update).unwrap();
        assert_eq!(restored.get_text("t").get_string(&restored), "abc");
        assert_eq!(restored.state_vector(), before.state_vector);
    }

    #[test]
    fn test_restore_requires_gc_off() {
        let mut d = doc(true);
        let snapshot = d.snapshot();
        assert_eq!(d.encode_state_from_snapshot(&snapshot), Err(Error::GcEnabled));
    }
}
