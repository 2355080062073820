//! Delete sets: per-client tombstone ranges.

use crate::block::{Block, BlockPtr};
use crate::error::Result;
use crate::id::{ClientId, ID};
use crate::store::Store;
use crate::update::{UpdateDecoderV2, UpdateEncoderV2};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A run of deleted clocks `[clock, clock + len)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteItem {
    pub clock: u64,
    pub len: u64,
}

impl DeleteItem {
    pub fn new(clock: u64, len: u64) -> Self {
        Self { clock, len }
    }

    pub fn end(&self) -> u64 {
        self.clock + self.len
    }
}

/// Deleted ranges per client.
///
/// Ranges pushed with [`push`](DeleteSet::push) may be unordered until
/// [`sort_and_merge`](DeleteSet::sort_and_merge) runs; [`insert`](DeleteSet::insert)
/// keeps the sorted and merged invariant on its own.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteSet {
    clients: HashMap<ClientId, Vec<DeleteItem>>,
}

impl DeleteSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.values().all(Vec::is_empty)
    }

    pub fn clients(&self) -> impl Iterator<Item = ClientId> + '_ {
        self.clients.keys().copied()
    }

    pub fn ranges(&self, client: ClientId) -> &[DeleteItem] {
        self.clients.get(&client).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn iter(&self) -> impl Iterator<Item = (ClientId, &[DeleteItem])> + '_ {
        self.clients.iter().map(|(c, r)| (*c, r.as_slice()))
    }

    /// Append a range without restoring order. Cheap for bulk inserts during
    /// a transaction; call [`sort_and_merge`](Self::sort_and_merge) afterwards.
    pub fn push(&mut self, id: ID, len: u64) {
        if len == 0 {
            return;
        }
        self.clients
            .entry(id.client)
            .or_default()
            .push(DeleteItem::new(id.clock, len));
    }

    /// Insert a range, merging it with touching or overlapping neighbours.
    pub fn insert(&mut self, id: ID, len: u64) {
        if len == 0 {
            return;
        }
        let ranges = self.clients.entry(id.client).or_default();
        let mut item = DeleteItem::new(id.clock, len);
        let pos = ranges.partition_point(|r| r.end() < item.clock);
        while pos < ranges.len() && ranges[pos].clock <= item.end() {
            let other = ranges.remove(pos);
            let end = item.end().max(other.end());
            item.clock = item.clock.min(other.clock);
            item.len = end - item.clock;
        }
        ranges.insert(pos, item);
        // pos was found against the old left neighbour; it may touch now
        if pos > 0 && ranges[pos - 1].end() >= ranges[pos].clock {
            let right = ranges.remove(pos);
            let left = &mut ranges[pos - 1];
            left.len = left.len.max(right.end() - left.clock);
        }
    }

    /// Restore the sorted, non-overlapping invariant for every client.
    pub fn sort_and_merge(&mut self) {
        for ranges in self.clients.values_mut() {
            ranges.sort_unstable_by_key(|r| r.clock);
            let mut merged: Vec<DeleteItem> = Vec::with_capacity(ranges.len());
            for range in ranges.drain(..) {
                match merged.last_mut() {
                    Some(last) if last.end() >= range.clock => {
                        last.len = last.len.max(range.end() - last.clock);
                    }
                    _ => merged.push(range),
                }
            }
            *ranges = merged;
        }
        self.clients.retain(|_, ranges| !ranges.is_empty());
    }

    /// Whether `id` is inside a deleted range. Expects sorted ranges.
    pub fn is_deleted(&self, id: &ID) -> bool {
        self.find_range(id).is_some()
    }

    fn find_range(&self, id: &ID) -> Option<&DeleteItem> {
        let ranges = self.clients.get(&id.client)?;
        let pos = ranges.partition_point(|r| r.clock <= id.clock);
        let range = ranges.get(pos.checked_sub(1)?)?;
        (id.clock < range.end()).then_some(range)
    }

    /// Union with `other`.
    pub fn merge(&mut self, other: &DeleteSet) {
        for (client, ranges) in &other.clients {
            self.clients
                .entry(*client)
                .or_default()
                .extend(ranges.iter().copied());
        }
        self.sort_and_merge();
    }

    /// Every deleted range currently recorded in `store`.
    pub fn from_store(store: &Store) -> Self {
        let mut ds = DeleteSet::new();
        for client in store.clients() {
            let mut ranges: Vec<DeleteItem> = Vec::new();
            for ptr in store.blocks_of(client) {
                let block = store.block(*ptr);
                if !block.is_deleted() {
                    continue;
                }
                let clock = block.id().clock;
                match ranges.last_mut() {
                    Some(last) if last.end() == clock => last.len += block.len(),
                    _ => ranges.push(DeleteItem::new(clock, block.len())),
                }
            }
            if !ranges.is_empty() {
                ds.clients.insert(client, ranges);
            }
        }
        ds
    }

    /// Visit every block of `store` overlapping a deleted range. Blocks are
    /// not split; the callback stops the walk by returning `false`.
    pub fn iterate_blocks<F>(&self, store: &Store, mut f: F)
    where
        F: FnMut(BlockPtr, &Block) -> bool,
    {
        for (client, ranges) in &self.clients {
            let blocks = store.blocks_of(*client);
            for range in ranges {
                let Some(mut index) = store.find_index(*client, range.clock) else {
                    continue;
                };
                while index < blocks.len() {
                    let ptr = blocks[index];
                    let block = store.block(ptr);
                    if block.id().clock >= range.end() {
                        break;
                    }
                    if !f(ptr, block) {
                        return;
                    }
                    index += 1;
                }
            }
        }
    }

    pub(crate) fn encode(&self, enc: &mut UpdateEncoderV2) {
        let mut clients: Vec<_> = self
            .clients
            .iter()
            .filter(|(_, ranges)| !ranges.is_empty())
            .collect();
        clients.sort_unstable_by(|a, b| b.0.cmp(a.0));
        enc.rest.write_var_u64(clients.len() as u64);
        for (client, ranges) in clients {
            enc.reset_ds_cur_val();
            enc.rest.write_var_u64(*client);
            enc.rest.write_var_u64(ranges.len() as u64);
            for range in ranges {
                enc.write_ds_clock(range.clock);
                enc.write_ds_len(range.len);
            }
        }
    }

    pub(crate) fn decode(dec: &mut UpdateDecoderV2<'_>) -> Result<Self> {
        let mut ds = DeleteSet::new();
        let num_clients = dec.rest.read_len()?;
        for _ in 0..num_clients {
            dec.reset_ds_cur_val();
            let client = dec.rest.read_var_u64()?;
            let num_ranges = dec.rest.read_len()?;
            let mut ranges = Vec::with_capacity(num_ranges.min(1024));
            for _ in 0..num_ranges {
                let clock = dec.read_ds_clock()?;
                let len = dec.read_ds_len()?;
                ranges.push(DeleteItem::new(clock, len));
            }
            if !ranges.is_empty() {
                ds.clients.entry(client).or_default().extend(ranges);
            }
        }
        ds.sort_and_merge();
        Ok(ds)
    }

    /// Encode in the standalone delete-set format.
    pub fn encode_v2(&self) -> Vec<u8> {
        let mut enc = UpdateEncoderV2::new();
        self.encode(&mut enc);
        enc.finish()
    }

    pub fn decode_v2(bytes: &[u8]) -> Result<Self> {
        let mut dec = UpdateDecoderV2::new(bytes)?;
        Self::decode(&mut dec)
    }
}

impl FromIterator<(ID, u64)> for DeleteSet {
    fn from_iter<T: IntoIterator<Item = (ID, u64)>>(iter: T) -> Self {
        let mut ds = DeleteSet::new();
        for (id, len) in iter {
            ds.push(id, len);
        }
        ds.sort_and_merge();
        ds
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_adjacent_ranges_merge() {
        let mut ds = DeleteSet::new();
        ds.insert(ID::new(1, 0), 3);
        ds.insert(ID::new(1, 3), 2);
        assert_eq!(ds.ranges(1), &[DeleteItem::new(0, 5)]);
        for clock in 0..5 {
            assert!(ds.is_deleted(&ID::new(1, clock)));
        }
        assert!(!ds.is_deleted(&ID::new(1, 5)));
        assert!(!ds.is_deleted(&ID::new(2, 0)));
    }

    #[test]
    fn test_insert_bridges_gap() {
        let mut ds = DeleteSet::new();
        ds.insert(ID::new(1, 0), 2);
        ds.insert(ID::new(1, 6), 2);
        assert_eq!(ds.ranges(1).len(), 2);
        ds.insert(ID::new(1, 2), 4);
        assert_eq!(ds.ranges(1), &[DeleteItem::new(0, 8)]);
    }

    #[test]
    fn test_insert_out_of_order() {
        let mut ds = DeleteSet::new();
        ds.insert(ID::new(1, 10), 1);
        ds.insert(ID::new(1, 2), 1);
        ds.insert(ID::new(1, 5), 2);
        assert_eq!(
            ds.ranges(1),
            &[
                DeleteItem::new(2, 1),
                DeleteItem::new(5, 2),
                DeleteItem::new(10, 1)
            ]
        );
    }

    #[test]
    fn test_sort_and_merge_overlaps() {
        let mut ds = DeleteSet::new();
        ds.push(ID::new(3, 8), 4);
        ds.push(ID::new(3, 0), 2);
        ds.push(ID::new(3, 1), 3);
        ds.push(ID::new(3, 9), 1);
        ds.sort_and_merge();
        assert_eq!(ds.ranges(3), &[DeleteItem::new(0, 4), DeleteItem::new(8, 4)]);
    }

    #[test]
    fn test_merge_sets() {
        let a: DeleteSet = [(ID::new(1, 0), 2), (ID::new(2, 5), 1)].into_iter().collect();
        let b: DeleteSet = [(ID::new(1, 2), 2)].into_iter().collect();
        let mut merged = a.clone();
        merged.merge(&b);
        assert_eq!(merged.ranges(1), &[DeleteItem::new(0, 4)]);
        assert_eq!(merged.ranges(2), &[DeleteItem::new(5, 1)]);
    }

    #[test]
    fn test_encoding_round_trip() {
        let ds: DeleteSet = [
            (ID::new(1, 0), 3),
            (ID::new(1, 10), 1),
            (ID::new(7, 4), 100),
        ]
        .into_iter()
        .collect();
        let decoded = DeleteSet::decode_v2(&ds.encode_v2()).unwrap();
        assert_eq!(decoded, ds);
    }

    #[test]
    fn test_empty_set_encodes_zero_clients() {
        let ds = DeleteSet::new();
        let decoded = DeleteSet::decode_v2(&ds.encode_v2()).unwrap();
        assert!(decoded.is_empty());
    }
}
