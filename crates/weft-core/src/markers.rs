//! Search markers: cached `(item, index)` pairs that make index lookups in
//! long sequences close to constant time for local editing patterns.
//!
//! Markers are hints. Every lookup starts from the nearest marker and walks
//! the item list to the requested index, so a stale marker only costs extra
//! steps, never a wrong answer. The collection sits behind its own lock so
//! that read-only lookups can refresh it.

use crate::block::BlockPtr;
use crate::branch::Branch;
use crate::store::Store;

pub const DEFAULT_MARKER_CAPACITY: usize = 80;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SearchMarker {
    pub ptr: BlockPtr,
    pub index: u64,
    timestamp: u64,
}

#[derive(Debug)]
pub struct SearchMarkers {
    markers: Vec<SearchMarker>,
    clock: u64,
    capacity: usize,
}

impl SearchMarkers {
    pub fn new(capacity: usize) -> Self {
        Self {
            markers: Vec::new(),
            clock: 0,
            capacity: capacity.max(1),
        }
    }

    pub fn len(&self) -> usize {
        self.markers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.markers.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &SearchMarker> {
        self.markers.iter()
    }

    pub fn clear(&mut self) {
        self.markers.clear();
    }

    pub(crate) fn set_capacity(&mut self, capacity: usize) {
        self.capacity = capacity.max(1);
        if self.markers.len() > self.capacity {
            self.markers.sort_by_key(|m| std::cmp::Reverse(m.timestamp));
            self.markers.truncate(self.capacity);
        }
    }

    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    fn overwrite(&mut self, slot: usize, ptr: BlockPtr, index: u64) {
        let timestamp = self.tick();
        let marker = &mut self.markers[slot];
        marker.ptr = ptr;
        marker.index = index;
        marker.timestamp = timestamp;
    }

    /// Remember `ptr` at `index`, evicting the least recently used marker
    /// when the collection is full.
    pub fn mark_position(&mut self, ptr: BlockPtr, index: u64) {
        if self.markers.len() >= self.capacity {
            let oldest = self
                .markers
                .iter()
                .enumerate()
                .min_by_key(|(_, m)| m.timestamp)
                .map(|(slot, _)| slot);
            if let Some(slot) = oldest {
                self.overwrite(slot, ptr, index);
            }
        } else {
            let timestamp = self.tick();
            self.markers.push(SearchMarker {
                ptr,
                index,
                timestamp,
            });
        }
    }

    /// Shift cached indices after `len` elements were inserted (positive) or
    /// removed (negative) at `index`.
    pub fn update_marker_changes(&mut self, store: &Store, index: u64, len: i64) {
        let mut slot = self.markers.len();
        while slot > 0 {
            slot -= 1;
            if len > 0 {
                let mut marker = self.markers[slot];
                let mut cursor = Some(marker.ptr);
                // move onto the closest visible element on the left
                while let Some(ptr) = cursor {
                    let item = store.item(ptr);
                    if item.is_visible_element() {
                        break;
                    }
                    cursor = item.left;
                    if let Some(left) = cursor {
                        let left = store.item(left);
                        if left.is_visible_element() {
                            marker.index = marker.index.saturating_sub(left.len);
                        }
                    }
                }
                let collides = cursor.map_or(true, |ptr| {
                    self.markers
                        .iter()
                        .enumerate()
                        .any(|(other, m)| other != slot && m.ptr == ptr)
                });
                if collides {
                    self.markers.remove(slot);
                    continue;
                }
                if let Some(ptr) = cursor {
                    marker.ptr = ptr;
                }
                self.markers[slot] = marker;
            }
            let marker = &mut self.markers[slot];
            if index < marker.index || (len > 0 && index == marker.index) {
                let shifted = (marker.index as i64 + len).max(index as i64);
                marker.index = shifted as u64;
            }
        }
    }

    /// Move markers that point at `from` to `to`, adjusting their index by
    /// `-shift`. Used when `from` is merged into its left neighbour `to`.
    pub(crate) fn repoint(&mut self, from: BlockPtr, to: BlockPtr, shift: u64) {
        for marker in self.markers.iter_mut().filter(|m| m.ptr == from) {
            marker.ptr = to;
            marker.index = marker.index.saturating_sub(shift);
        }
    }
}

/// Find the item covering sequence position `index`, starting from the
/// closest marker. Returns the item and the sequence index of its first
/// element, or `None` when a scan from the start is just as cheap.
pub fn find_marker(store: &Store, branch: &Branch, index: u64) -> Option<(BlockPtr, u64)> {
    let start = branch.start?;
    if index == 0 {
        return None;
    }
    let mut markers = branch.markers.lock();
    let nearest = markers
        .markers
        .iter()
        .enumerate()
        .min_by_key(|(_, m)| m.index.abs_diff(index))
        .map(|(slot, _)| slot);

    let (mut ptr, mut pindex) = match nearest {
        Some(slot) => {
            let timestamp = markers.tick();
            let marker = &mut markers.markers[slot];
            marker.timestamp = timestamp;
            (marker.ptr, marker.index)
        }
        None => (start, 0),
    };

    // walk right
    loop {
        let item = store.item(ptr);
        let Some(right) = item.right else { break };
        if pindex >= index {
            break;
        }
        if item.is_visible_element() {
            if index < pindex + item.len {
                break;
            }
            pindex += item.len;
        }
        ptr = right;
    }
    // walk left if we overshot
    while pindex > index {
        let Some(left) = store.item(ptr).left else { break };
        ptr = left;
        let item = store.item(ptr);
        if item.is_visible_element() {
            pindex = pindex.saturating_sub(item.len);
        }
    }
    // stop at a boundary that cannot be merged away
    loop {
        let item = store.item(ptr);
        let Some(left_ptr) = item.left else { break };
        let Some(left) = store.block(left_ptr).as_item() else { break };
        if left.id.client != item.id.client || left.id.clock + left.len != item.id.clock {
            break;
        }
        ptr = left_ptr;
        if left.is_visible_element() {
            pindex = pindex.saturating_sub(left.len);
        }
    }

    let drift_limit = branch.len as f64 / markers.capacity as f64;
    match nearest {
        Some(slot) if (markers.markers[slot].index.abs_diff(pindex) as f64) < drift_limit => {
            markers.overwrite(slot, ptr, pindex);
        }
        _ => markers.mark_position(ptr, pindex),
    }
    Some((ptr, pindex))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mark_position_evicts_oldest() {
        let mut markers = SearchMarkers::new(2);
        markers.mark_position(BlockPtr(1), 1);
        markers.mark_position(BlockPtr(2), 2);
        markers.mark_position(BlockPtr(3), 3);
        assert_eq!(markers.len(), 2);
        let ptrs: Vec<_> = markers.iter().map(|m| m.ptr).collect();
        assert!(!ptrs.contains(&BlockPtr(1)));
        assert!(ptrs.contains(&BlockPtr(3)));
    }

    #[test]
    fn test_timestamps_are_per_collection() {
        let mut a = SearchMarkers::new(4);
        let mut b = SearchMarkers::new(4);
        a.mark_position(BlockPtr(0), 0);
        a.mark_position(BlockPtr(1), 1);
        b.mark_position(BlockPtr(0), 0);
        assert_eq!(a.clock, 2);
        assert_eq!(b.clock, 1);
    }

    #[test]
    fn test_repoint_follows_merge() {
        let mut markers = SearchMarkers::new(4);
        markers.mark_position(BlockPtr(7), 10);
        markers.repoint(BlockPtr(7), BlockPtr(6), 3);
        let m = markers.iter().next().copied().unwrap();
        assert_eq!((m.ptr, m.index), (BlockPtr(6), 7));
        assert_eq!(markers.len(), 1);
    }
}
