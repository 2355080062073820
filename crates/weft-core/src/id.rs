//! Block identifiers and state vectors.

use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use weft_codec::{Decoder, Encoder};

/// Replica identifier. Randomly generated per document instance.
pub type ClientId = u64;

/// Unique name of a single element: the client that created it and that
/// client's clock at creation time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ID {
    pub client: ClientId,
    pub clock: u64,
}

impl ID {
    pub const fn new(client: ClientId, clock: u64) -> Self {
        Self { client, clock }
    }
}

impl fmt::Display for ID {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<{}#{}>", self.client, self.clock)
    }
}

/// Per-client next expected clock: a summary of everything a replica has
/// integrated.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateVector {
    clocks: HashMap<ClientId, u64>,
}

impl StateVector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Next expected clock for `client`, `0` when unknown.
    pub fn get(&self, client: ClientId) -> u64 {
        self.clocks.get(&client).copied().unwrap_or(0)
    }

    pub fn set(&mut self, client: ClientId, clock: u64) {
        self.clocks.insert(client, clock);
    }

    /// Raise the entry for `client` to at least `clock`.
    pub fn set_max(&mut self, client: ClientId, clock: u64) {
        let entry = self.clocks.entry(client).or_insert(0);
        *entry = (*entry).max(clock);
    }

    /// Lower the entry for `client` to at most `clock`, inserting it if absent.
    pub fn set_min(&mut self, client: ClientId, clock: u64) {
        self.clocks
            .entry(client)
            .and_modify(|c| *c = (*c).min(clock))
            .or_insert(clock);
    }

    pub fn remove(&mut self, client: ClientId) -> Option<u64> {
        self.clocks.remove(&client)
    }

    /// Whether the element `id` is covered by this vector.
    pub fn contains(&self, id: &ID) -> bool {
        id.clock < self.get(id.client)
    }

    pub fn has_client(&self, client: ClientId) -> bool {
        self.clocks.contains_key(&client)
    }

    pub fn len(&self) -> usize {
        self.clocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clocks.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (ClientId, u64)> + '_ {
        self.clocks.iter().map(|(c, k)| (*c, *k))
    }

    /// Entries ordered by descending client id, the order used on the wire.
    pub fn sorted_desc(&self) -> Vec<(ClientId, u64)> {
        let mut entries: Vec<_> = self.iter().collect();
        entries.sort_unstable_by(|a, b| b.0.cmp(&a.0));
        entries
    }

    /// True if `self` has seen everything `other` has seen.
    pub fn dominates(&self, other: &StateVector) -> bool {
        other.iter().all(|(client, clock)| self.get(client) >= clock)
    }

    pub fn encode_into(&self, enc: &mut Encoder) {
        enc.write_var_u64(self.clocks.len() as u64);
        for (client, clock) in self.sorted_desc() {
            enc.write_var_u64(client);
            enc.write_var_u64(clock);
        }
    }

    pub fn decode_from(dec: &mut Decoder<'_>) -> Result<Self> {
        let len = dec.read_len()?;
        let mut sv = StateVector::new();
        for _ in 0..len {
            let client = dec.read_var_u64()?;
            let clock = dec.read_var_u64()?;
            sv.set(client, clock);
        }
        Ok(sv)
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

impl FromIterator<(ClientId, u64)> for StateVector {
    fn from_iter<T: IntoIterator<Item = (ClientId, u64)>>(iter: T) -> Self {
        Self {
            clocks: iter.into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_vector_defaults_to_zero() {
        let sv = StateVector::new();
        assert_eq!(sv.get(42), 0);
        assert!(!sv.contains(&ID::new(42, 0)));
    }

    #[test]
    fn test_set_max_and_min() {
        let mut sv = StateVector::new();
        sv.set_max(1, 5);
        sv.set_max(1, 3);
        assert_eq!(sv.get(1), 5);
        sv.set_min(1, 2);
        assert_eq!(sv.get(1), 2);
        sv.set_min(9, 7);
        assert_eq!(sv.get(9), 7);
    }

    #[test]
    fn test_encoding_is_sorted_descending() {
        let sv: StateVector = [(1, 10), (300, 2)].into_iter().collect();
        let bytes = sv.encode();
        assert_eq!(bytes, vec![2, 0xac, 0x02, 2, 1, 10]);
        assert_eq!(StateVector::decode(&bytes).unwrap(), sv);
    }

    #[test]
    fn test_dominates() {
        let a: StateVector = [(1, 4), (2, 2)].into_iter().collect();
        let b: StateVector = [(1, 3)].into_iter().collect();
        assert!(a.dominates(&b));
        assert!(!b.dominates(&a));
    }
}
