//! In-memory network of sync peers for convergence testing.
//!
//! Messages travel as encoded bytes through a simulated network that can
//! lose, duplicate and reorder them. Lost messages can be retransmitted to
//! model a reliable transport underneath.

use crate::error::{Result, SyncError};
use crate::peer::{PeerId, SyncPeer};
use crate::protocol::SyncMessage;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::VecDeque;
use tracing::{debug, warn};
use weft_core::{DeleteSet, Doc, DocOptions, ReadTxn};

/// Network configuration for simulation.
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    /// Probability of message loss (0.0 - 1.0)
    pub loss_rate: f64,
    /// Probability of message duplication (0.0 - 1.0)
    pub dup_rate: f64,
    /// Probability of message reordering (0.0 - 1.0)
    pub reorder_rate: f64,
    pub seed: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            loss_rate: 0.0,
            dup_rate: 0.0,
            reorder_rate: 0.0,
            seed: 12345,
        }
    }
}

impl NetworkConfig {
    pub fn lossy(loss_rate: f64) -> Self {
        Self {
            loss_rate,
            ..Default::default()
        }
    }

    pub fn with_dups(dup_rate: f64) -> Self {
        Self {
            dup_rate,
            ..Default::default()
        }
    }

    pub fn reordering(reorder_rate: f64) -> Self {
        Self {
            reorder_rate,
            ..Default::default()
        }
    }

    /// Every failure mode at once.
    pub fn chaotic() -> Self {
        Self {
            loss_rate: 0.1,
            dup_rate: 0.2,
            reorder_rate: 0.3,
            ..Default::default()
        }
    }

    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }
}

/// A message in flight between two peers of a cluster.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub from: usize,
    pub to: usize,
    pub payload: Vec<u8>,
}

#[derive(Debug)]
pub struct NetworkSimulator {
    in_flight: VecDeque<Envelope>,
    lost: Vec<Envelope>,
    config: NetworkConfig,
    rng: StdRng,
}

impl NetworkSimulator {
    pub fn new(config: NetworkConfig) -> Self {
        Self {
            in_flight: VecDeque::new(),
            lost: Vec::new(),
            rng: StdRng::seed_from_u64(config.seed),
            config,
        }
    }

    pub fn send(&mut self, envelope: Envelope) {
        if self.rng.gen_bool(self.config.loss_rate) {
            self.lost.push(envelope);
            return;
        }
        if self.rng.gen_bool(self.config.dup_rate) {
            self.in_flight.push_back(envelope.clone());
        }
        if !self.in_flight.is_empty() && self.rng.gen_bool(self.config.reorder_rate) {
            let pos = self.rng.gen_range(0..self.in_flight.len());
            self.in_flight.insert(pos, envelope);
        } else {
            self.in_flight.push_back(envelope);
        }
    }

    pub fn receive(&mut self) -> Option<Envelope> {
        self.in_flight.pop_front()
    }

    /// Put every lost message back in flight.
    pub fn retransmit_lost(&mut self) {
        self.in_flight.extend(self.lost.drain(..));
    }

    pub fn is_empty(&self) -> bool {
        self.in_flight.is_empty()
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    pub fn lost_count(&self) -> usize {
        self.lost.len()
    }
}

/// Sync coordinator for a set of peers sharing one simulated network.
#[derive(Debug)]
pub struct SyncCluster {
    peers: Vec<SyncPeer>,
    network: NetworkSimulator,
}

impl SyncCluster {
    /// `n` peers with client ids `1..=n`.
    pub fn new(n: usize, config: NetworkConfig) -> Self {
        let peers = (0..n)
            .map(|i| {
                SyncPeer::new(
                    PeerId::new(format!("peer_{i}")),
                    DocOptions::builder().client_id(i as u64 + 1).build(),
                )
            })
            .collect();
        Self {
            peers,
            network: NetworkSimulator::new(config),
        }
    }

    pub fn peer(&self, idx: usize) -> &SyncPeer {
        &self.peers[idx]
    }

    pub fn peer_mut(&mut self, idx: usize) -> &mut SyncPeer {
        &mut self.peers[idx]
    }

    pub fn network(&self) -> &NetworkSimulator {
        &self.network
    }

    /// Run `f` against the document of peer `idx`.
    pub fn edit<F, R>(&mut self, idx: usize, f: F) -> R
    where
        F: FnOnce(&mut Doc) -> R,
    {
        f(self.peers[idx].doc_mut())
    }

    fn send(&mut self, from: usize, to: usize, message: &SyncMessage) {
        self.network.send(Envelope {
            from,
            to,
            payload: message.encode(),
        });
    }

    /// Send the queued local updates of peer `idx` to every other peer.
    pub fn broadcast(&mut self, idx: usize) {
        let outgoing = self.peers[idx].take_outgoing();
        for message in &outgoing {
            for to in 0..self.peers.len() {
                if to != idx {
                    self.send(idx, to, message);
                }
            }
        }
    }

    /// Open a handshake from one peer to another.
    pub fn initiate_sync(&mut self, from: usize, to: usize) {
        let step1 = self.peers[from].start_sync();
        self.send(from, to, &step1);
    }

    /// Deliver one message. Returns `false` once the network is empty.
    pub fn process_one(&mut self) -> Result<bool> {
        let Some(envelope) = self.network.receive() else {
            return Ok(false);
        };
        if envelope.to >= self.peers.len() || envelope.from >= self.peers.len() {
            return Err(SyncError::PeerNotFound(envelope.to.max(envelope.from)));
        }
        let message = SyncMessage::decode(&envelope.payload)?;
        let from_id = self.peers[envelope.from].id().clone();
        let reply = self.peers[envelope.to].receive(&from_id, message)?;
        if let Some(reply) = reply {
            self.send(envelope.to, envelope.from, &reply);
        }
        Ok(true)
    }

    pub fn drain_network(&mut self) -> Result<()> {
        while self.process_one()? {}
        Ok(())
    }

    /// Broadcast every peer's local updates, run a handshake between every
    /// ordered pair of peers and deliver everything.
    pub fn full_sync_round(&mut self) -> Result<()> {
        let n = self.peers.len();
        for idx in 0..n {
            self.broadcast(idx);
        }
        for from in 0..n {
            for to in 0..n {
                if from != to {
                    self.initiate_sync(from, to);
                }
            }
        }
        self.drain_network()
    }

    pub fn retransmit_and_process(&mut self) -> Result<()> {
        if self.network.lost_count() > 0 {
            debug!(lost = self.network.lost_count(), "retransmitting");
        }
        self.network.retransmit_lost();
        self.drain_network()
    }

    /// Every peer has integrated the same blocks and the same deletions.
    pub fn is_converged(&self) -> bool {
        let Some(first) = self.peers.first() else {
            return true;
        };
        let sv = first.doc().state_vector();
        let ds = DeleteSet::from_store(first.doc().store());
        self.peers.iter().skip(1).all(|peer| {
            let converged = peer.doc().state_vector() == sv
                && DeleteSet::from_store(peer.doc().store()) == ds;
            if !converged {
                warn!(peer = %peer.id(), "diverged from {}", first.id());
            }
            converged
        })
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use weft_core::SharedRef;

    #[test]
    fn test_network_simulator_basic() {
        let mut net = NetworkSimulator::new(NetworkConfig::default());
        net.send(Envelope {
            from: 0,
            to: 1,
            payload: vec![42],
        });
        assert_eq!(net.in_flight_count(), 1);
        assert_eq!(net.receive().unwrap().payload, vec![42]);
        assert!(net.is_empty());
    }

    #[test]
    fn test_lossy_network_keeps_lost_messages() {
        let mut net = NetworkSimulator::new(NetworkConfig::lossy(1.0));
        for i in 0..5 {
            net.send(Envelope {
                from: 0,
                to: 1,
                payload: vec![i],
            });
        }
        assert!(net.is_empty());
        assert_eq!(net.lost_count(), 5);
        net.retransmit_lost();
        assert_eq!(net.in_flight_count(), 5);
    }

    #[test]
    fn test_cluster_basic_convergence() {
        let mut cluster = SyncCluster::new(3, NetworkConfig::default());
        for i in 0..3 {
            cluster.edit(i, |doc| {
                let list = doc.get_array("list");
                let mut txn = doc.transact_mut();
                list.push_back(&mut txn, i as i64).unwrap();
            });
        }
        assert!(!cluster.is_converged());

        cluster.full_sync_round().unwrap();
        assert!(cluster.is_converged());
        for i in 0..3 {
            let doc = cluster.peer_mut(i).doc_mut();
            let list = doc.get_array("list");
            assert_eq!(list.len(&*doc), 3);
        }
    }

    #[test]
    fn test_message_to_unknown_peer_fails() {
        let mut cluster = SyncCluster::new(2, NetworkConfig::default());
        cluster.initiate_sync(0, 5);
        assert_eq!(cluster.process_one(), Err(SyncError::PeerNotFound(5)));
    }
}
