use async_stream::stream;
use futures::stream::Stream;
use futures::stream::StreamExt;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, warn};
use weft_core::{DocOptions, ReadTxn, SharedRef};
use weft_sync::{NetworkConfig, PeerId, SyncCluster, SyncPeer};

/// Parameters of one stress run.
#[derive(Clone, Debug)]
pub struct StressConfig {
    pub num_replicas: usize,
    pub ops_per_replica: usize,
    pub num_syncs: usize,
    /// Fixed seed for reproducible runs; random when `None`.
    pub seed: Option<u64>,
}

impl StressConfig {
    pub fn new(num_replicas: usize, ops_per_replica: usize, num_syncs: usize) -> Self {
        Self {
            num_replicas,
            ops_per_replica,
            num_syncs,
            seed: None,
        }
    }

    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    fn rng(&self, stream: u64) -> StdRng {
        match self.seed {
            Some(seed) => StdRng::seed_from_u64(seed.wrapping_add(stream)),
            None => StdRng::from_entropy(),
        }
    }
}

/// Statistics collected during stress testing
#[derive(Clone, Debug)]
pub struct StressTestStats {
    pub num_replicas: usize,
    pub operations_per_replica: usize,
    pub total_syncs: usize,
    pub total_time: Duration,
    pub avg_sync_time: Duration,
    pub ops_per_second: f64,
    pub document_length: u64,
    pub converged: bool,
}

impl StressTestStats {
    pub fn print(&self) {
        println!("\n╔════════════════════════════════════════════════════════════╗");
        println!("║              Stress Test Statistics                         ║");
        println!("╠════════════════════════════════════════════════════════════╣");
        println!("║  Number of Replicas:        {:>38} ║", self.num_replicas);
        println!("║  Operations per Replica:    {:>38} ║", self.operations_per_replica);
        println!("║  Total Sync Operations:     {:>38} ║", self.total_syncs);
        println!("║  Total Time:                {:>39}s ║", format!("{:.3}", self.total_time.as_secs_f64()));
        println!("║  Average Sync Time:         {:>36}µs ║", format!("{:.2}", self.avg_sync_time.as_micros()));
        println!("║  Operations/Second:         {:>38.0} ║", self.ops_per_second);
        println!("║  Final Document Length:     {:>38} ║", self.document_length);
        println!("║  Converged:                 {:>38} ║", self.converged);
        println!("╚════════════════════════════════════════════════════════════╝");
    }
}

type Replica = Arc<Mutex<SyncPeer>>;

/// Generator that yields replica indices for synchronization patterns
fn replica_sync_generator(num_replicas: usize, num_syncs: usize, mut rng: StdRng) -> impl Stream<Item = (usize, usize)> {
    stream! {
        for _ in 0..num_syncs {
            let replica_a = rng.gen_range(0..num_replicas);
            let replica_b = rng.gen_range(0..num_replicas);
            yield (replica_a, replica_b);
        }
    }
}

/// One random edit: mostly typing into the shared text, sometimes deleting
/// a few characters or writing a map entry.
fn random_edit(peer: &mut SyncPeer, replica_idx: usize, op: usize, rng: &mut StdRng) {
    let doc = peer.doc_mut();
    let text = doc.get_text("text");
    let meta = doc.get_map("meta");
    let len = text.len(&*doc);
    let mut txn = doc.transact_mut();
    let roll: f64 = rng.gen();
    let result = if roll < 0.2 && len > 0 {
        let index = rng.gen_range(0..len);
        let n = rng.gen_range(1..=(len - index).min(5));
        text.remove_range(&mut txn, index, n)
    } else if roll < 0.3 {
        meta.insert(&mut txn, &format!("cursor_{replica_idx}"), op as i64);
        Ok(())
    } else {
        let index = rng.gen_range(0..=len);
        let ch = rng.gen_range(b'a'..=b'z') as char;
        text.insert(&mut txn, index, &ch.to_string())
    };
    if let Err(err) = result {
        warn!(replica = replica_idx, %err, "edit rejected");
    }
}

/// Step 1 from `from`, step 2 back from `to`.
fn handshake(from: &mut SyncPeer, to: &mut SyncPeer) {
    let step1 = from.start_sync();
    match to.receive(from.id(), step1) {
        Ok(Some(reply)) => {
            if let Err(err) = from.receive(to.id(), reply) {
                warn!(%err, "sync step 2 failed");
            }
        }
        Ok(None) => {}
        Err(err) => warn!(%err, "sync step 1 failed"),
    }
}

/// Run the sync handshake in both directions between two replicas.
async fn perform_sync(
    replicas: &[Replica],
    replica_a_idx: usize,
    replica_b_idx: usize,
    num_syncs: usize,
    sync_times: &mut Vec<Duration>,
    total_syncs: &mut usize,
) {
    if replica_a_idx == replica_b_idx {
        return; // Skip self-sync
    }

    let sync_start = Instant::now();

    let replica_a = Arc::clone(&replicas[replica_a_idx]);
    let replica_b = Arc::clone(&replicas[replica_b_idx]);
    let (mut peer_a, mut peer_b) = tokio::join!(replica_a.lock(), replica_b.lock());

    handshake(&mut peer_a, &mut peer_b);
    handshake(&mut peer_b, &mut peer_a);
    drop(peer_a);
    drop(peer_b);

    let sync_duration = sync_start.elapsed();
    sync_times.push(sync_duration);
    *total_syncs += 1;

    if *total_syncs % 100 == 0 {
        println!("  Syncs completed: {}/{}", total_syncs, num_syncs);
    }
}

/// Sync every pair once so every replica has seen every edit, then compare.
async fn verify_convergence(replicas: &[Replica], sync_times: &mut Vec<Duration>, total_syncs: &mut usize) -> (bool, u64) {
    let n = replicas.len();
    for a in 0..n {
        for b in (a + 1)..n {
            perform_sync(replicas, a, b, 0, sync_times, total_syncs).await;
        }
    }
    // a second sweep carries edits that reached a replica late in the first
    for a in 0..n {
        for b in (a + 1)..n {
            perform_sync(replicas, a, b, 0, sync_times, total_syncs).await;
        }
    }

    let mut reference = None;
    let mut converged = true;
    let mut length = 0;
    for (idx, replica) in replicas.iter().enumerate() {
        let mut peer = replica.lock().await;
        let doc = peer.doc_mut();
        let text = doc.get_text("text");
        let state = (doc.state_vector(), text.get_string(&*doc));
        length = text.len(&*doc);
        match &reference {
            None => reference = Some(state),
            Some(expected) if *expected != state => {
                warn!(replica = idx, "replica diverged");
                converged = false;
            }
            Some(_) => {}
        }
    }
    (converged, length)
}

/// Stress test: concurrent random edits on every replica, then random
/// pairwise syncs, then a final full sync and a convergence check.
pub async fn stress_test_text(config: StressConfig) -> StressTestStats {
    let StressConfig {
        num_replicas,
        ops_per_replica,
        num_syncs,
        ..
    } = config;
    println!("\n╔════════════════════════════════════════════════════════════╗");
    println!("║        Text Stress Test (Async)                            ║");
    println!("║  Replicas: {} | Ops/Replica: {} | Syncs: {} ║",
             num_replicas, ops_per_replica, num_syncs);
    println!("╚════════════════════════════════════════════════════════════╝");

    let start = Instant::now();

    let replicas: Vec<Replica> = (0..num_replicas)
        .map(|idx| {
            let options = DocOptions::builder().client_id(idx as u64 + 1).build();
            Arc::new(Mutex::new(SyncPeer::new(PeerId::new(format!("replica_{idx}")), options)))
        })
        .collect();

    println!("\n[Phase 1/3] Editing replicas...");

    let mut handles = vec![];
    for (idx, replica) in replicas.iter().enumerate() {
        let replica = Arc::clone(replica);
        let mut rng = config.rng(idx as u64);
        let handle = tokio::spawn(async move {
            for i in 0..ops_per_replica {
                let mut peer = replica.lock().await;
                random_edit(&mut peer, idx, i, &mut rng);
                // local updates go out through the handshake instead
                peer.take_outgoing();
                drop(peer);

                if i % 100 == 0 {
                    tokio::task::yield_now().await;
                }
            }
        });
        handles.push(handle);
    }
    for handle in handles {
        if let Err(err) = handle.await {
            warn!(%err, "editing task failed");
        }
    }

    println!("[Phase 1/3] ✓ Completed");
    println!("[Phase 2/3] Synchronizing replicas...");

    let mut sync_times = vec![];
    let mut sync_gen = Box::pin(replica_sync_generator(num_replicas, num_syncs, config.rng(u64::MAX)));

    let mut total_syncs = 0;
    while let Some((replica_a_idx, replica_b_idx)) = sync_gen.next().await {
        perform_sync(
            &replicas,
            replica_a_idx,
            replica_b_idx,
            num_syncs,
            &mut sync_times,
            &mut total_syncs,
        ).await;
    }

    println!("[Phase 2/3] ✓ Completed");
    println!("[Phase 3/3] Verifying convergence...");

    let (converged, document_length) = verify_convergence(&replicas, &mut sync_times, &mut total_syncs).await;
    let total_time = start.elapsed();

    let avg_sync_time = if !sync_times.is_empty() {
        sync_times.iter().sum::<Duration>() / sync_times.len() as u32
    } else {
        Duration::ZERO
    };

    let total_operations = (num_replicas * ops_per_replica) + total_syncs;
    let ops_per_second = total_operations as f64 / total_time.as_secs_f64();

    println!("[Phase 3/3] ✓ Completed");

    StressTestStats {
        num_replicas,
        operations_per_replica: ops_per_replica,
        total_syncs,
        total_time,
        avg_sync_time,
        ops_per_second,
        document_length,
        converged,
    }
}

/// Random edits on a simulated lossy network; returns the rounds needed to
/// converge, or `None` if the cluster did not converge in `max_rounds`.
pub fn network_simulation(num_replicas: usize, edits: usize, config: NetworkConfig, max_rounds: usize) -> Option<usize> {
    println!("\n╔════════════════════════════════════════════════════════════╗");
    println!("║        Network Simulation                                  ║");
    println!("║  Replicas: {} | Edits: {} | {:?}", num_replicas, edits, config);
    println!("╚════════════════════════════════════════════════════════════╝");

    let mut rng = StdRng::seed_from_u64(config.seed);
    let mut cluster = SyncCluster::new(num_replicas, config);
    for op in 0..edits {
        let idx = rng.gen_range(0..num_replicas);
        random_edit(cluster.peer_mut(idx), idx, op, &mut rng);
        if rng.gen_bool(0.2) {
            cluster.broadcast(idx);
        }
    }

    for round in 1..=max_rounds {
        let synced = cluster
            .full_sync_round()
            .and_then(|_| cluster.retransmit_and_process());
        if let Err(err) = synced {
            warn!(%err, "sync round failed");
            return None;
        }
        debug!(round, in_flight = cluster.network().in_flight_count(), "sync round done");
        if cluster.is_converged() {
            println!("  ✓ Converged after {} round(s)", round);
            return Some(round);
        }
    }
    println!("  ✗ Did not converge after {} rounds", max_rounds);
    None
}

/// Stress runs with a growing number of replicas
pub async fn stress_test_scaling(max_replicas: usize, step_size: usize) {
    println!("\n╔════════════════════════════════════════════════════════════╗");
    println!("║      Scaling Analysis - Text Performance vs Replicas       ║");
    println!("╚════════════════════════════════════════════════════════════╝");

    let mut current_replicas = step_size;
    while current_replicas <= max_replicas {
        let stats = stress_test_text(StressConfig::new(current_replicas, 50, current_replicas * 20)).await;
        stats.print();
        current_replicas += step_size;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_small_run_converges() {
        let stats = stress_test_text(StressConfig::new(3, 40, 20).seed(1)).await;
        assert!(stats.converged);
        assert_eq!(stats.num_replicas, 3);
    }

    #[test]
    fn test_network_simulation_converges() {
        let rounds = network_simulation(3, 60, NetworkConfig::chaotic().seed(3), 20);
        assert!(rounds.is_some());
    }
}
