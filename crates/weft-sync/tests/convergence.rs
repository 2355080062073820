//! Convergence tests for replicated documents
//!
//! These tests verify that peers converge under various network conditions
//! including message loss, duplication, and reordering.

use proptest::prelude::*;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use weft_core::{Any, Doc, ReadTxn, SharedRef};
use weft_sync::{NetworkConfig, SyncCluster};

fn type_word(doc: &mut Doc, word: &str) {
    let text = doc.get_text("text");
    let len = text.len(&*doc);
    let mut txn = doc.transact_mut();
    text.insert(&mut txn, len, word).unwrap();
}

fn random_edit(doc: &mut Doc, rng: &mut StdRng) {
    let text = doc.get_text("text");
    let len = text.len(&*doc);
    let mut txn = doc.transact_mut();
    if len > 0 && rng.gen_bool(0.3) {
        let index = rng.gen_range(0..len);
        let n = rng.gen_range(1..=(len - index).min(4));
        text.remove_range(&mut txn, index, n).unwrap();
    } else {
        let index = rng.gen_range(0..=len);
        let ch = rng.gen_range(b'a'..=b'z') as char;
        text.insert(&mut txn, index, &ch.to_string()).unwrap();
    }
}

fn contents(cluster: &mut SyncCluster) -> Vec<String> {
    (0..cluster.len())
        .map(|i| {
            let doc = cluster.peer_mut(i).doc_mut();
            let text = doc.get_text("text");
            text.get_string(&*doc)
        })
        .collect()
}

fn sync_until_converged(cluster: &mut SyncCluster, max_rounds: usize) -> usize {
    let mut rounds = 0;
    while !cluster.is_converged() && rounds < max_rounds {
        cluster.full_sync_round().unwrap();
        cluster.retransmit_and_process().unwrap();
        rounds += 1;
    }
    rounds
}

// ============================================================================
// Network conditions
// ============================================================================

#[test]
fn test_convergence_perfect_network() {
    let mut cluster = SyncCluster::new(3, NetworkConfig::default());
    for i in 0..3 {
        cluster.edit(i, |doc| type_word(doc, &format!("<{i}>")));
    }
    cluster.full_sync_round().unwrap();

    assert!(cluster.is_converged());
    let texts = contents(&mut cluster);
    assert_eq!(texts[0].len(), 9);
    assert!(texts.iter().all(|t| *t == texts[0]));
}

#[test]
fn test_convergence_with_loss() {
    let mut cluster = SyncCluster::new(4, NetworkConfig::lossy(0.5));
    for i in 0..4 {
        cluster.edit(i, |doc| type_word(doc, "word "));
    }

    let rounds = sync_until_converged(&mut cluster, 50);
    assert!(cluster.is_converged(), "Failed to converge after {} rounds", rounds);
    let texts = contents(&mut cluster);
    assert_eq!(texts[0].len(), 20);
}

#[test]
fn test_convergence_with_duplication() {
    let mut cluster = SyncCluster::new(3, NetworkConfig::with_dups(0.8));
    for i in 0..3 {
        cluster.edit(i, |doc| {
            let map = doc.get_map("config");
            let mut txn = doc.transact_mut();
            map.insert(&mut txn, "owner", i as i64);
            map.insert(&mut txn, &format!("key{i}"), true);
        });
    }
    cluster.full_sync_round().unwrap();
    assert!(cluster.is_converged());

    let owners: Vec<_> = (0..3)
        .map(|i| {
            let doc = cluster.peer_mut(i).doc_mut();
            let map = doc.get_map("config");
            map.to_json(&*doc)
        })
        .collect();
    assert!(owners.iter().all(|o| *o == owners[0]));
    let Any::Map(entries) = &owners[0] else {
        panic!("expected a map, got {:?}", owners[0]);
    };
    assert_eq!(entries.len(), 4);
    // highest client id wins the concurrent write
    assert_eq!(owners[0].get("owner"), Some(&Any::Int(2)));
}

#[test]
fn test_convergence_with_reordering() {
    let mut cluster = SyncCluster::new(3, NetworkConfig::reordering(0.9).seed(7));
    let mut rng = StdRng::seed_from_u64(7);
    for _ in 0..10 {
        for i in 0..3 {
            cluster.edit(i, |doc| random_edit(doc, &mut rng));
            cluster.broadcast(i);
        }
    }
    cluster.drain_network().unwrap();

    // reordered incremental updates may still wait on each other
    sync_until_converged(&mut cluster, 10);
    assert!(cluster.is_converged());
    let texts = contents(&mut cluster);
    assert!(texts.iter().all(|t| *t == texts[0]));
    for i in 0..3 {
        assert!(cluster.peer(i).doc().store().pending().is_none());
    }
}

#[test]
fn test_convergence_chaotic_network() {
    let mut cluster = SyncCluster::new(4, NetworkConfig::chaotic());
    let mut rng = StdRng::seed_from_u64(42);
    for round in 0..5 {
        for i in 0..4 {
            for _ in 0..5 {
                cluster.edit(i, |doc| random_edit(doc, &mut rng));
            }
        }
        if round % 2 == 0 {
            cluster.full_sync_round().unwrap();
        }
    }

    let rounds = sync_until_converged(&mut cluster, 20);
    assert!(cluster.is_converged(), "Failed to converge after {} rounds", rounds);
    let texts = contents(&mut cluster);
    assert!(texts.iter().all(|t| *t == texts[0]));
}

#[test]
fn test_idempotence_repeated_rounds() {
    let mut cluster = SyncCluster::new(2, NetworkConfig::default());
    cluster.edit(0, |doc| type_word(doc, "once"));

    cluster.full_sync_round().unwrap();
    let after_one = contents(&mut cluster);
    let sv_after_one = cluster.peer(1).doc().state_vector();

    for _ in 0..10 {
        cluster.full_sync_round().unwrap();
    }
    assert_eq!(contents(&mut cluster), after_one);
    assert_eq!(cluster.peer(1).doc().state_vector(), sv_after_one);
    assert_eq!(after_one[1], "once");
}

// ============================================================================
// Randomized
// ============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn peers_converge_under_random_faults(
        seed in any::<u64>(),
        loss in 0.0f64..0.5,
        dup in 0.0f64..0.5,
        reorder in 0.0f64..0.9,
        edits in 1usize..30,
    ) {
        let config = NetworkConfig { loss_rate: loss, dup_rate: dup, reorder_rate: reorder, seed };
        let mut cluster = SyncCluster::new(3, config);
        let mut rng = StdRng::seed_from_u64(seed);
        for _ in 0..edits {
            let i = rng.gen_range(0..3);
            cluster.edit(i, |doc| random_edit(doc, &mut rng));
            if rng.gen_bool(0.3) {
                cluster.broadcast(i);
                cluster.drain_network().unwrap();
            }
        }
        sync_until_converged(&mut cluster, 30);
        prop_assert!(cluster.is_converged());
        let texts = contents(&mut cluster);
        prop_assert!(texts.iter().all(|t| *t == texts[0]));
    }
}
