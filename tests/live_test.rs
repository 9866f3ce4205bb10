//! Live swarm chain: source signing, client verification, purge window.
//!
//! Run with: cargo test --test live_test

use std::fs;
use std::path::PathBuf;

use tswift::bin::Bin;
use tswift::livesig::KeyPair;
use tswift::livetree::{LiveHashTree, SignedMunro};
use tswift::storage::Storage;
use tswift::time::Tint;

fn temp_storage(tag: &str) -> Storage {
    let dir = std::env::temp_dir().join(format!("tswift_lv_{tag}_{}", std::process::id()));
    let _ = fs::remove_dir_all(&dir);
    fs::create_dir_all(&dir).unwrap();
    let path: PathBuf = dir.join("live.dat");
    Storage::open(&path, &dir, 0).unwrap()
}

fn chunk(i: u64) -> Vec<u8> {
    (0..64u64).map(|j| ((i * 64 + j) % 251) as u8).collect()
}

/// Feed a whole stream through munros and uncle chains; the client ends
/// with the source's leaves.
#[test]
fn test_stream_replication_in_order() {
    let kp = KeyPair::from_seed([21; 32]);
    let mut src = LiveHashTree::new_source(kp, 64, 4);
    let mut cli = LiveHashTree::new_client(src.pubkey().clone(), 64, 4);
    let mut src_store = temp_storage("src");
    let mut cli_store = temp_storage("cli");

    let mut now: Tint = 1_000_000;
    let mut munros: Vec<SignedMunro> = Vec::new();
    for i in 0..16u64 {
        now += 1000;
        src_store.write(&chunk(i), i * 64).unwrap();
        let (_, m) = src.add_data(&chunk(i), now);
        if let Some(m) = m {
            munros.push(m);
        }
    }
    assert_eq!(munros.len(), 4);
    // Munros march right, one per epoch, at the munro layer.
    for (n, m) in munros.iter().enumerate() {
        assert_eq!(m.bin, Bin::new(2, n as u64));
    }

    for m in &munros {
        cli.offer_hash(m.bin, m.hash).unwrap();
        assert!(cli
            .offer_signed_munro(m.bin, m.timestamp, m.signature.clone(), m.timestamp + 100)
            .unwrap());
        // Re-offering the same munro is a no-op, not an error.
        assert!(!cli
            .offer_signed_munro(m.bin, m.timestamp, m.signature.clone(), m.timestamp + 100)
            .unwrap());
    }

    for i in 0..16u64 {
        let pos = Bin::chunk(i);
        for (ub, uh) in src.uncle_chain(pos, |_| false) {
            cli.offer_hash(ub, uh).unwrap();
        }
        assert!(
            cli.offer_data(pos, &chunk(i), &mut cli_store).unwrap(),
            "chunk {i}"
        );
    }
    assert_eq!(cli.chunks_complete(), 16);

    // Client leaves equal source leaves, byte for byte.
    for i in 0..16u64 {
        let mut a = vec![0u8; 64];
        let mut b = vec![0u8; 64];
        src_store.read(&mut a, i * 64).unwrap();
        cli_store.read(&mut b, i * 64).unwrap();
        assert_eq!(a, b, "chunk {i}");
    }
}

/// A chunk is only deliverable after its covering munro verified.
#[test]
fn test_chunk_undeliverable_before_munro() {
    let kp = KeyPair::from_seed([22; 32]);
    let mut src = LiveHashTree::new_source(kp, 64, 4);
    let mut cli = LiveHashTree::new_client(src.pubkey().clone(), 64, 4);
    let mut store = temp_storage("early");

    let mut munro = None;
    for i in 0..8u64 {
        let (_, m) = src.add_data(&chunk(i), 500);
        if let Some(m) = m {
            munro.get_or_insert(m);
        }
    }
    // Uncles for chunk 0 without its munro: nothing to anchor trust to,
    // the chunk is not deliverable.
    for (ub, uh) in src.uncle_chain(Bin::chunk(0), |_| false) {
        cli.offer_hash(ub, uh).unwrap();
    }
    assert!(!cli.offer_data(Bin::chunk(0), &chunk(0), &mut store).unwrap());

    // Munro first, then uncles, as a sender orders them on the wire.
    let m = munro.unwrap();
    cli.offer_hash(m.bin, m.hash).unwrap();
    cli.offer_signed_munro(m.bin, m.timestamp, m.signature.clone(), 600)
        .unwrap();
    for (ub, uh) in src.uncle_chain(Bin::chunk(0), |_| false) {
        cli.offer_hash(ub, uh).unwrap();
    }
    assert!(cli.offer_data(Bin::chunk(0), &chunk(0), &mut store).unwrap());
}

/// The source checkpoint survives a restart round trip.
#[test]
fn test_source_checkpoint_roundtrip() {
    let dir = std::env::temp_dir().join(format!("tswift_lv_ckpt_{}", std::process::id()));
    let _ = fs::remove_dir_all(&dir);
    fs::create_dir_all(&dir).unwrap();
    let path = dir.join("live.checkpoint");

    let mut src = LiveHashTree::new_source(KeyPair::from_seed([23; 32]), 64, 4);
    for i in 0..8u64 {
        src.add_data(&chunk(i), 777);
    }
    src.write_checkpoint(&path).unwrap();

    let restored = LiveHashTree::read_checkpoint(&path).expect("checkpoint parses");
    assert_eq!(restored.bin, src.last_munro());
    assert_eq!(restored.timestamp, 777);
    let m = src.signed_munro(src.last_munro()).unwrap();
    assert_eq!(restored.hash, m.hash);
    assert_eq!(restored.signature, m.signature);
}

/// Purging the window drops old munros and nodes but keeps the head.
#[test]
fn test_window_purge_keeps_head() {
    let mut src = LiveHashTree::new_source(KeyPair::from_seed([24; 32]), 64, 4);
    for i in 0..32u64 {
        src.add_data(&chunk(i), 10);
    }
    assert_eq!(src.last_munro(), Bin::new(2, 7));
    src.purge_tree(Bin::chunk(16));
    assert_eq!(src.last_munro(), Bin::new(2, 7));
    assert!(src.signed_munro(Bin::new(2, 0)).is_none());
    assert!(src.signed_munro(Bin::new(2, 5)).is_some());
    assert!(src.ack_out().is_empty_in(Bin::chunk(2)));
    assert!(src.ack_out().is_filled_in(Bin::chunk(20)));
}
