//! Static hash tree: the 4100-byte reference swarm, sidecar checkpoints
//! and zero-state reads.
//!
//! Run with: cargo test --test hashtree_test

use std::fs;
use std::path::PathBuf;

use tswift::bin::Bin;
use tswift::hashtree::HashTree;
use tswift::storage::Storage;

fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .try_init();
}

fn temp_dir(tag: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("tswift_ht_{tag}_{}", std::process::id()));
    let _ = fs::remove_dir_all(&dir);
    fs::create_dir_all(&dir).unwrap();
    dir
}

/// 4100 bytes, 1024-byte chunks: 5 chunks, peaks (2,0) and (0,4).
fn reference_content() -> Vec<u8> {
    (0..4100u32).map(|i| (i * 7 + 3) as u8).collect()
}

fn seeder(dir: &PathBuf) -> (HashTree, Storage) {
    let path = dir.join("content.dat");
    fs::write(&path, reference_content()).unwrap();
    let mut storage = Storage::open(&path, dir, 0).unwrap();
    let tree = HashTree::create_from_storage(&mut storage, 4100, 1024).unwrap();
    (tree, storage)
}

#[test]
fn test_reference_swarm_shape() {
    init_logging();
    let dir = temp_dir("shape");
    let (tree, _storage) = seeder(&dir);
    assert_eq!(tree.size(), 4100);
    assert_eq!(tree.size_in_chunks(), 5);
    assert_eq!(tree.peak_count(), 2);
    assert_eq!(tree.peak(0), Bin::new(2, 0));
    assert_eq!(tree.peak(1), Bin::new(0, 4));
    assert!(tree.is_complete());
    assert!(!tree.root_hash().is_zero());
}

/// Feed a cold client peaks, uncles and chunks; it must converge to the
/// seeder's bytes, and a flipped byte must bounce.
#[test]
fn test_cold_client_round_trip() {
    init_logging();
    let dir = temp_dir("client");
    let (src, mut src_storage) = seeder(&dir);
    let content = reference_content();

    let dst_path = dir.join("leeched.dat");
    let mut dst_storage = Storage::open(&dst_path, &dir, 0).unwrap();
    let mut dst = HashTree::new_client(*src.root_hash(), 1024);
    assert_eq!(dst.size(), 0);

    // Peaks first: size becomes known.
    for i in 0..src.peak_count() {
        dst.offer_hash(src.peak(i), src.peak_hash(i));
    }
    assert_eq!(dst.size_in_chunks(), 5);
    assert_eq!(dst.size(), 5 * 1024); // rounded until the short tail lands

    for c in 0..5u64 {
        let pos = Bin::chunk(c);
        for (uncle, hash) in src.uncle_chain(pos, |_| false) {
            dst.offer_hash(uncle, hash);
        }
        let off = (c * 1024) as usize;
        let end = content.len().min(off + 1024);
        let chunk = &content[off..end];

        if c == 2 {
            // Integrity: a flipped byte must be rejected and leave no state.
            let mut bad = chunk.to_vec();
            bad[100] ^= 0x40;
            assert!(!dst.offer_data(pos, &bad, &mut dst_storage).unwrap());
            assert!(dst.ack_out().is_empty_in(pos));
        }
        assert!(dst.offer_data(pos, chunk, &mut dst_storage).unwrap());
        assert!(dst.ack_out().is_filled_in(pos));
        // seq_complete is non-decreasing and bounded by complete.
        assert!(dst.seq_complete(0) <= dst.complete());
    }

    assert_eq!(dst.size(), 4100);
    assert_eq!(dst.complete(), 4100);
    assert_eq!(dst.seq_complete(0), 4100);
    assert!(dst.is_complete());

    // Bytes on disk equal the seeder's.
    let mut buf = vec![0u8; 4100];
    dst_storage.read(&mut buf, 0).unwrap();
    let mut src_buf = vec![0u8; 4100];
    src_storage.read(&mut src_buf, 0).unwrap();
    assert_eq!(buf, src_buf);
}

#[test]
fn test_out_of_order_chunks_verify() {
    init_logging();
    let dir = temp_dir("ooo");
    let (src, _s) = seeder(&dir);
    let content = reference_content();

    let dst_path = dir.join("ooo.dat");
    let mut dst_storage = Storage::open(&dst_path, &dir, 0).unwrap();
    let mut dst = HashTree::new_client(*src.root_hash(), 1024);
    for i in 0..src.peak_count() {
        dst.offer_hash(src.peak(i), src.peak_hash(i));
    }
    // Chunk 0 settles the storage shape; the rest arrives backwards with
    // the uncle chain before each chunk.
    for c in [0u64, 4, 3, 2, 1] {
        let pos = Bin::chunk(c);
        for (uncle, hash) in src.uncle_chain(pos, |_| false) {
            dst.offer_hash(uncle, hash);
        }
        let off = (c * 1024) as usize;
        let end = content.len().min(off + 1024);
        assert!(
            dst.offer_data(pos, &content[off..end], &mut dst_storage).unwrap(),
            "chunk {c}"
        );
    }
    assert_eq!(dst.complete(), 4100);
}

#[test]
fn test_checkpoint_reload_and_zero_state() {
    init_logging();
    let dir = temp_dir("ckpt");
    let (tree, _storage) = seeder(&dir);
    let mhash = dir.join("content.dat.mhash");
    let mbinmap = dir.join("content.dat.mbinmap");
    tree.checkpoint(&mhash, &mbinmap).unwrap();

    let loaded = HashTree::load_checkpoint(tree.root_hash(), 1024, &mhash, &mbinmap)
        .expect("checkpoint loads");
    assert_eq!(loaded.size(), 4100);
    assert!(loaded.is_complete());
    assert_eq!(loaded.peak_hash(0), tree.peak_hash(0));

    // A wrong root refuses the checkpoint.
    let other = tswift::hashtree::Sha1Hash::from_bytes_digest(b"not it");
    assert!(HashTree::load_checkpoint(&other, 1024, &mhash, &mbinmap).is_none());

    // Zero-state serves the same hashes straight from disk.
    let zs = HashTree::open_zero_state(tree.root_hash(), 1024, &mhash, &mbinmap)
        .expect("zero-state opens");
    assert!(zs.is_zero_state());
    assert_eq!(zs.hash(Bin::new(2, 0)), tree.hash(Bin::new(2, 0)));
    assert_eq!(zs.hash(Bin::chunk(3)), tree.hash(Bin::chunk(3)));
    assert_eq!(zs.seq_complete(0), 4100);
}

#[test]
fn test_seq_complete_with_hole() {
    init_logging();
    let dir = temp_dir("hole");
    let (src, _s) = seeder(&dir);
    let content = reference_content();

    let mut dst_storage = Storage::open(&dir.join("hole.dat"), &dir, 0).unwrap();
    let mut dst = HashTree::new_client(*src.root_hash(), 1024);
    for i in 0..src.peak_count() {
        dst.offer_hash(src.peak(i), src.peak_hash(i));
    }
    // Deliver chunks 0, 1 and 3; the hole at 2 pins seq_complete.
    for c in [0u64, 1, 3] {
        let pos = Bin::chunk(c);
        for (uncle, hash) in src.uncle_chain(pos, |_| false) {
            dst.offer_hash(uncle, hash);
        }
        let off = (c * 1024) as usize;
        let end = content.len().min(off + 1024);
        assert!(dst.offer_data(pos, &content[off..end], &mut dst_storage).unwrap());
    }
    assert_eq!(dst.seq_complete(0), 2048);
    assert_eq!(dst.complete(), 3 * 1024);
    assert!(dst.seq_complete(0) <= dst.complete());
    assert!(dst.complete() <= dst.size());
}
