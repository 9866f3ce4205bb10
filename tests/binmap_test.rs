//! Binmap invariants checked against a naive set model.
//!
//! Run with: cargo test --test binmap_test

use proptest::prelude::*;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::collections::BTreeSet;

use tswift::bin::Bin;
use tswift::binmap::Binmap;

const CHUNKS: u64 = 256;

/// Naive reference: the set of filled base bins.
#[derive(Default)]
struct Model {
    filled: BTreeSet<u64>,
}

impl Model {
    fn set(&mut self, bin: Bin) {
        for c in bin.base_offset()..bin.base_offset() + bin.base_length() {
            self.filled.insert(c);
        }
    }

    fn reset(&mut self, bin: Bin) {
        for c in bin.base_offset()..bin.base_offset() + bin.base_length() {
            self.filled.remove(&c);
        }
    }

    fn is_filled(&self, bin: Bin) -> bool {
        (bin.base_offset()..bin.base_offset() + bin.base_length())
            .all(|c| self.filled.contains(&c))
    }

    fn is_empty(&self, bin: Bin) -> bool {
        (bin.base_offset()..bin.base_offset() + bin.base_length())
            .all(|c| !self.filled.contains(&c))
    }
}

fn arbitrary_bin(rng: &mut ChaCha8Rng) -> Bin {
    let layer = rng.gen_range(0..6);
    let offset = rng.gen_range(0..(CHUNKS >> layer).max(1));
    Bin::new(layer, offset)
}

#[test]
fn test_random_set_reset_matches_model() {
    let mut rng = ChaCha8Rng::seed_from_u64(0x5717);
    for _round in 0..50 {
        let mut map = Binmap::new();
        let mut model = Model::default();
        for _op in 0..200 {
            let bin = arbitrary_bin(&mut rng);
            if rng.gen_bool(0.6) {
                map.set(bin);
                model.set(bin);
            } else {
                map.reset(bin);
                model.reset(bin);
            }
            // Spot-check a handful of random bins after each mutation.
            for _ in 0..8 {
                let probe = arbitrary_bin(&mut rng);
                assert_eq!(map.is_filled_in(probe), model.is_filled(probe), "filled {probe}");
                assert_eq!(map.is_empty_in(probe), model.is_empty(probe), "empty {probe}");
            }
        }
    }
}

#[test]
fn test_find_complement_postconditions_random() {
    let mut rng = ChaCha8Rng::seed_from_u64(0xB1A5);
    for _round in 0..100 {
        let mut d = Binmap::new();
        let mut s = Binmap::new();
        let mut dm = Model::default();
        let mut sm = Model::default();
        for _ in 0..40 {
            let b = arbitrary_bin(&mut rng);
            if rng.gen_bool(0.5) {
                s.set(b);
                sm.set(b);
            } else {
                d.set(b);
                dm.set(b);
            }
        }
        let range = if rng.gen_bool(0.5) {
            Bin::ALL
        } else {
            let layer = rng.gen_range(3..9);
            Bin::new(layer, rng.gen_range(0..(CHUNKS >> layer.min(8)).max(1)))
        };
        let twist = rng.gen::<u64>() & 63;

        let got = Binmap::find_complement_in(&d, &s, range, twist);

        // Exhaustive truth over the model.
        let exists = (0..CHUNKS)
            .map(Bin::chunk)
            .any(|c| range.contains(c) && sm.is_filled(c) && !dm.is_filled(c));
        if got.is_none() {
            assert!(!exists, "complement missed (range {range} twist {twist})");
        } else {
            assert!(range.contains(got), "result {got} outside {range}");
            assert!(s.is_filled_in(got), "result {got} not in source");
            assert!(d.is_empty_in(got), "result {got} not empty in dest");
        }
    }
}

#[test]
fn test_complement_none_iff_every_base_covered() {
    // Universal invariant: NONE iff every base bin in range is either
    // absent from S or present in D.
    let mut s = Binmap::new();
    let mut d = Binmap::new();
    for i in 0..32 {
        s.set(Bin::chunk(i));
    }
    for i in 0..32 {
        d.set(Bin::chunk(i));
    }
    assert!(Binmap::find_complement(&d, &s, 0).is_none());
    d.reset(Bin::chunk(17));
    let got = Binmap::find_complement(&d, &s, 0);
    assert_eq!(got, Bin::chunk(17));
}

proptest! {
    #[test]
    fn prop_set_then_filled(layer in 0u32..6, offset in 0u64..64) {
        let bin = Bin::new(layer, offset);
        let mut map = Binmap::new();
        map.set(bin);
        prop_assert!(map.is_filled_in(bin));
        // All sub-bins report consistently.
        prop_assert!(map.is_filled_in(bin.base_left()));
        prop_assert!(map.is_filled_in(bin.base_right()));
        prop_assert_eq!(map.find_filled(), bin.base_left());
    }

    #[test]
    fn prop_reset_after_set_is_empty(layer in 0u32..6, offset in 0u64..64) {
        let bin = Bin::new(layer, offset);
        let mut map = Binmap::new();
        map.set(bin);
        map.reset(bin);
        prop_assert!(map.is_empty_in(bin));
        prop_assert!(map.is_empty());
    }

    #[test]
    fn prop_twist_preserves_membership(twist in 0u64..64) {
        // Whatever the twist, the result must satisfy the contract.
        let mut s = Binmap::new();
        let mut d = Binmap::new();
        for i in [3u64, 9, 12, 13, 31, 40] {
            s.set(Bin::chunk(i));
        }
        d.set(Bin::chunk(9));
        let got = Binmap::find_complement(&d, &s, twist);
        prop_assert!(!got.is_none());
        prop_assert!(s.is_filled_in(got));
        prop_assert!(d.is_empty_in(got));
    }

    #[test]
    fn prop_serialize_roundtrip(seed in 0u64..5000) {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let mut map = Binmap::new();
        for _ in 0..30 {
            let b = arbitrary_bin(&mut rng);
            if rng.gen_bool(0.7) {
                map.set(b);
            } else {
                map.reset(b);
            }
        }
        let mut buf = Vec::new();
        map.serialize(&mut buf).unwrap();
        let mut rd = std::io::BufReader::new(&buf[..]);
        let back = Binmap::deserialize(&mut rd).unwrap();
        for c in 0..CHUNKS {
            prop_assert_eq!(
                map.is_filled_in(Bin::chunk(c)),
                back.is_filled_in(Bin::chunk(c))
            );
        }
    }
}

#[test]
fn test_cover_solid_regions() {
    let mut map = Binmap::new();
    for i in 0..8 {
        map.set(Bin::chunk(i));
    }
    for i in 12..16 {
        map.set(Bin::chunk(i));
    }
    assert_eq!(map.cover(Bin::chunk(3)), Bin::new(3, 0));
    assert_eq!(map.cover(Bin::chunk(13)), Bin::new(2, 3));
    assert_eq!(map.cover(Bin::chunk(9)), Bin::new(2, 2));
    // Straddling bins are not solid.
    assert_eq!(map.cover(Bin::new(3, 1)), Bin::NONE);
}

#[test]
fn test_find_empty_from_walks_right() {
    let mut map = Binmap::new();
    for i in 0..10 {
        map.set(Bin::chunk(i));
    }
    map.set(Bin::chunk(11));
    assert_eq!(map.find_empty_from(Bin::chunk(0)), Bin::chunk(10));
    assert_eq!(map.find_empty_from(Bin::chunk(10)), Bin::chunk(10));
    assert_eq!(map.find_empty_from(Bin::chunk(11)), Bin::chunk(12));
}
