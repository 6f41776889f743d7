// SPDX-FileCopyrightText: 2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::collections::BTreeSet;

use assert_matches::assert_matches;
use aupatch::format::extent::{self, ExtentRanges, SPARSE_HOLE, new_extent};
use rand::{Rng, SeedableRng, rngs::StdRng};

/// Check that the ranges are sorted, disjoint, non-adjacent, and cover
/// exactly the blocks in `model`.
fn check_normalized(ranges: &ExtentRanges, model: &BTreeSet<u64>) {
    let extents = ranges.extents();

    for pair in extents.windows(2) {
        assert!(
            pair[0].start_block() + pair[0].num_blocks() < pair[1].start_block(),
            "Not normalized: {}",
            extent::extents_to_string(&extents),
        );
    }

    let blocks = extents
        .iter()
        .flat_map(|e| e.start_block()..e.start_block() + e.num_blocks())
        .collect::<BTreeSet<_>>();

    assert_eq!(&blocks, model);
    assert_eq!(ranges.blocks(), model.len() as u64);
    assert_eq!(ranges.is_empty(), model.is_empty());
}

#[test]
fn random_operations_match_model() {
    let mut rng = StdRng::seed_from_u64(0x5eed);
    let mut ranges = ExtentRanges::new();
    let mut model = BTreeSet::new();

    for _ in 0..2000 {
        let start = rng.gen_range(0..200u64);
        let num_blocks = rng.gen_range(0..12u64);
        let extent = new_extent(start, num_blocks);

        if rng.gen_bool(0.6) {
            ranges.add_extent(&extent);
            model.extend(start..start + num_blocks);
        } else {
            ranges.subtract_extent(&extent);
            for block in start..start + num_blocks {
                model.remove(&block);
            }
        }

        check_normalized(&ranges, &model);
    }

    for block in 0..220 {
        assert_eq!(ranges.contains_block(block), model.contains(&block), "block {block}");
    }
}

#[test]
fn add_then_subtract_is_identity() {
    let mut rng = StdRng::seed_from_u64(1);

    for _ in 0..100 {
        let mut base = ExtentRanges::new();
        for _ in 0..10 {
            base.add_extent(&new_extent(rng.gen_range(0..500), rng.gen_range(1..20)));
        }

        let extent = new_extent(rng.gen_range(0..500), rng.gen_range(1..20));
        let disjoint = {
            let mut other = ExtentRanges::new();
            other.add_extent(&extent);
            base.intersect(&other).is_empty()
        };

        let mut ranges = base.clone();
        ranges.add_extent(&extent);
        ranges.subtract_extent(&extent);

        if disjoint {
            assert_eq!(ranges, base);
        } else {
            assert!(ranges.blocks() < base.blocks());
        }
    }
}

#[test]
fn set_algebra() {
    let mut rng = StdRng::seed_from_u64(2);

    for _ in 0..100 {
        let mut a = ExtentRanges::new();
        let mut b = ExtentRanges::new();
        for _ in 0..8 {
            a.add_extent(&new_extent(rng.gen_range(0..300), rng.gen_range(1..30)));
            b.add_extent(&new_extent(rng.gen_range(0..300), rng.gen_range(1..30)));
        }

        let intersection = a.intersect(&b);
        assert_eq!(intersection, b.intersect(&a));

        let mut union = a.clone();
        union.add_ranges(&b);
        assert_eq!(
            union.blocks(),
            a.blocks() + b.blocks() - intersection.blocks(),
        );

        let mut difference = a.clone();
        difference.subtract_ranges(&b);
        assert!(difference.intersect(&b).is_empty());
        assert_eq!(difference.blocks(), a.blocks() - intersection.blocks());
    }
}

#[test]
fn merges_adjacent_extents() {
    let mut ranges = ExtentRanges::new();
    ranges.add_extent(&new_extent(10, 5));
    ranges.add_extent(&new_extent(0, 5));
    ranges.add_extent(&new_extent(5, 5));

    assert_eq!(ranges.extents(), vec![new_extent(0, 15)]);

    ranges.subtract_block(7);
    assert_eq!(ranges.extents(), vec![new_extent(0, 7), new_extent(8, 7)]);

    ranges.add_block(7);
    assert_eq!(ranges.extents(), vec![new_extent(0, 15)]);
}

#[test]
fn sparse_holes_are_ignored() {
    let mut ranges = ExtentRanges::from_extents(&[new_extent(SPARSE_HOLE, 4), new_extent(3, 2)]);
    assert_eq!(ranges.extents(), vec![new_extent(3, 2)]);

    ranges.subtract_extent(&new_extent(SPARSE_HOLE, 10));
    assert_eq!(ranges.blocks(), 2);
}

#[test]
fn extents_for_block_count() {
    let ranges = ExtentRanges::from_extents(&[new_extent(0, 3), new_extent(10, 3), new_extent(20, 3)]);

    assert_eq!(ranges.extents_for_block_count(0).unwrap(), vec![]);
    assert_eq!(
        ranges.extents_for_block_count(5).unwrap(),
        vec![new_extent(0, 3), new_extent(10, 2)],
    );
    assert_eq!(ranges.extents_for_block_count(9).unwrap(), ranges.extents());
    assert_matches!(
        ranges.extents_for_block_count(10),
        Err(extent::Error::InsufficientBlocks {
            requested: 10,
            available: 9,
        })
    );
}

#[test]
fn idempotence() {
    // Unchanged blocks.
    assert!(extent::is_idempotent(&[new_extent(0, 4)], &[new_extent(0, 4)]));
    // Source contained in destination.
    assert!(extent::is_idempotent(&[new_extent(1, 2)], &[new_extent(0, 4)]));
    // No source at all.
    assert!(extent::is_idempotent(&[], &[new_extent(0, 4)]));
    // Source blocks outside of the destination.
    assert!(!extent::is_idempotent(&[new_extent(0, 2)], &[new_extent(1, 2)]));
    assert!(!extent::is_idempotent(&[new_extent(0, 2)], &[new_extent(5, 2)]));
}
