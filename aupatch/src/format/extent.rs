// SPDX-FileCopyrightText: 2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::{collections::BTreeMap, fmt::Write};

use thiserror::Error;

use crate::protobuf::chromeos_update_engine::Extent;

/// Start block value for extents that are not backed by any physical blocks.
/// Writes to a sparse hole are discarded and reads produce zeros.
pub const SPARSE_HOLE: u64 = u64::MAX;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Requested {requested} blocks, but only {available} blocks are available")]
    InsufficientBlocks { requested: u64, available: u64 },
    #[error("Extents cover {actual} bytes, but expected {expected} bytes")]
    LengthMismatch { expected: u64, actual: u64 },
    #[error("Extent byte offset overflow: {value} * {block_size}")]
    Overflow { value: u64, block_size: u32 },
}

type Result<T> = std::result::Result<T, Error>;

pub fn new_extent(start_block: u64, num_blocks: u64) -> Extent {
    Extent {
        start_block: Some(start_block),
        num_blocks: Some(num_blocks),
    }
}

#[inline]
pub fn is_sparse(extent: &Extent) -> bool {
    extent.start_block() == SPARSE_HOLE
}

/// Sum of the block counts of all extents, including sparse holes.
pub fn total_blocks(extents: &[Extent]) -> u64 {
    extents
        .iter()
        .fold(0u64, |acc, e| acc.saturating_add(e.num_blocks()))
}

/// Check if two extents share at least one block. Sparse holes never overlap
/// anything.
pub fn extents_overlap(a: &Extent, b: &Extent) -> bool {
    if is_sparse(a) || is_sparse(b) {
        return false;
    }

    let a_end = a.start_block().saturating_add(a.num_blocks());
    let b_end = b.start_block().saturating_add(b.num_blocks());

    a.start_block() < b_end && b.start_block() < a_end
}

/// Like [`extents_overlap`], but also returns true if the extents are
/// adjacent.
pub fn extents_overlap_or_touch(a: &Extent, b: &Extent) -> bool {
    if is_sparse(a) || is_sparse(b) {
        return false;
    }

    let a_end = a.start_block().saturating_add(a.num_blocks());
    let b_end = b.start_block().saturating_add(b.num_blocks());

    a.start_block() <= b_end && b.start_block() <= a_end
}

/// Format extents for log messages.
pub fn extents_to_string(extents: &[Extent]) -> String {
    let mut result = String::new();

    for (i, extent) in extents.iter().enumerate() {
        if i > 0 {
            result.push_str(", ");
        }

        if is_sparse(extent) {
            let _ = write!(result, "(hole, {})", extent.num_blocks());
        } else {
            let _ = write!(
                result,
                "({}, {})",
                extent.start_block(),
                extent.num_blocks(),
            );
        }
    }

    result
}

/// Build the `offset:length,...` position string understood by bspatch. The
/// lengths are clamped so that they add up to exactly `length` bytes. Sparse
/// holes are encoded with an offset of `-1`.
pub fn extents_to_bsdiff_positions(
    extents: &[Extent],
    block_size: u32,
    length: u64,
) -> Result<String> {
    let mut result = String::new();
    let mut total = 0u64;

    for extent in extents {
        let extent_size = extent
            .num_blocks()
            .checked_mul(u64::from(block_size))
            .ok_or(Error::Overflow {
                value: extent.num_blocks(),
                block_size,
            })?;
        let n = (length - total).min(extent_size);

        if !result.is_empty() {
            result.push(',');
        }

        if is_sparse(extent) {
            let _ = write!(result, "-1:{n}");
        } else {
            let offset = extent
                .start_block()
                .checked_mul(u64::from(block_size))
                .ok_or(Error::Overflow {
                    value: extent.start_block(),
                    block_size,
                })?;
            let _ = write!(result, "{offset}:{n}");
        }

        total += n;
    }

    if total != length {
        return Err(Error::LengthMismatch {
            expected: length,
            actual: total,
        });
    }

    Ok(result)
}

/// Check if reading `src` and writing `dst` leaves no source block outside of
/// the destination set.
pub fn is_idempotent(src: &[Extent], dst: &[Extent]) -> bool {
    if src.is_empty() {
        return true;
    }

    let mut ranges = ExtentRanges::new();
    ranges.add_extents(src);
    ranges.subtract_extents(dst);

    ranges.blocks() == 0
}

/// A normalized set of block ranges. Ranges are always sorted, disjoint, and
/// never adjacent to each other.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ExtentRanges {
    /// Start block -> number of blocks.
    ranges: BTreeMap<u64, u64>,
    blocks: u64,
}

impl ExtentRanges {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_extents(extents: &[Extent]) -> Self {
        let mut result = Self::new();
        result.add_extents(extents);
        result
    }

    /// Total number of blocks in the set.
    pub fn blocks(&self) -> u64 {
        self.blocks
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    fn insert(&mut self, start: u64, num_blocks: u64) {
        debug_assert!(num_blocks > 0);

        self.ranges.insert(start, num_blocks);
        self.blocks += num_blocks;
    }

    fn remove(&mut self, start: u64) -> u64 {
        let num_blocks = self.ranges.remove(&start).unwrap_or(0);
        self.blocks -= num_blocks;
        num_blocks
    }

    fn add_range(&mut self, start: u64, num_blocks: u64) {
        if num_blocks == 0 || start == SPARSE_HOLE {
            return;
        }

        let mut new_start = start;
        let mut new_end = start.saturating_add(num_blocks);

        // Every range that overlaps or touches the new one. Ranges are
        // disjoint, so their ends decrease along with their starts.
        let merge = self
            .ranges
            .range(..=new_end)
            .rev()
            .take_while(|&(&s, &n)| s + n >= start)
            .map(|(&s, _)| s)
            .collect::<Vec<_>>();

        for s in merge {
            let n = self.remove(s);
            new_start = new_start.min(s);
            new_end = new_end.max(s + n);
        }

        self.insert(new_start, new_end - new_start);
    }

    fn subtract_range(&mut self, start: u64, num_blocks: u64) {
        if num_blocks == 0 || start == SPARSE_HOLE {
            return;
        }

        let end = start.saturating_add(num_blocks);

        let affected = self
            .ranges
            .range(..end)
            .rev()
            .take_while(|&(&s, &n)| s + n > start)
            .map(|(&s, &n)| (s, n))
            .collect::<Vec<_>>();

        for (s, n) in affected {
            self.remove(s);

            let e = s + n;

            if s < start {
                self.insert(s, start - s);
            }
            if e > end {
                self.insert(end, e - end);
            }
        }
    }

    pub fn add_extent(&mut self, extent: &Extent) {
        self.add_range(extent.start_block(), extent.num_blocks());
    }

    pub fn add_extents(&mut self, extents: &[Extent]) {
        for extent in extents {
            self.add_extent(extent);
        }
    }

    pub fn add_block(&mut self, block: u64) {
        self.add_range(block, 1);
    }

    pub fn add_ranges(&mut self, other: &Self) {
        for (&s, &n) in &other.ranges {
            self.add_range(s, n);
        }
    }

    pub fn subtract_extent(&mut self, extent: &Extent) {
        self.subtract_range(extent.start_block(), extent.num_blocks());
    }

    pub fn subtract_extents(&mut self, extents: &[Extent]) {
        for extent in extents {
            self.subtract_extent(extent);
        }
    }

    pub fn subtract_block(&mut self, block: u64) {
        self.subtract_range(block, 1);
    }

    pub fn subtract_ranges(&mut self, other: &Self) {
        for (&s, &n) in &other.ranges {
            self.subtract_range(s, n);
        }
    }

    /// Blocks present in both sets.
    pub fn intersect(&self, other: &Self) -> Self {
        let mut result = Self::new();

        for (&s, &n) in &self.ranges {
            let e = s + n;

            for (&os, &on) in other
                .ranges
                .range(..e)
                .rev()
                .take_while(|&(&os, &on)| os + on > s)
            {
                let start = s.max(os);
                let end = e.min(os + on);
                result.add_range(start, end - start);
            }
        }

        result
    }

    pub fn contains_block(&self, block: u64) -> bool {
        self.ranges
            .range(..=block)
            .next_back()
            .is_some_and(|(&s, &n)| block < s + n)
    }

    /// All ranges as extents in ascending order.
    pub fn extents(&self) -> Vec<Extent> {
        self.ranges
            .iter()
            .map(|(&s, &n)| new_extent(s, n))
            .collect()
    }

    /// Take ranges from the start of the set until exactly `count` blocks are
    /// covered. The last extent is truncated if needed.
    pub fn extents_for_block_count(&self, count: u64) -> Result<Vec<Extent>> {
        if count > self.blocks {
            return Err(Error::InsufficientBlocks {
                requested: count,
                available: self.blocks,
            });
        }

        let mut result = vec![];
        let mut remaining = count;

        for (&s, &n) in &self.ranges {
            if remaining == 0 {
                break;
            }

            let take = n.min(remaining);
            result.push(new_extent(s, take));
            remaining -= take;
        }

        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    fn ranges(extents: &[(u64, u64)]) -> ExtentRanges {
        let extents = extents
            .iter()
            .map(|&(s, n)| new_extent(s, n))
            .collect::<Vec<_>>();

        ExtentRanges::from_extents(&extents)
    }

    fn pairs(ranges: &ExtentRanges) -> Vec<(u64, u64)> {
        ranges
            .extents()
            .iter()
            .map(|e| (e.start_block(), e.num_blocks()))
            .collect()
    }

    #[test]
    fn add_merges_overlapping_and_adjacent() {
        let mut r = ranges(&[(10, 5), (20, 5)]);
        assert_eq!(r.blocks(), 10);

        // Touches the end of the first range.
        r.add_extent(&new_extent(15, 2));
        assert_eq!(pairs(&r), vec![(10, 7), (20, 5)]);

        // Bridges both ranges.
        r.add_extent(&new_extent(16, 6));
        assert_eq!(pairs(&r), vec![(10, 15)]);
        assert_eq!(r.blocks(), 15);

        r.add_extent(&new_extent(0, 1));
        assert_eq!(pairs(&r), vec![(0, 1), (10, 15)]);
    }

    #[test]
    fn subtract_splits_and_removes() {
        let mut r = ranges(&[(0, 10), (20, 10)]);

        r.subtract_extent(&new_extent(3, 2));
        assert_eq!(pairs(&r), vec![(0, 3), (5, 5), (20, 10)]);

        r.subtract_extent(&new_extent(8, 14));
        assert_eq!(pairs(&r), vec![(0, 3), (5, 3), (22, 8)]);
        assert_eq!(r.blocks(), 14);

        r.subtract_extent(&new_extent(0, 100));
        assert!(r.is_empty());
        assert_eq!(r.blocks(), 0);
    }

    #[test]
    fn sparse_holes_are_ignored() {
        let mut r = ExtentRanges::new();
        r.add_extent(&new_extent(SPARSE_HOLE, 10));
        r.add_extent(&new_extent(5, 0));
        assert!(r.is_empty());

        r.add_extent(&new_extent(0, 4));
        r.subtract_extent(&new_extent(SPARSE_HOLE, 10));
        assert_eq!(r.blocks(), 4);
    }

    #[test]
    fn single_blocks() {
        let mut r = ExtentRanges::new();
        r.add_block(3);
        r.add_block(5);
        r.add_block(4);
        assert_eq!(pairs(&r), vec![(3, 3)]);
        assert!(r.contains_block(5));
        assert!(!r.contains_block(6));

        r.subtract_block(4);
        assert_eq!(pairs(&r), vec![(3, 1), (5, 1)]);
        assert!(!r.contains_block(4));
    }

    #[test]
    fn intersection() {
        let a = ranges(&[(0, 10), (20, 10)]);
        let b = ranges(&[(5, 20), (29, 5)]);

        assert_eq!(pairs(&a.intersect(&b)), vec![(5, 5), (20, 5), (29, 1)]);
        assert_eq!(a.intersect(&ExtentRanges::new()).blocks(), 0);
    }

    #[test]
    fn block_count_extents() {
        let r = ranges(&[(0, 2), (10, 3), (20, 4)]);

        let extents = r.extents_for_block_count(4).unwrap();
        assert_eq!(extents, vec![new_extent(0, 2), new_extent(10, 2)]);

        assert_eq!(r.extents_for_block_count(0).unwrap(), vec![]);
        assert_matches!(
            r.extents_for_block_count(10),
            Err(Error::InsufficientBlocks {
                requested: 10,
                available: 9,
            })
        );
    }

    #[test]
    fn overlap_checks() {
        let a = new_extent(0, 4);
        let b = new_extent(4, 4);
        let c = new_extent(3, 1);

        assert!(!extents_overlap(&a, &b));
        assert!(extents_overlap_or_touch(&a, &b));
        assert!(extents_overlap(&a, &c));
        assert!(!extents_overlap(&new_extent(SPARSE_HOLE, 4), &a));
    }

    #[test]
    fn bsdiff_positions() {
        let extents = [new_extent(1, 2), new_extent(SPARSE_HOLE, 1), new_extent(8, 1)];

        assert_eq!(
            extents_to_bsdiff_positions(&extents, 4096, 4096 * 3 + 10).unwrap(),
            "4096:8192,-1:4096,32768:10",
        );

        assert_matches!(
            extents_to_bsdiff_positions(&extents, 4096, 4096 * 5),
            Err(Error::LengthMismatch { .. })
        );
    }

    #[test]
    fn idempotence() {
        let dst = [new_extent(0, 10)];

        assert!(is_idempotent(&[], &dst));
        assert!(is_idempotent(&[new_extent(2, 3)], &dst));
        assert!(!is_idempotent(&[new_extent(8, 3)], &dst));
        assert!(!is_idempotent(&[new_extent(20, 1)], &dst));
    }
}
