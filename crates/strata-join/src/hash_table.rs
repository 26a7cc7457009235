//! Chained hash tables, one per partition.
//!
//! Each partition owns a fixed-size array of bucket words. A bucket holds
//! the tagged row-pointer word of its chain head ([`NULL_ROW_WORD`] when
//! empty); the chain continues through each row's `next` word in its
//! segment. No per-slot metadata, no tombstones, no resizing.
//!
//! Inserts prepend. When one worker owns a partition, a plain load/store
//! pair suffices. When several workers share a partition, the head is
//! published with a compare-exchange: the row's `next` word is written
//! before the CAS makes the row reachable, and the probe stage is fenced
//! off by the build barrier, so relaxed ordering is enough.

use std::sync::atomic::{AtomicU64, Ordering};

use strata_error::{Result, StrataError};

use crate::row_table::{NULL_ROW_WORD, RowPtr, RowTable};

/// Target chain load factor: buckets ≥ rows.
const LOAD_FACTOR: usize = 1;

/// Bucket array for one partition.
#[derive(Debug)]
pub(crate) struct PartitionHashTable {
    buckets: Vec<AtomicU64>,
    mask: u64,
}

impl PartitionHashTable {
    /// Size the bucket array for a partition's final row count: the next
    /// power of two at or above `rows / LOAD_FACTOR`, never resized.
    pub(crate) fn with_row_count(rows: usize) -> Self {
        let bucket_count = (rows / LOAD_FACTOR).max(1).next_power_of_two();
        Self {
            buckets: (0..bucket_count).map(|_| AtomicU64::new(NULL_ROW_WORD)).collect(),
            mask: bucket_count as u64 - 1,
        }
    }

    pub(crate) fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    pub(crate) fn tracked_bytes(&self) -> usize {
        self.buckets.len() * 8
    }

    /// Bucket index for a key hash (low bits; partition routing uses the
    /// high bits, so the two never alias).
    pub(crate) fn bucket_of(&self, hash: u64) -> usize {
        (hash & self.mask) as usize
    }

    pub(crate) fn head_word(&self, bucket: usize) -> u64 {
        self.buckets[bucket].load(Ordering::Relaxed)
    }

    /// Single-owner prepend: the caller already wrote the row's `next` word
    /// to the previous head.
    pub(crate) fn store_head(&self, bucket: usize, word: u64) {
        self.buckets[bucket].store(word, Ordering::Relaxed);
    }

    /// Multi-owner prepend: publish `word` if the head is still `expected`;
    /// on failure returns the observed head for the retry loop.
    pub(crate) fn try_publish_head(
        &self,
        bucket: usize,
        expected: u64,
        word: u64,
    ) -> std::result::Result<(), u64> {
        self.buckets[bucket]
            .compare_exchange(expected, word, Ordering::Relaxed, Ordering::Relaxed)
            .map(|_| ())
    }
}

/// All partitions' hash tables plus the hash-to-partition route.
#[derive(Debug)]
pub(crate) struct JoinHashTable {
    partitions: Vec<PartitionHashTable>,
    /// Right-shift applied to a hash to select a partition (top bits).
    partition_shift: u32,
}

impl JoinHashTable {
    /// Allocate bucket arrays from per-partition row counts.
    ///
    /// `partition_rows.len()` must be a power of two.
    pub(crate) fn from_partition_rows(partition_rows: &[usize]) -> Result<Self> {
        let count = partition_rows.len();
        if count == 0 || !count.is_power_of_two() {
            return Err(StrataError::InvariantViolated(format!(
                "partition count {count} is not a power of two"
            )));
        }
        Ok(Self {
            partitions: partition_rows
                .iter()
                .map(|&rows| PartitionHashTable::with_row_count(rows))
                .collect(),
            partition_shift: 64 - count.trailing_zeros(),
        })
    }

    pub(crate) fn num_partitions(&self) -> usize {
        self.partitions.len()
    }

    pub(crate) fn partition(&self, partition: usize) -> &PartitionHashTable {
        &self.partitions[partition]
    }

    /// Partition routed to by a key hash.
    pub(crate) fn route(&self, hash: u64) -> usize {
        if self.partition_shift == 64 {
            0
        } else {
            (hash >> self.partition_shift) as usize
        }
    }

    pub(crate) fn tracked_bytes(&self) -> usize {
        self.partitions.iter().map(PartitionHashTable::tracked_bytes).sum()
    }

    /// Head word of the bucket a hash falls into.
    pub(crate) fn head_word_for(&self, partition: usize, hash: u64) -> u64 {
        let bucket = self.partitions[partition].bucket_of(hash);
        self.partitions[partition].head_word(bucket)
    }
}

/// Iterator over one bucket chain, yielding row pointers in walk order.
///
/// Link words are written once during build and only read afterwards, so a
/// walk sees a frozen forest; a pointer outside the table surfaces as
/// `InvariantViolated` instead of a wild read.
pub(crate) struct ChainWalk<'a> {
    row_table: &'a RowTable,
    word: u64,
}

impl<'a> ChainWalk<'a> {
    /// Resume a walk from a saved chain word.
    pub(crate) fn from_word(row_table: &'a RowTable, word: u64) -> Self {
        Self { row_table, word }
    }

    /// The chain word to resume from; [`NULL_ROW_WORD`] when exhausted.
    pub(crate) fn current_word(&self) -> u64 {
        self.word
    }
}

impl Iterator for ChainWalk<'_> {
    type Item = Result<RowPtr>;

    fn next(&mut self) -> Option<Self::Item> {
        let ptr = RowPtr::decode(self.word)?;
        match self.row_table.segment(ptr) {
            Ok(segment) => {
                self.word = segment.next_word(ptr.row as usize);
                Some(Ok(ptr))
            }
            Err(err) => {
                self.word = NULL_ROW_WORD;
                Some(Err(err))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bucket_sizing_rounds_up_to_power_of_two() {
        assert_eq!(PartitionHashTable::with_row_count(0).bucket_count(), 1);
        assert_eq!(PartitionHashTable::with_row_count(1).bucket_count(), 1);
        assert_eq!(PartitionHashTable::with_row_count(3).bucket_count(), 4);
        assert_eq!(PartitionHashTable::with_row_count(1024).bucket_count(), 1024);
        assert_eq!(PartitionHashTable::with_row_count(1025).bucket_count(), 2048);
    }

    #[test]
    fn route_uses_top_bits() {
        let table = JoinHashTable::from_partition_rows(&[0; 16]).unwrap();
        assert_eq!(table.route(0), 0);
        assert_eq!(table.route(u64::MAX), 15);
        // Low bits do not influence the partition.
        assert_eq!(table.route(0xFFFF), 0);
    }

    #[test]
    fn partition_count_must_be_power_of_two() {
        assert!(JoinHashTable::from_partition_rows(&[0; 12]).is_err());
        assert!(JoinHashTable::from_partition_rows(&[]).is_err());
        assert!(JoinHashTable::from_partition_rows(&[0; 16]).is_ok());
    }

    #[test]
    fn cas_publish_reports_observed_head() {
        let table = PartitionHashTable::with_row_count(4);
        let first = RowPtr::new(0, 0, 0).unwrap().encode();
        let second = RowPtr::new(0, 0, 1).unwrap().encode();

        table.try_publish_head(0, NULL_ROW_WORD, first).unwrap();
        let observed = table
            .try_publish_head(0, NULL_ROW_WORD, second)
            .unwrap_err();
        assert_eq!(observed, first);
        table.try_publish_head(0, observed, second).unwrap();
        assert_eq!(table.head_word(0), second);
    }
}
