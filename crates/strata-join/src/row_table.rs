//! Row-encoded build-side storage.
//!
//! Build rows live in append-only byte arenas, one [`RowTableSegment`] at a
//! time. A segment also carries, parallel to its rows: the 64-bit key hash,
//! the row's arena offset, the indexes of rows whose key is valid for
//! indexing, an atomic chain-link word per row, and an atomic used bitmap.
//!
//! The chain link and used flag are the only mutable state once a segment is
//! sealed, and both are atomics: linking publishes chain words before
//! bucket heads, and `mark_used` is an idempotent `0 -> 1` bit-or.

use std::sync::atomic::{AtomicU64, Ordering};

use strata_error::{Result, StrataError};

use crate::layout::TableMeta;

/// Raw chain-terminator word: no tag bit set.
pub(crate) const NULL_ROW_WORD: u64 = 0;

const TAG: u64 = 1 << 63;
const PARTITION_SHIFT: u32 = 48;
const SEGMENT_SHIFT: u32 = 32;
const PARTITION_MASK: u64 = (1 << 15) - 1;
const SEGMENT_MASK: u64 = (1 << 16) - 1;
const ROW_MASK: u64 = (1 << 32) - 1;

/// Capacity limits implied by the packed encoding.
pub(crate) const MAX_PARTITION_INDEX: usize = PARTITION_MASK as usize;
pub(crate) const MAX_SEGMENT_INDEX: usize = SEGMENT_MASK as usize;
pub(crate) const MAX_ROW_INDEX: usize = ROW_MASK as usize;

/// Stable address of one build row: partition, segment within the
/// partition, row within the segment.
///
/// Packed into a tagged 64-bit word for bucket slots and chain links:
/// bit 63 is the occupancy tag, zero means "no row". The tag keeps a valid
/// pointer to partition 0 / segment 0 / row 0 distinct from the null word.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct RowPtr {
    pub partition: u32,
    pub segment: u32,
    pub row: u32,
}

impl RowPtr {
    pub(crate) fn new(partition: usize, segment: usize, row: usize) -> Result<Self> {
        if partition > MAX_PARTITION_INDEX || segment > MAX_SEGMENT_INDEX || row > MAX_ROW_INDEX {
            return Err(StrataError::InvariantViolated(format!(
                "row pointer out of range: partition {partition}, segment {segment}, row {row}"
            )));
        }
        Ok(Self {
            partition: partition as u32,
            segment: segment as u32,
            row: row as u32,
        })
    }

    /// Pack into a tagged word.
    pub(crate) fn encode(self) -> u64 {
        TAG | (u64::from(self.partition) << PARTITION_SHIFT)
            | (u64::from(self.segment) << SEGMENT_SHIFT)
            | u64::from(self.row)
    }

    /// Unpack a tagged word; `None` for the null word.
    pub(crate) fn decode(word: u64) -> Option<Self> {
        if word & TAG == 0 {
            return None;
        }
        Some(Self {
            partition: ((word >> PARTITION_SHIFT) & PARTITION_MASK) as u32,
            segment: ((word >> SEGMENT_SHIFT) & SEGMENT_MASK) as u32,
            row: (word & ROW_MASK) as u32,
        })
    }
}

// ── Segments ───────────────────────────────────────────────────────────────

/// Open, append-only segment under construction during pre-build.
#[derive(Debug, Default)]
pub(crate) struct SegmentBuilder {
    arena: Vec<u8>,
    row_offsets: Vec<u32>,
    hash_values: Vec<u64>,
    valid_joinkey_pos: Vec<u32>,
}

impl SegmentBuilder {
    pub(crate) fn new() -> Self {
        Self {
            arena: Vec::new(),
            row_offsets: Vec::new(),
            hash_values: Vec::new(),
            valid_joinkey_pos: Vec::new(),
        }
    }

    /// Encode one input row into the arena and record its metadata.
    pub(crate) fn push_row(
        &mut self,
        meta: &TableMeta,
        batch: &strata_batch::Batch,
        row: usize,
        keys: &strata_batch::SerializedKeys,
    ) -> Result<()> {
        let offset = self.arena.len();
        if offset > u32::MAX as usize {
            return Err(StrataError::InvariantViolated(
                "segment arena exceeded the 4 GiB offset range".into(),
            ));
        }
        let row_idx = self.row_offsets.len();
        if row_idx > MAX_ROW_INDEX {
            return Err(StrataError::InvariantViolated(
                "segment row count exceeded the row-pointer range".into(),
            ));
        }
        meta.encode_row(batch, row, keys, &mut self.arena)?;
        self.row_offsets.push(offset as u32);
        self.hash_values.push(keys.hash(row));
        if keys.is_valid(row) {
            self.valid_joinkey_pos.push(row_idx as u32);
        }
        Ok(())
    }

    pub(crate) fn num_rows(&self) -> usize {
        self.row_offsets.len()
    }

    pub(crate) fn arena_bytes(&self) -> usize {
        self.arena.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.row_offsets.is_empty()
    }

    /// Freeze into an immutable segment with zeroed chain links and used
    /// bits.
    pub(crate) fn seal(self) -> RowTableSegment {
        let rows = self.row_offsets.len();
        RowTableSegment {
            raw_data: self.arena,
            row_offsets: self.row_offsets,
            hash_values: self.hash_values,
            valid_joinkey_pos: self.valid_joinkey_pos,
            next: (0..rows).map(|_| AtomicU64::new(NULL_ROW_WORD)).collect(),
            used: (0..rows.div_ceil(64)).map(|_| AtomicU64::new(0)).collect(),
        }
    }
}

/// Immutable sealed segment.
#[derive(Debug)]
pub(crate) struct RowTableSegment {
    raw_data: Vec<u8>,
    row_offsets: Vec<u32>,
    hash_values: Vec<u64>,
    valid_joinkey_pos: Vec<u32>,
    /// Chain link per row; tagged row-pointer word, [`NULL_ROW_WORD`]
    /// terminates.
    next: Vec<AtomicU64>,
    /// One bit per row, set when a probe row matched it.
    used: Vec<AtomicU64>,
}

impl RowTableSegment {
    pub(crate) fn num_rows(&self) -> usize {
        self.row_offsets.len()
    }

    pub(crate) fn arena_bytes(&self) -> usize {
        self.raw_data.len()
    }

    /// Tracked allocation size: arena plus the parallel arrays.
    pub(crate) fn tracked_bytes(&self) -> usize {
        self.raw_data.len()
            + self.row_offsets.len() * 4
            + self.hash_values.len() * 8
            + self.valid_joinkey_pos.len() * 4
            + self.next.len() * 8
            + self.used.len() * 8
    }

    pub(crate) fn row_bytes(&self, row: usize) -> Result<&[u8]> {
        let start = *self.row_offsets.get(row).ok_or_else(|| {
            StrataError::InvariantViolated(format!(
                "row {row} out of bounds for segment of {} rows",
                self.num_rows()
            ))
        })? as usize;
        let end = self
            .row_offsets
            .get(row + 1)
            .map_or(self.raw_data.len(), |&next| next as usize);
        Ok(&self.raw_data[start..end])
    }

    pub(crate) fn hash(&self, row: usize) -> u64 {
        self.hash_values[row]
    }

    /// Rows whose join key qualifies for the hash table.
    pub(crate) fn valid_joinkey_pos(&self) -> &[u32] {
        &self.valid_joinkey_pos
    }

    pub(crate) fn next_word(&self, row: usize) -> u64 {
        self.next[row].load(Ordering::Relaxed)
    }

    pub(crate) fn set_next_word(&self, row: usize, word: u64) {
        self.next[row].store(word, Ordering::Relaxed);
    }

    /// Set the used flag; idempotent, concurrent calls are benign.
    pub(crate) fn mark_used(&self, row: usize) {
        self.used[row / 64].fetch_or(1 << (row % 64), Ordering::Relaxed);
    }

    pub(crate) fn is_used(&self, row: usize) -> bool {
        self.used[row / 64].load(Ordering::Relaxed) & (1 << (row % 64)) != 0
    }
}

// ── RowTable ───────────────────────────────────────────────────────────────

/// The build side, partitioned: `P` segment lists sharing one layout.
#[derive(Debug)]
pub(crate) struct RowTable {
    partitions: Vec<Vec<RowTableSegment>>,
}

impl RowTable {
    pub(crate) fn new(partitions: Vec<Vec<RowTableSegment>>) -> Result<Self> {
        if partitions.len() > MAX_PARTITION_INDEX + 1 {
            return Err(StrataError::InvariantViolated(format!(
                "{} partitions exceed the row-pointer range",
                partitions.len()
            )));
        }
        for segments in &partitions {
            if segments.len() > MAX_SEGMENT_INDEX + 1 {
                return Err(StrataError::InvariantViolated(format!(
                    "{} segments exceed the row-pointer range",
                    segments.len()
                )));
            }
        }
        Ok(Self { partitions })
    }

    pub(crate) fn num_partitions(&self) -> usize {
        self.partitions.len()
    }

    pub(crate) fn partition(&self, partition: usize) -> &[RowTableSegment] {
        &self.partitions[partition]
    }

    pub(crate) fn partition_rows(&self, partition: usize) -> usize {
        self.partitions[partition]
            .iter()
            .map(RowTableSegment::num_rows)
            .sum()
    }

    pub(crate) fn total_rows(&self) -> usize {
        (0..self.partitions.len())
            .map(|p| self.partition_rows(p))
            .sum()
    }

    pub(crate) fn segment(&self, ptr: RowPtr) -> Result<&RowTableSegment> {
        self.partitions
            .get(ptr.partition as usize)
            .and_then(|segments| segments.get(ptr.segment as usize))
            .ok_or_else(|| {
                StrataError::InvariantViolated(format!(
                    "chain pointer outside the row table: {ptr:?}"
                ))
            })
    }

    pub(crate) fn row_bytes(&self, ptr: RowPtr) -> Result<&[u8]> {
        self.segment(ptr)?.row_bytes(ptr.row as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_batch::{Batch, ColumnSpec, DataType, JoinKeySchema, KeyColumn, Value};

    fn one_col_setup(rows: &[Option<i64>]) -> (TableMeta, JoinKeySchema, Batch) {
        let schema = vec![ColumnSpec::new("k", DataType::Int)];
        let keys = JoinKeySchema::new(vec![KeyColumn::new(0, DataType::Int)]);
        let meta = TableMeta::new(&schema, &keys, &[]);
        let rows: Vec<Vec<Value>> = rows.iter().map(|v| vec![Value::from(*v)]).collect();
        let batch = Batch::from_rows(&schema, &rows).unwrap();
        (meta, keys, batch)
    }

    #[test]
    fn row_ptr_roundtrip_and_null_word() {
        let ptr = RowPtr::new(11, 257, 70_000).unwrap();
        let word = ptr.encode();
        assert_eq!(RowPtr::decode(word), Some(ptr));
        assert_eq!(RowPtr::decode(NULL_ROW_WORD), None);

        // Partition/segment/row zero is still a tagged, non-null word.
        let zero = RowPtr::new(0, 0, 0).unwrap();
        assert_ne!(zero.encode(), NULL_ROW_WORD);
        assert_eq!(RowPtr::decode(zero.encode()), Some(zero));
    }

    #[test]
    fn row_ptr_range_checks() {
        assert!(RowPtr::new(MAX_PARTITION_INDEX, 0, 0).is_ok());
        assert!(RowPtr::new(MAX_PARTITION_INDEX + 1, 0, 0).is_err());
        assert!(RowPtr::new(0, MAX_SEGMENT_INDEX + 1, 0).is_err());
    }

    #[test]
    fn segment_tracks_rows_and_valid_keys() {
        let (meta, keys, batch) = one_col_setup(&[Some(1), None, Some(2)]);
        let serialized = keys.serialize(&batch).unwrap();

        let mut builder = SegmentBuilder::new();
        for row in 0..batch.num_rows() {
            builder.push_row(&meta, &batch, row, &serialized).unwrap();
        }
        let segment = builder.seal();

        assert_eq!(segment.num_rows(), 3);
        // The null key row is stored but not index-valid.
        assert_eq!(segment.valid_joinkey_pos(), &[0, 2]);
        assert_eq!(segment.hash(0), serialized.hash(0));
        assert!(!segment.row_bytes(0).unwrap().is_empty());
        assert!(segment.row_bytes(3).is_err());
    }

    #[test]
    fn mark_used_is_idempotent() {
        let (meta, keys, batch) = one_col_setup(&[Some(1), Some(2)]);
        let serialized = keys.serialize(&batch).unwrap();
        let mut builder = SegmentBuilder::new();
        for row in 0..2 {
            builder.push_row(&meta, &batch, row, &serialized).unwrap();
        }
        let segment = builder.seal();

        assert!(!segment.is_used(0));
        segment.mark_used(0);
        segment.mark_used(0);
        assert!(segment.is_used(0));
        assert!(!segment.is_used(1));
    }

    #[test]
    fn chain_words_default_to_null() {
        let (meta, keys, batch) = one_col_setup(&[Some(1)]);
        let serialized = keys.serialize(&batch).unwrap();
        let mut builder = SegmentBuilder::new();
        builder.push_row(&meta, &batch, 0, &serialized).unwrap();
        let segment = builder.seal();

        assert_eq!(segment.next_word(0), NULL_ROW_WORD);
        let ptr = RowPtr::new(3, 0, 0).unwrap();
        segment.set_next_word(0, ptr.encode());
        assert_eq!(RowPtr::decode(segment.next_word(0)), Some(ptr));
    }
}
