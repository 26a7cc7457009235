//! The build stage: parallel pre-build followed by hash-table linking.
//!
//! Pre-build workers pull build batches from the shared source, serialize
//! and hash the key tuple once per batch, route every row to its partition
//! (top hash bits), and append it to a per-(worker, partition) segment.
//! Segments seal when their arena passes a byte budget. Joining the worker
//! scope is the first barrier: after it, every segment is frozen.
//!
//! The coordinator then sizes one bucket array per partition from the final
//! row counts and starts the linking workers. With at most one worker per
//! partition, inserts are plain load/store prepends; with more workers than
//! partitions, several workers share a partition (splitting its segments)
//! and publish heads by compare-exchange. Joining the linking scope is the
//! second barrier, which is what gives the probe stage its happens-before
//! edge to every build write.
//!
//! Any worker error wins the first-error cell and flips the shared abort
//! flag; the rest of the workers notice at their next batch or segment
//! boundary and bail out.

use parking_lot::Mutex;
use strata_batch::BatchFormatError;
use strata_error::{Result, StrataError};

use crate::desc::HashJoinDesc;
use crate::hash_table::JoinHashTable;
use crate::layout::TableMeta;
use crate::probe::CANCEL_CHECK_INTERVAL;
use crate::row_table::{RowPtr, RowTable, RowTableSegment, SegmentBuilder};
use crate::runtime::{BatchSource, ExecContext};

/// Arena bytes that seal a pre-build segment.
const SEGMENT_ARENA_BUDGET_BYTES: usize = 1 << 20;

/// The frozen build side: row storage plus its hash tables.
#[derive(Debug)]
pub(crate) struct BuiltJoin {
    pub(crate) row_table: RowTable,
    pub(crate) hash_table: JoinHashTable,
}

/// Drive the whole build stage to completion.
pub(crate) fn run_build(
    desc: &HashJoinDesc,
    meta: &TableMeta,
    ctx: &ExecContext,
    source: &mut dyn BatchSource,
) -> Result<BuiltJoin> {
    let workers = desc.concurrency;
    let partition_count = desc.partition_count();
    let shift = 64 - partition_count.trailing_zeros();
    let source = Mutex::new(source);

    // Pre-build. Workers return their sealed segments per partition; the
    // scope join is Barrier 1.
    let mut per_worker: Vec<Vec<Vec<RowTableSegment>>> = Vec::with_capacity(workers);
    std::thread::scope(|s| {
        let handles: Vec<_> = (0..workers)
            .map(|_| s.spawn(|| prebuild_worker(desc, meta, ctx, &source, partition_count, shift)))
            .collect();
        for handle in handles {
            match handle.join() {
                Ok(Ok(sealed)) => per_worker.push(sealed),
                Ok(Err(err)) => ctx.record(err),
                Err(_) => ctx.record(StrataError::InvariantViolated(
                    "pre-build worker panicked".into(),
                )),
            }
        }
    });
    if let Some(err) = ctx.take_error() {
        return Err(err);
    }

    // Merge per-worker segment lists in worker order so chain walk order is
    // stable for this build.
    let mut partitions: Vec<Vec<RowTableSegment>> =
        (0..partition_count).map(|_| Vec::new()).collect();
    for worker_segments in per_worker {
        for (partition, segments) in worker_segments.into_iter().enumerate() {
            partitions[partition].extend(segments);
        }
    }
    let row_table = RowTable::new(partitions)?;

    // Bucket sizing from final per-partition row counts.
    let partition_rows: Vec<usize> = (0..partition_count)
        .map(|p| row_table.partition_rows(p))
        .collect();
    let hash_table = JoinHashTable::from_partition_rows(&partition_rows)?;
    ctx.reserve(hash_table.tracked_bytes())?;

    tracing::debug!(
        partitions = partition_count,
        rows = row_table.total_rows(),
        buckets = hash_table.tracked_bytes() / 8,
        "row table assembled"
    );

    // Linking. The scope join is Barrier 2: probe reads happen after it.
    let rt = &row_table;
    let ht = &hash_table;
    std::thread::scope(|s| {
        for worker_id in 0..workers {
            s.spawn(move || {
                if let Err(err) = link_worker(worker_id, workers, rt, ht, ctx) {
                    ctx.record(err);
                }
            });
        }
    });
    if let Some(err) = ctx.take_error() {
        return Err(err);
    }

    Ok(BuiltJoin {
        row_table,
        hash_table,
    })
}

fn route(hash: u64, shift: u32) -> usize {
    if shift == 64 {
        0
    } else {
        (hash >> shift) as usize
    }
}

fn prebuild_worker(
    desc: &HashJoinDesc,
    meta: &TableMeta,
    ctx: &ExecContext,
    source: &Mutex<&mut dyn BatchSource>,
    partition_count: usize,
    shift: u32,
) -> Result<Vec<Vec<RowTableSegment>>> {
    let mut open: Vec<SegmentBuilder> =
        (0..partition_count).map(|_| SegmentBuilder::new()).collect();
    let mut sealed: Vec<Vec<RowTableSegment>> =
        (0..partition_count).map(|_| Vec::new()).collect();

    loop {
        ctx.check()?;
        let batch = source.lock().next_batch()?;
        let Some(batch) = batch else { break };
        if batch.num_rows() == 0 {
            continue;
        }
        if batch.num_columns() != desc.build_schema.len() {
            return Err(BatchFormatError::SchemaMismatch {
                expected_columns: desc.build_schema.len(),
                actual_columns: batch.num_columns(),
            }
            .into());
        }
        let keys = desc.build_keys.serialize(&batch)?;
        for row in 0..batch.num_rows() {
            let partition = route(keys.hash(row), shift);
            let builder = &mut open[partition];
            builder.push_row(meta, &batch, row, &keys)?;
            if builder.arena_bytes() >= SEGMENT_ARENA_BUDGET_BYTES {
                let full = std::mem::take(builder);
                seal_into(full, &mut sealed[partition], ctx)?;
            }
        }
    }

    for (partition, builder) in open.into_iter().enumerate() {
        if !builder.is_empty() {
            seal_into(builder, &mut sealed[partition], ctx)?;
        }
    }
    Ok(sealed)
}

fn seal_into(
    builder: SegmentBuilder,
    list: &mut Vec<RowTableSegment>,
    ctx: &ExecContext,
) -> Result<()> {
    let segment = builder.seal();
    ctx.reserve(segment.tracked_bytes())?;
    list.push(segment);
    Ok(())
}

fn link_worker(
    worker_id: usize,
    workers: usize,
    row_table: &RowTable,
    hash_table: &JoinHashTable,
    ctx: &ExecContext,
) -> Result<()> {
    let partition_count = row_table.num_partitions();
    if workers <= partition_count {
        // Single-owner regime: each partition has exactly one linking
        // worker, so bucket heads need no synchronization.
        let mut partition = worker_id;
        while partition < partition_count {
            link_partition_single(partition, row_table, hash_table, ctx)?;
            partition += workers;
        }
    } else {
        // Multi-owner regime: workers sharing a partition split its
        // segments and publish chain heads with compare-exchange.
        let partition = worker_id % partition_count;
        let rank = worker_id / partition_count;
        let peers = (workers - partition).div_ceil(partition_count);
        link_partition_shared(partition, rank, peers, row_table, hash_table, ctx)?;
    }
    Ok(())
}

fn link_partition_single(
    partition: usize,
    row_table: &RowTable,
    hash_table: &JoinHashTable,
    ctx: &ExecContext,
) -> Result<()> {
    let buckets = hash_table.partition(partition);
    let mut steps = 0u64;
    for (seg_idx, segment) in row_table.partition(partition).iter().enumerate() {
        ctx.check()?;
        for &row in segment.valid_joinkey_pos() {
            let row = row as usize;
            let bucket = buckets.bucket_of(segment.hash(row));
            let word = RowPtr::new(partition, seg_idx, row)?.encode();
            segment.set_next_word(row, buckets.head_word(bucket));
            buckets.store_head(bucket, word);

            steps += 1;
            if steps % CANCEL_CHECK_INTERVAL == 0 {
                ctx.check()?;
            }
        }
    }
    Ok(())
}

fn link_partition_shared(
    partition: usize,
    rank: usize,
    peers: usize,
    row_table: &RowTable,
    hash_table: &JoinHashTable,
    ctx: &ExecContext,
) -> Result<()> {
    let buckets = hash_table.partition(partition);
    let mut steps = 0u64;
    for (seg_idx, segment) in row_table.partition(partition).iter().enumerate() {
        if seg_idx % peers != rank {
            continue;
        }
        ctx.check()?;
        for &row in segment.valid_joinkey_pos() {
            let row = row as usize;
            let bucket = buckets.bucket_of(segment.hash(row));
            let word = RowPtr::new(partition, seg_idx, row)?.encode();

            // The row's chain word must be in place before the CAS makes
            // the row reachable.
            let mut expected = buckets.head_word(bucket);
            loop {
                segment.set_next_word(row, expected);
                match buckets.try_publish_head(bucket, expected, word) {
                    Ok(()) => break,
                    Err(observed) => expected = observed,
                }
            }

            steps += 1;
            if steps % CANCEL_CHECK_INTERVAL == 0 {
                ctx.check()?;
            }
        }
    }
    Ok(())
}
