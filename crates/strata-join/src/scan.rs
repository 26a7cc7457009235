//! Post-probe sweep of the build side.
//!
//! Joins whose "outer" or answering side is the build side cannot finish
//! during probing: right/full-style outer joins owe a null-extended row for
//! every build row no probe row touched, and build-sided semi/anti joins
//! answer entirely from the used flags. This stage walks the frozen row
//! table once probing is over and emits those rows.
//!
//! Work is sharded by partition: worker `w` of `n` owns partitions
//! `w, w + n, w + 2n, ...`, so shards are disjoint and no row is emitted
//! twice. Every build row is visited, linked or not; a row whose key never
//! qualified for the hash table is still an unmatched row.

use smallvec::SmallVec;
use strata_error::Result;

use crate::desc::ProbeKind;
use crate::output::OutputBuilder;
use crate::probe::{CANCEL_CHECK_INTERVAL, ProbeStep};
use crate::row_table::{RowPtr, RowTable};
use crate::runtime::ExecContext;

/// Resumable scan cursor over this worker's partitions.
///
/// Whether an emitted row is null-extended on the probe side (outer) or
/// stands alone (semi/anti) is decided by the output builder's column
/// ranges; the scan only chooses which rows qualify.
#[derive(Debug)]
pub(crate) struct ScanRowTable {
    /// Emit rows whose used flag equals this value.
    emit_used: bool,
    partitions: SmallVec<[usize; 16]>,
    part_idx: usize,
    seg_idx: usize,
    row_idx: usize,
    steps: u64,
}

impl ScanRowTable {
    pub(crate) fn new(
        kind: ProbeKind,
        worker_id: usize,
        worker_count: usize,
        num_partitions: usize,
    ) -> Self {
        // Probe-sided joins never reach the scan stage; their arm is inert.
        let emit_used = matches!(kind, ProbeKind::BuildSemi);
        Self {
            emit_used,
            partitions: (worker_id..num_partitions).step_by(worker_count.max(1)).collect(),
            part_idx: 0,
            seg_idx: 0,
            row_idx: 0,
            steps: 0,
        }
    }

    pub(crate) fn is_done(&self) -> bool {
        self.part_idx >= self.partitions.len()
    }

    /// Emit qualifying rows until the output fills or the shard is done.
    pub(crate) fn advance(
        &mut self,
        row_table: &RowTable,
        out: &mut OutputBuilder<'_>,
        ctx: &ExecContext,
    ) -> Result<ProbeStep> {
        while self.part_idx < self.partitions.len() {
            let partition = self.partitions[self.part_idx];
            let segments = row_table.partition(partition);
            while self.seg_idx < segments.len() {
                let segment = &segments[self.seg_idx];
                while self.row_idx < segment.num_rows() {
                    self.steps += 1;
                    if self.steps % CANCEL_CHECK_INTERVAL == 0 {
                        ctx.check()?;
                    }
                    let row = self.row_idx;
                    if segment.is_used(row) != self.emit_used {
                        self.row_idx += 1;
                        continue;
                    }
                    if out.is_full() {
                        return Ok(ProbeStep::BatchFull);
                    }
                    let ptr = RowPtr::new(partition, self.seg_idx, row)?;
                    out.append_build_row(row_table, ptr)?;
                    self.row_idx += 1;
                }
                self.seg_idx += 1;
                self.row_idx = 0;
            }
            self.part_idx += 1;
            self.seg_idx = 0;
        }
        Ok(ProbeStep::Drained)
    }
}
