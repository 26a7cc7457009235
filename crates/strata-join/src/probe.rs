//! The probe pipeline.
//!
//! A [`JoinProbe`] binds one probe batch at a time, hashes and serializes
//! its keys once, and resolves every probe row against the frozen hash
//! table. The join-type strategy is fixed at construction (one
//! [`ProbeKind`] discriminant), so the chain-walk loop is monomorphic for
//! its join type and key mode.
//!
//! Probing is resumable: when the output batch fills mid-chain, the walk
//! word, the row cursor, and the per-row matched flags persist across
//! `probe` calls. Matched pairs gather in a small pair buffer and are
//! flushed in runs, which is where the residual predicate gets evaluated
//! in vector mode.

use std::collections::VecDeque;

use strata_batch::{Batch, JoinKeySchema, SerializedKeys};
use strata_error::{Result, StrataError};

use crate::desc::{HashJoinDesc, ProbeKind};
use crate::hash_table::{ChainWalk, JoinHashTable};
use crate::layout::TableMeta;
use crate::output::{CandidateLayout, OutputBuilder};
use crate::row_table::{NULL_ROW_WORD, RowPtr, RowTable};
use crate::runtime::{ExecContext, ResidualFilter};
use crate::scan::ScanRowTable;

/// Matched pairs buffered between flushes.
const PAIR_BUFFER_ROWS: usize = 256;

/// Chain steps (and scan rows) between cancellation checks.
pub(crate) const CANCEL_CHECK_INTERVAL: u64 = 1024;

/// Outcome of one `probe` or `scan_row_table` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ProbeStep {
    /// The output builder reached its capacity; drain it and call again.
    BatchFull,
    /// The current chunk (or scan shard) is fully resolved.
    Drained,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    /// Walking chains for each probe row in order.
    Chains,
    /// Emitting the matched/unmatched pass over the chunk.
    Tail,
    Done,
}

struct ProbeChunk {
    batch: Batch,
    keys: SerializedKeys,
}

/// Per-worker probe state and strategy.
pub(crate) struct JoinProbe<'a> {
    kind: ProbeKind,
    meta: &'a TableMeta,
    row_table: &'a RowTable,
    hash_table: &'a JoinHashTable,
    probe_key_schema: &'a JoinKeySchema,
    residual: Option<&'a dyn ResidualFilter>,
    candidates: Option<CandidateLayout>,

    chunk: Option<ProbeChunk>,
    phase: Phase,
    row_idx: usize,
    tail_idx: usize,
    /// Saved chain word for the row being walked; meaningful only while
    /// `walk_active`.
    walk_word: u64,
    walk_active: bool,
    /// Per probe row: matched at least once (post-predicate).
    matched: Vec<bool>,
    pairs: Vec<(u32, RowPtr)>,
    /// Surviving pairs awaiting emission; drained respecting the output
    /// capacity so batches never exceed `required_rows`.
    ready: VecDeque<(u32, RowPtr)>,
    steps: u64,

    scan: Option<ScanRowTable>,
}

impl<'a> JoinProbe<'a> {
    pub(crate) fn new(
        desc: &'a HashJoinDesc,
        meta: &'a TableMeta,
        row_table: &'a RowTable,
        hash_table: &'a JoinHashTable,
        residual: Option<&'a dyn ResidualFilter>,
    ) -> Self {
        Self {
            kind: desc.probe_kind(),
            meta,
            row_table,
            hash_table,
            probe_key_schema: &desc.probe_keys,
            residual,
            candidates: CandidateLayout::new(desc, meta),
            chunk: None,
            phase: Phase::Done,
            row_idx: 0,
            tail_idx: 0,
            walk_word: NULL_ROW_WORD,
            walk_active: false,
            matched: Vec::new(),
            pairs: Vec::with_capacity(PAIR_BUFFER_ROWS),
            ready: VecDeque::new(),
            steps: 0,
            scan: None,
        }
    }

    // ── Chunk lifecycle ────────────────────────────────────────────────────

    /// Bind a new probe batch: hash and serialize its keys once, reset the
    /// cursors.
    pub(crate) fn set_chunk(&mut self, batch: Batch) -> Result<()> {
        if !self.current_chunk_done() {
            return Err(StrataError::InvariantViolated(
                "set_chunk while the previous chunk is not drained".into(),
            ));
        }
        let keys = self.probe_key_schema.serialize(&batch)?;
        self.matched.clear();
        self.matched.resize(batch.num_rows(), false);
        self.ready.clear();
        self.chunk = Some(ProbeChunk { batch, keys });
        self.phase = Phase::Chains;
        self.row_idx = 0;
        self.tail_idx = 0;
        self.walk_active = false;
        self.walk_word = NULL_ROW_WORD;
        Ok(())
    }

    pub(crate) fn current_chunk_done(&self) -> bool {
        self.chunk.is_none() || self.phase == Phase::Done
    }

    // ── Probe ──────────────────────────────────────────────────────────────

    /// Resolve probe rows until the output fills or the chunk is drained.
    pub(crate) fn probe(
        &mut self,
        out: &mut OutputBuilder<'_>,
        ctx: &ExecContext,
    ) -> Result<ProbeStep> {
        let chunk = self.chunk.take().ok_or_else(|| {
            StrataError::InvariantViolated("probe without a bound chunk".into())
        })?;
        let result = self.probe_chunk(&chunk, out, ctx);
        self.chunk = Some(chunk);
        result
    }

    fn probe_chunk(
        &mut self,
        chunk: &ProbeChunk,
        out: &mut OutputBuilder<'_>,
        ctx: &ExecContext,
    ) -> Result<ProbeStep> {
        loop {
            match self.phase {
                Phase::Chains => {
                    if let Some(step) = self.walk_chains(chunk, out, ctx)? {
                        return Ok(step);
                    }
                }
                Phase::Tail => {
                    if let Some(step) = self.emit_tail(chunk, out, ctx)? {
                        return Ok(step);
                    }
                }
                Phase::Done => return Ok(ProbeStep::Drained),
            }
        }
    }

    /// Chain-walking phase. Returns `Some(BatchFull)` when the caller must
    /// drain, `None` when the phase advanced.
    fn walk_chains(
        &mut self,
        chunk: &ProbeChunk,
        out: &mut OutputBuilder<'_>,
        ctx: &ExecContext,
    ) -> Result<Option<ProbeStep>> {
        let num_rows = chunk.batch.num_rows();

        // Emission left over from a suspended flush comes first.
        if self.drain_ready(chunk, out)? {
            return Ok(Some(ProbeStep::BatchFull));
        }

        while self.row_idx < num_rows {
            if out.is_full() {
                return Ok(Some(ProbeStep::BatchFull));
            }
            let row = self.row_idx;
            if !self.walk_active {
                if !chunk.keys.is_valid(row) {
                    // Disqualifying null key: never matches. Outer/anti
                    // emission happens in the tail pass off the matched
                    // flags, which stay false.
                    self.row_idx += 1;
                    continue;
                }
                let hash = chunk.keys.hash(row);
                let partition = self.hash_table.route(hash);
                self.walk_word = self.hash_table.head_word_for(partition, hash);
                self.walk_active = true;
            }

            let hash = chunk.keys.hash(row);
            let key = chunk.keys.key(row);
            let mut walk = ChainWalk::from_word(self.row_table, self.walk_word);
            while let Some(ptr) = walk.next() {
                let ptr = ptr?;
                self.walk_word = walk.current_word();
                let segment = self.row_table.segment(ptr)?;
                let build_row = ptr.row as usize;

                // Stored 64-bit hashes filter most non-matches before any
                // payload bytes are read.
                if segment.hash(build_row) == hash
                    && self.meta.keys_match(segment.row_bytes(build_row)?, key)?
                {
                    self.on_match(row, ptr, segment);
                }

                self.steps += 1;
                if self.steps % CANCEL_CHECK_INTERVAL == 0 {
                    ctx.check()?;
                }
                if self.pairs.len() >= PAIR_BUFFER_ROWS {
                    self.flush_pairs(chunk)?;
                    if self.drain_ready(chunk, out)? {
                        return Ok(Some(ProbeStep::BatchFull));
                    }
                }
                // A confirmed semi/anti row needs no more chain entries.
                if matches!(self.kind, ProbeKind::ProbeSemi | ProbeKind::ProbeAnti)
                    && self.matched[row]
                {
                    break;
                }
            }
            self.walk_active = false;
            self.row_idx += 1;
        }

        self.flush_pairs(chunk)?;
        if self.drain_ready(chunk, out)? {
            return Ok(Some(ProbeStep::BatchFull));
        }
        self.phase = if self.needs_tail_pass() {
            Phase::Tail
        } else {
            Phase::Done
        };
        Ok(None)
    }

    /// The per-row pass that outer, semi, and anti joins need once the
    /// matched flags are final.
    fn emit_tail(
        &mut self,
        chunk: &ProbeChunk,
        out: &mut OutputBuilder<'_>,
        ctx: &ExecContext,
    ) -> Result<Option<ProbeStep>> {
        let num_rows = chunk.batch.num_rows();

        while self.tail_idx < num_rows {
            if out.is_full() {
                return Ok(Some(ProbeStep::BatchFull));
            }
            let row = self.tail_idx;
            self.tail_idx += 1;
            match self.kind {
                ProbeKind::ProbeOuter => {
                    if !self.matched[row] {
                        out.append_probe_row(&chunk.batch, row)?;
                    }
                }
                ProbeKind::ProbeSemi => {
                    if self.matched[row] {
                        out.append_probe_row(&chunk.batch, row)?;
                    }
                }
                ProbeKind::ProbeAnti => {
                    if !self.matched[row] {
                        out.append_probe_row(&chunk.batch, row)?;
                    }
                }
                _ => {
                    return Err(StrataError::InvariantViolated(
                        "tail pass reached for a join type without one".into(),
                    ));
                }
            }
            self.steps += 1;
            if self.steps % CANCEL_CHECK_INTERVAL == 0 {
                ctx.check()?;
            }
        }
        self.phase = Phase::Done;
        Ok(None)
    }

    fn needs_tail_pass(&self) -> bool {
        matches!(
            self.kind,
            ProbeKind::ProbeOuter | ProbeKind::ProbeSemi | ProbeKind::ProbeAnti
        )
    }

    /// React to a key match. Without a residual predicate the effect is
    /// immediate; with one, the pair waits in the buffer for a vectorized
    /// verdict.
    fn on_match(&mut self, row: usize, ptr: RowPtr, segment: &crate::row_table::RowTableSegment) {
        if self.residual.is_none() {
            match self.kind {
                ProbeKind::Inner | ProbeKind::ProbeOuter | ProbeKind::BuildOuter => {
                    self.pairs.push((row as u32, ptr));
                }
                ProbeKind::ProbeSemi | ProbeKind::ProbeAnti => {
                    self.matched[row] = true;
                }
                ProbeKind::BuildSemi | ProbeKind::BuildAnti => {
                    segment.mark_used(ptr.row as usize);
                }
            }
        } else if !(matches!(self.kind, ProbeKind::ProbeSemi | ProbeKind::ProbeAnti)
            && self.matched[row])
        {
            self.pairs.push((row as u32, ptr));
        }
    }

    /// Flush the pair buffer: evaluate the residual predicate (if any) over
    /// the materialized candidates, apply each survivor's flag or used-bit
    /// effect immediately, and queue survivors that produce output rows.
    fn flush_pairs(&mut self, chunk: &ProbeChunk) -> Result<()> {
        if self.pairs.is_empty() {
            return Ok(());
        }

        let survivors: Option<Vec<bool>> = match (self.residual, &self.candidates) {
            (Some(filter), Some(layout)) => {
                let candidates =
                    layout.materialize(self.meta, &chunk.batch, &self.pairs, self.row_table)?;
                let verdict = filter.evaluate(&candidates)?;
                if verdict.len() != self.pairs.len() {
                    return Err(StrataError::Predicate(format!(
                        "evaluator returned {} verdicts for {} candidate rows",
                        verdict.len(),
                        self.pairs.len()
                    )));
                }
                Some(verdict)
            }
            _ => None,
        };

        let pairs = std::mem::take(&mut self.pairs);
        for (i, &(probe_row, ptr)) in pairs.iter().enumerate() {
            if let Some(vs) = &survivors {
                if !vs[i] {
                    continue;
                }
            }
            let row = probe_row as usize;
            match self.kind {
                ProbeKind::Inner => {
                    self.ready.push_back((probe_row, ptr));
                }
                ProbeKind::ProbeOuter => {
                    self.matched[row] = true;
                    self.ready.push_back((probe_row, ptr));
                }
                ProbeKind::BuildOuter => {
                    self.row_table.segment(ptr)?.mark_used(ptr.row as usize);
                    self.ready.push_back((probe_row, ptr));
                }
                ProbeKind::ProbeSemi | ProbeKind::ProbeAnti => {
                    self.matched[row] = true;
                }
                ProbeKind::BuildSemi | ProbeKind::BuildAnti => {
                    self.row_table.segment(ptr)?.mark_used(ptr.row as usize);
                }
            }
        }
        self.pairs = pairs;
        self.pairs.clear();
        Ok(())
    }

    /// Emit queued survivor pairs while the output has room. Returns true
    /// when the output filled before the queue emptied.
    fn drain_ready(&mut self, chunk: &ProbeChunk, out: &mut OutputBuilder<'_>) -> Result<bool> {
        while let Some(&(probe_row, ptr)) = self.ready.front() {
            if out.is_full() {
                return Ok(true);
            }
            out.append_pair(&chunk.batch, probe_row as usize, self.row_table, ptr)?;
            self.ready.pop_front();
        }
        Ok(false)
    }

    // ── Scan-row-table contract ────────────────────────────────────────────

    pub(crate) fn needs_scan_row_table(&self) -> bool {
        self.kind.needs_scan_row_table()
    }

    /// Partition the scan work across workers; call once, after every probe
    /// worker has finished probing.
    pub(crate) fn init_scan_row_table(&mut self, worker_id: usize, worker_count: usize) {
        self.scan = Some(ScanRowTable::new(
            self.kind,
            worker_id,
            worker_count,
            self.row_table.num_partitions(),
        ));
    }

    pub(crate) fn scan_row_table(
        &mut self,
        out: &mut OutputBuilder<'_>,
        ctx: &ExecContext,
    ) -> Result<ProbeStep> {
        let scan = self.scan.as_mut().ok_or_else(|| {
            StrataError::InvariantViolated("scan_row_table before init_scan_row_table".into())
        })?;
        scan.advance(self.row_table, out, ctx)
    }

    pub(crate) fn scan_row_table_done(&self) -> bool {
        self.scan.as_ref().is_none_or(ScanRowTable::is_done)
    }
}
