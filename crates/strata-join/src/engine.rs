//! The engine: configuration, the two-phase drive, and worker scheduling.
//!
//! [`HashJoinEngine`] is configured once from a [`HashJoinDesc`] and then
//! driven in two phases: [`HashJoinEngine::build`] consumes the build side
//! completely and freezes the row table and hash tables;
//! [`HashJoinEngine::probe`] streams the probe side through `C` workers and,
//! for build-sided join types, finishes with the scan-row-table sweep.
//!
//! Barriers: pre-build and linking each end by joining their worker scope
//! (build.rs). Inside the probe phase every worker passes a
//! `std::sync::Barrier` between its last probe batch and its scan shard,
//! so no used flag is read until every worker stopped writing them.
//! Workers reach the barrier exactly once, errors included; a worker that
//! failed records its error first, and the survivors observe the abort
//! flag right after the barrier.

use std::sync::Arc;

use parking_lot::Mutex;
use strata_error::{Result, StrataError};

use crate::build::{BuiltJoin, run_build};
use crate::desc::HashJoinDesc;
use crate::layout::TableMeta;
use crate::output::{OutputBuilder, approx_batch_bytes};
use crate::probe::{JoinProbe, ProbeStep};
use crate::runtime::{
    BatchSource, CancelToken, ExecContext, MemoryTracker, OutputSink, ResidualFilter,
    UnboundedTracker,
};

/// A configured hash join, reusable across one build and one probe pass.
pub struct HashJoinEngine {
    desc: HashJoinDesc,
    meta: TableMeta,
    residual: Option<Arc<dyn ResidualFilter>>,
    ctx: ExecContext,
    built: Option<BuiltJoin>,
}

impl HashJoinEngine {
    /// Validate the description and set the engine up with an unbounded
    /// memory tracker and a fresh cancellation token.
    pub fn new(desc: HashJoinDesc) -> Result<Self> {
        desc.validate()?;
        let predicate_cols = desc
            .residual
            .as_ref()
            .map_or(&[][..], |residual| residual.build_cols.as_slice());
        let meta = TableMeta::new(&desc.build_schema, &desc.build_keys, predicate_cols);
        Ok(Self {
            meta,
            residual: None,
            ctx: ExecContext::new(CancelToken::new(), Arc::new(UnboundedTracker)),
            built: None,
            desc,
        })
    }

    /// Attach the residual-predicate evaluator. Required when the
    /// description declares a residual predicate.
    #[must_use]
    pub fn with_residual_filter(mut self, filter: Arc<dyn ResidualFilter>) -> Self {
        self.residual = Some(filter);
        self
    }

    /// Route allocations through an external memory tracker.
    #[must_use]
    pub fn with_memory_tracker(mut self, tracker: Arc<dyn MemoryTracker>) -> Self {
        self.ctx = ExecContext::new(self.ctx.cancel_token(), tracker);
        self
    }

    /// Use an externally owned cancellation token.
    #[must_use]
    pub fn with_cancel_token(mut self, token: CancelToken) -> Self {
        let tracker = self.ctx.tracker_handle();
        self.ctx = ExecContext::new(token, tracker);
        self
    }

    /// The token that cancels this engine's current and future phases.
    pub fn cancel_token(&self) -> CancelToken {
        self.ctx.cancel_token()
    }

    pub fn desc(&self) -> &HashJoinDesc {
        &self.desc
    }

    /// Phase one: drain the build source and freeze the hash table.
    pub fn build(&mut self, source: &mut dyn BatchSource) -> Result<()> {
        if self.built.is_some() {
            return Err(StrataError::InvariantViolated(
                "build called twice on one engine".into(),
            ));
        }
        let built = run_build(&self.desc, &self.meta, &self.ctx, source)?;
        self.built = Some(built);
        Ok(())
    }

    /// Phase two: probe, then (for build-sided join types) scan the row
    /// table for the rows probing could not finish.
    pub fn probe(&mut self, source: &mut dyn BatchSource, sink: &dyn OutputSink) -> Result<()> {
        let built = self.built.as_ref().ok_or_else(|| {
            StrataError::InvariantViolated("probe called before build".into())
        })?;
        if self.desc.residual.is_some() && self.residual.is_none() {
            return Err(StrataError::InvariantViolated(
                "description declares a residual predicate but no evaluator is attached".into(),
            ));
        }
        self.ctx.reset_for_next_stage();

        let workers = self.desc.concurrency;
        let barrier = std::sync::Barrier::new(workers);
        let source = Mutex::new(source);

        let desc = &self.desc;
        let meta = &self.meta;
        let ctx = &self.ctx;
        let residual = self.residual.as_deref();
        let barrier_ref = &barrier;
        let source_ref = &source;

        std::thread::scope(|s| {
            for worker_id in 0..workers {
                s.spawn(move || {
                    probe_worker(
                        worker_id, workers, desc, meta, built, residual, ctx, source_ref, sink,
                        barrier_ref,
                    );
                });
            }
        });

        tracing::debug!(
            workers,
            join_type = ?self.desc.join_type,
            "probe stage complete"
        );
        self.ctx.take_error().map_or(Ok(()), Err)
    }
}

impl Drop for HashJoinEngine {
    fn drop(&mut self) {
        // Row arenas and bucket arrays die with the engine; hand their
        // reservations back to the tracker.
        self.ctx.release_all();
    }
}

/// One probe worker: drain the shared source, hit the barrier, run the scan
/// shard, flush the remainder.
#[allow(clippy::too_many_arguments)]
fn probe_worker(
    worker_id: usize,
    workers: usize,
    desc: &HashJoinDesc,
    meta: &TableMeta,
    built: &BuiltJoin,
    residual: Option<&dyn ResidualFilter>,
    ctx: &ExecContext,
    source: &Mutex<&mut dyn BatchSource>,
    sink: &dyn OutputSink,
    barrier: &std::sync::Barrier,
) {
    let mut probe = JoinProbe::new(desc, meta, &built.row_table, &built.hash_table, residual);
    let mut out = OutputBuilder::new(desc, meta);

    if let Err(err) = probe_phase(&mut probe, &mut out, ctx, source, sink) {
        ctx.record(err);
    }

    // Barrier 3: no scan shard starts until every worker stopped probing
    // (used flags quiesce here).
    barrier.wait();

    if ctx.check().is_ok() {
        if let Err(err) = scan_phase(worker_id, workers, &mut probe, &mut out, ctx, sink) {
            ctx.record(err);
        }
    }
}

fn probe_phase(
    probe: &mut JoinProbe<'_>,
    out: &mut OutputBuilder<'_>,
    ctx: &ExecContext,
    source: &Mutex<&mut dyn BatchSource>,
    sink: &dyn OutputSink,
) -> Result<()> {
    loop {
        ctx.check()?;
        let batch = source.lock().next_batch()?;
        let Some(batch) = batch else { break };
        if batch.num_rows() == 0 {
            continue;
        }
        probe.set_chunk(batch)?;
        while !probe.current_chunk_done() {
            if probe.probe(out, ctx)? == ProbeStep::BatchFull {
                drain_output(out, ctx, sink)?;
            }
        }
    }
    if !probe.needs_scan_row_table() {
        // Nothing else will write into this builder; flush the remainder
        // now rather than after the barrier.
        drain_output(out, ctx, sink)?;
    }
    Ok(())
}

fn scan_phase(
    worker_id: usize,
    workers: usize,
    probe: &mut JoinProbe<'_>,
    out: &mut OutputBuilder<'_>,
    ctx: &ExecContext,
    sink: &dyn OutputSink,
) -> Result<()> {
    if probe.needs_scan_row_table() {
        probe.init_scan_row_table(worker_id, workers);
        while !probe.scan_row_table_done() {
            if probe.scan_row_table(out, ctx)? == ProbeStep::BatchFull {
                drain_output(out, ctx, sink)?;
            }
        }
        drain_output(out, ctx, sink)?;
    }
    Ok(())
}

/// Hand a finished output batch to the sink. The batch is accounted while
/// the engine still holds it and released at hand-off; the sink owns it
/// afterwards.
fn drain_output(
    out: &mut OutputBuilder<'_>,
    ctx: &ExecContext,
    sink: &dyn OutputSink,
) -> Result<()> {
    if out.row_count() == 0 {
        return Ok(());
    }
    let batch = out.finish_batch()?;
    let bytes = approx_batch_bytes(&batch);
    ctx.reserve(bytes)?;
    let pushed = sink.push(batch);
    ctx.release(bytes);
    pushed
}
