//! Execution collaborators: batch sources and sinks, the residual-predicate
//! evaluator, memory accounting, cancellation, and the shared per-run state
//! workers coordinate through.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use parking_lot::Mutex;
use strata_batch::Batch;
use strata_error::{Result, StrataError};

// ── Consumed interfaces ────────────────────────────────────────────────────

/// Produces input batches for one side of the join.
///
/// Implementations wrap their own failures as [`StrataError::Upstream`];
/// the engine propagates them unchanged.
pub trait BatchSource: Send {
    fn next_batch(&mut self) -> Result<Option<Batch>>;
}

/// Receives finished output batches. Called concurrently from every probe
/// worker; batches arrive in no particular order.
pub trait OutputSink: Send + Sync {
    fn push(&self, batch: Batch) -> Result<()>;
}

/// Evaluates the residual (non-equi) predicate over a materialized
/// candidate batch. Must return one verdict per candidate row.
pub trait ResidualFilter: Send + Sync {
    fn evaluate(&self, candidates: &Batch) -> Result<Vec<bool>>;
}

/// Accounts engine allocations against an external quota.
pub trait MemoryTracker: Send + Sync {
    /// Reserve `bytes`; an `Err` is treated like cancellation by workers.
    fn try_reserve(&self, bytes: usize) -> Result<()>;
    fn release(&self, bytes: usize);
}

/// Tracker that never refuses.
#[derive(Debug, Default)]
pub struct UnboundedTracker;

impl MemoryTracker for UnboundedTracker {
    fn try_reserve(&self, _bytes: usize) -> Result<()> {
        Ok(())
    }

    fn release(&self, _bytes: usize) {}
}

/// Tracker with a fixed byte quota.
#[derive(Debug)]
pub struct QuotaTracker {
    limit: usize,
    used: AtomicUsize,
}

impl QuotaTracker {
    #[must_use]
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            used: AtomicUsize::new(0),
        }
    }

    #[must_use]
    pub fn used(&self) -> usize {
        self.used.load(Ordering::Relaxed)
    }
}

impl MemoryTracker for QuotaTracker {
    fn try_reserve(&self, bytes: usize) -> Result<()> {
        let previous = self.used.fetch_add(bytes, Ordering::Relaxed);
        if previous.saturating_add(bytes) > self.limit {
            self.used.fetch_sub(bytes, Ordering::Relaxed);
            return Err(StrataError::OutOfQuota {
                requested: bytes,
                limit: self.limit,
            });
        }
        Ok(())
    }

    fn release(&self, bytes: usize) {
        self.used.fetch_sub(bytes, Ordering::Relaxed);
    }
}

/// Shared cancellation flag; clone freely, cancel from anywhere.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Relaxed);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Relaxed)
    }
}

// ── Convenience implementations ────────────────────────────────────────────

/// In-memory batch source, mostly for tests and embedding.
#[derive(Debug, Default)]
pub struct VecBatchSource {
    batches: VecDeque<Batch>,
}

impl VecBatchSource {
    #[must_use]
    pub fn new(batches: Vec<Batch>) -> Self {
        Self {
            batches: batches.into(),
        }
    }
}

impl BatchSource for VecBatchSource {
    fn next_batch(&mut self) -> Result<Option<Batch>> {
        Ok(self.batches.pop_front())
    }
}

/// Sink that collects every pushed batch.
#[derive(Debug, Default)]
pub struct CollectSink {
    batches: Mutex<Vec<Batch>>,
}

impl CollectSink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Drain the collected batches.
    pub fn take_batches(&self) -> Vec<Batch> {
        std::mem::take(&mut self.batches.lock())
    }
}

impl OutputSink for CollectSink {
    fn push(&self, batch: Batch) -> Result<()> {
        self.batches.lock().push(batch);
        Ok(())
    }
}

// ── Shared run state ───────────────────────────────────────────────────────

/// State shared by every worker of one engine: the cancellation token, the
/// stage abort flag, the first-error cell, and memory accounting.
pub(crate) struct ExecContext {
    cancel: CancelToken,
    abort: AtomicBool,
    first_error: Mutex<Option<StrataError>>,
    tracker: Arc<dyn MemoryTracker>,
    reserved: AtomicUsize,
}

impl ExecContext {
    pub(crate) fn new(cancel: CancelToken, tracker: Arc<dyn MemoryTracker>) -> Self {
        Self {
            cancel,
            abort: AtomicBool::new(false),
            first_error: Mutex::new(None),
            tracker,
            reserved: AtomicUsize::new(0),
        }
    }

    pub(crate) fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub(crate) fn tracker_handle(&self) -> Arc<dyn MemoryTracker> {
        Arc::clone(&self.tracker)
    }

    /// Poll for cancellation or a sibling's abort. Workers call this at
    /// batch boundaries and inside long chain walks.
    pub(crate) fn check(&self) -> Result<()> {
        if self.cancel.is_cancelled() || self.abort.load(Ordering::Relaxed) {
            return Err(StrataError::Cancelled);
        }
        Ok(())
    }

    /// Record a worker's failure. The first real error wins; a bare
    /// `Cancelled` from a worker that merely observed the abort flag never
    /// displaces it.
    pub(crate) fn record(&self, err: StrataError) {
        self.abort.store(true, Ordering::Relaxed);
        let mut slot = self.first_error.lock();
        let replace = match &*slot {
            None => true,
            Some(StrataError::Cancelled) => !matches!(err, StrataError::Cancelled),
            Some(_) => false,
        };
        if replace {
            *slot = Some(err);
        }
    }

    /// The error to surface after a stage, if any.
    pub(crate) fn take_error(&self) -> Option<StrataError> {
        self.first_error.lock().take()
    }

    pub(crate) fn aborted(&self) -> bool {
        self.abort.load(Ordering::Relaxed)
    }

    /// Clear the abort flag between stages after an error-free run.
    pub(crate) fn reset_for_next_stage(&self) {
        self.abort.store(false, Ordering::Relaxed);
    }

    pub(crate) fn reserve(&self, bytes: usize) -> Result<()> {
        self.tracker.try_reserve(bytes)?;
        self.reserved.fetch_add(bytes, Ordering::Relaxed);
        Ok(())
    }

    pub(crate) fn release(&self, bytes: usize) {
        self.tracker.release(bytes);
        self.reserved.fetch_sub(bytes, Ordering::Relaxed);
    }

    /// Return every outstanding reservation to the tracker (engine
    /// teardown).
    pub(crate) fn release_all(&self) {
        let bytes = self.reserved.swap(0, Ordering::Relaxed);
        if bytes > 0 {
            self.tracker.release(bytes);
        }
    }
}

impl Drop for ExecContext {
    fn drop(&mut self) {
        self.release_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quota_tracker_enforces_limit() {
        let tracker = QuotaTracker::new(100);
        tracker.try_reserve(60).unwrap();
        tracker.try_reserve(40).unwrap();
        let err = tracker.try_reserve(1).unwrap_err();
        assert!(matches!(err, StrataError::OutOfQuota { requested: 1, limit: 100 }));
        // The failed reservation must not leak into the accounting.
        assert_eq!(tracker.used(), 100);
        tracker.release(100);
        assert_eq!(tracker.used(), 0);
    }

    #[test]
    fn cancel_token_is_shared() {
        let token = CancelToken::new();
        let clone = token.clone();
        assert!(!clone.is_cancelled());
        token.cancel();
        assert!(clone.is_cancelled());
    }

    #[test]
    fn first_real_error_wins() {
        let ctx = ExecContext::new(CancelToken::new(), Arc::new(UnboundedTracker));
        ctx.record(StrataError::Cancelled);
        ctx.record(StrataError::Upstream("disk".into()));
        ctx.record(StrataError::Upstream("late".into()));
        let err = ctx.take_error().unwrap();
        assert!(matches!(err, StrataError::Upstream(ref m) if m == "disk"));
    }

    #[test]
    fn check_observes_abort_and_cancel() {
        let ctx = ExecContext::new(CancelToken::new(), Arc::new(UnboundedTracker));
        assert!(ctx.check().is_ok());
        ctx.record(StrataError::Upstream("x".into()));
        assert!(ctx.check().is_err());

        let token = CancelToken::new();
        let ctx = ExecContext::new(token.clone(), Arc::new(UnboundedTracker));
        token.cancel();
        assert!(matches!(ctx.check(), Err(StrataError::Cancelled)));
    }

    #[test]
    fn release_all_returns_reservations() {
        let tracker = Arc::new(QuotaTracker::new(1000));
        let ctx = ExecContext::new(CancelToken::new(), tracker.clone());
        ctx.reserve(300).unwrap();
        ctx.reserve(200).unwrap();
        assert_eq!(tracker.used(), 500);
        ctx.release(100);
        assert_eq!(tracker.used(), 400);
        ctx.release_all();
        assert_eq!(tracker.used(), 0);
    }
}
