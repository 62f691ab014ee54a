//! Executor pool registry: idempotent acquire/release with TTL-bounded
//! leases.
//!
//! The broker's success and failure callbacks may both fire for the same
//! evaluation, so `release` MUST be safe to invoke repeatedly. A second
//! release (or a release after TTL expiry) is a counted no-op and never
//! produces a duplicate entry in the free set.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crucible_schemas::{EvalId, ExecutorId};

use crate::{Counters, MemoryKv};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReleaseOutcome {
    Released,
    /// `busy:{id}` was missing or held by a different evaluation.
    DoubleRelease,
}

/// Point-in-time view for `/health` and diagnostics.
#[derive(Clone, Debug)]
pub struct PoolSnapshot {
    pub free: Vec<ExecutorId>,
    pub busy: Vec<(ExecutorId, EvalId)>,
}

#[derive(Clone)]
pub struct ExecutorPool {
    kv: Arc<MemoryKv>,
    counters: Arc<Counters>,
}

impl ExecutorPool {
    pub fn new(kv: Arc<MemoryKv>, counters: Arc<Counters>) -> Self {
        Self { kv, counters }
    }

    /// Atomically claim any free executor for `eval_id`. Returns `None`
    /// within one lock round-trip when the pool is empty; no busy entry is
    /// created in that case.
    pub fn acquire(&self, eval_id: &EvalId, ttl: Duration) -> Option<ExecutorId> {
        self.kv.acquire_at(eval_id, ttl, Instant::now())
    }

    /// Idempotent release. Only the `(executor_id, eval_id)` pair that holds
    /// the lease can return it; everything else is a counted no-op.
    pub fn release(&self, executor_id: &ExecutorId, eval_id: &EvalId) -> ReleaseOutcome {
        let outcome = self.kv.release_at(executor_id, eval_id, Instant::now());
        if outcome == ReleaseOutcome::DoubleRelease {
            self.counters.double_release_detected.incr();
            tracing::warn!(
                executor_id = %executor_id,
                eval_id = %eval_id,
                "double release detected"
            );
        }
        outcome
    }

    pub fn snapshot(&self) -> PoolSnapshot {
        self.kv.pool_snapshot(Instant::now())
    }

    pub fn free_count(&self) -> usize {
        self.snapshot().free.len()
    }
}
