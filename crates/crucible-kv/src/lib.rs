//! Ephemeral scheduling state: the executor pool, the running-set, and the
//! aggregate counters.
//!
//! # Invariant (enforced at one choke-point)
//!
//! Every mutation of `pool.free` / `busy:{id}` happens inside a single
//! critical section of [`MemoryKv`] — the in-process equivalent of a
//! server-side script on a remote KV. An executor id is therefore in exactly
//! one of `pool.free` or `busy:*` at every observable instant.
//!
//! This store is authoritative for in-flight scheduling only; it is rebuilt
//! from the durable store on recovery and owns no history.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crucible_schemas::{EvalId, ExecutorId};

pub mod counters;
pub mod pool;
pub mod running;

pub use counters::{Counters, CountersSnapshot};
pub use pool::{ExecutorPool, PoolSnapshot, ReleaseOutcome};
pub use running::RunningSet;

// ---------------------------------------------------------------------------
// MemoryKv
// ---------------------------------------------------------------------------

struct BusyLease {
    eval_id: EvalId,
    deadline: Instant,
}

#[derive(Default)]
struct KvState {
    /// `pool.free` — ordered so acquisition is deterministic under test.
    free: BTreeSet<ExecutorId>,
    /// `busy:{executor_id}` — current evaluation plus expiry deadline.
    busy: BTreeMap<ExecutorId, BusyLease>,
    /// `running_evaluations`.
    running: BTreeSet<EvalId>,
}

/// The shared ephemeral KV. Cheap to clone via `Arc` at the call sites.
pub struct MemoryKv {
    state: Mutex<KvState>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(KvState::default()),
        }
    }

    /// Register the configured executor fleet as free. Idempotent; ids
    /// currently leased are left alone.
    pub fn seed_pool(&self, ids: impl IntoIterator<Item = ExecutorId>) {
        let mut st = self.lock();
        for id in ids {
            if !st.busy.contains_key(&id) {
                st.free.insert(id);
            }
        }
    }

    pub(crate) fn lock(&self) -> std::sync::MutexGuard<'_, KvState> {
        // A poisoned lock means a panic mid-critical-section; the state is
        // a rebuildable cache, so continuing with it is the lesser evil.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    // -- lease script -------------------------------------------------------

    pub(crate) fn acquire_at(
        &self,
        eval_id: &EvalId,
        ttl: Duration,
        now: Instant,
    ) -> Option<ExecutorId> {
        let mut st = self.lock();
        Self::sweep_expired(&mut st, now);

        let id = st.free.iter().next().cloned()?;
        st.free.remove(&id);
        st.busy.insert(
            id.clone(),
            BusyLease {
                eval_id: eval_id.clone(),
                deadline: now + ttl,
            },
        );
        Some(id)
    }

    pub(crate) fn release_at(
        &self,
        executor_id: &ExecutorId,
        eval_id: &EvalId,
        now: Instant,
    ) -> ReleaseOutcome {
        let mut st = self.lock();
        Self::sweep_expired(&mut st, now);

        match st.busy.get(executor_id) {
            Some(lease) if lease.eval_id == *eval_id => {
                st.busy.remove(executor_id);
                // insert() on the set is a no-op when present: a double
                // release can never mint a duplicate free entry.
                st.free.insert(executor_id.clone());
                ReleaseOutcome::Released
            }
            _ => ReleaseOutcome::DoubleRelease,
        }
    }

    /// Move leases past their deadline back into the free set. Runs inside
    /// every lease-script entry so expiry needs no background task.
    fn sweep_expired(st: &mut KvState, now: Instant) {
        let expired: Vec<ExecutorId> = st
            .busy
            .iter()
            .filter(|(_, lease)| now >= lease.deadline)
            .map(|(id, _)| id.clone())
            .collect();
        for id in expired {
            st.busy.remove(&id);
            st.free.insert(id);
        }
    }

    pub(crate) fn pool_snapshot(&self, now: Instant) -> PoolSnapshot {
        let mut st = self.lock();
        Self::sweep_expired(&mut st, now);
        PoolSnapshot {
            free: st.free.iter().cloned().collect(),
            busy: st
                .busy
                .iter()
                .map(|(id, lease)| (id.clone(), lease.eval_id.clone()))
                .collect(),
        }
    }

    // -- running-set --------------------------------------------------------

    pub(crate) fn running_insert(&self, id: &EvalId) -> bool {
        self.lock().running.insert(id.clone())
    }

    pub(crate) fn running_remove(&self, id: &EvalId) -> bool {
        self.lock().running.remove(id)
    }

    pub(crate) fn running_members(&self) -> Vec<EvalId> {
        self.lock().running.iter().cloned().collect()
    }

    pub(crate) fn running_contains(&self, id: &EvalId) -> bool {
        self.lock().running.contains(id)
    }

    pub(crate) fn running_len(&self) -> usize {
        self.lock().running.len()
    }

    pub(crate) fn running_clear(&self) {
        self.lock().running.clear();
    }
}

impl Default for MemoryKv {
    fn default() -> Self {
        Self::new()
    }
}
