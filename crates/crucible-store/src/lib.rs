//! The durable store: evaluations table (primary record), events table
//! (append-only audit), idempotency keys.
//!
//! # Writer discipline
//!
//! Ingress performs exactly one write per evaluation — the initial insert.
//! Every lifecycle write after that goes through the storage worker, which
//! is the single caller of the transition methods. All other components
//! treat this store as read-through. That one-writer rule is what lets the
//! transition methods enforce the status DAG without application locks.
//!
//! Two implementations: [`MemStore`] (deterministic, for tests and local
//! runs) and [`PgStore`] (PostgreSQL via sqlx, embedded migrations).

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crucible_events::BusEvent;
use crucible_schemas::{ErrorKind, EvalId, EvalStatus, Evaluation};

pub mod mem;
pub mod pg;

pub use mem::MemStore;
pub use pg::{connect_from_env, migrate, PgStore, ENV_DB_URL};

// ---------------------------------------------------------------------------
// Transition outcomes
// ---------------------------------------------------------------------------

/// What a lifecycle write did. The storage worker maps `Dropped` to an
/// `out_of_order_event` anomaly; everything else is normal operation under
/// at-least-once delivery.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransitionOutcome {
    /// State advanced.
    Applied,
    /// Idempotent replay of a step already taken; nothing changed.
    Unchanged,
    /// Row already terminal; only a missing `started_at` was backfilled.
    BackfilledTimestamp,
    /// The write would violate the DAG (or overwrite a terminal state) and
    /// was refused.
    Dropped,
    NotFound,
}

/// Terminal fields, written in one atomic step together with the status.
#[derive(Clone, Debug)]
pub struct TerminalResult {
    pub status: EvalStatus,
    pub finished_at: DateTime<Utc>,
    pub exit_code: Option<i32>,
    pub output: Option<String>,
    pub output_truncated: bool,
    pub output_size: u64,
    pub error: Option<String>,
    pub error_kind: Option<ErrorKind>,
}

/// Result of the idempotency-key check at ingress.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum IdempotencyOutcome {
    /// Key unseen (or expired): the supplied id was recorded.
    New,
    /// Key seen within the window: reuse this id, create nothing.
    Existing(EvalId),
}

/// Listing parameters for `GET /evaluations`. Cursor is the last id of the
/// previous page; ids sort chronologically so paging by id is paging by
/// submission time.
#[derive(Clone, Debug, Default)]
pub struct ListQuery {
    pub status: Option<EvalStatus>,
    pub limit: usize,
    pub cursor: Option<EvalId>,
}

// ---------------------------------------------------------------------------
// DurableStore
// ---------------------------------------------------------------------------

#[async_trait]
pub trait DurableStore: Send + Sync {
    /// Write-once initial insert. Returns false (and changes nothing) when
    /// the id already exists.
    async fn insert_new(&self, eval: &Evaluation) -> Result<bool>;

    async fn get(&self, id: &EvalId) -> Result<Option<Evaluation>>;

    /// Newest-first listing with optional status filter and cursor.
    async fn list(&self, query: &ListQuery) -> Result<Vec<Evaluation>>;

    /// `queued → provisioning` (idempotent on replay). Sets `started_at` if
    /// unset, records the executor, and raises `attempts` to `attempt`.
    async fn mark_provisioning(
        &self,
        id: &EvalId,
        at: DateTime<Utc>,
        executor_id: &str,
        attempt: u32,
    ) -> Result<TransitionOutcome>;

    /// `provisioning → running` (idempotent on replay). On an
    /// already-terminal row, backfills a missing `started_at` and leaves
    /// everything else alone.
    async fn mark_running(&self, id: &EvalId, at: DateTime<Utc>) -> Result<TransitionOutcome>;

    /// Terminal write. Applies from ANY non-terminal status — a terminal
    /// event whose intermediate steps are merely delayed still wins; the
    /// stragglers reduce to timestamp backfills when they arrive. Refused
    /// when the row is already terminal (a replay of the same terminal
    /// status reports `Unchanged`).
    async fn finalize(&self, id: &EvalId, result: &TerminalResult) -> Result<TransitionOutcome>;

    /// Append to the audit table. Returns false for a duplicate
    /// `(eval_id, sequence)` — inserting the same pair twice is a no-op.
    async fn append_event(&self, event: &BusEvent) -> Result<bool>;

    /// Audit trail for one evaluation, sequence-ordered.
    async fn events_for(&self, id: &EvalId) -> Result<Vec<BusEvent>>;

    /// Recovery scan: every evaluation not yet in a terminal state.
    async fn non_terminal(&self) -> Result<Vec<Evaluation>>;

    /// Check-and-set for the Idempotency-Key header. Entries older than
    /// `window` are treated as absent and overwritten.
    async fn idempotency_check_or_put(
        &self,
        key: &str,
        id: &EvalId,
        now: DateTime<Utc>,
        window: std::time::Duration,
    ) -> Result<IdempotencyOutcome>;
}

/// Every status a terminal write may replace.
pub(crate) const NON_TERMINAL: [EvalStatus; 4] = [
    EvalStatus::Submitted,
    EvalStatus::Queued,
    EvalStatus::Provisioning,
    EvalStatus::Running,
];
