//! The dispatch queue layer.
//!
//! Two interchangeable implementations behind one contract:
//! [`PriorityQueue`] (the primary: priority classes, visibility timeouts,
//! retries, dead-letter queue) and [`LegacyQueue`] (in-process FIFO with an
//! HTTP surface, kept only for the migration window). The [`Router`] picks
//! one per submission by percentage.
//!
//! Delivery is at-least-once everywhere: a reservation that is neither
//! acked nor nacked re-surfaces when its visibility deadline passes, so
//! consumers must be idempotent.

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crucible_schemas::TaskEnvelope;

pub mod legacy;
pub mod primary;
pub mod router;

pub use legacy::{legacy_router, LegacyClient, LegacyQueue};
pub use primary::PriorityQueue;
pub use router::{Router, RouterConfig};

// ---------------------------------------------------------------------------
// TaskQueue contract
// ---------------------------------------------------------------------------

/// Opaque handle to one in-flight reservation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReservationToken(pub u64);

#[derive(Clone, Debug)]
pub struct Reservation {
    pub token: ReservationToken,
    pub envelope: TaskEnvelope,
}

/// What a nack did with the envelope.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum NackOutcome {
    /// Scheduled for redelivery after `delay`.
    Requeued { delay: Duration },
    /// Retry budget exhausted; parked on the dead-letter queue.
    DeadLettered,
}

/// An envelope that exhausted its retries, with the error that killed it.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DeadLetter {
    pub envelope: TaskEnvelope,
    pub last_error: String,
    pub dead_lettered_at: DateTime<Utc>,
}

#[async_trait]
pub trait TaskQueue: Send + Sync {
    async fn enqueue(&self, envelope: TaskEnvelope) -> Result<()>;

    /// Reserve the next envelope in priority order. The reservation is
    /// invisible to other consumers until its visibility window elapses or
    /// it is acked/nacked. `overhead` is the fixed part of the window; the
    /// implementation extends it by the envelope's own `timeout_seconds`, so
    /// a reservation always outlives the evaluation it covers.
    async fn reserve(&self, overhead: Duration) -> Result<Option<Reservation>>;

    async fn ack(&self, token: ReservationToken) -> Result<()>;

    async fn nack(&self, token: ReservationToken, error: &str) -> Result<NackOutcome>;

    /// Put a reserved envelope back after `delay` WITHOUT burning a retry.
    /// Used when dispatch could not start at all (empty executor pool) —
    /// backpressure, not failure.
    async fn requeue(&self, token: ReservationToken, delay: Duration) -> Result<()>;

    /// Ready + delayed envelopes (excludes in-flight reservations).
    async fn depth(&self) -> usize;

    async fn dead_letters(&self) -> Vec<DeadLetter>;
}
