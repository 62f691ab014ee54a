//! Shared data model for the Crucible evaluation control plane.
//!
//! Everything that crosses a component boundary lives here: the evaluation
//! record, the status machine, the queued task envelope, bus event kinds,
//! and the machine-readable error taxonomy. No I/O in this crate.

use chrono::{DateTime, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};

pub mod envelope;
pub mod event;
pub mod output;

pub use envelope::TaskEnvelope;
pub use event::{lifecycle_sequence, EventKind};
pub use output::{truncate_output, TruncatedOutput};

// ---------------------------------------------------------------------------
// EvalId
// ---------------------------------------------------------------------------

/// Server-issued evaluation id.
///
/// Layout: 12 lowercase hex chars of unix-epoch milliseconds followed by
/// 20 hex chars of randomness, so lexicographic order approximates
/// submission order while ids stay unguessable.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EvalId(pub String);

impl EvalId {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Allocate a fresh id from the current wall clock.
    pub fn generate() -> Self {
        Self::from_parts(Utc::now(), rand::thread_rng().next_u64(), rand::random())
    }

    /// Deterministic constructor for tests and id-stability checks.
    pub fn from_parts(at: DateTime<Utc>, r0: u64, r1: u16) -> Self {
        let millis = at.timestamp_millis().max(0) as u64;
        Self(format!("{millis:012x}{r0:016x}{r1:04x}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for EvalId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

// ---------------------------------------------------------------------------
// ExecutorId
// ---------------------------------------------------------------------------

/// Identity of one sandbox backend. Runs at most one evaluation at a time.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExecutorId(pub String);

impl ExecutorId {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ExecutorId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

// ---------------------------------------------------------------------------
// Priority
// ---------------------------------------------------------------------------

/// Scheduling class. Consumers drain in declaration order; no starvation
/// guarantee is made for lower classes under sustained urgent load.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Urgent,
    Normal,
    Batch,
    Maintenance,
}

impl Priority {
    /// Drain order, highest first.
    pub const ALL: [Priority; 4] = [
        Priority::Urgent,
        Priority::Normal,
        Priority::Batch,
        Priority::Maintenance,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Urgent => "urgent",
            Priority::Normal => "normal",
            Priority::Batch => "batch",
            Priority::Maintenance => "maintenance",
        }
    }
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Normal
    }
}

// ---------------------------------------------------------------------------
// RouteTag
// ---------------------------------------------------------------------------

/// Which queue the router bound this evaluation to. Recorded on the row so
/// the two queues can be compared during the migration window.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RouteTag {
    Primary,
    Legacy,
}

impl RouteTag {
    pub fn as_str(&self) -> &'static str {
        match self {
            RouteTag::Primary => "primary",
            RouteTag::Legacy => "legacy",
        }
    }
}

// ---------------------------------------------------------------------------
// EvalStatus
// ---------------------------------------------------------------------------

/// Lifecycle state machine.
///
/// ```text
/// submitted → queued → provisioning → running → completed
///                               ↘             ↘ failed
///                                → failed       ↘ cancelled
/// ```
///
/// Status only ever advances along this DAG; the storage worker drops any
/// event that would move it backwards or overwrite a terminal state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvalStatus {
    Submitted,
    Queued,
    Provisioning,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl EvalStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            EvalStatus::Completed | EvalStatus::Failed | EvalStatus::Cancelled
        )
    }

    /// True iff `self → next` is an edge of the status DAG.
    pub fn can_transition_to(&self, next: EvalStatus) -> bool {
        use EvalStatus::*;
        match (self, next) {
            (Submitted, Queued) => true,
            (Queued, Provisioning) => true,
            // A queued evaluation can die without ever provisioning
            // (dlq_exhausted) or be administratively cancelled.
            (Queued, Failed) | (Queued, Cancelled) => true,
            (Provisioning, Running) => true,
            (Provisioning, Failed) | (Provisioning, Cancelled) => true,
            (Running, Completed) | (Running, Failed) | (Running, Cancelled) => true,
            _ => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EvalStatus::Submitted => "submitted",
            EvalStatus::Queued => "queued",
            EvalStatus::Provisioning => "provisioning",
            EvalStatus::Running => "running",
            EvalStatus::Completed => "completed",
            EvalStatus::Failed => "failed",
            EvalStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "submitted" => EvalStatus::Submitted,
            "queued" => EvalStatus::Queued,
            "provisioning" => EvalStatus::Provisioning,
            "running" => EvalStatus::Running,
            "completed" => EvalStatus::Completed,
            "failed" => EvalStatus::Failed,
            "cancelled" => EvalStatus::Cancelled,
            _ => return None,
        })
    }
}

// ---------------------------------------------------------------------------
// ErrorKind
// ---------------------------------------------------------------------------

/// Machine-readable failure classification, carried on the evaluation row as
/// `last_error_kind` and inside failure events. Dispositions are owned by the
/// component that raises each kind; this enum only names them.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    IngressUnavailable,
    PoolEmpty,
    ProvisioningTimeout,
    Timeout,
    ApiUnavailable,
    ExecutorCrash,
    UserError,
    DoubleReleaseDetected,
    OutOfOrderEvent,
    DlqExhausted,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Validation => "validation",
            ErrorKind::IngressUnavailable => "ingress_unavailable",
            ErrorKind::PoolEmpty => "pool_empty",
            ErrorKind::ProvisioningTimeout => "provisioning_timeout",
            ErrorKind::Timeout => "timeout",
            ErrorKind::ApiUnavailable => "api_unavailable",
            ErrorKind::ExecutorCrash => "executor_crash",
            ErrorKind::UserError => "user_error",
            ErrorKind::DoubleReleaseDetected => "double_release_detected",
            ErrorKind::OutOfOrderEvent => "out_of_order_event",
            ErrorKind::DlqExhausted => "dlq_exhausted",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "validation" => ErrorKind::Validation,
            "ingress_unavailable" => ErrorKind::IngressUnavailable,
            "pool_empty" => ErrorKind::PoolEmpty,
            "provisioning_timeout" => ErrorKind::ProvisioningTimeout,
            "timeout" => ErrorKind::Timeout,
            "api_unavailable" => ErrorKind::ApiUnavailable,
            "executor_crash" => ErrorKind::ExecutorCrash,
            "user_error" => ErrorKind::UserError,
            "double_release_detected" => ErrorKind::DoubleReleaseDetected,
            "out_of_order_event" => ErrorKind::OutOfOrderEvent,
            "dlq_exhausted" => ErrorKind::DlqExhausted,
            _ => return None,
        })
    }
}

// ---------------------------------------------------------------------------
// Evaluation
// ---------------------------------------------------------------------------

/// The primary record: one submission and its full lifecycle.
///
/// The durable store owns the history of this struct; the storage worker is
/// the only component that writes lifecycle fields after the initial insert.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Evaluation {
    pub id: EvalId,
    /// Untrusted user program. Passed to drivers as data, never interpolated
    /// into a shell line.
    pub code: String,
    pub language: String,
    pub runtime_image: String,
    pub timeout_seconds: u64,
    pub memory_bytes: u64,
    pub cpu_shares: u32,
    pub priority: Priority,
    /// Suppresses immediate cleanup of a failed workload, for debugging.
    pub preserve: bool,
    pub route_tag: RouteTag,
    pub submitted_at: DateTime<Utc>,
    pub status: EvalStatus,
    pub queued_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub exit_code: Option<i32>,
    /// Combined stdout+stderr, truncated to the configured cap.
    pub output: Option<String>,
    pub output_truncated: bool,
    /// Pre-truncation size in bytes. Always populated on terminal states.
    pub output_size: u64,
    pub error: Option<String>,
    pub executor_id: Option<ExecutorId>,
    pub attempts: u32,
    pub last_error_kind: Option<ErrorKind>,
}

impl Evaluation {
    /// Fresh record as written by ingress: status `queued`, one row, nothing
    /// started yet.
    #[allow(clippy::too_many_arguments)]
    pub fn new_queued(
        id: EvalId,
        code: String,
        language: String,
        runtime_image: String,
        timeout_seconds: u64,
        memory_bytes: u64,
        cpu_shares: u32,
        priority: Priority,
        preserve: bool,
        route_tag: RouteTag,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            code,
            language,
            runtime_image,
            timeout_seconds,
            memory_bytes,
            cpu_shares,
            priority,
            preserve,
            route_tag,
            submitted_at: now,
            status: EvalStatus::Queued,
            queued_at: Some(now),
            started_at: None,
            finished_at: None,
            exit_code: None,
            output: None,
            output_truncated: false,
            output_size: 0,
            error: None,
            executor_id: None,
            attempts: 0,
            last_error_kind: None,
        }
    }
}
