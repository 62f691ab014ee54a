//! Request/response bodies for the HTTP surface.

use serde::{Deserialize, Serialize};

use crucible_kv::CountersSnapshot;
use crucible_schemas::{EvalId, Priority};

#[derive(Debug, Clone, Deserialize)]
pub struct SubmitRequest {
    pub code: String,
    pub language: Option<String>,
    pub image: Option<String>,
    pub timeout_seconds: Option<u64>,
    pub memory_bytes: Option<u64>,
    pub cpu_shares: Option<u32>,
    pub priority: Option<Priority>,
    pub preserve: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitResponse {
    pub eval_id: EvalId,
    pub status: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    /// Machine-readable kind, e.g. "validation".
    pub kind: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: &'static str,
    pub uptime_seconds: u64,
    pub queue_depth: usize,
    pub running: usize,
    pub pool_free: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusResponse {
    pub counters: CountersSnapshot,
    pub queue_depth: usize,
    pub legacy_depth: usize,
    pub dead_letters: usize,
    pub running: usize,
    pub pool_free: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ListParams {
    pub status: Option<String>,
    pub limit: Option<usize>,
    pub cursor: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EventStreamParams {
    /// Only events for this evaluation.
    pub eval_id: Option<String>,
    /// Only events of this kind (e.g. "completed").
    pub kind: Option<String>,
}
