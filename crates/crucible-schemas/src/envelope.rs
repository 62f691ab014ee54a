//! The queued representation of an evaluation: just enough to build a
//! workload spec, nothing more. No user identity, no history.

use serde::{Deserialize, Serialize};

use crate::{EvalId, Evaluation, Priority, RouteTag};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TaskEnvelope {
    pub eval_id: EvalId,
    pub runtime_image: String,
    pub language: String,
    pub code: String,
    pub timeout_seconds: u64,
    pub memory_bytes: u64,
    pub cpu_shares: u32,
    pub priority: Priority,
    pub preserve: bool,
    pub route_tag: RouteTag,
    /// How many times a dispatcher has picked this envelope up. Incremented
    /// by the queue on nack, read back for retry scheduling.
    pub attempt: u32,
}

impl TaskEnvelope {
    pub fn from_evaluation(eval: &Evaluation) -> Self {
        Self {
            eval_id: eval.id.clone(),
            runtime_image: eval.runtime_image.clone(),
            language: eval.language.clone(),
            code: eval.code.clone(),
            timeout_seconds: eval.timeout_seconds,
            memory_bytes: eval.memory_bytes,
            cpu_shares: eval.cpu_shares,
            priority: eval.priority,
            preserve: eval.preserve,
            route_tag: eval.route_tag,
            attempt: 0,
        }
    }
}
