//! Startup recovery.
//!
//! The ephemeral KV and the legacy queue both evaporate on restart; the
//! durable store does not. These jobs run once at boot, before any consumer
//! starts:
//!
//! - [`rebuild_running_set`] rescans non-terminal evaluations into the
//!   running-set so the `?status=running` listing is correct immediately.
//! - [`requeue_stranded_legacy`] re-enqueues legacy-routed evaluations stuck
//!   in `queued` (the legacy queue has no persistence; the primary broker
//!   redelivers on its own).

use std::sync::Arc;

use anyhow::Result;

use crucible_kv::RunningSet;
use crucible_queue::TaskQueue;
use crucible_schemas::{EvalStatus, RouteTag, TaskEnvelope};
use crucible_store::DurableStore;

/// Rebuild the running-set from the durable store. Returns the member count.
pub async fn rebuild_running_set(
    store: &Arc<dyn DurableStore>,
    running: &RunningSet,
) -> Result<usize> {
    running.clear();
    let mut count = 0usize;
    for eval in store.non_terminal().await? {
        if matches!(
            eval.status,
            EvalStatus::Provisioning | EvalStatus::Running
        ) {
            running.insert(&eval.id);
            count += 1;
        }
    }
    tracing::info!(count, "running-set rebuilt");
    Ok(count)
}

/// Re-enqueue legacy-routed evaluations stranded in `queued`. Returns how
/// many envelopes were re-enqueued.
pub async fn requeue_stranded_legacy(
    store: &Arc<dyn DurableStore>,
    legacy: &Arc<dyn TaskQueue>,
) -> Result<usize> {
    let mut count = 0usize;
    for eval in store.non_terminal().await? {
        if eval.status == EvalStatus::Queued && eval.route_tag == RouteTag::Legacy {
            legacy.enqueue(TaskEnvelope::from_evaluation(&eval)).await?;
            count += 1;
        }
    }
    if count > 0 {
        tracing::info!(count, "stranded legacy evaluations re-enqueued");
    }
    Ok(count)
}
