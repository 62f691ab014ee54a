//! The cleanup controller: watches dispatched workloads and deletes the
//! ones whose time has come.
//!
//! Policy:
//!
//! | phase      | preserve=true            | preserve=false            |
//! |------------|--------------------------|---------------------------|
//! | succeeded  | TTL delete (short)       | TTL delete (short)        |
//! | failed     | TTL delete (long)        | immediate, 10 s grace     |
//! | running    | no action                | no action                 |
//! | unknown    | no action                | no action                 |
//!
//! The controller only ever sees workloads matching its label selector, and
//! it never touches evaluation records — a cleaned workload says nothing
//! about the evaluation's history.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use serde_json::json;

use crucible_events::{BusEvent, EventBus};
use crucible_executor::{
    ExecutorDriver, LabelSelector, WorkloadPhase, WorkloadSnapshot, LABEL_EVAL_ID,
};
use crucible_kv::Counters;
use crucible_retry::{conservative, next_delay};
use crucible_schemas::{EvalId, EventKind};

// ---------------------------------------------------------------------------
// Config & policy
// ---------------------------------------------------------------------------

#[derive(Clone, Debug)]
pub struct CleanupConfig {
    /// Grace handed to the delete call for failed, non-preserved workloads.
    pub fail_grace: Duration,
    /// TTL for succeeded workloads.
    pub normal_ttl: Duration,
    /// TTL for failed workloads whose submitter asked to preserve them.
    pub preserve_ttl: Duration,
    /// Reconcile cadence.
    pub interval: Duration,
    pub selector: LabelSelector,
}

impl CleanupConfig {
    pub fn production() -> Self {
        Self {
            fail_grace: Duration::from_secs(10),
            normal_ttl: Duration::from_secs(600),
            preserve_ttl: Duration::from_secs(3600),
            interval: Duration::from_secs(15),
            selector: LabelSelector::managed(),
        }
    }
}

/// Why a workload was (or will be) deleted.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CleanupReason {
    FailedGrace,
    SucceededTtl,
    PreservedTtl,
}

impl CleanupReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            CleanupReason::FailedGrace => "failed_grace",
            CleanupReason::SucceededTtl => "succeeded_ttl",
            CleanupReason::PreservedTtl => "preserved_ttl",
        }
    }
}

/// Pure policy decision for one observed workload.
///
/// The failure grace is an age gate: a failed workload is deleted on the
/// first pass AFTER the grace has elapsed, which also leaves the dispatcher
/// room to retrieve final logs before the workload disappears.
pub fn decide(snapshot: &WorkloadSnapshot, config: &CleanupConfig) -> Option<CleanupReason> {
    match snapshot.phase {
        WorkloadPhase::Failed => {
            if snapshot.preserve() {
                (snapshot.phase_age >= config.preserve_ttl).then_some(CleanupReason::PreservedTtl)
            } else {
                (snapshot.phase_age >= config.fail_grace).then_some(CleanupReason::FailedGrace)
            }
        }
        WorkloadPhase::Succeeded => {
            (snapshot.phase_age >= config.normal_ttl).then_some(CleanupReason::SucceededTtl)
        }
        WorkloadPhase::Pending | WorkloadPhase::Running | WorkloadPhase::Unknown => None,
    }
}

// ---------------------------------------------------------------------------
// Controller
// ---------------------------------------------------------------------------

pub struct CleanupController {
    driver: Arc<dyn ExecutorDriver>,
    bus: EventBus,
    counters: Arc<Counters>,
    config: CleanupConfig,
}

impl CleanupController {
    pub fn new(
        driver: Arc<dyn ExecutorDriver>,
        bus: EventBus,
        counters: Arc<Counters>,
        config: CleanupConfig,
    ) -> Self {
        Self {
            driver,
            bus,
            counters,
            config,
        }
    }

    /// Watch loop. List failures reconnect with conservative backoff rather
    /// than killing the controller.
    pub async fn run(&self) {
        let reconnect = conservative();
        let mut failures = 0u32;
        loop {
            match self.reconcile_once().await {
                Ok(_) => {
                    failures = 0;
                    tokio::time::sleep(self.config.interval).await;
                }
                Err(err) => {
                    let delay = next_delay(failures.min(8), &reconnect);
                    tracing::warn!(
                        error = %err,
                        delay_ms = delay.as_millis() as u64,
                        "cleanup watch failed; reconnecting"
                    );
                    failures += 1;
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// One reconcile pass. Returns how many workloads were deleted.
    pub async fn reconcile_once(&self) -> Result<usize> {
        let snapshots = self.driver.list(&self.config.selector).await?;
        let mut cleaned = 0usize;

        for snapshot in &snapshots {
            let Some(reason) = decide(snapshot, &self.config) else {
                continue;
            };

            if let Err(err) = self.driver.delete(&snapshot.handle, Duration::ZERO).await {
                tracing::warn!(
                    workload = %snapshot.handle,
                    error = %err,
                    "workload delete failed; will retry next pass"
                );
                continue;
            }

            cleaned += 1;
            self.counters.workloads_cleaned.incr();
            tracing::info!(
                workload = %snapshot.handle,
                reason = reason.as_str(),
                "workload cleaned"
            );

            let eval_id = snapshot
                .labels
                .get(LABEL_EVAL_ID)
                .cloned()
                .unwrap_or_default();
            self.bus.publish(BusEvent::signal(
                EvalId::new(eval_id),
                EventKind::WorkloadCleaned,
                json!({
                    "workload": snapshot.handle.as_str(),
                    "reason": reason.as_str(),
                    "phase": snapshot.phase,
                }),
            ));
        }

        Ok(cleaned)
    }
}
