//! The storage worker: the ONLY writer of evaluation lifecycle state.
//!
//! It subscribes to the bus and reduces `evaluation.*` events into the
//! durable store, in two idempotent halves per event:
//!
//! 1. **Reduce** — a DAG-checked state mutation keyed on the evaluation id
//!    (safe to replay; an out-of-order event degrades to a timestamp
//!    backfill or an anomaly-logged drop).
//! 2. **Append** — insert into the events table, deduplicated on
//!    `(eval_id, sequence)`.
//!
//! It also maintains the ephemeral running-set (membership iff status is
//! provisioning/running) and publishes `storage.updated` after each durable
//! write — the durable fence downstream consumers wait on.

use std::sync::Arc;

use anyhow::{Context, Result};
use serde_json::json;
use tokio::sync::broadcast;

use crucible_events::{BusEvent, EventBus};
use crucible_kv::{Counters, RunningSet};
use crucible_schemas::{ErrorKind, EvalStatus, Evaluation, EventKind};
use crucible_store::{DurableStore, TerminalResult, TransitionOutcome};

pub mod recovery;

pub use recovery::{rebuild_running_set, requeue_stranded_legacy};

pub struct StorageWorker {
    store: Arc<dyn DurableStore>,
    running: RunningSet,
    bus: EventBus,
    counters: Arc<Counters>,
}

impl StorageWorker {
    pub fn new(
        store: Arc<dyn DurableStore>,
        running: RunningSet,
        bus: EventBus,
        counters: Arc<Counters>,
    ) -> Self {
        Self {
            store,
            running,
            bus,
            counters,
        }
    }

    /// Subscribe and reduce until the bus closes. Store errors are logged
    /// and the event skipped; the worker itself stays up.
    pub async fn run(&self) {
        let mut rx = self.bus.subscribe();
        loop {
            match rx.recv().await {
                Ok(event) => {
                    if let Err(err) = self.handle_event(&event).await {
                        tracing::error!(
                            eval_id = %event.eval_id,
                            kind = event.kind.as_str(),
                            error = %err,
                            "event reduction failed"
                        );
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!(skipped = n, "storage worker lagged behind the bus");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }

    /// Reduce one event. Public so the testkit can drive the worker
    /// synchronously.
    pub async fn handle_event(&self, event: &BusEvent) -> Result<()> {
        if !event.kind.is_lifecycle() {
            return Ok(());
        }

        let outcome = match event.kind {
            EventKind::Queued => self.reduce_queued(event).await?,
            EventKind::Provisioning => self.reduce_provisioning(event).await?,
            EventKind::Running => {
                self.store.mark_running(&event.eval_id, event.timestamp).await?
            }
            EventKind::Completed | EventKind::Failed => self.reduce_terminal(event).await?,
            _ => unreachable!("non-lifecycle kinds filtered above"),
        };

        if outcome == TransitionOutcome::Dropped {
            self.counters.out_of_order_events.incr();
            tracing::warn!(
                eval_id = %event.eval_id,
                kind = event.kind.as_str(),
                sequence = event.sequence,
                "out-of-order event dropped"
            );
        }

        // The audit append happens regardless of the reduction outcome —
        // a dropped status race is still a real observation.
        let inserted = self
            .store
            .append_event(event)
            .await
            .context("event append failed")?;
        if !inserted {
            tracing::debug!(
                eval_id = %event.eval_id,
                sequence = event.sequence,
                "duplicate event discarded"
            );
        }

        self.bus.publish(BusEvent::signal(
            event.eval_id.clone(),
            EventKind::StorageUpdated,
            json!({ "kind": event.kind.as_str() }),
        ));
        Ok(())
    }

    async fn reduce_queued(&self, event: &BusEvent) -> Result<TransitionOutcome> {
        // Ingress usually pre-inserts; the event payload carries the full
        // initial record so a worker-only deployment converges to the same
        // row.
        let eval: Evaluation = serde_json::from_value(event.payload["evaluation"].clone())
            .context("queued payload missing evaluation record")?;
        let inserted = self.store.insert_new(&eval).await?;
        Ok(if inserted {
            TransitionOutcome::Applied
        } else {
            TransitionOutcome::Unchanged
        })
    }

    async fn reduce_provisioning(&self, event: &BusEvent) -> Result<TransitionOutcome> {
        let executor_id = event.payload["executor_id"]
            .as_str()
            .unwrap_or_default()
            .to_string();
        let attempt = event.payload["attempt"].as_u64().unwrap_or(1) as u32;

        let outcome = self
            .store
            .mark_provisioning(&event.eval_id, event.timestamp, &executor_id, attempt)
            .await?;
        if matches!(
            outcome,
            TransitionOutcome::Applied | TransitionOutcome::Unchanged
        ) {
            self.running.insert(&event.eval_id);
        }
        Ok(outcome)
    }

    async fn reduce_terminal(&self, event: &BusEvent) -> Result<TransitionOutcome> {
        let status = if event.kind == EventKind::Completed {
            EvalStatus::Completed
        } else {
            EvalStatus::Failed
        };
        let p = &event.payload;
        let result = TerminalResult {
            status,
            finished_at: event.timestamp,
            exit_code: p["exit_code"].as_i64().map(|c| c as i32),
            output: p["output"].as_str().map(str::to_string),
            output_truncated: p["output_truncated"].as_bool().unwrap_or(false),
            output_size: p["output_size"].as_u64().unwrap_or(0),
            error: p["error"].as_str().map(str::to_string),
            error_kind: p["error_kind"].as_str().and_then(ErrorKind::parse),
        };

        let outcome = self.store.finalize(&event.eval_id, &result).await?;

        // Terminal means out of the running-set, whatever the status race
        // looked like. Removal is idempotent.
        self.running.remove(&event.eval_id);

        if outcome == TransitionOutcome::Applied {
            match status {
                EvalStatus::Completed => self.counters.completed.incr(),
                _ => self.counters.failed.incr(),
            }
        }
        Ok(outcome)
    }
}
