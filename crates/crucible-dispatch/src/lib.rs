//! The dispatcher: consumes one envelope at a time, owns the executor lease
//! for the duration, materializes the workload, watches it to a terminal
//! phase, and reports the outcome onto the bus.
//!
//! # Invariant
//!
//! Success and failure share a SINGLE release point for the executor lease
//! ([`Dispatcher::run_once`] releases after the leased section returns, on
//! every path), and release itself is idempotent — no framework callback is
//! trusted to run exactly once. Everything the dispatcher writes is keyed on
//! the evaluation id and a fixed event sequence, so redelivery of the same
//! envelope cannot double-apply.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use futures_util::StreamExt;
use serde_json::json;

use crucible_events::{BusEvent, EventBus};
use crucible_executor::{
    watch, ExecutorDriver, HttpStatus, WorkloadHandle, WorkloadLogs, WorkloadPhase, WorkloadSpec,
    REASON_DEADLINE_EXCEEDED,
};
use crucible_kv::ExecutorPool;
use crucible_queue::{NackOutcome, Reservation, TaskQueue};
use crucible_retry::{classify_http, next_delay, should_retry, ErrorClass, RetryPolicy};
use crucible_schemas::{
    truncate_output, ErrorKind, EvalId, EventKind, ExecutorId, TaskEnvelope, TruncatedOutput,
};

mod outcome;

pub use outcome::{classify_workload_failure, DispatchOutcome, FailureClass};

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

#[derive(Clone, Debug)]
pub struct DispatcherConfig {
    /// Added to an evaluation's timeout to form the lease TTL.
    pub lease_overhead: Duration,
    /// Added to an evaluation's timeout to form the queue visibility window.
    pub visibility_overhead: Duration,
    /// How long a workload may sit unscheduled before `provisioning_timeout`.
    pub provisioning_deadline: Duration,
    /// Watch poll cadence.
    pub poll_interval: Duration,
    /// Backoff before a pool-empty envelope becomes visible again.
    pub pool_empty_backoff: Duration,
    /// Output cap (1 MiB in production).
    pub output_truncate_bytes: usize,
    /// Policy for orchestrator transport retries (aggressive in production;
    /// tests inject a zero-delay variant).
    pub api_retry: RetryPolicy,
    /// Sleep between polls when the queue is empty.
    pub idle_backoff: Duration,
}

impl DispatcherConfig {
    pub fn production() -> Self {
        Self {
            lease_overhead: Duration::from_secs(120),
            visibility_overhead: Duration::from_secs(90),
            provisioning_deadline: Duration::from_secs(60),
            poll_interval: Duration::from_millis(500),
            pool_empty_backoff: Duration::from_secs(2),
            output_truncate_bytes: 1_048_576,
            api_retry: crucible_retry::aggressive(),
            idle_backoff: Duration::from_millis(500),
        }
    }
}

// ---------------------------------------------------------------------------
// Dispatcher
// ---------------------------------------------------------------------------

pub struct Dispatcher {
    queue: Arc<dyn TaskQueue>,
    pool: ExecutorPool,
    driver: Arc<dyn ExecutorDriver>,
    bus: EventBus,
    config: DispatcherConfig,
}

impl Dispatcher {
    pub fn new(
        queue: Arc<dyn TaskQueue>,
        pool: ExecutorPool,
        driver: Arc<dyn ExecutorDriver>,
        bus: EventBus,
        config: DispatcherConfig,
    ) -> Self {
        Self {
            queue,
            pool,
            driver,
            bus,
            config,
        }
    }

    /// Pull-and-dispatch loop. Runs until the surrounding task is aborted.
    pub async fn run(&self) {
        loop {
            match self.run_once().await {
                Ok(DispatchOutcome::Idle) => {
                    tokio::time::sleep(self.config.idle_backoff).await;
                }
                Ok(_) => {}
                Err(err) => {
                    tracing::error!(error = %err, "dispatch cycle failed");
                    tokio::time::sleep(self.config.idle_backoff).await;
                }
            }
        }
    }

    /// One full dispatch cycle: reserve → lease → execute → report.
    pub async fn run_once(&self) -> Result<DispatchOutcome> {
        // The queue extends this overhead by the envelope's own timeout, so
        // the reservation always outlives the evaluation it covers.
        let Some(reservation) = self.queue.reserve(self.config.visibility_overhead).await? else {
            return Ok(DispatchOutcome::Idle);
        };

        let envelope = reservation.envelope.clone();
        let eval_id = envelope.eval_id.clone();
        let lease_ttl =
            Duration::from_secs(envelope.timeout_seconds) + self.config.lease_overhead;

        let Some(executor_id) = self.pool.acquire(&eval_id, lease_ttl) else {
            // Backpressure: the pool is saturated, push the load back into
            // the queue without burning a retry.
            tracing::debug!(eval_id = %eval_id, "pool empty; requeueing");
            self.queue
                .requeue(reservation.token, self.config.pool_empty_backoff)
                .await?;
            return Ok(DispatchOutcome::PoolEmpty);
        };

        let outcome = self
            .execute_leased(&reservation, &envelope, &executor_id)
            .await;

        // The single lease release point. Idempotent: the TTL may already
        // have reclaimed it, or a duplicate invocation may have beaten us.
        self.pool.release(&executor_id, &eval_id);

        outcome
    }

    /// Everything that happens while holding the lease.
    async fn execute_leased(
        &self,
        reservation: &Reservation,
        envelope: &TaskEnvelope,
        executor_id: &ExecutorId,
    ) -> Result<DispatchOutcome> {
        let eval_id = envelope.eval_id.clone();
        let attempt = envelope.attempt + 1;
        let spec = WorkloadSpec::from_envelope(envelope, attempt);

        // -- submit, with aggressive retries on transport errors ------------
        let handle = match self.submit_with_retry(&spec).await {
            Ok(handle) => handle,
            Err(SubmitError::Fatal(err)) => {
                // Non-retryable rejection: hand the envelope back to the
                // queue's retry machinery; dead-lettering materializes the
                // terminal failure.
                tracing::warn!(eval_id = %eval_id, error = %err, "workload submit rejected");
                let nack = self
                    .queue
                    .nack(reservation.token, &format!("submit rejected: {err}"))
                    .await?;
                if nack == NackOutcome::DeadLettered {
                    self.publish_failed(
                        &eval_id,
                        None,
                        self.no_output(),
                        format!("submission retries exhausted: {err}"),
                        ErrorKind::DlqExhausted,
                    );
                    return Ok(DispatchOutcome::Failed(eval_id, ErrorKind::DlqExhausted));
                }
                return Ok(DispatchOutcome::NackedForRetry(eval_id));
            }
            Err(SubmitError::Exhausted(err)) => {
                tracing::error!(eval_id = %eval_id, error = %err, "orchestrator unavailable");
                self.publish_failed(
                    &eval_id,
                    None,
                    self.no_output(),
                    "orchestrator API unavailable".to_string(),
                    ErrorKind::ApiUnavailable,
                );
                self.queue.ack(reservation.token).await?;
                return Ok(DispatchOutcome::Failed(eval_id, ErrorKind::ApiUnavailable));
            }
        };

        self.bus.publish(BusEvent::lifecycle(
            eval_id.clone(),
            EventKind::Provisioning,
            json!({ "executor_id": executor_id, "attempt": attempt }),
        ));

        // -- watch to a terminal phase --------------------------------------
        let terminal = match self.watch_to_terminal(&eval_id, &handle, envelope).await {
            Ok(phase) => phase,
            Err(watch_failure) => {
                let (kind, message) = watch_failure;
                self.driver
                    .delete(&handle, Duration::ZERO)
                    .await
                    .unwrap_or_else(|err| {
                        tracing::warn!(eval_id = %eval_id, error = %err, "workload delete failed")
                    });
                self.publish_failed(&eval_id, None, self.no_output(), message, kind);
                self.queue.ack(reservation.token).await?;
                return Ok(DispatchOutcome::Failed(eval_id, kind));
            }
        };

        // -- final logs: combined stdout+stderr, one retrieval --------------
        let logs = self.logs_with_retry(&handle).await.unwrap_or(WorkloadLogs {
            output: String::new(),
            exit_code: None,
        });
        let truncated = truncate_output(&logs.output, self.config.output_truncate_bytes);

        let outcome = match terminal {
            TerminalPhase::Succeeded => {
                self.bus.publish(BusEvent::lifecycle(
                    eval_id.clone(),
                    EventKind::Completed,
                    json!({
                        "exit_code": logs.exit_code.unwrap_or(0),
                        "output": truncated.output,
                        "output_truncated": truncated.truncated,
                        "output_size": truncated.size,
                    }),
                ));
                DispatchOutcome::Completed(eval_id.clone())
            }
            TerminalPhase::DeadlineExceeded => {
                self.publish_failed(
                    &eval_id,
                    logs.exit_code,
                    truncated.clone(),
                    format!(
                        "evaluation exceeded its {}s timeout",
                        envelope.timeout_seconds
                    ),
                    ErrorKind::Timeout,
                );
                DispatchOutcome::Failed(eval_id.clone(), ErrorKind::Timeout)
            }
            TerminalPhase::Failed => {
                let class = classify_workload_failure(&truncated.output);
                let (kind, message) = match class {
                    FailureClass::UserError { message } => (ErrorKind::UserError, message),
                    FailureClass::ExecutorCrash => (
                        ErrorKind::ExecutorCrash,
                        format!(
                            "workload exited with code {} and no user error",
                            logs.exit_code.unwrap_or(-1)
                        ),
                    ),
                };
                self.publish_failed(&eval_id, logs.exit_code, truncated.clone(), message, kind);
                DispatchOutcome::Failed(eval_id.clone(), kind)
            }
        };

        self.queue.ack(reservation.token).await?;
        Ok(outcome)
    }

    async fn submit_with_retry(&self, spec: &WorkloadSpec) -> Result<WorkloadHandle, SubmitError> {
        let mut attempt = 0u32;
        loop {
            match self.driver.execute(spec).await {
                Ok(handle) => return Ok(handle),
                Err(err) => {
                    let class = err
                        .downcast_ref::<HttpStatus>()
                        .map(|s| classify_http(s.0))
                        .unwrap_or(ErrorClass::Retryable);
                    if class == ErrorClass::Fatal {
                        return Err(SubmitError::Fatal(err));
                    }
                    if !should_retry(attempt, &self.config.api_retry) {
                        return Err(SubmitError::Exhausted(err));
                    }
                    let delay = next_delay(attempt, &self.config.api_retry);
                    tracing::warn!(
                        workload = %spec.name,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "workload submit failed; retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }

    /// Drive the watch stream until a terminal phase, emitting `running` on
    /// the first Running observation and enforcing the provisioning
    /// deadline. Errors out with the error kind to materialize.
    async fn watch_to_terminal(
        &self,
        eval_id: &EvalId,
        handle: &WorkloadHandle,
        envelope: &TaskEnvelope,
    ) -> Result<TerminalPhase, (ErrorKind, String)> {
        let started = Instant::now();
        // The orchestrator enforces the real deadline; this watchdog only
        // catches an orchestrator that stops reporting altogether.
        let watch_deadline = self.config.provisioning_deadline
            + Duration::from_secs(envelope.timeout_seconds)
            + self.config.lease_overhead;

        let mut stream = watch(self.driver.clone(), handle.clone(), self.config.poll_interval);
        let mut seen_running = false;
        let mut consecutive_errors = 0u32;

        while let Some(item) = stream.next().await {
            let status = match item {
                Ok(status) => {
                    consecutive_errors = 0;
                    status
                }
                Err(err) => {
                    consecutive_errors += 1;
                    if !should_retry(consecutive_errors, &self.config.api_retry) {
                        return Err((
                            ErrorKind::ApiUnavailable,
                            format!("orchestrator watch failed: {err}"),
                        ));
                    }
                    continue;
                }
            };

            match status.phase {
                WorkloadPhase::Pending | WorkloadPhase::Unknown => {
                    if started.elapsed() > self.config.provisioning_deadline {
                        return Err((
                            ErrorKind::ProvisioningTimeout,
                            format!(
                                "workload not scheduled within {}s",
                                self.config.provisioning_deadline.as_secs()
                            ),
                        ));
                    }
                }
                WorkloadPhase::Running => {
                    if !seen_running {
                        seen_running = true;
                        self.bus.publish(BusEvent::lifecycle(
                            eval_id.clone(),
                            EventKind::Running,
                            json!({}),
                        ));
                    }
                }
                WorkloadPhase::Succeeded => {
                    self.ensure_running_emitted(eval_id, &mut seen_running);
                    return Ok(TerminalPhase::Succeeded);
                }
                WorkloadPhase::Failed => {
                    self.ensure_running_emitted(eval_id, &mut seen_running);
                    return Ok(
                        if status.reason.as_deref() == Some(REASON_DEADLINE_EXCEEDED) {
                            TerminalPhase::DeadlineExceeded
                        } else {
                            TerminalPhase::Failed
                        },
                    );
                }
            }

            if started.elapsed() > watch_deadline {
                return Err((
                    ErrorKind::Timeout,
                    "workload outlived its watch deadline".to_string(),
                ));
            }
        }

        Err((
            ErrorKind::ApiUnavailable,
            "orchestrator watch stream ended without a terminal phase".to_string(),
        ))
    }

    /// Fast-exit workloads can be terminal before the first poll ever sees
    /// Running; the lifecycle still records one `running` event.
    fn ensure_running_emitted(&self, eval_id: &EvalId, seen_running: &mut bool) {
        if !*seen_running {
            *seen_running = true;
            self.bus.publish(BusEvent::lifecycle(
                eval_id.clone(),
                EventKind::Running,
                json!({}),
            ));
        }
    }

    async fn logs_with_retry(&self, handle: &WorkloadHandle) -> Result<WorkloadLogs> {
        let mut attempt = 0u32;
        loop {
            match self.driver.logs(handle).await {
                Ok(logs) => return Ok(logs),
                Err(err) if should_retry(attempt, &self.config.api_retry) => {
                    tokio::time::sleep(next_delay(attempt, &self.config.api_retry)).await;
                    tracing::debug!(workload = %handle, error = %err, "logs retrieval retry");
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    fn publish_failed(
        &self,
        eval_id: &EvalId,
        exit_code: Option<i32>,
        output: TruncatedOutput,
        error: String,
        kind: ErrorKind,
    ) {
        self.bus.publish(BusEvent::lifecycle(
            eval_id.clone(),
            EventKind::Failed,
            json!({
                "exit_code": exit_code,
                "output": output.output,
                "output_truncated": output.truncated,
                "output_size": output.size,
                "error": error,
                "error_kind": kind,
            }),
        ));
    }

    /// Truncation metadata for failure paths with no retrieved output.
    fn no_output(&self) -> TruncatedOutput {
        truncate_output("", self.config.output_truncate_bytes)
    }
}

enum TerminalPhase {
    Succeeded,
    Failed,
    DeadlineExceeded,
}

enum SubmitError {
    Fatal(anyhow::Error),
    Exhausted(anyhow::Error),
}
