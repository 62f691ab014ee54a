//! Deterministic in-memory driver.
//!
//! Design decisions (kept intentionally simple/deterministic):
//! - A workload's whole future is fixed at `execute` time as a
//!   [`FakeOutcome`]; observed phase is a pure function of elapsed time.
//! - Unscripted workloads infer their outcome from the code text: `1/0`
//!   produces a Python-style traceback with exit 1, an infinite loop runs
//!   until the active deadline, anything else "prints" its `print('...')`
//!   literals and succeeds.
//! - No randomness. Latency knobs default to zero, which also exercises the
//!   fast-exit path (workload terminal before the first watch poll).

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use anyhow::{bail, Result};
use async_trait::async_trait;

use crate::spec::{
    LabelSelector, WorkloadHandle, WorkloadLogs, WorkloadPhase, WorkloadSnapshot, WorkloadSpec,
    WorkloadStatus, LABEL_EVAL_ID, REASON_DEADLINE_EXCEEDED,
};
use crate::ExecutorDriver;

// ---------------------------------------------------------------------------
// FakeOutcome
// ---------------------------------------------------------------------------

#[derive(Clone, Debug)]
pub enum FakeOutcome {
    /// Pending for the driver's provisioning latency, Running for `run_for`,
    /// then Succeeded/Failed by exit code.
    Complete {
        exit_code: i32,
        output: String,
        run_for: Duration,
    },
    /// Never leaves Pending (exercises the provisioning deadline).
    NeverSchedule,
    /// Runs until the spec's active deadline, then is killed by the
    /// orchestrator: Failed, `DeadlineExceeded`, exit 137.
    RunUntilDeadline,
}

impl FakeOutcome {
    /// Infer an outcome from untrusted code the way the real sandbox would
    /// behave for the few shapes the tests use.
    fn infer(spec: &WorkloadSpec) -> Self {
        if spec.code.contains("while True") {
            return FakeOutcome::RunUntilDeadline;
        }
        if spec.code.contains("1/0") {
            return FakeOutcome::Complete {
                exit_code: 1,
                output: "Traceback (most recent call last):\n  File \"<string>\", line 1, in <module>\nZeroDivisionError: division by zero\n".to_string(),
                run_for: Duration::ZERO,
            };
        }
        FakeOutcome::Complete {
            exit_code: 0,
            output: print_literals(&spec.code),
            run_for: Duration::ZERO,
        }
    }
}

/// Collect the arguments of `print('...')` calls, newline-terminated.
fn print_literals(code: &str) -> String {
    let mut out = String::new();
    let mut rest = code;
    while let Some(start) = rest.find("print('") {
        rest = &rest[start + "print('".len()..];
        if let Some(end) = rest.find("')") {
            out.push_str(&rest[..end]);
            out.push('\n');
            rest = &rest[end + 2..];
        } else {
            break;
        }
    }
    out
}

// ---------------------------------------------------------------------------
// FakeDriver
// ---------------------------------------------------------------------------

struct FakeWorkload {
    spec: WorkloadSpec,
    outcome: FakeOutcome,
    created: Instant,
}

impl FakeWorkload {
    fn status_at(&self, now: Instant, pending_for: Duration) -> WorkloadStatus {
        let elapsed = now.duration_since(self.created);
        match &self.outcome {
            FakeOutcome::NeverSchedule => WorkloadStatus {
                phase: WorkloadPhase::Pending,
                reason: Some("Unschedulable".to_string()),
            },
            FakeOutcome::RunUntilDeadline => {
                if elapsed < pending_for {
                    WorkloadStatus {
                        phase: WorkloadPhase::Pending,
                        reason: None,
                    }
                } else if elapsed < pending_for + self.spec.active_deadline {
                    WorkloadStatus {
                        phase: WorkloadPhase::Running,
                        reason: None,
                    }
                } else {
                    WorkloadStatus {
                        phase: WorkloadPhase::Failed,
                        reason: Some(REASON_DEADLINE_EXCEEDED.to_string()),
                    }
                }
            }
            FakeOutcome::Complete {
                exit_code, run_for, ..
            } => {
                if elapsed < pending_for {
                    WorkloadStatus {
                        phase: WorkloadPhase::Pending,
                        reason: None,
                    }
                } else if elapsed < pending_for + *run_for {
                    WorkloadStatus {
                        phase: WorkloadPhase::Running,
                        reason: None,
                    }
                } else if *exit_code == 0 {
                    WorkloadStatus {
                        phase: WorkloadPhase::Succeeded,
                        reason: None,
                    }
                } else {
                    WorkloadStatus {
                        phase: WorkloadPhase::Failed,
                        reason: None,
                    }
                }
            }
        }
    }

    /// When the current phase began, for snapshot ages.
    fn phase_started_at(&self, now: Instant, pending_for: Duration) -> Instant {
        let status = self.status_at(now, pending_for);
        match status.phase {
            WorkloadPhase::Pending => self.created,
            WorkloadPhase::Running => self.created + pending_for,
            WorkloadPhase::Succeeded | WorkloadPhase::Failed => match &self.outcome {
                FakeOutcome::Complete { run_for, .. } => self.created + pending_for + *run_for,
                FakeOutcome::RunUntilDeadline => {
                    self.created + pending_for + self.spec.active_deadline
                }
                FakeOutcome::NeverSchedule => self.created,
            },
            WorkloadPhase::Unknown => self.created,
        }
    }
}

#[derive(Default)]
struct FakeState {
    workloads: HashMap<String, FakeWorkload>,
    scripts: HashMap<String, FakeOutcome>,
    submit_failures_remaining: u32,
    submits: u64,
    deletes: Vec<String>,
}

pub struct FakeDriver {
    state: Mutex<FakeState>,
    /// Provisioning latency applied to every workload.
    pending_for: Duration,
}

impl FakeDriver {
    pub fn new() -> Self {
        Self::with_provisioning_latency(Duration::ZERO)
    }

    pub fn with_provisioning_latency(pending_for: Duration) -> Self {
        Self {
            state: Mutex::new(FakeState::default()),
            pending_for,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Force the outcome of the next execution for `eval_id`, overriding
    /// code inference.
    pub fn script(&self, eval_id: &str, outcome: FakeOutcome) {
        self.lock().scripts.insert(eval_id.to_string(), outcome);
    }

    /// Make the next `n` submits fail with a transport-style error.
    pub fn fail_next_submits(&self, n: u32) {
        self.lock().submit_failures_remaining = n;
    }

    pub fn submit_count(&self) -> u64 {
        self.lock().submits
    }

    /// Names deleted so far, in order.
    pub fn deleted(&self) -> Vec<String> {
        self.lock().deletes.clone()
    }

    pub fn contains(&self, handle: &WorkloadHandle) -> bool {
        self.lock().workloads.contains_key(handle.as_str())
    }
}

impl Default for FakeDriver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ExecutorDriver for FakeDriver {
    async fn execute(&self, spec: &WorkloadSpec) -> Result<WorkloadHandle> {
        let mut st = self.lock();
        st.submits += 1;
        if st.submit_failures_remaining > 0 {
            st.submit_failures_remaining -= 1;
            bail!("orchestrator unreachable (scripted)");
        }

        if !st.workloads.contains_key(&spec.name) {
            let eval_id = spec.labels.get(LABEL_EVAL_ID).cloned().unwrap_or_default();
            let outcome = st
                .scripts
                .get(&eval_id)
                .cloned()
                .unwrap_or_else(|| FakeOutcome::infer(spec));
            st.workloads.insert(
                spec.name.clone(),
                FakeWorkload {
                    spec: spec.clone(),
                    outcome,
                    created: Instant::now(),
                },
            );
        }
        Ok(WorkloadHandle(spec.name.clone()))
    }

    async fn status(&self, handle: &WorkloadHandle) -> Result<WorkloadStatus> {
        let st = self.lock();
        match st.workloads.get(handle.as_str()) {
            Some(w) => Ok(w.status_at(Instant::now(), self.pending_for)),
            None => bail!("workload {handle} not found"),
        }
    }

    async fn logs(&self, handle: &WorkloadHandle) -> Result<WorkloadLogs> {
        let st = self.lock();
        let Some(w) = st.workloads.get(handle.as_str()) else {
            bail!("workload {handle} not found");
        };
        let status = w.status_at(Instant::now(), self.pending_for);
        match (&w.outcome, status.phase) {
            (FakeOutcome::Complete { exit_code, output, .. }, p) if p.is_terminal() => {
                Ok(WorkloadLogs {
                    output: output.clone(),
                    exit_code: Some(*exit_code),
                })
            }
            (FakeOutcome::RunUntilDeadline, WorkloadPhase::Failed) => Ok(WorkloadLogs {
                output: String::new(),
                exit_code: Some(137),
            }),
            _ => Ok(WorkloadLogs {
                output: String::new(),
                exit_code: None,
            }),
        }
    }

    async fn delete(&self, handle: &WorkloadHandle, _grace: Duration) -> Result<()> {
        let mut st = self.lock();
        if st.workloads.remove(handle.as_str()).is_some() {
            st.deletes.push(handle.as_str().to_string());
        }
        Ok(())
    }

    async fn list(&self, selector: &LabelSelector) -> Result<Vec<WorkloadSnapshot>> {
        let st = self.lock();
        let now = Instant::now();
        let mut out: Vec<WorkloadSnapshot> = st
            .workloads
            .values()
            .filter(|w| selector.matches(&w.spec.labels))
            .map(|w| {
                let status = w.status_at(now, self.pending_for);
                WorkloadSnapshot {
                    handle: WorkloadHandle(w.spec.name.clone()),
                    phase: status.phase,
                    reason: status.reason,
                    labels: w.spec.labels.clone(),
                    phase_age: now.duration_since(w.phase_started_at(now, self.pending_for)),
                }
            })
            .collect();
        out.sort_by(|a, b| a.handle.as_str().cmp(b.handle.as_str()));
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crucible_schemas::{EvalId, Priority, RouteTag, TaskEnvelope};

    fn spec(id: &str, code: &str, timeout: u64) -> WorkloadSpec {
        WorkloadSpec::from_envelope(
            &TaskEnvelope {
                eval_id: EvalId::new(id),
                runtime_image: "python:3.11-slim".into(),
                language: "python".into(),
                code: code.into(),
                timeout_seconds: timeout,
                memory_bytes: 268_435_456,
                cpu_shares: 1024,
                priority: Priority::Normal,
                preserve: false,
                route_tag: RouteTag::Primary,
                attempt: 0,
            },
            1,
        )
    }

    #[tokio::test]
    async fn print_code_succeeds_with_its_output() {
        let driver = FakeDriver::new();
        let h = driver.execute(&spec("e1", "print('hi')", 30)).await.unwrap();

        let status = driver.status(&h).await.unwrap();
        assert_eq!(status.phase, WorkloadPhase::Succeeded);

        let logs = driver.logs(&h).await.unwrap();
        assert_eq!(logs.output, "hi\n");
        assert_eq!(logs.exit_code, Some(0));
    }

    #[tokio::test]
    async fn division_by_zero_fails_with_a_traceback() {
        let driver = FakeDriver::new();
        let h = driver.execute(&spec("e1", "1/0", 30)).await.unwrap();

        assert_eq!(driver.status(&h).await.unwrap().phase, WorkloadPhase::Failed);
        let logs = driver.logs(&h).await.unwrap();
        assert!(logs.output.contains("ZeroDivisionError"));
        assert_eq!(logs.exit_code, Some(1));
    }

    #[tokio::test]
    async fn infinite_loop_is_killed_at_the_deadline() {
        let driver = FakeDriver::new();
        // Zero-second deadline: already exceeded at first observation.
        let h = driver
            .execute(&spec("e1", "while True: pass", 0))
            .await
            .unwrap();

        let status = driver.status(&h).await.unwrap();
        assert_eq!(status.phase, WorkloadPhase::Failed);
        assert_eq!(status.reason.as_deref(), Some(REASON_DEADLINE_EXCEEDED));
        assert_eq!(driver.logs(&h).await.unwrap().exit_code, Some(137));
    }

    #[tokio::test]
    async fn execute_is_idempotent_on_the_spec_name() {
        let driver = FakeDriver::new();
        let s = spec("e1", "print('hi')", 30);
        let a = driver.execute(&s).await.unwrap();
        let b = driver.execute(&s).await.unwrap();
        assert_eq!(a, b);
        assert_eq!(driver.list(&LabelSelector::managed()).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn scripted_outcome_beats_inference() {
        let driver = FakeDriver::new();
        driver.script("e1", FakeOutcome::NeverSchedule);
        let h = driver.execute(&spec("e1", "print('hi')", 30)).await.unwrap();
        assert_eq!(driver.status(&h).await.unwrap().phase, WorkloadPhase::Pending);
    }

    #[tokio::test]
    async fn delete_removes_from_listing() {
        let driver = FakeDriver::new();
        let h = driver.execute(&spec("e1", "print('hi')", 30)).await.unwrap();
        driver.delete(&h, Duration::ZERO).await.unwrap();
        assert!(driver.list(&LabelSelector::managed()).await.unwrap().is_empty());
        assert_eq!(driver.deleted(), vec![h.as_str().to_string()]);
        // Deleting again is a no-op.
        driver.delete(&h, Duration::ZERO).await.unwrap();
        assert_eq!(driver.deleted().len(), 1);
    }

    #[tokio::test]
    async fn scripted_submit_failures_then_recovery() {
        let driver = FakeDriver::new();
        driver.fail_next_submits(2);
        let s = spec("e1", "print('hi')", 30);
        assert!(driver.execute(&s).await.is_err());
        assert!(driver.execute(&s).await.is_err());
        assert!(driver.execute(&s).await.is_ok());
        assert_eq!(driver.submit_count(), 3);
    }
}
