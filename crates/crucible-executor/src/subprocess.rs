//! Subprocess driver: runs the language runtime as a local child process.
//!
//! Dev-only. It enforces the active deadline and captures combined output,
//! but provides NONE of the sandbox guarantees (no rootfs, network, or
//! capability isolation) — the hardening fields of the spec are accepted
//! and ignored. Never select this driver for untrusted code outside a
//! development machine.
//!
//! Code reaches the interpreter as a single argv element (`python3 -c
//! <code>`); nothing is ever spliced into a shell line by this crate.

use std::collections::{BTreeMap, HashMap};
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::sync::Notify;

use crate::spec::{
    LabelSelector, WorkloadHandle, WorkloadLogs, WorkloadPhase, WorkloadSnapshot, WorkloadSpec,
    WorkloadStatus, REASON_DEADLINE_EXCEEDED,
};
use crate::ExecutorDriver;

/// Exit code reported when the deadline (or a delete) kills the child.
const KILLED_EXIT_CODE: i32 = 137;

struct ProcEntry {
    labels: BTreeMap<String, String>,
    phase: WorkloadPhase,
    reason: Option<String>,
    output: String,
    exit_code: Option<i32>,
    phase_since: Instant,
    kill: Arc<Notify>,
}

#[derive(Default)]
pub struct SubprocessDriver {
    state: Arc<Mutex<HashMap<String, ProcEntry>>>,
}

impl SubprocessDriver {
    pub fn new() -> Self {
        Self::default()
    }

    fn interpreter(language: &str) -> Result<(&'static str, &'static str)> {
        match language {
            "python" => Ok(("python3", "-c")),
            // Used by driver self-tests so they do not require a Python
            // toolchain on the machine.
            "shell" => Ok(("sh", "-c")),
            other => bail!("subprocess driver has no interpreter for language {other:?}"),
        }
    }

    fn finish(
        state: &Arc<Mutex<HashMap<String, ProcEntry>>>,
        name: &str,
        phase: WorkloadPhase,
        reason: Option<String>,
        output: String,
        exit_code: Option<i32>,
    ) {
        let mut st = state.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(entry) = st.get_mut(name) {
            entry.phase = phase;
            entry.reason = reason;
            entry.output = output;
            entry.exit_code = exit_code;
            entry.phase_since = Instant::now();
        }
    }
}

#[async_trait]
impl ExecutorDriver for SubprocessDriver {
    async fn execute(&self, spec: &WorkloadSpec) -> Result<WorkloadHandle> {
        {
            let st = self.state.lock().unwrap_or_else(|e| e.into_inner());
            if st.contains_key(&spec.name) {
                return Ok(WorkloadHandle(spec.name.clone()));
            }
        }

        let (program, code_flag) = Self::interpreter(&spec.language)?;
        let mut child = Command::new(program)
            .arg(code_flag)
            .arg(&spec.code)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("spawn {program} failed"))?;

        let kill = Arc::new(Notify::new());
        {
            let mut st = self.state.lock().unwrap_or_else(|e| e.into_inner());
            st.insert(
                spec.name.clone(),
                ProcEntry {
                    labels: spec.labels.clone(),
                    phase: WorkloadPhase::Running,
                    reason: None,
                    output: String::new(),
                    exit_code: None,
                    phase_since: Instant::now(),
                    kill: kill.clone(),
                },
            );
        }

        let mut stdout = child.stdout.take().context("child stdout missing")?;
        let mut stderr = child.stderr.take().context("child stderr missing")?;
        let state = self.state.clone();
        let name = spec.name.clone();
        let deadline = spec.active_deadline;

        tokio::spawn(async move {
            let out_task = tokio::spawn(async move {
                let mut buf = Vec::new();
                let _ = stdout.read_to_end(&mut buf).await;
                buf
            });
            let err_task = tokio::spawn(async move {
                let mut buf = Vec::new();
                let _ = stderr.read_to_end(&mut buf).await;
                buf
            });

            enum Ending {
                Exited(Option<i32>),
                Deadline,
                Deleted,
            }

            let ending = tokio::select! {
                res = child.wait() => Ending::Exited(res.ok().and_then(|s| s.code())),
                _ = tokio::time::sleep(deadline) => Ending::Deadline,
                _ = kill.notified() => Ending::Deleted,
            };

            if matches!(ending, Ending::Deadline | Ending::Deleted) {
                let _ = child.kill().await;
                let _ = child.wait().await;
            }

            // Streams are multiplexed in the final output: stdout first,
            // then stderr, matching the single-retrieval log contract.
            let mut output = String::from_utf8_lossy(&out_task.await.unwrap_or_default())
                .into_owned();
            output.push_str(&String::from_utf8_lossy(&err_task.await.unwrap_or_default()));

            match ending {
                Ending::Exited(code) => {
                    let phase = if code == Some(0) {
                        WorkloadPhase::Succeeded
                    } else {
                        WorkloadPhase::Failed
                    };
                    Self::finish(&state, &name, phase, None, output, code.or(Some(KILLED_EXIT_CODE)));
                }
                Ending::Deadline => Self::finish(
                    &state,
                    &name,
                    WorkloadPhase::Failed,
                    Some(REASON_DEADLINE_EXCEEDED.to_string()),
                    output,
                    Some(KILLED_EXIT_CODE),
                ),
                Ending::Deleted => Self::finish(
                    &state,
                    &name,
                    WorkloadPhase::Failed,
                    Some("Deleted".to_string()),
                    output,
                    Some(KILLED_EXIT_CODE),
                ),
            }
        });

        Ok(WorkloadHandle(spec.name.clone()))
    }

    async fn status(&self, handle: &WorkloadHandle) -> Result<WorkloadStatus> {
        let st = self.state.lock().unwrap_or_else(|e| e.into_inner());
        match st.get(handle.as_str()) {
            Some(e) => Ok(WorkloadStatus {
                phase: e.phase,
                reason: e.reason.clone(),
            }),
            None => bail!("workload {handle} not found"),
        }
    }

    async fn logs(&self, handle: &WorkloadHandle) -> Result<WorkloadLogs> {
        let st = self.state.lock().unwrap_or_else(|e| e.into_inner());
        match st.get(handle.as_str()) {
            Some(e) => Ok(WorkloadLogs {
                output: e.output.clone(),
                exit_code: e.exit_code,
            }),
            None => bail!("workload {handle} not found"),
        }
    }

    async fn delete(&self, handle: &WorkloadHandle, grace: Duration) -> Result<()> {
        let kill = {
            let st = self.state.lock().unwrap_or_else(|e| e.into_inner());
            st.get(handle.as_str()).map(|e| (e.kill.clone(), e.phase))
        };
        if let Some((kill, phase)) = kill {
            if !phase.is_terminal() {
                tokio::time::sleep(grace).await;
                kill.notify_one();
            }
        }
        let mut st = self.state.lock().unwrap_or_else(|e| e.into_inner());
        st.remove(handle.as_str());
        Ok(())
    }

    async fn list(&self, selector: &LabelSelector) -> Result<Vec<WorkloadSnapshot>> {
        let st = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();
        let mut out: Vec<WorkloadSnapshot> = st
            .iter()
            .filter(|(_, e)| selector.matches(&e.labels))
            .map(|(name, e)| WorkloadSnapshot {
                handle: WorkloadHandle(name.clone()),
                phase: e.phase,
                reason: e.reason.clone(),
                labels: e.labels.clone(),
                phase_age: now.duration_since(e.phase_since),
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

    fn spec(id: &str, language: &str, code: &str, timeout: u64) -> WorkloadSpec {
        WorkloadSpec::from_envelope(
            &TaskEnvelope {
                eval_id: EvalId::new(id),
                runtime_image: "local".into(),
                language: language.into(),
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

    async fn wait_terminal(driver: &SubprocessDriver, h: &WorkloadHandle) -> WorkloadStatus {
        for _ in 0..200 {
            let s = driver.status(h).await.unwrap();
            if s.phase.is_terminal() {
                return s;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        panic!("workload never reached a terminal phase");
    }

    #[tokio::test]
    async fn shell_echo_succeeds_with_output() {
        let driver = SubprocessDriver::new();
        let h = driver
            .execute(&spec("e1", "shell", "echo hello", 10))
            .await
            .unwrap();

        let status = wait_terminal(&driver, &h).await;
        assert_eq!(status.phase, WorkloadPhase::Succeeded);
        let logs = driver.logs(&h).await.unwrap();
        assert_eq!(logs.output, "hello\n");
        assert_eq!(logs.exit_code, Some(0));
    }

    #[tokio::test]
    async fn nonzero_exit_is_failed_with_stderr_captured() {
        let driver = SubprocessDriver::new();
        let h = driver
            .execute(&spec("e1", "shell", "echo oops >&2; exit 3", 10))
            .await
            .unwrap();

        let status = wait_terminal(&driver, &h).await;
        assert_eq!(status.phase, WorkloadPhase::Failed);
        let logs = driver.logs(&h).await.unwrap();
        assert!(logs.output.contains("oops"));
        assert_eq!(logs.exit_code, Some(3));
    }

    #[tokio::test]
    async fn deadline_kills_the_child() {
        let driver = SubprocessDriver::new();
        let h = driver
            .execute(&spec("e1", "shell", "sleep 30", 1))
            .await
            .unwrap();

        let status = wait_terminal(&driver, &h).await;
        assert_eq!(status.phase, WorkloadPhase::Failed);
        assert_eq!(status.reason.as_deref(), Some(REASON_DEADLINE_EXCEEDED));
        assert_eq!(driver.logs(&h).await.unwrap().exit_code, Some(KILLED_EXIT_CODE));
    }

    #[tokio::test]
    async fn unknown_language_is_rejected_up_front() {
        let driver = SubprocessDriver::new();
        let err = driver
            .execute(&spec("e1", "cobol", "DISPLAY 'HI'.", 10))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("no interpreter"));
    }
}
