//! Executor drivers: the narrow interface between the control plane and
//! whatever actually runs untrusted code.
//!
//! A driver can materialize an isolated, network-less, resource-limited,
//! time-bounded workload and report on it. The set of drivers is sealed —
//! selection is a configuration enum, never runtime reflection:
//!
//! - [`FakeDriver`]    — deterministic in-memory model, used by the testkit
//!   and local development.
//! - [`SubprocessDriver`] — spawns the language runtime as a child process.
//!   Dev-only: it enforces the timeout but makes NO isolation claims.
//! - [`HttpOrchestratorDriver`] — JSON client for a remote orchestrator
//!   that provides the real sandbox.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use futures_util::stream::BoxStream;

pub mod fake;
pub mod http;
pub mod spec;
pub mod subprocess;

pub use fake::{FakeDriver, FakeOutcome};
pub use http::{HttpOrchestratorDriver, HttpStatus};
pub use spec::{
    LabelSelector, NetworkPolicy, ResourceLimits, RestartPolicy, SecurityPolicy, WorkloadHandle,
    WorkloadLogs, WorkloadPhase, WorkloadSnapshot, WorkloadSpec, WorkloadStatus,
    LABEL_EVAL_ID, LABEL_MANAGED_BY, LABEL_PRESERVE, LABEL_PRIORITY, MANAGED_BY_VALUE,
    REASON_DEADLINE_EXCEEDED,
};
pub use subprocess::SubprocessDriver;

// ---------------------------------------------------------------------------
// ExecutorDriver
// ---------------------------------------------------------------------------

#[async_trait]
pub trait ExecutorDriver: Send + Sync {
    /// Materialize the workload. Idempotent on the spec name: re-submitting
    /// an existing workload returns its handle without creating a second.
    async fn execute(&self, spec: &WorkloadSpec) -> Result<WorkloadHandle>;

    /// Current phase plus orchestrator-supplied reason.
    async fn status(&self, handle: &WorkloadHandle) -> Result<WorkloadStatus>;

    /// Final combined stdout+stderr and exit code, in ONE call — fast-exit
    /// workloads may have no separately retrievable streams.
    async fn logs(&self, handle: &WorkloadHandle) -> Result<WorkloadLogs>;

    /// Delete the workload, granting `grace` before a hard kill. Deleting a
    /// workload that is already gone is a no-op.
    async fn delete(&self, handle: &WorkloadHandle, grace: Duration) -> Result<()>;

    /// Every live workload matching the selector. The cleanup controller
    /// must never see (let alone delete) anything outside its selector.
    async fn list(&self, selector: &LabelSelector) -> Result<Vec<WorkloadSnapshot>>;
}

// ---------------------------------------------------------------------------
// Driver selection
// ---------------------------------------------------------------------------

/// The sealed driver set. Selection is configuration, not reflection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DriverKind {
    Fake,
    Subprocess,
    Orchestrator,
}

impl DriverKind {
    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "fake" => DriverKind::Fake,
            "subprocess" => DriverKind::Subprocess,
            "orchestrator" => DriverKind::Orchestrator,
            _ => return None,
        })
    }
}

/// Construct the configured driver. The orchestrator kind requires a base
/// URL; the other kinds ignore it.
pub fn build_driver(
    kind: DriverKind,
    orchestrator_url: Option<&str>,
    request_timeout: Duration,
) -> Result<Arc<dyn ExecutorDriver>> {
    Ok(match kind {
        DriverKind::Fake => Arc::new(FakeDriver::new()),
        DriverKind::Subprocess => Arc::new(SubprocessDriver::new()),
        DriverKind::Orchestrator => {
            let url = orchestrator_url
                .ok_or_else(|| anyhow::anyhow!("orchestrator driver requires ORCHESTRATOR_URL"))?;
            Arc::new(HttpOrchestratorDriver::new(url, request_timeout)?)
        }
    })
}

/// Poll-driven status stream over any driver: yields each status observation
/// until (and including) the first terminal phase.
///
/// This is the `watch` half of the driver contract, lifted out of the trait
/// so it works uniformly over `Arc<dyn ExecutorDriver>`.
pub fn watch(
    driver: Arc<dyn ExecutorDriver>,
    handle: WorkloadHandle,
    poll_interval: Duration,
) -> BoxStream<'static, Result<WorkloadStatus>> {
    Box::pin(futures_util::stream::unfold(
        (driver, handle, false),
        move |(driver, handle, done)| async move {
            if done {
                return None;
            }
            tokio::time::sleep(poll_interval).await;
            match driver.status(&handle).await {
                Ok(status) => {
                    let terminal = status.phase.is_terminal();
                    Some((Ok(status), (driver, handle, terminal)))
                }
                Err(err) => Some((Err(err), (driver, handle, false))),
            }
        },
    ))
}
