//! Typed workload specification.
//!
//! User code travels as a data field of this struct from ingress to the
//! sandbox; it is never interpolated into a command line. The hardening
//! fields are policy values the driver translates into its own enforcement
//! primitives (seccomp profiles, cgroup limits, network namespaces, ...).

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crucible_schemas::TaskEnvelope;

pub const LABEL_MANAGED_BY: &str = "crucible.dev/managed-by";
pub const LABEL_EVAL_ID: &str = "crucible.dev/eval-id";
pub const LABEL_PRESERVE: &str = "crucible.dev/preserve";
pub const LABEL_PRIORITY: &str = "crucible.dev/priority";
pub const MANAGED_BY_VALUE: &str = "crucible-dispatch";

// ---------------------------------------------------------------------------
// Spec
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RestartPolicy {
    /// The only policy the control plane ever uses: a failed evaluation is
    /// re-dispatched through the queue, never restarted in place.
    Never,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkPolicy {
    /// No egress, no ingress, no DNS.
    Denied,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityPolicy {
    pub read_only_rootfs: bool,
    pub network: NetworkPolicy,
    pub run_as_non_root: bool,
    pub drop_all_capabilities: bool,
}

impl SecurityPolicy {
    /// The only sanctioned configuration for untrusted code.
    pub fn hardened() -> Self {
        Self {
            read_only_rootfs: true,
            network: NetworkPolicy::Denied,
            run_as_non_root: true,
            drop_all_capabilities: true,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLimits {
    pub memory_bytes: u64,
    pub cpu_shares: u32,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WorkloadSpec {
    /// Unique per dispatch attempt; doubles as the orchestrator object name.
    pub name: String,
    pub image: String,
    pub language: String,
    /// The untrusted program, as data.
    pub code: String,
    pub limits: ResourceLimits,
    /// Hard wall-clock bound, enforced by the orchestrator
    /// (`activeDeadlineSeconds`-equivalent).
    pub active_deadline: Duration,
    pub restart_policy: RestartPolicy,
    pub security: SecurityPolicy,
    pub labels: BTreeMap<String, String>,
}

impl WorkloadSpec {
    /// Build the hardened spec for one dispatch attempt of an envelope.
    pub fn from_envelope(envelope: &TaskEnvelope, attempt: u32) -> Self {
        let mut labels = BTreeMap::new();
        labels.insert(LABEL_MANAGED_BY.to_string(), MANAGED_BY_VALUE.to_string());
        labels.insert(LABEL_EVAL_ID.to_string(), envelope.eval_id.to_string());
        labels.insert(LABEL_PRESERVE.to_string(), envelope.preserve.to_string());
        labels.insert(
            LABEL_PRIORITY.to_string(),
            envelope.priority.as_str().to_string(),
        );

        Self {
            name: format!("crucible-{}-a{attempt}", envelope.eval_id),
            image: envelope.runtime_image.clone(),
            language: envelope.language.clone(),
            code: envelope.code.clone(),
            limits: ResourceLimits {
                memory_bytes: envelope.memory_bytes,
                cpu_shares: envelope.cpu_shares,
            },
            active_deadline: Duration::from_secs(envelope.timeout_seconds),
            restart_policy: RestartPolicy::Never,
            security: SecurityPolicy::hardened(),
            labels,
        }
    }

    pub fn preserve(&self) -> bool {
        self.labels.get(LABEL_PRESERVE).map(String::as_str) == Some("true")
    }
}

// ---------------------------------------------------------------------------
// Handle / status / logs
// ---------------------------------------------------------------------------

/// Opaque reference to a submitted workload (the orchestrator object name).
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkloadHandle(pub String);

impl WorkloadHandle {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for WorkloadHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkloadPhase {
    Pending,
    Running,
    Succeeded,
    Failed,
    Unknown,
}

impl WorkloadPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, WorkloadPhase::Succeeded | WorkloadPhase::Failed)
    }
}

/// The reason string an orchestrator attaches when it kills a workload for
/// exceeding its active deadline.
pub const REASON_DEADLINE_EXCEEDED: &str = "DeadlineExceeded";

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkloadStatus {
    pub phase: WorkloadPhase,
    pub reason: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WorkloadLogs {
    /// stdout and stderr multiplexed, in retrieval order.
    pub output: String,
    pub exit_code: Option<i32>,
}

/// One row of a `list()` call; enough for the cleanup controller to apply
/// its policy table without further round-trips.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WorkloadSnapshot {
    pub handle: WorkloadHandle,
    pub phase: WorkloadPhase,
    pub reason: Option<String>,
    pub labels: BTreeMap<String, String>,
    /// How long the workload has been in its current phase.
    pub phase_age: Duration,
}

impl WorkloadSnapshot {
    pub fn preserve(&self) -> bool {
        self.labels.get(LABEL_PRESERVE).map(String::as_str) == Some("true")
    }
}

// ---------------------------------------------------------------------------
// LabelSelector
// ---------------------------------------------------------------------------

/// Conjunctive label match.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelSelector(pub BTreeMap<String, String>);

impl LabelSelector {
    /// Everything this control plane dispatched.
    pub fn managed() -> Self {
        let mut m = BTreeMap::new();
        m.insert(LABEL_MANAGED_BY.to_string(), MANAGED_BY_VALUE.to_string());
        Self(m)
    }

    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        self.0
            .iter()
            .all(|(k, v)| labels.get(k).map(String::as_str) == Some(v.as_str()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crucible_schemas::{EvalId, Priority, RouteTag};

    fn envelope() -> TaskEnvelope {
        TaskEnvelope {
            eval_id: EvalId::new("abc123"),
            runtime_image: "python:3.11-slim".into(),
            language: "python".into(),
            code: "print('hi')".into(),
            timeout_seconds: 30,
            memory_bytes: 268_435_456,
            cpu_shares: 1024,
            priority: Priority::Urgent,
            preserve: true,
            route_tag: RouteTag::Primary,
            attempt: 0,
        }
    }

    #[test]
    fn spec_carries_hardened_security_and_never_restarts() {
        let spec = WorkloadSpec::from_envelope(&envelope(), 1);
        assert_eq!(spec.security, SecurityPolicy::hardened());
        assert_eq!(spec.restart_policy, RestartPolicy::Never);
        assert_eq!(spec.active_deadline, Duration::from_secs(30));
        assert!(spec.preserve());
    }

    #[test]
    fn spec_name_is_unique_per_attempt() {
        let a = WorkloadSpec::from_envelope(&envelope(), 1);
        let b = WorkloadSpec::from_envelope(&envelope(), 2);
        assert_ne!(a.name, b.name);
    }

    #[test]
    fn managed_selector_matches_only_managed_workloads() {
        let spec = WorkloadSpec::from_envelope(&envelope(), 1);
        assert!(LabelSelector::managed().matches(&spec.labels));

        let mut foreign = spec.labels.clone();
        foreign.insert(LABEL_MANAGED_BY.to_string(), "someone-else".to_string());
        assert!(!LabelSelector::managed().matches(&foreign));
        assert!(!LabelSelector::managed().matches(&BTreeMap::new()));
    }
}
