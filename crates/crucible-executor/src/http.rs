//! HTTP orchestrator driver: this crate's half of the wire contract with a
//! remote orchestrator shim that owns the real sandbox.
//!
//! Endpoints (JSON throughout):
//! - `POST   {base}/v1/workloads`                 — submit a spec, returns `{name}`
//! - `GET    {base}/v1/workloads/{name}`          — `{phase, reason}`
//! - `GET    {base}/v1/workloads/{name}/logs`     — `{output, exit_code}`
//! - `DELETE {base}/v1/workloads/{name}?grace_seconds=N`
//! - `GET    {base}/v1/workloads?selector=k=v,...` — snapshot list
//!
//! Failures carry the HTTP status as a typed [`HttpStatus`] in the error
//! chain so the dispatcher can classify retryability without string
//! matching.

use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::spec::{
    LabelSelector, WorkloadHandle, WorkloadLogs, WorkloadPhase, WorkloadSnapshot, WorkloadSpec,
    WorkloadStatus,
};
use crate::ExecutorDriver;

/// HTTP status carried through anyhow chains for retry classification.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HttpStatus(pub u16);

impl std::fmt::Display for HttpStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "orchestrator returned HTTP {}", self.0)
    }
}

impl std::error::Error for HttpStatus {}

pub struct HttpOrchestratorDriver {
    base: String,
    http: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct SubmitResponse {
    name: String,
}

#[derive(Debug, Deserialize)]
struct StatusResponse {
    phase: WorkloadPhase,
    reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct LogsResponse {
    output: String,
    exit_code: Option<i32>,
}

#[derive(Debug, Serialize, Deserialize)]
struct SnapshotResponse {
    name: String,
    phase: WorkloadPhase,
    reason: Option<String>,
    labels: BTreeMap<String, String>,
    phase_age_seconds: u64,
}

impl HttpOrchestratorDriver {
    pub fn new(base: impl Into<String>, request_timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .context("orchestrator client build failed")?;
        Ok(Self {
            base: base.into(),
            http,
        })
    }

    /// Surface non-2xx responses as `HttpStatus` errors.
    fn check(resp: reqwest::Response) -> Result<reqwest::Response> {
        let status = resp.status();
        if status.is_success() {
            Ok(resp)
        } else {
            Err(anyhow::Error::new(HttpStatus(status.as_u16())))
        }
    }
}

#[async_trait]
impl ExecutorDriver for HttpOrchestratorDriver {
    async fn execute(&self, spec: &WorkloadSpec) -> Result<WorkloadHandle> {
        let resp = self
            .http
            .post(format!("{}/v1/workloads", self.base))
            .json(spec)
            .send()
            .await
            .context("workload submit failed")?;
        let body: SubmitResponse = Self::check(resp)?
            .json()
            .await
            .context("workload submit body")?;
        Ok(WorkloadHandle(body.name))
    }

    async fn status(&self, handle: &WorkloadHandle) -> Result<WorkloadStatus> {
        let resp = self
            .http
            .get(format!("{}/v1/workloads/{handle}", self.base))
            .send()
            .await
            .context("workload status failed")?;
        let body: StatusResponse = Self::check(resp)?
            .json()
            .await
            .context("workload status body")?;
        Ok(WorkloadStatus {
            phase: body.phase,
            reason: body.reason,
        })
    }

    async fn logs(&self, handle: &WorkloadHandle) -> Result<WorkloadLogs> {
        let resp = self
            .http
            .get(format!("{}/v1/workloads/{handle}/logs", self.base))
            .send()
            .await
            .context("workload logs failed")?;
        let body: LogsResponse = Self::check(resp)?.json().await.context("workload logs body")?;
        Ok(WorkloadLogs {
            output: body.output,
            exit_code: body.exit_code,
        })
    }

    async fn delete(&self, handle: &WorkloadHandle, grace: Duration) -> Result<()> {
        let resp = self
            .http
            .delete(format!(
                "{}/v1/workloads/{handle}?grace_seconds={}",
                self.base,
                grace.as_secs()
            ))
            .send()
            .await
            .context("workload delete failed")?;
        // 404 = already gone: delete is a no-op then, per the contract.
        if resp.status().as_u16() == 404 {
            return Ok(());
        }
        Self::check(resp)?;
        Ok(())
    }

    async fn list(&self, selector: &LabelSelector) -> Result<Vec<WorkloadSnapshot>> {
        let selector_param: String = selector
            .0
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join(",");
        let resp = self
            .http
            .get(format!(
                "{}/v1/workloads?selector={selector_param}",
                self.base
            ))
            .send()
            .await
            .context("workload list failed")?;
        let body: Vec<SnapshotResponse> =
            Self::check(resp)?.json().await.context("workload list body")?;
        Ok(body
            .into_iter()
            .map(|s| WorkloadSnapshot {
                handle: WorkloadHandle(s.name),
                phase: s.phase,
                reason: s.reason,
                labels: s.labels,
                phase_age: Duration::from_secs(s.phase_age_seconds),
            })
            .collect())
    }
}
