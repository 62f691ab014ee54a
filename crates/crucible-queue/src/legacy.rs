//! The legacy queue: in-process FIFO with an HTTP surface.
//!
//! No persistence — on restart the queue is empty, and a startup job
//! re-enqueues router-tagged evaluations stuck in `queued` (see the storage
//! worker's recovery module). No retry budget and no dead-letter queue
//! either: a failed task goes to the back of the line. This component exists
//! only for the migration window and is reached solely through the router
//! percentage.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use async_trait::async_trait;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::Json;
use serde::{Deserialize, Serialize};

use crucible_schemas::TaskEnvelope;

use crate::{DeadLetter, NackOutcome, Reservation, ReservationToken, TaskQueue};

struct LegacyInflight {
    envelope: TaskEnvelope,
    deadline: Instant,
}

#[derive(Default)]
struct LegacyState {
    ready: VecDeque<TaskEnvelope>,
    /// Keyed by eval id — the HTTP surface completes/fails by id.
    inflight: HashMap<String, LegacyInflight>,
    /// Reservation tokens handed out via the trait, mapped back to ids.
    tokens: HashMap<u64, String>,
    next_token: u64,
}

#[derive(Default)]
pub struct LegacyQueue {
    state: Mutex<LegacyState>,
}

impl LegacyQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, LegacyState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn settle(st: &mut LegacyState, now: Instant) {
        let expired: Vec<String> = st
            .inflight
            .iter()
            .filter(|(_, inf)| now >= inf.deadline)
            .map(|(id, _)| id.clone())
            .collect();
        for id in expired {
            let inf = st.inflight.remove(&id).expect("id present");
            st.tokens.retain(|_, v| *v != id);
            st.ready.push_back(inf.envelope);
        }
    }

    pub fn push(&self, envelope: TaskEnvelope) {
        let mut st = self.lock();
        Self::settle(&mut st, Instant::now());
        st.ready.push_back(envelope);
    }

    pub fn take_next(&self, visibility: Duration) -> Option<TaskEnvelope> {
        let now = Instant::now();
        let mut st = self.lock();
        Self::settle(&mut st, now);

        let envelope = st.ready.pop_front()?;
        st.inflight.insert(
            envelope.eval_id.to_string(),
            LegacyInflight {
                envelope: envelope.clone(),
                deadline: now + visibility,
            },
        );
        Some(envelope)
    }

    /// Returns false for an unknown (or already settled) id.
    pub fn complete(&self, eval_id: &str) -> bool {
        let mut st = self.lock();
        st.tokens.retain(|_, v| v != eval_id);
        st.inflight.remove(eval_id).is_some()
    }

    /// Failed tasks rejoin the back of the FIFO.
    pub fn fail(&self, eval_id: &str) -> bool {
        let mut st = self.lock();
        st.tokens.retain(|_, v| v != eval_id);
        match st.inflight.remove(eval_id) {
            Some(mut inf) => {
                inf.envelope.attempt += 1;
                st.ready.push_back(inf.envelope);
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        let mut st = self.lock();
        Self::settle(&mut st, Instant::now());
        st.ready.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl TaskQueue for LegacyQueue {
    async fn enqueue(&self, envelope: TaskEnvelope) -> Result<()> {
        self.push(envelope);
        Ok(())
    }

    async fn reserve(&self, overhead: Duration) -> Result<Option<Reservation>> {
        let now = Instant::now();
        let mut st = self.lock();
        Self::settle(&mut st, now);

        let Some(envelope) = st.ready.pop_front() else {
            return Ok(None);
        };
        let visibility = overhead + Duration::from_secs(envelope.timeout_seconds);
        st.inflight.insert(
            envelope.eval_id.to_string(),
            LegacyInflight {
                envelope: envelope.clone(),
                deadline: now + visibility,
            },
        );
        let token = ReservationToken(st.next_token);
        st.next_token += 1;
        st.tokens.insert(token.0, envelope.eval_id.to_string());
        Ok(Some(Reservation { token, envelope }))
    }

    async fn ack(&self, token: ReservationToken) -> Result<()> {
        let id = { self.lock().tokens.get(&token.0).cloned() };
        if let Some(id) = id {
            self.complete(&id);
        }
        Ok(())
    }

    async fn nack(&self, token: ReservationToken, _error: &str) -> Result<NackOutcome> {
        let id = { self.lock().tokens.get(&token.0).cloned() };
        if let Some(id) = id {
            self.fail(&id);
        }
        Ok(NackOutcome::Requeued {
            delay: Duration::ZERO,
        })
    }

    async fn requeue(&self, token: ReservationToken, _delay: Duration) -> Result<()> {
        let id = { self.lock().tokens.get(&token.0).cloned() };
        if let Some(id) = id {
            let mut st = self.lock();
            st.tokens.retain(|_, v| *v != id);
            if let Some(inf) = st.inflight.remove(&id) {
                // The FIFO has no delay lane; the envelope just rejoins the
                // back of the line untouched.
                st.ready.push_back(inf.envelope);
            }
        }
        Ok(())
    }

    async fn depth(&self) -> usize {
        self.len()
    }

    async fn dead_letters(&self) -> Vec<DeadLetter> {
        Vec::new()
    }
}

// ---------------------------------------------------------------------------
// HTTP surface
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize)]
struct EnqueuedResponse {
    queued: bool,
    depth: usize,
}

#[derive(Debug, Serialize, Deserialize)]
struct SettleResponse {
    ok: bool,
}

#[derive(Debug, Deserialize)]
struct NextParams {
    visibility_seconds: Option<u64>,
}

/// Router for the legacy queue's HTTP surface. Middleware is attached by the
/// caller so tests can drive the bare router.
pub fn legacy_router(queue: Arc<LegacyQueue>) -> axum::Router {
    axum::Router::new()
        .route("/tasks", post(enqueue_task))
        .route("/tasks/next", get(next_task))
        .route("/tasks/:id/complete", post(complete_task))
        .route("/tasks/:id/fail", post(fail_task))
        .with_state(queue)
}

async fn enqueue_task(
    State(q): State<Arc<LegacyQueue>>,
    Json(envelope): Json<TaskEnvelope>,
) -> impl IntoResponse {
    q.push(envelope);
    (
        StatusCode::ACCEPTED,
        Json(EnqueuedResponse {
            queued: true,
            depth: q.len(),
        }),
    )
}

async fn next_task(
    State(q): State<Arc<LegacyQueue>>,
    Query(params): Query<NextParams>,
) -> axum::response::Response {
    let visibility = Duration::from_secs(params.visibility_seconds.unwrap_or(60));
    match q.take_next(visibility) {
        Some(envelope) => (StatusCode::OK, Json(envelope)).into_response(),
        None => StatusCode::NO_CONTENT.into_response(),
    }
}

async fn complete_task(
    State(q): State<Arc<LegacyQueue>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    let ok = q.complete(&id);
    let status = if ok { StatusCode::OK } else { StatusCode::NOT_FOUND };
    (status, Json(SettleResponse { ok }))
}

async fn fail_task(
    State(q): State<Arc<LegacyQueue>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    let ok = q.fail(&id);
    let status = if ok { StatusCode::OK } else { StatusCode::NOT_FOUND };
    (status, Json(SettleResponse { ok }))
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// Thin reqwest client for a remote legacy queue.
pub struct LegacyClient {
    base: String,
    http: reqwest::Client,
}

impl LegacyClient {
    pub fn new(base: impl Into<String>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .context("legacy client build failed")?;
        Ok(Self {
            base: base.into(),
            http,
        })
    }

    pub async fn enqueue(&self, envelope: &TaskEnvelope) -> Result<()> {
        self.http
            .post(format!("{}/tasks", self.base))
            .json(envelope)
            .send()
            .await
            .context("legacy enqueue failed")?
            .error_for_status()
            .context("legacy enqueue rejected")?;
        Ok(())
    }

    pub async fn next(&self, visibility: Duration) -> Result<Option<TaskEnvelope>> {
        let resp = self
            .http
            .get(format!(
                "{}/tasks/next?visibility_seconds={}",
                self.base,
                visibility.as_secs()
            ))
            .send()
            .await
            .context("legacy next failed")?;
        if resp.status() == reqwest::StatusCode::NO_CONTENT {
            return Ok(None);
        }
        let envelope = resp
            .error_for_status()
            .context("legacy next rejected")?
            .json::<TaskEnvelope>()
            .await
            .context("legacy next body")?;
        Ok(Some(envelope))
    }

    pub async fn complete(&self, eval_id: &str) -> Result<()> {
        self.http
            .post(format!("{}/tasks/{eval_id}/complete", self.base))
            .send()
            .await
            .context("legacy complete failed")?
            .error_for_status()
            .context("legacy complete rejected")?;
        Ok(())
    }

    pub async fn fail(&self, eval_id: &str) -> Result<()> {
        self.http
            .post(format!("{}/tasks/{eval_id}/fail", self.base))
            .send()
            .await
            .context("legacy fail failed")?
            .error_for_status()
            .context("legacy fail rejected")?;
        Ok(())
    }
}
