//! Axum router and all HTTP handlers for crucible-daemon.
//!
//! `build_router` is the single entry point; `main.rs` calls it and attaches
//! middleware layers. All handlers are `pub(crate)` so the scenario tests in
//! `tests/` can compose the router directly.

use std::convert::Infallible;
use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use futures_util::{Stream, StreamExt};
use serde_json::json;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{info, warn};

use crucible_events::BusEvent;
use crucible_queue::TaskQueue;
use crucible_schemas::{EvalId, EvalStatus, Evaluation, EventKind, TaskEnvelope};
use crucible_store::{DurableStore, IdempotencyOutcome, ListQuery};

use crate::api_types::{
    ErrorResponse, EventStreamParams, HealthResponse, ListParams, StatusResponse, SubmitRequest,
    SubmitResponse,
};
use crate::state::{uptime_secs, AppState};

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

/// Build the complete application router wired to the given shared state.
///
/// Middleware layers (CORS, tracing) are **not** applied here; `main.rs`
/// attaches them after this call so tests can use the bare router.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/eval", post(submit))
        .route("/eval/:id", get(get_eval))
        .route("/eval/:id/events", get(get_eval_events))
        .route("/evaluations", get(list_evaluations))
        .route("/events", get(event_stream))
        .route("/dlq", get(dead_letters))
        .route("/health", get(health))
        .route("/status", get(status_handler))
        .with_state(state)
}

fn error_response(status: StatusCode, kind: &str, message: impl Into<String>) -> Response {
    (
        status,
        Json(ErrorResponse {
            error: message.into(),
            kind: kind.to_string(),
        }),
    )
        .into_response()
}

// ---------------------------------------------------------------------------
// POST /eval
// ---------------------------------------------------------------------------

pub(crate) async fn submit(
    State(st): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<SubmitRequest>,
) -> Response {
    // Bounded ingress: saturation is a 429, not an unbounded pile-up.
    let Ok(_permit) = st.ingress_permits.try_acquire() else {
        return error_response(
            StatusCode::TOO_MANY_REQUESTS,
            "rate_limited",
            "ingress is saturated; retry later",
        );
    };

    // -- validation: no state changes before this point clears -------------
    if body.code.is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "validation", "code must not be empty");
    }
    if body.code.len() > st.config.eval_code_max_bytes {
        return error_response(
            StatusCode::PAYLOAD_TOO_LARGE,
            "validation",
            format!(
                "code exceeds the {} byte limit",
                st.config.eval_code_max_bytes
            ),
        );
    }

    let language = body.language.unwrap_or_else(|| "python".to_string());
    if !st.config.language_allow_list.contains(&language) {
        return error_response(
            StatusCode::BAD_REQUEST,
            "validation",
            format!("language {language:?} is not allowed"),
        );
    }

    let image = body
        .image
        .unwrap_or_else(|| st.config.image_allow_list[0].clone());
    if !st.config.image_allow_list.contains(&image) {
        return error_response(
            StatusCode::BAD_REQUEST,
            "validation",
            format!("image {image:?} is not allowed"),
        );
    }

    let now = Utc::now();
    let eval_id = EvalId::generate();

    // -- idempotency window -------------------------------------------------
    if let Some(key) = headers.get("idempotency-key").and_then(|v| v.to_str().ok()) {
        match st
            .store
            .idempotency_check_or_put(key, &eval_id, now, st.config.idempotency_window)
            .await
        {
            Ok(IdempotencyOutcome::Existing(prior)) => {
                let status = match st.store.get(&prior).await {
                    Ok(Some(eval)) => eval.status.as_str().to_string(),
                    _ => "queued".to_string(),
                };
                return (
                    StatusCode::ACCEPTED,
                    Json(SubmitResponse {
                        eval_id: prior,
                        status,
                    }),
                )
                    .into_response();
            }
            Ok(IdempotencyOutcome::New) => {}
            Err(err) => {
                warn!(error = %err, "idempotency lookup failed");
                return error_response(
                    StatusCode::SERVICE_UNAVAILABLE,
                    "ingress_unavailable",
                    "storage unavailable",
                );
            }
        }
    }

    // The routing decision is made before the row exists so each id is
    // bound to exactly one queue.
    let primary_depth = st.primary.depth().await;
    let route_tag = st.router.route(primary_depth);

    let eval = Evaluation::new_queued(
        eval_id.clone(),
        body.code,
        language,
        image,
        st.config.clamp_timeout(body.timeout_seconds),
        st.config.clamp_memory(body.memory_bytes),
        st.config.clamp_cpu_shares(body.cpu_shares),
        body.priority.unwrap_or_default(),
        body.preserve.unwrap_or(false),
        route_tag,
        now,
    );

    // Initial insert is the ONE ingress write; everything after is the
    // storage worker's. A failure here allocates nothing visible.
    if let Err(err) = st.store.insert_new(&eval).await {
        warn!(error = %err, "ingress insert failed");
        return error_response(
            StatusCode::SERVICE_UNAVAILABLE,
            "ingress_unavailable",
            "storage unavailable",
        );
    }

    st.bus.publish(BusEvent::lifecycle(
        eval_id.clone(),
        EventKind::Queued,
        json!({ "evaluation": &eval }),
    ));

    let envelope = TaskEnvelope::from_evaluation(&eval);
    let enqueued = match route_tag {
        crucible_schemas::RouteTag::Primary => st.primary.enqueue(envelope).await,
        crucible_schemas::RouteTag::Legacy => st.legacy.enqueue(envelope).await,
    };
    if let Err(err) = enqueued {
        // The row and queued event are already committed; the startup
        // reconcile job (or broker redelivery) picks the envelope back up.
        warn!(eval_id = %eval_id, error = %err, "enqueue failed; relying on reconcile");
    }

    st.counters.submitted.incr();
    info!(eval_id = %eval_id, route = route_tag.as_str(), "evaluation accepted");

    (
        StatusCode::ACCEPTED,
        Json(SubmitResponse {
            eval_id,
            status: "queued".to_string(),
        }),
    )
        .into_response()
}

// ---------------------------------------------------------------------------
// GET /eval/{id}
// ---------------------------------------------------------------------------

pub(crate) async fn get_eval(
    State(st): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Response {
    match st.store.get(&EvalId::new(id)).await {
        Ok(Some(eval)) => (StatusCode::OK, Json(eval)).into_response(),
        Ok(None) => error_response(StatusCode::NOT_FOUND, "not_found", "no such evaluation"),
        Err(err) => {
            warn!(error = %err, "evaluation read failed");
            error_response(
                StatusCode::SERVICE_UNAVAILABLE,
                "ingress_unavailable",
                "storage unavailable",
            )
        }
    }
}

// ---------------------------------------------------------------------------
// GET /eval/{id}/events
// ---------------------------------------------------------------------------

pub(crate) async fn get_eval_events(
    State(st): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Response {
    match st.store.events_for(&EvalId::new(id)).await {
        Ok(events) => (StatusCode::OK, Json(json!({ "events": events }))).into_response(),
        Err(err) => {
            warn!(error = %err, "event read failed");
            error_response(
                StatusCode::SERVICE_UNAVAILABLE,
                "ingress_unavailable",
                "storage unavailable",
            )
        }
    }
}

// ---------------------------------------------------------------------------
// GET /evaluations
// ---------------------------------------------------------------------------

pub(crate) async fn list_evaluations(
    State(st): State<Arc<AppState>>,
    Query(params): Query<ListParams>,
) -> Response {
    let limit = params.limit.unwrap_or(50).min(500);

    // status=running is served from the ephemeral running-set, hydrated
    // from the durable store for display fields.
    if params.status.as_deref() == Some("running") {
        let mut evaluations = Vec::new();
        for id in st.running.members() {
            match st.store.get(&id).await {
                // The running-set contract excludes terminal evaluations;
                // the filter below only papers over the removal race.
                Ok(Some(eval)) if !eval.status.is_terminal() => evaluations.push(eval),
                Ok(_) => {}
                Err(err) => {
                    warn!(error = %err, "running-set hydration failed");
                    return error_response(
                        StatusCode::SERVICE_UNAVAILABLE,
                        "ingress_unavailable",
                        "storage unavailable",
                    );
                }
            }
            if evaluations.len() >= limit {
                break;
            }
        }
        return (
            StatusCode::OK,
            Json(json!({ "evaluations": evaluations, "next_cursor": null })),
        )
            .into_response();
    }

    let status = match params.status.as_deref() {
        None => None,
        Some(raw) => match EvalStatus::parse(raw) {
            Some(s) => Some(s),
            None => {
                return error_response(
                    StatusCode::BAD_REQUEST,
                    "validation",
                    format!("unknown status {raw:?}"),
                )
            }
        },
    };

    let query = ListQuery {
        status,
        limit,
        cursor: params.cursor.map(EvalId::new),
    };
    match st.store.list(&query).await {
        Ok(evaluations) => {
            let next_cursor = (evaluations.len() == limit)
                .then(|| evaluations.last().map(|e| e.id.to_string()))
                .flatten();
            (
                StatusCode::OK,
                Json(json!({ "evaluations": evaluations, "next_cursor": next_cursor })),
            )
                .into_response()
        }
        Err(err) => {
            warn!(error = %err, "listing failed");
            error_response(
                StatusCode::SERVICE_UNAVAILABLE,
                "ingress_unavailable",
                "storage unavailable",
            )
        }
    }
}

// ---------------------------------------------------------------------------
// GET /dlq
// ---------------------------------------------------------------------------

pub(crate) async fn dead_letters(State(st): State<Arc<AppState>>) -> Response {
    let dead = st.primary.dead_letters().await;
    (StatusCode::OK, Json(json!({ "dead_letters": dead }))).into_response()
}

// ---------------------------------------------------------------------------
// GET /events  (SSE)
// ---------------------------------------------------------------------------

pub(crate) async fn event_stream(
    State(st): State<Arc<AppState>>,
    Query(params): Query<EventStreamParams>,
) -> Response {
    let rx = st.bus.subscribe();
    let events = broadcast_to_sse(rx, params);
    Sse::new(events).keep_alive(KeepAlive::new()).into_response()
}

fn broadcast_to_sse(
    rx: tokio::sync::broadcast::Receiver<BusEvent>,
    params: EventStreamParams,
) -> impl Stream<Item = Result<Event, Infallible>> {
    BroadcastStream::new(rx).filter_map(move |msg| {
        let params = params.clone();
        async move {
            match msg {
                Ok(event) => {
                    if let Some(want) = &params.eval_id {
                        if event.eval_id.as_str() != want {
                            return None;
                        }
                    }
                    if let Some(want) = &params.kind {
                        if event.kind.as_str() != want {
                            return None;
                        }
                    }
                    let data = serde_json::to_string(&event).ok()?;
                    Some(Ok(Event::default().event(event.kind.as_str()).data(data)))
                }
                Err(_) => None, // lagged / closed
            }
        }
    })
}

// ---------------------------------------------------------------------------
// GET /health
// ---------------------------------------------------------------------------

pub(crate) async fn health(State(st): State<Arc<AppState>>) -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(HealthResponse {
            status: "ok".to_string(),
            version: st.build.version,
            uptime_seconds: uptime_secs(),
            queue_depth: st.queue_depth().await,
            running: st.running.len(),
            pool_free: st.pool.free_count(),
        }),
    )
}

// ---------------------------------------------------------------------------
// GET /status
// ---------------------------------------------------------------------------

pub(crate) async fn status_handler(State(st): State<Arc<AppState>>) -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(StatusResponse {
            counters: st.counters.snapshot(),
            queue_depth: st.primary.depth().await,
            legacy_depth: st.legacy.depth().await,
            dead_letters: st.primary.dead_letters().await.len(),
            running: st.running.len(),
            pool_free: st.pool.free_count(),
        }),
    )
}
