//! Scenario: HTTP orchestrator driver against a stub orchestrator.
//!
//! # Invariant under test
//! The driver speaks the documented wire contract (submit / status / logs /
//! delete / list) over real HTTP, treats a 404 delete as a no-op, and
//! surfaces non-2xx responses as typed `HttpStatus` errors so the
//! dispatcher can classify retryability.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::Json;
use serde_json::{json, Value};

use crucible_executor::{
    ExecutorDriver, HttpOrchestratorDriver, HttpStatus, LabelSelector, WorkloadHandle,
    WorkloadPhase, WorkloadSpec,
};
use crucible_schemas::{EvalId, Priority, RouteTag, TaskEnvelope};

type Stub = Arc<Mutex<HashMap<String, Value>>>;

async fn submit(State(stub): State<Stub>, Json(spec): Json<Value>) -> impl IntoResponse {
    let name = spec["name"].as_str().unwrap_or_default().to_string();
    if name.contains("reject") {
        return (StatusCode::UNPROCESSABLE_ENTITY, Json(json!({}))).into_response();
    }
    stub.lock().unwrap().insert(name.clone(), spec);
    (StatusCode::CREATED, Json(json!({ "name": name }))).into_response()
}

async fn status(State(stub): State<Stub>, Path(name): Path<String>) -> impl IntoResponse {
    if !stub.lock().unwrap().contains_key(&name) {
        return (StatusCode::NOT_FOUND, Json(json!({}))).into_response();
    }
    (
        StatusCode::OK,
        Json(json!({ "phase": "succeeded", "reason": null })),
    )
        .into_response()
}

async fn logs(Path(_name): Path<String>) -> impl IntoResponse {
    Json(json!({ "output": "hi\n", "exit_code": 0 }))
}

async fn remove(State(stub): State<Stub>, Path(name): Path<String>) -> impl IntoResponse {
    if stub.lock().unwrap().remove(&name).is_some() {
        StatusCode::OK
    } else {
        StatusCode::NOT_FOUND
    }
}

async fn list(State(stub): State<Stub>) -> impl IntoResponse {
    let items: Vec<Value> = stub
        .lock()
        .unwrap()
        .iter()
        .map(|(name, spec)| {
            json!({
                "name": name,
                "phase": "succeeded",
                "reason": null,
                "labels": spec["labels"],
                "phase_age_seconds": 5,
            })
        })
        .collect();
    Json(Value::Array(items))
}

async fn serve_stub() -> (String, Stub) {
    let stub: Stub = Arc::new(Mutex::new(HashMap::new()));
    let app = axum::Router::new()
        .route("/v1/workloads", post(submit).get(list))
        .route("/v1/workloads/:name", get(status).delete(remove))
        .route("/v1/workloads/:name/logs", get(logs))
        .with_state(stub.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind ephemeral port");
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    (format!("http://{addr}"), stub)
}

fn spec(id: &str) -> WorkloadSpec {
    WorkloadSpec::from_envelope(
        &TaskEnvelope {
            eval_id: EvalId::new(id),
            runtime_image: "python:3.11-slim".into(),
            language: "python".into(),
            code: "print('hi')".into(),
            timeout_seconds: 30,
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
async fn submit_status_logs_list_round_trip() {
    let (base, _stub) = serve_stub().await;
    let driver = HttpOrchestratorDriver::new(base, Duration::from_secs(5)).unwrap();

    let handle = driver.execute(&spec("e1")).await.unwrap();
    assert!(handle.as_str().contains("e1"));

    let status = driver.status(&handle).await.unwrap();
    assert_eq!(status.phase, WorkloadPhase::Succeeded);

    let logs = driver.logs(&handle).await.unwrap();
    assert_eq!(logs.output, "hi\n");
    assert_eq!(logs.exit_code, Some(0));

    let listed = driver.list(&LabelSelector::managed()).await.unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].phase, WorkloadPhase::Succeeded);
    assert_eq!(listed[0].phase_age, Duration::from_secs(5));
}

#[tokio::test]
async fn rejection_surfaces_as_a_typed_http_status() {
    let (base, _stub) = serve_stub().await;
    let driver = HttpOrchestratorDriver::new(base, Duration::from_secs(5)).unwrap();

    let mut rejected = spec("e1");
    rejected.name = "reject-me".to_string();
    let err = driver.execute(&rejected).await.unwrap_err();
    assert_eq!(err.downcast_ref::<HttpStatus>(), Some(&HttpStatus(422)));
}

#[tokio::test]
async fn deleting_a_missing_workload_is_a_noop() {
    let (base, _stub) = serve_stub().await;
    let driver = HttpOrchestratorDriver::new(base, Duration::from_secs(5)).unwrap();

    driver
        .delete(&WorkloadHandle("ghost".to_string()), Duration::ZERO)
        .await
        .expect("404 delete is a no-op");
}
