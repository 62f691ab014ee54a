//! Scenario: legacy client against a live legacy server.
//!
//! # Invariant under test
//! `LegacyClient` speaks the same wire contract `legacy_router` serves:
//! enqueue → next → complete round-trips over real HTTP on an ephemeral
//! localhost port, and an empty queue surfaces as `None`, not an error.

use std::sync::Arc;
use std::time::Duration;

use crucible_queue::{legacy_router, LegacyClient, LegacyQueue};
use crucible_schemas::{EvalId, Priority, RouteTag, TaskEnvelope};

fn envelope(id: &str) -> TaskEnvelope {
    TaskEnvelope {
        eval_id: EvalId::new(id),
        runtime_image: "python:3.11-slim".into(),
        language: "python".into(),
        code: "print('hi')".into(),
        timeout_seconds: 30,
        memory_bytes: 268_435_456,
        cpu_shares: 1024,
        priority: Priority::Normal,
        preserve: false,
        route_tag: RouteTag::Legacy,
        attempt: 0,
    }
}

async fn serve_legacy(queue: Arc<LegacyQueue>) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind ephemeral port");
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = axum::serve(listener, legacy_router(queue)).await;
    });
    format!("http://{addr}")
}

#[tokio::test]
async fn client_and_server_agree_on_the_wire_contract() {
    let queue = Arc::new(LegacyQueue::new());
    let base = serve_legacy(queue.clone()).await;
    let client = LegacyClient::new(base).unwrap();

    client.enqueue(&envelope("e1")).await.unwrap();
    assert_eq!(queue.len(), 1);

    let got = client
        .next(Duration::from_secs(60))
        .await
        .unwrap()
        .expect("task available");
    assert_eq!(got.eval_id, EvalId::new("e1"));

    client.complete("e1").await.unwrap();
    assert!(queue.is_empty());

    // Drained queue: next yields None via 204.
    assert!(client.next(Duration::from_secs(60)).await.unwrap().is_none());
}

#[tokio::test]
async fn failing_over_http_requeues_the_task() {
    let queue = Arc::new(LegacyQueue::new());
    let base = serve_legacy(queue.clone()).await;
    let client = LegacyClient::new(base).unwrap();

    client.enqueue(&envelope("e1")).await.unwrap();
    let _ = client.next(Duration::from_secs(60)).await.unwrap().unwrap();
    client.fail("e1").await.unwrap();

    let again = client
        .next(Duration::from_secs(60))
        .await
        .unwrap()
        .expect("requeued task");
    assert_eq!(again.attempt, 1);
}
