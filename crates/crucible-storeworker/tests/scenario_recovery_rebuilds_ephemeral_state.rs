//! Scenario: startup recovery rebuilds the ephemeral side from the durable
//! store.
//!
//! # Invariant under test
//! After a cold start, the running-set contains exactly the provisioning/
//! running evaluations, and legacy-routed evaluations stranded in `queued`
//! are re-enqueued (primary-routed ones are left to the broker).

use std::sync::Arc;

use chrono::Utc;

use crucible_kv::{MemoryKv, RunningSet};
use crucible_queue::{LegacyQueue, TaskQueue};
use crucible_schemas::{EvalId, Evaluation, Priority, RouteTag};
use crucible_store::{DurableStore, MemStore, TerminalResult};
use crucible_storeworker::{rebuild_running_set, requeue_stranded_legacy};

fn eval(id: &str, route: RouteTag) -> Evaluation {
    Evaluation::new_queued(
        EvalId::new(id),
        "print('hi')".into(),
        "python".into(),
        "python:3.11-slim".into(),
        30,
        268_435_456,
        1024,
        Priority::Normal,
        false,
        route,
        Utc::now(),
    )
}

#[tokio::test]
async fn recovery_restores_running_set_and_legacy_backlog() {
    let store: Arc<dyn DurableStore> = Arc::new(MemStore::new());
    let now = Utc::now();

    // queued/legacy — must be re-enqueued.
    store.insert_new(&eval("q-legacy", RouteTag::Legacy)).await.unwrap();
    // queued/primary — the broker's own redelivery covers it.
    store.insert_new(&eval("q-primary", RouteTag::Primary)).await.unwrap();
    // provisioning — belongs in the running-set.
    store.insert_new(&eval("prov", RouteTag::Primary)).await.unwrap();
    store.mark_provisioning(&EvalId::new("prov"), now, "x1", 1).await.unwrap();
    // running — belongs in the running-set.
    store.insert_new(&eval("run", RouteTag::Primary)).await.unwrap();
    store.mark_provisioning(&EvalId::new("run"), now, "x2", 1).await.unwrap();
    store.mark_running(&EvalId::new("run"), now).await.unwrap();
    // completed — recovered into neither.
    store.insert_new(&eval("done", RouteTag::Legacy)).await.unwrap();
    store
        .finalize(
            &EvalId::new("done"),
            &TerminalResult {
                status: crucible_schemas::EvalStatus::Completed,
                finished_at: now,
                exit_code: Some(0),
                output: Some(String::new()),
                output_truncated: false,
                output_size: 0,
                error: None,
                error_kind: None,
            },
        )
        .await
        .unwrap();

    let running = RunningSet::new(Arc::new(MemoryKv::new()));
    // Stale pre-crash entry must not survive the rebuild.
    running.insert(&EvalId::new("ghost"));

    let count = rebuild_running_set(&store, &running).await.unwrap();
    assert_eq!(count, 2);
    assert!(running.contains(&EvalId::new("prov")));
    assert!(running.contains(&EvalId::new("run")));
    assert!(!running.contains(&EvalId::new("ghost")));

    let legacy: Arc<dyn TaskQueue> = Arc::new(LegacyQueue::new());
    let requeued = requeue_stranded_legacy(&store, &legacy).await.unwrap();
    assert_eq!(requeued, 1);

    let r = legacy
        .reserve(std::time::Duration::from_secs(60))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(r.envelope.eval_id, EvalId::new("q-legacy"));
}
