//! Scenario: cleanup deletes only what its selector matches.
//!
//! # Invariant under test
//! A reconcile pass deletes the failed, non-preserved workload it manages,
//! emits `workload.cleaned`, and leaves both (a) workloads outside its label
//! selector and (b) preserved failures inside the TTL untouched.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use crucible_cleanup::{CleanupConfig, CleanupController};
use crucible_events::EventBus;
use crucible_executor::{
    ExecutorDriver, FakeDriver, LabelSelector, WorkloadSpec, LABEL_EVAL_ID, LABEL_MANAGED_BY,
    LABEL_PRESERVE,
};
use crucible_kv::Counters;
use crucible_schemas::{EvalId, EventKind, Priority, RouteTag, TaskEnvelope};

fn managed_spec(id: &str, code: &str, preserve: bool) -> WorkloadSpec {
    WorkloadSpec::from_envelope(
        &TaskEnvelope {
            eval_id: EvalId::new(id),
            runtime_image: "python:3.11-slim".into(),
            language: "python".into(),
            code: code.into(),
            timeout_seconds: 30,
            memory_bytes: 268_435_456,
            cpu_shares: 1024,
            priority: Priority::Normal,
            preserve,
            route_tag: RouteTag::Primary,
            attempt: 0,
        },
        1,
    )
}

/// A workload someone else owns: same shape, different manager label.
fn foreign_spec(name: &str) -> WorkloadSpec {
    let mut spec = managed_spec(name, "1/0", false);
    spec.name = format!("foreign-{name}");
    spec.labels
        .insert(LABEL_MANAGED_BY.to_string(), "other-controller".to_string());
    spec
}

fn fast_config() -> CleanupConfig {
    CleanupConfig {
        fail_grace: Duration::ZERO,
        normal_ttl: Duration::from_secs(600),
        preserve_ttl: Duration::from_secs(3600),
        interval: Duration::from_millis(10),
        selector: LabelSelector::managed(),
    }
}

#[tokio::test]
async fn failed_workload_is_cleaned_foreign_and_preserved_are_not() {
    let driver = Arc::new(FakeDriver::new());
    let bus = EventBus::new(64);
    let mut rx = bus.subscribe();
    let counters = Arc::new(Counters::default());

    // Failed + not preserved: immediate delete.
    driver.execute(&managed_spec("dead", "1/0", false)).await.unwrap();
    // Failed + preserved: stays until the long TTL.
    driver.execute(&managed_spec("kept", "1/0", true)).await.unwrap();
    // Foreign failed workload: never ours to touch.
    driver.execute(&foreign_spec("alien")).await.unwrap();

    let controller = CleanupController::new(driver.clone(), bus, counters.clone(), fast_config());
    let cleaned = controller.reconcile_once().await.unwrap();
    assert_eq!(cleaned, 1);
    assert_eq!(counters.workloads_cleaned.get(), 1);

    let deleted = driver.deleted();
    assert_eq!(deleted.len(), 1);
    assert!(deleted[0].contains("dead"));

    // The cleaned event names the workload and carries the reason.
    let event = rx.recv().await.unwrap();
    assert_eq!(event.kind, EventKind::WorkloadCleaned);
    assert_eq!(event.eval_id, EvalId::new("dead"));
    assert_eq!(event.payload["reason"], "failed_grace");

    // Preserved + foreign workloads are still listed by an unselective look.
    let all = driver.list(&LabelSelector(BTreeMap::new())).await.unwrap();
    assert_eq!(all.len(), 2);
}

#[tokio::test]
async fn succeeded_workload_outlives_the_pass_until_its_ttl() {
    let driver = Arc::new(FakeDriver::new());
    let counters = Arc::new(Counters::default());

    driver
        .execute(&managed_spec("ok", "print('hi')", false))
        .await
        .unwrap();

    let controller =
        CleanupController::new(driver.clone(), EventBus::new(8), counters, fast_config());
    // Fresh success: short TTL (600s) not reached, nothing deleted.
    assert_eq!(controller.reconcile_once().await.unwrap(), 0);
    assert!(driver.deleted().is_empty());

    // With a zero TTL the same workload is reaped on the next pass.
    let mut eager = fast_config();
    eager.normal_ttl = Duration::ZERO;
    let eager_controller =
        CleanupController::new(driver.clone(), EventBus::new(8), Arc::new(Counters::default()), eager);
    assert_eq!(eager_controller.reconcile_once().await.unwrap(), 1);
}

#[tokio::test]
async fn label_eval_id_flows_into_the_cleaned_event() {
    let driver = Arc::new(FakeDriver::new());
    let bus = EventBus::new(8);
    let mut rx = bus.subscribe();

    let spec = managed_spec("traced", "1/0", false);
    assert_eq!(spec.labels.get(LABEL_EVAL_ID).unwrap(), "traced");
    assert_eq!(spec.labels.get(LABEL_PRESERVE).unwrap(), "false");
    driver.execute(&spec).await.unwrap();

    CleanupController::new(driver, bus, Arc::new(Counters::default()), fast_config())
        .reconcile_once()
        .await
        .unwrap();
    assert_eq!(rx.recv().await.unwrap().eval_id, EvalId::new("traced"));
}
