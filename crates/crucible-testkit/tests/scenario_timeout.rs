//! Scenario: runaway code is bounded by its timeout.
//!
//! `while True: pass` with a 1 s timeout fails with
//! `last_error_kind=timeout` shortly after the deadline, and the cleanup
//! controller deletes the killed workload (no preserve flag).

use std::time::Duration;

use serde_json::json;

use crucible_executor::{ExecutorDriver, LabelSelector};
use crucible_schemas::{ErrorKind, EvalStatus};
use crucible_testkit::Pipeline;

#[tokio::test]
async fn infinite_loop_times_out_and_the_workload_is_cleaned() {
    let p = Pipeline::full(1);

    let id = p
        .submit(json!({ "code": "while True: pass", "timeout_seconds": 1 }))
        .await;
    let eval = p.wait_terminal(&id, Duration::from_secs(10)).await;

    assert_eq!(eval.status, EvalStatus::Failed);
    assert_eq!(eval.last_error_kind, Some(ErrorKind::Timeout));
    assert!(eval.error.as_deref().unwrap().contains("timeout"));
    assert!(eval.started_at.is_some(), "it ran before it was killed");

    // Cleanup reaps the killed workload promptly (zero grace in tests).
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let remaining = p.driver.list(&LabelSelector::managed()).await.unwrap();
        if remaining.is_empty() {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "workload was never cleaned: {remaining:?}"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(p.state.counters.workloads_cleaned.get() >= 1);
}
