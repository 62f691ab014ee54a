//! Scenario: a user program that raises.
//!
//! `1/0` must land in terminal `failed` with `last_error_kind=user_error`, a
//! non-zero exit code, and a user-visible message naming the exception.

use std::time::Duration;

use serde_json::json;

use crucible_schemas::{ErrorKind, EvalStatus};
use crucible_testkit::Pipeline;

#[tokio::test]
async fn division_by_zero_is_a_user_error() {
    let p = Pipeline::full(1);

    let id = p.submit(json!({ "code": "1/0" })).await;
    let eval = p.wait_terminal(&id, Duration::from_secs(10)).await;

    assert_eq!(eval.status, EvalStatus::Failed);
    assert_eq!(eval.last_error_kind, Some(ErrorKind::UserError));
    assert_ne!(eval.exit_code, Some(0));
    assert!(eval.error.as_deref().unwrap().contains("ZeroDivisionError"));
    // The captured traceback rides in the output field.
    assert!(eval
        .output
        .as_deref()
        .unwrap()
        .contains("Traceback (most recent call last)"));
    // Truncation fields are always populated on terminal states.
    assert!(!eval.output_truncated);
    assert!(eval.output_size > 0);

    assert_eq!(p.state.counters.failed.get(), 1);
    assert_eq!(p.state.pool.free_count(), 1, "lease returned on failure");
}
