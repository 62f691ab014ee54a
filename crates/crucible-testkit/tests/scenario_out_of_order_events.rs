//! Scenario: out-of-order event delivery.
//!
//! The terminal event reaches the storage worker before `running`. After
//! both are delivered the durable row is `completed` with `started_at`
//! populated from the late `running` event, and the events table holds a
//! single terminal record.

use std::time::Duration;

use chrono::Utc;
use serde_json::json;

use crucible_events::BusEvent;
use crucible_schemas::{EvalStatus, EventKind};
use crucible_store::DurableStore;
use crucible_testkit::Pipeline;

#[tokio::test]
async fn late_running_event_backfills_without_disturbing_the_terminal_row() {
    // Storage worker only — no dispatchers; this scenario plays producer.
    let p = Pipeline::boot(1);

    let id = p.submit(json!({ "code": "print('hi')" })).await;

    // Producer-side timestamps are ordered even though delivery is not.
    let ran_at = Utc::now();
    let finished_at = ran_at + chrono::Duration::milliseconds(40);

    let running = BusEvent {
        eval_id: id.clone(),
        sequence: 3,
        timestamp: ran_at,
        kind: EventKind::Running,
        payload: json!({}),
    };
    let completed = BusEvent {
        eval_id: id.clone(),
        sequence: 4,
        timestamp: finished_at,
        kind: EventKind::Completed,
        payload: json!({
            "exit_code": 0,
            "output": "hi\n",
            "output_truncated": false,
            "output_size": 3,
        }),
    };

    // Terminal first, running second.
    p.state.bus.publish(completed);
    p.state.bus.publish(running);

    let eval = p.wait_terminal(&id, Duration::from_secs(5)).await;
    assert_eq!(eval.status, EvalStatus::Completed);

    // The late running event only contributed its timestamp.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    loop {
        let row = p.state.store.get(&id).await.unwrap().unwrap();
        if row.started_at.is_some() {
            assert_eq!(row.started_at, Some(ran_at));
            assert!(row.started_at.unwrap() <= row.finished_at.unwrap());
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "started_at was never backfilled"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    // One terminal event, plus queued and the late running.
    let events = p.events_for(&id).await;
    let kinds: Vec<EventKind> = events.iter().map(|e| e.kind).collect();
    assert_eq!(
        kinds,
        vec![EventKind::Queued, EventKind::Running, EventKind::Completed]
    );
    assert_eq!(events.iter().filter(|e| e.sequence == 4).count(), 1);
}
