//! Scenario: PostgreSQL store lifecycle round trip.
//!
//! # Invariant under test
//! The Postgres implementation honors the same contract the in-memory store
//! proves in unit tests: write-once insert, DAG-checked transitions,
//! terminal immutability, and `(eval_id, sequence)` event dedup.
//!
//! Both tests skip gracefully when `DURABLE_STORE_URL` is not set, making
//! them CI-friendly without a live Postgres instance.

use chrono::Utc;
use serde_json::json;

use crucible_events::BusEvent;
use crucible_schemas::{EvalId, EvalStatus, Evaluation, EventKind, Priority, RouteTag};
use crucible_store::{DurableStore, PgStore, TerminalResult, TransitionOutcome, ENV_DB_URL};

async fn pg() -> Option<PgStore> {
    if std::env::var(ENV_DB_URL).is_err() {
        eprintln!("SKIP: {ENV_DB_URL} not set");
        return None;
    }
    let pool = crucible_store::connect_from_env().await.expect("connect");
    crucible_store::migrate(&pool).await.expect("migrate");
    Some(PgStore::new(pool))
}

fn eval(id: &EvalId) -> Evaluation {
    Evaluation::new_queued(
        id.clone(),
        "print('hi')".into(),
        "python".into(),
        "python:3.11-slim".into(),
        30,
        268_435_456,
        1024,
        Priority::Normal,
        false,
        RouteTag::Primary,
        Utc::now(),
    )
}

#[tokio::test]
async fn lifecycle_walk_and_terminal_immutability() -> anyhow::Result<()> {
    let Some(store) = pg().await else {
        return Ok(());
    };

    let id = EvalId::generate();
    assert!(store.insert_new(&eval(&id)).await?);
    assert!(!store.insert_new(&eval(&id)).await?, "write-once");

    let now = Utc::now();
    assert_eq!(
        store.mark_provisioning(&id, now, "x1", 1).await?,
        TransitionOutcome::Applied
    );
    assert_eq!(
        store.mark_running(&id, now).await?,
        TransitionOutcome::Applied
    );

    let done = TerminalResult {
        status: EvalStatus::Completed,
        finished_at: now,
        exit_code: Some(0),
        output: Some("hi\n".into()),
        output_truncated: false,
        output_size: 3,
        error: None,
        error_kind: None,
    };
    assert_eq!(store.finalize(&id, &done).await?, TransitionOutcome::Applied);

    // A late failed must not overwrite.
    let late = TerminalResult {
        status: EvalStatus::Failed,
        error: Some("late callback".into()),
        ..done
    };
    assert_eq!(store.finalize(&id, &late).await?, TransitionOutcome::Dropped);

    let row = store.get(&id).await?.expect("row");
    assert_eq!(row.status, EvalStatus::Completed);
    assert_eq!(row.output.as_deref(), Some("hi\n"));
    assert_eq!(row.attempts, 1);
    assert!(row.started_at.is_some());
    Ok(())
}

#[tokio::test]
async fn event_append_deduplicates_on_the_sequence_pair() -> anyhow::Result<()> {
    let Some(store) = pg().await else {
        return Ok(());
    };

    let id = EvalId::generate();
    store.insert_new(&eval(&id)).await?;

    let event = BusEvent::lifecycle(id.clone(), EventKind::Queued, json!({}));
    assert!(store.append_event(&event).await?);
    assert!(!store.append_event(&event).await?, "same pair is a no-op");

    let events = store.events_for(&id).await?;
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].sequence, 1);
    Ok(())
}
