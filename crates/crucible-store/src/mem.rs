//! Deterministic in-memory store. Same contract as [`PgStore`], no I/O;
//! BTreeMap iteration keeps listings and scans stable for tests.

use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crucible_events::BusEvent;
use crucible_schemas::{EvalId, EvalStatus, Evaluation};

use crate::{
    DurableStore, IdempotencyOutcome, ListQuery, TerminalResult, TransitionOutcome,
};

#[derive(Default)]
struct MemInner {
    evals: BTreeMap<EvalId, Evaluation>,
    events: BTreeMap<(EvalId, u64), BusEvent>,
    idempotency: BTreeMap<String, (EvalId, DateTime<Utc>)>,
}

#[derive(Default)]
pub struct MemStore {
    inner: Mutex<MemInner>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl DurableStore for MemStore {
    async fn insert_new(&self, eval: &Evaluation) -> Result<bool> {
        let mut inner = self.lock();
        if inner.evals.contains_key(&eval.id) {
            return Ok(false);
        }
        inner.evals.insert(eval.id.clone(), eval.clone());
        Ok(true)
    }

    async fn get(&self, id: &EvalId) -> Result<Option<Evaluation>> {
        Ok(self.lock().evals.get(id).cloned())
    }

    async fn list(&self, query: &ListQuery) -> Result<Vec<Evaluation>> {
        let inner = self.lock();
        let limit = if query.limit == 0 { 50 } else { query.limit };
        let mut out: Vec<Evaluation> = inner
            .evals
            .values()
            .rev() // newest first: ids sort chronologically
            .filter(|e| query.status.map_or(true, |s| e.status == s))
            .filter(|e| query.cursor.as_ref().map_or(true, |c| e.id < *c))
            .take(limit)
            .cloned()
            .collect();
        out.shrink_to_fit();
        Ok(out)
    }

    async fn mark_provisioning(
        &self,
        id: &EvalId,
        at: DateTime<Utc>,
        executor_id: &str,
        attempt: u32,
    ) -> Result<TransitionOutcome> {
        let mut inner = self.lock();
        let Some(eval) = inner.evals.get_mut(id) else {
            return Ok(TransitionOutcome::NotFound);
        };

        match eval.status {
            EvalStatus::Queued => {
                eval.status = EvalStatus::Provisioning;
                eval.started_at.get_or_insert(at);
                eval.executor_id = Some(crucible_schemas::ExecutorId::new(executor_id));
                eval.attempts = eval.attempts.max(attempt);
                Ok(TransitionOutcome::Applied)
            }
            // Replay of a step already taken: keep attempts monotone.
            EvalStatus::Provisioning => {
                eval.attempts = eval.attempts.max(attempt);
                Ok(TransitionOutcome::Unchanged)
            }
            _ => Ok(TransitionOutcome::Dropped),
        }
    }

    async fn mark_running(&self, id: &EvalId, at: DateTime<Utc>) -> Result<TransitionOutcome> {
        let mut inner = self.lock();
        let Some(eval) = inner.evals.get_mut(id) else {
            return Ok(TransitionOutcome::NotFound);
        };

        match eval.status {
            EvalStatus::Provisioning => {
                eval.status = EvalStatus::Running;
                eval.started_at.get_or_insert(at);
                Ok(TransitionOutcome::Applied)
            }
            EvalStatus::Running => Ok(TransitionOutcome::Unchanged),
            s if s.is_terminal() => {
                // Late `running` after a terminal write: the status race is
                // lost but the timestamp is still real information.
                if eval.started_at.is_none() {
                    eval.started_at = Some(at);
                    Ok(TransitionOutcome::BackfilledTimestamp)
                } else {
                    Ok(TransitionOutcome::Unchanged)
                }
            }
            _ => Ok(TransitionOutcome::Dropped),
        }
    }

    async fn finalize(&self, id: &EvalId, result: &TerminalResult) -> Result<TransitionOutcome> {
        let mut inner = self.lock();
        let Some(eval) = inner.evals.get_mut(id) else {
            return Ok(TransitionOutcome::NotFound);
        };

        if eval.status.is_terminal() {
            return Ok(if eval.status == result.status {
                TransitionOutcome::Unchanged
            } else {
                TransitionOutcome::Dropped
            });
        }

        eval.status = result.status;
        eval.finished_at = Some(result.finished_at);
        eval.exit_code = result.exit_code;
        eval.output = result.output.clone();
        eval.output_truncated = result.output_truncated;
        eval.output_size = result.output_size;
        eval.error = result.error.clone();
        eval.last_error_kind = result.error_kind;
        Ok(TransitionOutcome::Applied)
    }

    async fn append_event(&self, event: &BusEvent) -> Result<bool> {
        let mut inner = self.lock();
        let key = (event.eval_id.clone(), event.sequence);
        if inner.events.contains_key(&key) {
            return Ok(false);
        }
        inner.events.insert(key, event.clone());
        Ok(true)
    }

    async fn events_for(&self, id: &EvalId) -> Result<Vec<BusEvent>> {
        let inner = self.lock();
        Ok(inner
            .events
            .range((id.clone(), 0)..=(id.clone(), u64::MAX))
            .map(|(_, e)| e.clone())
            .collect())
    }

    async fn non_terminal(&self) -> Result<Vec<Evaluation>> {
        let inner = self.lock();
        Ok(inner
            .evals
            .values()
            .filter(|e| !e.status.is_terminal())
            .cloned()
            .collect())
    }

    async fn idempotency_check_or_put(
        &self,
        key: &str,
        id: &EvalId,
        now: DateTime<Utc>,
        window: Duration,
    ) -> Result<IdempotencyOutcome> {
        let mut inner = self.lock();
        if let Some((existing, at)) = inner.idempotency.get(key) {
            let age = now.signed_duration_since(*at);
            if age.num_seconds() >= 0 && (age.num_seconds() as u64) < window.as_secs() {
                return Ok(IdempotencyOutcome::Existing(existing.clone()));
            }
        }
        inner
            .idempotency
            .insert(key.to_string(), (id.clone(), now));
        Ok(IdempotencyOutcome::New)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crucible_schemas::{EventKind, Priority, RouteTag};
    use serde_json::json;

    fn eval(id: &str) -> Evaluation {
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
            RouteTag::Primary,
            Utc::now(),
        )
    }

    #[tokio::test]
    async fn insert_is_write_once() {
        let store = MemStore::new();
        assert!(store.insert_new(&eval("a")).await.unwrap());
        assert!(!store.insert_new(&eval("a")).await.unwrap());
    }

    #[tokio::test]
    async fn lifecycle_walk_applies_and_replays_are_unchanged() {
        let store = MemStore::new();
        let id = EvalId::new("a");
        store.insert_new(&eval("a")).await.unwrap();
        let now = Utc::now();

        assert_eq!(
            store.mark_provisioning(&id, now, "x1", 1).await.unwrap(),
            TransitionOutcome::Applied
        );
        assert_eq!(
            store.mark_provisioning(&id, now, "x1", 1).await.unwrap(),
            TransitionOutcome::Unchanged
        );
        assert_eq!(
            store.mark_running(&id, now).await.unwrap(),
            TransitionOutcome::Applied
        );

        let row = store.get(&id).await.unwrap().unwrap();
        assert_eq!(row.status, EvalStatus::Running);
        assert_eq!(row.attempts, 1);
        assert!(row.started_at.is_some());
    }

    #[tokio::test]
    async fn terminal_is_never_overwritten() {
        let store = MemStore::new();
        let id = EvalId::new("a");
        store.insert_new(&eval("a")).await.unwrap();
        let now = Utc::now();
        store.mark_provisioning(&id, now, "x1", 1).await.unwrap();
        store.mark_running(&id, now).await.unwrap();

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
        assert_eq!(
            store.finalize(&id, &done).await.unwrap(),
            TransitionOutcome::Applied
        );

        let failed = TerminalResult {
            status: EvalStatus::Failed,
            error: Some("late".into()),
            ..done.clone()
        };
        assert_eq!(
            store.finalize(&id, &failed).await.unwrap(),
            TransitionOutcome::Dropped
        );
        assert_eq!(
            store.get(&id).await.unwrap().unwrap().status,
            EvalStatus::Completed
        );
    }

    #[tokio::test]
    async fn late_running_backfills_started_at_only() {
        let store = MemStore::new();
        let id = EvalId::new("a");
        store.insert_new(&eval("a")).await.unwrap();
        let now = Utc::now();

        // Terminal arrives first (out-of-order delivery).
        let failed = TerminalResult {
            status: EvalStatus::Failed,
            finished_at: now,
            exit_code: Some(1),
            output: None,
            output_truncated: false,
            output_size: 0,
            error: Some("boom".into()),
            error_kind: None,
        };
        store.finalize(&id, &failed).await.unwrap();

        assert_eq!(
            store.mark_running(&id, now).await.unwrap(),
            TransitionOutcome::BackfilledTimestamp
        );
        let row = store.get(&id).await.unwrap().unwrap();
        assert_eq!(row.status, EvalStatus::Failed);
        assert_eq!(row.started_at, Some(now));
    }

    #[tokio::test]
    async fn duplicate_event_append_is_a_noop() {
        let store = MemStore::new();
        let e = BusEvent::lifecycle(EvalId::new("a"), EventKind::Queued, json!({}));
        assert!(store.append_event(&e).await.unwrap());
        assert!(!store.append_event(&e).await.unwrap());
        assert_eq!(store.events_for(&EvalId::new("a")).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn listing_is_newest_first_with_cursor() {
        let store = MemStore::new();
        for id in ["a1", "a2", "a3"] {
            store.insert_new(&eval(id)).await.unwrap();
        }

        let page = store
            .list(&ListQuery {
                limit: 2,
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(page[0].id, EvalId::new("a3"));
        assert_eq!(page[1].id, EvalId::new("a2"));

        let next = store
            .list(&ListQuery {
                limit: 2,
                cursor: Some(EvalId::new("a2")),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(next.len(), 1);
        assert_eq!(next[0].id, EvalId::new("a1"));
    }

    #[tokio::test]
    async fn idempotency_window_bounds_reuse() {
        let store = MemStore::new();
        let now = Utc::now();
        let window = Duration::from_secs(60);

        assert_eq!(
            store
                .idempotency_check_or_put("k", &EvalId::new("a"), now, window)
                .await
                .unwrap(),
            IdempotencyOutcome::New
        );
        assert_eq!(
            store
                .idempotency_check_or_put("k", &EvalId::new("b"), now, window)
                .await
                .unwrap(),
            IdempotencyOutcome::Existing(EvalId::new("a"))
        );
        // Past the window the key is fair game again.
        let later = now + chrono::Duration::seconds(61);
        assert_eq!(
            store
                .idempotency_check_or_put("k", &EvalId::new("c"), later, window)
                .await
                .unwrap(),
            IdempotencyOutcome::New
        );
    }
}
