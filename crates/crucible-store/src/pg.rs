//! PostgreSQL-backed store.
//!
//! Plain `query`/`query_as` strings (no compile-time DB dependency) with
//! embedded migrations. Every transition is a single conditional UPDATE
//! whose WHERE clause carries the DAG edge, so concurrent delivery of the
//! same event cannot double-apply.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};

use crucible_events::BusEvent;
use crucible_schemas::{
    ErrorKind, EvalId, EvalStatus, Evaluation, EventKind, ExecutorId, Priority, RouteTag,
};

use crate::{
    DurableStore, IdempotencyOutcome, ListQuery, TerminalResult, TransitionOutcome, NON_TERMINAL,
};

pub const ENV_DB_URL: &str = "DURABLE_STORE_URL";

/// Connect using `DURABLE_STORE_URL`.
pub async fn connect_from_env() -> Result<PgPool> {
    let url = std::env::var(ENV_DB_URL).with_context(|| format!("missing env var {ENV_DB_URL}"))?;
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .acquire_timeout(Duration::from_secs(5))
        .connect(&url)
        .await
        .context("failed to connect to Postgres")?;
    Ok(pool)
}

/// Run embedded migrations.
pub async fn migrate(pool: &PgPool) -> Result<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .context("db migrate failed")?;
    Ok(())
}

pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn current_status(&self, id: &EvalId) -> Result<Option<EvalStatus>> {
        let row = sqlx::query("select status from evaluations where id = $1")
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await
            .context("status lookup failed")?;
        Ok(row.and_then(|r| EvalStatus::parse(r.get::<String, _>("status").as_str())))
    }
}

fn row_to_eval(row: &PgRow) -> Result<Evaluation> {
    let status_raw: String = row.get("status");
    let status = EvalStatus::parse(&status_raw)
        .with_context(|| format!("unknown status in db: {status_raw}"))?;
    let priority_raw: String = row.get("priority");
    let priority = match priority_raw.as_str() {
        "urgent" => Priority::Urgent,
        "normal" => Priority::Normal,
        "batch" => Priority::Batch,
        "maintenance" => Priority::Maintenance,
        other => anyhow::bail!("unknown priority in db: {other}"),
    };
    let route_raw: String = row.get("route_tag");
    let route_tag = match route_raw.as_str() {
        "primary" => RouteTag::Primary,
        "legacy" => RouteTag::Legacy,
        other => anyhow::bail!("unknown route_tag in db: {other}"),
    };

    Ok(Evaluation {
        id: EvalId::new(row.get::<String, _>("id")),
        code: row.get("code"),
        language: row.get("language"),
        runtime_image: row.get("runtime_image"),
        timeout_seconds: row.get::<i64, _>("timeout_seconds") as u64,
        memory_bytes: row.get::<i64, _>("memory_bytes") as u64,
        cpu_shares: row.get::<i32, _>("cpu_shares") as u32,
        priority,
        preserve: row.get("preserve"),
        route_tag,
        submitted_at: row.get("submitted_at"),
        status,
        queued_at: row.get("queued_at"),
        started_at: row.get("started_at"),
        finished_at: row.get("finished_at"),
        exit_code: row.get("exit_code"),
        output: row.get("output"),
        output_truncated: row.get("output_truncated"),
        output_size: row.get::<i64, _>("output_size") as u64,
        error: row.get("error"),
        executor_id: row
            .get::<Option<String>, _>("executor_id")
            .map(ExecutorId::new),
        attempts: row.get::<i32, _>("attempts") as u32,
        last_error_kind: row
            .get::<Option<String>, _>("last_error_kind")
            .as_deref()
            .and_then(ErrorKind::parse),
    })
}

const SELECT_COLS: &str = "id, code, language, runtime_image, timeout_seconds, memory_bytes, \
     cpu_shares, priority, preserve, route_tag, submitted_at, status, queued_at, started_at, \
     finished_at, exit_code, output, output_truncated, output_size, error, executor_id, \
     attempts, last_error_kind";

#[async_trait]
impl DurableStore for PgStore {
    async fn insert_new(&self, eval: &Evaluation) -> Result<bool> {
        let res = sqlx::query(
            r#"
            insert into evaluations (
              id, code, language, runtime_image, timeout_seconds, memory_bytes, cpu_shares,
              priority, preserve, route_tag, submitted_at, status, queued_at,
              output_truncated, output_size, attempts
            ) values ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13,$14,$15,$16)
            on conflict (id) do nothing
            "#,
        )
        .bind(eval.id.as_str())
        .bind(&eval.code)
        .bind(&eval.language)
        .bind(&eval.runtime_image)
        .bind(eval.timeout_seconds as i64)
        .bind(eval.memory_bytes as i64)
        .bind(eval.cpu_shares as i32)
        .bind(eval.priority.as_str())
        .bind(eval.preserve)
        .bind(eval.route_tag.as_str())
        .bind(eval.submitted_at)
        .bind(eval.status.as_str())
        .bind(eval.queued_at)
        .bind(eval.output_truncated)
        .bind(eval.output_size as i64)
        .bind(eval.attempts as i32)
        .execute(&self.pool)
        .await
        .context("insert_new failed")?;
        Ok(res.rows_affected() == 1)
    }

    async fn get(&self, id: &EvalId) -> Result<Option<Evaluation>> {
        let row = sqlx::query(&format!(
            "select {SELECT_COLS} from evaluations where id = $1"
        ))
        .bind(id.as_str())
        .fetch_optional(&self.pool)
        .await
        .context("get failed")?;
        row.as_ref().map(row_to_eval).transpose()
    }

    async fn list(&self, query: &ListQuery) -> Result<Vec<Evaluation>> {
        let limit = if query.limit == 0 { 50 } else { query.limit } as i64;
        let rows = sqlx::query(&format!(
            r#"
            select {SELECT_COLS} from evaluations
            where ($1::text is null or status = $1)
              and ($2::text is null or id < $2)
            order by id desc
            limit $3
            "#
        ))
        .bind(query.status.map(|s| s.as_str()))
        .bind(query.cursor.as_ref().map(|c| c.as_str().to_string()))
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("list failed")?;
        rows.iter().map(row_to_eval).collect()
    }

    async fn mark_provisioning(
        &self,
        id: &EvalId,
        at: DateTime<Utc>,
        executor_id: &str,
        attempt: u32,
    ) -> Result<TransitionOutcome> {
        let res = sqlx::query(
            r#"
            update evaluations
            set status = 'provisioning',
                started_at = coalesce(started_at, $2),
                executor_id = $3,
                attempts = greatest(attempts, $4)
            where id = $1 and status = 'queued'
            "#,
        )
        .bind(id.as_str())
        .bind(at)
        .bind(executor_id)
        .bind(attempt as i32)
        .execute(&self.pool)
        .await
        .context("mark_provisioning failed")?;
        if res.rows_affected() == 1 {
            return Ok(TransitionOutcome::Applied);
        }

        match self.current_status(id).await? {
            None => Ok(TransitionOutcome::NotFound),
            Some(EvalStatus::Provisioning) => {
                sqlx::query(
                    "update evaluations set attempts = greatest(attempts, $2) where id = $1",
                )
                .bind(id.as_str())
                .bind(attempt as i32)
                .execute(&self.pool)
                .await
                .context("attempts bump failed")?;
                Ok(TransitionOutcome::Unchanged)
            }
            Some(_) => Ok(TransitionOutcome::Dropped),
        }
    }

    async fn mark_running(&self, id: &EvalId, at: DateTime<Utc>) -> Result<TransitionOutcome> {
        let res = sqlx::query(
            r#"
            update evaluations
            set status = 'running', started_at = coalesce(started_at, $2)
            where id = $1 and status = 'provisioning'
            "#,
        )
        .bind(id.as_str())
        .bind(at)
        .execute(&self.pool)
        .await
        .context("mark_running failed")?;
        if res.rows_affected() == 1 {
            return Ok(TransitionOutcome::Applied);
        }

        match self.current_status(id).await? {
            None => Ok(TransitionOutcome::NotFound),
            Some(EvalStatus::Running) => Ok(TransitionOutcome::Unchanged),
            Some(s) if s.is_terminal() => {
                // Late running after terminal: backfill the timestamp only.
                let res = sqlx::query(
                    r#"
                    update evaluations set started_at = $2
                    where id = $1 and started_at is null
                    "#,
                )
                .bind(id.as_str())
                .bind(at)
                .execute(&self.pool)
                .await
                .context("started_at backfill failed")?;
                Ok(if res.rows_affected() == 1 {
                    TransitionOutcome::BackfilledTimestamp
                } else {
                    TransitionOutcome::Unchanged
                })
            }
            Some(_) => Ok(TransitionOutcome::Dropped),
        }
    }

    async fn finalize(&self, id: &EvalId, result: &TerminalResult) -> Result<TransitionOutcome> {
        let from: Vec<String> = NON_TERMINAL
            .iter()
            .map(|s| s.as_str().to_string())
            .collect();

        let res = sqlx::query(
            r#"
            update evaluations
            set status = $2, finished_at = $3, exit_code = $4, output = $5,
                output_truncated = $6, output_size = $7, error = $8, last_error_kind = $9
            where id = $1 and status = any($10)
            "#,
        )
        .bind(id.as_str())
        .bind(result.status.as_str())
        .bind(result.finished_at)
        .bind(result.exit_code)
        .bind(&result.output)
        .bind(result.output_truncated)
        .bind(result.output_size as i64)
        .bind(&result.error)
        .bind(result.error_kind.map(|k| k.as_str()))
        .bind(&from)
        .execute(&self.pool)
        .await
        .context("finalize failed")?;
        if res.rows_affected() == 1 {
            return Ok(TransitionOutcome::Applied);
        }

        match self.current_status(id).await? {
            None => Ok(TransitionOutcome::NotFound),
            Some(s) if s == result.status => Ok(TransitionOutcome::Unchanged),
            Some(_) => Ok(TransitionOutcome::Dropped),
        }
    }

    async fn append_event(&self, event: &BusEvent) -> Result<bool> {
        let res = sqlx::query(
            r#"
            insert into events (eval_id, sequence, ts, kind, payload)
            values ($1, $2, $3, $4, $5)
            on conflict (eval_id, sequence) do nothing
            "#,
        )
        .bind(event.eval_id.as_str())
        .bind(event.sequence as i64)
        .bind(event.timestamp)
        .bind(event.kind.as_str())
        .bind(&event.payload)
        .execute(&self.pool)
        .await
        .context("append_event failed")?;
        Ok(res.rows_affected() == 1)
    }

    async fn events_for(&self, id: &EvalId) -> Result<Vec<BusEvent>> {
        let rows = sqlx::query(
            "select eval_id, sequence, ts, kind, payload from events \
             where eval_id = $1 order by sequence",
        )
        .bind(id.as_str())
        .fetch_all(&self.pool)
        .await
        .context("events_for failed")?;

        rows.iter()
            .map(|row| {
                let kind_raw: String = row.get("kind");
                let kind = EventKind::parse(&kind_raw)
                    .with_context(|| format!("unknown event kind in db: {kind_raw}"))?;
                Ok(BusEvent {
                    eval_id: EvalId::new(row.get::<String, _>("eval_id")),
                    sequence: row.get::<i64, _>("sequence") as u64,
                    timestamp: row.get("ts"),
                    kind,
                    payload: row.get("payload"),
                })
            })
            .collect()
    }

    async fn non_terminal(&self) -> Result<Vec<Evaluation>> {
        let rows = sqlx::query(&format!(
            "select {SELECT_COLS} from evaluations \
             where status not in ('completed','failed','cancelled') order by id"
        ))
        .fetch_all(&self.pool)
        .await
        .context("non_terminal scan failed")?;
        rows.iter().map(row_to_eval).collect()
    }

    async fn idempotency_check_or_put(
        &self,
        key: &str,
        id: &EvalId,
        now: DateTime<Utc>,
        window: Duration,
    ) -> Result<IdempotencyOutcome> {
        let cutoff = now - chrono::Duration::seconds(window.as_secs() as i64);
        let mut tx = self.pool.begin().await.context("idempotency tx begin")?;

        let existing = sqlx::query(
            "select eval_id from idempotency_keys where key = $1 and created_at > $2 for update",
        )
        .bind(key)
        .bind(cutoff)
        .fetch_optional(&mut *tx)
        .await
        .context("idempotency lookup failed")?;

        if let Some(row) = existing {
            tx.commit().await.context("idempotency tx commit")?;
            return Ok(IdempotencyOutcome::Existing(EvalId::new(
                row.get::<String, _>("eval_id"),
            )));
        }

        sqlx::query(
            r#"
            insert into idempotency_keys (key, eval_id, created_at)
            values ($1, $2, $3)
            on conflict (key) do update set eval_id = $2, created_at = $3
            "#,
        )
        .bind(key)
        .bind(id.as_str())
        .bind(now)
        .execute(&mut *tx)
        .await
        .context("idempotency upsert failed")?;
        tx.commit().await.context("idempotency tx commit")?;
        Ok(IdempotencyOutcome::New)
    }
}
