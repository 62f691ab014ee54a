//! Deterministic in-process pipeline harness.
//!
//! Composes the whole control plane — API router, bus, storage worker,
//! dispatchers, cleanup controller — over in-memory infrastructure
//! (MemStore, in-process KV, FakeDriver) with all delays collapsed, so the
//! end-to-end scenarios in `tests/` run in milliseconds and without a
//! network, a database, or an orchestrator.
//!
//! Background workers are spawned explicitly: a scenario that needs to
//! script driver outcomes before anything dispatches calls
//! [`Pipeline::boot`], scripts, then [`Pipeline::spawn_dispatchers`].

use std::sync::Arc;
use std::time::Duration;

use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use serde_json::Value;
use tower::ServiceExt; // oneshot

use crucible_cleanup::{CleanupConfig, CleanupController};
use crucible_config::CoreConfig;
use crucible_daemon::routes::build_router;
use crucible_daemon::state::AppState;
use crucible_dispatch::{Dispatcher, DispatcherConfig};
use crucible_executor::{FakeDriver, LabelSelector};
use crucible_queue::TaskQueue;
use crucible_retry::RetryPolicy;
use crucible_schemas::{EvalId, Evaluation};
use crucible_store::DurableStore;
use crucible_storeworker::StorageWorker;

/// Retry policy with all delays collapsed, for tests.
pub fn instant_retry(max_retries: u32) -> RetryPolicy {
    RetryPolicy {
        base: Duration::ZERO,
        exponential_base: 2.0,
        max_delay: Duration::ZERO,
        max_retries,
        jitter: false,
    }
}

/// Dispatcher config with millisecond cadence.
pub fn fast_dispatcher_config() -> DispatcherConfig {
    DispatcherConfig {
        lease_overhead: Duration::from_secs(60),
        visibility_overhead: Duration::from_secs(60),
        provisioning_deadline: Duration::from_millis(200),
        poll_interval: Duration::from_millis(5),
        pool_empty_backoff: Duration::from_millis(5),
        output_truncate_bytes: 1_048_576,
        api_retry: instant_retry(2),
        idle_backoff: Duration::from_millis(5),
    }
}

/// Cleanup config with millisecond cadence. The failure grace stays long
/// enough for the dispatcher to retrieve final logs first.
pub fn fast_cleanup_config() -> CleanupConfig {
    CleanupConfig {
        fail_grace: Duration::from_millis(150),
        normal_ttl: Duration::from_secs(600),
        preserve_ttl: Duration::from_secs(3600),
        interval: Duration::from_millis(10),
        selector: LabelSelector::managed(),
    }
}

pub struct Pipeline {
    pub state: Arc<AppState>,
    pub driver: Arc<FakeDriver>,
    handles: Vec<tokio::task::JoinHandle<()>>,
}

impl Pipeline {
    /// State + storage worker only; no dispatchers or cleanup yet.
    pub fn boot(pool_size: usize) -> Self {
        let mut config = CoreConfig::default();
        config.executor_pool_ids = (0..pool_size).map(|i| format!("executor-{i}")).collect();
        config.router_primary_percentage = 1.0;
        Self::boot_with(config)
    }

    pub fn boot_with(config: CoreConfig) -> Self {
        let state = AppState::in_memory(config);
        let driver = Arc::new(FakeDriver::new());

        let worker = StorageWorker::new(
            state.store.clone(),
            state.running.clone(),
            state.bus.clone(),
            state.counters.clone(),
        );
        let handle = tokio::spawn(async move { worker.run().await });

        Self {
            state,
            driver,
            handles: vec![handle],
        }
    }

    /// Fully wired pipeline: worker + `pool_size` dispatchers + cleanup.
    pub fn full(pool_size: usize) -> Self {
        let mut p = Self::boot(pool_size);
        p.spawn_dispatchers(pool_size.max(1) + 1);
        p.spawn_cleanup(fast_cleanup_config());
        p
    }

    pub fn spawn_dispatchers(&mut self, n: usize) {
        for _ in 0..n {
            let dispatcher = Dispatcher::new(
                self.state.primary.clone(),
                self.state.pool.clone(),
                self.driver.clone(),
                self.state.bus.clone(),
                fast_dispatcher_config(),
            );
            self.handles
                .push(tokio::spawn(async move { dispatcher.run().await }));
        }
        // One consumer for the legacy FIFO keeps percentage-routed
        // submissions moving too.
        let legacy = Dispatcher::new(
            self.state.legacy.clone() as Arc<dyn TaskQueue>,
            self.state.pool.clone(),
            self.driver.clone(),
            self.state.bus.clone(),
            fast_dispatcher_config(),
        );
        self.handles
            .push(tokio::spawn(async move { legacy.run().await }));
    }

    pub fn spawn_cleanup(&mut self, config: CleanupConfig) {
        let controller = CleanupController::new(
            self.driver.clone(),
            self.state.bus.clone(),
            self.state.counters.clone(),
            config,
        );
        self.handles
            .push(tokio::spawn(async move { controller.run().await }));
    }

    /// Drive the API router with one request, in-process.
    pub async fn request(&self, req: Request<axum::body::Body>) -> (StatusCode, Value) {
        let resp = build_router(self.state.clone())
            .oneshot(req)
            .await
            .expect("oneshot failed");
        let status = resp.status();
        let bytes = resp
            .into_body()
            .collect()
            .await
            .expect("body collect failed")
            .to_bytes();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).expect("body is not valid JSON")
        };
        (status, value)
    }

    /// POST /eval, asserting 202, returning the allocated id.
    pub async fn submit(&self, body: Value) -> EvalId {
        let req = Request::builder()
            .method("POST")
            .uri("/eval")
            .header("content-type", "application/json")
            .body(axum::body::Body::from(body.to_string()))
            .unwrap();
        let (status, json) = self.request(req).await;
        assert_eq!(status, StatusCode::ACCEPTED, "submit rejected: {json}");
        assert_eq!(json["status"], "queued");
        EvalId::new(json["eval_id"].as_str().expect("eval_id missing"))
    }

    pub async fn get_eval(&self, id: &EvalId) -> (StatusCode, Value) {
        let req = Request::builder()
            .method("GET")
            .uri(format!("/eval/{id}"))
            .body(axum::body::Body::empty())
            .unwrap();
        self.request(req).await
    }

    /// Poll the durable store until the evaluation is terminal.
    pub async fn wait_terminal(&self, id: &EvalId, timeout: Duration) -> Evaluation {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(eval) = self.state.store.get(id).await.expect("store read") {
                if eval.status.is_terminal() {
                    return eval;
                }
            }
            if tokio::time::Instant::now() >= deadline {
                panic!("evaluation {id} did not reach a terminal state in {timeout:?}");
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    /// Sequence-ordered audit trail from the durable store.
    pub async fn events_for(&self, id: &EvalId) -> Vec<crucible_events::BusEvent> {
        self.state.store.events_for(id).await.expect("events read")
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        for handle in &self.handles {
            handle.abort();
        }
    }
}
