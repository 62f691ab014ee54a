//! Shared runtime state for crucible-daemon.
//!
//! Handlers receive `State<Arc<AppState>>` from Axum. Every collaborator is
//! an explicit dependency injected at construction — no globals — so the
//! scenario tests can assemble a fully in-memory control plane.

use std::sync::Arc;

use tokio::sync::Semaphore;

use crucible_config::CoreConfig;
use crucible_events::EventBus;
use crucible_kv::{Counters, ExecutorPool, MemoryKv, RunningSet};
use crucible_queue::{LegacyQueue, PriorityQueue, Router, RouterConfig, TaskQueue};
use crucible_schemas::ExecutorId;
use crucible_store::{DurableStore, MemStore};

/// Static build metadata included in health responses.
#[derive(Clone, Debug)]
pub struct BuildInfo {
    pub service: &'static str,
    pub version: &'static str,
}

/// Cloneable (Arc) handle shared across all Axum handlers.
pub struct AppState {
    pub bus: EventBus,
    pub store: Arc<dyn DurableStore>,
    pub running: RunningSet,
    pub pool: ExecutorPool,
    pub primary: Arc<dyn TaskQueue>,
    /// Concrete FIFO: the migration-window HTTP surface needs the real type,
    /// not the trait object.
    pub legacy: Arc<LegacyQueue>,
    pub router: Router,
    pub counters: Arc<Counters>,
    pub config: CoreConfig,
    pub build: BuildInfo,
    /// Bounds concurrent submissions; exhaustion surfaces as 429.
    pub ingress_permits: Semaphore,
}

impl AppState {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        bus: EventBus,
        store: Arc<dyn DurableStore>,
        running: RunningSet,
        pool: ExecutorPool,
        primary: Arc<dyn TaskQueue>,
        legacy: Arc<LegacyQueue>,
        counters: Arc<Counters>,
        config: CoreConfig,
    ) -> Self {
        let router = Router::new(RouterConfig {
            primary_percentage: config.router_primary_percentage,
            force_legacy: config.force_legacy_queue,
            spill_threshold: config.router_spill_threshold,
        });
        Self {
            bus,
            store,
            running,
            pool,
            primary,
            legacy,
            router,
            counters,
            config,
            build: BuildInfo {
                service: "crucible-daemon",
                version: env!("CARGO_PKG_VERSION"),
            },
            ingress_permits: Semaphore::new(256),
        }
    }

    /// Fully in-memory state for tests and local development: MemStore,
    /// in-process KV, both queues.
    pub fn in_memory(config: CoreConfig) -> Arc<Self> {
        let counters = Arc::new(Counters::default());
        let kv = Arc::new(MemoryKv::new());
        kv.seed_pool(config.executor_pool_ids.iter().map(|id| ExecutorId::new(id.as_str())));

        let primary: Arc<dyn TaskQueue> = Arc::new(PriorityQueue::new(
            config.queue_priorities.clone(),
            config.retry_policies.default.clone(),
            counters.clone(),
        ));
        let legacy = Arc::new(LegacyQueue::new());

        Arc::new(Self::new(
            EventBus::default(),
            Arc::new(MemStore::new()),
            RunningSet::new(kv.clone()),
            ExecutorPool::new(kv, counters.clone()),
            primary,
            legacy,
            counters,
            config,
        ))
    }

    /// Total backlog across both queues.
    pub async fn queue_depth(&self) -> usize {
        self.primary.depth().await + self.legacy.len()
    }
}

/// Monotonically increasing uptime since first call (process lifetime).
pub fn uptime_secs() -> u64 {
    static START: std::sync::OnceLock<std::time::Instant> = std::sync::OnceLock::new();
    START
        .get_or_init(std::time::Instant::now)
        .elapsed()
        .as_secs()
}
