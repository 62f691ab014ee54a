//! crucible-daemon entry point.
//!
//! This file is intentionally thin: it sets up tracing, builds the shared
//! state and background workers, wires middleware, and starts the HTTP
//! server. All route handlers live in `routes.rs`; all shared state types
//! live in `state.rs`.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use axum::http::{HeaderValue, Method};
use crucible_cleanup::{CleanupConfig, CleanupController};
use crucible_config::CoreConfig;
use crucible_daemon::{routes, state::AppState};
use crucible_dispatch::{Dispatcher, DispatcherConfig};
use crucible_executor::{build_driver, DriverKind, LabelSelector};
use crucible_queue::legacy_router;
use crucible_storeworker::{rebuild_running_set, requeue_stranded_legacy, StorageWorker};
use tower_http::{
    cors::CorsLayer,
    trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer},
};
use tracing::{info, Level};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env.local if present (dev convenience). Silent if the file does
    // not exist — production injects env vars directly.
    let _ = dotenvy::from_filename(".env.local");

    init_tracing();

    let config = CoreConfig::from_env();

    // Optional file-based deployment config: merged in order, reported by
    // canonical hash so operators can confirm what this daemon booted with.
    if let Ok(raw) = std::env::var("CRUCIBLE_CONFIG_FILES") {
        let paths: Vec<&str> = raw
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .collect();
        if !paths.is_empty() {
            let loaded = crucible_config::load_layered_yaml(&paths)?;
            info!(config_hash = %loaded.config_hash, "deployment config loaded");
        }
    }

    let shared = build_state(&config).await?;

    // Driver selection is a config enum over the sealed driver set.
    let driver_kind = std::env::var("EXECUTOR_DRIVER")
        .ok()
        .and_then(|s| DriverKind::parse(&s))
        .unwrap_or(DriverKind::Subprocess);
    let driver = build_driver(
        driver_kind,
        config.orchestrator_url.as_deref(),
        std::time::Duration::from_secs(10),
    )?;
    info!(?driver_kind, "executor driver selected");

    // -- background workers --------------------------------------------------
    let worker = Arc::new(StorageWorker::new(
        shared.store.clone(),
        shared.running.clone(),
        shared.bus.clone(),
        shared.counters.clone(),
    ));
    {
        let worker = worker.clone();
        tokio::spawn(async move { worker.run().await });
    }

    // Recovery before consumers start: running-set rebuild + stranded
    // legacy backlog.
    rebuild_running_set(&shared.store, &shared.running).await?;
    let legacy_as_queue: Arc<dyn crucible_queue::TaskQueue> = shared.legacy.clone();
    requeue_stranded_legacy(&shared.store, &legacy_as_queue).await?;

    let dispatcher_config = DispatcherConfig {
        lease_overhead: config.executor_lease_overhead,
        provisioning_deadline: config.provisioning_deadline,
        output_truncate_bytes: config.output_truncate_bytes,
        api_retry: config.retry_policies.aggressive.clone(),
        ..DispatcherConfig::production()
    };
    // One dispatcher per executor keeps the pool saturated without
    // over-subscribing it.
    for _ in 0..config.executor_pool_ids.len().max(1) {
        let dispatcher = Dispatcher::new(
            shared.primary.clone(),
            shared.pool.clone(),
            driver.clone(),
            shared.bus.clone(),
            dispatcher_config.clone(),
        );
        tokio::spawn(async move { dispatcher.run().await });
        let legacy_dispatcher = Dispatcher::new(
            shared.legacy.clone() as Arc<dyn crucible_queue::TaskQueue>,
            shared.pool.clone(),
            driver.clone(),
            shared.bus.clone(),
            dispatcher_config.clone(),
        );
        tokio::spawn(async move { legacy_dispatcher.run().await });
    }

    let cleanup = CleanupController::new(
        driver.clone(),
        shared.bus.clone(),
        shared.counters.clone(),
        CleanupConfig {
            fail_grace: config.cleanup_fail_grace,
            normal_ttl: config.cleanup_normal_ttl,
            preserve_ttl: config.cleanup_preserve_ttl,
            selector: LabelSelector::managed(),
            ..CleanupConfig::production()
        },
    );
    tokio::spawn(async move { cleanup.run().await });

    // -- HTTP surface --------------------------------------------------------
    // The legacy queue's own surface rides on the same listener under
    // /legacy during the migration window.
    let app = routes::build_router(Arc::clone(&shared))
        .nest("/legacy", legacy_router(shared.legacy.clone()))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
        .layer(cors_localhost_only());

    let addr = bind_addr_from_env().unwrap_or_else(|| SocketAddr::from(([127, 0, 0, 1], 8700)));
    info!("crucible-daemon listening on http://{}", addr);

    axum::serve(tokio::net::TcpListener::bind(addr).await?, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server crashed")?;

    Ok(())
}

/// Assemble the shared state: Postgres when `DURABLE_STORE_URL` is set,
/// fully in-memory otherwise.
async fn build_state(config: &CoreConfig) -> anyhow::Result<Arc<AppState>> {
    if config.durable_store_url.is_some() {
        let pool = crucible_store::connect_from_env().await?;
        crucible_store::migrate(&pool).await?;

        let in_mem = AppState::in_memory(config.clone());
        // Same wiring, durable store swapped in.
        let state = AppState::new(
            in_mem.bus.clone(),
            Arc::new(crucible_store::PgStore::new(pool)),
            in_mem.running.clone(),
            in_mem.pool.clone(),
            in_mem.primary.clone(),
            in_mem.legacy.clone(),
            in_mem.counters.clone(),
            config.clone(),
        );
        info!("durable store: postgres");
        Ok(Arc::new(state))
    } else {
        info!("durable store: in-memory (no DURABLE_STORE_URL)");
        Ok(AppState::in_memory(config.clone()))
    }
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();
}

fn bind_addr_from_env() -> Option<SocketAddr> {
    std::env::var("CRUCIBLE_DAEMON_ADDR").ok()?.parse().ok()
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("shutdown signal received");
}

/// CORS: allow only localhost origins.
fn cors_localhost_only() -> CorsLayer {
    let allowed_origins = [
        "http://localhost",
        "http://127.0.0.1",
        "http://localhost:3000",
        "http://127.0.0.1:3000",
        "http://localhost:5173",
        "http://127.0.0.1:5173",
    ];

    let origins: Vec<HeaderValue> = allowed_origins
        .iter()
        .filter_map(|o| HeaderValue::from_str(o).ok())
        .collect();

    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods([Method::GET, Method::POST, Method::DELETE])
        .allow_headers(tower_http::cors::Any)
}
