//! Process-wide configuration, read once at startup.
//!
//! Two layers:
//! - `CoreConfig::from_env()` — the operational knobs (router percentage,
//!   pool ids, cleanup TTLs, limits) from environment variables, with
//!   defaults and clamping. This is what every binary reads.
//! - `layers` — optional file-based deployment config: YAML files merged in
//!   order and hashed canonically, so a running system can report exactly
//!   which config it was started with.

use std::time::Duration;

use crucible_retry::{aggressive, conservative, default_policy, RetryPolicy};
use crucible_schemas::Priority;

pub mod layers;

pub use layers::{load_layered_yaml, LoadedConfig};

// ---------------------------------------------------------------------------
// Env var names (the external contract; see the ops runbook)
// ---------------------------------------------------------------------------

pub const ENV_ROUTER_PRIMARY_PERCENTAGE: &str = "ROUTER_PRIMARY_PERCENTAGE";
pub const ENV_FORCE_LEGACY_QUEUE: &str = "FORCE_LEGACY_QUEUE";
pub const ENV_EXECUTOR_POOL_IDS: &str = "EXECUTOR_POOL_IDS";
pub const ENV_EXECUTOR_LEASE_TTL_SECONDS: &str = "EXECUTOR_LEASE_TTL_SECONDS";
pub const ENV_QUEUE_PRIORITIES: &str = "QUEUE_PRIORITIES";
pub const ENV_CLEANUP_FAIL_GRACE_SECONDS: &str = "CLEANUP_FAIL_GRACE_SECONDS";
pub const ENV_CLEANUP_NORMAL_TTL_SECONDS: &str = "CLEANUP_NORMAL_TTL_SECONDS";
pub const ENV_CLEANUP_PRESERVE_TTL_SECONDS: &str = "CLEANUP_PRESERVE_TTL_SECONDS";
pub const ENV_EVAL_CODE_MAX_BYTES: &str = "EVAL_CODE_MAX_BYTES";
pub const ENV_OUTPUT_TRUNCATE_BYTES: &str = "OUTPUT_TRUNCATE_BYTES";
pub const ENV_DEFAULT_TIMEOUT_SECONDS: &str = "DEFAULT_TIMEOUT_SECONDS";
pub const ENV_PROVISIONING_DEADLINE_SECONDS: &str = "PROVISIONING_DEADLINE_SECONDS";
pub const ENV_IDEMPOTENCY_WINDOW_SECONDS: &str = "IDEMPOTENCY_WINDOW_SECONDS";
pub const ENV_EVAL_LANGUAGE_ALLOW_LIST: &str = "EVAL_LANGUAGE_ALLOW_LIST";
pub const ENV_EVAL_IMAGE_ALLOW_LIST: &str = "EVAL_IMAGE_ALLOW_LIST";
pub const ENV_EVENT_BUS_URL: &str = "EVENT_BUS_URL";
pub const ENV_DURABLE_STORE_URL: &str = "DURABLE_STORE_URL";
pub const ENV_EPHEMERAL_KV_URL: &str = "EPHEMERAL_KV_URL";
pub const ENV_ORCHESTRATOR_URL: &str = "ORCHESTRATOR_URL";

// Clamping bounds for client-supplied resource requests.
pub const TIMEOUT_SECONDS_MIN: u64 = 1;
pub const TIMEOUT_SECONDS_MAX: u64 = 3600;
pub const MEMORY_BYTES_MIN: u64 = 16 * 1024 * 1024;
pub const MEMORY_BYTES_MAX: u64 = 8 * 1024 * 1024 * 1024;
pub const CPU_SHARES_MIN: u32 = 64;
pub const CPU_SHARES_MAX: u32 = 4096;

// ---------------------------------------------------------------------------
// RetryPolicies
// ---------------------------------------------------------------------------

/// The three named retry policies of the platform.
#[derive(Clone, Debug)]
pub struct RetryPolicies {
    pub default: RetryPolicy,
    pub aggressive: RetryPolicy,
    pub conservative: RetryPolicy,
}

impl Default for RetryPolicies {
    fn default() -> Self {
        Self {
            default: default_policy(),
            aggressive: aggressive(),
            conservative: conservative(),
        }
    }
}

// ---------------------------------------------------------------------------
// CoreConfig
// ---------------------------------------------------------------------------

/// Everything the control plane reads at startup. Immutable afterwards;
/// components receive it (or a sub-struct) as an explicit dependency.
#[derive(Clone, Debug)]
pub struct CoreConfig {
    /// Share of submissions routed to the primary queue, in `[0, 1]`.
    pub router_primary_percentage: f64,
    /// Emergency rollback: route everything to the legacy queue.
    pub force_legacy_queue: bool,
    /// Optional backpressure knob: primary depth above which the router
    /// spills to legacy. Off by default.
    pub router_spill_threshold: Option<usize>,

    pub executor_pool_ids: Vec<String>,
    /// Fixed overhead added to an evaluation's timeout to form its executor
    /// lease TTL (the last-resort expiry if a dispatcher dies mid-flight).
    pub executor_lease_overhead: Duration,

    /// Drain order for queue consumers.
    pub queue_priorities: Vec<Priority>,
    pub retry_policies: RetryPolicies,

    pub cleanup_fail_grace: Duration,
    pub cleanup_normal_ttl: Duration,
    pub cleanup_preserve_ttl: Duration,

    pub eval_code_max_bytes: usize,
    pub output_truncate_bytes: usize,
    pub default_timeout_seconds: u64,
    pub provisioning_deadline: Duration,
    pub idempotency_window: Duration,

    pub language_allow_list: Vec<String>,
    pub image_allow_list: Vec<String>,

    pub event_bus_url: Option<String>,
    pub durable_store_url: Option<String>,
    pub ephemeral_kv_url: Option<String>,
    pub orchestrator_url: Option<String>,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            router_primary_percentage: 1.0,
            force_legacy_queue: false,
            router_spill_threshold: None,
            executor_pool_ids: vec!["executor-0".to_string(), "executor-1".to_string()],
            executor_lease_overhead: Duration::from_secs(120),
            queue_priorities: Priority::ALL.to_vec(),
            retry_policies: RetryPolicies::default(),
            cleanup_fail_grace: Duration::from_secs(10),
            cleanup_normal_ttl: Duration::from_secs(600),
            cleanup_preserve_ttl: Duration::from_secs(3600),
            eval_code_max_bytes: 131_072,
            output_truncate_bytes: 1_048_576,
            default_timeout_seconds: 30,
            provisioning_deadline: Duration::from_secs(60),
            idempotency_window: Duration::from_secs(86_400),
            language_allow_list: vec!["python".to_string()],
            image_allow_list: vec![
                "python:3.11-slim".to_string(),
                "python:3.12-slim".to_string(),
            ],
            event_bus_url: None,
            durable_store_url: None,
            ephemeral_kv_url: None,
            orchestrator_url: None,
        }
    }
}

impl CoreConfig {
    /// Read the full config from the environment. Missing vars fall back to
    /// defaults; malformed values fall back too rather than aborting boot.
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            router_primary_percentage: env_f64(ENV_ROUTER_PRIMARY_PERCENTAGE)
                .unwrap_or(d.router_primary_percentage)
                .clamp(0.0, 1.0),
            force_legacy_queue: env_bool(ENV_FORCE_LEGACY_QUEUE).unwrap_or(d.force_legacy_queue),
            router_spill_threshold: None,
            executor_pool_ids: env_list(ENV_EXECUTOR_POOL_IDS).unwrap_or(d.executor_pool_ids),
            executor_lease_overhead: env_secs(ENV_EXECUTOR_LEASE_TTL_SECONDS)
                .unwrap_or(d.executor_lease_overhead),
            queue_priorities: env_priorities(ENV_QUEUE_PRIORITIES).unwrap_or(d.queue_priorities),
            retry_policies: RetryPolicies::default(),
            cleanup_fail_grace: env_secs(ENV_CLEANUP_FAIL_GRACE_SECONDS)
                .unwrap_or(d.cleanup_fail_grace),
            cleanup_normal_ttl: env_secs(ENV_CLEANUP_NORMAL_TTL_SECONDS)
                .unwrap_or(d.cleanup_normal_ttl),
            cleanup_preserve_ttl: env_secs(ENV_CLEANUP_PRESERVE_TTL_SECONDS)
                .unwrap_or(d.cleanup_preserve_ttl),
            eval_code_max_bytes: env_usize(ENV_EVAL_CODE_MAX_BYTES).unwrap_or(d.eval_code_max_bytes),
            output_truncate_bytes: env_usize(ENV_OUTPUT_TRUNCATE_BYTES)
                .unwrap_or(d.output_truncate_bytes),
            default_timeout_seconds: env_u64(ENV_DEFAULT_TIMEOUT_SECONDS)
                .unwrap_or(d.default_timeout_seconds),
            provisioning_deadline: env_secs(ENV_PROVISIONING_DEADLINE_SECONDS)
                .unwrap_or(d.provisioning_deadline),
            idempotency_window: env_secs(ENV_IDEMPOTENCY_WINDOW_SECONDS)
                .unwrap_or(d.idempotency_window),
            language_allow_list: env_list(ENV_EVAL_LANGUAGE_ALLOW_LIST)
                .unwrap_or(d.language_allow_list),
            image_allow_list: env_list(ENV_EVAL_IMAGE_ALLOW_LIST).unwrap_or(d.image_allow_list),
            event_bus_url: std::env::var(ENV_EVENT_BUS_URL).ok(),
            durable_store_url: std::env::var(ENV_DURABLE_STORE_URL).ok(),
            ephemeral_kv_url: std::env::var(ENV_EPHEMERAL_KV_URL).ok(),
            orchestrator_url: std::env::var(ENV_ORCHESTRATOR_URL).ok(),
        }
    }

    /// Clamp a client-supplied timeout into the accepted band, substituting
    /// the default when absent.
    pub fn clamp_timeout(&self, requested: Option<u64>) -> u64 {
        requested
            .unwrap_or(self.default_timeout_seconds)
            .clamp(TIMEOUT_SECONDS_MIN, TIMEOUT_SECONDS_MAX)
    }

    pub fn clamp_memory(&self, requested: Option<u64>) -> u64 {
        requested
            .unwrap_or(MEMORY_BYTES_MIN * 16) // 256 MiB default
            .clamp(MEMORY_BYTES_MIN, MEMORY_BYTES_MAX)
    }

    pub fn clamp_cpu_shares(&self, requested: Option<u32>) -> u32 {
        requested.unwrap_or(1024).clamp(CPU_SHARES_MIN, CPU_SHARES_MAX)
    }
}

// ---------------------------------------------------------------------------
// Env parsing helpers
// ---------------------------------------------------------------------------

fn env_f64(name: &str) -> Option<f64> {
    std::env::var(name).ok()?.trim().parse().ok()
}

fn env_u64(name: &str) -> Option<u64> {
    std::env::var(name).ok()?.trim().parse().ok()
}

fn env_usize(name: &str) -> Option<usize> {
    std::env::var(name).ok()?.trim().parse().ok()
}

fn env_secs(name: &str) -> Option<Duration> {
    env_u64(name).map(Duration::from_secs)
}

fn env_bool(name: &str) -> Option<bool> {
    let v = std::env::var(name).ok()?;
    Some(v == "1" || v.eq_ignore_ascii_case("true"))
}

fn env_list(name: &str) -> Option<Vec<String>> {
    let v = std::env::var(name).ok()?;
    let items: Vec<String> = v
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect();
    if items.is_empty() {
        None
    } else {
        Some(items)
    }
}

fn env_priorities(name: &str) -> Option<Vec<Priority>> {
    let items = env_list(name)?;
    let mut out = Vec::with_capacity(items.len());
    for item in items {
        match item.as_str() {
            "urgent" => out.push(Priority::Urgent),
            "normal" => out.push(Priority::Normal),
            "batch" => out.push(Priority::Batch),
            "maintenance" => out.push(Priority::Maintenance),
            _ => return None, // one bad entry invalidates the override
        }
    }
    Some(out)
}
