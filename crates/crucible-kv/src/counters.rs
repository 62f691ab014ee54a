//! Aggregate counters surfaced by `GET /status`.
//!
//! The core emits; it does not store. These are plain process-local atomics,
//! scraped by whatever metrics backend fronts the deployment.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

#[derive(Default)]
pub struct Counter(AtomicU64);

impl Counter {
    pub fn incr(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

#[derive(Default)]
pub struct Counters {
    pub submitted: Counter,
    pub completed: Counter,
    pub failed: Counter,
    pub double_release_detected: Counter,
    pub out_of_order_events: Counter,
    pub dead_lettered: Counter,
    pub workloads_cleaned: Counter,
}

/// Serializable point-in-time copy for the status endpoint.
#[derive(Clone, Debug, Serialize)]
pub struct CountersSnapshot {
    pub submitted: u64,
    pub completed: u64,
    pub failed: u64,
    pub double_release_detected: u64,
    pub out_of_order_events: u64,
    pub dead_lettered: u64,
    pub workloads_cleaned: u64,
}

impl Counters {
    pub fn snapshot(&self) -> CountersSnapshot {
        CountersSnapshot {
            submitted: self.submitted.get(),
            completed: self.completed.get(),
            failed: self.failed.get(),
            double_release_detected: self.double_release_detected.get(),
            out_of_order_events: self.out_of_order_events.get(),
            dead_lettered: self.dead_lettered.get(),
            workloads_cleaned: self.workloads_cleaned.get(),
        }
    }
}
