//! In-process engine metrics.
//!
//! Counters are observability only; nothing here is a source of truth.
//! Cost accounting always goes through the ledger.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Thread-safe atomic counter.
#[derive(Debug, Default)]
pub struct Counter {
    value: AtomicU64,
}

impl Counter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(&self, n: u64) {
        self.value.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Counters for one engine instance.
#[derive(Debug, Default)]
pub struct EngineMetrics {
    pub cache_hits: Counter,
    pub cache_misses: Counter,
    pub billable_calls: Counter,
    pub provider_failures: Counter,
    pub throttle_waits: Counter,
    pub budget_rejections: Counter,
    pub items_done: Counter,
    pub items_failed: Counter,
}

impl EngineMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            cache_hits: self.cache_hits.get(),
            cache_misses: self.cache_misses.get(),
            billable_calls: self.billable_calls.get(),
            provider_failures: self.provider_failures.get(),
            throttle_waits: self.throttle_waits.get(),
            budget_rejections: self.budget_rejections.get(),
            items_done: self.items_done.get(),
            items_failed: self.items_failed.get(),
        }
    }
}

/// Point-in-time copy of the counters.
#[derive(Clone, Copy, Debug, Serialize)]
pub struct MetricsSnapshot {
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub billable_calls: u64,
    pub provider_failures: u64,
    pub throttle_waits: u64,
    pub budget_rejections: u64,
    pub items_done: u64,
    pub items_failed: u64,
}

impl MetricsSnapshot {
    /// Share of resolutions served without a billable call.
    pub fn hit_rate(&self) -> f64 {
        let total = self.cache_hits + self.cache_misses;
        if total == 0 {
            return 0.0;
        }
        self.cache_hits as f64 / total as f64
    }
}
