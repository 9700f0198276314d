//! Metrics module for modplay
//!
//! Provides the cache counters, system metrics and the snapshot served by the
//! status endpoint, with JSON serialization support.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::RwLock;

/// Monotonic counters of cache and conversion activity
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct CacheCounters {
    pub hits: u64,
    pub misses: u64,
    pub conversions_started: u64,
    pub conversions_succeeded: u64,
    pub conversions_failed: u64,
    pub conversions_timed_out: u64,
    pub transcodes: u64,
    pub transcode_failures: u64,
    pub evictions: u64,
    pub orphans_removed: u64,
    pub sweeps: u64,
    pub bytes_converted: u64,
}

/// System-level metrics for resource monitoring
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SystemMetrics {
    pub cpu_usage_percent: f32,
    pub mem_usage_percent: f32,
    pub load_avg_1: f32,
    pub load_avg_5: f32,
    pub load_avg_15: f32,
}

/// Complete metrics snapshot: counters, live gauges and system load
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MetricsSnapshot {
    pub timestamp_unix_ms: i64,
    pub counters: CacheCounters,
    /// Conversion jobs waiting for a slot
    pub pending_jobs: usize,
    /// Conversion jobs holding a slot
    pub running_jobs: usize,
    /// Open readers across all cache entries
    pub active_readers: usize,
    pub system: SystemMetrics,
}

/// Shared metrics state for concurrent access across engine components
pub type SharedMetrics = Arc<RwLock<MetricsSnapshot>>;

impl Default for SystemMetrics {
    fn default() -> Self {
        Self {
            cpu_usage_percent: 0.0,
            mem_usage_percent: 0.0,
            load_avg_1: 0.0,
            load_avg_5: 0.0,
            load_avg_15: 0.0,
        }
    }
}

impl Default for MetricsSnapshot {
    fn default() -> Self {
        Self {
            timestamp_unix_ms: 0,
            counters: CacheCounters::default(),
            pending_jobs: 0,
            running_jobs: 0,
            active_readers: 0,
            system: SystemMetrics::default(),
        }
    }
}

/// Creates a new SharedMetrics instance with default values
pub fn new_shared_metrics() -> SharedMetrics {
    Arc::new(RwLock::new(MetricsSnapshot::default()))
}

/// Apply an update to the counters
pub async fn record(metrics: &SharedMetrics, update: impl FnOnce(&mut CacheCounters)) {
    let mut snapshot = metrics.write().await;
    update(&mut snapshot.counters);
}

/// Collects current system metrics using sysinfo
pub fn collect_system_metrics() -> SystemMetrics {
    use sysinfo::System;

    let mut sys = System::new();
    sys.refresh_cpu_usage();
    sys.refresh_memory();

    let cpu_usage = sys.global_cpu_usage();
    let total_memory = sys.total_memory();
    let used_memory = sys.used_memory();
    let mem_usage = if total_memory > 0 {
        (used_memory as f64 / total_memory as f64 * 100.0) as f32
    } else {
        0.0
    };

    let load_avg = System::load_average();

    SystemMetrics {
        cpu_usage_percent: cpu_usage,
        mem_usage_percent: mem_usage,
        load_avg_1: load_avg.one as f32,
        load_avg_5: load_avg.five as f32,
        load_avg_15: load_avg.fifteen as f32,
    }
}
