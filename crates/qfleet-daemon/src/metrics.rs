//! Prometheus metrics for the QFleet daemon
//!
//! Exposes store, learning and retention metrics in Prometheus format.

use prometheus::{
    GaugeVec, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
};
use std::sync::LazyLock;

/// Global Prometheus registry for QFleet metrics
pub static REGISTRY: LazyLock<Registry> = LazyLock::new(|| {
    let registry = Registry::new();

    registry.register(Box::new(STORE_QUERIES_TOTAL.clone())).unwrap();
    registry.register(Box::new(STORE_QUERY_DURATION.clone())).unwrap();
    registry.register(Box::new(STORE_AVAILABLE.clone())).unwrap();
    registry.register(Box::new(UPDATES_TOTAL.clone())).unwrap();
    registry.register(Box::new(REWARD_DISTRIBUTION.clone())).unwrap();
    registry.register(Box::new(EPSILON.clone())).unwrap();
    registry.register(Box::new(FLUSHES_TOTAL.clone())).unwrap();
    registry.register(Box::new(FLUSHED_ENTRIES_TOTAL.clone())).unwrap();
    registry.register(Box::new(UPDATE_CONFLICTS_TOTAL.clone())).unwrap();
    registry.register(Box::new(TRAJECTORIES_CLEANED_TOTAL.clone())).unwrap();

    registry
});

// =============================================================================
// Store Metrics
// =============================================================================

/// Store queries by type and outcome
pub static STORE_QUERIES_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new("qfleet_store_queries_total", "Total number of store queries"),
        &["query_type", "status"],
    )
    .unwrap()
});

pub static STORE_QUERY_DURATION: LazyLock<HistogramVec> = LazyLock::new(|| {
    HistogramVec::new(
        HistogramOpts::new("qfleet_store_query_duration_seconds", "Store query duration in seconds")
            .buckets(vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0]),
        &["query_type"],
    )
    .unwrap()
});

/// 1 while the store answers, 0 while learners run from memory only
pub static STORE_AVAILABLE: LazyLock<IntGauge> = LazyLock::new(|| {
    IntGauge::new("qfleet_store_available", "Store availability (1=available, 0=degraded)").unwrap()
});

// =============================================================================
// Learning Metrics
// =============================================================================

pub static UPDATES_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new("qfleet_updates_total", "Total number of Q-value updates"),
        &["agent_kind"],
    )
    .unwrap()
});

pub static REWARD_DISTRIBUTION: LazyLock<HistogramVec> = LazyLock::new(|| {
    HistogramVec::new(
        HistogramOpts::new("qfleet_reward", "Rewards assigned to completed transitions").buckets(vec![
            -100.0, -50.0, -25.0, -10.0, 0.0, 10.0, 25.0, 50.0, 100.0,
        ]),
        &["agent_kind"],
    )
    .unwrap()
});

/// Current exploration rate per agent kind
pub static EPSILON: LazyLock<GaugeVec> = LazyLock::new(|| {
    GaugeVec::new(
        Opts::new("qfleet_epsilon", "Current exploration rate"),
        &["agent_kind"],
    )
    .unwrap()
});

pub static FLUSHES_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new("qfleet_flushes_total", "Total number of batched writes to the store"),
        &["agent_kind", "status"],
    )
    .unwrap()
});

pub static FLUSHED_ENTRIES_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new("qfleet_flushed_entries_total", "Total number of entries written by flushes"),
        &["agent_kind"],
    )
    .unwrap()
});

/// Entries left dirty after exhausting conflict retries
pub static UPDATE_CONFLICTS_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new("qfleet_update_conflicts_total", "Total number of unresolved version conflicts"),
        &["agent_kind"],
    )
    .unwrap()
});

// =============================================================================
// Retention Metrics
// =============================================================================

pub static TRAJECTORIES_CLEANED_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new("qfleet_trajectories_cleaned_total", "Total number of expired trajectories deleted").unwrap()
});

// =============================================================================
// Helper Functions
// =============================================================================

/// Encode all metrics in Prometheus text format
pub fn encode_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    encoder.encode_to_string(&metric_families).unwrap_or_default()
}

/// Record one store query
pub fn record_store_query(query_type: &str, success: bool, duration_secs: f64) {
    let status = if success { "success" } else { "error" };
    STORE_QUERIES_TOTAL
        .with_label_values(&[query_type, status])
        .inc();
    STORE_QUERY_DURATION
        .with_label_values(&[query_type])
        .observe(duration_secs);
}

pub fn set_store_available(available: bool) {
    STORE_AVAILABLE.set(i64::from(available));
}

/// Record a completed update and the resulting exploration rate
pub fn record_update(agent_kind: &str, reward: Option<f64>, epsilon: f64) {
    UPDATES_TOTAL.with_label_values(&[agent_kind]).inc();
    if let Some(reward) = reward {
        REWARD_DISTRIBUTION
            .with_label_values(&[agent_kind])
            .observe(reward);
    }
    EPSILON.with_label_values(&[agent_kind]).set(epsilon);
}

pub fn record_flush(agent_kind: &str, success: bool, written: usize, conflicts: usize) {
    let status = if success { "success" } else { "error" };
    FLUSHES_TOTAL.with_label_values(&[agent_kind, status]).inc();
    FLUSHED_ENTRIES_TOTAL
        .with_label_values(&[agent_kind])
        .inc_by(written as u64);
    UPDATE_CONFLICTS_TOTAL
        .with_label_values(&[agent_kind])
        .inc_by(conflicts as u64);
}

pub fn record_trajectories_cleaned(count: u64) {
    TRAJECTORIES_CLEANED_TOTAL.inc_by(count);
}
