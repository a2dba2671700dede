//! Prometheus metrics registry and instruments.
//!
//! Instruments are global so that caches and the executor can record
//! without threading a registry through every call. They only show up
//! in [`REGISTRY`] after [`init_metrics`] has run.

use lazy_static::lazy_static;
use prometheus::{IntCounter, IntCounterVec, IntGaugeVec, Opts, Registry};

lazy_static! {
    /// Global Prometheus registry
    pub static ref REGISTRY: Registry = Registry::new();

    // Database Metrics
    pub static ref DB_QUERIES_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("fedistore_db_queries_total", "Total number of database operations"),
        &["operation", "status"]
    ).expect("metric can be created");
    pub static ref DB_BUSY_RETRIES_TOTAL: IntCounter = IntCounter::new(
        "fedistore_db_busy_retries_total",
        "Total number of retries after a busy/locked database"
    ).expect("metric can be created");
    pub static ref DB_BUSY_TIMEOUTS_TOTAL: IntCounter = IntCounter::new(
        "fedistore_db_busy_timeouts_total",
        "Total number of operations that gave up on a busy database"
    ).expect("metric can be created");

    // Cache Metrics
    pub static ref CACHE_HITS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("fedistore_cache_hits_total", "Total number of cache hits"),
        &["cache_name"]
    ).expect("metric can be created");
    pub static ref CACHE_MISSES_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("fedistore_cache_misses_total", "Total number of cache misses"),
        &["cache_name"]
    ).expect("metric can be created");
    pub static ref CACHE_SIZE: IntGaugeVec = IntGaugeVec::new(
        Opts::new("fedistore_cache_size", "Current number of items in cache"),
        &["cache_name"]
    ).expect("metric can be created");

    // Aggregate Metrics
    pub static ref MARKER_CONFLICTS_TOTAL: IntCounter = IntCounter::new(
        "fedistore_marker_conflicts_total",
        "Total number of marker updates that lost a version race"
    ).expect("metric can be created");
    pub static ref POPULATE_FAILURES_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("fedistore_populate_failures_total", "Total number of entities dropped from batches after failing to populate"),
        &["entity"]
    ).expect("metric can be created");
}

/// Record the outcome of one executor operation
pub fn observe_db_operation(operation: &str, status: &str) {
    DB_QUERIES_TOTAL
        .with_label_values(&[operation, status])
        .inc();
}

/// Record a cache lookup
pub fn observe_cache_lookup(cache_name: &str, hit: bool) {
    if hit {
        CACHE_HITS_TOTAL.with_label_values(&[cache_name]).inc();
    } else {
        CACHE_MISSES_TOTAL.with_label_values(&[cache_name]).inc();
    }
}

/// Initialize metrics registry.
pub fn init_metrics() {
    REGISTRY
        .register(Box::new(DB_QUERIES_TOTAL.clone()))
        .expect("DB_QUERIES_TOTAL can be registered");
    REGISTRY
        .register(Box::new(DB_BUSY_RETRIES_TOTAL.clone()))
        .expect("DB_BUSY_RETRIES_TOTAL can be registered");
    REGISTRY
        .register(Box::new(DB_BUSY_TIMEOUTS_TOTAL.clone()))
        .expect("DB_BUSY_TIMEOUTS_TOTAL can be registered");
    REGISTRY
        .register(Box::new(CACHE_HITS_TOTAL.clone()))
        .expect("CACHE_HITS_TOTAL can be registered");
    REGISTRY
        .register(Box::new(CACHE_MISSES_TOTAL.clone()))
        .expect("CACHE_MISSES_TOTAL can be registered");
    REGISTRY
        .register(Box::new(CACHE_SIZE.clone()))
        .expect("CACHE_SIZE can be registered");
    REGISTRY
        .register(Box::new(MARKER_CONFLICTS_TOTAL.clone()))
        .expect("MARKER_CONFLICTS_TOTAL can be registered");
    REGISTRY
        .register(Box::new(POPULATE_FAILURES_TOTAL.clone()))
        .expect("POPULATE_FAILURES_TOTAL can be registered");

    tracing::info!("Metrics registry initialized");
}
