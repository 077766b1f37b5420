//! Metrics collection module for the replicated state engine
//!
//! This module provides counters and histograms for the apply pipeline, the in-flight
//! cache and durable persistence, exposed through a Prometheus registry.

use lazy_static::lazy_static;
use prometheus::{Counter, CounterVec, Histogram, HistogramOpts, Opts, Registry};
use std::time::Instant;

lazy_static! {
    /// Global Prometheus registry instance
    pub static ref REGISTRY_INSTANCE: Registry = Registry::new();

    /// Entries applied, by command kind
    pub static ref APPLIED_COUNTER_VEC: CounterVec = CounterVec::new(
        Opts::new("applied_entries", "committed entries applied"),
        &["kind"]
    )
    .unwrap();

    /// Batches sealed (ensure_applied calls), by command kind
    pub static ref BATCH_COUNTER_VEC: CounterVec = CounterVec::new(
        Opts::new("sealed_batches", "dispatch batches sealed"),
        &["kind"]
    )
    .unwrap();

    /// In-flight cache lookups, by result
    pub static ref CACHE_COUNTER_VEC: CounterVec = CounterVec::new(
        Opts::new("in_flight_cache_lookups", "in-flight cache lookups"),
        &["result"]
    )
    .unwrap();

    /// Durable record writes that failed
    pub static ref PERSIST_FAILURE_COUNTER: Counter = Counter::new(
        "durable_persist_failures",
        "durable record writes that failed"
    )
    .unwrap();

    /// Operations skipped by the session tracker
    pub static ref DUPLICATE_COUNTER: Counter = Counter::new(
        "duplicate_operations",
        "replicated operations skipped as duplicates"
    )
    .unwrap();

    /// Checkpoint duration
    pub static ref CHECKPOINT_HISTOGRAM: Histogram = Histogram::with_opts(HistogramOpts::new(
        "checkpoint_cost",
        "flush of all state machines plus watermark persist"
    ))
    .unwrap();
}

/// Initializes the metrics registry
///
/// Registers all metric collectors with the global registry
pub fn init_registry() {
    let _ = REGISTRY_INSTANCE.register(Box::new(APPLIED_COUNTER_VEC.clone()));
    let _ = REGISTRY_INSTANCE.register(Box::new(BATCH_COUNTER_VEC.clone()));
    let _ = REGISTRY_INSTANCE.register(Box::new(CACHE_COUNTER_VEC.clone()));
    let _ = REGISTRY_INSTANCE.register(Box::new(PERSIST_FAILURE_COUNTER.clone()));
    let _ = REGISTRY_INSTANCE.register(Box::new(DUPLICATE_COUNTER.clone()));
    let _ = REGISTRY_INSTANCE.register(Box::new(CHECKPOINT_HISTOGRAM.clone()));
}

/// Runs `handler` and records its duration in the checkpoint histogram
pub fn record_checkpoint<F, T>(handler: F) -> T
where
    F: FnOnce() -> T,
{
    let start = Instant::now();
    let result = handler();
    CHECKPOINT_HISTOGRAM.observe(start.elapsed().as_secs_f64());
    result
}
