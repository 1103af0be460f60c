//! Prometheus metrics for pipeline engines.
//!
//! This module provides metrics for:
//! - Batches (outcome, duration, extracted items)
//! - Delivery (loaded items, load failures)
//! - Checkpoint commits and running engines

use once_cell::sync::Lazy;
use prometheus::{Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts};

// =============================================================================
// Batch Metrics
// =============================================================================

/// Batches total by result.
pub static BATCHES_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("changefeed_batches_total", "Total batches run by pipeline engines"),
        &["result"], // "loaded", "filtered", "load_failed", "script_faulted", "commit_failed"
    )
    .unwrap()
});

/// Items extracted by type.
pub static ITEMS_EXTRACTED: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new(
            "changefeed_items_extracted_total",
            "Total items extracted from storage",
        ),
        &["type"], // "documents", "counter groups"
    )
    .unwrap()
});

/// Extract, transform and load duration in seconds.
pub static BATCH_DURATION: Lazy<Histogram> = Lazy::new(|| {
    Histogram::with_opts(
        HistogramOpts::new(
            "changefeed_batch_duration_seconds",
            "Duration of one extract, transform and load batch",
        )
        .buckets(vec![0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 30.0, 60.0, 300.0]),
    )
    .unwrap()
});

// =============================================================================
// Delivery Metrics
// =============================================================================

/// Items accepted by destinations.
pub static ITEMS_LOADED: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new(
        "changefeed_items_loaded_total",
        "Total items delivered to destinations",
    )
    .unwrap()
});

/// Batches a destination failed to accept.
pub static LOAD_FAILURES: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new(
        "changefeed_load_failures_total",
        "Total batches that failed to load",
    )
    .unwrap()
});

// =============================================================================
// Checkpoint & Engine Metrics
// =============================================================================

/// Checkpoint commits by result.
pub static CHECKPOINT_COMMITS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new(
            "changefeed_checkpoint_commits_total",
            "Total checkpoint commits sent to the cluster",
        ),
        &["result"], // "success", "failed"
    )
    .unwrap()
});

/// Engines whose background thread is running.
pub static ENGINES_RUNNING: Lazy<IntGauge> = Lazy::new(|| {
    IntGauge::new("changefeed_engines_running", "Pipeline engines currently running").unwrap()
});

/// Register all metrics with a registry.
pub fn all_metrics() -> Vec<Box<dyn prometheus::core::Collector>> {
    vec![
        // Batches
        Box::new(BATCHES_TOTAL.clone()),
        Box::new(ITEMS_EXTRACTED.clone()),
        Box::new(BATCH_DURATION.clone()),
        // Delivery
        Box::new(ITEMS_LOADED.clone()),
        Box::new(LOAD_FAILURES.clone()),
        // Checkpoints & engines
        Box::new(CHECKPOINT_COMMITS.clone()),
        Box::new(ENGINES_RUNNING.clone()),
    ]
}
