//! Prometheus metrics instrumentation for prism.
//!
//! All metrics are conditionally compiled behind the `metrics` feature flag.
//!
//! # Metrics
//!
//! ## Counters
//! - `prism_items_processed_total` - Deliveries settled, by outcome
//! - `prism_stage_failures_total` - Failed external calls, by stage
//! - `prism_checkpoints_total` - Checkpoint writes, by result
//!
//! ## Histograms
//! - `prism_item_duration_seconds` - Time from receive to settlement, by outcome
#![cfg(feature = "metrics")]

use prometheus::{exponential_buckets, CounterVec, HistogramVec, Opts, Registry};
use std::sync::LazyLock;

/// Global Prometheus registry for prism metrics.
pub static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

/// Labels:
/// - `outcome`: completed, requeued, dead_lettered
pub static ITEMS_PROCESSED_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new(
        "prism_items_processed_total",
        "Total number of deliveries settled by the orchestrator",
    );
    CounterVec::new(opts, &["outcome"])
        .expect("prism_items_processed_total metric creation failed")
});

/// Labels:
/// - `stage`: layout, vision, commit
pub static STAGE_FAILURES_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new(
        "prism_stage_failures_total",
        "Total number of failed stage calls, including timeouts",
    );
    CounterVec::new(opts, &["stage"]).expect("prism_stage_failures_total metric creation failed")
});

/// Labels:
/// - `result`: created, already_exists, failed
pub static CHECKPOINTS_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new("prism_checkpoints_total", "Total number of checkpoint writes");
    CounterVec::new(opts, &["result"]).expect("prism_checkpoints_total metric creation failed")
});

/// Histogram for item processing duration in seconds.
pub static ITEM_DURATION_SECONDS: LazyLock<HistogramVec> = LazyLock::new(|| {
    let buckets = exponential_buckets(0.01, 2.0, 16).expect("bucket creation failed");
    let opts = prometheus::HistogramOpts::new(
        "prism_item_duration_seconds",
        "Item processing duration in seconds",
    )
    .buckets(buckets);
    HistogramVec::new(opts, &["outcome"])
        .expect("prism_item_duration_seconds metric creation failed")
});

/// Register all metrics with the global registry.
///
/// Calling it more than once is harmless.
pub fn init_metrics() -> anyhow::Result<()> {
    let registry = &*REGISTRY;

    for metric in [
        Box::new(ITEMS_PROCESSED_TOTAL.clone()) as Box<dyn prometheus::core::Collector>,
        Box::new(STAGE_FAILURES_TOTAL.clone()),
        Box::new(CHECKPOINTS_TOTAL.clone()),
        Box::new(ITEM_DURATION_SECONDS.clone()),
    ] {
        if let Err(e) = registry.register(metric) {
            let msg = e.to_string();
            if !msg.contains("Duplicate metrics collector registration attempted") {
                return Err(e.into());
            }
        }
    }

    Ok(())
}

pub fn record_item_processed(outcome: &str) {
    ITEMS_PROCESSED_TOTAL.with_label_values(&[outcome]).inc();
}

pub fn record_stage_failure(stage: &str) {
    STAGE_FAILURES_TOTAL.with_label_values(&[stage]).inc();
}

pub fn record_checkpoint(result: &str) {
    CHECKPOINTS_TOTAL.with_label_values(&[result]).inc();
}

pub fn observe_item_duration(outcome: &str, duration_secs: f64) {
    ITEM_DURATION_SECONDS
        .with_label_values(&[outcome])
        .observe(duration_secs);
}

/// Gather all registered metrics in Prometheus text format.
pub fn gather_metrics() -> anyhow::Result<String> {
    let encoder = prometheus::TextEncoder::new();
    let metric_families = REGISTRY.gather();
    encoder
        .encode_to_string(&metric_families)
        .map_err(Into::into)
}
