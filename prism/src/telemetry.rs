//! Tracing and telemetry instrumentation for prism.
//!
//! This module provides helper functions for creating tracing spans and recording
//! metrics while items move through the pipeline. All functions work both with and
//! without the `metrics` feature flag.
//!
//! # Features
//!
//! - Tracing spans for item processing, stage calls and queue receives
//! - Integration with the `metrics` module for Prometheus metrics
//! - Helper functions that only log when the `metrics` feature is disabled
//!
//! # Example
//!
//! ```ignore
//! use prism::telemetry::{instrument_process, record_item_start, record_item_end};
//!
//! let timing = record_item_start("shelf-042.jpeg");
//! let outcome = instrument_process("shelf-042.jpeg", 0, orchestrator.process(item)).await?;
//! record_item_end(timing, outcome.as_str());
//! ```

use std::future::Future;
use tracing::{info_span, Instrument, Span};

/// Create a tracing span covering one delivery of an item.
///
/// # Arguments
/// * `item` - The item's stable name (or raw reference if it has none)
/// * `total_retry_count` - Retry count carried by the envelope on arrival
#[must_use]
pub fn item_process_span(item: impl AsRef<str>, total_retry_count: u32) -> Span {
    info_span!(
        "prism.process",
        item = %item.as_ref(),
        total_retry_count = total_retry_count,
    )
}

/// Create a tracing span for a single external stage call.
#[must_use]
pub fn stage_call_span(stage: impl AsRef<str>, attempt: u32) -> Span {
    info_span!(
        "prism.stage",
        stage = %stage.as_ref(),
        attempt = attempt,
    )
}

/// Create a tracing span for a queue receive performed by a worker.
#[must_use]
pub fn queue_receive_span(worker_id: impl AsRef<str>) -> Span {
    info_span!("prism.receive", worker_id = %worker_id.as_ref())
}

/// Instrument a future with an item processing span.
///
/// # Arguments
/// * `item` - The item's stable name
/// * `total_retry_count` - Retry count carried by the envelope on arrival
/// * `future` - The future to instrument
pub fn instrument_process<F>(
    item: impl AsRef<str>,
    total_retry_count: u32,
    future: F,
) -> impl Future<Output = F::Output>
where
    F: Future,
{
    let span = item_process_span(item, total_retry_count);
    future.instrument(span)
}

/// Record the terminal outcome of one delivery (`completed`, `requeued`,
/// `dead_lettered`).
pub fn record_outcome(item: impl AsRef<str>, outcome: impl AsRef<str>) {
    tracing::info!(
        item = %item.as_ref(),
        outcome = %outcome.as_ref(),
        "item processed"
    );

    #[cfg(feature = "metrics")]
    crate::metrics::record_item_processed(outcome.as_ref());
}

/// Record one failed stage call.
///
/// Logged at debug level; the retry loop already emits the warning with the
/// error attached.
pub fn record_stage_failure(stage: impl AsRef<str>, attempt: u32) {
    tracing::debug!(
        stage = %stage.as_ref(),
        attempt = attempt,
        "stage call failed"
    );

    #[cfg(feature = "metrics")]
    crate::metrics::record_stage_failure(stage.as_ref());
}

/// Record a checkpoint write.
///
/// # Arguments
/// * `checkpoint_id` - The checkpoint identifier
/// * `result` - `created`, `already_exists` or `failed`
pub fn record_checkpoint(checkpoint_id: impl AsRef<str>, result: impl AsRef<str>) {
    tracing::info!(
        checkpoint_id = %checkpoint_id.as_ref(),
        result = %result.as_ref(),
        "checkpoint write"
    );

    #[cfg(feature = "metrics")]
    crate::metrics::record_checkpoint(result.as_ref());
}

/// Observe how long one delivery took from receive to settlement.
pub fn observe_item_duration(item: impl AsRef<str>, outcome: impl AsRef<str>, duration_secs: f64) {
    tracing::debug!(
        item = %item.as_ref(),
        outcome = %outcome.as_ref(),
        duration_secs = duration_secs,
        "item duration observed"
    );

    #[cfg(feature = "metrics")]
    crate::metrics::observe_item_duration(outcome.as_ref(), duration_secs);
}

/// Record the start of processing for duration tracking.
///
/// Returns an opaque handle that should be passed to `record_item_end`.
pub fn record_item_start(item: impl AsRef<str>) -> ItemTimingHandle {
    ItemTimingHandle {
        item: item.as_ref().to_string(),
        start: std::time::Instant::now(),
    }
}

/// Record the end of processing and update duration metrics.
pub fn record_item_end(handle: ItemTimingHandle, outcome: impl AsRef<str>) {
    let duration_secs = handle.start.elapsed().as_secs_f64();
    observe_item_duration(&handle.item, outcome, duration_secs);
}

/// Handle for tracking how long one item took.
#[derive(Debug)]
pub struct ItemTimingHandle {
    item: String,
    start: std::time::Instant,
}

impl ItemTimingHandle {
    #[must_use]
    pub fn item(&self) -> &str {
        &self.item
    }

    #[must_use]
    pub fn elapsed(&self) -> std::time::Duration {
        self.start.elapsed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_item_process_span() {
        let _guard = tracing::subscriber::set_default(tracing_subscriber::registry());
        let span = item_process_span("shelf-042.jpeg", 2);
        assert_eq!(span.metadata().unwrap().name(), "prism.process");
    }

    #[test]
    fn test_stage_call_span() {
        let _guard = tracing::subscriber::set_default(tracing_subscriber::registry());
        let span = stage_call_span("vision", 1);
        assert_eq!(span.metadata().unwrap().name(), "prism.stage");
    }

    #[test]
    fn test_queue_receive_span() {
        let _guard = tracing::subscriber::set_default(tracing_subscriber::registry());
        let span = queue_receive_span("worker-1");
        assert_eq!(span.metadata().unwrap().name(), "prism.receive");
    }

    #[test]
    fn test_recorders_do_not_panic() {
        record_outcome("a.png", "completed");
        record_stage_failure("layout", 3);
        record_checkpoint("doc_int_results_a.png", "created");
    }

    #[test]
    fn test_timing_handle() {
        let handle = record_item_start("a.png");
        assert_eq!(handle.item(), "a.png");

        std::thread::sleep(std::time::Duration::from_millis(1));
        assert!(handle.elapsed().as_nanos() > 0);

        record_item_end(handle, "requeued");
    }
}
