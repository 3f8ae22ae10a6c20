//! Metric instrument factories for workqueue.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`.
//! All instruments are created lazily from the `"workqueue"` meter.

use opentelemetry::metrics::{Counter, Histogram, Meter};

/// Returns the shared meter for workqueue instruments.
fn meter() -> Meter {
    opentelemetry::global::meter("workqueue")
}

/// Counter: work items enqueued (by callers or by retry).
/// Labels: `work_type`, `source` ("caller" | "retry" | "operator").
pub fn work_added() -> Counter<u64> {
    meter()
        .u64_counter("workqueue.work.added")
        .with_description("Number of work items enqueued")
        .build()
}

/// Counter: successful allocations.
/// Labels: `work_type`.
pub fn work_allocated() -> Counter<u64> {
    meter()
        .u64_counter("workqueue.work.allocated")
        .with_description("Number of work items allocated to a worker")
        .build()
}

/// Counter: finished work items.
/// Labels: `work_type`, `success`.
pub fn work_finished() -> Counter<u64> {
    meter()
        .u64_counter("workqueue.work.finished")
        .with_description("Number of work items finished")
        .build()
}

/// Counter: retry successors spawned.
/// Labels: `work_type`.
pub fn work_retried() -> Counter<u64> {
    meter()
        .u64_counter("workqueue.work.retried")
        .with_description("Number of retry successors spawned")
        .build()
}

/// Counter: soft-deleted work items.
/// Labels: `work_type`.
pub fn work_removed() -> Counter<u64> {
    meter()
        .u64_counter("workqueue.work.removed")
        .with_description("Number of work items removed")
        .build()
}

/// Counter: leases observed past their timeout by the reaper.
/// Labels: `work_type`.
pub fn work_expired() -> Counter<u64> {
    meter()
        .u64_counter("workqueue.work.expired")
        .with_description("Number of abandoned leases detected")
        .build()
}

/// Histogram: execution duration (lease start to stop) in milliseconds.
/// Labels: `work_type`, `mode` ("queued" | "inline").
pub fn work_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("workqueue.work.duration_ms")
        .with_description("Work execution duration in milliseconds")
        .with_unit("ms")
        .build()
}
