//! Metric instrument factories for reconcile-rs.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`.
//! All instruments are created lazily from the `"reconcile-rs"` meter.

use opentelemetry::metrics::{Counter, Histogram, Meter};

/// Returns the shared meter for reconcile-rs instruments.
fn meter() -> Meter {
    opentelemetry::global::meter("reconcile-rs")
}

/// Counter: items handed to the work queue.
/// Labels: `operation` ("add" | "coalesced" | "dirty" | "dropped" | "rate_limited").
pub fn queue_adds() -> Counter<u64> {
    meter()
        .u64_counter("reconcile.queue.adds")
        .with_description("Items handed to the work queue")
        .build()
}

/// Counter: finished reconcile attempts.
/// Labels: `outcome` ("success" | "retry" | "give_up").
pub fn reconcile_items() -> Counter<u64> {
    meter()
        .u64_counter("reconcile.items")
        .with_description("Finished reconcile attempts")
        .build()
}

/// Counter: failed attempts that were requeued with backoff.
pub fn reconcile_retries() -> Counter<u64> {
    meter()
        .u64_counter("reconcile.retries")
        .with_description("Failed reconcile attempts requeued with backoff")
        .build()
}

/// Counter: keys given up on after exhausting retries.
pub fn reconcile_give_ups() -> Counter<u64> {
    meter()
        .u64_counter("reconcile.give_ups")
        .with_description("Keys dropped after exhausting retries")
        .build()
}

/// Histogram: handler invocation duration in milliseconds.
/// Labels: `kind`.
pub fn reconcile_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("reconcile.duration_ms")
        .with_description("Reconcile handler duration in milliseconds")
        .with_unit("ms")
        .build()
}

/// Counter: faults reported to the fault sink.
/// Labels: `fault`.
pub fn faults() -> Counter<u64> {
    meter()
        .u64_counter("reconcile.faults")
        .with_description("Faults reported to the fault sink")
        .build()
}
