//! Metric instruments for the queue driver.
//!
//! Created from the globally registered `MeterProvider`; without one they
//! are no-ops.

use opentelemetry::metrics::{Counter, Histogram, Meter};

fn meter() -> Meter {
    opentelemetry::global::meter("execq")
}

/// Counter: items that reached a terminal state.
/// Labels: `outcome` ("succeeded" | "failed").
pub fn items_processed() -> Counter<u64> {
    meter()
        .u64_counter("execq.items.processed")
        .with_description("Number of work items that reached a terminal state")
        .build()
}

/// Counter: submission attempts.
/// Labels: `result` ("accepted" | "rejected" | "error").
pub fn items_submitted() -> Counter<u64> {
    meter()
        .u64_counter("execq.items.submitted")
        .with_description("Number of execution submissions")
        .build()
}

/// Counter: failed status polls, before retry.
pub fn status_poll_errors() -> Counter<u64> {
    meter()
        .u64_counter("execq.status.poll_errors")
        .with_description("Number of status polls that failed")
        .build()
}

/// Counter: pause episodes entered by the scheduling gate.
pub fn gate_pauses() -> Counter<u64> {
    meter()
        .u64_counter("execq.gate.pauses")
        .with_description("Number of maintenance-window pauses")
        .build()
}

/// Histogram: time from submission to terminal state.
/// Labels: `outcome`.
pub fn item_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("execq.item.duration_ms")
        .with_description("Item processing duration in milliseconds")
        .with_unit("ms")
        .build()
}
