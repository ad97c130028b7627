//! Metric instrument factories for workq.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`.
//! All instruments are created lazily from the `"workq"` meter.

use opentelemetry::metrics::{Counter, Histogram, Meter};

/// Returns the shared meter for workq instruments.
fn meter() -> Meter {
    opentelemetry::global::meter("workq")
}

/// Counter: queue operations.
/// Labels: `queue`, `operation`, `result`.
pub fn queue_operations() -> Counter<u64> {
    meter()
        .u64_counter("workq.queue.operations")
        .with_description("Number of queue operations")
        .build()
}

/// Counter: claims lost to a concurrent consumer.
/// Labels: `queue`, `operation`.
pub fn claim_conflicts() -> Counter<u64> {
    meter()
        .u64_counter("workq.queue.claim_conflicts")
        .with_description("Conditional claims that affected no row")
        .build()
}

/// Counter: reservations that lapsed and were made visible again.
/// Labels: `queue`.
pub fn reservations_expired() -> Counter<u64> {
    meter()
        .u64_counter("workq.queue.reservations_expired")
        .with_description("Reservations returned to ready after their visibility timeout")
        .build()
}

/// Histogram: time spent inside reserve/take, in milliseconds.
/// Labels: `queue`, `operation`, `result` ("claimed" | "timeout").
pub fn wait_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("workq.queue.wait_ms")
        .with_description("Time spent waiting for a message")
        .with_unit("ms")
        .build()
}
