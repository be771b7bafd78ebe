//! Metric instrument factories for leaseq.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`.
//! All instruments are created lazily from the `"leaseq"` meter.

use opentelemetry::metrics::{Counter, Meter};

/// Returns the shared meter for leaseq instruments.
fn meter() -> Meter {
    opentelemetry::global::meter("leaseq")
}

/// Counter: queue-level operations.
/// Labels: `queue`, `operation` ("open" | "get" | "get_empty" | "ping" |
/// "ping_stale" | "ack" | "ack_stale").
pub fn queue_operations() -> Counter<u64> {
    meter()
        .u64_counter("leaseq.queue.operations")
        .with_description("Number of queue operations")
        .build()
}

/// Counter: number of tasks inserted.
/// Labels: `queue`.
pub fn tasks_added() -> Counter<u64> {
    meter()
        .u64_counter("leaseq.tasks.added")
        .with_description("Number of tasks inserted")
        .build()
}
