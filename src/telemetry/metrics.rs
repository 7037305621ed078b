//! Metric instrument factories for porter.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`.
//! All instruments are created lazily from the `"porter"` meter.

use opentelemetry::metrics::{Counter, Histogram, Meter};

fn meter() -> Meter {
    opentelemetry::global::meter("porter")
}

/// Counter: jobs submitted.
/// Labels: `job_type`, `result` ("ok" | "duplicate").
pub fn jobs_submitted() -> Counter<u64> {
    meter()
        .u64_counter("porter.jobs.submitted")
        .with_description("Number of jobs submitted")
        .build()
}

/// Counter: phase transitions.
/// Labels: `from`, `to`.
pub fn phase_transitions() -> Counter<u64> {
    meter()
        .u64_counter("porter.jobs.phase_transitions")
        .with_description("Number of phase transitions")
        .build()
}

/// Counter: queue-level operations (enqueue, claim, ack, release,
/// reclaim, dead_letter).
/// Labels: `operation`.
pub fn queue_operations() -> Counter<u64> {
    meter()
        .u64_counter("porter.queue.operations")
        .with_description("Number of queue operations")
        .build()
}

/// Counter: compensating actions run.
/// Labels: `phase`, `result` ("ok" | "error").
pub fn saga_compensations() -> Counter<u64> {
    meter()
        .u64_counter("porter.saga.compensations")
        .with_description("Number of compensating actions run")
        .build()
}

/// Counter: terminal callback deliveries.
/// Labels: `result` ("ok" | "dead_letter").
pub fn callback_deliveries() -> Counter<u64> {
    meter()
        .u64_counter("porter.callbacks.deliveries")
        .with_description("Number of terminal callback deliveries")
        .build()
}

/// Histogram: submission-to-terminal duration in milliseconds.
/// Labels: `status`.
pub fn job_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("porter.jobs.duration_ms")
        .with_description("Job duration from submission to terminal state")
        .with_unit("ms")
        .build()
}
