//! Metric instrument factories for caseflow.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`.
//! All instruments are created lazily from the `"caseflow"` meter.

use opentelemetry::metrics::{Counter, Histogram, Meter};

/// Returns the shared meter for caseflow instruments.
fn meter() -> Meter {
    opentelemetry::global::meter("caseflow")
}

/// Counter: work items submitted.
/// Labels: `queue`, `result` ("ok" | "duplicate").
pub fn items_submitted() -> Counter<u64> {
    meter()
        .u64_counter("caseflow.work.submitted")
        .with_description("Number of work items submitted")
        .build()
}

/// Counter: work items handed out by claims.
/// Labels: `queue`.
pub fn items_claimed() -> Counter<u64> {
    meter()
        .u64_counter("caseflow.work.claimed")
        .with_description("Number of work items claimed")
        .build()
}

/// Counter: recorded item outcomes.
/// Labels: `queue`, `status`.
pub fn item_results() -> Counter<u64> {
    meter()
        .u64_counter("caseflow.work.results")
        .with_description("Number of recorded work item results")
        .build()
}

/// Counter: stale claims swept.
/// Labels: `queue`, `result` ("requeued" | "exhausted").
pub fn items_reclaimed() -> Counter<u64> {
    meter()
        .u64_counter("caseflow.work.reclaimed")
        .with_description("Number of stale claims reclaimed")
        .build()
}

/// Counter: results discarded because the claim was no longer held.
/// Labels: `queue`.
pub fn claims_lost() -> Counter<u64> {
    meter()
        .u64_counter("caseflow.work.claims_lost")
        .with_description("Results discarded after losing the claim")
        .build()
}

/// Histogram: step duration in milliseconds.
/// Labels: `step`, `result`.
pub fn step_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("caseflow.step.duration_ms")
        .with_description("Processing step duration in milliseconds")
        .with_unit("ms")
        .build()
}
