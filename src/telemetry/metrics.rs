//! Metric instrument factories for hatym-rs.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`.
//! All instruments are created lazily from the `"hatym-rs"` meter.

use opentelemetry::metrics::{Counter, Histogram, Meter};

/// Returns the shared meter for hatym-rs instruments.
fn meter() -> Meter {
    opentelemetry::global::meter("hatym-rs")
}

/// Counter: claim outcomes.
/// Labels: `result` ("assigned" | "resumed" | "limit_reached" | "finished").
pub fn claims() -> Counter<u64> {
    meter()
        .u64_counter("hatym.claims")
        .with_description("Claim outcomes per row")
        .build()
}

/// Counter: completion attempts.
/// Labels: `result` ("completed" | "rejected").
pub fn completions() -> Counter<u64> {
    meter()
        .u64_counter("hatym.completions")
        .with_description("Page completion attempts")
        .build()
}

/// Counter: pages returned to the pool after their lease lapsed.
pub fn pages_released() -> Counter<u64> {
    meter()
        .u64_counter("hatym.pages.released")
        .with_description("Expired leases reclaimed")
        .build()
}

/// Counter: sessions created.
pub fn sessions_created() -> Counter<u64> {
    meter()
        .u64_counter("hatym.sessions.created")
        .with_description("Number of hatym sessions created")
        .build()
}

/// Counter: page updates applied to a dashboard projection.
/// Labels: `source` ("push" | "resync").
pub fn projection_events() -> Counter<u64> {
    meter()
        .u64_counter("hatym.projection.events")
        .with_description("Page updates applied to the dashboard mirror")
        .build()
}

/// Histogram: store operation duration in milliseconds.
/// Labels: `operation`.
pub fn operation_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("hatym.operation.duration_ms")
        .with_description("Store operation duration in milliseconds")
        .with_unit("ms")
        .build()
}
