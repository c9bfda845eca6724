//! Integration tests for telemetry initialization and span helpers.

use hatym_rs::model::{PageNumber, SessionId};

#[test]
fn telemetry_initializes_without_endpoint() {
    // A global subscriber can only be set once per process, so this may
    // return Err if another test got there first. That is acceptable.
    let config = hatym_rs::telemetry::TelemetryConfig {
        endpoint: None,
        service_name: "hatym-test".to_string(),
        log_level: "debug".to_string(),
    };
    let _guard = hatym_rs::telemetry::init_telemetry(config);
}

#[test]
fn lease_span_creates_and_records_transition() {
    let span = hatym_rs::telemetry::lease::start_lease_span(
        "complete",
        SessionId::new(),
        Some(PageNumber::FIRST),
    );
    hatym_rs::telemetry::lease::record_status_transition(&span, "assigned", "completed");
}

#[test]
fn sweep_span_has_no_page() {
    let span = hatym_rs::telemetry::lease::start_lease_span("sweep", SessionId::new(), None);
    let _entered = span.enter();
}

#[test]
fn metric_instruments_accept_recordings_without_a_provider() {
    use hatym_rs::telemetry::metrics;
    use opentelemetry::KeyValue;

    metrics::claims().add(1, &[KeyValue::new("result", "assigned")]);
    metrics::completions().add(1, &[KeyValue::new("result", "completed")]);
    metrics::pages_released().add(3, &[]);
    metrics::sessions_created().add(1, &[]);
    metrics::projection_events().add(604, &[KeyValue::new("source", "resync")]);
    metrics::operation_duration_ms().record(1.5, &[KeyValue::new("operation", "claim")]);
}
