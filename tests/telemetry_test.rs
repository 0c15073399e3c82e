//! Integration tests for telemetry initialization and span helpers.

use execq::model::ItemState;
use execq::telemetry::{TelemetryConfig, http, init_telemetry, metrics, work};
use opentelemetry::KeyValue;
use uuid::Uuid;

#[test]
fn telemetry_initializes_without_endpoint() {
    // A global subscriber can only be set once per process, so a second
    // init from another test returning Err is acceptable.
    let config = TelemetryConfig {
        endpoint: None,
        service_name: "execq-test".to_string(),
        default_level: "debug".to_string(),
    };
    let guard = init_telemetry(config);
    if let Ok(guard) = guard {
        guard.force_flush();
    }
}

#[test]
fn item_span_records_status_and_transitions() {
    let span = work::start_item_span(&Uuid::new_v4(), 42);
    work::record_state_transition(&span, ItemState::Pending, ItemState::Submitted);
    work::record_remote_status(&span, "Finished");
    work::record_state_transition(&span, ItemState::Submitted, ItemState::Completed);
}

#[test]
fn request_span_records_response_status() {
    let span = http::start_request_span("GET", "/datasets/vip/execution/7/status");
    http::record_response_status(&span, 200);
}

#[test]
fn metrics_accept_measurements_without_a_provider() {
    metrics::items_processed().add(1, &[KeyValue::new("outcome", "succeeded")]);
    metrics::items_submitted().add(1, &[KeyValue::new("result", "accepted")]);
    metrics::status_poll_errors().add(1, &[]);
    metrics::gate_pauses().add(1, &[]);
    metrics::item_duration_ms().record(12.5, &[KeyValue::new("outcome", "failed")]);
}
