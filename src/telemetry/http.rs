//! HTTP client span helpers.
//!
//! Field names follow the OpenTelemetry HTTP semantic conventions:
//! - `http.request.method`
//! - `url.path`
//! - `http.response.status_code`

use tracing::Span;

/// Start a client span for a request to the remote platform.
///
/// The response status is declared empty and filled via
/// [`record_response_status`].
pub fn start_request_span(method: &str, path: &str) -> Span {
    tracing::debug_span!(
        "http.client",
        "http.request.method" = method,
        "url.path" = path,
        "http.response.status_code" = tracing::field::Empty,
    )
}

pub fn record_response_status(span: &Span, status: u16) {
    span.record("http.response.status_code", status);
}
