//! Fire-and-forget telemetry hooks.
//!
//! The client reports every attempt to an optional [`TelemetrySink`]. Sinks
//! cannot influence the request; all methods default to no-ops.

use std::time::Duration;

use crate::Method;

/// Span attributes describing one attempt.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AttemptSpan {
    /// `http_<method>_<url>`.
    pub name: String,
    pub method: Method,
    pub url: String,
    pub request_id: String,
    pub attempt: u32,
    /// `0` when the attempt failed without a response.
    pub status_code: u16,
    pub error_type: Option<String>,
    pub error_message: Option<String>,
}

impl AttemptSpan {
    /// Attributes keyed by their OpenTelemetry-style names.
    pub fn attributes(&self) -> Vec<(&'static str, String)> {
        let mut attributes = vec![
            ("http.method", self.method.as_str().to_owned()),
            ("http.url", self.url.clone()),
            ("http.request_id", self.request_id.clone()),
            ("http.status_code", self.status_code.to_string()),
        ];
        if let Some(error_type) = &self.error_type {
            attributes.push(("error.type", error_type.clone()));
        }
        if let Some(error_message) = &self.error_message {
            attributes.push(("error.message", error_message.clone()));
        }
        attributes
    }
}

pub trait TelemetrySink: Send + Sync {
    fn record_span(&self, _span: &AttemptSpan) {}

    fn record_duration(&self, _duration: Duration, _method: Method, _status: u16, _route: &str) {}

    fn increment_total(&self, _method: Method, _status: u16, _route: &str) {}

    fn increment_errors(&self, _method: Method, _route: &str, _error_type: &str) {}
}

/// Emits telemetry as `tracing` events under the `resilient_http::telemetry` target.
#[cfg(feature = "tracing")]
#[derive(Debug, Default)]
pub struct TracingTelemetry;

#[cfg(feature = "tracing")]
impl TelemetrySink for TracingTelemetry {
    fn record_span(&self, span: &AttemptSpan) {
        tracing::debug!(
            target: "resilient_http::telemetry",
            span_name = %span.name,
            http.method = span.method.as_str(),
            http.url = %span.url,
            http.request_id = %span.request_id,
            http.status_code = span.status_code,
            error_type = span.error_type.as_deref(),
            error_message = span.error_message.as_deref(),
            "http attempt"
        );
    }

    fn record_duration(&self, duration: Duration, method: Method, status: u16, route: &str) {
        tracing::trace!(
            target: "resilient_http::telemetry",
            method = method.as_str(),
            histogram.http_request_duration_ms = duration.as_millis() as u64,
            status,
            route,
            "http request duration"
        );
    }

    fn increment_total(&self, method: Method, status: u16, route: &str) {
        tracing::trace!(
            target: "resilient_http::telemetry",
            method = method.as_str(),
            counter.http_requests_total = 1u64,
            status,
            route,
            "http request completed"
        );
    }

    fn increment_errors(&self, method: Method, route: &str, error_type: &str) {
        tracing::trace!(
            target: "resilient_http::telemetry",
            method = method.as_str(),
            counter.http_request_errors = 1u64,
            route,
            error_type,
            "http request failed"
        );
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::{AttemptSpan, TelemetrySink};
    use crate::Method;

    fn span() -> AttemptSpan {
        AttemptSpan {
            name: "http_get_/products".to_owned(),
            method: Method::Get,
            url: "/products".to_owned(),
            request_id: "req_1".to_owned(),
            attempt: 1,
            status_code: 200,
            error_type: None,
            error_message: None,
        }
    }

    #[test]
    fn attributes_include_error_fields_only_when_present() {
        let mut span = span();
        let keys: Vec<_> = span.attributes().into_iter().map(|(key, _)| key).collect();
        assert_eq!(
            keys,
            ["http.method", "http.url", "http.request_id", "http.status_code"]
        );

        span.error_type = Some("ECONNRESET".to_owned());
        span.error_message = Some("socket hang up".to_owned());
        let attributes = span.attributes();
        assert!(attributes.contains(&("error.type", "ECONNRESET".to_owned())));
        assert!(attributes.contains(&("error.message", "socket hang up".to_owned())));
    }

    struct Silent;

    impl TelemetrySink for Silent {}

    #[test]
    fn default_sink_methods_are_no_ops() {
        let sink = Silent;
        sink.record_span(&span());
        sink.record_duration(Duration::from_millis(5), Method::Get, 200, "/products");
        sink.increment_total(Method::Get, 200, "/products");
        sink.increment_errors(Method::Get, "/products", "ECONNRESET");
    }

    #[cfg(feature = "tracing")]
    #[test]
    fn tracing_sink_emits_every_signal() {
        use super::TracingTelemetry;

        let subscriber = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::TRACE)
            .with_test_writer()
            .finish();
        tracing::subscriber::with_default(subscriber, || {
            let sink = TracingTelemetry;
            let mut failed = span();
            failed.status_code = 503;
            failed.error_type = Some("unknown_error".to_owned());
            failed.error_message = Some("Request failed with status code 503".to_owned());

            sink.record_span(&span());
            sink.record_span(&failed);
            sink.record_duration(Duration::from_millis(12), Method::Get, 503, "/products");
            sink.increment_total(Method::Get, 503, "/products");
            sink.increment_errors(Method::Get, "/products", "unknown_error");
        });
    }
}
