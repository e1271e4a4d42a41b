//! `resilient-http` is an async HTTP client for UI fragments that share one
//! backend connection layer.
//!
//! [`HttpClient::request`] combines three cooperating pieces:
//! - bounded exponential backoff with jitter ([`RetryConfig`], [`calculate_delay`])
//! - idempotency-key deduplication ([`RequestDeduplicator`])
//! - a per-request ledger with rolling RED metrics ([`MetricsCollector`])

mod client;
mod dedup;
mod error;
mod metrics;
mod options;
mod retry;
mod telemetry;
mod transport;
mod types;

pub use client::HttpClient;
pub use dedup::{InFlightPolicy, RequestDeduplicator, SharedResult, DEFAULT_DEDUP_TTL_MS};
pub use error::{HttpClientError, RequestFailure};
pub use metrics::{
    Clock, DurationStats, MetricsCollector, RedMetrics, RequestMetrics, SystemClock,
    DEFAULT_RETENTION_MS, RED_WINDOW_MS,
};
pub use options::ClientOptions;
pub use retry::{calculate_delay, is_retryable, ErrorKind, RetryConfig, RetryOverrides};
#[cfg(feature = "tracing")]
pub use telemetry::TracingTelemetry;
pub use telemetry::{AttemptSpan, TelemetrySink};
pub use tokio_util::sync::CancellationToken;
pub use transport::{
    ReqwestTransport, Transport, TransportError, TransportRequest, TransportResponse,
};
pub use types::{HttpResponse, Method, RequestDescriptor};

pub type Result<T> = std::result::Result<T, HttpClientError>;
