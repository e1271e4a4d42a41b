use serde_json::Value as JsonValue;

use crate::{ErrorKind, RequestMetrics};

/// Error type returned by this crate.
#[derive(Clone, Debug, PartialEq, thiserror::Error)]
pub enum HttpClientError {
    /// The last attempt failed and no further attempt will be made.
    #[error("{}", .0.message)]
    Request(Box<RequestFailure>),
    /// The caller's cancellation token fired before the request settled.
    #[error("request {request_id} was cancelled")]
    Cancelled {
        request_id: String,
        /// Snapshot at the moment of cancellation, if the request had started.
        metrics: Option<RequestMetrics>,
    },
    /// A deduplicated execution was aborted by client shutdown.
    #[error("request with idempotency key '{key}' was discarded at shutdown")]
    Discarded { key: String },
    /// A deduplicated execution task ended without producing a result.
    #[error("request task failed: {0}")]
    TaskFailed(String),
    /// Response payload did not match the requested type.
    #[error("decode error: {0}")]
    Decode(String),
}

/// Terminal failure of a logical request, describing its last attempt.
#[derive(Clone, Debug, PartialEq)]
pub struct RequestFailure {
    pub message: String,
    pub status: Option<u16>,
    pub status_text: Option<String>,
    pub data: Option<JsonValue>,
    /// Transport error code of the last attempt, if any.
    pub code: Option<String>,
    pub kind: ErrorKind,
    pub metrics: RequestMetrics,
    pub is_retryable: bool,
}

impl HttpClientError {
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Request(failure) => failure.status,
            _ => None,
        }
    }

    pub fn metrics(&self) -> Option<&RequestMetrics> {
        match self {
            Self::Request(failure) => Some(&failure.metrics),
            Self::Cancelled { metrics, .. } => metrics.as_ref(),
            _ => None,
        }
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Request(failure) => failure.is_retryable,
            _ => false,
        }
    }

    /// Always `false`; mirrors [`crate::HttpResponse::success`].
    pub fn success(&self) -> bool {
        false
    }

    pub fn failure(&self) -> Option<&RequestFailure> {
        match self {
            Self::Request(failure) => Some(failure),
            _ => None,
        }
    }
}
