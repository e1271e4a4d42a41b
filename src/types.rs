use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::{HttpClientError, RequestMetrics, RetryOverrides};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
    Get,
    Post,
    Put,
    Delete,
    Patch,
}

impl Method {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Delete => "DELETE",
            Self::Patch => "PATCH",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<Method> for reqwest::Method {
    fn from(method: Method) -> Self {
        match method {
            Method::Get => reqwest::Method::GET,
            Method::Post => reqwest::Method::POST,
            Method::Put => reqwest::Method::PUT,
            Method::Delete => reqwest::Method::DELETE,
            Method::Patch => reqwest::Method::PATCH,
        }
    }
}

/// Everything the client needs to perform one logical request.
#[derive(Clone, Debug, PartialEq)]
pub struct RequestDescriptor {
    pub method: Method,
    pub url: String,
    pub data: Option<JsonValue>,
    pub headers: BTreeMap<String, String>,
    pub params: BTreeMap<String, String>,
    /// Per-attempt timeout; falls back to the client default.
    pub timeout: Option<Duration>,
    pub retry: Option<RetryOverrides>,
    pub idempotency_key: Option<String>,
    /// `Some(false)` keeps the request out of the shared collector and the
    /// telemetry sink. The response still carries its own snapshot.
    pub enable_metrics: Option<bool>,
}

impl RequestDescriptor {
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            data: None,
            headers: BTreeMap::new(),
            params: BTreeMap::new(),
            timeout: None,
            retry: None,
            idempotency_key: None,
            enable_metrics: None,
        }
    }

    pub fn json(mut self, data: JsonValue) -> Self {
        self.data = Some(data);
        self
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(name.into(), value.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn retry(mut self, overrides: RetryOverrides) -> Self {
        self.retry = Some(overrides);
        self
    }

    pub fn idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    pub fn enable_metrics(mut self, enabled: bool) -> Self {
        self.enable_metrics = Some(enabled);
        self
    }

    pub(crate) fn metrics_enabled(&self) -> bool {
        self.enable_metrics.unwrap_or(true)
    }
}

/// Successful result of [`crate::HttpClient::request`].
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpResponse {
    pub data: JsonValue,
    pub status: u16,
    pub status_text: String,
    pub headers: BTreeMap<String, String>,
    pub metrics: RequestMetrics,
    /// Duration of the successful attempt, in milliseconds.
    pub duration: u64,
    pub success: bool,
}

impl HttpResponse {
    /// Deserializes the payload into `T`.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, HttpClientError> {
        serde_json::from_value(self.data.clone())
            .map_err(|err| HttpClientError::Decode(format!("invalid response payload: {err}")))
    }
}
