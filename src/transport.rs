use std::collections::BTreeMap;
use std::error::Error as StdError;
use std::fmt;
use std::io;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use serde_json::Value as JsonValue;

use crate::Method;

/// One attempt handed to a [`Transport`].
#[derive(Clone, Debug)]
pub struct TransportRequest<'a> {
    pub method: Method,
    pub url: &'a str,
    pub body: Option<&'a JsonValue>,
    pub headers: &'a BTreeMap<String, String>,
    pub params: &'a BTreeMap<String, String>,
    pub timeout: Duration,
}

/// Successful exchange as seen by the dispatcher.
#[derive(Clone, Debug, PartialEq)]
pub struct TransportResponse {
    pub status: u16,
    pub status_text: String,
    pub headers: BTreeMap<String, String>,
    pub data: JsonValue,
}

/// Failed attempt: an HTTP status, a transport code, both, or neither.
#[derive(Clone, Debug, PartialEq)]
pub struct TransportError {
    pub message: String,
    pub status: Option<u16>,
    pub status_text: Option<String>,
    pub data: Option<JsonValue>,
    /// Node-style error code such as `ECONNRESET`.
    pub code: Option<String>,
}

impl TransportError {
    /// A response arrived with a failing status.
    pub fn status(status: u16, status_text: impl Into<String>) -> Self {
        Self {
            message: format!("Request failed with status code {status}"),
            status: Some(status),
            status_text: Some(status_text.into()),
            data: None,
            code: None,
        }
    }

    /// The exchange failed below HTTP.
    pub fn network(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            status: None,
            status_text: None,
            data: None,
            code: Some(code.into()),
        }
    }

    /// Neither status nor code is known.
    pub fn other(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            status: None,
            status_text: None,
            data: None,
            code: None,
        }
    }

    pub fn with_data(mut self, data: JsonValue) -> Self {
        self.data = Some(data);
        self
    }

    pub(crate) fn timed_out(timeout: Duration) -> Self {
        Self::network(
            "ETIMEDOUT",
            format!("timeout of {}ms exceeded", timeout.as_millis()),
        )
    }
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl StdError for TransportError {}

/// The network call the dispatcher drives. Implementations must not retry.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn execute(
        &self,
        request: TransportRequest<'_>,
    ) -> Result<TransportResponse, TransportError>;
}

/// [`Transport`] backed by `reqwest`.
#[derive(Clone, Debug)]
pub struct ReqwestTransport {
    http: reqwest::Client,
    base_url: Option<String>,
}

impl ReqwestTransport {
    pub fn new(base_url: Option<String>) -> Self {
        Self::with_client(reqwest::Client::new(), base_url)
    }

    pub fn with_client(http: reqwest::Client, base_url: Option<String>) -> Self {
        Self {
            http,
            base_url: base_url.map(|url| url.trim_end_matches('/').to_owned()),
        }
    }

    fn resolve_url(&self, url: &str) -> String {
        match &self.base_url {
            Some(base) if !url.contains("://") => {
                format!("{base}/{}", url.trim_start_matches('/'))
            }
            _ => url.to_owned(),
        }
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn execute(
        &self,
        request: TransportRequest<'_>,
    ) -> Result<TransportResponse, TransportError> {
        let url = self.resolve_url(request.url);
        let mut builder = self
            .http
            .request(request.method.into(), &url)
            .headers(build_header_map(request.headers)?)
            .timeout(request.timeout);

        if !request.params.is_empty() {
            builder = builder.query(request.params);
        }
        if let Some(body) = request.body {
            builder = builder.json(body);
        }

        let response = builder.send().await.map_err(map_reqwest_error)?;
        let status = response.status();
        let status_text = status.canonical_reason().unwrap_or_default().to_owned();
        let headers = response
            .headers()
            .iter()
            .map(|(name, value)| {
                (
                    name.as_str().to_owned(),
                    String::from_utf8_lossy(value.as_bytes()).into_owned(),
                )
            })
            .collect();
        let body = response.text().await.map_err(map_reqwest_error)?;
        let data = parse_body(body);

        if !status.is_success() {
            return Err(TransportError::status(status.as_u16(), status_text).with_data(data));
        }

        Ok(TransportResponse {
            status: status.as_u16(),
            status_text,
            headers,
            data,
        })
    }
}

fn build_header_map(headers: &BTreeMap<String, String>) -> Result<HeaderMap, TransportError> {
    let mut map = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|err| TransportError::other(format!("invalid header name '{name}': {err}")))?;
        let value = HeaderValue::from_str(value).map_err(|err| {
            TransportError::other(format!("invalid header value for '{name}': {err}"))
        })?;
        map.insert(name, value);
    }
    Ok(map)
}

fn parse_body(body: String) -> JsonValue {
    if body.is_empty() {
        return JsonValue::Null;
    }
    serde_json::from_str(&body).unwrap_or(JsonValue::String(body))
}

fn map_reqwest_error(err: reqwest::Error) -> TransportError {
    let message = err.to_string();
    match classify_reqwest_error(&err) {
        Some(code) => TransportError::network(code, message),
        None => TransportError::other(message),
    }
}

fn classify_reqwest_error(err: &reqwest::Error) -> Option<&'static str> {
    if err.is_timeout() {
        return Some("ETIMEDOUT");
    }

    let mut source = err.source();
    while let Some(inner) = source {
        if let Some(io_err) = inner.downcast_ref::<io::Error>() {
            match io_err.kind() {
                io::ErrorKind::ConnectionRefused => return Some("ECONNREFUSED"),
                io::ErrorKind::ConnectionReset
                | io::ErrorKind::ConnectionAborted
                | io::ErrorKind::BrokenPipe
                | io::ErrorKind::UnexpectedEof => return Some("ECONNRESET"),
                io::ErrorKind::TimedOut => return Some("ETIMEDOUT"),
                _ => {}
            }
        }
        if inner.to_string().contains("dns error") {
            return Some("ENOTFOUND");
        }
        source = inner.source();
    }

    if err.is_connect() {
        Some("ECONNREFUSED")
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use serde_json::json;

    use super::{build_header_map, parse_body, ReqwestTransport, TransportError};

    #[test]
    fn relative_urls_join_base_url() {
        let transport = ReqwestTransport::new(Some("http://api.test/".to_owned()));
        assert_eq!(transport.resolve_url("/products"), "http://api.test/products");
        assert_eq!(transport.resolve_url("cart"), "http://api.test/cart");
        assert_eq!(
            transport.resolve_url("https://other.test/x"),
            "https://other.test/x"
        );
    }

    #[test]
    fn urls_pass_through_without_base() {
        let transport = ReqwestTransport::new(None);
        assert_eq!(transport.resolve_url("/products"), "/products");
    }

    #[test]
    fn body_falls_back_to_text() {
        assert_eq!(parse_body(String::new()), json!(null));
        assert_eq!(parse_body("{\"id\":1}".to_owned()), json!({"id": 1}));
        assert_eq!(parse_body("plain".to_owned()), json!("plain"));
    }

    #[test]
    fn invalid_header_is_unclassified() {
        let headers = BTreeMap::from([("bad header".to_owned(), "v".to_owned())]);
        let err = build_header_map(&headers).expect_err("must reject header name");
        assert!(err.status.is_none());
        assert!(err.code.is_none());
    }

    #[test]
    fn status_error_message_names_the_code() {
        let err = TransportError::status(503, "Service Unavailable");
        assert_eq!(err.message, "Request failed with status code 503");
        assert_eq!(err.status_text.as_deref(), Some("Service Unavailable"));
        assert_eq!(err.to_string(), "Request failed with status code 503");
    }
}
