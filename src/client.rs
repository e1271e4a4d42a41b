use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value as JsonValue;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::{
    dedup::RequestDeduplicator,
    retry::{calculate_delay, is_retryable},
    telemetry::{AttemptSpan, TelemetrySink},
    transport::{ReqwestTransport, Transport, TransportError, TransportRequest, TransportResponse},
    ClientOptions, ErrorKind, HttpClientError, HttpResponse, Method, MetricsCollector, RedMetrics,
    RequestDescriptor, RequestFailure, RequestMetrics, Result, RetryConfig,
};

/// Resilient HTTP client: retries, idempotency-key deduplication and RED metrics.
///
/// Clones share the transport, the metrics collector and the deduplicator.
#[derive(Clone)]
pub struct HttpClient {
    transport: Arc<dyn Transport>,
    options: ClientOptions,
    metrics: Arc<MetricsCollector>,
    dedup: RequestDeduplicator,
    telemetry: Option<Arc<dyn TelemetrySink>>,
    background: Arc<Background>,
}

impl fmt::Debug for HttpClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpClient")
            .field("options", &self.options)
            .field("metrics", &self.metrics)
            .field("dedup", &self.dedup)
            .field("telemetry", &self.telemetry.is_some())
            .finish()
    }
}

/// Lifecycle of the reaper task; cancelled when the last client clone drops.
#[derive(Default)]
struct Background {
    token: CancellationToken,
    started: AtomicBool,
}

impl Drop for Background {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

impl Default for HttpClient {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpClient {
    /// Creates a client with default options and a `reqwest` transport.
    pub fn new() -> Self {
        Self::from_options(ClientOptions::default())
    }

    /// Creates a client that resolves relative URLs against `base_url`.
    pub fn with_base_url(base_url: impl Into<String>) -> Self {
        Self::from_options(ClientOptions {
            base_url: Some(base_url.into()),
            ..ClientOptions::default()
        })
    }

    /// Creates a client with a `reqwest` transport built from `options`.
    pub fn from_options(options: ClientOptions) -> Self {
        let transport = ReqwestTransport::new(options.base_url.clone());
        Self::with_transport(Arc::new(transport), options)
    }

    /// Creates a client configured from `RESILIENT_HTTP_*` environment variables.
    ///
    /// See [`ClientOptions::from_env`].
    pub fn from_env() -> std::result::Result<Self, String> {
        ClientOptions::from_env().map(Self::from_options)
    }

    /// Creates a client on top of any [`Transport`].
    pub fn with_transport(transport: Arc<dyn Transport>, options: ClientOptions) -> Self {
        Self {
            transport,
            dedup: RequestDeduplicator::new(Duration::from_millis(options.dedup_ttl_ms)),
            options,
            metrics: Arc::new(MetricsCollector::new()),
            telemetry: None,
            background: Arc::new(Background::default()),
        }
    }

    /// Replaces client options. The transport is kept; the deduplicator is
    /// rebuilt with the new TTL, so call this before issuing requests.
    pub fn with_options(mut self, options: ClientOptions) -> Self {
        self.dedup = RequestDeduplicator::new(Duration::from_millis(options.dedup_ttl_ms));
        self.options = options;
        self
    }

    /// Uses `collector` instead of a private one, e.g. to share it between clients.
    pub fn with_metrics(mut self, collector: Arc<MetricsCollector>) -> Self {
        self.metrics = collector;
        self
    }

    pub fn with_telemetry(mut self, sink: Arc<dyn TelemetrySink>) -> Self {
        self.telemetry = Some(sink);
        self
    }

    pub fn options(&self) -> &ClientOptions {
        &self.options
    }

    pub fn metrics(&self) -> &Arc<MetricsCollector> {
        &self.metrics
    }

    pub fn deduplicator(&self) -> &RequestDeduplicator {
        &self.dedup
    }

    pub async fn get(&self, url: &str) -> Result<HttpResponse> {
        self.get_with(url, identity).await
    }

    pub async fn post(&self, url: &str, data: JsonValue) -> Result<HttpResponse> {
        self.post_with(url, data, identity).await
    }

    pub async fn put(&self, url: &str, data: JsonValue) -> Result<HttpResponse> {
        self.put_with(url, data, identity).await
    }

    pub async fn delete(&self, url: &str) -> Result<HttpResponse> {
        self.delete_with(url, identity).await
    }

    pub async fn patch(&self, url: &str, data: JsonValue) -> Result<HttpResponse> {
        self.patch_with(url, data, identity).await
    }

    /// Like [`HttpClient::get`], with `configure` adjusting the descriptor
    /// (headers, retry overrides, idempotency key, ...) before it is sent.
    ///
    /// ```no_run
    /// # async fn run(http: resilient_http::HttpClient) -> resilient_http::Result<()> {
    /// use resilient_http::RetryOverrides;
    ///
    /// let cart = http
    ///     .get_with("/cart", |req| req.retry(RetryOverrides::default().max_retries(0)))
    ///     .await?;
    /// # Ok(())
    /// # }
    /// ```
    pub async fn get_with(
        &self,
        url: &str,
        configure: impl FnOnce(RequestDescriptor) -> RequestDescriptor,
    ) -> Result<HttpResponse> {
        self.request(configure(RequestDescriptor::new(Method::Get, url)))
            .await
    }

    pub async fn post_with(
        &self,
        url: &str,
        data: JsonValue,
        configure: impl FnOnce(RequestDescriptor) -> RequestDescriptor,
    ) -> Result<HttpResponse> {
        self.request(configure(RequestDescriptor::new(Method::Post, url).json(data)))
            .await
    }

    pub async fn put_with(
        &self,
        url: &str,
        data: JsonValue,
        configure: impl FnOnce(RequestDescriptor) -> RequestDescriptor,
    ) -> Result<HttpResponse> {
        self.request(configure(RequestDescriptor::new(Method::Put, url).json(data)))
            .await
    }

    pub async fn delete_with(
        &self,
        url: &str,
        configure: impl FnOnce(RequestDescriptor) -> RequestDescriptor,
    ) -> Result<HttpResponse> {
        self.request(configure(RequestDescriptor::new(Method::Delete, url)))
            .await
    }

    pub async fn patch_with(
        &self,
        url: &str,
        data: JsonValue,
        configure: impl FnOnce(RequestDescriptor) -> RequestDescriptor,
    ) -> Result<HttpResponse> {
        self.request(configure(RequestDescriptor::new(Method::Patch, url).json(data)))
            .await
    }

    /// Executes `descriptor`, retrying transient failures.
    pub async fn request(&self, descriptor: RequestDescriptor) -> Result<HttpResponse> {
        self.request_with_cancel(descriptor, CancellationToken::new())
            .await
    }

    /// Like [`HttpClient::request`], but gives up as soon as `cancel` fires,
    /// whether during an attempt or during the backoff sleep.
    ///
    /// For idempotent requests the token only stops this caller from waiting;
    /// the shared execution keeps running for the other callers.
    pub async fn request_with_cancel(
        &self,
        descriptor: RequestDescriptor,
        cancel: CancellationToken,
    ) -> Result<HttpResponse> {
        self.ensure_background();

        let request_id = generate_request_id();
        let config = match &descriptor.retry {
            Some(overrides) => self.options.retry.merged(overrides),
            None => self.options.retry.clone(),
        };

        let Some(key) = descriptor.idempotency_key.clone() else {
            return self
                .execute_with_retries(request_id, descriptor, config, cancel)
                .await;
        };

        let client = self.clone();
        let execution_id = request_id.clone();
        let shared = self.dedup.submit(&key, move || async move {
            client
                .execute_with_retries(execution_id, descriptor, config, CancellationToken::new())
                .await
        });

        tokio::select! {
            biased;
            outcome = shared => outcome,
            _ = cancel.cancelled() => Err(HttpClientError::Cancelled {
                request_id,
                metrics: None,
            }),
        }
    }

    /// RED metrics over the last minute.
    pub fn red_metrics(&self) -> RedMetrics {
        self.metrics.red_metrics()
    }

    /// Drops metrics older than the configured retention.
    pub fn clear_metrics(&self) -> usize {
        self.metrics
            .clear_old_metrics(self.options.metrics_retention_ms)
    }

    pub fn clear_old_metrics(&self, threshold_ms: u64) -> usize {
        self.metrics.clear_old_metrics(threshold_ms)
    }

    /// Applies the configured [`crate::InFlightPolicy`] to idempotent requests
    /// still in flight and stops the reaper. Returns the number of in-flight
    /// executions that were flushed or discarded.
    pub async fn shutdown(&self) -> usize {
        let affected = self.dedup.shutdown(self.options.in_flight_policy).await;
        self.background.token.cancel();

        #[cfg(feature = "tracing")]
        tracing::debug!(
            policy = ?self.options.in_flight_policy,
            affected,
            "http client shut down"
        );

        affected
    }

    async fn execute_with_retries(
        &self,
        request_id: String,
        descriptor: RequestDescriptor,
        config: RetryConfig,
        cancel: CancellationToken,
    ) -> Result<HttpResponse> {
        let mut ledger = Ledger::start(&self.metrics, &request_id, &descriptor);
        let timeout = descriptor
            .timeout
            .unwrap_or(Duration::from_millis(self.options.timeout_ms));
        let mut attempt: u32 = 1;

        loop {
            let started = Instant::now();

            #[cfg(feature = "tracing")]
            let send = {
                use tracing::Instrument;
                self.send_attempt(&descriptor, timeout)
                    .instrument(tracing::debug_span!(
                        "http_attempt",
                        http.method = descriptor.method.as_str(),
                        http.url = %descriptor.url,
                        http.request_id = %request_id,
                        attempt
                    ))
            };
            #[cfg(not(feature = "tracing"))]
            let send = self.send_attempt(&descriptor, timeout);

            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(ledger.cancelled()),
                outcome = send => outcome,
            };
            let elapsed = started.elapsed();

            match outcome {
                Ok(response) => {
                    ledger.record_response(response.status, &response.status_text);
                    self.report_success(&ledger, &descriptor, attempt, &response, elapsed);
                    return Ok(HttpResponse {
                        data: response.data,
                        status: response.status,
                        status_text: response.status_text,
                        headers: response.headers,
                        metrics: ledger.snapshot(),
                        duration: elapsed.as_millis() as u64,
                        success: true,
                    });
                }
                Err(error) => {
                    let retryable = is_retryable(&error, &config);
                    ledger.record_error(&error.message, error.status);
                    self.report_failure(&ledger, &descriptor, attempt, &error, elapsed);

                    if attempt > config.max_retries || !retryable {
                        #[cfg(feature = "tracing")]
                        tracing::warn!(
                            request_id = %request_id,
                            method = descriptor.method.as_str(),
                            url = %descriptor.url,
                            attempt,
                            retryable,
                            error = %error,
                            "request failed"
                        );
                        return Err(terminal_error(error, retryable, ledger.snapshot()));
                    }

                    ledger.record_retry();
                    let delay = calculate_delay(attempt, &config);

                    #[cfg(feature = "tracing")]
                    tracing::debug!(
                        request_id = %request_id,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "retrying request"
                    );

                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return Err(ledger.cancelled()),
                        _ = tokio::time::sleep(delay) => {}
                    }
                    attempt += 1;
                }
            }
        }
    }

    async fn send_attempt(
        &self,
        descriptor: &RequestDescriptor,
        timeout: Duration,
    ) -> std::result::Result<TransportResponse, TransportError> {
        let request = TransportRequest {
            method: descriptor.method,
            url: &descriptor.url,
            body: descriptor.data.as_ref(),
            headers: &descriptor.headers,
            params: &descriptor.params,
            timeout,
        };

        match tokio::time::timeout(timeout, self.transport.execute(request)).await {
            Ok(outcome) => outcome,
            Err(_) => Err(TransportError::timed_out(timeout)),
        }
    }

    fn report_success(
        &self,
        ledger: &Ledger<'_>,
        descriptor: &RequestDescriptor,
        attempt: u32,
        response: &TransportResponse,
        elapsed: Duration,
    ) {
        let Some(sink) = self.sink_for(ledger) else {
            return;
        };
        let route = descriptor.url.as_str();
        sink.record_duration(elapsed, descriptor.method, response.status, route);
        sink.increment_total(descriptor.method, response.status, route);
        sink.record_span(&attempt_span(
            ledger.request_id(),
            descriptor,
            attempt,
            response.status,
            None,
        ));
    }

    fn report_failure(
        &self,
        ledger: &Ledger<'_>,
        descriptor: &RequestDescriptor,
        attempt: u32,
        error: &TransportError,
        elapsed: Duration,
    ) {
        let Some(sink) = self.sink_for(ledger) else {
            return;
        };
        let route = descriptor.url.as_str();
        let error_type = error.code.as_deref().unwrap_or("unknown_error");
        sink.increment_errors(descriptor.method, route, error_type);
        if let Some(status) = error.status {
            sink.record_duration(elapsed, descriptor.method, status, route);
            sink.increment_total(descriptor.method, status, route);
        }
        sink.record_span(&attempt_span(
            ledger.request_id(),
            descriptor,
            attempt,
            error.status.unwrap_or(0),
            Some((error_type, error.message.as_str())),
        ));
    }

    fn sink_for(&self, ledger: &Ledger<'_>) -> Option<&Arc<dyn TelemetrySink>> {
        if ledger.shared {
            self.telemetry.as_ref()
        } else {
            None
        }
    }

    fn ensure_background(&self) {
        let Some(interval_ms) = self.options.reaper_interval_ms else {
            return;
        };
        if self.background.started.swap(true, Ordering::AcqRel) {
            return;
        }

        let interval = Duration::from_millis(interval_ms.max(1));
        let weak_dedup = self.dedup.downgrade();
        let weak_metrics = Arc::downgrade(&self.metrics);
        let sweep_metrics = self.options.sweep_metrics;
        let retention_ms = self.options.metrics_retention_ms;
        let token = self.background.token.clone();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                let Some(dedup) = RequestDeduplicator::upgrade(&weak_dedup) else {
                    break;
                };
                let purged = dedup.purge_expired();
                let swept = if sweep_metrics {
                    match weak_metrics.upgrade() {
                        Some(metrics) => metrics.clear_old_metrics(retention_ms),
                        None => break,
                    }
                } else {
                    0
                };
                log_reaper_pass(purged, swept);
            }
        });
    }
}

/// Tracks one logical request's metrics: always in a private copy, and in
/// the shared collector unless the request opted out.
struct Ledger<'a> {
    metrics: &'a MetricsCollector,
    shared: bool,
    local: RequestMetrics,
}

impl<'a> Ledger<'a> {
    fn start(metrics: &'a MetricsCollector, request_id: &str, descriptor: &RequestDescriptor) -> Self {
        let shared = descriptor.metrics_enabled();
        let method = descriptor.method.as_str();
        let key = descriptor.idempotency_key.as_deref();

        let local = if shared {
            metrics.start_request(request_id, &descriptor.url, method, key)
        } else {
            RequestMetrics::new(
                request_id,
                descriptor.url.as_str(),
                method,
                key.map(str::to_owned),
                metrics.now_ms(),
            )
        };
        Self {
            metrics,
            shared,
            local,
        }
    }

    fn request_id(&self) -> &str {
        &self.local.request_id
    }

    fn record_retry(&mut self) {
        self.local.mark_retry();
        if self.shared {
            self.metrics.record_retry(&self.local.request_id);
        }
    }

    fn record_response(&mut self, status: u16, status_text: &str) {
        self.local.mark_response(self.metrics.now_ms(), status);
        if self.shared {
            self.metrics
                .record_response(&self.local.request_id, status, Some(status_text));
        }
    }

    fn record_error(&mut self, message: &str, status: Option<u16>) {
        self.local.mark_error(self.metrics.now_ms(), message, status);
        if self.shared {
            self.metrics
                .record_error(&self.local.request_id, message, status);
        }
    }

    /// The collector's record wins; it is gone only if swept mid-flight.
    fn snapshot(&self) -> RequestMetrics {
        if self.shared {
            if let Some(record) = self.metrics.get(&self.local.request_id) {
                return record;
            }
        }
        self.local.clone()
    }

    fn cancelled(&self) -> HttpClientError {
        HttpClientError::Cancelled {
            request_id: self.local.request_id.clone(),
            metrics: Some(self.snapshot()),
        }
    }
}

fn terminal_error(error: TransportError, retryable: bool, metrics: RequestMetrics) -> HttpClientError {
    let kind = ErrorKind::of(&error);
    let message = if error.message.is_empty() {
        "Request failed".to_owned()
    } else {
        error.message
    };
    HttpClientError::Request(Box::new(RequestFailure {
        message,
        status: error.status,
        status_text: error.status_text,
        data: error.data,
        code: error.code,
        kind,
        metrics,
        is_retryable: retryable,
    }))
}

fn attempt_span(
    request_id: &str,
    descriptor: &RequestDescriptor,
    attempt: u32,
    status_code: u16,
    error: Option<(&str, &str)>,
) -> AttemptSpan {
    AttemptSpan {
        name: format!(
            "http_{}_{}",
            descriptor.method.as_str().to_ascii_lowercase(),
            descriptor.url
        ),
        method: descriptor.method,
        url: descriptor.url.clone(),
        request_id: request_id.to_owned(),
        attempt,
        status_code,
        error_type: error.map(|(kind, _)| kind.to_owned()),
        error_message: error.map(|(_, message)| message.to_owned()),
    }
}

#[cfg(feature = "tracing")]
fn log_reaper_pass(purged: usize, swept: usize) {
    if purged > 0 || swept > 0 {
        tracing::trace!(purged, swept, "reaper removed expired state");
    }
}

#[cfg(not(feature = "tracing"))]
fn log_reaper_pass(_purged: usize, _swept: usize) {}

fn identity(descriptor: RequestDescriptor) -> RequestDescriptor {
    descriptor
}

fn generate_request_id() -> String {
    format!("req_{}", Uuid::new_v4().simple())
}
