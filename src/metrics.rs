use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Records falling inside this window feed [`MetricsCollector::red_metrics`].
pub const RED_WINDOW_MS: u64 = 60_000;
/// Default age threshold for [`MetricsCollector::clear_old_metrics`].
pub const DEFAULT_RETENTION_MS: u64 = 300_000;

/// Wall-clock source for request timestamps, in milliseconds since the epoch.
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> u64;
}

#[derive(Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_millis() as u64)
            .unwrap_or_default()
    }
}

/// Lifecycle record of one logical request, spanning all of its attempts.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestMetrics {
    pub request_id: String,
    pub url: String,
    pub method: String,
    pub start_time: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_time: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
    pub retry_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
}

impl RequestMetrics {
    pub fn new(
        request_id: impl Into<String>,
        url: impl Into<String>,
        method: impl Into<String>,
        idempotency_key: Option<String>,
        start_time: u64,
    ) -> Self {
        Self {
            request_id: request_id.into(),
            url: url.into(),
            method: method.into(),
            start_time,
            end_time: None,
            duration: None,
            status_code: None,
            retry_count: 0,
            error: None,
            idempotency_key,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.end_time.is_some()
    }

    /// `true` when the last attempt failed or answered with status >= 400.
    pub fn is_error(&self) -> bool {
        self.error.is_some() || self.status_code.is_some_and(|status| status >= 400)
    }

    pub(crate) fn mark_retry(&mut self) {
        self.retry_count = self.retry_count.saturating_add(1);
    }

    pub(crate) fn mark_response(&mut self, now: u64, status: u16) {
        self.finish(now);
        self.status_code = Some(status);
    }

    pub(crate) fn mark_error(&mut self, now: u64, message: &str, status: Option<u16>) {
        self.finish(now);
        self.error = Some(message.to_owned());
        self.status_code = status;
    }

    fn finish(&mut self, now: u64) {
        // Clock skew must not produce a negative duration.
        let end = now.max(self.start_time);
        self.end_time = Some(end);
        self.duration = Some(end - self.start_time);
    }
}

/// Latency summary of the RED window, in milliseconds.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DurationStats {
    pub avg: f64,
    pub p95: u64,
    pub p99: u64,
}

/// Rate, errors and duration over the last [`RED_WINDOW_MS`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RedMetrics {
    pub rate: usize,
    pub errors: usize,
    pub duration: DurationStats,
}

/// Per-request ledger with rolling RED aggregation.
///
/// Every operation keyed by request id is a no-op for ids the collector does
/// not know, so recording can never fail a request.
pub struct MetricsCollector {
    records: Mutex<HashMap<String, RequestMetrics>>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for MetricsCollector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricsCollector")
            .field("records", &self.len())
            .finish()
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
            clock,
        }
    }

    pub fn now_ms(&self) -> u64 {
        self.clock.now_ms()
    }

    pub fn start_request(
        &self,
        request_id: &str,
        url: &str,
        method: &str,
        idempotency_key: Option<&str>,
    ) -> RequestMetrics {
        let record = RequestMetrics::new(
            request_id,
            url,
            method,
            idempotency_key.map(str::to_owned),
            self.clock.now_ms(),
        );
        self.lock()
            .insert(request_id.to_owned(), record.clone());
        record
    }

    pub fn record_retry(&self, request_id: &str) {
        if let Some(record) = self.lock().get_mut(request_id) {
            record.mark_retry();
        }
    }

    /// Marks the request finished with `status`. The status text is accepted
    /// for parity with the error path but not stored.
    pub fn record_response(&self, request_id: &str, status: u16, _status_text: Option<&str>) {
        let now = self.clock.now_ms();
        if let Some(record) = self.lock().get_mut(request_id) {
            record.mark_response(now, status);
        }
    }

    pub fn record_error(&self, request_id: &str, message: &str, status: Option<u16>) {
        let now = self.clock.now_ms();
        if let Some(record) = self.lock().get_mut(request_id) {
            record.mark_error(now, message, status);
        }
    }

    pub fn get(&self, request_id: &str) -> Option<RequestMetrics> {
        self.lock().get(request_id).cloned()
    }

    pub fn all(&self) -> Vec<RequestMetrics> {
        self.lock().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn red_metrics(&self) -> RedMetrics {
        let window_start = self.clock.now_ms().saturating_sub(RED_WINDOW_MS);
        let records = self.lock();
        let recent: Vec<&RequestMetrics> = records
            .values()
            .filter(|record| record.start_time >= window_start && record.is_finished())
            .collect();

        let errors = recent.iter().filter(|record| record.is_error()).count();
        let mut durations: Vec<u64> = recent.iter().filter_map(|record| record.duration).collect();
        durations.sort_unstable();

        RedMetrics {
            rate: recent.len(),
            errors,
            duration: duration_stats(&durations),
        }
    }

    /// Drops records that started more than `threshold_ms` ago. Returns how
    /// many were removed.
    pub fn clear_old_metrics(&self, threshold_ms: u64) -> usize {
        let cutoff = self.clock.now_ms().saturating_sub(threshold_ms);
        let mut records = self.lock();
        let before = records.len();
        records.retain(|_, record| record.start_time >= cutoff);
        before - records.len()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, RequestMetrics>> {
        match self.records.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

fn duration_stats(sorted: &[u64]) -> DurationStats {
    if sorted.is_empty() {
        return DurationStats::default();
    }
    let total: u64 = sorted.iter().sum();
    DurationStats {
        avg: total as f64 / sorted.len() as f64,
        p95: percentile_at(sorted, 0.95),
        p99: percentile_at(sorted, 0.99),
    }
}

// Direct index floor(n * q), no interpolation.
fn percentile_at(sorted: &[u64], quantile: f64) -> u64 {
    let index = (sorted.len() as f64 * quantile).floor() as usize;
    sorted[index.min(sorted.len() - 1)]
}
