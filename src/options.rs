use std::str::FromStr;

use crate::{InFlightPolicy, RetryConfig, DEFAULT_DEDUP_TTL_MS, DEFAULT_RETENTION_MS};

/// Configures timeouts, retries, deduplication and background maintenance.
#[derive(Clone, Debug, PartialEq)]
pub struct ClientOptions {
    /// Prefix for relative request URLs. Only used when the client builds its
    /// own `reqwest` transport.
    pub base_url: Option<String>,
    /// Per-attempt timeout in milliseconds, unless the request sets one.
    pub timeout_ms: u64,
    /// Retry defaults; requests may override individual fields.
    pub retry: RetryConfig,
    /// How long a settled idempotent request keeps answering duplicates.
    pub dedup_ttl_ms: u64,
    /// Age threshold used by [`crate::HttpClient::clear_metrics`] and the sweep.
    pub metrics_retention_ms: u64,
    /// Interval of the background reaper. `None` disables it and leaves
    /// expiry to lazy checks and explicit calls.
    pub reaper_interval_ms: Option<u64>,
    /// Lets the reaper also drop metrics older than `metrics_retention_ms`.
    pub sweep_metrics: bool,
    /// Fate of in-flight idempotent requests on [`crate::HttpClient::shutdown`].
    pub in_flight_policy: InFlightPolicy,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            base_url: None,
            timeout_ms: 30_000,
            retry: RetryConfig::default(),
            dedup_ttl_ms: DEFAULT_DEDUP_TTL_MS,
            metrics_retention_ms: DEFAULT_RETENTION_MS,
            reaper_interval_ms: None,
            sweep_metrics: false,
            in_flight_policy: InFlightPolicy::Flush,
        }
    }
}

impl ClientOptions {
    /// Reads overrides from the environment on top of the defaults.
    ///
    /// Reads:
    /// - `RESILIENT_HTTP_BASE_URL`
    /// - `RESILIENT_HTTP_TIMEOUT_MS`
    /// - `RESILIENT_HTTP_MAX_RETRIES`
    /// - `RESILIENT_HTTP_DEDUP_TTL_MS`
    ///
    /// Unset variables keep their defaults; unparsable ones are an error.
    pub fn from_env() -> Result<Self, String> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, String> {
        let mut options = Self::default();

        if let Some(url) = lookup("RESILIENT_HTTP_BASE_URL") {
            if url.trim().is_empty() {
                return Err("RESILIENT_HTTP_BASE_URL is set but empty".to_owned());
            }
            options.base_url = Some(url.trim().to_owned());
        }
        if let Some(value) = parse_var(&lookup, "RESILIENT_HTTP_TIMEOUT_MS")? {
            options.timeout_ms = value;
        }
        if let Some(value) = parse_var(&lookup, "RESILIENT_HTTP_MAX_RETRIES")? {
            options.retry.max_retries = value;
        }
        if let Some(value) = parse_var(&lookup, "RESILIENT_HTTP_DEDUP_TTL_MS")? {
            options.dedup_ttl_ms = value;
        }

        Ok(options)
    }
}

fn parse_var<T>(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> Result<Option<T>, String>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    lookup(name)
        .map(|raw| {
            raw.trim()
                .parse::<T>()
                .map_err(|err| format!("{name} must be a non-negative integer: {err}"))
        })
        .transpose()
}
