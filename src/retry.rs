use std::collections::BTreeSet;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::transport::TransportError;

/// Retry and backoff settings for one logical request.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum number of retries after the initial attempt.
    pub max_retries: u32,
    /// Delay before the first retry, in milliseconds.
    pub base_delay_ms: u64,
    /// Upper bound for the unjittered delay, in milliseconds.
    pub max_delay_ms: u64,
    /// Growth factor applied per retry.
    pub backoff_multiplier: f64,
    /// Adds up to 10% random delay on top of the exponential value.
    pub jitter_enabled: bool,
    /// HTTP statuses that warrant another attempt.
    pub retryable_status_codes: BTreeSet<u16>,
    /// Transport error codes (`ECONNRESET` etc.) that warrant another attempt.
    pub retryable_error_codes: BTreeSet<String>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 1_000,
            max_delay_ms: 30_000,
            backoff_multiplier: 2.0,
            jitter_enabled: true,
            retryable_status_codes: [408, 429, 502, 503, 504].into_iter().collect(),
            retryable_error_codes: ["ECONNRESET", "ENOTFOUND", "ECONNREFUSED", "ETIMEDOUT"]
                .into_iter()
                .map(str::to_owned)
                .collect(),
        }
    }
}

impl RetryConfig {
    /// Returns a copy with every field set in `overrides` replacing its own.
    pub fn merged(&self, overrides: &RetryOverrides) -> Self {
        Self {
            max_retries: overrides.max_retries.unwrap_or(self.max_retries),
            base_delay_ms: overrides.base_delay_ms.unwrap_or(self.base_delay_ms),
            max_delay_ms: overrides.max_delay_ms.unwrap_or(self.max_delay_ms),
            backoff_multiplier: overrides
                .backoff_multiplier
                .unwrap_or(self.backoff_multiplier),
            jitter_enabled: overrides.jitter_enabled.unwrap_or(self.jitter_enabled),
            retryable_status_codes: overrides
                .retryable_status_codes
                .clone()
                .unwrap_or_else(|| self.retryable_status_codes.clone()),
            retryable_error_codes: overrides
                .retryable_error_codes
                .clone()
                .unwrap_or_else(|| self.retryable_error_codes.clone()),
        }
    }
}

/// Per-request partial [`RetryConfig`].
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RetryOverrides {
    pub max_retries: Option<u32>,
    pub base_delay_ms: Option<u64>,
    pub max_delay_ms: Option<u64>,
    pub backoff_multiplier: Option<f64>,
    pub jitter_enabled: Option<bool>,
    pub retryable_status_codes: Option<BTreeSet<u16>>,
    pub retryable_error_codes: Option<BTreeSet<String>>,
}

impl RetryOverrides {
    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn base_delay_ms(mut self, base_delay_ms: u64) -> Self {
        self.base_delay_ms = Some(base_delay_ms);
        self
    }

    pub fn max_delay_ms(mut self, max_delay_ms: u64) -> Self {
        self.max_delay_ms = Some(max_delay_ms);
        self
    }

    pub fn backoff_multiplier(mut self, backoff_multiplier: f64) -> Self {
        self.backoff_multiplier = Some(backoff_multiplier);
        self
    }

    pub fn jitter_enabled(mut self, jitter_enabled: bool) -> Self {
        self.jitter_enabled = Some(jitter_enabled);
        self
    }

    pub fn retryable_status_codes(mut self, codes: impl IntoIterator<Item = u16>) -> Self {
        self.retryable_status_codes = Some(codes.into_iter().collect());
        self
    }

    pub fn retryable_error_codes<I, S>(mut self, codes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.retryable_error_codes = Some(codes.into_iter().map(Into::into).collect());
        self
    }
}

/// Coarse category of a failed attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// A response arrived with a non-success status.
    HttpStatus,
    /// The exchange failed below HTTP with an identifiable code.
    Transport,
    /// Neither a status nor a code is available.
    Unclassified,
}

impl ErrorKind {
    pub fn of(error: &TransportError) -> Self {
        if error.status.is_some() {
            Self::HttpStatus
        } else if error.code.is_some() {
            Self::Transport
        } else {
            Self::Unclassified
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::HttpStatus => "http_status",
            Self::Transport => "transport",
            Self::Unclassified => "unclassified",
        }
    }
}

/// Decides whether a failed attempt may be retried.
///
/// The status code takes precedence over the transport code. Errors carrying
/// neither are terminal.
pub fn is_retryable(error: &TransportError, config: &RetryConfig) -> bool {
    if let Some(status) = error.status {
        return config.retryable_status_codes.contains(&status);
    }
    if let Some(code) = error.code.as_deref() {
        return config.retryable_error_codes.contains(code);
    }
    false
}

/// Delay to wait before retry number `attempt` (1-indexed).
pub fn calculate_delay(attempt: u32, config: &RetryConfig) -> Duration {
    let exponential_ms = exponential_delay_ms(attempt, config);
    let delay_ms = if config.jitter_enabled {
        exponential_ms + rand::random::<f64>() * 0.1 * exponential_ms
    } else {
        exponential_ms
    };
    Duration::from_secs_f64(delay_ms / 1_000.0)
}

fn exponential_delay_ms(attempt: u32, config: &RetryConfig) -> f64 {
    let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
    let raw = config.base_delay_ms as f64 * config.backoff_multiplier.powi(exponent);
    let capped = raw.min(config.max_delay_ms as f64);
    if capped.is_finite() && capped > 0.0 {
        capped
    } else {
        0.0
    }
}
