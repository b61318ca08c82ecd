use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::Method;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::config::duration_secs;

const DEFAULT_MAX_ATTEMPTS: u32 = 4;
const DEFAULT_BACKOFF_FACTOR: Duration = Duration::from_millis(1500);
const DEFAULT_BACKOFF_MAX: Duration = Duration::from_secs(120);
const DEFAULT_RETRY_STATUSES: [u16; 5] = [429, 500, 502, 503, 504];
const DEFAULT_RETRY_METHODS: [&str; 6] = ["GET", "HEAD", "PUT", "DELETE", "OPTIONS", "POST"];

/// Retry behaviour applied to every outbound call. Nothing persists between
/// calls.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts, the first call included.
    pub max_attempts: u32,
    /// The n-th retry sleeps `backoff_factor * 2^(n-1)`.
    #[serde(with = "duration_secs")]
    pub backoff_factor: Duration,
    #[serde(with = "duration_secs")]
    pub backoff_max: Duration,
    pub retry_statuses: Vec<u16>,
    /// Retry on every non-2xx status, not only `retry_statuses`.
    pub retry_on_any_error_status: bool,
    pub methods: Vec<String>,
    /// Use the server's `Retry-After` (seconds) on 429/503 when present.
    pub respect_retry_after: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            backoff_factor: DEFAULT_BACKOFF_FACTOR,
            backoff_max: DEFAULT_BACKOFF_MAX,
            retry_statuses: DEFAULT_RETRY_STATUSES.to_vec(),
            retry_on_any_error_status: false,
            methods: DEFAULT_RETRY_METHODS.iter().map(|m| m.to_string()).collect(),
            respect_retry_after: true,
        }
    }
}

impl RetryPolicy {
    /// A single attempt, no retries.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_backoff_factor(mut self, factor: Duration) -> Self {
        self.backoff_factor = factor;
        self
    }

    /// Attempts allowed for `method`; at least one.
    pub fn attempts_for(&self, method: &Method) -> u32 {
        if self.allows_method(method) {
            self.max_attempts.max(1)
        } else {
            1
        }
    }

    pub fn allows_method(&self, method: &Method) -> bool {
        self.methods
            .iter()
            .any(|m| m.eq_ignore_ascii_case(method.as_str()))
    }

    pub fn should_retry_status(&self, status: u16) -> bool {
        let is_error = !(200..300).contains(&status);
        (self.retry_on_any_error_status && is_error) || self.retry_statuses.contains(&status)
    }

    /// Sleep before retry number `retry` (1-based).
    pub fn backoff(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(31);
        self.backoff_factor
            .saturating_mul(1u32 << exponent)
            .min(self.backoff_max)
    }

    /// Delay requested by the server, if honoured for this status.
    pub fn retry_after(&self, status: u16, headers: &HeaderMap) -> Option<Duration> {
        if !self.respect_retry_after || !matches!(status, 429 | 503) {
            return None;
        }
        headers
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map(|secs| Duration::from_secs(secs).min(self.backoff_max))
    }
}
