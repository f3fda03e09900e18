//! Retry policy: which failures retry, and how long to wait between attempts.

use std::collections::HashSet;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::config::RetrySettings;

use super::error::ApiError;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub total: u32,
    backoff_factor: f64,
    backoff_max: f64,
    statuses: HashSet<u16>,
}

impl RetryPolicy {
    pub fn from_settings(settings: &RetrySettings) -> Self {
        Self {
            total: settings.total,
            backoff_factor: settings.backoff_factor,
            backoff_max: settings.backoff_max,
            statuses: settings.statuses.iter().copied().collect(),
        }
    }

    /// Network and timeout failures retry up to `total`; HTTP failures retry
    /// only for the configured statuses. A 4xx other than 429 never retries,
    /// and an open circuit aborts immediately.
    pub fn is_retryable(&self, error: &ApiError) -> bool {
        match error {
            ApiError::Network(_) | ApiError::Timeout(_) => true,
            ApiError::Http { status, .. } => self.statuses.contains(status),
            ApiError::CircuitOpen => false,
            ApiError::Partial { .. } => false,
            ApiError::Decode(_) => false,
        }
    }

    /// Wait before attempt `attempt` (0-based count of completed attempts).
    /// A `Retry-After` value overrides the computed backoff.
    pub fn backoff_delay(&self, attempt: u32, retry_after: Option<f64>) -> Duration {
        if let Some(seconds) = retry_after {
            return Duration::from_secs_f64(seconds.max(0.0));
        }
        let wait = self
            .backoff_factor
            .powi(attempt as i32)
            .min(self.backoff_max)
            .max(0.0);
        Duration::from_secs_f64(wait)
    }
}

/// Parse a `Retry-After` header value: numeric seconds or an HTTP-date.
/// Results clamp to >= 0.
pub fn parse_retry_after(value: &str) -> Option<f64> {
    let trimmed = value.trim();
    if let Ok(seconds) = trimmed.parse::<f64>() {
        return Some(seconds.max(0.0));
    }
    let date: DateTime<Utc> = DateTime::parse_from_rfc2822(trimmed).ok()?.into();
    let delta = (date - Utc::now()).num_milliseconds() as f64 / 1000.0;
    Some(delta.max(0.0))
}
