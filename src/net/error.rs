//! Error taxonomy for the HTTP execution core.

use thiserror::Error;

/// Failure kinds surfaced by [`crate::net::ApiClient`]. Fallback strategies
/// match on these kinds; anything unmatched propagates to the pipeline.
#[derive(Debug, Clone, Error)]
pub enum ApiError {
    /// Connection refused/reset, DNS failure.
    #[error("network error: {0}")]
    Network(String),

    /// Connect or read timeout exceeded.
    #[error("timeout: {0}")]
    Timeout(String),

    /// Non-success HTTP status. `retry_after` carries the parsed
    /// `Retry-After` header in seconds when present.
    #[error("HTTP {status}: {body}")]
    Http {
        status: u16,
        retry_after: Option<f64>,
        body: String,
    },

    /// Circuit open at call time; no network attempt was made.
    #[error("circuit open")]
    CircuitOpen,

    /// Upstream returned fewer items than expected with a continuation token.
    #[error("partial response: received {received} of {expected}")]
    Partial {
        received: usize,
        expected: usize,
        page_state: Option<String>,
    },

    /// Body could not be decoded as the expected payload.
    #[error("decode error: {0}")]
    Decode(String),
}

impl ApiError {
    /// Short label used in logs and fallback records.
    pub fn error_type(&self) -> &'static str {
        match self {
            ApiError::Network(_) => "network",
            ApiError::Timeout(_) => "timeout",
            ApiError::Http { .. } => "http",
            ApiError::CircuitOpen => "circuit_open",
            ApiError::Partial { .. } => "partial",
            ApiError::Decode(_) => "decode",
        }
    }

    pub fn http_status(&self) -> Option<u16> {
        match self {
            ApiError::Http { status, .. } => Some(*status),
            _ => None,
        }
    }

    pub fn retry_after_sec(&self) -> Option<f64> {
        match self {
            ApiError::Http { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}
