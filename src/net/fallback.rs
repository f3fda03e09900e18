//! Fallback strategies applied after retries exhaust or the breaker opens.
//!
//! A matched strategy converts the failure into data: either a replay of the
//! last good payload (`cache`) or a deterministic marker row carrying the
//! `fallback_*` columns. Unmatched failures propagate as errors.

use std::str::FromStr;

use crate::frame::{Record, Scalar};

use super::error::ApiError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FallbackStrategy {
    Cache,
    Network,
    Timeout,
    FiveXx,
    Partial,
}

impl FallbackStrategy {
    pub fn label(&self) -> &'static str {
        match self {
            FallbackStrategy::Cache => "cache",
            FallbackStrategy::Network => "network",
            FallbackStrategy::Timeout => "timeout",
            FallbackStrategy::FiveXx => "5xx",
            FallbackStrategy::Partial => "partial",
        }
    }

    fn matches(&self, error: &ApiError) -> bool {
        match self {
            FallbackStrategy::Cache => !matches!(error, ApiError::Partial { .. }),
            FallbackStrategy::Network => {
                matches!(error, ApiError::Network(_) | ApiError::CircuitOpen)
            }
            FallbackStrategy::Timeout => matches!(error, ApiError::Timeout(_)),
            FallbackStrategy::FiveXx => {
                matches!(error, ApiError::Http { status, .. } if (500..600).contains(status))
            }
            FallbackStrategy::Partial => matches!(error, ApiError::Partial { .. }),
        }
    }
}

impl FromStr for FallbackStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "cache" => Ok(FallbackStrategy::Cache),
            "network" => Ok(FallbackStrategy::Network),
            "timeout" => Ok(FallbackStrategy::Timeout),
            "5xx" => Ok(FallbackStrategy::FiveXx),
            "partial" => Ok(FallbackStrategy::Partial),
            other => Err(format!("unknown fallback strategy: {other}")),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct FallbackManager {
    strategies: Vec<FallbackStrategy>,
}

impl FallbackManager {
    pub fn new(strategies: Vec<FallbackStrategy>) -> Self {
        Self { strategies }
    }

    pub fn from_labels(labels: &[String]) -> Self {
        let strategies = labels
            .iter()
            .filter_map(|label| FallbackStrategy::from_str(label).ok())
            .collect();
        Self { strategies }
    }

    pub fn is_empty(&self) -> bool {
        self.strategies.is_empty()
    }

    /// First configured strategy that matches the error, if any.
    pub fn strategy_for(&self, error: &ApiError) -> Option<FallbackStrategy> {
        self.strategies.iter().copied().find(|s| s.matches(error))
    }

    /// All matching strategies in configured order; used when an earlier
    /// strategy (cache without a stored payload) cannot produce data.
    pub fn strategies_for(&self, error: &ApiError) -> Vec<FallbackStrategy> {
        self.strategies
            .iter()
            .copied()
            .filter(|s| s.matches(error))
            .collect()
    }
}

/// Everything a fallback row needs to describe the failure it replaces.
#[derive(Debug, Clone)]
pub struct FallbackInfo {
    pub reason: String,
    pub error_type: String,
    pub http_status: Option<u16>,
    pub retry_after_sec: Option<f64>,
    pub attempt: u32,
}

impl FallbackInfo {
    pub fn from_error(strategy: FallbackStrategy, error: &ApiError, attempt: u32) -> Self {
        Self {
            reason: strategy.label().to_string(),
            error_type: error.error_type().to_string(),
            http_status: error.http_status(),
            retry_after_sec: error.retry_after_sec(),
            attempt,
        }
    }

    /// Shape a marker row: the business key is populated so the row sorts
    /// deterministically with the rest; every other business column is null.
    pub fn into_record(self, id_column: &str, id_value: Scalar, timestamp: &str) -> Record {
        let mut record = Record::new();
        record.set(id_column, id_value);
        record.set("fallback_reason", Scalar::String(self.reason));
        record.set("fallback_error_type", Scalar::String(self.error_type));
        record.set(
            "fallback_http_status",
            self.http_status
                .map_or(Scalar::Null, |s| Scalar::Int(i64::from(s))),
        );
        record.set(
            "fallback_retry_after_sec",
            self.retry_after_sec.map_or(Scalar::Null, Scalar::Float),
        );
        record.set("fallback_attempt", Scalar::Int(i64::from(self.attempt)));
        record.set("fallback_timestamp", Scalar::String(timestamp.to_string()));
        record
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn http_error(status: u16, retry_after: Option<f64>) -> ApiError {
        ApiError::Http {
            status,
            retry_after,
            body: String::new(),
        }
    }

    #[test]
    fn test_strategies_match_in_configured_order() {
        let manager = FallbackManager::from_labels(&[
            "cache".to_string(),
            "5xx".to_string(),
        ]);
        assert_eq!(
            manager.strategy_for(&http_error(503, None)),
            Some(FallbackStrategy::Cache)
        );

        let manager = FallbackManager::from_labels(&["5xx".to_string()]);
        assert_eq!(
            manager.strategy_for(&http_error(503, None)),
            Some(FallbackStrategy::FiveXx)
        );
        assert_eq!(manager.strategy_for(&http_error(404, None)), None);
    }

    #[test]
    fn test_circuit_open_matches_network() {
        let manager = FallbackManager::from_labels(&["network".to_string()]);
        assert_eq!(
            manager.strategy_for(&ApiError::CircuitOpen),
            Some(FallbackStrategy::Network)
        );
    }

    #[test]
    fn test_fallback_record_shape() {
        let error = http_error(503, Some(7.0));
        let info = FallbackInfo::from_error(FallbackStrategy::FiveXx, &error, 4);
        let record = info.into_record(
            "activity_id",
            Scalar::Int(123),
            "2024-01-01T00:00:00Z",
        );
        assert_eq!(record.get("activity_id"), Some(&Scalar::Int(123)));
        assert_eq!(
            record.get("fallback_reason"),
            Some(&Scalar::String("5xx".into()))
        );
        assert_eq!(record.get("fallback_http_status"), Some(&Scalar::Int(503)));
        assert_eq!(
            record.get("fallback_retry_after_sec"),
            Some(&Scalar::Float(7.0))
        );
        assert_eq!(record.get("fallback_attempt"), Some(&Scalar::Int(4)));
    }
}
