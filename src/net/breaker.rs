//! Per-client circuit breaker.
//!
//! State machine: closed -> open -> half-open -> closed. While open, every
//! call fails immediately without a network attempt. Check-and-transition is
//! atomic under one mutex.

use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::warn;

use crate::config::BreakerSettings;

use super::error::ApiError;

#[derive(Debug, Clone, Copy, PartialEq)]
enum State {
    Closed { failures: u32 },
    Open { since: Instant },
    HalfOpen,
}

pub struct CircuitBreaker {
    failure_threshold: u32,
    timeout: Duration,
    state: Mutex<State>,
}

impl CircuitBreaker {
    pub fn from_settings(settings: &BreakerSettings) -> Self {
        Self {
            failure_threshold: settings.failure_threshold.max(1),
            timeout: Duration::from_secs_f64(settings.timeout_seconds.max(0.0)),
            state: Mutex::new(State::Closed { failures: 0 }),
        }
    }

    /// Gate a call attempt. An open breaker past its timeout transitions to
    /// half-open and admits exactly this caller as the probe.
    pub fn check(&self) -> Result<(), ApiError> {
        let mut state = self.state.lock();
        match *state {
            State::Closed { .. } | State::HalfOpen => Ok(()),
            State::Open { since } => {
                if since.elapsed() >= self.timeout {
                    *state = State::HalfOpen;
                    Ok(())
                } else {
                    Err(ApiError::CircuitOpen)
                }
            }
        }
    }

    pub fn record_success(&self) {
        let mut state = self.state.lock();
        *state = State::Closed { failures: 0 };
    }

    pub fn record_failure(&self) {
        let mut state = self.state.lock();
        match *state {
            State::Closed { failures } => {
                let failures = failures + 1;
                if failures >= self.failure_threshold {
                    warn!(failures, "circuit_opened");
                    *state = State::Open {
                        since: Instant::now(),
                    };
                } else {
                    *state = State::Closed { failures };
                }
            }
            State::HalfOpen => {
                warn!("circuit_reopened_from_half_open");
                *state = State::Open {
                    since: Instant::now(),
                };
            }
            State::Open { .. } => {}
        }
    }

    pub fn is_open(&self) -> bool {
        matches!(*self.state.lock(), State::Open { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(threshold: u32, timeout_seconds: f64) -> CircuitBreaker {
        CircuitBreaker::from_settings(&BreakerSettings {
            failure_threshold: threshold,
            timeout_seconds,
        })
    }

    #[test]
    fn test_opens_at_threshold() {
        let breaker = breaker(3, 60.0);
        breaker.record_failure();
        breaker.record_failure();
        assert!(breaker.check().is_ok());
        breaker.record_failure();
        assert!(matches!(breaker.check(), Err(ApiError::CircuitOpen)));
    }

    #[test]
    fn test_success_resets_consecutive_count() {
        let breaker = breaker(3, 60.0);
        breaker.record_failure();
        breaker.record_failure();
        breaker.record_success();
        breaker.record_failure();
        breaker.record_failure();
        assert!(breaker.check().is_ok());
    }

    #[test]
    fn test_half_open_probe_then_close() {
        let breaker = breaker(1, 0.05);
        breaker.record_failure();
        assert!(breaker.check().is_err());

        std::thread::sleep(Duration::from_millis(80));
        // First caller after the timeout becomes the probe.
        assert!(breaker.check().is_ok());
        breaker.record_success();
        assert!(breaker.check().is_ok());
        assert!(!breaker.is_open());
    }

    #[test]
    fn test_half_open_failure_reopens() {
        let breaker = breaker(1, 0.05);
        breaker.record_failure();
        std::thread::sleep(Duration::from_millis(80));
        assert!(breaker.check().is_ok());
        breaker.record_failure();
        assert!(matches!(breaker.check(), Err(ApiError::CircuitOpen)));
    }
}
