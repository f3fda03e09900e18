//! Request throttling shared by all workers of one client.
//!
//! The limiter enforces that any sliding window of `period` contains at most
//! `max_calls` dispatches. Waiters queue on a fair async mutex, so acquisition
//! order equals arrival order.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use rand::Rng;
use tokio::sync::Mutex;
use tracing::trace;

pub struct RateLimiter {
    max_calls: usize,
    period: Duration,
    jitter: f64,
    dispatched: Mutex<VecDeque<Instant>>,
}

impl RateLimiter {
    pub fn new(max_calls: u32, period_seconds: f64, jitter: f64) -> Self {
        Self {
            max_calls: max_calls.max(1) as usize,
            period: Duration::from_secs_f64(period_seconds.max(1e-3)),
            jitter: jitter.clamp(0.0, 1.0),
            dispatched: Mutex::new(VecDeque::new()),
        }
    }

    /// Block until a slot is available, then record the dispatch. The lock is
    /// held across the wait so callers are served FIFO.
    pub async fn acquire(&self) {
        let mut stamps = self.dispatched.lock().await;
        loop {
            let now = Instant::now();
            while let Some(front) = stamps.front() {
                if now.duration_since(*front) >= self.period {
                    stamps.pop_front();
                } else {
                    break;
                }
            }
            if stamps.len() < self.max_calls {
                stamps.push_back(now);
                return;
            }

            let oldest = *stamps.front().expect("non-empty at capacity");
            let mut wait = self.period.saturating_sub(now.duration_since(oldest));
            if self.jitter > 0.0 {
                let factor = 1.0 + rand::thread_rng().gen_range(0.0..self.jitter);
                wait = wait.mul_f64(factor);
            }
            trace!(wait_ms = wait.as_millis() as u64, "rate_limit_wait");
            tokio::time::sleep(wait).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_third_call_blocks_for_period() {
        let limiter = RateLimiter::new(2, 0.2, 0.0);
        let start = Instant::now();
        limiter.acquire().await;
        limiter.acquire().await;
        assert!(start.elapsed() < Duration::from_millis(50));

        limiter.acquire().await;
        let elapsed = start.elapsed();
        assert!(
            elapsed >= Duration::from_millis(180),
            "third call should wait ~period, waited {elapsed:?}"
        );
    }

    #[tokio::test]
    async fn test_sliding_window_never_exceeds_max() {
        let limiter = RateLimiter::new(3, 0.1, 0.0);
        let mut stamps = Vec::new();
        for _ in 0..9 {
            limiter.acquire().await;
            stamps.push(Instant::now());
        }
        for window_start in 0..stamps.len() {
            let in_window = stamps
                .iter()
                .filter(|s| {
                    **s >= stamps[window_start]
                        && s.duration_since(stamps[window_start]) < Duration::from_millis(95)
                })
                .count();
            assert!(in_window <= 3, "window had {in_window} dispatches");
        }
    }
}
