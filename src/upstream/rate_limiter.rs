//! Sliding window admission control for outbound upstream calls.
//!
//! Every HTTP attempt against the aggregator, retries included, passes
//! through [`RateLimiter::consume`] exactly once.

use std::collections::VecDeque;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

/// Configuration for the sliding window limiter.
#[derive(Debug, Clone)]
pub struct RateLimiterConfig {
    /// Maximum admitted calls inside any trailing window
    pub limit: usize,
    /// Window duration
    pub window: Duration,
    /// Lower bound on a single wait, to avoid spinning on nearly expired entries
    pub min_sleep: Duration,
    /// Whether limiting is enabled
    pub enabled: bool,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            limit: 5,
            window: Duration::from_secs(5),
            min_sleep: Duration::from_millis(50),
            enabled: true,
        }
    }
}

/// Current window usage.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RateWindowStats {
    pub admitted_in_window: usize,
    pub limit: usize,
    pub window: Duration,
}

/// Sliding window limiter shared by every upstream caller.
///
/// Waiters are admitted in the order their blocking entries age out, so no
/// separate queue is kept.
pub struct RateLimiter {
    admitted: Mutex<VecDeque<Instant>>,
    config: RateLimiterConfig,
}

impl RateLimiter {
    pub fn new(config: RateLimiterConfig) -> Self {
        Self {
            admitted: Mutex::new(VecDeque::new()),
            config,
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(RateLimiterConfig::default())
    }

    /// A limiter that admits everything.
    pub fn unlimited() -> Self {
        Self::new(RateLimiterConfig {
            enabled: false,
            ..Default::default()
        })
    }

    fn prune(admitted: &mut VecDeque<Instant>, now: Instant, window: Duration) {
        while let Some(front) = admitted.front() {
            if now.duration_since(*front) >= window {
                admitted.pop_front();
            } else {
                break;
            }
        }
    }

    /// Suspend until a slot is free, then record the call.
    pub async fn consume(&self) {
        if !self.config.enabled || self.config.limit == 0 {
            return;
        }

        loop {
            let wait = {
                let mut admitted = self.admitted.lock().await;
                let now = Instant::now();
                Self::prune(&mut admitted, now, self.config.window);

                if admitted.len() < self.config.limit {
                    admitted.push_back(now);
                    return;
                }

                // Full window: the oldest entry is the first to leave it.
                let oldest = admitted.front().copied().unwrap_or(now);
                (oldest + self.config.window)
                    .saturating_duration_since(now)
                    .max(self.config.min_sleep)
            };

            debug!("Rate limit reached, waiting {:?}", wait);
            tokio::time::sleep(wait).await;
        }
    }

    /// Get current window usage.
    pub async fn stats(&self) -> RateWindowStats {
        let mut admitted = self.admitted.lock().await;
        Self::prune(&mut admitted, Instant::now(), self.config.window);
        RateWindowStats {
            admitted_in_window: admitted.len(),
            limit: self.config.limit,
            window: self.config.window,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn limiter(limit: usize, window_ms: u64) -> RateLimiter {
        RateLimiter::new(RateLimiterConfig {
            limit,
            window: Duration::from_millis(window_ms),
            min_sleep: Duration::from_millis(10),
            enabled: true,
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_admits_immediately_under_limit() {
        let limiter = limiter(3, 1000);
        let start = Instant::now();
        for _ in 0..3 {
            limiter.consume().await;
        }
        assert_eq!(Instant::now(), start);
        assert_eq!(limiter.stats().await.admitted_in_window, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_blocks_until_oldest_ages_out() {
        let limiter = limiter(2, 1000);
        let start = Instant::now();
        limiter.consume().await;
        limiter.consume().await;
        limiter.consume().await;
        assert!(Instant::now().duration_since(start) >= Duration::from_millis(1000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_never_exceeds_limit_under_contention() {
        let limiter = Arc::new(limiter(3, 500));
        let admitted = Arc::new(std::sync::Mutex::new(Vec::new()));

        let mut handles = Vec::new();
        for _ in 0..12 {
            let limiter = limiter.clone();
            let admitted = admitted.clone();
            handles.push(tokio::spawn(async move {
                limiter.consume().await;
                admitted.lock().unwrap().push(Instant::now());
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let mut times = admitted.lock().unwrap().clone();
        times.sort();
        assert_eq!(times.len(), 12);
        // Any 4 consecutive admissions must span at least one full window.
        for pair in times.windows(4) {
            assert!(pair[3].duration_since(pair[0]) >= Duration::from_millis(500));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_disabled_limiter_never_waits() {
        let limiter = RateLimiter::unlimited();
        let start = Instant::now();
        for _ in 0..100 {
            limiter.consume().await;
        }
        assert_eq!(Instant::now(), start);
    }
}
