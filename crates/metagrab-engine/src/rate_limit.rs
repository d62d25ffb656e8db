use metagrab_metrics::EngineMetrics;
use metagrab_types::ScrapeError;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tracing::debug;

use crate::throttler::AdaptiveThrottler;

/// Configuration for the global request gate.
#[derive(Debug, Clone)]
pub struct RateLimiterConfig {
    /// Concurrency ceiling across all in-flight scrapes.
    pub max_concurrent: usize,
    /// Request budget per sliding window.
    pub max_requests_per_window: usize,
    /// Window length. One minute in production; tests compress it.
    pub window: Duration,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 6,
            max_requests_per_window: 30,
            window: Duration::from_secs(60),
        }
    }
}

/// Slot held for the duration of one scrape; returned on drop.
pub struct RatePermit {
    _permit: OwnedSemaphorePermit,
}

/// Global concurrency gate plus sliding-window request cap.
///
/// `acquire` suspends until both the semaphore admits and the window has
/// budget. While waiting out the window the concurrency slot is released so
/// unrelated traffic is not blocked, and re-acquired before returning.
/// Timestamps are appended on grant. Every forced wait is a rate-limit
/// signal for the throttler.
pub struct RateLimiter {
    semaphore: Arc<Semaphore>,
    window: Mutex<VecDeque<Instant>>,
    config: RateLimiterConfig,
    metrics: Option<Arc<EngineMetrics>>,
    throttler: Option<Arc<AdaptiveThrottler>>,
}

impl RateLimiter {
    pub fn new(config: RateLimiterConfig) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(config.max_concurrent)),
            window: Mutex::new(VecDeque::new()),
            config,
            metrics: None,
            throttler: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<EngineMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn with_throttler(mut self, throttler: Arc<AdaptiveThrottler>) -> Self {
        self.throttler = Some(throttler);
        self
    }

    pub async fn acquire(&self) -> Result<RatePermit, ScrapeError> {
        let mut permit = self.acquire_slot().await?;

        loop {
            let wait = {
                let mut window = self.window.lock().await;
                let now = Instant::now();
                while window
                    .front()
                    .is_some_and(|&t| now.duration_since(t) > self.config.window)
                {
                    window.pop_front();
                }

                if window.len() < self.config.max_requests_per_window.max(1) {
                    window.push_back(now);
                    None
                } else {
                    // Wait until the oldest grant falls out of the window.
                    match window.front() {
                        Some(&oldest) => Some(
                            self.config.window.saturating_sub(now.duration_since(oldest)),
                        ),
                        None => Some(self.config.window),
                    }
                }
            };

            match wait {
                None => return Ok(RatePermit { _permit: permit }),
                Some(delay) => {
                    debug!(delay_ms = delay.as_millis() as u64, "Request window full, waiting");
                    if let Some(m) = &self.metrics {
                        m.rate_limit_events_total.inc();
                    }
                    if let Some(t) = &self.throttler {
                        t.record_rate_limit_event();
                    }
                    // Free the concurrency slot while parked so the window
                    // wait does not starve unrelated traffic.
                    drop(permit);
                    tokio::time::sleep(delay + Duration::from_millis(50)).await;
                    permit = self.acquire_slot().await?;
                }
            }
        }
    }

    async fn acquire_slot(&self) -> Result<OwnedSemaphorePermit, ScrapeError> {
        self.semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|e| ScrapeError::Internal(format!("rate limiter semaphore closed: {e}")))
    }

    /// Free concurrency slots (diagnostics only).
    pub fn available_permits(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Grants inside the current window (diagnostics only).
    pub async fn window_len(&self) -> usize {
        let mut window = self.window.lock().await;
        let now = Instant::now();
        while window
            .front()
            .is_some_and(|&t| now.duration_since(t) > self.config.window)
        {
            window.pop_front();
        }
        window.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant as StdInstant;

    fn limiter(max_concurrent: usize, per_window: usize, window_ms: u64) -> RateLimiter {
        RateLimiter::new(RateLimiterConfig {
            max_concurrent,
            max_requests_per_window: per_window,
            window: Duration::from_millis(window_ms),
        })
    }

    #[tokio::test]
    async fn grants_within_budget_are_immediate() {
        let rl = limiter(4, 5, 60_000);
        let start = StdInstant::now();
        let mut permits = Vec::new();
        for _ in 0..4 {
            permits.push(rl.acquire().await.unwrap());
        }
        assert!(start.elapsed() < Duration::from_millis(500));
        assert_eq!(rl.window_len().await, 4);
    }

    #[tokio::test]
    async fn window_overflow_forces_wait_and_emits_event() {
        let metrics = Arc::new(EngineMetrics::new().unwrap());
        let rl = limiter(5, 2, 300).with_metrics(metrics.clone());

        let p1 = rl.acquire().await.unwrap();
        let p2 = rl.acquire().await.unwrap();
        drop(p1);
        drop(p2);

        let start = StdInstant::now();
        let _p3 = rl.acquire().await.unwrap();
        assert!(
            start.elapsed() >= Duration::from_millis(250),
            "third grant should wait out the window, waited {:?}",
            start.elapsed()
        );
        assert!(metrics.rate_limit_events_total.get() >= 1);
    }

    #[tokio::test]
    async fn window_never_exceeds_budget() {
        let rl = Arc::new(limiter(8, 3, 400));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let rl = rl.clone();
            handles.push(tokio::spawn(async move {
                let permit = rl.acquire().await.unwrap();
                let len = rl.window_len().await;
                drop(permit);
                len
            }));
        }
        for handle in handles {
            let observed = handle.await.unwrap();
            assert!(observed <= 3, "window held {observed} grants");
        }
    }

    #[tokio::test]
    async fn concurrency_slot_is_released_while_parked() {
        // Budget of 1 per long window, concurrency 1. After the first grant
        // returns its slot, a second acquire takes the slot, finds the
        // window full and parks — the slot must be free again while it
        // waits so unrelated traffic is not blocked.
        let rl = Arc::new(limiter(1, 1, 10_000));
        let p1 = rl.acquire().await.unwrap();
        drop(p1);

        let rl2 = rl.clone();
        let _waiter = tokio::spawn(async move { rl2.acquire().await });

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(rl.available_permits(), 1, "parked acquire must not hold the slot");
    }
}
