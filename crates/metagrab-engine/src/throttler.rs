use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::time::{Duration, Instant};
use tracing::debug;

use crate::signals::{Ewma, ZScoreDetector};

/// Why the throttler is currently delaying submissions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ThrottleReason {
    NavigationLatency,
    CacheMissRate,
    RateLimit,
    MemoryHigh,
    None,
}

/// Thresholds and window sizes for the adaptive throttler.
#[derive(Debug, Clone)]
pub struct ThrottlerConfig {
    /// Delay floor.
    pub base_delay: Duration,
    /// Delay ceiling.
    pub max_delay: Duration,
    /// Mean navigation time (seconds) above which the latency rule fires.
    pub latency_threshold: f64,
    /// Cache miss fraction above which the miss rule fires.
    pub miss_rate_threshold: f64,
    /// Browser memory (MB) above which the memory rule fires.
    pub memory_threshold_mb: f64,
    pub duration_window: usize,
    pub event_window: usize,
    pub memory_window: usize,
    /// Rate-limit events per minute considered a sustained storm.
    pub high_rate_limit_per_minute: usize,
}

impl Default for ThrottlerConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(50),
            max_delay: Duration::from_secs(3),
            latency_threshold: 2.0,
            miss_rate_threshold: 0.6,
            memory_threshold_mb: 800.0,
            duration_window: 15,
            event_window: 20,
            memory_window: 8,
            high_rate_limit_per_minute: 10,
        }
    }
}

struct ThrottlerState {
    navigation_durations: VecDeque<f64>,
    cache_miss_events: VecDeque<bool>,
    rate_limit_events: VecDeque<Instant>,
    memory_samples: VecDeque<f64>,
    /// Current per-submission delay, seconds.
    current_delay: f64,
    multiplier: f64,
    /// Delay is held at its level until this deadline, then decays.
    hold_until: Instant,
    reason: ThrottleReason,
    latency_ewma: Ewma,
    latency_z: ZScoreDetector,
    rate_limit_z: ZScoreDetector,
}

/// Snapshot for the admin surface.
#[derive(Debug, Clone, Serialize)]
pub struct ThrottlerStatus {
    pub current_delay_ms: u64,
    pub reason: ThrottleReason,
    pub multiplier: f64,
    pub recent_navigation_avg: f64,
    pub recent_miss_rate: f64,
    pub rate_limit_events_last_minute: usize,
}

/// Adaptive submission throttler.
///
/// Watches rolling windows of navigation latency, cache misses, rate-limit
/// events and memory samples; raises the per-submission delay when any rule
/// fires (the maximum wins), holds it for 3x its own duration and then
/// decays geometrically toward the floor. EWMA and z-score filtering keep
/// one-off blips from triggering the latency and storm rules.
pub struct AdaptiveThrottler {
    state: Mutex<ThrottlerState>,
    config: ThrottlerConfig,
}

impl AdaptiveThrottler {
    pub fn new(config: ThrottlerConfig) -> Self {
        let state = ThrottlerState {
            navigation_durations: VecDeque::new(),
            cache_miss_events: VecDeque::new(),
            rate_limit_events: VecDeque::new(),
            memory_samples: VecDeque::new(),
            current_delay: config.base_delay.as_secs_f64(),
            multiplier: 1.0,
            hold_until: Instant::now(),
            reason: ThrottleReason::None,
            latency_ewma: Ewma::new(0.3),
            latency_z: ZScoreDetector::new(50, 2.0),
            rate_limit_z: ZScoreDetector::new(50, 2.0),
        };
        Self {
            state: Mutex::new(state),
            config,
        }
    }

    /// Record a navigation duration (seconds). The latency rule fires on
    /// the smoothed (EWMA) navigation time, so a single slow load does not
    /// throttle the whole engine: delay = base * (1 + ln(ewma / threshold)).
    pub fn update_navigation_time(&self, secs: f64) -> Duration {
        let mut state = self.state.lock();
        push_bounded(
            &mut state.navigation_durations,
            secs,
            self.config.duration_window,
        );
        let smoothed = state.latency_ewma.update(secs);
        let (z, spike) = state.latency_z.update(secs);
        if spike {
            debug!(navigation_secs = secs, z, "Navigation latency spike");
        }

        if smoothed > self.config.latency_threshold {
            let factor = 1.0 + (smoothed / self.config.latency_threshold).max(1.0).ln();
            let suggested = self.config.base_delay.as_secs_f64() * factor;
            self.apply(&mut state, suggested, ThrottleReason::NavigationLatency);
        }
        Duration::from_secs_f64(state.current_delay)
    }

    /// Record a cache lookup. Fires the miss-rate rule when the recent miss
    /// fraction climbs past the threshold.
    pub fn update_cache_stats(&self, hit: bool) -> Duration {
        let mut state = self.state.lock();
        push_bounded(
            &mut state.cache_miss_events,
            !hit,
            self.config.event_window,
        );

        let misses = state.cache_miss_events.iter().filter(|m| **m).count();
        let rate = misses as f64 / state.cache_miss_events.len() as f64;
        if rate > self.config.miss_rate_threshold {
            let factor = 1.0 + (rate / self.config.miss_rate_threshold).max(1.0).ln();
            let suggested = self.config.base_delay.as_secs_f64() * factor;
            self.apply(&mut state, suggested, ThrottleReason::CacheMissRate);
        }
        Duration::from_secs_f64(state.current_delay)
    }

    /// Record a rate-limit event. Every event escalates the internal
    /// multiplier (x1.5, capped at 10) and re-applies delay = base *
    /// multiplier, so consecutive events strictly raise the delay until the
    /// ceiling.
    pub fn record_rate_limit_event(&self) -> Duration {
        let mut state = self.state.lock();
        let now = Instant::now();
        state.rate_limit_events.push_back(now);
        while state
            .rate_limit_events
            .front()
            .is_some_and(|&t| now.duration_since(t) > Duration::from_secs(60))
        {
            state.rate_limit_events.pop_front();
        }

        let per_minute = state.rate_limit_events.len();
        let (_, spike) = state.rate_limit_z.update(per_minute as f64);
        if spike || per_minute > self.config.high_rate_limit_per_minute {
            debug!(per_minute, "Sustained rate-limit pressure detected");
        }

        state.multiplier = (state.multiplier * 1.5).min(10.0);
        let suggested = self.config.base_delay.as_secs_f64() * state.multiplier;
        self.apply(&mut state, suggested, ThrottleReason::RateLimit);
        Duration::from_secs_f64(state.current_delay)
    }

    /// Record an externally sampled browser memory reading (MB).
    pub fn update_memory_usage(&self, memory_mb: f64) -> Duration {
        let mut state = self.state.lock();
        push_bounded(
            &mut state.memory_samples,
            memory_mb,
            self.config.memory_window,
        );
        if memory_mb > self.config.memory_threshold_mb {
            let suggested = self.config.base_delay.as_secs_f64() * 2.0;
            self.apply(&mut state, suggested, ThrottleReason::MemoryHigh);
        }
        Duration::from_secs_f64(state.current_delay)
    }

    /// Current per-submission delay, applying decay once the hold period
    /// has passed. The multiplier also relaxes on polls without events.
    pub fn current_delay(&self) -> Duration {
        let mut state = self.state.lock();
        let now = Instant::now();
        let base = self.config.base_delay.as_secs_f64();

        if now > state.hold_until {
            if state.current_delay > base {
                state.current_delay = (state.current_delay * 0.95).max(base);
            }
            let quiet = state
                .rate_limit_events
                .back()
                .map(|&t| now.duration_since(t) > Duration::from_secs(60))
                .unwrap_or(true);
            if quiet && state.multiplier > 1.0 {
                state.multiplier = (state.multiplier * 0.95).max(1.0);
            }
            if state.current_delay <= base {
                state.reason = ThrottleReason::None;
            }
        }
        Duration::from_secs_f64(state.current_delay)
    }

    pub fn status(&self) -> ThrottlerStatus {
        let state = self.state.lock();
        let misses = state.cache_miss_events.iter().filter(|m| **m).count();
        let miss_rate = if state.cache_miss_events.is_empty() {
            0.0
        } else {
            misses as f64 / state.cache_miss_events.len() as f64
        };
        ThrottlerStatus {
            current_delay_ms: (state.current_delay * 1000.0) as u64,
            reason: state.reason,
            multiplier: state.multiplier,
            recent_navigation_avg: mean(&state.navigation_durations),
            recent_miss_rate: miss_rate,
            rate_limit_events_last_minute: state.rate_limit_events.len(),
        }
    }

    /// Raise (never lower) the delay and hold it for 3x its duration.
    fn apply(&self, state: &mut ThrottlerState, suggested: f64, reason: ThrottleReason) {
        let capped = suggested.min(self.config.max_delay.as_secs_f64());
        if capped >= state.current_delay {
            state.current_delay = capped;
            state.reason = reason;
            state.hold_until = Instant::now() + Duration::from_secs_f64(capped * 3.0);
        }
    }
}

fn push_bounded<T>(window: &mut VecDeque<T>, value: T, cap: usize) {
    if window.len() == cap {
        window.pop_front();
    }
    window.push_back(value);
}

fn mean(values: &VecDeque<f64>) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn throttler() -> AdaptiveThrottler {
        AdaptiveThrottler::new(ThrottlerConfig::default())
    }

    #[test]
    fn starts_at_base_delay() {
        let t = throttler();
        assert_eq!(t.current_delay(), Duration::from_millis(50));
    }

    #[test]
    fn rate_limit_event_strictly_increases_delay() {
        let t = throttler();
        let mut previous = t.current_delay();
        for _ in 0..5 {
            let next = t.record_rate_limit_event();
            assert!(next > previous, "delay must rise on every event");
            previous = next;
        }
    }

    #[test]
    fn multiplier_caps_at_ten() {
        let t = throttler();
        for _ in 0..30 {
            t.record_rate_limit_event();
        }
        let status = t.status();
        assert!(status.multiplier <= 10.0);
        // base 50ms * 10 = 500ms, still under the 3s ceiling
        assert_eq!(status.current_delay_ms, 500);
    }

    #[test]
    fn delay_never_exceeds_ceiling() {
        let t = AdaptiveThrottler::new(ThrottlerConfig {
            base_delay: Duration::from_millis(500),
            ..Default::default()
        });
        for _ in 0..30 {
            t.record_rate_limit_event();
        }
        assert!(t.current_delay() <= Duration::from_secs(3));
    }

    #[test]
    fn slow_navigation_raises_delay() {
        let t = throttler();
        for _ in 0..10 {
            t.update_navigation_time(5.0);
        }
        assert!(t.current_delay() > Duration::from_millis(50));
        assert_eq!(t.status().reason, ThrottleReason::NavigationLatency);
    }

    #[test]
    fn fast_navigation_keeps_base_delay() {
        let t = throttler();
        for _ in 0..10 {
            t.update_navigation_time(0.3);
        }
        assert_eq!(t.current_delay(), Duration::from_millis(50));
    }

    #[test]
    fn high_miss_rate_raises_delay() {
        let t = throttler();
        for _ in 0..20 {
            t.update_cache_stats(false);
        }
        assert!(t.current_delay() > Duration::from_millis(50));
        assert_eq!(t.status().reason, ThrottleReason::CacheMissRate);
    }

    #[test]
    fn memory_pressure_doubles_base() {
        let t = throttler();
        t.update_memory_usage(900.0);
        assert_eq!(t.current_delay(), Duration::from_millis(100));
        assert_eq!(t.status().reason, ThrottleReason::MemoryHigh);
    }

    #[test]
    fn delay_decays_after_hold_period() {
        let t = AdaptiveThrottler::new(ThrottlerConfig {
            base_delay: Duration::from_millis(1),
            ..Default::default()
        });
        t.record_rate_limit_event();
        let raised = t.current_delay();
        assert!(raised > Duration::from_millis(1));

        // hold is 3x the (tiny) delay; after it passes, repeated polls decay
        // geometrically toward the base
        std::thread::sleep(Duration::from_millis(20));
        let mut last = raised;
        for _ in 0..200 {
            last = t.current_delay();
        }
        assert!(last < raised);
    }
}
