use chrono::{DateTime, Utc};
use metagrab_types::Mode;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};
use tracing::info;

/// Thresholds and cooldowns for worker auto-scaling.
#[derive(Debug, Clone)]
pub struct ScalerConfig {
    pub min_workers: usize,
    pub max_workers: usize,
    /// P90 queue wait (seconds) that triggers a scale-up.
    pub scale_up_threshold: f64,
    /// P90 queue wait (seconds) below which scale-down is considered.
    pub scale_down_threshold: f64,
    /// Any mode's queue length at or above this triggers a scale-up.
    pub queue_up_threshold: usize,
    /// All queue lengths at or below this allow a scale-down.
    pub queue_down_threshold: usize,
    /// Rolling window of recent wait times per mode.
    pub window: usize,
    /// Minimum samples before the wait-time rules apply.
    pub min_samples: usize,
    /// Cooldown between scaling actions.
    pub cooldown: Duration,
    /// Worker memory (MB) that marks it for restart.
    pub memory_threshold_mb: f64,
    /// Cooldown between memory restarts.
    pub restart_cooldown: Duration,
}

impl Default for ScalerConfig {
    fn default() -> Self {
        Self {
            min_workers: 1,
            max_workers: 10,
            scale_up_threshold: 1.0,
            scale_down_threshold: 0.2,
            queue_up_threshold: 10,
            queue_down_threshold: 3,
            window: 50,
            min_samples: 10,
            cooldown: Duration::from_secs(30),
            memory_threshold_mb: 800.0,
            restart_cooldown: Duration::from_secs(300),
        }
    }
}

/// Decision produced by [`WorkerScaler::decide`]; the worker pool carries
/// it out.
#[derive(Debug, Clone, PartialEq)]
pub enum ScalingAction {
    ScaleUp,
    ScaleDown,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScalingEvent {
    pub timestamp: DateTime<Utc>,
    pub action: String,
    pub from_workers: usize,
    pub to_workers: usize,
    pub reason: String,
}

/// Status snapshot for the scaling admin routes.
#[derive(Debug, Clone, Serialize)]
pub struct ScalingStatus {
    pub current_workers: usize,
    pub suggested_workers: usize,
    pub p50_queue_wait: f64,
    pub p90_queue_wait: f64,
    pub queue_lengths_by_mode: HashMap<String, usize>,
    pub total_queue_length: usize,
    pub should_scale_up: bool,
    pub should_scale_down: bool,
    pub can_scale_now: bool,
    pub cooldown_remaining_secs: f64,
    pub is_scaling_up_mode: bool,
    pub is_scaling_down_mode: bool,
    pub memory_usage_mb: HashMap<String, f64>,
    pub high_memory_workers: Vec<String>,
    pub recent_events: Vec<ScalingEvent>,
}

struct ScalerState {
    wait_times: HashMap<Mode, VecDeque<f64>>,
    queue_lengths: HashMap<Mode, usize>,
    memory_mb: HashMap<String, f64>,
    current_workers: usize,
    last_action: Option<Instant>,
    last_restart: Option<Instant>,
    scaling_up_mode: bool,
    scaling_down_mode: bool,
    history: VecDeque<ScalingEvent>,
}

/// Auto-scaler for the worker pool.
///
/// Scale up on high P90 queue wait or a long queue in any mode; scale down
/// only when both wait and all queue lengths are low. Hysteresis mode flags
/// and a cooldown prevent ping-pong; memory restarts have their own, longer
/// cooldown. The scaler only decides — the pool executes.
pub struct WorkerScaler {
    state: Mutex<ScalerState>,
    config: ScalerConfig,
}

impl WorkerScaler {
    pub fn new(config: ScalerConfig) -> Self {
        let state = ScalerState {
            wait_times: HashMap::new(),
            queue_lengths: HashMap::new(),
            memory_mb: HashMap::new(),
            current_workers: config.min_workers,
            // None = no action yet, so the first one is never cooled down
            last_action: None,
            last_restart: None,
            scaling_up_mode: false,
            scaling_down_mode: false,
            history: VecDeque::new(),
        };
        Self {
            state: Mutex::new(state),
            config,
        }
    }

    pub fn add_queue_wait_time(&self, wait_secs: f64, mode: Mode) {
        let mut state = self.state.lock();
        let window = state.wait_times.entry(mode).or_default();
        if window.len() == self.config.window {
            window.pop_front();
        }
        window.push_back(wait_secs);
    }

    pub fn update_queue_length(&self, length: usize, mode: Mode) {
        self.state.lock().queue_lengths.insert(mode, length);
    }

    /// Memory is an external signal reported per worker by the embedder.
    pub fn update_memory_usage(&self, memory_mb: f64, worker_id: &str) {
        self.state
            .lock()
            .memory_mb
            .insert(worker_id.to_string(), memory_mb);
    }

    /// The pool reports the worker count it actually achieved.
    pub fn set_current_workers(&self, count: usize) {
        self.state.lock().current_workers = count;
    }

    pub fn current_workers(&self) -> usize {
        self.state.lock().current_workers
    }

    /// Evaluate the scaling rules. At most one action per cooldown window.
    pub fn decide(&self) -> Option<ScalingAction> {
        let mut state = self.state.lock();
        let now = Instant::now();

        let waits = combined_waits(&state.wait_times, self.config.window);
        let p90 = percentile(&waits, 90.0);
        let enough_samples = waits.len() >= self.config.min_samples;

        // Hysteresis: entering one mode leaves the other.
        if enough_samples {
            if p90 > self.config.scale_up_threshold {
                state.scaling_up_mode = true;
                state.scaling_down_mode = false;
            } else if p90 < self.config.scale_down_threshold {
                state.scaling_down_mode = true;
                state.scaling_up_mode = false;
            }
        }

        let up_by_wait = enough_samples && p90 > self.config.scale_up_threshold;
        let up_by_length = state
            .queue_lengths
            .values()
            .any(|&len| len >= self.config.queue_up_threshold);
        let down_by_wait =
            enough_samples && p90 < self.config.scale_down_threshold && !state.scaling_up_mode;
        let down_by_length = state
            .queue_lengths
            .values()
            .all(|&len| len <= self.config.queue_down_threshold);

        let cooled_down = state
            .last_action
            .map_or(true, |t| now.duration_since(t) >= self.config.cooldown);
        if !cooled_down {
            return None;
        }

        if state.current_workers < self.config.max_workers && (up_by_wait || up_by_length) {
            let from = state.current_workers;
            state.current_workers += 1;
            state.last_action = Some(now);
            push_event(
                &mut state.history,
                ScalingEvent {
                    timestamp: Utc::now(),
                    action: "scale_up".into(),
                    from_workers: from,
                    to_workers: from + 1,
                    reason: if up_by_wait {
                        "high_queue_wait_p90".into()
                    } else {
                        "long_mode_queue".into()
                    },
                },
            );
            info!(from, to = from + 1, p90, "Scaling up workers");
            return Some(ScalingAction::ScaleUp);
        }

        if state.current_workers > self.config.min_workers && down_by_wait && down_by_length {
            let from = state.current_workers;
            state.current_workers -= 1;
            state.last_action = Some(now);
            push_event(
                &mut state.history,
                ScalingEvent {
                    timestamp: Utc::now(),
                    action: "scale_down".into(),
                    from_workers: from,
                    to_workers: from - 1,
                    reason: "low_wait_and_short_queues".into(),
                },
            );
            info!(from, to = from - 1, p90, "Scaling down workers");
            return Some(ScalingAction::ScaleDown);
        }

        None
    }

    /// Workers whose reported memory is over the threshold, provided the
    /// restart cooldown has passed. Consuming the answer arms the cooldown.
    pub fn check_restart(&self) -> Option<Vec<String>> {
        let mut state = self.state.lock();
        let now = Instant::now();
        let cooled_down = state
            .last_restart
            .map_or(true, |t| now.duration_since(t) >= self.config.restart_cooldown);
        if !cooled_down {
            return None;
        }

        let over: Vec<String> = state
            .memory_mb
            .iter()
            .filter(|(_, &mb)| mb > self.config.memory_threshold_mb)
            .map(|(id, _)| id.clone())
            .collect();
        if over.is_empty() {
            return None;
        }

        state.last_restart = Some(now);
        let current_workers = state.current_workers;
        push_event(
            &mut state.history,
            ScalingEvent {
                timestamp: Utc::now(),
                action: "worker_restart".into(),
                from_workers: current_workers,
                to_workers: current_workers,
                reason: format!("high_memory: {}", over.join(",")),
            },
        );
        Some(over)
    }

    /// Manual override from the admin surface; clamped to the bounds.
    pub fn set_workers_manual(&self, target: usize) -> usize {
        let clamped = target.clamp(self.config.min_workers, self.config.max_workers);
        let mut state = self.state.lock();
        let from = state.current_workers;
        state.current_workers = clamped;
        state.last_action = Some(Instant::now());
        push_event(
            &mut state.history,
            ScalingEvent {
                timestamp: Utc::now(),
                action: "manual_set".into(),
                from_workers: from,
                to_workers: clamped,
                reason: "manual".into(),
            },
        );
        clamped
    }

    pub fn status(&self) -> ScalingStatus {
        let state = self.state.lock();
        let waits = combined_waits(&state.wait_times, self.config.window);
        let p50 = percentile(&waits, 50.0);
        let p90 = percentile(&waits, 90.0);
        let enough = waits.len() >= self.config.min_samples;

        let up = (enough && p90 > self.config.scale_up_threshold)
            || state
                .queue_lengths
                .values()
                .any(|&len| len >= self.config.queue_up_threshold);
        let down = enough
            && p90 < self.config.scale_down_threshold
            && state
                .queue_lengths
                .values()
                .all(|&len| len <= self.config.queue_down_threshold);

        let total_queue: usize = state.queue_lengths.values().sum();
        let suggested = {
            let factor = if up {
                1.2
            } else if down {
                0.8
            } else {
                1.0
            };
            ((state.current_workers as f64 * factor) as usize)
                .clamp(self.config.min_workers, self.config.max_workers)
        };

        let elapsed = state
            .last_action
            .map(|t| t.elapsed())
            .unwrap_or(self.config.cooldown);
        ScalingStatus {
            current_workers: state.current_workers,
            suggested_workers: suggested,
            p50_queue_wait: p50,
            p90_queue_wait: p90,
            queue_lengths_by_mode: state
                .queue_lengths
                .iter()
                .map(|(m, len)| (m.to_string(), *len))
                .collect(),
            total_queue_length: total_queue,
            should_scale_up: up,
            should_scale_down: down,
            can_scale_now: elapsed >= self.config.cooldown,
            cooldown_remaining_secs: (self.config.cooldown.as_secs_f64()
                - elapsed.as_secs_f64())
            .max(0.0),
            is_scaling_up_mode: state.scaling_up_mode,
            is_scaling_down_mode: state.scaling_down_mode,
            memory_usage_mb: state.memory_mb.clone(),
            high_memory_workers: state
                .memory_mb
                .iter()
                .filter(|(_, &mb)| mb > self.config.memory_threshold_mb)
                .map(|(id, _)| id.clone())
                .collect(),
            recent_events: state.history.iter().cloned().collect(),
        }
    }

    pub fn bounds(&self) -> (usize, usize) {
        (self.config.min_workers, self.config.max_workers)
    }
}

fn push_event(history: &mut VecDeque<ScalingEvent>, event: ScalingEvent) {
    if history.len() == 100 {
        history.pop_front();
    }
    history.push_back(event);
}

fn combined_waits(wait_times: &HashMap<Mode, VecDeque<f64>>, window: usize) -> Vec<f64> {
    let mut all: Vec<f64> = Vec::new();
    for mode_waits in wait_times.values() {
        all.extend(mode_waits.iter().rev().take(window).copied());
    }
    all
}

/// Linear-interpolated percentile.
fn percentile(data: &[f64], pct: f64) -> f64 {
    if data.is_empty() {
        return 0.0;
    }
    let mut sorted = data.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

    let index = (pct / 100.0) * (sorted.len() - 1) as f64;
    let lower = index.floor() as usize;
    let upper = (lower + 1).min(sorted.len() - 1);
    if lower == upper {
        return sorted[lower];
    }
    let fraction = index - lower as f64;
    sorted[lower] + fraction * (sorted[upper] - sorted[lower])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_config() -> ScalerConfig {
        ScalerConfig {
            cooldown: Duration::from_millis(0),
            ..Default::default()
        }
    }

    fn feed_waits(scaler: &WorkerScaler, value: f64, count: usize) {
        for _ in 0..count {
            scaler.add_queue_wait_time(value, Mode::Simple);
        }
    }

    #[test]
    fn percentile_interpolates() {
        let data: Vec<f64> = (1..=10).map(|v| v as f64).collect();
        assert!((percentile(&data, 50.0) - 5.5).abs() < 1e-9);
        assert!((percentile(&data, 90.0) - 9.1).abs() < 1e-9);
        assert_eq!(percentile(&[], 90.0), 0.0);
    }

    #[test]
    fn scales_up_on_high_p90_wait() {
        let scaler = WorkerScaler::new(fast_config());
        feed_waits(&scaler, 2.0, 20);
        assert_eq!(scaler.decide(), Some(ScalingAction::ScaleUp));
        assert_eq!(scaler.current_workers(), 2);
    }

    #[test]
    fn scales_up_on_long_mode_queue_without_wait_samples() {
        let scaler = WorkerScaler::new(fast_config());
        scaler.update_queue_length(12, Mode::Full);
        assert_eq!(scaler.decide(), Some(ScalingAction::ScaleUp));
    }

    #[test]
    fn scales_down_when_quiet() {
        let scaler = WorkerScaler::new(fast_config());
        scaler.set_current_workers(3);
        feed_waits(&scaler, 0.05, 20);
        scaler.update_queue_length(1, Mode::Simple);
        assert_eq!(scaler.decide(), Some(ScalingAction::ScaleDown));
        assert_eq!(scaler.current_workers(), 2);
    }

    #[test]
    fn no_decision_below_min_samples() {
        let scaler = WorkerScaler::new(fast_config());
        feed_waits(&scaler, 5.0, 5);
        assert_eq!(scaler.decide(), None);
    }

    #[test]
    fn cooldown_separates_consecutive_actions() {
        let scaler = WorkerScaler::new(ScalerConfig {
            cooldown: Duration::from_secs(60),
            ..Default::default()
        });
        feed_waits(&scaler, 2.0, 50);
        assert_eq!(scaler.decide(), Some(ScalingAction::ScaleUp));
        // still overloaded, but inside the cooldown window
        assert_eq!(scaler.decide(), None);
    }

    #[test]
    fn hysteresis_blocks_down_after_up_pressure() {
        let scaler = WorkerScaler::new(fast_config());
        scaler.set_current_workers(4);
        feed_waits(&scaler, 2.0, 50);
        assert_eq!(scaler.decide(), Some(ScalingAction::ScaleUp));

        // A couple of fast samples do not flip the mode: p90 over the mixed
        // window is still high, so no premature scale-down.
        feed_waits(&scaler, 0.01, 5);
        assert_ne!(scaler.decide(), Some(ScalingAction::ScaleDown));
    }

    #[test]
    fn respects_worker_bounds() {
        let scaler = WorkerScaler::new(ScalerConfig {
            max_workers: 2,
            cooldown: Duration::from_millis(0),
            ..Default::default()
        });
        scaler.set_current_workers(2);
        feed_waits(&scaler, 5.0, 50);
        assert_eq!(scaler.decide(), None, "must not exceed max_workers");

        let scaler = WorkerScaler::new(fast_config());
        scaler.set_current_workers(1);
        feed_waits(&scaler, 0.01, 50);
        scaler.update_queue_length(0, Mode::Simple);
        assert_eq!(scaler.decide(), None, "must not drop below min_workers");
    }

    #[test]
    fn restart_needs_high_memory_and_cooldown() {
        let scaler = WorkerScaler::new(ScalerConfig {
            restart_cooldown: Duration::from_secs(600),
            ..Default::default()
        });
        assert_eq!(scaler.check_restart(), None);

        scaler.update_memory_usage(900.0, "worker-1");
        scaler.update_memory_usage(100.0, "worker-2");
        let over = scaler.check_restart().expect("worker-1 is over threshold");
        assert_eq!(over, vec!["worker-1".to_string()]);

        // cooldown armed: immediately asking again yields nothing
        scaler.update_memory_usage(950.0, "worker-1");
        assert_eq!(scaler.check_restart(), None);
    }

    #[test]
    fn manual_set_clamps_to_bounds() {
        let scaler = WorkerScaler::new(ScalerConfig::default());
        assert_eq!(scaler.set_workers_manual(50), 10);
        assert_eq!(scaler.set_workers_manual(0), 1);
    }

    #[test]
    fn status_reports_percentiles_and_queues() {
        let scaler = WorkerScaler::new(ScalerConfig::default());
        feed_waits(&scaler, 1.5, 20);
        scaler.update_queue_length(4, Mode::Simple);

        let status = scaler.status();
        assert!(status.p90_queue_wait > 1.0);
        assert_eq!(status.queue_lengths_by_mode["simple"], 4);
        assert!(status.should_scale_up);
        assert!(status.suggested_workers >= status.current_workers);
    }
}
