//! Prometheus metrics for the metagrab engine.
//!
//! One [`EngineMetrics`] instance is created at startup, shared via `Arc`,
//! and text-encoded by the HTTP surface at `/metrics`. Components record
//! through the helper methods rather than touching the raw collectors.

use prometheus::{
    Gauge, GaugeVec, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, Opts, Registry,
    TextEncoder,
};

/// Scope label values for single-flight metrics.
pub const SCOPE_IN_PROCESS: &str = "in_process";
pub const SCOPE_CROSS_PROCESS: &str = "cross_process";

/// Tier label values for cache metrics.
pub const TIER_MEMORY: &str = "memory";
pub const TIER_REDIS: &str = "redis";

/// Metrics collection for the extraction engine.
#[derive(Debug)]
pub struct EngineMetrics {
    registry: Registry,

    pub scrapes_total: IntCounterVec,
    pub scrapes_success_total: IntCounterVec,
    pub scrapes_failed_total: IntCounterVec,
    pub rate_limit_events_total: IntCounter,
    pub checkpoint_events_total: IntCounter,

    pub cache_hits_total: IntCounterVec,
    pub cache_misses_total: IntCounterVec,
    pub cache_expirations_total: IntCounterVec,
    pub cache_evictions_total: IntCounterVec,
    pub cache_size: GaugeVec,

    pub single_flight_requests_total: IntCounterVec,
    pub single_flight_timeouts_total: IntCounterVec,
    pub single_flight_coordination_failures_total: IntCounterVec,
    pub single_flight_coordination_duration: HistogramVec,

    pub queue_size: GaugeVec,
    pub active_contexts: Gauge,
    pub active_pages: Gauge,
    pub browser_memory_mb: GaugeVec,
    pub worker_count: Gauge,

    pub navigation_duration: HistogramVec,
    pub extraction_duration: HistogramVec,
    pub scrape_duration: HistogramVec,
    pub queue_wait_duration: HistogramVec,
}

impl EngineMetrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let scrapes_total = IntCounterVec::new(
            Opts::new("scrapes_total", "Total scrape attempts"),
            &["mode"],
        )?;
        let scrapes_success_total = IntCounterVec::new(
            Opts::new("scrapes_success_total", "Total successful scrapes"),
            &["mode"],
        )?;
        let scrapes_failed_total = IntCounterVec::new(
            Opts::new("scrapes_failed_total", "Total failed scrapes"),
            &["error_kind", "mode"],
        )?;
        let rate_limit_events_total = IntCounter::new(
            "rate_limit_events_total",
            "Rate-limit events (window waits and upstream 429s)",
        )?;
        let checkpoint_events_total = IntCounter::new(
            "checkpoint_events_total",
            "Upstream checkpoint/restriction events",
        )?;

        let cache_hits_total =
            IntCounterVec::new(Opts::new("cache_hits_total", "Cache hits"), &["tier"])?;
        let cache_misses_total = IntCounterVec::new(
            Opts::new("cache_misses_total", "Cache misses"),
            &["tier", "reason"],
        )?;
        let cache_expirations_total = IntCounterVec::new(
            Opts::new("cache_expirations_total", "Cache entries expired by TTL"),
            &["tier"],
        )?;
        let cache_evictions_total = IntCounterVec::new(
            Opts::new("cache_evictions_total", "Cache entries evicted (LRU)"),
            &["tier"],
        )?;
        let cache_size = GaugeVec::new(
            Opts::new("cache_size_current", "Current cache size"),
            &["tier"],
        )?;

        let single_flight_requests_total = IntCounterVec::new(
            Opts::new(
                "single_flight_requests_total",
                "Single-flight requests by type (direct executed the scrape, coalesced waited)",
            ),
            &["type"],
        )?;
        let single_flight_timeouts_total = IntCounterVec::new(
            Opts::new(
                "single_flight_timeouts_total",
                "Callers that timed out waiting on a single-flight leader",
            ),
            &["scope"],
        )?;
        let single_flight_coordination_failures_total = IntCounterVec::new(
            Opts::new(
                "single_flight_coordination_failures_total",
                "Cross-process coordination failures that degraded to in-process",
            ),
            &["error_kind"],
        )?;
        let single_flight_coordination_duration = HistogramVec::new(
            HistogramOpts::new(
                "single_flight_coordination_duration_seconds",
                "Duration of single-flight coordination operations",
            )
            .buckets(vec![0.001, 0.01, 0.1, 0.5, 1.0, 5.0]),
            &["scope"],
        )?;

        let queue_size = GaugeVec::new(
            Opts::new("queue_size", "Jobs currently queued, per mode"),
            &["mode"],
        )?;
        let active_contexts = Gauge::new("active_contexts", "Active browser contexts")?;
        let active_pages = Gauge::new("active_pages", "Active browser pages")?;
        let browser_memory_mb = GaugeVec::new(
            Opts::new("browser_memory_mb", "Reported browser memory usage in MB"),
            &["browser_id"],
        )?;
        let worker_count = Gauge::new("worker_count", "Current worker count")?;

        let navigation_duration = HistogramVec::new(
            HistogramOpts::new(
                "navigation_duration_seconds",
                "Duration of page navigations",
            )
            .buckets(vec![0.1, 0.5, 1.0, 2.0, 5.0, 10.0]),
            &["mode"],
        )?;
        let extraction_duration = HistogramVec::new(
            HistogramOpts::new(
                "extraction_duration_seconds",
                "Duration of in-page extraction",
            )
            .buckets(vec![0.1, 0.5, 1.0, 2.0, 5.0, 10.0]),
            &["mode"],
        )?;
        let scrape_duration = HistogramVec::new(
            HistogramOpts::new("scrape_duration_seconds", "End-to-end scrape duration")
                .buckets(vec![0.1, 0.5, 1.0, 2.0, 5.0, 10.0, 20.0]),
            &["mode"],
        )?;
        let queue_wait_duration = HistogramVec::new(
            HistogramOpts::new(
                "queue_wait_duration_seconds",
                "Time jobs spend queued before a worker picks them up",
            )
            .buckets(vec![0.1, 0.5, 1.0, 2.0, 5.0, 10.0]),
            &["mode"],
        )?;

        registry.register(Box::new(scrapes_total.clone()))?;
        registry.register(Box::new(scrapes_success_total.clone()))?;
        registry.register(Box::new(scrapes_failed_total.clone()))?;
        registry.register(Box::new(rate_limit_events_total.clone()))?;
        registry.register(Box::new(checkpoint_events_total.clone()))?;
        registry.register(Box::new(cache_hits_total.clone()))?;
        registry.register(Box::new(cache_misses_total.clone()))?;
        registry.register(Box::new(cache_expirations_total.clone()))?;
        registry.register(Box::new(cache_evictions_total.clone()))?;
        registry.register(Box::new(cache_size.clone()))?;
        registry.register(Box::new(single_flight_requests_total.clone()))?;
        registry.register(Box::new(single_flight_timeouts_total.clone()))?;
        registry.register(Box::new(single_flight_coordination_failures_total.clone()))?;
        registry.register(Box::new(single_flight_coordination_duration.clone()))?;
        registry.register(Box::new(queue_size.clone()))?;
        registry.register(Box::new(active_contexts.clone()))?;
        registry.register(Box::new(active_pages.clone()))?;
        registry.register(Box::new(browser_memory_mb.clone()))?;
        registry.register(Box::new(worker_count.clone()))?;
        registry.register(Box::new(navigation_duration.clone()))?;
        registry.register(Box::new(extraction_duration.clone()))?;
        registry.register(Box::new(scrape_duration.clone()))?;
        registry.register(Box::new(queue_wait_duration.clone()))?;

        Ok(Self {
            registry,
            scrapes_total,
            scrapes_success_total,
            scrapes_failed_total,
            rate_limit_events_total,
            checkpoint_events_total,
            cache_hits_total,
            cache_misses_total,
            cache_expirations_total,
            cache_evictions_total,
            cache_size,
            single_flight_requests_total,
            single_flight_timeouts_total,
            single_flight_coordination_failures_total,
            single_flight_coordination_duration,
            queue_size,
            active_contexts,
            active_pages,
            browser_memory_mb,
            worker_count,
            navigation_duration,
            extraction_duration,
            scrape_duration,
            queue_wait_duration,
        })
    }

    pub fn record_scrape_attempt(&self, mode: &str) {
        self.scrapes_total.with_label_values(&[mode]).inc();
    }

    pub fn record_scrape_success(&self, mode: &str, duration_secs: f64) {
        self.scrapes_success_total.with_label_values(&[mode]).inc();
        self.scrape_duration
            .with_label_values(&[mode])
            .observe(duration_secs);
    }

    pub fn record_scrape_failure(&self, error_kind: &str, mode: &str) {
        self.scrapes_failed_total
            .with_label_values(&[error_kind, mode])
            .inc();
    }

    pub fn record_cache_hit(&self, tier: &str) {
        self.cache_hits_total.with_label_values(&[tier]).inc();
    }

    pub fn record_cache_miss(&self, tier: &str, reason: &str) {
        self.cache_misses_total
            .with_label_values(&[tier, reason])
            .inc();
    }

    pub fn record_coalesced(&self) {
        self.single_flight_requests_total
            .with_label_values(&["coalesced"])
            .inc();
    }

    pub fn record_direct(&self) {
        self.single_flight_requests_total
            .with_label_values(&["direct"])
            .inc();
    }

    /// Render the registry in Prometheus text exposition format.
    pub fn render(&self) -> String {
        let encoder = TextEncoder::new();
        match encoder.encode_to_string(&self.registry.gather()) {
            Ok(text) => text,
            Err(e) => {
                tracing::error!(error = %e, "Failed to encode metrics");
                String::new()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metrics_register_without_collision() {
        let metrics = EngineMetrics::new().expect("registry should build");
        metrics.record_scrape_attempt("simple");
        metrics.record_scrape_success("simple", 1.2);
        metrics.record_scrape_failure("rate_limited", "simple");
        metrics.record_cache_hit(TIER_MEMORY);
        metrics.record_cache_miss(TIER_REDIS, "not_found");
        metrics.record_coalesced();
        metrics.worker_count.set(2.0);

        let text = metrics.render();
        assert!(text.contains("scrapes_total"));
        assert!(text.contains("single_flight_requests_total"));
        assert!(text.contains("worker_count 2"));
    }

    #[test]
    fn failure_labels_are_split_by_kind() {
        let metrics = EngineMetrics::new().unwrap();
        metrics.record_scrape_failure("checkpoint", "full");
        metrics.record_scrape_failure("rate_limited", "full");
        assert_eq!(
            metrics
                .scrapes_failed_total
                .with_label_values(&["checkpoint", "full"])
                .get(),
            1
        );
        assert_eq!(
            metrics
                .scrapes_failed_total
                .with_label_values(&["rate_limited", "full"])
                .get(),
            1
        );
    }
}
