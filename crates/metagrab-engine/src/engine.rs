use async_trait::async_trait;
use futures::stream::{Stream, StreamExt};
use metagrab_cache::{CacheManager, RedisCoordination};
use metagrab_headless::{Fetcher, FetcherConfig, PageLease, PagePool, PagePoolStats};
use metagrab_metrics::{EngineMetrics, SCOPE_CROSS_PROCESS};
use metagrab_types::{
    cache_key, validate_url, ErrorKind, MetadataProcessor, Mode, ScrapeError, ScrapeOutcome,
};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::extractor::Extractor;
use crate::rate_limit::RateLimiter;
use crate::single_flight::{SingleFlight, SingleFlightConfig};
use crate::throttler::AdaptiveThrottler;

/// Orchestration knobs.
#[derive(Debug, Clone)]
pub struct TaskEngineConfig {
    /// Fetch attempts per scrape (exponential backoff in between).
    pub max_attempts: u32,
    /// Concurrency bound for multi-URL calls when the caller does not pass
    /// one explicitly.
    pub default_concurrency: usize,
}

impl Default for TaskEngineConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            default_concurrency: 6,
        }
    }
}

/// Everything the engine is assembled from.
pub struct TaskEngineParts {
    pub pool: Arc<PagePool>,
    pub cache: Arc<CacheManager>,
    pub coordination: Option<RedisCoordination>,
    pub rate_limiter: RateLimiter,
    pub throttler: Arc<AdaptiveThrottler>,
    pub metrics: Arc<EngineMetrics>,
    pub fetcher_config: FetcherConfig,
    pub single_flight_config: SingleFlightConfig,
    pub config: TaskEngineConfig,
}

#[derive(Debug, Default)]
struct EngineStats {
    total_requests: AtomicU64,
    cached_requests: AtomicU64,
    successful_scrapes: AtomicU64,
    failed_scrapes: AtomicU64,
    total_time_micros: AtomicU64,
}

/// Engine counters for the admin surface.
#[derive(Debug, Clone, Serialize)]
pub struct EngineStatsSnapshot {
    pub total_requests: u64,
    pub cached_requests: u64,
    pub successful_scrapes: u64,
    pub failed_scrapes: u64,
    pub total_scrape_time_seconds: f64,
}

struct Core {
    fetcher: Fetcher,
    extractor: Extractor,
    pool: Arc<PagePool>,
    cache: Arc<CacheManager>,
    coordination: Option<RedisCoordination>,
    single_flight: SingleFlight,
    rate_limiter: RateLimiter,
    throttler: Arc<AdaptiveThrottler>,
    metrics: Arc<EngineMetrics>,
    stats: EngineStats,
    config: TaskEngineConfig,
}

/// Top-level orchestrator for a single URL.
///
/// Ordered path: throttler delay, cache lookup (positive and negative),
/// single-flight (cross-process when Redis is configured, in-process
/// otherwise), rate-limit gate, page acquisition, fetch + extract with
/// bounded retries, cache store, publication to followers.
///
/// Cheap to clone; all state is shared.
#[derive(Clone)]
pub struct TaskEngine {
    core: Arc<Core>,
}

impl TaskEngine {
    pub fn new(parts: TaskEngineParts) -> Self {
        let metrics = parts.metrics;
        let core = Core {
            fetcher: Fetcher::new(parts.fetcher_config, Some(metrics.clone())),
            extractor: Extractor::new(Some(metrics.clone())),
            pool: parts.pool,
            cache: parts.cache,
            coordination: parts.coordination,
            single_flight: SingleFlight::new(parts.single_flight_config, Some(metrics.clone())),
            rate_limiter: parts.rate_limiter,
            throttler: parts.throttler,
            metrics,
            stats: EngineStats::default(),
            config: parts.config,
        };
        Self {
            core: Arc::new(core),
        }
    }

    /// Produce the outcome for one URL. Never returns `Err`: every failure
    /// mode is encoded in the outcome so upstream jobs cannot be failed by
    /// a single bad URL.
    pub async fn get_metadata(&self, url: &str, mode: Mode) -> ScrapeOutcome {
        let core = &self.core;
        core.stats.total_requests.fetch_add(1, Ordering::Relaxed);
        core.metrics.record_scrape_attempt(mode.as_str());

        if let Err(e) = validate_url(url) {
            return self.record_failure(url, mode, ErrorKind::InputError, e.to_string());
        }

        let delay = core.throttler.current_delay();
        if delay > Duration::ZERO {
            tokio::time::sleep(delay).await;
        }

        let key = cache_key(url);
        if let Some(hit) = core.cache.lookup(&key).await {
            core.throttler.update_cache_stats(true);
            core.stats.cached_requests.fetch_add(1, Ordering::Relaxed);
            return hit;
        }
        core.throttler.update_cache_stats(false);

        if core.coordination.is_some() {
            match self.coordinated_flight(&key, url, mode).await {
                Ok(outcome) => return outcome,
                Err(e) => {
                    // Infrastructure failure, not overload: degrade silently
                    // to in-process single-flight.
                    warn!(url = %url, error = %e, "Coordination failed, using in-process single-flight");
                    core.metrics
                        .single_flight_coordination_failures_total
                        .with_label_values(&[e.kind().as_str()])
                        .inc();
                }
            }
        }

        self.local_flight(&key, url, mode).await
    }

    /// Yield outcomes for many URLs in completion order. Input is
    /// deduplicated; concurrency is bounded.
    pub fn scrape_many(
        &self,
        urls: Vec<String>,
        mode: Mode,
        concurrency: Option<usize>,
    ) -> impl Stream<Item = ScrapeOutcome> + Send + 'static {
        let engine = self.clone();
        let concurrency = concurrency
            .unwrap_or(self.core.config.default_concurrency)
            .max(1);

        let mut seen = HashSet::new();
        let unique: Vec<String> = urls
            .into_iter()
            .filter(|u| seen.insert(u.clone()))
            .collect();

        futures::stream::iter(unique.into_iter().map(move |url| {
            let engine = engine.clone();
            async move { engine.get_metadata(&url, mode).await }
        }))
        .buffer_unordered(concurrency)
    }

    /// Gather many URLs into a url -> outcome map.
    pub async fn scrape_batch(
        &self,
        urls: Vec<String>,
        mode: Mode,
        concurrency: Option<usize>,
    ) -> HashMap<String, ScrapeOutcome> {
        let mut stream = Box::pin(self.scrape_many(urls, mode, concurrency));
        let mut results = HashMap::new();
        while let Some(outcome) = stream.next().await {
            results.insert(outcome.url.clone(), outcome);
        }
        results
    }

    async fn local_flight(&self, key: &str, url: &str, mode: Mode) -> ScrapeOutcome {
        let engine = self.clone();
        let key_owned = key.to_string();
        let url_owned = url.to_string();

        let flight = self
            .core
            .single_flight
            .run(key, url, mode, move || async move {
                let outcome = engine.perform_scrape(&url_owned, mode).await;
                engine.store_outcome(&key_owned, &outcome).await;
                outcome
            })
            .await;

        match flight.outcome {
            Ok(outcome) => outcome,
            Err(e) => ScrapeOutcome::failure(url, mode, ErrorKind::ServiceUnavailable, e.to_string()),
        }
    }

    /// Cross-process protocol: winner of the per-key lock leads, losers
    /// subscribe for the broadcast result. Any transport error propagates
    /// so the caller can fall through to in-process coalescing; a timeout
    /// waiting on the leader is fail-fast and never rescapes.
    async fn coordinated_flight(
        &self,
        key: &str,
        url: &str,
        mode: Mode,
    ) -> Result<ScrapeOutcome, ScrapeError> {
        let core = &self.core;
        let coord = match &core.coordination {
            Some(c) => c.clone(),
            None => return Err(ScrapeError::Coordination("coordination not configured".into())),
        };
        let lock_key = RedisCoordination::lock_key(key);
        let channel = RedisCoordination::channel_key(key);
        let started = Instant::now();

        if coord.try_acquire_leader(&lock_key).await? {
            let (renewal, leadership) = coord.spawn_renewal(lock_key.clone());

            let engine = self.clone();
            let coord_for_work = coord.clone();
            let key_owned = key.to_string();
            let url_owned = url.to_string();
            let channel_owned = channel.clone();
            let lock_owned = lock_key.clone();

            let flight = core
                .single_flight
                .run(key, url, mode, move || async move {
                    let outcome = engine.perform_scrape(&url_owned, mode).await;
                    if *leadership.borrow() {
                        // Leader is the sole cache writer; the write happens
                        // before the broadcast so followers that re-check the
                        // cache observe it.
                        engine.store_outcome(&key_owned, &outcome).await;
                        match serde_json::to_string(&outcome) {
                            Ok(payload) => {
                                let _ = coord_for_work.publish(&channel_owned, &payload).await;
                            }
                            Err(e) => {
                                warn!(url = %url_owned, error = %e, "Failed to encode outcome for broadcast")
                            }
                        }
                    } else {
                        warn!(
                            url = %url_owned,
                            "Leadership lost during scrape, abandoning cache writes and broadcast"
                        );
                    }
                    renewal.abort();
                    let _ = coord_for_work.release(&lock_owned).await;
                    outcome
                })
                .await;

            core.metrics
                .single_flight_coordination_duration
                .with_label_values(&[SCOPE_CROSS_PROCESS])
                .observe(started.elapsed().as_secs_f64());

            if !flight.led {
                // We hold the cross-process lock but coalesced into an
                // already-running local flight; relay its result to remote
                // followers and let go of the lock.
                if let Ok(outcome) = &flight.outcome {
                    if let Ok(payload) = serde_json::to_string(outcome) {
                        let _ = coord.publish(&channel, &payload).await;
                    }
                }
                let _ = coord.release(&lock_key).await;
            }

            return Ok(match flight.outcome {
                Ok(outcome) => outcome,
                Err(e) => {
                    ScrapeOutcome::failure(url, mode, ErrorKind::ServiceUnavailable, e.to_string())
                }
            });
        }

        // Follower: wait for the leader's broadcast.
        let mut subscription = coord.subscribe(&channel).await?;
        core.metrics.record_coalesced();

        // The leader writes both cache tiers before publishing; a result
        // that landed between our lock attempt and the subscription is
        // already observable there.
        if let Some(hit) = core.cache.lookup(key).await {
            return Ok(hit);
        }

        match tokio::time::timeout(
            core.single_flight.wait_timeout(),
            subscription.next_message(),
        )
        .await
        {
            Ok(Ok(Some(payload))) => {
                core.metrics
                    .single_flight_coordination_duration
                    .with_label_values(&[SCOPE_CROSS_PROCESS])
                    .observe(started.elapsed().as_secs_f64());
                let outcome: ScrapeOutcome = serde_json::from_str(&payload)
                    .map_err(|e| ScrapeError::Coordination(format!("bad broadcast payload: {e}")))?;
                debug!(url = %url, "Received leader result over coordination channel");
                Ok(outcome)
            }
            Ok(Ok(None)) => Err(ScrapeError::Coordination("result channel closed".into())),
            Ok(Err(e)) => Err(e),
            Err(_) => {
                // Fail fast: rescraping here would amplify load exactly when
                // the system is already saturated.
                core.metrics
                    .single_flight_timeouts_total
                    .with_label_values(&[SCOPE_CROSS_PROCESS])
                    .inc();
                Ok(ScrapeOutcome::failure(
                    url,
                    mode,
                    ErrorKind::ServiceUnavailable,
                    format!("timed out waiting for cross-process leader of {url}"),
                ))
            }
        }
    }

    /// The leader-only scrape: rate gate, page loan, fetch + extract with
    /// bounded retries. Retries reuse the rate-limit slot and the page; a
    /// page is replaced only when deemed broken.
    async fn perform_scrape(&self, url: &str, mode: Mode) -> ScrapeOutcome {
        let core = &self.core;

        let _permit = match core.rate_limiter.acquire().await {
            Ok(permit) => permit,
            Err(e) => return self.record_failure(url, mode, ErrorKind::InternalError, e.to_string()),
        };

        let mut lease: Option<PageLease> = match core.pool.acquire().await {
            Ok(l) => Some(l),
            Err(e) => {
                return self.record_failure(
                    url,
                    mode,
                    ErrorKind::ScrapingError,
                    format!("page acquisition failed: {e}"),
                )
            }
        };

        let mut last_error = ScrapeError::Internal("no scrape attempt executed".into());
        let mut extraction_retried = false;
        let mut attempt = 0u32;

        while attempt < core.config.max_attempts {
            attempt += 1;
            let page = match &lease {
                Some(l) => l.page(),
                None => break,
            };
            let start = Instant::now();

            let attempt_result = async {
                let fetched = core.fetcher.fetch(page, url, mode).await?;
                core.throttler.update_navigation_time(fetched.navigation_time);
                let (metadata, extraction_time) = core.extractor.extract(page, mode).await?;
                Ok::<ScrapeOutcome, ScrapeError>(ScrapeOutcome::success(
                    url,
                    mode,
                    metadata,
                    start.elapsed().as_secs_f64(),
                    fetched.navigation_time,
                    extraction_time,
                ))
            }
            .await;

            match attempt_result {
                Ok(outcome) => {
                    core.stats
                        .successful_scrapes
                        .fetch_add(1, Ordering::Relaxed);
                    core.stats.total_time_micros.fetch_add(
                        (outcome.scrape_time * 1_000_000.0) as u64,
                        Ordering::Relaxed,
                    );
                    core.metrics
                        .record_scrape_success(mode.as_str(), outcome.scrape_time);
                    if let Some(l) = lease.take() {
                        l.release().await;
                    }
                    return outcome;
                }
                Err(e) => {
                    let page_suspect = matches!(
                        e,
                        ScrapeError::Navigation { .. } | ScrapeError::Extraction(_)
                    );
                    let was_extraction = matches!(e, ScrapeError::Extraction(_));

                    warn!(url = %url, attempt, error = %e, "Scrape attempt failed");
                    last_error = e;

                    // Extraction failures get exactly one retry, on a fresh
                    // page; navigation failures use the remaining attempts.
                    if was_extraction && extraction_retried {
                        break;
                    }
                    if was_extraction {
                        extraction_retried = true;
                    }
                    if attempt >= core.config.max_attempts {
                        break;
                    }

                    tokio::time::sleep(Duration::from_secs(1u64 << attempt)).await;

                    if page_suspect {
                        if let Some(mut l) = lease.take() {
                            l.mark_broken();
                            l.release().await;
                        }
                        match core.pool.acquire().await {
                            Ok(l) => lease = Some(l),
                            Err(e) => {
                                last_error =
                                    ScrapeError::Browser(format!("page re-acquisition failed: {e}"));
                                break;
                            }
                        }
                    }
                }
            }
        }

        if let Some(mut l) = lease.take() {
            if matches!(
                last_error,
                ScrapeError::Navigation { .. } | ScrapeError::Extraction(_)
            ) {
                l.mark_broken();
            }
            l.release().await;
        }

        let kind = final_failure_kind(&last_error);
        match kind {
            ErrorKind::RateLimited => {
                core.metrics.rate_limit_events_total.inc();
                core.throttler.record_rate_limit_event();
            }
            ErrorKind::Checkpoint => {
                core.metrics.checkpoint_events_total.inc();
            }
            _ => {}
        }
        self.record_failure(url, mode, kind, last_error.to_string())
    }

    /// Sole cache-write path: positive entries with the configured TTL,
    /// negative entries (short TTL) only for known-recurring failures.
    async fn store_outcome(&self, key: &str, outcome: &ScrapeOutcome) {
        if outcome.success {
            self.core.cache.store(key, outcome).await;
        } else if outcome.is_negative_cacheable() {
            self.core.cache.store_negative(key, outcome).await;
        }
    }

    fn record_failure(
        &self,
        url: &str,
        mode: Mode,
        kind: ErrorKind,
        message: String,
    ) -> ScrapeOutcome {
        self.core.stats.failed_scrapes.fetch_add(1, Ordering::Relaxed);
        self.core
            .metrics
            .record_scrape_failure(kind.as_str(), mode.as_str());
        ScrapeOutcome::failure(url, mode, kind, message)
    }

    pub fn stats_snapshot(&self) -> EngineStatsSnapshot {
        let stats = &self.core.stats;
        EngineStatsSnapshot {
            total_requests: stats.total_requests.load(Ordering::Relaxed),
            cached_requests: stats.cached_requests.load(Ordering::Relaxed),
            successful_scrapes: stats.successful_scrapes.load(Ordering::Relaxed),
            failed_scrapes: stats.failed_scrapes.load(Ordering::Relaxed),
            total_scrape_time_seconds: stats.total_time_micros.load(Ordering::Relaxed) as f64
                / 1_000_000.0,
        }
    }

    pub fn throttler(&self) -> Arc<AdaptiveThrottler> {
        self.core.throttler.clone()
    }

    pub fn cache(&self) -> Arc<CacheManager> {
        self.core.cache.clone()
    }

    pub fn metrics(&self) -> Arc<EngineMetrics> {
        self.core.metrics.clone()
    }

    pub async fn pool_stats(&self) -> PagePoolStats {
        self.core.pool.stats().await
    }

    pub async fn shutdown(&self) -> anyhow::Result<()> {
        self.core.pool.shutdown().await
    }
}

#[async_trait]
impl MetadataProcessor for TaskEngine {
    async fn process(&self, url: &str, mode: Mode) -> ScrapeOutcome {
        self.get_metadata(url, mode).await
    }
}

/// Final classification once retries are exhausted. Navigation exhaustion
/// surfaces as a scraping error unless the driver message reveals an
/// upstream throttle or interstitial.
fn final_failure_kind(error: &ScrapeError) -> ErrorKind {
    match error {
        ScrapeError::RateLimited(_) => ErrorKind::RateLimited,
        ScrapeError::Checkpoint(_) => ErrorKind::Checkpoint,
        ScrapeError::Extraction(_) => ErrorKind::ExtractionError,
        ScrapeError::Navigation { message, .. } => match ScrapeError::classify_message(message) {
            ErrorKind::RateLimited => ErrorKind::RateLimited,
            ErrorKind::Checkpoint => ErrorKind::Checkpoint,
            _ => ErrorKind::ScrapingError,
        },
        ScrapeError::ServiceUnavailable(_) => ErrorKind::ServiceUnavailable,
        ScrapeError::InvalidInput(_) => ErrorKind::InputError,
        ScrapeError::Internal(_) => ErrorKind::InternalError,
        _ => ErrorKind::ScrapingError,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn navigation_exhaustion_is_a_scraping_error() {
        let err = ScrapeError::Navigation {
            url: "https://site/a".into(),
            message: "net::ERR_TIMED_OUT".into(),
        };
        assert_eq!(final_failure_kind(&err), ErrorKind::ScrapingError);
    }

    #[test]
    fn navigation_rate_limit_text_maps_to_rate_limited() {
        let err = ScrapeError::Navigation {
            url: "https://site/a".into(),
            message: "upstream returned 429 rate limit".into(),
        };
        assert_eq!(final_failure_kind(&err), ErrorKind::RateLimited);
    }

    #[test]
    fn checkpoint_text_maps_to_checkpoint() {
        let err = ScrapeError::Navigation {
            url: "https://site/a".into(),
            message: "landed on checkpoint interstitial".into(),
        };
        assert_eq!(final_failure_kind(&err), ErrorKind::Checkpoint);
    }

    #[test]
    fn extraction_errors_keep_their_kind() {
        let err = ScrapeError::Extraction("selector blew up".into());
        assert_eq!(final_failure_kind(&err), ErrorKind::ExtractionError);
        // and are therefore never negative-cached
        assert!(!final_failure_kind(&err).is_negative_cacheable());
    }
}
