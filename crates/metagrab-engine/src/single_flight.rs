use futures::future::{BoxFuture, FutureExt, Shared};
use metagrab_metrics::{EngineMetrics, SCOPE_IN_PROCESS};
use metagrab_types::{ErrorKind, Mode, ScrapeError, ScrapeOutcome};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, Mutex};
use tokio::time::timeout;
use tracing::{debug, warn};

/// Configuration for in-process request coalescing.
#[derive(Debug, Clone)]
pub struct SingleFlightConfig {
    /// Hard ceiling on how long any caller waits for the leader's result.
    pub wait_timeout: Duration,
}

impl Default for SingleFlightConfig {
    fn default() -> Self {
        Self {
            wait_timeout: Duration::from_secs(45),
        }
    }
}

type SharedOutcome = Shared<BoxFuture<'static, ScrapeOutcome>>;

/// Result of a single-flight run.
pub struct FlightResult {
    /// The outcome, or `Err(ServiceUnavailable)` if this caller's wait
    /// ceiling elapsed before the leader finished.
    pub outcome: Result<ScrapeOutcome, ScrapeError>,
    /// Whether this call installed (and is therefore driving) the work.
    pub led: bool,
}

/// Per-key deduplication of concurrent scrapes within one process.
///
/// The first caller for a key becomes the leader: its work is driven by a
/// spawned task, so follower timeouts (or the leader-caller's own timeout)
/// never cancel the scrape — it keeps running and fills the caches for
/// later callers. The in-flight entry is removed only when the work
/// settles, preserving at-most-one-scrape-per-key while a leader runs.
pub struct SingleFlight {
    inflight: Arc<Mutex<HashMap<String, SharedOutcome>>>,
    config: SingleFlightConfig,
    metrics: Option<Arc<EngineMetrics>>,
}

impl SingleFlight {
    pub fn new(config: SingleFlightConfig, metrics: Option<Arc<EngineMetrics>>) -> Self {
        Self {
            inflight: Arc::new(Mutex::new(HashMap::new())),
            config,
            metrics,
        }
    }

    /// Execute `work` with single-flight semantics for `key`.
    ///
    /// The work closure owns every side effect of the scrape (cache writes,
    /// publication, lock cleanup): it runs to completion on its own task
    /// even if every waiter has given up.
    pub async fn run<F, Fut>(&self, key: &str, url: &str, mode: Mode, work: F) -> FlightResult
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = ScrapeOutcome> + Send + 'static,
    {
        let (future, led) = {
            let mut inflight = self.inflight.lock().await;
            if let Some(existing) = inflight.get(key) {
                (existing.clone(), false)
            } else {
                let (tx, rx) = oneshot::channel();
                let fallback_url = url.to_string();
                let shared: SharedOutcome = rx
                    .map(move |res| match res {
                        Ok(outcome) => outcome,
                        Err(_) => ScrapeOutcome::failure(
                            fallback_url,
                            mode,
                            ErrorKind::InternalError,
                            "scrape task aborted before completing",
                        ),
                    })
                    .boxed()
                    .shared();
                // Insert while still holding the map lock, before the work
                // task can possibly reach its cleanup, so the entry lives
                // exactly as long as the flight.
                inflight.insert(key.to_string(), shared.clone());

                let fut = work();
                let inflight_map = self.inflight.clone();
                let cleanup_key = key.to_string();
                tokio::spawn(async move {
                    let outcome = fut.await;
                    // Remove before completing the waiters so a caller that
                    // observes the result and immediately re-requests starts
                    // a fresh flight instead of racing a stale entry.
                    inflight_map.lock().await.remove(&cleanup_key);
                    let _ = tx.send(outcome);
                });
                (shared, true)
            }
        };

        if let Some(m) = &self.metrics {
            if led {
                m.record_direct();
            } else {
                m.record_coalesced();
            }
        }

        match timeout(self.config.wait_timeout, future).await {
            Ok(outcome) => {
                debug!(key = %key, led, "Single-flight settled");
                FlightResult {
                    outcome: Ok(outcome),
                    led,
                }
            }
            Err(_) => {
                warn!(key = %key, led, timeout = ?self.config.wait_timeout, "Timed out waiting on single-flight leader");
                if let Some(m) = &self.metrics {
                    m.single_flight_timeouts_total
                        .with_label_values(&[SCOPE_IN_PROCESS])
                        .inc();
                }
                FlightResult {
                    outcome: Err(ScrapeError::ServiceUnavailable(format!(
                        "timed out after {:?} waiting for in-flight scrape of {url}",
                        self.config.wait_timeout
                    ))),
                    led,
                }
            }
        }
    }

    /// Number of keys currently in flight.
    pub async fn inflight_len(&self) -> usize {
        self.inflight.lock().await.len()
    }

    /// The per-caller wait ceiling, shared with the cross-process follower
    /// path so both scopes time out identically.
    pub fn wait_timeout(&self) -> Duration {
        self.config.wait_timeout
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use metagrab_types::PageMetadata;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn outcome(url: &str) -> ScrapeOutcome {
        ScrapeOutcome::success(url, Mode::Simple, PageMetadata::default(), 3.0, 2.0, 0.5)
    }

    #[tokio::test]
    async fn twenty_concurrent_callers_one_execution() {
        let sf = Arc::new(SingleFlight::new(SingleFlightConfig::default(), None));
        let executions = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..20 {
            let sf = sf.clone();
            let executions = executions.clone();
            handles.push(tokio::spawn(async move {
                sf.run("key", "https://site/a", Mode::Simple, move || async move {
                    executions.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    outcome("https://site/a")
                })
                .await
            }));
        }

        let mut leaders = 0;
        for handle in handles {
            let res = handle.await.unwrap();
            let out = res.outcome.expect("no timeout expected");
            assert!(out.success);
            assert_eq!(out.url, "https://site/a");
            if res.led {
                leaders += 1;
            }
        }
        assert_eq!(executions.load(Ordering::SeqCst), 1);
        assert_eq!(leaders, 1);
    }

    #[tokio::test]
    async fn coalesced_metric_counts_followers() {
        let metrics = Arc::new(EngineMetrics::new().unwrap());
        let sf = Arc::new(SingleFlight::new(
            SingleFlightConfig::default(),
            Some(metrics.clone()),
        ));

        let mut handles = Vec::new();
        for _ in 0..20 {
            let sf = sf.clone();
            handles.push(tokio::spawn(async move {
                sf.run("key", "https://site/a", Mode::Simple, || async {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    outcome("https://site/a")
                })
                .await
            }));
        }
        for handle in handles {
            handle.await.unwrap().outcome.unwrap();
        }

        let coalesced = metrics
            .single_flight_requests_total
            .with_label_values(&["coalesced"])
            .get();
        assert!(coalesced >= 19, "coalesced = {coalesced}");
        assert_eq!(
            metrics
                .single_flight_requests_total
                .with_label_values(&["direct"])
                .get(),
            1
        );
    }

    #[tokio::test]
    async fn waiter_timeout_does_not_cancel_leader() {
        let sf = Arc::new(SingleFlight::new(
            SingleFlightConfig {
                wait_timeout: Duration::from_millis(50),
            },
            None,
        ));
        let executions = Arc::new(AtomicUsize::new(0));
        let finished = Arc::new(AtomicUsize::new(0));

        let exec = executions.clone();
        let fin = finished.clone();
        let res = sf
            .run("key", "https://site/slow", Mode::Simple, move || async move {
                exec.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(200)).await;
                fin.fetch_add(1, Ordering::SeqCst);
                outcome("https://site/slow")
            })
            .await;

        assert!(res.led);
        assert!(matches!(
            res.outcome,
            Err(ScrapeError::ServiceUnavailable(_))
        ));

        // Leader keeps running after the caller gave up.
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(executions.load(Ordering::SeqCst), 1);
        assert_eq!(finished.load(Ordering::SeqCst), 1);
        assert_eq!(sf.inflight_len().await, 0);
    }

    #[tokio::test]
    async fn sequential_runs_execute_separately() {
        let sf = SingleFlight::new(SingleFlightConfig::default(), None);
        let executions = Arc::new(AtomicUsize::new(0));

        for _ in 0..2 {
            let executions = executions.clone();
            let res = sf
                .run("key", "https://site/a", Mode::Simple, move || async move {
                    executions.fetch_add(1, Ordering::SeqCst);
                    outcome("https://site/a")
                })
                .await;
            res.outcome.unwrap();
        }
        assert_eq!(executions.load(Ordering::SeqCst), 2);
    }
}
