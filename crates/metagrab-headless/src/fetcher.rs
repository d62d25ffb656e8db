use chromiumoxide::Page;
use metagrab_metrics::EngineMetrics;
use metagrab_types::{Mode, ScrapeError};
use rand::Rng;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::timeout;
use tracing::debug;

/// Navigation policy configuration.
#[derive(Debug, Clone)]
pub struct FetcherConfig {
    /// Timeout for the aggressive first navigation attempt.
    pub commit_timeout: Duration,
    /// Timeout for the second attempt that waits for the network to settle.
    pub settle_timeout: Duration,
    /// Randomised post-navigation delay bounds, for late-attaching DOM.
    pub settle_delay_min: Duration,
    pub settle_delay_max: Duration,
}

impl Default for FetcherConfig {
    fn default() -> Self {
        Self {
            commit_timeout: Duration::from_secs(8),
            settle_timeout: Duration::from_secs(15),
            settle_delay_min: Duration::from_millis(300),
            settle_delay_max: Duration::from_millis(800),
        }
    }
}

/// Timing data from a completed navigation.
#[derive(Debug, Clone, Copy)]
pub struct FetchOutcome {
    pub navigation_time: f64,
}

/// Drives a loaned page through a navigation.
///
/// Two-phase policy: a fast attempt first, then a retry that waits for
/// navigation to settle under a longer timeout. Both failing surfaces a
/// navigation error to the engine's retry loop.
pub struct Fetcher {
    config: FetcherConfig,
    metrics: Option<Arc<EngineMetrics>>,
}

impl Fetcher {
    pub fn new(config: FetcherConfig, metrics: Option<Arc<EngineMetrics>>) -> Self {
        Self { config, metrics }
    }

    pub async fn fetch(
        &self,
        page: &Page,
        url: &str,
        mode: Mode,
    ) -> Result<FetchOutcome, ScrapeError> {
        let start = Instant::now();

        let first = timeout(self.config.commit_timeout, page.goto(url)).await;
        let first_err = match first {
            Ok(Ok(_)) => None,
            Ok(Err(e)) => Some(e.to_string()),
            Err(_) => Some(format!(
                "navigation timed out after {:?}",
                self.config.commit_timeout
            )),
        };

        if let Some(reason) = first_err {
            debug!(url = %url, reason = %reason, "First navigation attempt failed, retrying with settle wait");
            let second = timeout(self.config.settle_timeout, async {
                page.goto(url).await?;
                page.wait_for_navigation().await?;
                Ok::<(), chromiumoxide::error::CdpError>(())
            })
            .await;

            match second {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    return Err(ScrapeError::Navigation {
                        url: url.to_string(),
                        message: format!("both phases failed: {reason}; then: {e}"),
                    })
                }
                Err(_) => {
                    return Err(ScrapeError::Navigation {
                        url: url.to_string(),
                        message: format!(
                            "both phases failed: {reason}; then: settle timed out after {:?}",
                            self.config.settle_timeout
                        ),
                    })
                }
            }
        }

        // Short randomised pause so late-attaching DOM (scripts injecting
        // meta tags) is present before extraction.
        let settle = {
            let min = self.config.settle_delay_min.as_millis() as u64;
            let max = self.config.settle_delay_max.as_millis() as u64;
            Duration::from_millis(rand::thread_rng().gen_range(min..=max.max(min)))
        };
        tokio::time::sleep(settle).await;

        let navigation_time = start.elapsed().as_secs_f64();
        if let Some(m) = &self.metrics {
            m.navigation_duration
                .with_label_values(&[mode.as_str()])
                .observe(navigation_time);
        }
        debug!(url = %url, navigation_time, "Navigation completed");

        Ok(FetchOutcome { navigation_time })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_timeouts_are_phased() {
        let config = FetcherConfig::default();
        assert!(config.commit_timeout < config.settle_timeout);
        assert!(config.settle_delay_min <= config.settle_delay_max);
    }
}
