use metagrab_types::ScrapeOutcome;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::{MemoryCache, RedisCache};

/// TTL policy for the layered cache.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// TTL for positive entries.
    pub ttl: Duration,
    /// Short TTL for negative entries, absorbing bursts of retries against
    /// known-failing URLs without poisoning the cache long-term.
    pub negative_ttl: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(600),
            negative_ttl: Duration::from_secs(30),
        }
    }
}

/// Layered L1/L2 cache for scrape outcomes.
///
/// L1 is consulted first; an L2 hit is promoted to L1 with a fresh TTL.
/// Writes fan out to both tiers. L2 failures are logged and swallowed: the
/// engine degrades to L1-only rather than failing requests.
pub struct CacheManager {
    l1: Arc<MemoryCache>,
    l2: Option<Arc<RedisCache>>,
    config: CacheConfig,
}

impl CacheManager {
    pub fn new(l1: Arc<MemoryCache>, l2: Option<Arc<RedisCache>>, config: CacheConfig) -> Self {
        Self { l1, l2, config }
    }

    /// Look up a live entry (positive or negative) for the key.
    ///
    /// A negative entry returns the recorded failure outcome; both come back
    /// with `from_cache = true`.
    pub async fn lookup(&self, key: &str) -> Option<ScrapeOutcome> {
        if let Some(hit) = self.l1.get(key) {
            return Some(hit.as_cached());
        }

        if let Some(l2) = &self.l2 {
            match l2.get(key).await {
                Ok(Some(hit)) => {
                    // Promote so the next lookup is served in-process. A
                    // negative entry keeps its short TTL on promotion.
                    let ttl = if hit.success {
                        self.config.ttl
                    } else {
                        self.config.negative_ttl
                    };
                    self.l1.put(key, hit.clone(), Some(ttl));
                    return Some(hit.as_cached());
                }
                Ok(None) => {}
                Err(e) => debug!(key = %key, error = %e, "L2 lookup failed, continuing without it"),
            }
        }
        None
    }

    /// Store a positive outcome in both tiers.
    pub async fn store(&self, key: &str, outcome: &ScrapeOutcome) {
        self.l1.put(key, outcome.clone(), Some(self.config.ttl));
        if let Some(l2) = &self.l2 {
            if let Err(e) = l2.set(key, outcome, Some(self.config.ttl)).await {
                debug!(key = %key, error = %e, "L2 store failed");
            }
        }
    }

    /// Store a failure outcome with the short negative TTL.
    pub async fn store_negative(&self, key: &str, outcome: &ScrapeOutcome) {
        self.l1
            .put(key, outcome.clone(), Some(self.config.negative_ttl));
        if let Some(l2) = &self.l2 {
            if let Err(e) = l2.set(key, outcome, Some(self.config.negative_ttl)).await {
                debug!(key = %key, error = %e, "L2 negative store failed");
            }
        }
    }

    pub fn negative_ttl(&self) -> Duration {
        self.config.negative_ttl
    }

    pub fn l1(&self) -> &MemoryCache {
        &self.l1
    }

    pub fn has_l2(&self) -> bool {
        self.l2.is_some()
    }

    pub async fn l2_healthy(&self) -> Option<bool> {
        match &self.l2 {
            Some(l2) => Some(l2.ping().await),
            None => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemoryCacheConfig;
    use metagrab_types::{ErrorKind, Mode, PageMetadata};

    fn manager() -> CacheManager {
        CacheManager::new(
            Arc::new(MemoryCache::new(MemoryCacheConfig::default())),
            None,
            CacheConfig::default(),
        )
    }

    #[tokio::test]
    async fn positive_roundtrip_sets_from_cache() {
        let cache = manager();
        let outcome = ScrapeOutcome::success(
            "https://site/a",
            Mode::Simple,
            PageMetadata {
                title: Some("A".into()),
                ..Default::default()
            },
            1.0,
            0.5,
            0.1,
        );
        cache.store("k", &outcome).await;

        let hit = cache.lookup("k").await.expect("entry should be live");
        assert!(hit.from_cache);
        assert!(hit.success);
        assert_eq!(hit.metadata.title.as_deref(), Some("A"));
    }

    #[tokio::test]
    async fn negative_entry_returns_recorded_error() {
        let cache = manager();
        let failure = ScrapeOutcome::failure(
            "https://site/b",
            Mode::Simple,
            ErrorKind::RateLimited,
            "upstream 429",
        );
        cache.store_negative("k", &failure).await;

        let hit = cache.lookup("k").await.expect("negative entry is live");
        assert!(hit.from_cache);
        assert!(!hit.success);
        assert_eq!(hit.error_kind, Some(ErrorKind::RateLimited));
    }

    #[tokio::test]
    async fn lookup_misses_when_empty() {
        let cache = manager();
        assert!(cache.lookup("missing").await.is_none());
    }
}
