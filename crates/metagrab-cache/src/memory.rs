use lru::LruCache;
use metagrab_metrics::{EngineMetrics, TIER_MEMORY};
use metagrab_types::ScrapeOutcome;
use parking_lot::Mutex;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

/// Configuration for the in-process cache tier.
#[derive(Debug, Clone)]
pub struct MemoryCacheConfig {
    /// Maximum number of entries; overflow evicts least-recently-used.
    pub capacity: usize,
    /// TTL applied when the caller does not pass one explicitly.
    pub default_ttl: Duration,
}

impl Default for MemoryCacheConfig {
    fn default() -> Self {
        Self {
            capacity: 1000,
            default_ttl: Duration::from_secs(600),
        }
    }
}

struct Entry {
    outcome: ScrapeOutcome,
    inserted_at: Instant,
    ttl: Duration,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        now.duration_since(self.inserted_at) >= self.ttl
    }
}

/// Counters snapshot for the admin surface.
#[derive(Debug, Clone, serde::Serialize)]
pub struct MemoryCacheStats {
    pub hits: u64,
    pub misses: u64,
    pub expirations: u64,
    pub evictions: u64,
    pub size: usize,
    pub capacity: usize,
    pub hit_rate: f64,
}

/// Bounded in-process LRU cache with lazy TTL checks.
///
/// All operations are O(1); the lock is held only for the map operation
/// itself, never across awaits.
pub struct MemoryCache {
    inner: Mutex<LruCache<String, Entry>>,
    config: MemoryCacheConfig,
    metrics: Option<Arc<EngineMetrics>>,
    hits: AtomicU64,
    misses: AtomicU64,
    expirations: AtomicU64,
    evictions: AtomicU64,
}

impl MemoryCache {
    pub fn new(config: MemoryCacheConfig) -> Self {
        let capacity = NonZeroUsize::new(config.capacity.max(1)).expect("capacity >= 1");
        Self {
            inner: Mutex::new(LruCache::new(capacity)),
            config,
            metrics: None,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            expirations: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<EngineMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Look up a live entry. Expired entries are removed on sight and
    /// reported as a miss with reason `expired`.
    pub fn get(&self, key: &str) -> Option<ScrapeOutcome> {
        let now = Instant::now();
        let mut inner = self.inner.lock();

        let expired = match inner.get(key) {
            Some(entry) if entry.is_expired(now) => true,
            Some(entry) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                if let Some(m) = &self.metrics {
                    m.record_cache_hit(TIER_MEMORY);
                }
                return Some(entry.outcome.clone());
            }
            None => false,
        };

        if expired {
            inner.pop(key);
            self.expirations.fetch_add(1, Ordering::Relaxed);
            self.misses.fetch_add(1, Ordering::Relaxed);
            if let Some(m) = &self.metrics {
                m.record_cache_miss(TIER_MEMORY, "expired");
                m.cache_expirations_total
                    .with_label_values(&[TIER_MEMORY])
                    .inc();
                m.cache_size
                    .with_label_values(&[TIER_MEMORY])
                    .set(inner.len() as f64);
            }
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            if let Some(m) = &self.metrics {
                m.record_cache_miss(TIER_MEMORY, "not_found");
            }
        }
        None
    }

    /// Insert with an explicit TTL, evicting LRU on overflow.
    pub fn put(&self, key: impl Into<String>, outcome: ScrapeOutcome, ttl: Option<Duration>) {
        let key = key.into();
        let entry = Entry {
            outcome,
            inserted_at: Instant::now(),
            ttl: ttl.unwrap_or(self.config.default_ttl),
        };

        let mut inner = self.inner.lock();
        let evicted = inner.push(key.clone(), entry);
        if let Some((evicted_key, _)) = evicted {
            // `push` returns the displaced LRU entry; replacing the same key
            // is an update, not an eviction.
            if evicted_key != key {
                self.evictions.fetch_add(1, Ordering::Relaxed);
                if let Some(m) = &self.metrics {
                    m.cache_evictions_total
                        .with_label_values(&[TIER_MEMORY])
                        .inc();
                }
                debug!(key = %evicted_key, "Evicted LRU cache entry");
            }
        }
        if let Some(m) = &self.metrics {
            m.cache_size
                .with_label_values(&[TIER_MEMORY])
                .set(inner.len() as f64);
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    pub fn stats(&self) -> MemoryCacheStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        MemoryCacheStats {
            hits,
            misses,
            expirations: self.expirations.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            size: self.len(),
            capacity: self.config.capacity,
            hit_rate: if total > 0 {
                hits as f64 / total as f64
            } else {
                0.0
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use metagrab_types::{Mode, PageMetadata};

    fn outcome(url: &str) -> ScrapeOutcome {
        ScrapeOutcome::success(url, Mode::Simple, PageMetadata::default(), 1.0, 0.5, 0.1)
    }

    #[test]
    fn hit_after_put() {
        let cache = MemoryCache::new(MemoryCacheConfig::default());
        cache.put("k1", outcome("https://example.com/1"), None);
        let hit = cache.get("k1").expect("entry should be live");
        assert_eq!(hit.url, "https://example.com/1");
        assert_eq!(cache.stats().hits, 1);
    }

    #[test]
    fn expired_entry_reports_expired_miss() {
        let cache = MemoryCache::new(MemoryCacheConfig::default());
        cache.put("k1", outcome("https://example.com/1"), Some(Duration::ZERO));
        assert!(cache.get("k1").is_none());

        let stats = cache.stats();
        assert_eq!(stats.expirations, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.size, 0);
    }

    #[test]
    fn overflow_evicts_lru_and_keeps_size_bounded() {
        let cache = MemoryCache::new(MemoryCacheConfig {
            capacity: 2,
            ..Default::default()
        });
        cache.put("a", outcome("https://example.com/a"), None);
        cache.put("b", outcome("https://example.com/b"), None);
        // touch "a" so "b" becomes LRU
        assert!(cache.get("a").is_some());
        cache.put("c", outcome("https://example.com/c"), None);

        assert_eq!(cache.len(), 2);
        assert_eq!(cache.stats().evictions, 1);
        assert!(cache.get("b").is_none());
        assert!(cache.get("a").is_some());
        assert!(cache.get("c").is_some());
    }

    #[test]
    fn updating_a_key_is_not_an_eviction() {
        let cache = MemoryCache::new(MemoryCacheConfig {
            capacity: 2,
            ..Default::default()
        });
        cache.put("a", outcome("https://example.com/a"), None);
        cache.put("a", outcome("https://example.com/a2"), None);
        assert_eq!(cache.stats().evictions, 0);
        assert_eq!(cache.len(), 1);
    }
}
