use metagrab_metrics::{EngineMetrics, TIER_REDIS};
use metagrab_types::{ScrapeError, ScrapeOutcome};
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Client};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Redis-backed cache tier.
///
/// Uses a multiplexed connection for concurrent access; entry expiry is
/// delegated to Redis via `SET .. EX`. Unavailability is surfaced as an
/// error and handled (non-fatally) by the layered manager.
pub struct RedisCache {
    conn: MultiplexedConnection,
    client: Client,
    default_ttl: Duration,
    metrics: Option<Arc<EngineMetrics>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl RedisCache {
    pub async fn connect(redis_url: &str, default_ttl: Duration) -> anyhow::Result<Self> {
        let client = Client::open(redis_url)?;
        let conn = client.get_multiplexed_tokio_connection().await?;
        Ok(Self {
            conn,
            client,
            default_ttl,
            metrics: None,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        })
    }

    pub fn with_metrics(mut self, metrics: Arc<EngineMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub async fn get(&self, key: &str) -> Result<Option<ScrapeOutcome>, ScrapeError> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn
            .get(key)
            .await
            .map_err(|e| ScrapeError::Cache(format!("redis get failed: {e}")))?;

        match raw {
            Some(json) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                if let Some(m) = &self.metrics {
                    m.record_cache_hit(TIER_REDIS);
                }
                let outcome = serde_json::from_str(&json)
                    .map_err(|e| ScrapeError::Cache(format!("corrupt cache entry: {e}")))?;
                Ok(Some(outcome))
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                if let Some(m) = &self.metrics {
                    m.record_cache_miss(TIER_REDIS, "not_found");
                }
                Ok(None)
            }
        }
    }

    pub async fn set(
        &self,
        key: &str,
        outcome: &ScrapeOutcome,
        ttl: Option<Duration>,
    ) -> Result<(), ScrapeError> {
        let json = serde_json::to_string(outcome)
            .map_err(|e| ScrapeError::Cache(format!("serialize failed: {e}")))?;
        let ttl_secs = ttl.unwrap_or(self.default_ttl).as_secs().max(1);

        let mut conn = self.conn.clone();
        let _: () = conn
            .set_ex(key, json, ttl_secs)
            .await
            .map_err(|e| ScrapeError::Cache(format!("redis set failed: {e}")))?;
        debug!(key = %key, ttl_secs, "Stored entry in redis tier");
        Ok(())
    }

    /// PING the server; used by the health endpoint.
    pub async fn ping(&self) -> bool {
        let mut conn = self.conn.clone();
        let pong: Result<String, _> = redis::cmd("PING").query_async(&mut conn).await;
        matches!(pong, Ok(ref p) if p == "PONG")
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    /// Redis URL host this cache talks to (for diagnostics).
    pub fn connection_info(&self) -> String {
        format!("{:?}", self.client.get_connection_info().addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use metagrab_types::{Mode, PageMetadata};

    // Integration tests need a live Redis:
    //   docker run -p 6379:6379 redis:alpine

    async fn connect() -> RedisCache {
        RedisCache::connect("redis://localhost:6379", Duration::from_secs(60))
            .await
            .expect("redis must be running for ignored tests")
    }

    #[tokio::test]
    #[ignore] // Requires Redis instance
    async fn set_get_roundtrip() {
        let cache = connect().await;
        let outcome = ScrapeOutcome::success(
            "https://example.com/redis",
            Mode::Simple,
            PageMetadata::default(),
            1.0,
            0.4,
            0.1,
        );
        cache.set("test:metagrab:rt", &outcome, None).await.unwrap();
        let back = cache.get("test:metagrab:rt").await.unwrap().unwrap();
        assert_eq!(back.url, outcome.url);
        assert_eq!(cache.hits(), 1);
    }

    #[tokio::test]
    #[ignore] // Requires Redis instance
    async fn missing_key_counts_miss() {
        let cache = connect().await;
        assert!(cache.get("test:metagrab:absent").await.unwrap().is_none());
        assert_eq!(cache.misses(), 1);
    }

    #[tokio::test]
    #[ignore] // Requires Redis instance
    async fn ping_health_check() {
        let cache = connect().await;
        assert!(cache.ping().await);
    }
}
