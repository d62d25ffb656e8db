use futures_util::StreamExt;
use metagrab_types::ScrapeError;
use redis::aio::{MultiplexedConnection, PubSub};
use redis::{Client, Script};
use std::process;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Configuration for cross-process single-flight coordination.
#[derive(Debug, Clone)]
pub struct CoordinationConfig {
    /// TTL on the per-key leader lock. The leader renews every TTL/3.
    pub lock_ttl: Duration,
}

impl Default for CoordinationConfig {
    fn default() -> Self {
        Self {
            lock_ttl: Duration::from_secs(30),
        }
    }
}

// Renewal and release must only touch a lock this process still owns,
// otherwise a slow leader could clobber its successor's lock.
const RENEW_SCRIPT: &str = r#"
    if redis.call("GET", KEYS[1]) == ARGV[1] then
        return redis.call("EXPIRE", KEYS[1], ARGV[2])
    else
        return 0
    end
"#;

const RELEASE_SCRIPT: &str = r#"
    if redis.call("GET", KEYS[1]) == ARGV[1] then
        return redis.call("DEL", KEYS[1])
    else
        return 0
    end
"#;

/// Redis transport for cross-process single-flight: a TTL'd leader lock
/// per key plus a per-key pub/sub channel the leader broadcasts its result
/// on. The leader/follower protocol itself lives in the engine; this type
/// only exposes the primitives.
#[derive(Clone)]
pub struct RedisCoordination {
    conn: MultiplexedConnection,
    client: Arc<Client>,
    config: CoordinationConfig,
    node_id: String,
}

impl RedisCoordination {
    pub async fn connect(redis_url: &str, config: CoordinationConfig) -> anyhow::Result<Self> {
        let client = Client::open(redis_url)?;
        let conn = client.get_multiplexed_tokio_connection().await?;
        let node_id = format!("node-{}-{}", process::id(), startup_nonce());
        Ok(Self {
            conn,
            client: Arc::new(client),
            config,
            node_id,
        })
    }

    pub fn lock_key(cache_key: &str) -> String {
        format!("{cache_key}:lock")
    }

    pub fn channel_key(cache_key: &str) -> String {
        format!("{cache_key}:channel")
    }

    pub fn lock_ttl(&self) -> Duration {
        self.config.lock_ttl
    }

    /// Attempt to become the leader for a key. `SET NX EX` is atomic, so at
    /// most one process holds the lock within the TTL window.
    pub async fn try_acquire_leader(&self, lock_key: &str) -> Result<bool, ScrapeError> {
        let mut conn = self.conn.clone();
        let acquired: Option<String> = redis::cmd("SET")
            .arg(lock_key)
            .arg(&self.node_id)
            .arg("NX")
            .arg("EX")
            .arg(self.config.lock_ttl.as_secs())
            .query_async(&mut conn)
            .await
            .map_err(|e| ScrapeError::Coordination(format!("lock acquire failed: {e}")))?;
        Ok(acquired.is_some())
    }

    /// Extend the lock if this process still owns it. `Ok(false)` means the
    /// lock was lost and the caller must relinquish leadership.
    pub async fn renew(&self, lock_key: &str) -> Result<bool, ScrapeError> {
        let mut conn = self.conn.clone();
        let renewed: i32 = Script::new(RENEW_SCRIPT)
            .key(lock_key)
            .arg(&self.node_id)
            .arg(self.config.lock_ttl.as_secs())
            .invoke_async(&mut conn)
            .await
            .map_err(|e| ScrapeError::Coordination(format!("lock renew failed: {e}")))?;
        Ok(renewed == 1)
    }

    /// Release the lock if still owned.
    pub async fn release(&self, lock_key: &str) -> Result<bool, ScrapeError> {
        let mut conn = self.conn.clone();
        let released: i32 = Script::new(RELEASE_SCRIPT)
            .key(lock_key)
            .arg(&self.node_id)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| ScrapeError::Coordination(format!("lock release failed: {e}")))?;
        Ok(released == 1)
    }

    /// Publish a payload to the key's channel; returns subscriber count.
    pub async fn publish(&self, channel: &str, payload: &str) -> Result<usize, ScrapeError> {
        let mut conn = self.conn.clone();
        let count: usize = redis::cmd("PUBLISH")
            .arg(channel)
            .arg(payload)
            .query_async(&mut conn)
            .await
            .map_err(|e| ScrapeError::Coordination(format!("publish failed: {e}")))?;
        debug!(channel = %channel, subscribers = count, "Published coordination message");
        Ok(count)
    }

    /// Subscribe to the key's channel on a dedicated connection.
    pub async fn subscribe(&self, channel: &str) -> Result<Subscription, ScrapeError> {
        let mut pubsub = self
            .client
            .get_async_pubsub()
            .await
            .map_err(|e| ScrapeError::Coordination(format!("pubsub connect failed: {e}")))?;
        pubsub
            .subscribe(channel)
            .await
            .map_err(|e| ScrapeError::Coordination(format!("subscribe failed: {e}")))?;
        Ok(Subscription { pubsub })
    }

    /// Spawn the leader's renewal loop. The returned watch receiver flips to
    /// `false` the moment the lock is lost or renewal errors; the leader
    /// checks it before every cache write and before publishing. Abort the
    /// handle once the scrape settles.
    pub fn spawn_renewal(&self, lock_key: String) -> (JoinHandle<()>, watch::Receiver<bool>) {
        let (tx, rx) = watch::channel(true);
        let coord = self.clone();
        let interval = self.config.lock_ttl / 3;

        let handle = tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                match coord.renew(&lock_key).await {
                    Ok(true) => {}
                    Ok(false) => {
                        warn!(lock_key = %lock_key, "Leader lock lost, relinquishing leadership");
                        let _ = tx.send(false);
                        break;
                    }
                    Err(e) => {
                        warn!(lock_key = %lock_key, error = %e, "Lock renewal failed");
                        let _ = tx.send(false);
                        break;
                    }
                }
            }
        });

        (handle, rx)
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }
}

/// A pub/sub subscription on a per-key result channel.
pub struct Subscription {
    pubsub: PubSub,
}

impl Subscription {
    /// Wait for the next message payload on the channel.
    pub async fn next_message(&mut self) -> Result<Option<String>, ScrapeError> {
        let mut stream = self.pubsub.on_message();
        match stream.next().await {
            Some(msg) => {
                let payload: String = msg
                    .get_payload()
                    .map_err(|e| ScrapeError::Coordination(format!("bad payload: {e}")))?;
                Ok(Some(payload))
            }
            None => Ok(None),
        }
    }
}

/// Disambiguates node ids from the same pid across restarts. Wall-clock
/// seconds are good enough here.
fn startup_nonce() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_derivation() {
        assert_eq!(RedisCoordination::lock_key("scrape:v1:abc"), "scrape:v1:abc:lock");
        assert_eq!(
            RedisCoordination::channel_key("scrape:v1:abc"),
            "scrape:v1:abc:channel"
        );
    }

    // Integration tests need a live Redis:
    //   docker run -p 6379:6379 redis:alpine

    async fn connect() -> RedisCoordination {
        RedisCoordination::connect("redis://localhost:6379", CoordinationConfig::default())
            .await
            .expect("redis must be running for ignored tests")
    }

    #[tokio::test]
    #[ignore] // Requires Redis instance
    async fn only_one_leader_per_key() {
        let a = connect().await;
        let b = connect().await;
        let lock = "test:metagrab:leader:lock";

        assert!(a.try_acquire_leader(lock).await.unwrap());
        assert!(!b.try_acquire_leader(lock).await.unwrap());

        // release is owner-checked
        assert!(!b.release(lock).await.unwrap());
        assert!(a.release(lock).await.unwrap());
        assert!(b.try_acquire_leader(lock).await.unwrap());
        let _ = b.release(lock).await;
    }

    #[tokio::test]
    #[ignore] // Requires Redis instance
    async fn publish_reaches_subscriber() {
        let coord = connect().await;
        let mut sub = coord.subscribe("test:metagrab:chan").await.unwrap();

        let publisher = coord.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            let _ = publisher.publish("test:metagrab:chan", "{\"ok\":true}").await;
        });

        let msg = tokio::time::timeout(Duration::from_secs(5), sub.next_message())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(msg.as_deref(), Some("{\"ok\":true}"));
    }
}
