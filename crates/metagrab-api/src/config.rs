use clap::Parser;
use metagrab_cache::{CacheConfig, MemoryCacheConfig};
use metagrab_engine::{
    RateLimiterConfig, SingleFlightConfig, TaskEngineConfig, ThrottlerConfig,
};
use metagrab_headless::{FetcherConfig, PagePoolConfig};
use metagrab_types::Mode;
use metagrab_workers::{ScalerConfig, WorkerPoolConfig};
use std::time::Duration;

/// Service configuration. Every knob can come from the command line or the
/// matching `METAGRAB_*` environment variable.
#[derive(Debug, Clone, Parser)]
#[command(name = "metagrab", about = "Concurrent web-metadata extraction service")]
pub struct AppConfig {
    #[arg(long, env = "METAGRAB_LISTEN_ADDR", default_value = "0.0.0.0:8080")]
    pub listen_addr: String,

    /// Run the browser headless.
    #[arg(long, env = "METAGRAB_HEADLESS", default_value_t = true, action = clap::ArgAction::Set)]
    pub headless: bool,

    /// Concurrent scrapes admitted by the rate limiter.
    #[arg(long, env = "METAGRAB_MAX_CONCURRENT", default_value_t = 6)]
    pub max_concurrent: usize,

    /// Positive cache TTL in seconds.
    #[arg(long, env = "METAGRAB_CACHE_TTL", default_value_t = 600)]
    pub cache_ttl_secs: u64,

    /// Negative cache TTL in seconds.
    #[arg(long, env = "METAGRAB_NEGATIVE_CACHE_TTL", default_value_t = 30)]
    pub negative_cache_ttl_secs: u64,

    /// L1 cache capacity (entries).
    #[arg(long, env = "METAGRAB_L1_CAPACITY", default_value_t = 1000)]
    pub l1_capacity: usize,

    #[arg(long, env = "METAGRAB_ENABLE_IMAGES", default_value_t = false)]
    pub enable_images: bool,

    /// Extraction mode applied when a request does not name one.
    #[arg(long, env = "METAGRAB_MODE", default_value = "simple")]
    pub mode: Mode,

    /// Redis URL for the L2 cache and cross-process coordination.
    #[arg(long, env = "METAGRAB_REDIS_URL")]
    pub redis_url: Option<String>,

    /// Keep a pool of long-lived pages. Disabling rotates the (single)
    /// context on every loan instead, trading latency for isolation.
    #[arg(long, env = "METAGRAB_USE_PAGE_POOL", default_value_t = true, action = clap::ArgAction::Set)]
    pub use_page_pool: bool,

    #[arg(long, env = "METAGRAB_MAX_PAGES_PER_CONTEXT", default_value_t = 5)]
    pub max_pages_per_context: usize,

    #[arg(long, env = "METAGRAB_MAX_CONTEXTS", default_value_t = 5)]
    pub max_contexts: usize,

    #[arg(long, env = "METAGRAB_CONTEXT_REUSE_LIMIT", default_value_t = 250)]
    pub context_reuse_limit: u64,

    #[arg(long, env = "METAGRAB_MAX_REQUESTS_PER_MINUTE", default_value_t = 30)]
    pub max_requests_per_minute: usize,

    /// URLs per job chunk at submission.
    #[arg(long, env = "METAGRAB_CHUNK_SIZE", default_value_t = 25)]
    pub chunk_size: usize,

    // Throttler thresholds.
    #[arg(long, env = "METAGRAB_THROTTLE_LATENCY_THRESHOLD", default_value_t = 2.0)]
    pub throttle_latency_threshold: f64,

    #[arg(long, env = "METAGRAB_THROTTLE_MISS_RATE_THRESHOLD", default_value_t = 0.6)]
    pub throttle_miss_rate_threshold: f64,

    #[arg(long, env = "METAGRAB_THROTTLE_MEMORY_THRESHOLD_MB", default_value_t = 800.0)]
    pub throttle_memory_threshold_mb: f64,

    // Scaler thresholds.
    #[arg(long, env = "METAGRAB_SCALE_UP_THRESHOLD", default_value_t = 1.0)]
    pub scale_up_threshold: f64,

    #[arg(long, env = "METAGRAB_SCALE_DOWN_THRESHOLD", default_value_t = 0.2)]
    pub scale_down_threshold: f64,

    #[arg(long, env = "METAGRAB_QUEUE_UP_THRESHOLD", default_value_t = 10)]
    pub queue_up_threshold: usize,

    #[arg(long, env = "METAGRAB_QUEUE_DOWN_THRESHOLD", default_value_t = 3)]
    pub queue_down_threshold: usize,

    #[arg(long, env = "METAGRAB_SCALE_COOLDOWN_SECS", default_value_t = 30)]
    pub scale_cooldown_secs: u64,

    #[arg(long, env = "METAGRAB_SCALER_MEMORY_THRESHOLD_MB", default_value_t = 800.0)]
    pub scaler_memory_threshold_mb: f64,

    #[arg(long, env = "METAGRAB_MIN_WORKERS", default_value_t = 1)]
    pub min_workers: usize,

    #[arg(long, env = "METAGRAB_MAX_WORKERS", default_value_t = 10)]
    pub max_workers: usize,

    #[arg(long, env = "METAGRAB_INITIAL_WORKERS", default_value_t = 2)]
    pub initial_workers: usize,

    /// Concurrent URLs per worker within one job.
    #[arg(long, env = "METAGRAB_MAX_CONCURRENT_PER_WORKER", default_value_t = 6)]
    pub max_concurrent_per_worker: usize,
}

impl AppConfig {
    pub fn default_mode(&self) -> Mode {
        self.mode
    }

    pub fn pool_config(&self) -> PagePoolConfig {
        if self.use_page_pool {
            PagePoolConfig {
                max_contexts: self.max_contexts,
                max_pages_per_context: self.max_pages_per_context,
                context_reuse_limit: self.context_reuse_limit,
                enable_images: self.enable_images,
                headless: self.headless,
                ..Default::default()
            }
        } else {
            // No pooling: one context, rotated on every loan, so each
            // request sees a fresh fingerprint.
            PagePoolConfig {
                max_contexts: 1,
                max_pages_per_context: 1,
                context_reuse_limit: 1,
                enable_images: self.enable_images,
                headless: self.headless,
                ..Default::default()
            }
        }
    }

    pub fn cache_config(&self) -> CacheConfig {
        CacheConfig {
            ttl: Duration::from_secs(self.cache_ttl_secs),
            negative_ttl: Duration::from_secs(self.negative_cache_ttl_secs),
        }
    }

    pub fn memory_cache_config(&self) -> MemoryCacheConfig {
        MemoryCacheConfig {
            capacity: self.l1_capacity,
            default_ttl: Duration::from_secs(self.cache_ttl_secs),
        }
    }

    pub fn rate_limiter_config(&self) -> RateLimiterConfig {
        RateLimiterConfig {
            max_concurrent: self.max_concurrent,
            max_requests_per_window: self.max_requests_per_minute,
            window: Duration::from_secs(60),
        }
    }

    pub fn throttler_config(&self) -> ThrottlerConfig {
        ThrottlerConfig {
            latency_threshold: self.throttle_latency_threshold,
            miss_rate_threshold: self.throttle_miss_rate_threshold,
            memory_threshold_mb: self.throttle_memory_threshold_mb,
            ..Default::default()
        }
    }

    pub fn scaler_config(&self) -> ScalerConfig {
        ScalerConfig {
            min_workers: self.min_workers,
            max_workers: self.max_workers,
            scale_up_threshold: self.scale_up_threshold,
            scale_down_threshold: self.scale_down_threshold,
            queue_up_threshold: self.queue_up_threshold,
            queue_down_threshold: self.queue_down_threshold,
            cooldown: Duration::from_secs(self.scale_cooldown_secs),
            memory_threshold_mb: self.scaler_memory_threshold_mb,
            ..Default::default()
        }
    }

    pub fn worker_pool_config(&self) -> WorkerPoolConfig {
        WorkerPoolConfig {
            initial_workers: self.initial_workers,
            max_concurrent_per_worker: self.max_concurrent_per_worker,
            chunk_size: self.chunk_size,
            ..Default::default()
        }
    }

    pub fn engine_config(&self) -> TaskEngineConfig {
        TaskEngineConfig {
            default_concurrency: self.max_concurrent,
            ..Default::default()
        }
    }

    pub fn fetcher_config(&self) -> FetcherConfig {
        FetcherConfig::default()
    }

    pub fn single_flight_config(&self) -> SingleFlightConfig {
        SingleFlightConfig::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn defaults() -> AppConfig {
        AppConfig::parse_from(["metagrab"])
    }

    #[test]
    fn defaults_match_service_profile() {
        let config = defaults();
        assert_eq!(config.max_requests_per_minute, 30);
        assert_eq!(config.chunk_size, 25);
        assert_eq!(config.cache_ttl_secs, 600);
        assert_eq!(config.negative_cache_ttl_secs, 30);
        assert_eq!(config.min_workers, 1);
        assert_eq!(config.max_workers, 10);
    }

    #[test]
    fn disabling_page_pool_rotates_every_loan() {
        let mut config = defaults();
        config.use_page_pool = false;
        let pool = config.pool_config();
        assert_eq!(pool.max_contexts, 1);
        assert_eq!(pool.context_reuse_limit, 1);
    }

    #[test]
    fn derived_configs_carry_thresholds() {
        let config = defaults();
        let scaler = config.scaler_config();
        assert_eq!(scaler.cooldown, Duration::from_secs(30));
        assert_eq!(scaler.queue_up_threshold, 10);

        let throttler = config.throttler_config();
        assert_eq!(throttler.latency_threshold, 2.0);
    }
}
