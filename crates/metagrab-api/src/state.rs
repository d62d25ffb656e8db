use anyhow::{Context, Result};
use metagrab_cache::{CacheManager, CoordinationConfig, MemoryCache, RedisCache, RedisCoordination};
use metagrab_engine::{AdaptiveThrottler, RateLimiter, TaskEngine, TaskEngineParts};
use metagrab_headless::PagePool;
use metagrab_metrics::EngineMetrics;
use metagrab_workers::{WorkerPool, WorkerScaler};
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

use crate::config::AppConfig;

/// Shared application state behind the router.
pub struct AppState {
    pub engine: TaskEngine,
    pub workers: Arc<WorkerPool>,
    pub scaler: Arc<WorkerScaler>,
    pub throttler: Arc<AdaptiveThrottler>,
    pub metrics: Arc<EngineMetrics>,
    pub config: AppConfig,
    pub started_at: Instant,
}

pub type SharedState = Arc<AppState>;

/// Assemble the full engine stack.
///
/// Redis problems degrade (L1-only caching, in-process single-flight); a
/// browser launch failure is fatal.
pub async fn build_state(config: AppConfig) -> Result<SharedState> {
    let metrics = Arc::new(EngineMetrics::new().context("Failed to build metrics registry")?);
    let throttler = Arc::new(AdaptiveThrottler::new(config.throttler_config()));
    let scaler = Arc::new(WorkerScaler::new(config.scaler_config()));

    let l1 = Arc::new(MemoryCache::new(config.memory_cache_config()).with_metrics(metrics.clone()));

    let (l2, coordination) = match &config.redis_url {
        Some(url) => {
            let cache_cfg = config.cache_config();
            let l2 = match RedisCache::connect(url, cache_cfg.ttl).await {
                Ok(cache) => {
                    info!(redis_url = %url, "L2 cache connected");
                    Some(Arc::new(cache.with_metrics(metrics.clone())))
                }
                Err(e) => {
                    warn!(redis_url = %url, error = %e, "L2 cache unavailable, degrading to L1 only");
                    None
                }
            };
            let coordination =
                match RedisCoordination::connect(url, CoordinationConfig::default()).await {
                    Ok(coord) => {
                        info!(node_id = %coord.node_id(), "Cross-process coordination enabled");
                        Some(coord)
                    }
                    Err(e) => {
                        warn!(redis_url = %url, error = %e, "Coordination unavailable, using in-process single-flight");
                        None
                    }
                };
            (l2, coordination)
        }
        None => (None, None),
    };

    let cache = Arc::new(CacheManager::new(l1, l2, config.cache_config()));

    let pool = Arc::new(
        PagePool::launch(config.pool_config(), Some(metrics.clone()))
            .await
            .context("Browser pool initialization failed")?,
    );

    let rate_limiter = RateLimiter::new(config.rate_limiter_config())
        .with_metrics(metrics.clone())
        .with_throttler(throttler.clone());

    let engine = TaskEngine::new(TaskEngineParts {
        pool,
        cache,
        coordination,
        rate_limiter,
        throttler: throttler.clone(),
        metrics: metrics.clone(),
        fetcher_config: config.fetcher_config(),
        single_flight_config: config.single_flight_config(),
        config: config.engine_config(),
    });

    let workers = Arc::new(WorkerPool::new(
        Arc::new(engine.clone()),
        scaler.clone(),
        Some(metrics.clone()),
        config.worker_pool_config(),
    ));
    workers.start().await;

    Ok(Arc::new(AppState {
        engine,
        workers,
        scaler,
        throttler,
        metrics,
        config,
        started_at: Instant::now(),
    }))
}
