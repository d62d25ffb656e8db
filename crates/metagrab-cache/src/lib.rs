//! Two-tier result caching and cross-process coordination.
//!
//! The in-process tier ([`MemoryCache`]) is a bounded LRU with per-entry
//! TTL; the optional external tier ([`RedisCache`]) mirrors the same
//! contract on Redis. [`CacheManager`] layers them (L1 first, L2 hits
//! promoted to L1, writes fanned out) and implements negative caching for
//! known-failing URLs. [`RedisCoordination`] is the transport used by
//! cross-process single-flight: a TTL'd leader lock with compare-owner
//! renewal/release plus a per-key pub/sub channel for result broadcast.

mod coordination;
mod layered;
mod memory;
mod redis_cache;

pub use coordination::{CoordinationConfig, RedisCoordination, Subscription};
pub use layered::{CacheConfig, CacheManager};
pub use memory::{MemoryCache, MemoryCacheConfig, MemoryCacheStats};
pub use redis_cache::RedisCache;
