//! The metagrab task engine.
//!
//! Coordinates the scrape path for a single URL: adaptive pre-delay, cache
//! lookup, single-flight coalescing (in-process, and cross-process when
//! Redis is configured), rate limiting, page acquisition, two-phase fetch,
//! mode-dispatched extraction and cache store. Signals from every stage
//! feed the [`AdaptiveThrottler`]; queue signals feed the worker scaler in
//! the workers crate.

mod engine;
mod extractor;
mod rate_limit;
mod signals;
mod single_flight;
mod throttler;

pub use engine::{EngineStatsSnapshot, TaskEngine, TaskEngineConfig, TaskEngineParts};
pub use extractor::Extractor;
pub use rate_limit::{RateLimiter, RateLimiterConfig, RatePermit};
pub use signals::{Ewma, ZScoreDetector};
pub use single_flight::{FlightResult, SingleFlight, SingleFlightConfig};
pub use throttler::{AdaptiveThrottler, ThrottleReason, ThrottlerConfig, ThrottlerStatus};
