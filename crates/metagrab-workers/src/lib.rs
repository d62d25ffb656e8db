//! Worker pool and job queue for the metagrab engine.
//!
//! Submissions are chunked into [`Job`]s on mode-partitioned queues; each
//! worker pulls round-robin across modes and drives a job's URLs through
//! the shared [`metagrab_types::MetadataProcessor`] with bounded
//! concurrency. The [`WorkerScaler`] watches queue wait-time percentiles,
//! per-mode queue lengths and worker memory; the pool carries out its
//! decisions.

mod job;
mod queue;
mod scaler;
mod worker;

pub use job::{Job, JobRegistry, JobStatus};
pub use queue::{JobQueue, QueuedJob};
pub use scaler::{ScalerConfig, ScalingAction, ScalingEvent, ScalingStatus, WorkerScaler};
pub use worker::{WorkerPool, WorkerPoolConfig};
