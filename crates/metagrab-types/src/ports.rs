use async_trait::async_trait;

use crate::{Mode, ScrapeOutcome};

/// Port implemented by the task engine and consumed by workers.
///
/// Workers stay decoupled from the engine's internals (browser pool, caches,
/// coordination) and can be exercised in tests with a stub processor.
#[async_trait]
pub trait MetadataProcessor: Send + Sync {
    /// Produce the outcome for one URL in the given mode. Never panics and
    /// never returns `Err`: failures are encoded in the outcome itself so a
    /// bad URL cannot fail its enclosing job.
    async fn process(&self, url: &str, mode: Mode) -> ScrapeOutcome;
}
