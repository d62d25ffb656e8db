use metagrab_engine::{EngineStatsSnapshot, ThrottlerStatus};
use metagrab_headless::PagePoolStats;
use metagrab_types::{Mode, ScrapeOutcome};
use metagrab_workers::ScalingStatus;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Batch and streaming request body.
#[derive(Debug, Deserialize)]
pub struct ScrapeRequest {
    pub urls: Vec<String>,
    #[serde(default)]
    pub mode: Option<Mode>,
    #[serde(default)]
    pub chunk_size: Option<usize>,
    #[serde(default)]
    pub max_concurrent: Option<usize>,
}

/// Aggregate block of a batch response.
#[derive(Debug, Serialize, PartialEq)]
pub struct ScrapeSummary {
    pub successful: usize,
    pub failed: usize,
    pub cache_hits: usize,
    pub cache_misses: usize,
    pub avg_scrape_time: f64,
}

impl ScrapeSummary {
    pub fn from_results(results: &HashMap<String, ScrapeOutcome>) -> Self {
        let successful = results.values().filter(|o| o.success).count();
        let cache_hits = results.values().filter(|o| o.from_cache).count();
        let total_time: f64 = results.values().map(|o| o.scrape_time).sum();
        Self {
            successful,
            failed: results.len() - successful,
            cache_hits,
            cache_misses: results.len() - cache_hits,
            avg_scrape_time: if results.is_empty() {
                0.0
            } else {
                total_time / results.len() as f64
            },
        }
    }
}

#[derive(Debug, Serialize)]
pub struct BatchResponse {
    pub success: bool,
    pub total_urls: usize,
    pub mode: Mode,
    pub results: HashMap<String, ScrapeOutcome>,
    pub summary: ScrapeSummary,
    pub total_time: f64,
}

#[derive(Debug, Deserialize)]
pub struct SingleQuery {
    pub url: String,
    #[serde(default)]
    pub mode: Option<Mode>,
}

/// One NDJSON line of the streaming response.
#[derive(Debug, Serialize)]
pub struct StreamItem {
    pub url: String,
    pub data: ScrapeOutcome,
}

#[derive(Debug, Deserialize)]
pub struct JobsRequest {
    pub urls: Vec<String>,
    #[serde(default)]
    pub mode: Option<Mode>,
    #[serde(default)]
    pub chunk_size: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct JobsResponse {
    pub job_ids: Vec<Uuid>,
    pub total_urls: usize,
    pub chunks: usize,
}

/// Manual scaling commands.
#[derive(Debug, Deserialize, PartialEq)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ManualScalingRequest {
    ScaleUp,
    ScaleDown,
    SetWorkers { workers: usize },
}

#[derive(Debug, Serialize)]
pub struct ManualScalingResponse {
    pub workers: usize,
}

/// Externally sampled worker/browser memory, fed to throttler and scaler.
#[derive(Debug, Deserialize)]
pub struct MemoryReport {
    pub worker_id: String,
    pub memory_mb: f64,
}

#[derive(Debug, Serialize)]
pub struct ScalingStatusResponse {
    pub scaling: ScalingStatus,
    pub throttler: ThrottlerStatus,
    pub pool: PagePoolStats,
    pub engine: EngineStatsSnapshot,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub uptime_secs: u64,
    pub workers: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub redis_healthy: Option<bool>,
    pub active_contexts: usize,
    pub active_pages: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use metagrab_types::{ErrorKind, PageMetadata};

    #[test]
    fn summary_counts_success_and_cache() {
        let mut results = HashMap::new();
        let mut hit = ScrapeOutcome::success(
            "https://site/a",
            Mode::Simple,
            PageMetadata::default(),
            2.0,
            1.0,
            0.2,
        );
        hit.from_cache = true;
        results.insert(hit.url.clone(), hit);
        results.insert(
            "https://site/b".to_string(),
            ScrapeOutcome::success(
                "https://site/b",
                Mode::Simple,
                PageMetadata::default(),
                4.0,
                2.0,
                0.4,
            ),
        );
        results.insert(
            "https://site/c".to_string(),
            ScrapeOutcome::failure(
                "https://site/c",
                Mode::Simple,
                ErrorKind::RateLimited,
                "upstream 429",
            ),
        );

        let summary = ScrapeSummary::from_results(&results);
        assert_eq!(summary.successful, 2);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.cache_hits, 1);
        assert_eq!(summary.cache_misses, 2);
        assert!((summary.avg_scrape_time - 2.0).abs() < 1e-9);
    }

    #[test]
    fn manual_scaling_actions_parse() {
        let up: ManualScalingRequest = serde_json::from_str(r#"{"action":"scale_up"}"#).unwrap();
        assert_eq!(up, ManualScalingRequest::ScaleUp);

        let set: ManualScalingRequest =
            serde_json::from_str(r#"{"action":"set_workers","workers":4}"#).unwrap();
        assert_eq!(set, ManualScalingRequest::SetWorkers { workers: 4 });
    }

    #[test]
    fn scrape_request_defaults() {
        let req: ScrapeRequest =
            serde_json::from_str(r#"{"urls":["https://site/a"]}"#).unwrap();
        assert_eq!(req.urls.len(), 1);
        assert!(req.mode.is_none());
        assert!(req.chunk_size.is_none());
    }
}
