use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error classification shared by metrics labels, negative-cache policy and
/// the HTTP surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Upstream 429 or rate-limit heuristics in the failure message.
    RateLimited,
    /// Upstream interstitial that denies access without an HTTP error.
    Checkpoint,
    /// Page load failed after both navigation phases.
    NavigationError,
    /// Script failure inside the page.
    ExtractionError,
    /// Scrape gave up after exhausting its retries.
    ScrapingError,
    /// Timed out waiting on a single-flight leader.
    ServiceUnavailable,
    /// Redis lock/pub-sub failure while coordinating.
    CoordinationError,
    /// Malformed URL, rejected before queueing.
    InputError,
    /// Invariant breach.
    InternalError,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::RateLimited => "rate_limited",
            ErrorKind::Checkpoint => "checkpoint",
            ErrorKind::NavigationError => "navigation_error",
            ErrorKind::ExtractionError => "extraction_error",
            ErrorKind::ScrapingError => "scraping_error",
            ErrorKind::ServiceUnavailable => "service_unavailable",
            ErrorKind::CoordinationError => "coordination_error",
            ErrorKind::InputError => "input_error",
            ErrorKind::InternalError => "internal_error",
        }
    }

    /// Kinds that get a short-lived negative cache entry.
    ///
    /// `service_unavailable` is deliberately excluded: it is transient and
    /// caller-specific, caching it would poison followers of a healthy
    /// leader.
    pub fn is_negative_cacheable(&self) -> bool {
        matches!(
            self,
            ErrorKind::RateLimited | ErrorKind::Checkpoint | ErrorKind::ScrapingError
        )
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Domain error for a single scrape attempt.
#[derive(Debug, Error)]
pub enum ScrapeError {
    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("checkpoint page encountered: {0}")]
    Checkpoint(String),

    #[error("navigation failed for {url}: {message}")]
    Navigation { url: String, message: String },

    #[error("extraction failed: {0}")]
    Extraction(String),

    #[error("service temporarily unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("coordination failed: {0}")]
    Coordination(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("cache error: {0}")]
    Cache(String),

    #[error("browser error: {0}")]
    Browser(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl ScrapeError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ScrapeError::RateLimited(_) => ErrorKind::RateLimited,
            ScrapeError::Checkpoint(_) => ErrorKind::Checkpoint,
            ScrapeError::Navigation { .. } => ErrorKind::NavigationError,
            ScrapeError::Extraction(_) => ErrorKind::ExtractionError,
            ScrapeError::ServiceUnavailable(_) => ErrorKind::ServiceUnavailable,
            ScrapeError::Coordination(_) => ErrorKind::CoordinationError,
            ScrapeError::InvalidInput(_) => ErrorKind::InputError,
            ScrapeError::Cache(_) => ErrorKind::CoordinationError,
            ScrapeError::Browser(_) => ErrorKind::ScrapingError,
            ScrapeError::Internal(_) => ErrorKind::InternalError,
        }
    }

    /// Classify a raw failure message from the page driver.
    ///
    /// The upstream site does not return clean status codes for throttling
    /// or interstitials, so the driver message text is the only signal.
    pub fn classify_message(message: &str) -> ErrorKind {
        let lower = message.to_ascii_lowercase();
        if lower.contains("rate") || lower.contains("limit") || lower.contains("429") {
            ErrorKind::RateLimited
        } else if lower.contains("checkpoint") || lower.contains("restricted") {
            ErrorKind::Checkpoint
        } else {
            ErrorKind::ScrapingError
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_rate_limit_messages() {
        assert_eq!(
            ScrapeError::classify_message("HTTP 429 Too Many Requests"),
            ErrorKind::RateLimited
        );
        assert_eq!(
            ScrapeError::classify_message("request was rate limited upstream"),
            ErrorKind::RateLimited
        );
    }

    #[test]
    fn classify_checkpoint_messages() {
        assert_eq!(
            ScrapeError::classify_message("redirected to checkpoint challenge"),
            ErrorKind::Checkpoint
        );
        assert_eq!(
            ScrapeError::classify_message("content is Restricted in your region"),
            ErrorKind::Checkpoint
        );
    }

    #[test]
    fn classify_falls_back_to_scraping_error() {
        assert_eq!(
            ScrapeError::classify_message("net::ERR_CONNECTION_RESET"),
            ErrorKind::ScrapingError
        );
    }

    #[test]
    fn negative_cache_policy() {
        assert!(ErrorKind::RateLimited.is_negative_cacheable());
        assert!(ErrorKind::Checkpoint.is_negative_cacheable());
        assert!(ErrorKind::ScrapingError.is_negative_cacheable());
        assert!(!ErrorKind::ServiceUnavailable.is_negative_cacheable());
        assert!(!ErrorKind::CoordinationError.is_negative_cacheable());
    }

    #[test]
    fn kind_serializes_snake_case() {
        let json = serde_json::to_string(&ErrorKind::ServiceUnavailable).unwrap();
        assert_eq!(json, "\"service_unavailable\"");
    }
}
