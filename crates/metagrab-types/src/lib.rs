//! Shared domain types for the metagrab extraction engine.
//!
//! Everything that crosses a crate boundary lives here: the extraction
//! [`Mode`], the [`ScrapeOutcome`] produced for every URL, error kinds and
//! the [`ScrapeError`] domain error, cache-key derivation, and the
//! [`MetadataProcessor`] port implemented by the task engine and consumed
//! by the worker pool.

mod error;
mod key;
mod mode;
mod outcome;
mod ports;

pub use error::{ErrorKind, ScrapeError};
pub use key::cache_key;
pub use mode::Mode;
pub use outcome::{ImageRef, PageMetadata, ScrapeOutcome};
pub use ports::MetadataProcessor;

use url::Url;

/// Validate a submitted URL before any queueing or scraping happens.
///
/// Only absolute http/https URLs are accepted; anything else is rejected
/// with [`ScrapeError::InvalidInput`] so it never consumes engine resources.
pub fn validate_url(raw: &str) -> Result<Url, ScrapeError> {
    let parsed = Url::parse(raw)
        .map_err(|e| ScrapeError::InvalidInput(format!("invalid url {raw:?}: {e}")))?;
    match parsed.scheme() {
        "http" | "https" => Ok(parsed),
        other => Err(ScrapeError::InvalidInput(format!(
            "unsupported scheme {other:?} in {raw:?}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_http_and_https() {
        assert!(validate_url("https://example.com/post/1").is_ok());
        assert!(validate_url("http://example.com").is_ok());
    }

    #[test]
    fn rejects_garbage_and_other_schemes() {
        assert!(validate_url("not a url").is_err());
        assert!(validate_url("ftp://example.com").is_err());
        assert!(validate_url("javascript:alert(1)").is_err());
    }
}
