pub mod health;
pub mod jobs;
pub mod scaling;
pub mod scrape;
pub mod stream;

use crate::errors::ApiError;
use metagrab_types::validate_url;

/// Shared request validation: non-empty, bounded, well-formed URLs only.
pub(crate) fn validate_urls(urls: &[String]) -> Result<(), ApiError> {
    if urls.is_empty() {
        return Err(ApiError::validation("urls must not be empty"));
    }
    if urls.len() > 2000 {
        return Err(ApiError::validation(format!(
            "too many urls in one request: {} (max 2000)",
            urls.len()
        )));
    }
    for url in urls {
        validate_url(url).map_err(|e| ApiError::validation(e.to_string()))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_empty_and_malformed() {
        assert!(validate_urls(&[]).is_err());
        assert!(validate_urls(&["not a url".to_string()]).is_err());
        assert!(validate_urls(&["https://site/ok".to_string()]).is_ok());
    }
}
