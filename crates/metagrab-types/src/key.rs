use sha2::{Digest, Sha256};

/// Canonical cache key for a URL: a fixed-length hex digest under a
/// versioned namespace. The same key indexes both cache tiers and the
/// single-flight coordination structures, so it must be stable across
/// processes.
pub fn cache_key(url: &str) -> String {
    let digest = Sha256::digest(url.as_bytes());
    format!("scrape:v1:{}", hex::encode(digest))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_is_stable_and_fixed_length() {
        let a = cache_key("https://example.com/post/1");
        let b = cache_key("https://example.com/post/1");
        assert_eq!(a, b);
        // "scrape:v1:" + 64 hex chars
        assert_eq!(a.len(), "scrape:v1:".len() + 64);
    }

    #[test]
    fn distinct_urls_get_distinct_keys() {
        assert_ne!(
            cache_key("https://example.com/a"),
            cache_key("https://example.com/b")
        );
    }
}
