use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::{ErrorKind, Mode};

/// An image reference collected by the full/super extractors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageRef {
    pub src: String,
    #[serde(default)]
    pub alt: String,
}

/// Mode-specific payload extracted from the page DOM.
///
/// The field set is the union across modes; absent fields are skipped on
/// serialization so a `simple` outcome stays small. The shape mirrors the
/// JSON object produced by the in-page extraction scripts.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PageMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    /// og:url (or the final location) as seen inside the page.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub canonical_url: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub og_data: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub twitter_data: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub meta_tags: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub images: Vec<ImageRef>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub videos: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub article_text: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub json_ld: Vec<serde_json::Value>,
}

/// The result produced for one URL, successful or synthesized on failure.
///
/// This is the unit stored in both cache tiers, published to single-flight
/// followers and returned over HTTP.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScrapeOutcome {
    pub url: String,
    pub mode: Mode,
    pub success: bool,
    pub from_cache: bool,
    /// End-to-end time of the scrape in seconds (0 for cache hits).
    pub scrape_time: f64,
    #[serde(default)]
    pub navigation_time: f64,
    #[serde(default)]
    pub extraction_time: f64,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub metadata: PageMetadata,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
}

impl ScrapeOutcome {
    /// Successful outcome with fresh timings.
    pub fn success(
        url: impl Into<String>,
        mode: Mode,
        metadata: PageMetadata,
        scrape_time: f64,
        navigation_time: f64,
        extraction_time: f64,
    ) -> Self {
        Self {
            url: url.into(),
            mode,
            success: true,
            from_cache: false,
            scrape_time,
            navigation_time,
            extraction_time,
            timestamp: Utc::now(),
            metadata,
            error: None,
            error_kind: None,
        }
    }

    /// Synthesized failure outcome.
    pub fn failure(
        url: impl Into<String>,
        mode: Mode,
        kind: ErrorKind,
        message: impl Into<String>,
    ) -> Self {
        Self {
            url: url.into(),
            mode,
            success: false,
            from_cache: false,
            scrape_time: 0.0,
            navigation_time: 0.0,
            extraction_time: 0.0,
            timestamp: Utc::now(),
            metadata: PageMetadata::default(),
            error: Some(message.into()),
            error_kind: Some(kind),
        }
    }

    /// Copy returned to a caller that was satisfied from a cache tier.
    pub fn as_cached(&self) -> Self {
        let mut out = self.clone();
        out.from_cache = true;
        out
    }

    /// Whether a failure outcome qualifies for a negative cache entry.
    pub fn is_negative_cacheable(&self) -> bool {
        !self.success
            && self
                .error_kind
                .map(|k| k.is_negative_cacheable())
                .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failure_outcomes_carry_kind_and_message() {
        let out = ScrapeOutcome::failure(
            "https://example.com/x",
            Mode::Simple,
            ErrorKind::RateLimited,
            "slow down",
        );
        assert!(!out.success);
        assert_eq!(out.error_kind, Some(ErrorKind::RateLimited));
        assert!(out.is_negative_cacheable());
    }

    #[test]
    fn service_unavailable_is_never_negative_cacheable() {
        let out = ScrapeOutcome::failure(
            "https://example.com/x",
            Mode::Simple,
            ErrorKind::ServiceUnavailable,
            "leader timeout",
        );
        assert!(!out.is_negative_cacheable());
    }

    #[test]
    fn cached_copy_flips_from_cache_only() {
        let out = ScrapeOutcome::success(
            "https://example.com/a",
            Mode::Full,
            PageMetadata {
                title: Some("t".into()),
                ..Default::default()
            },
            1.5,
            1.0,
            0.2,
        );
        let cached = out.as_cached();
        assert!(cached.from_cache);
        assert_eq!(cached.metadata.title.as_deref(), Some("t"));
        assert_eq!(cached.scrape_time, out.scrape_time);
    }

    #[test]
    fn serde_roundtrip_preserves_flattened_metadata() {
        let mut meta = PageMetadata::default();
        meta.title = Some("hello".into());
        meta.og_data.insert("title".into(), "hello".into());
        meta.images.push(ImageRef {
            src: "https://img.example.com/1.jpg".into(),
            alt: String::new(),
        });
        let out = ScrapeOutcome::success("https://example.com", Mode::Super, meta, 2.0, 1.2, 0.3);

        let json = serde_json::to_value(&out).unwrap();
        assert_eq!(json["title"], "hello");
        // empty collections are skipped
        assert!(json.get("twitter_data").is_none());
        assert!(json.get("error").is_none());

        let back: ScrapeOutcome = serde_json::from_value(json).unwrap();
        assert_eq!(back.metadata, out.metadata);
        assert_eq!(back.mode, Mode::Super);
    }
}
