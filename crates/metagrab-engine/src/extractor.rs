use chromiumoxide::Page;
use metagrab_metrics::EngineMetrics;
use metagrab_types::{Mode, PageMetadata, ScrapeError};
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;

/// OG-style essentials plus the page URL.
const SIMPLE_SCRIPT: &str = r#"() => {
    const get = s => document.querySelector(s)?.content || null;
    return {
        title: get('meta[property="og:title"]') || document.title || null,
        description: get('meta[property="og:description"]') || get('meta[name="description"]') || null,
        image: get('meta[property="og:image"]') || null,
        canonical_url: get('meta[property="og:url"]') || window.location.href
    };
}"#;

/// All meta tags (bounded), categorised og/twitter submaps and bounded
/// image/video inventories.
const FULL_SCRIPT: &str = r#"() => {
    const result = {
        title: document.title || null,
        og_data: {},
        twitter_data: {},
        meta_tags: {},
        images: [],
        videos: []
    };
    Array.from(document.querySelectorAll('meta')).slice(0, 50).forEach(m => {
        const prop = m.getAttribute('property') || m.getAttribute('name');
        const content = m.getAttribute('content');
        if (prop && content) {
            result.meta_tags[prop] = content;
            if (prop.startsWith('og:')) result.og_data[prop.substring(3)] = content;
            else if (prop.startsWith('twitter:')) result.twitter_data[prop.substring(8)] = content;
        }
    });
    Array.from(document.querySelectorAll('img[src]')).slice(0, 20).forEach(img => {
        try {
            if (img.src && img.src.startsWith('http')) result.images.push({src: img.src, alt: img.alt || ''});
        } catch (e) {}
    });
    Array.from(document.querySelectorAll('video[src]')).slice(0, 20).forEach(v => {
        try { if (v.src) result.videos.push(v.src); } catch (e) {}
    });
    return result;
}"#;

/// `full` plus the longest plausible article text (bounded to 2 KB) and
/// parsed JSON-LD payloads (bounded to 5 documents).
const SUPER_SCRIPT: &str = r#"() => {
    const result = {
        title: document.title || null,
        og_data: {},
        twitter_data: {},
        meta_tags: {},
        images: [],
        videos: [],
        article_text: null,
        json_ld: []
    };
    Array.from(document.querySelectorAll('meta')).slice(0, 50).forEach(m => {
        const prop = m.getAttribute('property') || m.getAttribute('name');
        const content = m.getAttribute('content');
        if (prop && content) {
            result.meta_tags[prop] = content;
            if (prop.startsWith('og:')) result.og_data[prop.substring(3)] = content;
            else if (prop.startsWith('twitter:')) result.twitter_data[prop.substring(8)] = content;
        }
    });
    Array.from(document.querySelectorAll('img[src]')).slice(0, 20).forEach(img => {
        try {
            if (img.src && img.src.startsWith('http')) result.images.push({src: img.src, alt: img.alt || ''});
        } catch (e) {}
    });
    Array.from(document.querySelectorAll('video[src]')).slice(0, 20).forEach(v => {
        try { if (v.src) result.videos.push(v.src); } catch (e) {}
    });
    const selectors = [
        'article',
        '[role="article"]',
        'div[data-testid="post_message"]',
        'div[data-ad-preview="message"]',
        'div[data-ft]',
        'main'
    ];
    for (const s of selectors) {
        const el = document.querySelector(s);
        if (el && el.innerText && el.innerText.trim().length > 20) {
            result.article_text = el.innerText.trim().substring(0, 2000);
            break;
        }
    }
    if (!result.article_text) {
        const p = document.querySelector('p');
        if (p && p.innerText && p.innerText.trim().length > 20) {
            result.article_text = p.innerText.trim().substring(0, 2000);
        }
    }
    Array.from(document.querySelectorAll('script[type="application/ld+json"]')).slice(0, 5).forEach(s => {
        try { result.json_ld.push(JSON.parse(s.textContent)); } catch (e) {}
    });
    return result;
}"#;

/// Mode-dispatched DOM extraction, executed inside the page.
///
/// Extraction is pure on a fixed DOM: the scripts only read, never mutate,
/// so a retry on the same document yields the same payload.
pub struct Extractor {
    metrics: Option<Arc<EngineMetrics>>,
}

impl Extractor {
    pub fn new(metrics: Option<Arc<EngineMetrics>>) -> Self {
        Self { metrics }
    }

    pub fn script_for(mode: Mode) -> &'static str {
        match mode {
            Mode::Simple => SIMPLE_SCRIPT,
            Mode::Full => FULL_SCRIPT,
            Mode::Super => SUPER_SCRIPT,
        }
    }

    /// Run the mode's script and decode the payload. Returns the metadata
    /// and the extraction duration in seconds.
    pub async fn extract(
        &self,
        page: &Page,
        mode: Mode,
    ) -> Result<(PageMetadata, f64), ScrapeError> {
        let start = Instant::now();

        let evaluated = page
            .evaluate(Self::script_for(mode))
            .await
            .map_err(|e| ScrapeError::Extraction(format!("script failed: {e}")))?;
        let metadata: PageMetadata = evaluated
            .into_value()
            .map_err(|e| ScrapeError::Extraction(format!("unexpected payload shape: {e}")))?;

        let extraction_time = start.elapsed().as_secs_f64();
        if let Some(m) = &self.metrics {
            m.extraction_duration
                .with_label_values(&[mode.as_str()])
                .observe(extraction_time);
        }
        debug!(mode = %mode, extraction_time, "Extraction completed");

        Ok((metadata, extraction_time))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scripts_are_bounded() {
        for script in [FULL_SCRIPT, SUPER_SCRIPT] {
            assert!(script.contains("slice(0, 50)"), "meta tags must be bounded");
            assert!(script.contains("slice(0, 20)"), "inventories must be bounded");
        }
        assert!(SUPER_SCRIPT.contains("substring(0, 2000)"));
        assert!(SUPER_SCRIPT.contains("slice(0, 5)"));
    }

    #[test]
    fn script_dispatch_by_mode() {
        assert!(Extractor::script_for(Mode::Simple).contains("og:title"));
        assert!(Extractor::script_for(Mode::Full).contains("twitter_data"));
        assert!(Extractor::script_for(Mode::Super).contains("json_ld"));
    }

    #[test]
    fn simple_payload_shape_decodes() {
        // Mirror of what SIMPLE_SCRIPT evaluates to in the page.
        let payload = serde_json::json!({
            "title": "A post",
            "description": null,
            "image": "https://img.example.com/1.jpg",
            "canonical_url": "https://example.com/post/1"
        });
        let meta: PageMetadata = serde_json::from_value(payload).unwrap();
        assert_eq!(meta.title.as_deref(), Some("A post"));
        assert_eq!(meta.description, None);
        assert!(meta.og_data.is_empty());
    }

    #[test]
    fn super_payload_shape_decodes() {
        let payload = serde_json::json!({
            "title": "A post",
            "og_data": {"title": "A post", "type": "article"},
            "twitter_data": {"card": "summary"},
            "meta_tags": {"og:title": "A post"},
            "images": [{"src": "https://img.example.com/1.jpg", "alt": ""}],
            "videos": ["https://cdn.example.com/v.mp4"],
            "article_text": "Some body text that is long enough.",
            "json_ld": [{"@type": "NewsArticle"}]
        });
        let meta: PageMetadata = serde_json::from_value(payload).unwrap();
        assert_eq!(meta.og_data.get("type").map(String::as_str), Some("article"));
        assert_eq!(meta.images.len(), 1);
        assert_eq!(meta.json_ld.len(), 1);
        assert!(meta.article_text.is_some());
    }
}
