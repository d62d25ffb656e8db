use anyhow::{anyhow, Context, Result};
use chromiumoxide::cdp::browser_protocol::browser::BrowserContextId;
use chromiumoxide::cdp::browser_protocol::network::{
    EnableParams, SetBlockedUrLsParams, SetUserAgentOverrideParams,
};
use chromiumoxide::cdp::browser_protocol::target::{
    CreateBrowserContextParams, CreateTargetParams, DisposeBrowserContextParams,
};
use chromiumoxide::{Browser, BrowserConfig, Page};
use futures::StreamExt;
use metagrab_metrics::EngineMetrics;
use rand::seq::SliceRandom;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::time::timeout;
use tracing::{debug, info, warn};

const USER_AGENTS: &[&str] = &[
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
];

const BLOCKED_TRACKER_DOMAINS: &[&str] = &[
    "google-analytics",
    "doubleclick",
    "googlesyndication",
    "adsystem",
    "analytics",
];

/// Configuration for the page pool.
#[derive(Debug, Clone)]
pub struct PagePoolConfig {
    /// Maximum live (non-retired) browser contexts.
    pub max_contexts: usize,
    /// Pages created per context.
    pub max_pages_per_context: usize,
    /// Loans served by one context before it is retired and replaced.
    pub context_reuse_limit: u64,
    /// Load images (disabled for bulk scraping).
    pub enable_images: bool,
    pub headless: bool,
    /// Timeout for the about:blank reset on release.
    pub reset_timeout: Duration,
}

impl Default for PagePoolConfig {
    fn default() -> Self {
        Self {
            max_contexts: 5,
            max_pages_per_context: 5,
            context_reuse_limit: 250,
            enable_images: false,
            headless: true,
            reset_timeout: Duration::from_secs(3),
        }
    }
}

/// URL patterns installed once per page via `Network.setBlockedURLs`.
fn blocked_url_patterns(enable_images: bool) -> Vec<String> {
    let mut patterns: Vec<String> = BLOCKED_TRACKER_DOMAINS
        .iter()
        .map(|d| format!("*{d}*"))
        .collect();
    for ext in ["mp4", "webm", "avi", "mov", "mp3", "m4a"] {
        patterns.push(format!("*.{ext}*"));
    }
    if !enable_images {
        for ext in ["png", "jpg", "jpeg", "gif", "webp", "svg", "ico"] {
            patterns.push(format!("*.{ext}*"));
        }
    }
    patterns
}

struct ContextSlot {
    cdp_id: BrowserContextId,
    loans: u64,
    live_pages: usize,
    retired: bool,
    disposed: bool,
}

struct PooledPage {
    page: Page,
    slot: usize,
}

struct PoolState {
    contexts: Vec<ContextSlot>,
    available: VecDeque<PooledPage>,
    /// Live pages (queued + loaned) across all contexts.
    total_pages: usize,
}

impl PoolState {
    fn active_contexts(&self) -> usize {
        self.contexts.iter().filter(|c| !c.retired).count()
    }
}

struct PoolShared {
    // Lock order: never hold `state` while taking `browser`. Creation takes
    // `browser` first (serializing growth), everything else takes `state`
    // alone.
    browser: Mutex<Browser>,
    state: Mutex<PoolState>,
    returned: Notify,
    config: PagePoolConfig,
    metrics: Option<Arc<EngineMetrics>>,
}

/// Pool of browser contexts and pages with reuse/rotation caps.
///
/// One browser process, up to `max_contexts` live contexts, each with
/// `max_pages_per_context` long-lived pages. Contexts rotate user agents and
/// are retired after `context_reuse_limit` loans to bound memory growth and
/// invalidate session fingerprints. Cookies and storage are deliberately not
/// cleared between loans; the reset on release only navigates to
/// `about:blank` to shed page memory.
pub struct PagePool {
    shared: Arc<PoolShared>,
    handler_task: tokio::task::JoinHandle<()>,
}

/// Pool statistics for the admin surface.
#[derive(Debug, Clone, serde::Serialize)]
pub struct PagePoolStats {
    pub active_contexts: usize,
    pub active_pages: usize,
    pub available_pages: usize,
    pub max_contexts: usize,
    pub max_pages_per_context: usize,
}

impl PagePool {
    /// Launch the browser and create the first context.
    ///
    /// A launch failure here is fatal to the engine: without a browser there
    /// is nothing to degrade to.
    pub async fn launch(
        config: PagePoolConfig,
        metrics: Option<Arc<EngineMetrics>>,
    ) -> Result<Self> {
        let browser_config = Self::build_browser_config(&config)?;

        info!(
            max_contexts = config.max_contexts,
            max_pages_per_context = config.max_pages_per_context,
            context_reuse_limit = config.context_reuse_limit,
            "Launching browser for page pool"
        );

        let (browser, mut handler) = Browser::launch(browser_config)
            .await
            .context("Failed to launch browser")?;

        let handler_task = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(e) = event {
                    warn!(error = %e, "Browser event error");
                }
            }
            debug!("Browser event handler ended");
        });

        let shared = Arc::new(PoolShared {
            browser: Mutex::new(browser),
            state: Mutex::new(PoolState {
                contexts: Vec::new(),
                available: VecDeque::new(),
                total_pages: 0,
            }),
            returned: Notify::new(),
            config,
            metrics,
        });

        // First context is created eagerly so init failures surface at
        // startup instead of on the first request.
        if !shared.create_context().await? {
            return Err(anyhow!("Pool configured with max_contexts = 0"));
        }

        Ok(Self {
            shared,
            handler_task,
        })
    }

    fn build_browser_config(config: &PagePoolConfig) -> Result<BrowserConfig> {
        let mut builder = BrowserConfig::builder()
            .arg("--disable-blink-features=AutomationControlled")
            .arg("--no-sandbox")
            .arg("--disable-setuid-sandbox")
            .arg("--disable-dev-shm-usage")
            .arg("--disable-gpu")
            .arg("--disable-software-rasterizer")
            .arg("--disable-background-timer-throttling")
            .arg("--disable-backgrounding-occluded-windows")
            .arg("--disable-renderer-backgrounding")
            .arg("--window-size=1280,720");
        if !config.enable_images {
            builder = builder.arg("--blink-settings=imagesEnabled=false");
        }
        if !config.headless {
            builder = builder.with_head();
        }
        builder
            .build()
            .map_err(|e| anyhow!("Failed to build browser config: {e}"))
    }

    /// Acquire a page, creating a new context on demand up to the ceiling.
    /// Suspends until a page is returned when the pool is saturated.
    pub async fn acquire(&self) -> Result<PageLease> {
        self.shared.clone().acquire().await
    }

    pub async fn stats(&self) -> PagePoolStats {
        let state = self.shared.state.lock().await;
        PagePoolStats {
            active_contexts: state.active_contexts(),
            active_pages: state.total_pages,
            available_pages: state.available.len(),
            max_contexts: self.shared.config.max_contexts,
            max_pages_per_context: self.shared.config.max_pages_per_context,
        }
    }

    /// Close all pooled pages and contexts, then the browser itself.
    pub async fn shutdown(&self) -> Result<()> {
        info!("Shutting down page pool");

        let (pages, context_ids) = {
            let mut guard = self.shared.state.lock().await;
            let state = &mut *guard;
            let pages: Vec<Page> = state.available.drain(..).map(|p| p.page).collect();
            let ids: Vec<BrowserContextId> = state
                .contexts
                .iter_mut()
                .filter(|c| !c.disposed)
                .map(|c| {
                    c.disposed = true;
                    c.retired = true;
                    c.cdp_id.clone()
                })
                .collect();
            state.total_pages = 0;
            (pages, ids)
        };

        for page in pages {
            let _ = page.close().await;
        }

        let mut browser = self.shared.browser.lock().await;
        for id in context_ids {
            let _ = browser
                .execute(DisposeBrowserContextParams {
                    browser_context_id: id,
                })
                .await;
        }
        browser
            .close()
            .await
            .context("Failed to close browser during shutdown")?;
        self.handler_task.abort();
        Ok(())
    }
}

impl PoolShared {
    async fn acquire(self: Arc<Self>) -> Result<PageLease> {
        loop {
            let popped = {
                let mut state = self.state.lock().await;
                state.available.pop_front()
            };

            if let Some(pooled) = popped {
                let mut stale_pages: Vec<PooledPage> = Vec::new();
                let mut straggler: Option<bool> = None;

                {
                    let mut guard = self.state.lock().await;
                    let state = &mut *guard;
                    let slot = &mut state.contexts[pooled.slot];

                    if slot.retired {
                        slot.live_pages = slot.live_pages.saturating_sub(1);
                        state.total_pages = state.total_pages.saturating_sub(1);
                        straggler = Some(slot.live_pages == 0);
                    } else {
                        slot.loans += 1;
                        if slot.loans >= self.config.context_reuse_limit {
                            info!(
                                context = pooled.slot,
                                loans = slot.loans,
                                "Context reached reuse limit, retiring"
                            );
                            slot.retired = true;
                            // Drop the retired context's queued pages now; the
                            // replacement is created by the next starved acquire.
                            let mut kept = VecDeque::new();
                            while let Some(p) = state.available.pop_front() {
                                if p.slot == pooled.slot {
                                    stale_pages.push(p);
                                } else {
                                    kept.push_back(p);
                                }
                            }
                            state.available = kept;
                            slot.live_pages -= stale_pages.len();
                            state.total_pages -= stale_pages.len();
                        }
                    }
                }

                if let Some(dispose) = straggler {
                    // Page from an already-retired context: close and retry.
                    let _ = pooled.page.close().await;
                    if dispose {
                        self.dispose_context(pooled.slot).await;
                    }
                    self.publish_gauges().await;
                    continue;
                }

                for p in stale_pages {
                    let _ = p.page.close().await;
                }
                self.publish_gauges().await;

                return Ok(PageLease {
                    shared: self.clone(),
                    slot: pooled.slot,
                    page: Some(pooled.page),
                    broken: false,
                });
            }

            // Nothing available: grow the pool if under the context ceiling,
            // otherwise wait for a release.
            if !self.create_context().await? {
                self.returned.notified().await;
            }
        }
    }

    /// Create a fresh CDP browser context with a rotated user agent and its
    /// full complement of pages. Returns false when at the context ceiling.
    ///
    /// Creation serializes on the browser lock, which also makes the
    /// ceiling check race-free.
    async fn create_context(&self) -> Result<bool> {
        let browser = self.browser.lock().await;

        {
            let state = self.state.lock().await;
            if state.active_contexts() >= self.config.max_contexts {
                return Ok(false);
            }
        }

        let created = browser
            .execute(CreateBrowserContextParams::default())
            .await
            .context("Failed to create browser context")?;
        let cdp_id = created.browser_context_id.clone();

        let user_agent = USER_AGENTS
            .choose(&mut rand::thread_rng())
            .copied()
            .unwrap_or(USER_AGENTS[0])
            .to_string();

        let slot_idx = {
            let mut state = self.state.lock().await;
            state.contexts.push(ContextSlot {
                cdp_id: cdp_id.clone(),
                loans: 0,
                live_pages: 0,
                retired: false,
                disposed: false,
            });
            state.contexts.len() - 1
        };

        for _ in 0..self.config.max_pages_per_context {
            let params = CreateTargetParams::builder()
                .url("about:blank")
                .browser_context_id(cdp_id.clone())
                .build()
                .map_err(|e| anyhow!("Failed to build target params: {e}"))?;
            let page = browser
                .new_page(params)
                .await
                .context("Failed to create page in context")?;
            self.install_resource_filter(&page, &user_agent).await?;

            let mut state = self.state.lock().await;
            state.contexts[slot_idx].live_pages += 1;
            state.total_pages += 1;
            state.available.push_back(PooledPage {
                page,
                slot: slot_idx,
            });
        }

        info!(
            context = slot_idx,
            pages = self.config.max_pages_per_context,
            user_agent = %user_agent,
            "Browser context created"
        );
        self.publish_gauges().await;
        self.returned.notify_waiters();
        Ok(true)
    }

    /// Request-interception policy, installed once per page: block known
    /// tracker domains and media always, images when disabled, and pin the
    /// context's user agent.
    async fn install_resource_filter(&self, page: &Page, user_agent: &str) -> Result<()> {
        page.execute(EnableParams::default())
            .await
            .context("Failed to enable network domain")?;
        page.execute(SetUserAgentOverrideParams {
            user_agent: user_agent.to_string(),
            accept_language: Some("en-US,en;q=0.5".to_string()),
            platform: None,
            user_agent_metadata: None,
        })
        .await
        .context("Failed to set user agent")?;
        page.execute(SetBlockedUrLsParams {
            urls: blocked_url_patterns(self.config.enable_images),
        })
        .await
        .context("Failed to install blocked URL patterns")?;
        Ok(())
    }

    async fn dispose_context(&self, slot_idx: usize) {
        let cdp_id = {
            let mut state = self.state.lock().await;
            let slot = &mut state.contexts[slot_idx];
            if slot.disposed {
                return;
            }
            slot.disposed = true;
            slot.cdp_id.clone()
        };

        let browser = self.browser.lock().await;
        if let Err(e) = browser
            .execute(DisposeBrowserContextParams {
                browser_context_id: cdp_id,
            })
            .await
        {
            warn!(context = slot_idx, error = %e, "Failed to dispose browser context");
        } else {
            debug!(context = slot_idx, "Browser context disposed");
        }
    }

    async fn publish_gauges(&self) {
        if let Some(m) = &self.metrics {
            let state = self.state.lock().await;
            m.active_contexts.set(state.active_contexts() as f64);
            m.active_pages.set(state.total_pages as f64);
        }
    }

    /// Return a loaned page. Healthy pages are reset to `about:blank` and
    /// requeued; broken pages are closed and the pool refills lazily.
    async fn release(self: Arc<Self>, slot_idx: usize, page: Page, broken: bool) {
        let retired = {
            let state = self.state.lock().await;
            state.contexts[slot_idx].retired
        };

        let keep = if broken || retired {
            false
        } else {
            match timeout(self.config.reset_timeout, page.goto("about:blank")).await {
                Ok(Ok(_)) => true,
                Ok(Err(e)) => {
                    warn!(context = slot_idx, error = %e, "Page reset failed, closing page");
                    false
                }
                Err(_) => {
                    warn!(context = slot_idx, "Page reset timed out, closing page");
                    false
                }
            }
        };

        if keep {
            let mut state = self.state.lock().await;
            state.available.push_back(PooledPage {
                page,
                slot: slot_idx,
            });
        } else {
            let _ = page.close().await;
            let dispose = {
                let mut guard = self.state.lock().await;
                let state = &mut *guard;
                let slot = &mut state.contexts[slot_idx];
                slot.live_pages = slot.live_pages.saturating_sub(1);
                state.total_pages = state.total_pages.saturating_sub(1);
                slot.retired && slot.live_pages == 0
            };
            if dispose {
                self.dispose_context(slot_idx).await;
            }
        }

        // Wake one waiter: either a page is back in the queue or the pool
        // shrank and a starved acquirer can grow it again.
        self.returned.notify_one();
        self.publish_gauges().await;
    }
}

/// A page loaned from the pool. Exactly one worker holds a lease at a time;
/// dropping it without an explicit release returns the page best-effort in
/// the background.
pub struct PageLease {
    shared: Arc<PoolShared>,
    slot: usize,
    page: Option<Page>,
    broken: bool,
}

impl PageLease {
    pub fn page(&self) -> &Page {
        self.page
            .as_ref()
            .expect("page is present until release/drop")
    }

    /// Mark the page as broken; it will be closed instead of requeued and
    /// the pool refills lazily.
    pub fn mark_broken(&mut self) {
        self.broken = true;
    }

    /// Return the page to the pool.
    pub async fn release(mut self) {
        if let Some(page) = self.page.take() {
            let shared = self.shared.clone();
            shared.release(self.slot, page, self.broken).await;
        }
    }
}

impl Drop for PageLease {
    fn drop(&mut self) {
        if let Some(page) = self.page.take() {
            warn!(
                context = self.slot,
                "PageLease dropped without explicit release, returning in background"
            );
            let shared = self.shared.clone();
            let slot = self.slot;
            let broken = self.broken;
            tokio::spawn(async move {
                shared.release(slot, page, broken).await;
            });
        }
    }
}

impl Drop for PagePool {
    fn drop(&mut self) {
        self.handler_task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_bounded() {
        let config = PagePoolConfig::default();
        assert!(config.max_contexts >= 1);
        assert!(config.max_pages_per_context >= 1);
        assert_eq!(config.context_reuse_limit, 250);
    }

    #[test]
    fn blocked_patterns_cover_trackers_and_media() {
        let patterns = blocked_url_patterns(true);
        assert!(patterns.iter().any(|p| p.contains("google-analytics")));
        assert!(patterns.iter().any(|p| p.contains(".mp4")));
        assert!(!patterns.iter().any(|p| p.contains(".jpg")));

        let with_images_blocked = blocked_url_patterns(false);
        assert!(with_images_blocked.iter().any(|p| p.contains(".jpg")));
        assert!(with_images_blocked.len() > patterns.len());
    }

    // Pool lifecycle tests need a Chrome/Chromium binary; exercised in a
    // real browser environment only.
    #[tokio::test]
    #[ignore] // Requires a local Chromium install
    async fn launch_acquire_release() {
        let pool = PagePool::launch(
            PagePoolConfig {
                max_contexts: 1,
                max_pages_per_context: 2,
                ..Default::default()
            },
            None,
        )
        .await
        .unwrap();

        let lease = pool.acquire().await.unwrap();
        let stats = pool.stats().await;
        assert_eq!(stats.active_pages, 2);
        assert_eq!(stats.available_pages, 1);
        lease.release().await;

        let stats = pool.stats().await;
        assert_eq!(stats.available_pages, 2);
        pool.shutdown().await.unwrap();
    }

    #[tokio::test]
    #[ignore] // Requires a local Chromium install
    async fn context_rotation_replaces_exactly_once() {
        let pool = PagePool::launch(
            PagePoolConfig {
                max_contexts: 2,
                max_pages_per_context: 1,
                context_reuse_limit: 3,
                ..Default::default()
            },
            None,
        )
        .await
        .unwrap();

        for _ in 0..5 {
            let lease = pool.acquire().await.unwrap();
            lease.release().await;
        }

        let stats = pool.stats().await;
        assert!(stats.active_pages <= 2);
        pool.shutdown().await.unwrap();
    }
}
