// src/browser/mod.rs
//! Browser-rendered fetching with identity rotation and block recovery.
//!
//! Every attempt runs in its own [`BrowserSession`]. Sessions are released explicitly on
//! every normal path; if a fetch future is dropped mid-flight (run timeout), the session's
//! `Drop` schedules the context teardown instead.

pub mod driver;
pub mod identity;
pub mod stealth;

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use metrics::{counter, gauge};
use rand::Rng;
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::acquire::html::{challenge_marker, is_captcha_marker};
use crate::error::{FetchError, FetchErrorKind};

pub use driver::{AutomationDriver, BrowserlessDriver, ContextHandle, ContextSpec, PageRequest, PageSnapshot};
pub use identity::{BrowserEngine, Identity, IdentityPool};
pub use stealth::{InteractionPlan, Viewport};

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BrowserConfig {
    pub engine: BrowserEngine,
    pub user_agents: Vec<String>,
    pub proxies: Vec<String>,
    pub max_attempts: u32,
    pub page_timeout_secs: u64,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    pub quarantine_secs: u64,
    pub simulate_interaction: bool,
    pub locale: String,
    pub timezone: String,
}

impl Default for BrowserConfig {
    fn default() -> Self {
        Self {
            engine: BrowserEngine::Chromium,
            user_agents: Vec::new(),
            proxies: Vec::new(),
            max_attempts: 3,
            page_timeout_secs: 30,
            backoff_base_ms: 1_000,
            backoff_max_ms: 8_000,
            quarantine_secs: 300,
            simulate_interaction: true,
            locale: "en-US".to_string(),
            timezone: "America/New_York".to_string(),
        }
    }
}

/// Scoped browser context. Call [`BrowserSession::release`]; dropping without releasing
/// still tears the context down on the runtime.
pub struct BrowserSession {
    ctx: Option<ContextHandle>,
    identity: Identity,
    viewport: Viewport,
    driver: Arc<dyn AutomationDriver>,
    active: Arc<AtomicUsize>,
}

impl BrowserSession {
    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    /// Viewport the context was opened with.
    pub fn viewport(&self) -> Viewport {
        self.viewport
    }

    pub async fn load(&self, request: &PageRequest) -> Result<PageSnapshot, FetchError> {
        match &self.ctx {
            Some(ctx) => self.driver.load(ctx, request).await,
            None => Err(FetchError::network(&request.url, "session already released")),
        }
    }

    pub async fn release(mut self) {
        if let Some(ctx) = self.ctx.take() {
            self.driver.close_context(&ctx).await;
            self.mark_closed();
        }
    }

    fn mark_closed(&self) {
        let now = self.active.fetch_sub(1, Ordering::SeqCst).saturating_sub(1);
        gauge!("browser_sessions_active").set(now as f64);
    }
}

impl Drop for BrowserSession {
    fn drop(&mut self) {
        let Some(ctx) = self.ctx.take() else {
            return;
        };
        self.mark_closed();
        let driver = self.driver.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    driver.close_context(&ctx).await;
                });
            }
            Err(_) => warn!(context = ctx.id, "no runtime to close abandoned browser context"),
        }
    }
}

pub struct BrowserSessionManager {
    driver: Arc<dyn AutomationDriver>,
    pool: IdentityPool,
    cfg: BrowserConfig,
    active: Arc<AtomicUsize>,
}

impl BrowserSessionManager {
    pub fn new(driver: Arc<dyn AutomationDriver>, cfg: BrowserConfig) -> Self {
        let pool = IdentityPool::new(
            cfg.engine,
            cfg.user_agents.clone(),
            cfg.proxies.clone(),
            Duration::from_secs(cfg.quarantine_secs),
        );
        Self {
            driver,
            pool,
            cfg,
            active: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn active_sessions(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    pub fn pool(&self) -> &IdentityPool {
        &self.pool
    }

    pub async fn open_session(&self, identity: Identity) -> Result<BrowserSession, FetchError> {
        let viewport = stealth::random_viewport();
        let spec = ContextSpec {
            headers: stealth::context_headers(identity.engine),
            identity: identity.clone(),
            viewport,
            locale: self.cfg.locale.clone(),
            timezone: self.cfg.timezone.clone(),
            init_script: stealth::STEALTH_SCRIPT.to_string(),
        };
        let ctx = self.driver.open_context(&spec).await?;
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        gauge!("browser_sessions_active").set(now as f64);
        Ok(BrowserSession {
            ctx: Some(ctx),
            identity,
            viewport,
            driver: self.driver.clone(),
            active: self.active.clone(),
        })
    }

    /// Render `url`, rotating identity after every blocked attempt. Identities blocked
    /// during this call are never reused by it and are quarantined for later calls.
    pub async fn fetch_page(&self, url: &str) -> Result<PageSnapshot, FetchError> {
        let max_attempts = self.cfg.max_attempts.max(1);
        let mut tried: HashSet<usize> = HashSet::new();
        let mut last_err: Option<FetchError> = None;

        for attempt in 1..=max_attempts {
            if attempt > 1 {
                tokio::time::sleep(self.backoff(attempt)).await;
            }
            let Some(identity) = self.pool.next(&tried) else {
                warn!(url, attempt, "no fresh browser identity left");
                break;
            };
            tried.insert(identity.id);
            debug!(url, attempt, identity = identity.id, proxy = ?identity.proxy, "browser attempt");

            let session = match self.open_session(identity.clone()).await {
                Ok(s) => s,
                Err(e) => {
                    last_err = Some(e);
                    continue;
                }
            };
            let interaction = if self.cfg.simulate_interaction {
                InteractionPlan::random(session.viewport())
            } else {
                InteractionPlan::none()
            };
            let request = PageRequest {
                url: url.to_string(),
                timeout: Duration::from_secs(self.cfg.page_timeout_secs),
                interaction,
            };
            let outcome = session.load(&request).await;
            session.release().await;

            match outcome.and_then(|snap| classify_snapshot(url, snap)) {
                Ok(snap) => {
                    info!(url, attempt, identity = identity.id, "browser fetch ok");
                    return Ok(snap);
                }
                Err(e) if matches!(e.kind, FetchErrorKind::Blocked | FetchErrorKind::Captcha) => {
                    counter!("browser_blocks_total", "kind" => e.kind.as_str()).increment(1);
                    warn!(url, attempt, identity = identity.id, error = %e, "blocked, rotating identity");
                    self.pool.quarantine(identity.id);
                    last_err = Some(e);
                }
                Err(e) => {
                    warn!(url, attempt, error = %e, "browser attempt failed");
                    last_err = Some(e);
                }
            }
        }

        Err(match last_err {
            Some(e) if matches!(e.kind, FetchErrorKind::Blocked | FetchErrorKind::Captcha) => {
                FetchError::blocked(url, format!("blocked after {} attempts: {}", tried.len(), e.message))
            }
            Some(e) => e,
            None => FetchError::blocked(url, "no browser identity available"),
        })
    }

    fn backoff(&self, attempt: u32) -> Duration {
        let base = self.cfg.backoff_base_ms.saturating_mul(1u64 << (attempt - 2).min(16));
        let capped = base.min(self.cfg.backoff_max_ms);
        let jitter = if capped > 0 {
            rand::rng().random_range(0..=capped / 2)
        } else {
            0
        };
        Duration::from_millis(capped / 2 + jitter)
    }
}

/// Turn a successful load into a block error when the page says so.
fn classify_snapshot(url: &str, snap: PageSnapshot) -> Result<PageSnapshot, FetchError> {
    if matches!(snap.status, 401 | 403 | 429) {
        return Err(FetchError::blocked(url, format!("HTTP {}", snap.status)));
    }
    if let Some(marker) = challenge_marker(snap.status, &snap.html) {
        return Err(if is_captcha_marker(marker) {
            FetchError::new(FetchErrorKind::Captcha, url, format!("challenge marker: {marker}"))
        } else {
            FetchError::blocked(url, format!("challenge marker: {marker}"))
        });
    }
    if snap.status >= 400 {
        return Err(FetchError::network(url, format!("HTTP {}", snap.status)));
    }
    Ok(snap)
}
