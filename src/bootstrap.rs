// src/bootstrap.rs
//! Explicit construction of every service from `Settings`. Nothing here is global; the
//! binary and the tests build a `Runtime` and hand its pieces to the router.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::acquire::{FeedStrategy, StrategySet, WebStrategy};
use crate::browser::{BrowserSessionManager, BrowserlessDriver};
use crate::config::Settings;
use crate::dedup::StorageBackedIndex;
use crate::extract::{
    DisabledCapability, ExtractionCapability, ExtractionGateway, OllamaProvider, ResponseCache,
};
use crate::notify::{DiscordNotifier, NotifierMux, SlackNotifier};
use crate::scheduler::JobScheduler;
use crate::state::SourceType;
use crate::storage::{MemoryStorage, Storage};
use crate::workflow::Orchestrator;

#[derive(Clone)]
pub struct Runtime {
    pub settings: Settings,
    pub scheduler: JobScheduler,
    pub orchestrator: Arc<Orchestrator>,
    pub cache: Arc<ResponseCache>,
    pub storage: Arc<MemoryStorage>,
    pub browser: Option<Arc<BrowserSessionManager>>,
}

impl Runtime {
    pub fn from_settings(settings: Settings) -> Result<Self> {
        let storage = Arc::new(MemoryStorage::new());
        Self::with_storage(settings, storage)
    }

    pub fn with_storage(settings: Settings, storage: Arc<MemoryStorage>) -> Result<Self> {
        let browser = match settings.browserless.url.as_deref() {
            Some(url) => {
                let driver = BrowserlessDriver::new(url, settings.browserless.token.clone())
                    .context("building browserless driver")?;
                info!(url, engine = ?settings.browser.engine, "browser fallback enabled");
                Some(Arc::new(BrowserSessionManager::new(
                    Arc::new(driver),
                    settings.browser.clone(),
                )))
            }
            None => {
                warn!("BROWSERLESS_URL not set, web sources use plain HTTP only");
                None
            }
        };

        let fetch_timeout = Duration::from_secs(settings.fetch.timeout_secs);
        let web = WebStrategy::new(fetch_timeout, settings.fetch.min_content_chars, browser.clone())
            .context("building web strategy")?;
        let feed = FeedStrategy::new(fetch_timeout, settings.workflow.max_articles)
            .context("building feed strategy")?;
        let strategies = StrategySet::new()
            .with(SourceType::Web, Arc::new(web))
            .with(SourceType::Feed, Arc::new(feed));

        let capability: Arc<dyn ExtractionCapability> = if settings.extraction.enabled {
            let x = &settings.extraction;
            Arc::new(
                OllamaProvider::new(&x.ollama_host, &x.model, Duration::from_secs(x.timeout_secs))
                    .context("building ollama client")?
                    .with_temperature(x.temperature),
            )
        } else {
            warn!("extraction disabled, every run will fail preflight");
            Arc::new(DisabledCapability)
        };
        let cache = Arc::new(match &settings.extraction.cache_dir {
            Some(dir) => ResponseCache::with_dir(dir),
            None => ResponseCache::in_memory(),
        });
        let gateway = Arc::new(ExtractionGateway::new(capability, cache.clone()));

        let storage_dyn: Arc<dyn Storage> = storage.clone();
        let dedup = Arc::new(StorageBackedIndex::new(storage_dyn.clone()));
        let orchestrator = Arc::new(Orchestrator::new(
            strategies,
            gateway,
            dedup,
            storage_dyn.clone(),
            settings.workflow.clone(),
        ));

        let mut notifiers = NotifierMux::default();
        if let Some(url) = &settings.notify.discord_webhook_url {
            notifiers.push(Arc::new(DiscordNotifier::new(url.clone())));
        }
        if let Some(url) = &settings.notify.slack_webhook_url {
            notifiers.push(Arc::new(SlackNotifier::new(url.clone())));
        }
        if notifiers.is_empty() {
            warn!("no alert webhook configured, circuit-breaker alerts are log-only");
        }

        let scheduler = JobScheduler::new(
            settings.scheduler.clone(),
            orchestrator.clone(),
            storage_dyn,
            notifiers,
        )
        .with_cache(cache.clone());
        for source in &settings.sources {
            if let Err(e) = scheduler.add_source(source.clone()) {
                warn!(source_id = source.id, error = %e, "source not registered");
            }
        }
        info!(
            sources = scheduler.list_sources().len(),
            max_concurrent = settings.scheduler.max_concurrent,
            paused = scheduler.is_paused(),
            "runtime ready"
        );

        Ok(Self {
            settings,
            scheduler,
            orchestrator,
            cache,
            storage,
            browser,
        })
    }
}
