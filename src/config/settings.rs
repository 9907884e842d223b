// src/config/settings.rs
//! Service settings: `config/pipeline.toml` (or `$PIPELINE_CONFIG_PATH`), then env
//! overrides, then sanitizing. Missing file means defaults.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use tracing::warn;

use crate::browser::BrowserConfig;
use crate::scheduler::{Schedule, SchedulerConfig, SourceRecord};
use crate::workflow::WorkflowConfig;

const ENV_PATH: &str = "PIPELINE_CONFIG_PATH";
const DEFAULT_PATH: &str = "config/pipeline.toml";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ExtractionSettings {
    pub enabled: bool,
    pub ollama_host: String,
    pub model: String,
    pub timeout_secs: u64,
    pub temperature: f32,
    /// On-disk response cache; in-memory only when unset.
    pub cache_dir: Option<PathBuf>,
}

impl Default for ExtractionSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            ollama_host: "http://localhost:11434".to_string(),
            model: "llama3.1:8b".to_string(),
            timeout_secs: 120,
            temperature: 0.1,
            cache_dir: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FetchSettings {
    pub timeout_secs: u64,
    pub min_content_chars: usize,
}

impl Default for FetchSettings {
    fn default() -> Self {
        Self {
            timeout_secs: 20,
            min_content_chars: 200,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct BrowserlessSettings {
    /// Browser fallback is off when unset.
    pub url: Option<String>,
    pub token: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct NotifySettings {
    pub discord_webhook_url: Option<String>,
    pub slack_webhook_url: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub workflow: WorkflowConfig,
    pub scheduler: SchedulerConfig,
    pub browser: BrowserConfig,
    pub browserless: BrowserlessSettings,
    pub extraction: ExtractionSettings,
    pub fetch: FetchSettings,
    pub notify: NotifySettings,
    pub sources: Vec<SourceRecord>,
}

impl Settings {
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let mut cfg: Settings = toml::from_str(s).context("parsing pipeline settings")?;
        cfg.sanitize();
        Ok(cfg)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let data = fs::read_to_string(path)
            .with_context(|| format!("reading settings from {}", path.display()))?;
        Self::from_toml_str(&data)
    }

    /// 1) `$PIPELINE_CONFIG_PATH` (must exist)
    /// 2) `config/pipeline.toml`
    /// 3) defaults
    ///
    /// Env overrides are applied on top in every case.
    pub fn load() -> Result<Self> {
        let mut cfg = if let Ok(p) = std::env::var(ENV_PATH) {
            let pb = PathBuf::from(p);
            if !pb.exists() {
                return Err(anyhow!("{ENV_PATH} points to non-existent path"));
            }
            Self::load_from(&pb)?
        } else if Path::new(DEFAULT_PATH).exists() {
            Self::load_from(Path::new(DEFAULT_PATH))?
        } else {
            Settings::default()
        };
        cfg.apply_env(|k| std::env::var(k).ok());
        cfg.sanitize();
        Ok(cfg)
    }

    /// Overrides from a variable lookup; empty values count as unset.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let get = |k: &str| lookup(k).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        if let Some(v) = get("OLLAMA_HOST") {
            self.extraction.ollama_host = v;
        }
        if let Some(v) = get("OLLAMA_MODEL") {
            self.extraction.model = v;
        }
        if let Some(v) = get("MAX_CONCURRENT_FETCHES") {
            match v.parse() {
                Ok(n) => self.scheduler.max_concurrent = n,
                Err(_) => warn!(value = %v, "ignoring invalid MAX_CONCURRENT_FETCHES"),
            }
        }
        if let Some(v) = get("AUTO_DISABLE_THRESHOLD") {
            match v.parse() {
                Ok(n) => self.scheduler.failure_threshold = n,
                Err(_) => warn!(value = %v, "ignoring invalid AUTO_DISABLE_THRESHOLD"),
            }
        }
        if let Some(v) = get("GLOBAL_PAUSE") {
            self.scheduler.start_paused = matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on");
        }
        if let Some(v) = get("BROWSERLESS_URL") {
            self.browserless.url = Some(v);
        }
        if let Some(v) = get("BROWSERLESS_TOKEN") {
            self.browserless.token = Some(v);
        }
        if let Some(v) = get("DISCORD_WEBHOOK_URL") {
            self.notify.discord_webhook_url = Some(v);
        }
        if let Some(v) = get("SLACK_WEBHOOK_URL") {
            self.notify.slack_webhook_url = Some(v);
        }
    }

    pub fn sanitize(&mut self) {
        let s = &mut self.scheduler;
        s.max_concurrent = s.max_concurrent.clamp(1, 64);
        s.failure_threshold = s.failure_threshold.clamp(1, 100);
        s.run_timeout_secs = s.run_timeout_secs.clamp(10, 3_600);
        s.tick_secs = s.tick_secs.clamp(1, 3_600);
        s.retention_days = s.retention_days.clamp(1, 3_650);
        if let Schedule::Cron(expr) = s.maintenance_schedule() {
            if expr != s.maintenance_cron {
                warn!(expr = %s.maintenance_cron, "invalid maintenance cron, using default");
                s.maintenance_cron = expr;
            }
        }

        let w = &mut self.workflow;
        w.max_articles = w.max_articles.clamp(1, 20);
        w.max_steps = w.max_steps.clamp(10, 10_000);
        w.min_listing_links = w.min_listing_links.max(1);

        let b = &mut self.browser;
        b.max_attempts = b.max_attempts.clamp(1, 10);
        if b.backoff_base_ms > b.backoff_max_ms {
            std::mem::swap(&mut b.backoff_base_ms, &mut b.backoff_max_ms);
        }

        if !(0.0..=2.0).contains(&self.extraction.temperature) {
            self.extraction.temperature = ExtractionSettings::default().temperature;
        }
        self.extraction.ollama_host = self.extraction.ollama_host.trim_end_matches('/').to_string();
        self.fetch.timeout_secs = self.fetch.timeout_secs.max(1);

        let mut seen = std::collections::HashSet::new();
        self.sources.retain(|src| {
            if !seen.insert(src.id) {
                warn!(source_id = src.id, "duplicate source id in settings, keeping the first");
                return false;
            }
            if let Err(e) = src.schedule.validate() {
                warn!(source_id = src.id, error = %e, "dropping source with invalid schedule");
                return false;
            }
            true
        });
    }
}
