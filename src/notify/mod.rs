// src/notify/mod.rs
//! Operator alerts for sources tripped by the circuit breaker.

pub mod discord;
pub mod slack;

use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, warn};

use crate::storage::SourceId;

pub use discord::DiscordNotifier;
pub use slack::SlackNotifier;

/// A source was paused after too many consecutive failed runs.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SourceAlert {
    pub source_id: SourceId,
    pub source_name: String,
    pub url: String,
    pub consecutive_failures: u32,
    pub last_error: Option<String>,
    pub ts: DateTime<Utc>,
}

impl SourceAlert {
    pub fn headline(&self) -> String {
        format!(
            "Source paused: {} (#{}) after {} consecutive failures",
            self.source_name, self.source_id, self.consecutive_failures
        )
    }
}

#[async_trait::async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, alert: &SourceAlert) -> Result<()>;
    fn name(&self) -> &'static str;
}

/// Fan-out to every configured notifier. Failures are logged, never propagated.
#[derive(Clone, Default)]
pub struct NotifierMux {
    targets: Vec<Arc<dyn Notifier>>,
}

impl NotifierMux {
    pub fn new(targets: Vec<Arc<dyn Notifier>>) -> Self {
        Self { targets }
    }

    pub fn push(&mut self, n: Arc<dyn Notifier>) {
        self.targets.push(n);
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    pub async fn broadcast(&self, alert: &SourceAlert) {
        for t in &self.targets {
            match t.send(alert).await {
                Ok(()) => {
                    info!(notifier = t.name(), source_id = alert.source_id, "alert sent");
                    metrics::counter!("alerts_sent_total", "notifier" => t.name()).increment(1);
                }
                Err(e) => {
                    warn!(notifier = t.name(), source_id = alert.source_id, error = %e, "alert failed");
                    metrics::counter!("alerts_failed_total", "notifier" => t.name()).increment(1);
                }
            }
        }
    }
}
