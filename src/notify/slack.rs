// src/notify/slack.rs
use anyhow::{Context, Result};
use reqwest::Client;

use super::{Notifier, SourceAlert};

pub struct SlackNotifier {
    webhook_url: Option<String>,
    client: Client,
}

impl SlackNotifier {
    pub fn from_env() -> Self {
        Self {
            webhook_url: std::env::var("SLACK_WEBHOOK_URL").ok().filter(|s| !s.is_empty()),
            client: Client::new(),
        }
    }

    pub fn new(url: String) -> Self {
        Self {
            webhook_url: Some(url),
            client: Client::new(),
        }
    }

    pub fn is_configured(&self) -> bool {
        self.webhook_url.is_some()
    }
}

fn render(alert: &SourceAlert) -> String {
    format!(
        "*{}*\nURL: {}\nLast error: {}\n@ {}",
        alert.headline(),
        alert.url,
        alert.last_error.as_deref().unwrap_or("n/a"),
        alert.ts.to_rfc3339()
    )
}

#[async_trait::async_trait]
impl Notifier for SlackNotifier {
    async fn send(&self, alert: &SourceAlert) -> Result<()> {
        let Some(url) = &self.webhook_url else {
            tracing::debug!("Slack disabled (no SLACK_WEBHOOK_URL)");
            return Ok(());
        };

        let body = serde_json::json!({ "text": render(alert) });
        self.client
            .post(url)
            .json(&body)
            .send()
            .await
            .context("slack post")?
            .error_for_status()
            .context("slack non-2xx")?;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "slack"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn render_mentions_source_and_error() {
        let a = SourceAlert {
            source_id: 4,
            source_name: "Reuters Markets".into(),
            url: "https://x.test".into(),
            consecutive_failures: 5,
            last_error: Some("blocked".into()),
            ts: Utc::now(),
        };
        let text = render(&a);
        assert!(text.contains("Reuters Markets (#4) after 5 consecutive failures"));
        assert!(text.contains("Last error: blocked"));
    }
}
