// src/acquire/web.rs
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use metrics::counter;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, ACCEPT_LANGUAGE};
use tracing::{debug, info};

use super::html::{challenge_marker, extract_article_text, extract_metadata};
use super::{ContentAcquisitionStrategy, FetchedContent};
use crate::browser::identity::BrowserEngine;
use crate::browser::BrowserSessionManager;
use crate::error::FetchError;

/// Web pages: cheap HTTP GET first, browser rendering when that is blocked, thin or fails.
pub struct WebStrategy {
    client: reqwest::Client,
    browser: Option<Arc<BrowserSessionManager>>,
    min_content_chars: usize,
}

impl WebStrategy {
    pub fn new(
        timeout: Duration,
        min_content_chars: usize,
        browser: Option<Arc<BrowserSessionManager>>,
    ) -> anyhow::Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(
            ACCEPT,
            HeaderValue::from_static("text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8"),
        );
        headers.insert(ACCEPT_LANGUAGE, HeaderValue::from_static("en-US,en;q=0.9"));
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .default_headers(headers)
            .user_agent(BrowserEngine::Chromium.default_user_agents()[0])
            .build()?;
        Ok(Self {
            client,
            browser,
            min_content_chars,
        })
    }

    async fn lightweight(&self, url: &str) -> Result<FetchedContent, FetchError> {
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| FetchError::from_reqwest(url, &e))?;
        let status = resp.status().as_u16();
        if status == 401 || status == 403 {
            return Err(FetchError::blocked(url, format!("HTTP {status}")));
        }
        if status != 200 {
            return Err(FetchError::network(url, format!("HTTP {status}")));
        }
        let html = resp
            .text()
            .await
            .map_err(|e| FetchError::from_reqwest(url, &e))?;
        if let Some(marker) = challenge_marker(status, &html) {
            return Err(FetchError::blocked(url, format!("challenge marker: {marker}")));
        }
        self.accept(url, html, None)
    }

    /// Build content from markup, requiring a minimum amount of article text.
    fn accept(
        &self,
        url: &str,
        html: String,
        rendered_text: Option<String>,
    ) -> Result<FetchedContent, FetchError> {
        let text = extract_article_text(&html)
            .filter(|t| t.chars().count() >= self.min_content_chars)
            .or(rendered_text)
            .unwrap_or_default();
        if text.chars().count() < self.min_content_chars {
            return Err(FetchError::network(
                url,
                format!("only {} chars of content", text.chars().count()),
            ));
        }
        let metadata = extract_metadata(&html);
        Ok(FetchedContent::new(url, text)
            .with_metadata(metadata)
            .with_html(html))
    }
}

#[async_trait]
impl ContentAcquisitionStrategy for WebStrategy {
    async fn fetch(&self, url: &str) -> Result<FetchedContent, FetchError> {
        let err = match self.lightweight(url).await {
            Ok(c) => {
                counter!("acquire_fetch_total", "method" => "http").increment(1);
                return Ok(c);
            }
            Err(e) => e,
        };

        let Some(browser) = &self.browser else {
            return Err(err);
        };
        debug!(url, error = %err, "lightweight fetch insufficient, rendering");

        let snap = browser.fetch_page(url).await?;
        let rendered = Some(snap.text.trim().to_string()).filter(|t| !t.is_empty());
        let content = self.accept(url, snap.html, rendered)?;
        counter!("acquire_fetch_total", "method" => "browser").increment(1);
        info!(url, chars = content.content.len(), "rendered fetch ok");
        Ok(content)
    }

    fn name(&self) -> &'static str {
        "web"
    }
}
