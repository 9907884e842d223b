// src/extract/ollama.rs
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{error, warn};

use super::parse::extract_json;
use super::{ExtractionCapability, ExtractionInput, ExtractionKind};
use crate::error::ExtractionError;

/// Longest content slice sent to the model, in characters.
const MAX_PROMPT_CONTENT: usize = 8_000;

/// Most link candidates listed in an `extract_links` prompt.
const MAX_PROMPT_LINKS: usize = 100;

fn truncate_chars(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

fn instructions_block(input: &ExtractionInput) -> String {
    match input.instructions.as_deref().map(str::trim) {
        Some(i) if !i.is_empty() => format!("\nUSER INSTRUCTIONS: {i}\n"),
        _ => String::new(),
    }
}

/// Prompt text per kind. Every prompt asks for a single JSON object.
pub fn build_prompt(kind: ExtractionKind, input: &ExtractionInput) -> String {
    let content = truncate_chars(&input.content, MAX_PROMPT_CONTENT);
    let extra = instructions_block(input);
    match kind {
        ExtractionKind::ClassifyPage => format!(
            "Decide whether this web page is a LISTING of several news articles (front page, \
             section index) or a SINGLE article.{extra}\nURL: {}\n\nCONTENT:\n{content}\n\n\
             Return JSON: {{\"is_listing_page\": true|false, \"confidence\": 0.0-1.0, \"reason\": \"...\"}}",
            input.url
        ),
        ExtractionKind::ExtractLinks => {
            let links = input
                .candidates
                .iter()
                .take(MAX_PROMPT_LINKS)
                .enumerate()
                .map(|(i, c)| format!("{i}. {} -> {}", c.text, c.url))
                .collect::<Vec<_>>()
                .join("\n");
            format!(
                "From the links below, select the ones that point to individual news articles. \
                 Skip navigation, category, author and advertising links.{extra}\nPAGE: {}\n\n\
                 LINKS:\n{links}\n\nReturn JSON: {{\"links\": [\"<url>\", ...]}}",
                input.url
            )
        }
        ExtractionKind::AnalyzeContent => format!(
            "Analyze this financial news article.{extra}\nURL: {}\n\nARTICLE:\n{content}\n\n\
             Return JSON: {{\"title\": \"...\", \"summary\": \"2-3 sentences\", \"main_topic\": \"...\", \
             \"author\": \"...\", \"published_date\": \"YYYY-MM-DD HH:MM:SS\", \"is_high_impact\": true|false}}",
            input.url
        ),
        ExtractionKind::ExtractEntities => format!(
            "List every publicly traded company mentioned in this article with the sentiment \
             the article expresses toward it.{extra}\n\nARTICLE:\n{content}\n\n\
             Return JSON: {{\"stocks\": [{{\"ticker_symbol\": \"AAPL\", \"company_name\": \"Apple Inc.\", \
             \"stock_exchange\": \"NASDAQ\", \"market_segment\": \"Technology\", \"sentiment_score\": -1.0..1.0, \
             \"sentiment_label\": \"very_negative|negative|neutral|positive|very_positive\", \
             \"confidence_score\": 0.0..1.0, \"context_snippet\": \"...\"}}]}}. \
             If no stocks are mentioned return {{\"stocks\": []}}."
        ),
    }
}

#[derive(Debug, Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: String,
    stream: bool,
    format: &'a str,
    options: GenerateOptions,
}

#[derive(Debug, Serialize)]
struct GenerateOptions {
    temperature: f32,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    response: String,
}

#[derive(Debug, Deserialize)]
struct TagsResponse {
    #[serde(default)]
    models: Vec<TagModel>,
}

#[derive(Debug, Deserialize)]
struct TagModel {
    name: String,
}

/// Local Ollama server (`/api/generate` with `format: json`).
pub struct OllamaProvider {
    http: reqwest::Client,
    base_url: String,
    model: String,
    temperature: f32,
}

impl OllamaProvider {
    pub fn new(
        base_url: impl Into<String>,
        model: impl Into<String>,
        timeout: Duration,
    ) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("stock-news-pipeline/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(Duration::from_secs(4))
            .timeout(timeout)
            .build()?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            model: model.into(),
            temperature: 0.2,
        })
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature.clamp(0.0, 2.0);
        self
    }
}

#[async_trait]
impl ExtractionCapability for OllamaProvider {
    async fn extract(
        &self,
        kind: ExtractionKind,
        input: &ExtractionInput,
    ) -> Result<Value, ExtractionError> {
        let req = GenerateRequest {
            model: &self.model,
            prompt: build_prompt(kind, input),
            stream: false,
            format: "json",
            options: GenerateOptions {
                temperature: self.temperature,
            },
        };
        let resp = self
            .http
            .post(format!("{}/api/generate", self.base_url))
            .json(&req)
            .send()
            .await
            .map_err(|e| ExtractionError::unavailable(format!("ollama request failed: {e}")))?;

        let status = resp.status();
        if !status.is_success() {
            error!(status = status.as_u16(), kind = kind.as_str(), "ollama api error");
            return Err(ExtractionError::unavailable(format!(
                "ollama returned HTTP {}",
                status.as_u16()
            )));
        }
        let body: GenerateResponse = resp
            .json()
            .await
            .map_err(|e| ExtractionError::malformed(format!("ollama envelope: {e}")))?;

        extract_json(&body.response).ok_or_else(|| {
            let head: String = body.response.chars().take(200).collect();
            warn!(kind = kind.as_str(), response = %head, "unparseable model output");
            ExtractionError::malformed("model output is not JSON")
        })
    }

    /// Server reachable and the configured model installed.
    async fn is_healthy(&self) -> bool {
        let resp = match self
            .http
            .get(format!("{}/api/tags", self.base_url))
            .timeout(Duration::from_secs(5))
            .send()
            .await
        {
            Ok(r) if r.status().is_success() => r,
            Ok(r) => {
                warn!(status = r.status().as_u16(), "ollama health check failed");
                return false;
            }
            Err(e) => {
                warn!(error = %e, "ollama unreachable");
                return false;
            }
        };
        match resp.json::<TagsResponse>().await {
            Ok(tags) => {
                let base = self.model.split(':').next().unwrap_or(&self.model);
                tags.models
                    .iter()
                    .any(|m| m.name == self.model || m.name.split(':').next() == Some(base))
            }
            Err(_) => false,
        }
    }

    fn name(&self) -> &'static str {
        "ollama"
    }
}

/// Stand-in when no capability is configured: every call is `unavailable`.
#[derive(Debug, Default, Clone, Copy)]
pub struct DisabledCapability;

#[async_trait]
impl ExtractionCapability for DisabledCapability {
    async fn extract(
        &self,
        kind: ExtractionKind,
        _input: &ExtractionInput,
    ) -> Result<Value, ExtractionError> {
        Err(ExtractionError::unavailable(format!(
            "extraction disabled ({})",
            kind.as_str()
        )))
    }

    async fn is_healthy(&self) -> bool {
        false
    }

    fn name(&self) -> &'static str {
        "disabled"
    }
}
