// src/extract/mod.rs
//! Extraction gateway: one fallible capability, four kinds of question, cached answers.

pub mod cache;
pub mod ollama;
pub mod parse;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use metrics::counter;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::acquire::html::LinkCandidate;
use crate::error::ExtractionError;
use crate::state::{ArticleAnalysis, StockMention};

pub use cache::ResponseCache;
pub use ollama::{DisabledCapability, OllamaProvider};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractionKind {
    ClassifyPage,
    ExtractLinks,
    AnalyzeContent,
    ExtractEntities,
}

impl ExtractionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ExtractionKind::ClassifyPage => "classify_page",
            ExtractionKind::ExtractLinks => "extract_links",
            ExtractionKind::AnalyzeContent => "analyze_content",
            ExtractionKind::ExtractEntities => "extract_entities",
        }
    }
}

impl fmt::Display for ExtractionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the capability gets to look at.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ExtractionInput {
    pub url: String,
    pub content: String,
    pub content_hash: String,
    pub instructions: Option<String>,
    pub metadata: BTreeMap<String, String>,
    /// Anchor candidates, only meaningful for `extract_links`.
    pub candidates: Vec<LinkCandidate>,
}

impl ExtractionInput {
    pub fn new(url: impl Into<String>, content: impl Into<String>, content_hash: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            content: content.into(),
            content_hash: content_hash.into(),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PageClassification {
    pub is_listing: bool,
    pub confidence: f32,
    pub reason: Option<String>,
}

#[async_trait]
pub trait ExtractionCapability: Send + Sync {
    async fn extract(
        &self,
        kind: ExtractionKind,
        input: &ExtractionInput,
    ) -> Result<Value, ExtractionError>;

    async fn is_healthy(&self) -> bool;

    fn name(&self) -> &'static str;
}

/// Typed, cached front of an [`ExtractionCapability`]. Shared across concurrent runs.
pub struct ExtractionGateway {
    capability: Arc<dyn ExtractionCapability>,
    cache: Arc<ResponseCache>,
}

impl ExtractionGateway {
    pub fn new(capability: Arc<dyn ExtractionCapability>, cache: Arc<ResponseCache>) -> Self {
        Self { capability, cache }
    }

    pub fn cache(&self) -> &Arc<ResponseCache> {
        &self.cache
    }

    pub fn capability_name(&self) -> &'static str {
        self.capability.name()
    }

    pub async fn is_healthy(&self) -> bool {
        self.capability.is_healthy().await
    }

    /// Cached call. Only answers that decode are cached, so a malformed answer is retried
    /// on the next run.
    async fn cached<T>(
        &self,
        kind: ExtractionKind,
        input: &ExtractionInput,
        decode: impl Fn(&Value) -> Result<T, ExtractionError>,
    ) -> Result<T, ExtractionError> {
        let cacheable = !input.content_hash.is_empty();
        if cacheable {
            if let Some(hit) = self.cache.get(&input.content_hash, kind) {
                if let Ok(out) = decode(&hit) {
                    debug!(kind = kind.as_str(), "extraction cache hit");
                    return Ok(out);
                }
            }
        }

        let raw = self.capability.extract(kind, input).await.inspect_err(|e| {
            counter!("extraction_errors_total", "kind" => kind.as_str(), "error" => e.kind.to_string())
                .increment(1);
        })?;
        let out = decode(&raw).inspect_err(|_| {
            counter!("extraction_errors_total", "kind" => kind.as_str(), "error" => "malformed")
                .increment(1);
        })?;
        if cacheable {
            self.cache.put(&input.content_hash, kind, raw);
        }
        counter!("extraction_calls_total", "kind" => kind.as_str()).increment(1);
        Ok(out)
    }

    pub async fn classify_page(
        &self,
        input: &ExtractionInput,
    ) -> Result<PageClassification, ExtractionError> {
        self.cached(ExtractionKind::ClassifyPage, input, parse::parse_classification)
            .await
    }

    /// Raw link strings as answered; resolution against the page URL is up to the caller.
    pub async fn extract_links(&self, input: &ExtractionInput) -> Result<Vec<String>, ExtractionError> {
        self.cached(ExtractionKind::ExtractLinks, input, parse::parse_links)
            .await
    }

    pub async fn analyze_content(
        &self,
        input: &ExtractionInput,
    ) -> Result<ArticleAnalysis, ExtractionError> {
        let fallback = input
            .metadata
            .get("article:published_time")
            .or_else(|| input.metadata.get("publish_date"))
            .cloned();
        self.cached(ExtractionKind::AnalyzeContent, input, move |v| {
            parse::parse_analysis(v, fallback.as_deref())
        })
        .await
    }

    pub async fn extract_entities(
        &self,
        input: &ExtractionInput,
    ) -> Result<Vec<StockMention>, ExtractionError> {
        self.cached(ExtractionKind::ExtractEntities, input, parse::parse_entities)
            .await
    }
}
