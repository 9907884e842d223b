// src/state.rs
//! # Run State
//! Typed per-run processing state for the workflow orchestrator.
//!
//! A `RunState` is created by one orchestrator invocation, mutated only by the step that
//! is currently executing and dropped when the run completes. Page-level data lives on
//! the state itself; everything that belongs to "the article currently being processed"
//! lives in [`ArticleInProgress`], which is replaced wholesale when the next article
//! begins, so stale analysis or mentions can never leak into the next article.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::storage::{ArticleId, SourceId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceType {
    #[serde(alias = "website")]
    Web,
    #[serde(alias = "youtube")]
    Video,
    #[serde(alias = "rss")]
    Feed,
}

impl SourceType {
    pub fn as_str(self) -> &'static str {
        match self {
            SourceType::Web => "web",
            SourceType::Video => "video",
            SourceType::Feed => "feed",
        }
    }
}

impl fmt::Display for SourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Workflow stage. The serialized tokens are consumed by progress observers and must stay
/// stable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Init,
    Scraped,
    LinkExtractionComplete,
    ArticleFetched,
    Analyzed,
    NerComplete,
    ArticleSavedContinue,
    AllArticlesFinalized,
    Finalized,
    Error,
}

impl Stage {
    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Init => "init",
            Stage::Scraped => "scraped",
            Stage::LinkExtractionComplete => "link_extraction_complete",
            Stage::ArticleFetched => "article_fetched",
            Stage::Analyzed => "analyzed",
            Stage::NerComplete => "ner_complete",
            Stage::ArticleSavedContinue => "article_saved_continue",
            Stage::AllArticlesFinalized => "all_articles_finalized",
            Stage::Finalized => "finalized",
            Stage::Error => "error",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Stage::AllArticlesFinalized | Stage::Finalized | Stage::Error
        )
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArticleStatus {
    Success,
    Duplicate,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessedArticle {
    pub url: String,
    pub status: ArticleStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub article_id: Option<ArticleId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stock_count: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ProcessedArticle {
    pub fn success(url: impl Into<String>, article_id: ArticleId, stock_count: usize) -> Self {
        Self {
            url: url.into(),
            status: ArticleStatus::Success,
            article_id: Some(article_id),
            stock_count: Some(stock_count),
            error: None,
        }
    }

    pub fn duplicate(url: impl Into<String>, existing: ArticleId) -> Self {
        Self {
            url: url.into(),
            status: ArticleStatus::Duplicate,
            article_id: Some(existing),
            stock_count: None,
            error: None,
        }
    }

    pub fn failed(url: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            status: ArticleStatus::Failed,
            article_id: None,
            stock_count: None,
            error: Some(error.into()),
        }
    }
}

/// Structured metadata extracted for one article.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ArticleAnalysis {
    pub title: String,
    pub summary: Option<String>,
    pub topic: Option<String>,
    pub author: Option<String>,
    pub published_date: Option<DateTime<Utc>>,
    pub high_impact: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SentimentLabel {
    VeryNegative,
    Negative,
    Neutral,
    Positive,
    VeryPositive,
}

impl SentimentLabel {
    /// Bucket a score in `[-1, 1]`.
    pub fn from_score(score: f32) -> Self {
        if score <= -0.6 {
            SentimentLabel::VeryNegative
        } else if score <= -0.2 {
            SentimentLabel::Negative
        } else if score < 0.2 {
            SentimentLabel::Neutral
        } else if score < 0.6 {
            SentimentLabel::Positive
        } else {
            SentimentLabel::VeryPositive
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().replace([' ', '-'], "_").as_str() {
            "very_negative" => Some(SentimentLabel::VeryNegative),
            "negative" => Some(SentimentLabel::Negative),
            "neutral" => Some(SentimentLabel::Neutral),
            "positive" => Some(SentimentLabel::Positive),
            "very_positive" => Some(SentimentLabel::VeryPositive),
            _ => None,
        }
    }
}

/// Per-entity sentiment for one stock mentioned in an article.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StockMention {
    pub ticker: String,
    pub company: String,
    pub exchange: Option<String>,
    pub segment: Option<String>,
    /// Always within `[-1.0, 1.0]`.
    pub sentiment_score: f32,
    pub sentiment_label: SentimentLabel,
    /// Always within `[0.0, 1.0]`.
    pub confidence: f32,
    pub context_snippet: String,
}

/// Everything that belongs to the article currently in the loop body.
#[derive(Debug, Clone, Default)]
pub struct ArticleInProgress {
    pub url: String,
    pub raw_content: String,
    pub content_hash: String,
    pub analysis: Option<ArticleAnalysis>,
    pub stock_mentions: Vec<StockMention>,
}

impl ArticleInProgress {
    pub fn new(url: impl Into<String>, raw_content: String, content_hash: String) -> Self {
        Self {
            url: url.into(),
            raw_content,
            content_hash,
            analysis: None,
            stock_mentions: Vec::new(),
        }
    }
}

/// Returned by [`RunState::transition`] once the safety valve trips.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StepLimitExceeded {
    pub max_steps: u32,
}

impl fmt::Display for StepLimitExceeded {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "step limit exceeded ({} transitions)", self.max_steps)
    }
}

#[derive(Debug)]
pub struct RunState {
    pub source_id: SourceId,
    pub source_url: String,
    pub source_type: SourceType,
    pub extraction_instructions: Option<String>,
    stage: Stage,
    pub raw_content: Option<String>,
    pub raw_html: Option<String>,
    pub content_hash: Option<String>,
    pub metadata: BTreeMap<String, String>,
    pub is_listing_page: bool,
    article_links: Option<Vec<String>>,
    current_article_index: usize,
    processed_articles: Vec<ProcessedArticle>,
    pub article: Option<ArticleInProgress>,
    pub errors: Vec<String>,
    pub timings: BTreeMap<String, Duration>,
    step_count: u32,
    max_steps: u32,
}

impl RunState {
    pub fn new(
        source_id: SourceId,
        source_url: impl Into<String>,
        source_type: SourceType,
        max_steps: u32,
    ) -> Self {
        Self {
            source_id,
            source_url: source_url.into(),
            source_type,
            extraction_instructions: None,
            stage: Stage::Init,
            raw_content: None,
            raw_html: None,
            content_hash: None,
            metadata: BTreeMap::new(),
            is_listing_page: false,
            article_links: None,
            current_article_index: 0,
            processed_articles: Vec::new(),
            article: None,
            errors: Vec::new(),
            timings: BTreeMap::new(),
            step_count: 0,
            max_steps,
        }
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn step_count(&self) -> u32 {
        self.step_count
    }

    pub fn max_steps(&self) -> u32 {
        self.max_steps
    }

    /// Move to `next`, counting the transition. Fails without changing the stage once the
    /// configured maximum would be exceeded.
    pub fn transition(&mut self, next: Stage) -> Result<(), StepLimitExceeded> {
        if self.step_count >= self.max_steps {
            return Err(StepLimitExceeded {
                max_steps: self.max_steps,
            });
        }
        self.step_count += 1;
        self.stage = next;
        Ok(())
    }

    /// Terminal error. Not counted against the step budget so that the limit itself can
    /// always be reported.
    pub fn fail(&mut self, reason: impl Into<String>) {
        self.errors.push(reason.into());
        self.stage = Stage::Error;
    }

    pub fn article_links(&self) -> &[String] {
        self.article_links.as_deref().unwrap_or(&[])
    }

    /// Set the listing links. Allowed once per run.
    pub fn set_article_links(&mut self, links: Vec<String>) -> Result<(), &'static str> {
        if self.article_links.is_some() {
            return Err("article links already set for this run");
        }
        self.is_listing_page = true;
        self.article_links = Some(links);
        self.current_article_index = 0;
        Ok(())
    }

    pub fn current_article_index(&self) -> usize {
        self.current_article_index
    }

    /// Jump to `index` when it addresses an existing link. Returns false (and leaves the
    /// index alone) otherwise.
    pub fn select_article(&mut self, index: usize) -> bool {
        if index < self.article_links().len() {
            self.current_article_index = index;
            true
        } else {
            false
        }
    }

    pub fn processed_articles(&self) -> &[ProcessedArticle] {
        &self.processed_articles
    }

    pub fn record_article(&mut self, outcome: ProcessedArticle) {
        self.processed_articles.push(outcome);
    }

    /// Start a fresh per-article scope (drops the previous article's analysis/mentions).
    pub fn begin_article(&mut self, article: ArticleInProgress) {
        self.article = Some(article);
    }

    pub fn record_timing(&mut self, key: impl Into<String>, elapsed: Duration) {
        self.timings.insert(key.into(), elapsed);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Success,
    Partial,
    Error,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Success => "success",
            RunStatus::Partial => "partial",
            RunStatus::Error => "error",
        }
    }

    pub fn is_failure(self) -> bool {
        self == RunStatus::Error
    }
}

/// What a caller (scheduler, API) sees after a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunResult {
    pub source_id: SourceId,
    pub status: RunStatus,
    pub stage: Stage,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub article_id: Option<ArticleId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stock_count: Option<usize>,
    pub processed_articles: Vec<ProcessedArticle>,
    pub total_articles: usize,
    pub errors: Vec<String>,
    /// Stage timings in milliseconds.
    pub timings: BTreeMap<String, u64>,
    pub step_count: u32,
}

impl RunResult {
    /// Collapse a finished state into a result.
    pub fn from_state(state: RunState) -> Self {
        let processed = state.processed_articles;
        let status = derive_status(state.stage, &processed);

        let article_id = processed.iter().rev().find_map(|p| match p.status {
            ArticleStatus::Success => p.article_id,
            _ => None,
        });
        let stock_count: Option<usize> = {
            let counts: Vec<usize> = processed.iter().filter_map(|p| p.stock_count).collect();
            (!counts.is_empty()).then(|| counts.iter().sum::<usize>())
        };
        let total_articles = if state.is_listing_page {
            state.article_links.as_ref().map(Vec::len).unwrap_or(0)
        } else {
            1
        };

        Self {
            source_id: state.source_id,
            status,
            stage: state.stage,
            article_id,
            stock_count,
            processed_articles: processed,
            total_articles,
            errors: state.errors,
            timings: state
                .timings
                .into_iter()
                .map(|(k, v)| (k, v.as_millis() as u64))
                .collect(),
            step_count: state.step_count,
        }
    }

    /// Failure result for runs that never produced a state (timeout, preflight).
    pub fn failed(source_id: SourceId, reason: impl Into<String>) -> Self {
        Self {
            source_id,
            status: RunStatus::Error,
            stage: Stage::Error,
            article_id: None,
            stock_count: None,
            processed_articles: Vec::new(),
            total_articles: 0,
            errors: vec![reason.into()],
            timings: BTreeMap::new(),
            step_count: 0,
        }
    }

    pub fn last_error(&self) -> Option<&str> {
        self.errors.last().map(String::as_str)
    }
}

fn derive_status(stage: Stage, processed: &[ProcessedArticle]) -> RunStatus {
    if stage == Stage::Error {
        return RunStatus::Error;
    }
    let failed = processed
        .iter()
        .filter(|p| p.status == ArticleStatus::Failed)
        .count();
    if failed == 0 {
        RunStatus::Success
    } else if failed == processed.len() {
        RunStatus::Error
    } else {
        RunStatus::Partial
    }
}
