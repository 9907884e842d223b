// src/workflow/mod.rs
//! # Workflow orchestrator
//! Drives one source run through the stage machine:
//!
//! ```text
//! init -> scraped -> [link_extraction_complete] -> per article:
//!     article_fetched -> (duplicate | analyzed -> ner_complete) -> article_saved_continue
//! -> all_articles_finalized            (listing)
//! init -> scraped -> article_fetched -> analyzed -> ner_complete -> finalized   (single)
//! any pre-loop failure                                                -> error
//! ```
//!
//! The article loop is an explicit index walk bounded by the state's step budget; the
//! "which article next" decision is a plain function that can be swapped out.

pub mod progress;

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use metrics::{counter, histogram};
use serde::Deserialize;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::acquire::html::extract_link_candidates;
use crate::acquire::{FetchedContent, StrategySet};
use crate::dedup::DeduplicationIndex;
use crate::error::{DedupOutcome, ExtractionErrorKind, PersistenceError};
use crate::extract::parse::resolve_links;
use crate::extract::{ExtractionGateway, ExtractionInput};
use crate::scheduler::{SourceRecord, SourceRunner};
use crate::state::{
    ArticleInProgress, ProcessedArticle, RunResult, RunState, SourceType, Stage, StepLimitExceeded,
};
use crate::storage::{NewArticle, SourceId, Storage};

pub use progress::{ProgressEvent, ProgressEventType, ProgressSink};

/// Post-article routing policy: index of the next article, or `None` when done.
pub type NextArticleFn = fn(&RunState) -> Option<usize>;

/// Default policy: walk the links in order, once.
pub fn sequential_next_article(state: &RunState) -> Option<usize> {
    let next = state.current_article_index() + 1;
    (next < state.article_links().len()).then_some(next)
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WorkflowConfig {
    /// Transition budget per run.
    pub max_steps: u32,
    /// Upper bound on articles taken from one listing.
    pub max_articles: usize,
    /// A web page with fewer resolved article links is treated as a single article.
    pub min_listing_links: usize,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            max_steps: 200,
            max_articles: 20,
            min_listing_links: 2,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RunRequest {
    pub source_id: SourceId,
    pub url: String,
    pub source_type: SourceType,
    pub extraction_instructions: Option<String>,
    pub max_articles: Option<usize>,
}

impl RunRequest {
    pub fn new(source_id: SourceId, url: impl Into<String>, source_type: SourceType) -> Self {
        Self {
            source_id,
            url: url.into(),
            source_type,
            extraction_instructions: None,
            max_articles: None,
        }
    }
}

impl From<&SourceRecord> for RunRequest {
    fn from(s: &SourceRecord) -> Self {
        Self {
            source_id: s.id,
            url: s.url.clone(),
            source_type: s.source_type,
            extraction_instructions: s.extraction_instructions.clone(),
            max_articles: s.max_articles,
        }
    }
}

pub struct Orchestrator {
    strategies: StrategySet,
    gateway: Arc<ExtractionGateway>,
    dedup: Arc<dyn DeduplicationIndex>,
    storage: Arc<dyn Storage>,
    cfg: WorkflowConfig,
    next_article: NextArticleFn,
}

impl Orchestrator {
    pub fn new(
        strategies: StrategySet,
        gateway: Arc<ExtractionGateway>,
        dedup: Arc<dyn DeduplicationIndex>,
        storage: Arc<dyn Storage>,
        cfg: WorkflowConfig,
    ) -> Self {
        Self {
            strategies,
            gateway,
            dedup,
            storage,
            cfg,
            next_article: sequential_next_article,
        }
    }

    pub fn with_next_article(mut self, policy: NextArticleFn) -> Self {
        self.next_article = policy;
        self
    }

    pub fn config(&self) -> &WorkflowConfig {
        &self.cfg
    }

    pub fn gateway(&self) -> &Arc<ExtractionGateway> {
        &self.gateway
    }

    /// Execute one run. Never fails: every exit path yields a `RunResult`, and `progress`
    /// always receives exactly one terminal event.
    pub async fn run(&self, req: RunRequest, progress: ProgressSink) -> RunResult {
        let span = info_span!("run", source_id = req.source_id, url = %req.url, kind = %req.source_type);
        async move {
            let started = Instant::now();
            let url = req.url.clone();
            progress.emit(ProgressEvent::init(req.source_id, &url));

            let mut run = Run::new(self, &req, progress.clone());
            if let Err(limit) = run.execute().await {
                warn!(steps = run.state.step_count(), "run aborted: {limit}");
                run.state.fail(limit.to_string());
            }
            run.state.record_timing("total", started.elapsed());

            let result = RunResult::from_state(run.state);
            counter!("pipeline_runs_total", "status" => result.status.as_str()).increment(1);
            histogram!("pipeline_run_ms").record(started.elapsed().as_secs_f64() * 1_000.0);
            info!(
                status = result.status.as_str(),
                stage = %result.stage,
                articles = result.processed_articles.len(),
                steps = result.step_count,
                "run finished"
            );
            progress.emit(ProgressEvent::finished(&result, &url));
            result
        }
        .instrument(span)
        .await
    }
}

#[async_trait]
impl SourceRunner for Orchestrator {
    async fn run_source(&self, source: &SourceRecord, progress: ProgressSink) -> RunResult {
        self.run(RunRequest::from(source), progress).await
    }

    async fn preflight(&self) -> Result<(), String> {
        if self.gateway.is_healthy().await {
            Ok(())
        } else {
            Err(format!(
                "extraction capability unavailable ({})",
                self.gateway.capability_name()
            ))
        }
    }
}

/// Outcome of acquisition + classification, before the article loop.
enum PageShape {
    Single(FetchedContent),
    Listing,
}

/// Mutable context of one executing run.
struct Run<'a> {
    orch: &'a Orchestrator,
    state: RunState,
    progress: ProgressSink,
    mark: Instant,
    max_articles: usize,
}

impl<'a> Run<'a> {
    fn new(orch: &'a Orchestrator, req: &RunRequest, progress: ProgressSink) -> Self {
        let mut state = RunState::new(req.source_id, req.url.clone(), req.source_type, orch.cfg.max_steps);
        state.extraction_instructions = req.extraction_instructions.clone();
        let max_articles = req
            .max_articles
            .unwrap_or(orch.cfg.max_articles)
            .clamp(1, orch.cfg.max_articles.max(1));
        Self {
            orch,
            state,
            progress,
            mark: Instant::now(),
            max_articles,
        }
    }

    /// Counted transition + timing + progress event.
    fn step(&mut self, stage: Stage) -> Result<(), StepLimitExceeded> {
        self.state.transition(stage)?;
        let key = if self.state.is_listing_page && !stage.is_terminal() && stage != Stage::LinkExtractionComplete {
            format!("{}[{}]", stage, self.state.current_article_index())
        } else {
            stage.to_string()
        };
        self.state.record_timing(key, self.mark.elapsed());
        self.mark = Instant::now();
        debug!(stage = %stage, step = self.state.step_count(), "transition");
        self.progress.emit(ProgressEvent::progress(
            stage,
            self.state.current_article_index(),
            self.state.article_links().len(),
        ));
        Ok(())
    }

    /// `Err` only for the step budget; every other failure lands in the state.
    async fn execute(&mut self) -> Result<(), StepLimitExceeded> {
        let shape = match self.acquire_and_classify().await? {
            Ok(shape) => shape,
            Err(reason) => {
                warn!(error = %reason, "pre-loop failure");
                self.state.fail(reason);
                return Ok(());
            }
        };

        match shape {
            PageShape::Single(page) => self.single_article(page).await,
            PageShape::Listing => self.article_loop().await,
        }
    }

    async fn acquire_and_classify(&mut self) -> Result<Result<PageShape, String>, StepLimitExceeded> {
        let source_type = self.state.source_type;
        let url = self.state.source_url.clone();

        let Some(strategy) = self.orch.strategies.get(source_type) else {
            return Ok(Err(format!("no acquisition strategy for {source_type} sources")));
        };
        let page = match strategy.fetch(&url).await {
            Ok(p) => p,
            Err(e) => return Ok(Err(format!("Scraping failed: {e}"))),
        };
        info!(strategy = strategy.name(), chars = page.content.len(), "page acquired");

        self.state.raw_content = Some(page.content.clone());
        self.state.raw_html = page.html.clone();
        self.state.content_hash = Some(page.content_hash.clone());
        self.state.metadata = page.metadata.clone();
        self.step(Stage::Scraped)?;

        // Self-classified listing (feed).
        if let Some(links) = &page.article_links {
            let links = resolve_links(links, &url, self.max_articles);
            if let Err(e) = self.state.set_article_links(links) {
                return Ok(Err(e.to_string()));
            }
            self.step(Stage::LinkExtractionComplete)?;
            return Ok(Ok(PageShape::Listing));
        }

        if source_type != SourceType::Web {
            return Ok(Ok(PageShape::Single(page)));
        }

        match self.extract_listing_links(&page).await {
            Ok(Some(links)) => {
                info!(links = links.len(), "listing page");
                if let Err(e) = self.state.set_article_links(links) {
                    return Ok(Err(e.to_string()));
                }
                self.step(Stage::LinkExtractionComplete)?;
                Ok(Ok(PageShape::Listing))
            }
            Ok(None) => Ok(Ok(PageShape::Single(page))),
            Err(reason) => Ok(Err(reason)),
        }
    }

    /// `Ok(Some)` for a listing, `Ok(None)` for a single article (including the
    /// capability-unavailable fallback), `Err` for a malformed answer.
    async fn extract_listing_links(&mut self, page: &FetchedContent) -> Result<Option<Vec<String>>, String> {
        let mut input = ExtractionInput::new(&page.url, &page.content, &page.content_hash);
        input.instructions = self.state.extraction_instructions.clone();
        input.metadata = page.metadata.clone();

        let gateway = &self.orch.gateway;
        let classification = match gateway.classify_page(&input).await {
            Ok(c) => c,
            Err(e) if e.kind == ExtractionErrorKind::Unavailable => {
                warn!(error = %e, "classification unavailable, treating page as single article");
                self.state.metadata.insert("classification".into(), "fallback".into());
                return Ok(None);
            }
            Err(e) => return Err(format!("Page classification failed: {e}")),
        };
        if !classification.is_listing {
            return Ok(None);
        }

        input.candidates = page
            .html
            .as_deref()
            .map(|h| extract_link_candidates(h, &page.url))
            .unwrap_or_default();
        let raw = match gateway.extract_links(&input).await {
            Ok(r) => r,
            Err(e) if e.kind == ExtractionErrorKind::Unavailable => {
                warn!(error = %e, "link extraction unavailable, treating page as single article");
                self.state.metadata.insert("classification".into(), "fallback".into());
                return Ok(None);
            }
            Err(e) => return Err(format!("Link extraction failed: {e}")),
        };
        let links = resolve_links(&raw, &page.url, self.max_articles);
        if links.len() < self.orch.cfg.min_listing_links {
            debug!(links = links.len(), "too few article links, single article");
            return Ok(None);
        }
        Ok(Some(links))
    }

    /// The loop body run exactly once: a failed article is recorded like any other
    /// iteration and the run still finalizes.
    async fn single_article(&mut self, page: FetchedContent) -> Result<(), StepLimitExceeded> {
        let outcome = self.process_article(page).await?;
        if let Some(e) = &outcome.error {
            warn!(url = %outcome.url, error = %e, "article failed");
            self.state.errors.push(format!("{}: {e}", outcome.url));
        }
        self.state.record_article(outcome);
        self.step(Stage::Finalized)
    }

    async fn article_loop(&mut self) -> Result<(), StepLimitExceeded> {
        let total = self.state.article_links().len();
        if total > 0 {
            loop {
                let idx = self.state.current_article_index();
                let url = self.state.article_links()[idx].clone();
                let outcome = match self.fetch_article(&url).await {
                    Ok(page) => self.process_article(page).await?,
                    Err(reason) => ProcessedArticle::failed(&url, reason),
                };
                if let Some(e) = &outcome.error {
                    warn!(article = idx, url = %url, error = %e, "article failed");
                    self.state.errors.push(format!("{url}: {e}"));
                }
                self.state.record_article(outcome);
                self.step(Stage::ArticleSavedContinue)?;

                match (self.orch.next_article)(&self.state) {
                    Some(next) if self.state.select_article(next) => continue,
                    Some(next) => {
                        warn!(next, total, "routing returned an out-of-range article, stopping");
                        break;
                    }
                    None => break,
                }
            }
        }
        self.step(Stage::AllArticlesFinalized)
    }

    async fn fetch_article(&self, url: &str) -> Result<FetchedContent, String> {
        let strategy = self
            .orch
            .strategies
            .get(SourceType::Web)
            .ok_or_else(|| "no web strategy to fetch articles".to_string())?;
        strategy.fetch(url).await.map_err(|e| e.to_string())
    }

    /// Dedup, analyze, extract entities, persist. Per-article failures come back as a
    /// `failed` outcome; only the step budget propagates.
    async fn process_article(&mut self, page: FetchedContent) -> Result<ProcessedArticle, StepLimitExceeded> {
        let url = page.url.clone();
        let hash = page.content_hash.clone();
        self.state
            .begin_article(ArticleInProgress::new(&url, page.content.clone(), hash.clone()));
        self.step(Stage::ArticleFetched)?;

        match self.orch.dedup.check(&hash).await {
            Ok(DedupOutcome::Duplicate(existing)) => {
                info!(url = %url, existing, "duplicate content");
                counter!("pipeline_articles_total", "status" => "duplicate").increment(1);
                return Ok(ProcessedArticle::duplicate(&url, existing));
            }
            Ok(DedupOutcome::Fresh) => {}
            Err(e) => return Ok(failed(&url, format!("dedup lookup failed: {e}"))),
        }

        let mut input = ExtractionInput::new(&url, &page.content, &hash);
        input.instructions = self.state.extraction_instructions.clone();
        input.metadata = page.metadata.clone();

        let mut analysis = match self.orch.gateway.analyze_content(&input).await {
            Ok(a) => a,
            Err(e) => return Ok(failed(&url, format!("Analysis failed: {e}"))),
        };
        if analysis.author.is_none() {
            analysis.author = page.metadata.get("author").cloned();
        }
        if analysis.title == "Untitled" {
            if let Some(t) = page.metadata.get("og_title").or_else(|| page.metadata.get("page_title")) {
                analysis.title = t.clone();
            }
        }
        if let Some(a) = self.state.article.as_mut() {
            a.analysis = Some(analysis.clone());
        }
        self.step(Stage::Analyzed)?;

        let mentions = match self.orch.gateway.extract_entities(&input).await {
            Ok(m) => m,
            Err(e) => return Ok(failed(&url, format!("Entity extraction failed: {e}"))),
        };
        if let Some(a) = self.state.article.as_mut() {
            a.stock_mentions = mentions.clone();
        }
        self.step(Stage::NerComplete)?;

        let stock_count = mentions.len();
        let record = NewArticle {
            source_id: self.state.source_id,
            url: url.clone(),
            content: page.content,
            content_hash: hash.clone(),
            analysis,
            stock_mentions: mentions,
            metadata: page.metadata,
            timings: self
                .state
                .timings
                .iter()
                .map(|(k, v)| (k.clone(), v.as_millis() as u64))
                .collect(),
        };
        Ok(match self.orch.storage.create_article(record).await {
            Ok(id) => {
                if let Err(e) = self.orch.dedup.record(&hash, id).await {
                    warn!(error = %e, "dedup record failed");
                }
                info!(url = %url, article_id = id, stock_count, "article stored");
                counter!("pipeline_articles_total", "status" => "success").increment(1);
                ProcessedArticle::success(&url, id, stock_count)
            }
            Err(PersistenceError::Conflict(existing)) => {
                info!(url = %url, existing, "stored concurrently by another run");
                counter!("pipeline_articles_total", "status" => "duplicate").increment(1);
                ProcessedArticle::duplicate(&url, existing)
            }
            Err(e) => failed(&url, format!("Persistence failed: {e}")),
        })
    }
}

fn failed(url: &str, reason: String) -> ProcessedArticle {
    counter!("pipeline_articles_total", "status" => "failed").increment(1);
    ProcessedArticle::failed(url, reason)
}
