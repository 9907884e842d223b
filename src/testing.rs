// src/testing.rs
//! Deterministic stand-ins for the external collaborators (extraction model, page fetch,
//! browser driver, scheduled runner, alert webhooks). Used by unit and integration tests.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::acquire::{ContentAcquisitionStrategy, FetchedContent};
use crate::browser::{AutomationDriver, ContextHandle, ContextSpec, PageRequest, PageSnapshot};
use crate::error::{ExtractionError, FetchError};
use crate::extract::{ExtractionCapability, ExtractionInput, ExtractionKind};
use crate::notify::{Notifier, SourceAlert};
use crate::scheduler::{SourceRecord, SourceRunner};
use crate::state::{RunResult, RunStatus, Stage};
use crate::workflow::{ProgressEvent, ProgressSink};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|p| p.into_inner())
}

// ---------------------------------------------------------------------------------------
// Extraction

type Reply = Result<Value, ExtractionError>;

/// Capability answering from a script: per-URL overrides first, then a per-kind queue,
/// then the per-kind default.
#[derive(Default)]
pub struct ScriptedCapability {
    defaults: Mutex<HashMap<ExtractionKind, Reply>>,
    queued: Mutex<HashMap<ExtractionKind, VecDeque<Reply>>>,
    by_url: Mutex<HashMap<(ExtractionKind, String), Reply>>,
    calls: Mutex<HashMap<ExtractionKind, usize>>,
    unhealthy: AtomicBool,
}

impl ScriptedCapability {
    pub fn new() -> Self {
        Self::default()
    }

    /// Single article page, one analysis, one AAPL mention.
    pub fn happy() -> Self {
        Self::new()
            .respond(
                ExtractionKind::ClassifyPage,
                json!({"is_listing_page": false, "confidence": 0.9}),
            )
            .respond(ExtractionKind::ExtractLinks, json!({"links": []}))
            .respond(
                ExtractionKind::AnalyzeContent,
                json!({
                    "title": "Apple beats estimates",
                    "summary": "Quarterly results above consensus.",
                    "main_topic": "earnings",
                    "is_high_impact": true
                }),
            )
            .respond(
                ExtractionKind::ExtractEntities,
                json!({"stocks": [{
                    "ticker_symbol": "AAPL",
                    "company_name": "Apple Inc.",
                    "sentiment_score": 0.6,
                    "confidence": 0.8,
                    "context_snippet": "Apple beat estimates"
                }]}),
            )
    }

    /// Same as [`happy`](Self::happy) but the first page is a listing of `links`.
    pub fn listing(links: &[&str]) -> Self {
        Self::happy()
            .respond(
                ExtractionKind::ClassifyPage,
                json!({"is_listing_page": true, "confidence": 0.95}),
            )
            .respond(ExtractionKind::ExtractLinks, json!({ "links": links }))
    }

    pub fn respond(self, kind: ExtractionKind, value: Value) -> Self {
        lock(&self.defaults).insert(kind, Ok(value));
        self
    }

    pub fn fail(self, kind: ExtractionKind, err: ExtractionError) -> Self {
        lock(&self.defaults).insert(kind, Err(err));
        self
    }

    pub fn push(self, kind: ExtractionKind, reply: Reply) -> Self {
        lock(&self.queued).entry(kind).or_default().push_back(reply);
        self
    }

    pub fn for_url(self, kind: ExtractionKind, url: &str, reply: Reply) -> Self {
        lock(&self.by_url).insert((kind, url.to_string()), reply);
        self
    }

    pub fn unhealthy(self) -> Self {
        self.unhealthy.store(true, Ordering::SeqCst);
        self
    }

    pub fn calls(&self, kind: ExtractionKind) -> usize {
        lock(&self.calls).get(&kind).copied().unwrap_or(0)
    }
}

#[async_trait]
impl ExtractionCapability for ScriptedCapability {
    async fn extract(&self, kind: ExtractionKind, input: &ExtractionInput) -> Reply {
        *lock(&self.calls).entry(kind).or_default() += 1;
        if let Some(r) = lock(&self.by_url).get(&(kind, input.url.clone())) {
            return r.clone();
        }
        if let Some(r) = lock(&self.queued).get_mut(&kind).and_then(VecDeque::pop_front) {
            return r;
        }
        lock(&self.defaults)
            .get(&kind)
            .cloned()
            .unwrap_or_else(|| Err(ExtractionError::unavailable(format!("no script for {kind}"))))
    }

    async fn is_healthy(&self) -> bool {
        !self.unhealthy.load(Ordering::SeqCst)
    }

    fn name(&self) -> &'static str {
        "scripted"
    }
}

// ---------------------------------------------------------------------------------------
// Acquisition

/// Strategy serving canned pages by URL. Unknown URLs fail with a network error.
#[derive(Default)]
pub struct FakeStrategy {
    pages: Mutex<HashMap<String, Result<FetchedContent, FetchError>>>,
    fetches: Mutex<Vec<String>>,
    delay: Option<Duration>,
}

impl FakeStrategy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_page(self, url: &str, content: &str) -> Self {
        lock(&self.pages).insert(url.to_string(), Ok(FetchedContent::new(url, content.to_string())));
        self
    }

    pub fn with_html(self, url: &str, content: &str, html: &str) -> Self {
        let fetched = FetchedContent::new(url, content.to_string()).with_html(html.to_string());
        lock(&self.pages).insert(url.to_string(), Ok(fetched));
        self
    }

    /// A self-classifying listing (what a feed returns).
    pub fn with_listing(self, url: &str, links: &[&str]) -> Self {
        let fetched = FetchedContent::new(url, format!("listing of {}", links.len()))
            .with_article_links(links.iter().map(|s| s.to_string()).collect());
        lock(&self.pages).insert(url.to_string(), Ok(fetched));
        self
    }

    pub fn with_error(self, url: &str, err: FetchError) -> Self {
        lock(&self.pages).insert(url.to_string(), Err(err));
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn fetches(&self) -> Vec<String> {
        lock(&self.fetches).clone()
    }
}

#[async_trait]
impl ContentAcquisitionStrategy for FakeStrategy {
    async fn fetch(&self, url: &str) -> Result<FetchedContent, FetchError> {
        lock(&self.fetches).push(url.to_string());
        if let Some(d) = self.delay {
            tokio::time::sleep(d).await;
        }
        lock(&self.pages)
            .get(url)
            .cloned()
            .unwrap_or_else(|| Err(FetchError::network(url, "no such page")))
    }

    fn name(&self) -> &'static str {
        "fake"
    }
}

// ---------------------------------------------------------------------------------------
// Browser

/// Driver replaying scripted page loads. When the script is empty every load returns a
/// 200 article page.
#[derive(Default)]
pub struct FakeDriver {
    script: Mutex<VecDeque<Result<PageSnapshot, FetchError>>>,
    next_ctx: AtomicU64,
    opened: Mutex<Vec<ContextSpec>>,
    requests: Mutex<Vec<PageRequest>>,
    closed: AtomicUsize,
    load_delay: Option<Duration>,
}

impl FakeDriver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn then(self, reply: Result<PageSnapshot, FetchError>) -> Self {
        lock(&self.script).push_back(reply);
        self
    }

    pub fn then_status(self, status: u16, html: &str) -> Self {
        self.then(Ok(PageSnapshot {
            status,
            html: html.to_string(),
            text: String::new(),
        }))
    }

    pub fn with_load_delay(mut self, delay: Duration) -> Self {
        self.load_delay = Some(delay);
        self
    }

    /// Context specs in open order.
    pub fn opened(&self) -> Vec<ContextSpec> {
        lock(&self.opened).clone()
    }

    /// Page requests in load order.
    pub fn requests(&self) -> Vec<PageRequest> {
        lock(&self.requests).clone()
    }

    pub fn closed(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn article_snapshot() -> PageSnapshot {
        let body = "Stocks rallied on Tuesday as investors weighed fresh earnings. ".repeat(8);
        PageSnapshot {
            status: 200,
            html: format!("<html><body><article><p>{body}</p></article></body></html>"),
            text: body,
        }
    }
}

#[async_trait]
impl AutomationDriver for FakeDriver {
    async fn open_context(&self, spec: &ContextSpec) -> Result<ContextHandle, FetchError> {
        lock(&self.opened).push(spec.clone());
        Ok(ContextHandle {
            id: self.next_ctx.fetch_add(1, Ordering::SeqCst) + 1,
        })
    }

    async fn load(
        &self,
        _ctx: &ContextHandle,
        request: &PageRequest,
    ) -> Result<PageSnapshot, FetchError> {
        lock(&self.requests).push(request.clone());
        if let Some(d) = self.load_delay {
            tokio::time::sleep(d).await;
        }
        lock(&self.script)
            .pop_front()
            .unwrap_or_else(|| Ok(Self::article_snapshot()))
    }

    async fn close_context(&self, _ctx: &ContextHandle) {
        self.closed.fetch_add(1, Ordering::SeqCst);
    }

    fn name(&self) -> &'static str {
        "fake"
    }
}

// ---------------------------------------------------------------------------------------
// Scheduling

/// Runner with scripted outcomes per source; records concurrency.
#[derive(Default)]
pub struct FakeRunner {
    outcomes: Mutex<HashMap<i64, VecDeque<RunStatus>>>,
    delay: Option<Duration>,
    preflight_error: Mutex<Option<String>>,
    runs: Mutex<Vec<i64>>,
    current: AtomicUsize,
    peak: AtomicUsize,
}

impl FakeRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Outcomes for successive runs of `source_id`; once exhausted runs succeed.
    pub fn script(self, source_id: i64, outcomes: &[RunStatus]) -> Self {
        lock(&self.outcomes)
            .entry(source_id)
            .or_default()
            .extend(outcomes.iter().copied());
        self
    }

    pub fn failing_preflight(self, reason: &str) -> Self {
        *lock(&self.preflight_error) = Some(reason.to_string());
        self
    }

    pub fn runs(&self) -> Vec<i64> {
        lock(&self.runs).clone()
    }

    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SourceRunner for FakeRunner {
    async fn run_source(&self, source: &SourceRecord, progress: ProgressSink) -> RunResult {
        lock(&self.runs).push(source.id);
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        progress.emit(ProgressEvent::init(source.id, &source.url));

        if let Some(d) = self.delay {
            tokio::time::sleep(d).await;
        }
        let status = lock(&self.outcomes)
            .get_mut(&source.id)
            .and_then(VecDeque::pop_front)
            .unwrap_or(RunStatus::Success);

        let result = match status {
            RunStatus::Error => RunResult::failed(source.id, "scripted failure"),
            ok => {
                let mut r = RunResult::failed(source.id, "");
                r.status = ok;
                r.stage = Stage::Finalized;
                r.errors.clear();
                r.total_articles = 1;
                r
            }
        };
        self.current.fetch_sub(1, Ordering::SeqCst);
        progress.emit(ProgressEvent::finished(&result, &source.url));
        result
    }

    async fn preflight(&self) -> Result<(), String> {
        match lock(&self.preflight_error).clone() {
            Some(reason) => Err(reason),
            None => Ok(()),
        }
    }
}

// ---------------------------------------------------------------------------------------
// Alerts

#[derive(Default)]
pub struct RecordingNotifier {
    alerts: Mutex<Vec<SourceAlert>>,
    fail: bool,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records the alert, then reports a delivery failure.
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub fn alerts(&self) -> Vec<SourceAlert> {
        lock(&self.alerts).clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn send(&self, alert: &SourceAlert) -> anyhow::Result<()> {
        lock(&self.alerts).push(alert.clone());
        if self.fail {
            anyhow::bail!("webhook unreachable");
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "recording"
    }
}
