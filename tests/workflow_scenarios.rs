// tests/workflow_scenarios.rs
//
// End-to-end runs of the orchestrator against scripted collaborators.
//
// Covered:
// - single article page -> finalized / success
// - listing page with a failing article -> all_articles_finalized / partial
// - classification unavailable -> single-article fallback
// - malformed classification -> terminal error
// - single article whose analysis fails -> finalized / error
// - listing whose second article was stored by an earlier run
// - empty feed, feed listing, duplicate content inside one run, idempotent re-run
// - content purged by retention is stored again
// - step budget and misbehaving routing policy

use std::sync::Arc;

use chrono::{Duration, Utc};

use serde_json::json;
use stock_news_pipeline::dedup::StorageBackedIndex;
use stock_news_pipeline::error::{ExtractionError, FetchError};
use stock_news_pipeline::extract::{ExtractionGateway, ExtractionKind, ResponseCache};
use stock_news_pipeline::acquire::StrategySet;
use stock_news_pipeline::state::{ArticleStatus, RunResult, RunState, RunStatus, SourceType, Stage};
use stock_news_pipeline::storage::{MemoryStorage, Storage};
use stock_news_pipeline::testing::{FakeStrategy, ScriptedCapability};
use stock_news_pipeline::workflow::{
    Orchestrator, ProgressEvent, ProgressEventType, ProgressSink, RunRequest, WorkflowConfig,
};

const PAGE: &str = "https://news.example.com/markets";
const A1: &str = "https://news.example.com/a/1";
const A2: &str = "https://news.example.com/a/2";
const A3: &str = "https://news.example.com/a/3";

struct Harness {
    orch: Orchestrator,
    storage: Arc<MemoryStorage>,
    capability: Arc<ScriptedCapability>,
    web: Arc<FakeStrategy>,
}

fn harness(capability: ScriptedCapability, web: FakeStrategy, feed: Option<FakeStrategy>) -> Harness {
    harness_with(capability, web, feed, WorkflowConfig::default())
}

fn harness_with(
    capability: ScriptedCapability,
    web: FakeStrategy,
    feed: Option<FakeStrategy>,
    cfg: WorkflowConfig,
) -> Harness {
    let storage = Arc::new(MemoryStorage::new());
    let capability = Arc::new(capability);
    let web = Arc::new(web);
    let mut strategies = StrategySet::new().with(SourceType::Web, web.clone());
    if let Some(feed) = feed {
        strategies.register(SourceType::Feed, Arc::new(feed));
    }
    let gateway = Arc::new(ExtractionGateway::new(
        capability.clone(),
        Arc::new(ResponseCache::in_memory()),
    ));
    let dedup = Arc::new(StorageBackedIndex::new(storage.clone()));
    let orch = Orchestrator::new(strategies, gateway, dedup, storage.clone(), cfg);
    Harness {
        orch,
        storage,
        capability,
        web,
    }
}

async fn run(h: &Harness, req: RunRequest) -> (RunResult, Vec<ProgressEvent>) {
    let (sink, mut rx) = ProgressSink::channel();
    let result = h.orch.run(req, sink).await;
    let mut events = Vec::new();
    while let Ok(ev) = rx.try_recv() {
        events.push(ev);
    }
    (result, events)
}

fn terminal_count(events: &[ProgressEvent]) -> usize {
    events.iter().filter(|e| e.is_terminal()).count()
}

#[tokio::test]
async fn single_article_page_is_finalized() {
    let h = harness(
        ScriptedCapability::happy(),
        FakeStrategy::new().with_page(PAGE, "Apple reported record quarterly revenue."),
        None,
    );
    let (result, events) = run(&h, RunRequest::new(1, PAGE, SourceType::Web)).await;

    assert_eq!(result.status, RunStatus::Success);
    assert_eq!(result.stage, Stage::Finalized);
    assert_eq!(result.total_articles, 1);
    assert_eq!(result.stock_count, Some(1));
    assert!(result.article_id.is_some());
    assert_eq!(h.storage.article_count(), 1);

    let stored = &h.storage.articles()[0];
    assert_eq!(stored.article.analysis.title, "Apple beats estimates");
    assert_eq!(stored.article.stock_mentions[0].ticker, "AAPL");

    let stages: Vec<Stage> = events.iter().filter_map(|e| e.stage).collect();
    assert_eq!(
        stages,
        vec![
            Stage::Init,
            Stage::Scraped,
            Stage::ArticleFetched,
            Stage::Analyzed,
            Stage::NerComplete,
            Stage::Finalized,
            Stage::Finalized,
        ]
    );
    assert_eq!(events.first().map(|e| e.event_type), Some(ProgressEventType::Init));
    assert_eq!(events.last().map(|e| e.event_type), Some(ProgressEventType::Complete));
    assert_eq!(terminal_count(&events), 1);
    assert!(result.timings.contains_key("total"));
    assert_eq!(h.capability.calls(ExtractionKind::ClassifyPage), 1);
    assert_eq!(h.capability.calls(ExtractionKind::ExtractLinks), 0);
}

#[tokio::test]
async fn failing_single_article_is_recorded_and_finalized() {
    let h = harness(
        ScriptedCapability::happy().fail(
            ExtractionKind::AnalyzeContent,
            ExtractionError::malformed("not json"),
        ),
        FakeStrategy::new().with_page(PAGE, "Apple reported record quarterly revenue."),
        None,
    );
    let (result, events) = run(&h, RunRequest::new(1, PAGE, SourceType::Web)).await;

    assert_eq!(result.stage, Stage::Finalized);
    assert_eq!(result.status, RunStatus::Error);
    assert_eq!(result.processed_articles.len(), 1);
    assert_eq!(result.processed_articles[0].status, ArticleStatus::Failed);
    assert_eq!(result.errors.len(), 1);
    assert!(result.errors[0].contains("Analysis failed"));
    assert_eq!(h.storage.article_count(), 0);
    assert_eq!(events.last().map(|e| e.event_type), Some(ProgressEventType::Complete));
    assert_eq!(terminal_count(&events), 1);
}

#[tokio::test]
async fn listing_with_one_failing_article_is_partial() {
    let h = harness(
        ScriptedCapability::listing(&[A1, "/a/2", A3, "mailto:x@y.z"]),
        FakeStrategy::new()
            .with_page(PAGE, "Markets front page")
            .with_page(A1, "First article about Apple earnings.")
            .with_error(A2, FetchError::network(A2, "connection reset"))
            .with_page(A3, "Third article about Microsoft guidance."),
        None,
    );
    let (result, events) = run(&h, RunRequest::new(7, PAGE, SourceType::Web)).await;

    assert_eq!(result.status, RunStatus::Partial);
    assert_eq!(result.stage, Stage::AllArticlesFinalized);
    assert_eq!(result.total_articles, 3);
    let statuses: Vec<ArticleStatus> = result.processed_articles.iter().map(|p| p.status).collect();
    assert_eq!(
        statuses,
        vec![ArticleStatus::Success, ArticleStatus::Failed, ArticleStatus::Success]
    );
    assert_eq!(result.errors.len(), 1);
    assert!(result.errors[0].contains(A2));
    assert_eq!(h.storage.article_count(), 2);
    assert_eq!(h.web.fetches(), vec![PAGE, A1, A2, A3]);
    assert!(result.timings.contains_key("article_fetched[0]"));
    assert!(result.timings.contains_key("article_fetched[2]"));

    let saved: Vec<usize> = events
        .iter()
        .filter(|e| e.stage == Some(Stage::ArticleSavedContinue))
        .filter_map(|e| e.current_article)
        .collect();
    assert_eq!(saved, vec![0, 1, 2]);
    assert_eq!(terminal_count(&events), 1);
}

#[tokio::test]
async fn unavailable_classification_falls_back_to_single_article() {
    let h = harness(
        ScriptedCapability::happy().fail(
            ExtractionKind::ClassifyPage,
            ExtractionError::unavailable("model offline"),
        ),
        FakeStrategy::new().with_page(PAGE, "Some article text"),
        None,
    );
    let (result, _) = run(&h, RunRequest::new(1, PAGE, SourceType::Web)).await;
    assert_eq!(result.status, RunStatus::Success);
    assert_eq!(result.stage, Stage::Finalized);
    assert_eq!(h.capability.calls(ExtractionKind::ExtractLinks), 0);
}

#[tokio::test]
async fn malformed_classification_ends_in_error() {
    let h = harness(
        ScriptedCapability::happy().respond(ExtractionKind::ClassifyPage, json!("no idea")),
        FakeStrategy::new().with_page(PAGE, "Some article text"),
        None,
    );
    let (result, events) = run(&h, RunRequest::new(1, PAGE, SourceType::Web)).await;
    assert_eq!(result.status, RunStatus::Error);
    assert_eq!(result.stage, Stage::Error);
    assert!(result.processed_articles.is_empty());
    assert_eq!(h.storage.article_count(), 0);
    assert_eq!(events.last().map(|e| e.event_type), Some(ProgressEventType::Error));
    assert_eq!(terminal_count(&events), 1);
}

#[tokio::test]
async fn failed_scrape_and_missing_strategy_are_pre_loop_errors() {
    let h = harness(
        ScriptedCapability::happy(),
        FakeStrategy::new().with_error(PAGE, FetchError::blocked(PAGE, "HTTP 403")),
        None,
    );
    let (scrape, _) = run(&h, RunRequest::new(1, PAGE, SourceType::Web)).await;
    assert_eq!(scrape.stage, Stage::Error);
    assert!(scrape.last_error().unwrap().contains("blocked"));

    let (video, events) = run(&h, RunRequest::new(2, "https://video.example.com/v", SourceType::Video)).await;
    assert_eq!(video.status, RunStatus::Error);
    assert!(video.last_error().unwrap().contains("no acquisition strategy"));
    assert_eq!(terminal_count(&events), 1);
}

#[tokio::test]
async fn feed_listing_and_rerun_are_idempotent() {
    let h = harness(
        ScriptedCapability::happy(),
        FakeStrategy::new()
            .with_page(A1, "Feed entry one body.")
            .with_page(A2, "Feed entry two body."),
        Some(FakeStrategy::new().with_listing("https://news.example.com/rss", &[A1, A2, A1])),
    );
    let req = RunRequest::new(3, "https://news.example.com/rss", SourceType::Feed);

    let (first, _) = run(&h, req.clone()).await;
    assert_eq!(first.status, RunStatus::Success);
    assert_eq!(first.total_articles, 2);
    assert_eq!(h.storage.article_count(), 2);
    // Feeds classify themselves.
    assert_eq!(h.capability.calls(ExtractionKind::ClassifyPage), 0);

    let (second, _) = run(&h, req).await;
    assert_eq!(second.status, RunStatus::Success);
    assert!(second
        .processed_articles
        .iter()
        .all(|p| p.status == ArticleStatus::Duplicate));
    assert_eq!(h.storage.article_count(), 2);
}

#[tokio::test]
async fn identical_content_under_two_urls_is_stored_once() {
    let body = "Same   wire story\n republished";
    let h = harness(
        ScriptedCapability::listing(&[A1, A2]),
        FakeStrategy::new()
            .with_page(PAGE, "index")
            .with_page(A1, body)
            .with_page(A2, "Same wire story republished"),
        None,
    );
    let (result, _) = run(&h, RunRequest::new(1, PAGE, SourceType::Web)).await;
    assert_eq!(result.status, RunStatus::Success);
    assert_eq!(result.processed_articles[1].status, ArticleStatus::Duplicate);
    assert_eq!(
        result.processed_articles[1].article_id,
        result.processed_articles[0].article_id
    );
    assert_eq!(h.storage.article_count(), 1);
}

#[tokio::test]
async fn every_article_failing_is_an_error_run() {
    let h = harness(
        ScriptedCapability::listing(&[A1, A2]).fail(
            ExtractionKind::AnalyzeContent,
            ExtractionError::malformed("not json"),
        ),
        FakeStrategy::new()
            .with_page(PAGE, "index")
            .with_page(A1, "one")
            .with_page(A2, "two"),
        None,
    );
    let (result, events) = run(&h, RunRequest::new(1, PAGE, SourceType::Web)).await;
    assert_eq!(result.stage, Stage::AllArticlesFinalized);
    assert_eq!(result.status, RunStatus::Error);
    assert_eq!(result.errors.len(), 2);
    // The run itself reached its end stage, so the stream completes normally.
    assert_eq!(events.last().map(|e| e.event_type), Some(ProgressEventType::Complete));
}

#[tokio::test]
async fn per_source_cap_limits_articles() {
    let h = harness(
        ScriptedCapability::listing(&[A1, A2, A3]),
        FakeStrategy::new()
            .with_page(PAGE, "index")
            .with_page(A1, "one")
            .with_page(A2, "two")
            .with_page(A3, "three"),
        None,
    );
    let mut req = RunRequest::new(1, PAGE, SourceType::Web);
    req.max_articles = Some(2);
    let (result, _) = run(&h, req).await;
    assert_eq!(result.total_articles, 2);
    assert_eq!(result.processed_articles.len(), 2);
}

fn always_first(_: &RunState) -> Option<usize> {
    Some(0)
}

fn out_of_range(state: &RunState) -> Option<usize> {
    Some(state.article_links().len() + 5)
}

#[tokio::test]
async fn looping_policy_hits_the_step_budget() {
    let cfg = WorkflowConfig {
        max_steps: 30,
        ..WorkflowConfig::default()
    };
    let h = harness_with(
        ScriptedCapability::listing(&[A1, A2]),
        FakeStrategy::new()
            .with_page(PAGE, "index")
            .with_page(A1, "one")
            .with_page(A2, "two"),
        None,
        cfg,
    );
    let h = Harness {
        orch: h.orch.with_next_article(always_first),
        ..h
    };
    let (result, events) = run(&h, RunRequest::new(1, PAGE, SourceType::Web)).await;

    assert_eq!(result.stage, Stage::Error);
    assert_eq!(result.status, RunStatus::Error);
    assert!(result.step_count <= 30);
    assert!(result.last_error().unwrap().contains("step limit exceeded"));
    // Work done before the abort is kept.
    assert!(!result.processed_articles.is_empty());
    assert_eq!(h.storage.article_count(), 1);
    assert_eq!(terminal_count(&events), 1);
}

#[tokio::test]
async fn out_of_range_routing_ends_the_loop() {
    let h = harness(
        ScriptedCapability::listing(&[A1, A2]),
        FakeStrategy::new()
            .with_page(PAGE, "index")
            .with_page(A1, "one")
            .with_page(A2, "two"),
        None,
    );
    let h = Harness {
        orch: h.orch.with_next_article(out_of_range),
        ..h
    };
    let (result, _) = run(&h, RunRequest::new(1, PAGE, SourceType::Web)).await;
    assert_eq!(result.stage, Stage::AllArticlesFinalized);
    assert_eq!(result.processed_articles.len(), 1);
}

#[tokio::test]
async fn article_stored_by_an_earlier_run_is_a_duplicate() {
    let h = harness(
        ScriptedCapability::listing(&[A1, A2, A3]),
        FakeStrategy::new()
            .with_page(PAGE, "index")
            .with_page(A1, "Apple beats estimates on services growth.")
            .with_page(A2, "Fed holds rates steady as inflation cools.")
            .with_page(A3, "Microsoft raises cloud guidance."),
        Some(FakeStrategy::new().with_listing("https://news.example.com/rss", &[A2])),
    );
    let (earlier, _) = run(&h, RunRequest::new(2, "https://news.example.com/rss", SourceType::Feed)).await;
    assert_eq!(earlier.status, RunStatus::Success);
    let stored_id = earlier.processed_articles[0].article_id;

    let (result, _) = run(&h, RunRequest::new(1, PAGE, SourceType::Web)).await;
    let statuses: Vec<ArticleStatus> = result.processed_articles.iter().map(|p| p.status).collect();
    assert_eq!(
        statuses,
        vec![ArticleStatus::Success, ArticleStatus::Duplicate, ArticleStatus::Success]
    );
    assert_eq!(result.processed_articles[1].article_id, stored_id);
    assert_eq!(result.status, RunStatus::Success);
    assert_eq!(h.storage.article_count(), 3);
}

#[tokio::test]
async fn empty_feed_finalizes_without_articles() {
    let h = harness(
        ScriptedCapability::happy(),
        FakeStrategy::new(),
        Some(FakeStrategy::new().with_listing("https://news.example.com/rss", &[])),
    );
    let (result, events) = run(&h, RunRequest::new(3, "https://news.example.com/rss", SourceType::Feed)).await;
    assert_eq!(result.stage, Stage::AllArticlesFinalized);
    assert_eq!(result.status, RunStatus::Success);
    assert_eq!(result.total_articles, 0);
    assert!(result.processed_articles.is_empty());
    assert!(h.web.fetches().is_empty());
    assert_eq!(terminal_count(&events), 1);
}

#[tokio::test]
async fn purged_content_is_stored_again() {
    let h = harness(
        ScriptedCapability::happy(),
        FakeStrategy::new().with_page(A1, "Feed entry one body."),
        Some(FakeStrategy::new().with_listing("https://news.example.com/rss", &[A1])),
    );
    let req = RunRequest::new(3, "https://news.example.com/rss", SourceType::Feed);

    let (first, _) = run(&h, req.clone()).await;
    assert_eq!(first.processed_articles[0].status, ArticleStatus::Success);

    let purged = h
        .storage
        .purge_older_than(Utc::now() + Duration::minutes(1))
        .await
        .unwrap();
    assert_eq!(purged, 1);
    assert_eq!(h.storage.article_count(), 0);

    let (second, _) = run(&h, req).await;
    assert_eq!(second.processed_articles[0].status, ArticleStatus::Success);
    assert_ne!(second.processed_articles[0].article_id, first.processed_articles[0].article_id);
    assert_eq!(h.storage.article_count(), 1);
}
