// tests/extraction_cache.rs
//
// Response cache behaviour through the gateway and on disk.

use std::sync::Arc;

use serde_json::json;
use stock_news_pipeline::error::ExtractionError;
use stock_news_pipeline::extract::{ExtractionGateway, ExtractionInput, ExtractionKind, ResponseCache};
use stock_news_pipeline::testing::ScriptedCapability;

fn input(hash: &str) -> ExtractionInput {
    ExtractionInput::new("https://news.example.com/a/1", "Apple beat estimates.", hash)
}

#[tokio::test]
async fn repeated_calls_for_the_same_content_hit_the_cache() {
    let capability = Arc::new(ScriptedCapability::happy());
    let cache = Arc::new(ResponseCache::in_memory());
    let gateway = ExtractionGateway::new(capability.clone(), cache.clone());

    let a = gateway.analyze_content(&input("h1")).await.unwrap();
    let b = gateway.analyze_content(&input("h1")).await.unwrap();
    assert_eq!(a, b);
    assert_eq!(capability.calls(ExtractionKind::AnalyzeContent), 1);

    // Different kind, same hash: separate entry.
    let m = gateway.extract_entities(&input("h1")).await.unwrap();
    assert_eq!(m[0].ticker, "AAPL");
    assert_eq!(capability.calls(ExtractionKind::ExtractEntities), 1);

    let stats = cache.stats();
    assert_eq!(stats.entries, 2);
    assert_eq!(stats.hits, 1);
}

#[tokio::test]
async fn malformed_answers_are_not_cached() {
    let capability = Arc::new(
        ScriptedCapability::happy()
            .push(ExtractionKind::AnalyzeContent, Ok(json!(["not", "an", "object"]))),
    );
    let gateway = ExtractionGateway::new(capability.clone(), Arc::new(ResponseCache::in_memory()));

    let err = gateway.analyze_content(&input("h2")).await.unwrap_err();
    assert!(!err.is_unavailable());
    // Retried on the next call, which now succeeds.
    assert!(gateway.analyze_content(&input("h2")).await.is_ok());
    assert_eq!(capability.calls(ExtractionKind::AnalyzeContent), 2);
}

#[tokio::test]
async fn unavailable_capability_is_reported_as_such() {
    let capability = Arc::new(ScriptedCapability::happy().fail(
        ExtractionKind::ExtractEntities,
        ExtractionError::unavailable("connection refused"),
    ));
    let gateway = ExtractionGateway::new(capability, Arc::new(ResponseCache::in_memory()));
    let err = gateway.extract_entities(&input("h3")).await.unwrap_err();
    assert!(err.is_unavailable());
}

#[tokio::test]
async fn disk_cache_survives_a_restart() {
    let dir = tempfile::tempdir().unwrap();
    {
        let capability = Arc::new(ScriptedCapability::happy());
        let gateway =
            ExtractionGateway::new(capability, Arc::new(ResponseCache::with_dir(dir.path())));
        gateway.classify_page(&input("h4")).await.unwrap();
    }
    let files: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
    assert_eq!(files.len(), 1);

    // A fresh process with a capability that would fail still gets the cached answer.
    let capability = Arc::new(ScriptedCapability::new());
    let gateway = ExtractionGateway::new(
        capability.clone(),
        Arc::new(ResponseCache::with_dir(dir.path())),
    );
    let c = gateway.classify_page(&input("h4")).await.unwrap();
    assert!(!c.is_listing);
    assert_eq!(capability.calls(ExtractionKind::ClassifyPage), 0);

    let purged = ResponseCache::with_dir(dir.path())
        .purge_older_than(chrono::Utc::now() + chrono::Duration::seconds(5));
    assert_eq!(purged, 1);
    assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
}
