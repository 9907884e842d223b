// tests/api_http.rs
//
// HTTP-level tests for the operational Router without opening sockets.
// We exercise the router directly via tower::ServiceExt::oneshot.
//
// Covered:
// - GET /health, /status, /sources, /sources/{id}
// - POST /sources/{id}/trigger (SSE progress stream)
// - POST /sources/{id}/reactivate
// - POST /scheduler/pause, /scheduler/resume

use std::sync::Arc;

use serde_json::Value as Json;
use shuttle_axum::axum::{
    body::{self, Body},
    http::{Request, StatusCode},
    Router,
};
use tower::ServiceExt as _; // for `oneshot`

use stock_news_pipeline::api::{self, AppState};
use stock_news_pipeline::notify::NotifierMux;
use stock_news_pipeline::scheduler::{JobScheduler, Schedule, SchedulerConfig, SourceRecord};
use stock_news_pipeline::state::{RunStatus, SourceType};
use stock_news_pipeline::storage::MemoryStorage;
use stock_news_pipeline::testing::FakeRunner;

const BODY_LIMIT: usize = 1024 * 1024; // 1MB, safe for tests

fn scheduler(runner: FakeRunner) -> JobScheduler {
    let cfg = SchedulerConfig {
        failure_threshold: 1,
        ..SchedulerConfig::default()
    };
    let s = JobScheduler::new(
        cfg,
        Arc::new(runner),
        Arc::new(MemoryStorage::new()),
        NotifierMux::default(),
    );
    s.add_source(SourceRecord::new(
        1,
        "Markets",
        "https://news.example.com/markets",
        SourceType::Web,
        Schedule::IntervalMinutes(30),
    ))
    .unwrap();
    s
}

fn test_router(s: &JobScheduler) -> Router {
    api::router(AppState::new(s.clone()))
}

async fn send(app: Router, method: &str, uri: &str) -> (StatusCode, String) {
    let req = Request::builder()
        .method(method)
        .uri(uri)
        .body(Body::empty())
        .expect("build request");
    let resp = app.oneshot(req).await.expect("oneshot");
    let status = resp.status();
    let bytes = body::to_bytes(resp.into_body(), BODY_LIMIT)
        .await
        .expect("read body")
        .to_vec();
    (status, String::from_utf8(bytes).expect("utf8"))
}

#[tokio::test]
async fn health_and_status() {
    let s = scheduler(FakeRunner::new());
    let (status, body) = send(test_router(&s), "GET", "/health").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.trim(), "OK");

    let (status, body) = send(test_router(&s), "GET", "/status").await;
    assert_eq!(status, StatusCode::OK);
    let v: Json = serde_json::from_str(&body).unwrap();
    assert_eq!(v["paused"], false);
    assert_eq!(v["sources"], 1);
    assert_eq!(v["max_concurrent"], 3);
}

#[tokio::test]
async fn sources_are_listed_and_looked_up() {
    let s = scheduler(FakeRunner::new());
    let (status, body) = send(test_router(&s), "GET", "/sources").await;
    assert_eq!(status, StatusCode::OK);
    let v: Json = serde_json::from_str(&body).unwrap();
    assert_eq!(v[0]["id"], 1);
    assert_eq!(v[0]["source_type"], "web");
    assert_eq!(v[0]["status"], "active");
    assert_eq!(v[0]["schedule"]["interval_minutes"], 30);

    let (status, _) = send(test_router(&s), "GET", "/sources/1").await;
    assert_eq!(status, StatusCode::OK);
    let (status, body) = send(test_router(&s), "GET", "/sources/99").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(body.contains("unknown source 99"));
}

#[tokio::test]
async fn trigger_streams_progress_until_the_terminal_event() {
    let s = scheduler(FakeRunner::new());
    let (status, body) = send(test_router(&s), "POST", "/sources/1/trigger").await;
    assert_eq!(status, StatusCode::OK);
    assert!(body.contains("event: init"));
    assert!(body.contains("event: complete"));
    assert!(!body.contains("event: error"));
    assert!(body.contains("\"sourceId\":1"));

    let (status, _) = send(test_router(&s), "POST", "/sources/99/trigger").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn paused_scheduler_streams_a_single_error() {
    let s = scheduler(FakeRunner::new());
    let (status, body) = send(test_router(&s), "POST", "/scheduler/pause").await;
    assert_eq!(status, StatusCode::OK);
    assert!(body.contains("\"paused\":true"));
    assert!(s.is_paused());

    let (_, body) = send(test_router(&s), "POST", "/sources/1/trigger").await;
    assert_eq!(body.matches("event: error").count(), 1);
    assert!(body.contains("scheduler paused"));

    let (_, body) = send(test_router(&s), "POST", "/scheduler/resume").await;
    assert!(body.contains("\"paused\":false"));
    assert!(!s.is_paused());
}

#[tokio::test]
async fn reactivate_after_the_breaker_trips() {
    let s = scheduler(FakeRunner::new().script(1, &[RunStatus::Error]));
    let (_, body) = send(test_router(&s), "POST", "/sources/1/trigger").await;
    assert!(body.contains("event: error"));

    let (_, body) = send(test_router(&s), "GET", "/sources/1").await;
    let v: Json = serde_json::from_str(&body).unwrap();
    assert_eq!(v["status"], "paused");
    assert_eq!(v["consecutive_failures"], 1);

    let (status, body) = send(test_router(&s), "POST", "/sources/1/reactivate").await;
    assert_eq!(status, StatusCode::OK);
    let v: Json = serde_json::from_str(&body).unwrap();
    assert_eq!(v["status"], "active");

    let (status, _) = send(test_router(&s), "POST", "/sources/7/reactivate").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}
