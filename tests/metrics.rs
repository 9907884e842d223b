// tests/metrics.rs
use axum::body::{self, Body};
use axum::http::{Request, StatusCode};
use tower::ServiceExt;

use stock_news_pipeline::metrics::Metrics;
use stock_news_pipeline::storage::MemoryStorage;
use stock_news_pipeline::{app, Runtime, Settings};

#[tokio::test]
async fn metrics_endpoint_exposes_pipeline_series() {
    let settings = Settings::default();
    let metrics = Metrics::init(&settings).expect("recorder");
    // A second init reuses the installed recorder.
    assert!(Metrics::init(&settings).is_ok());

    let mut settings = settings;
    settings.extraction.enabled = false;
    let runtime = Runtime::with_storage(settings, std::sync::Arc::new(MemoryStorage::new()))
        .expect("runtime");
    metrics::counter!("pipeline_runs_total", "status" => "success").increment(1);

    let resp = app(&runtime, &metrics)
        .oneshot(Request::get("/metrics").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    // axum::body::to_bytes requires an explicit limit
    let body = body::to_bytes(resp.into_body(), 1_048_576).await.unwrap(); // 1 MiB
    let text = String::from_utf8(body.to_vec()).unwrap();

    for needle in [
        "pipeline_runs_total",
        "scheduler_max_concurrent",
        "scheduler_failure_threshold",
    ] {
        assert!(text.contains(needle), "missing {needle} in:\n{text}");
    }
}
