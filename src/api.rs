// src/api.rs
//! Operational HTTP surface: health, metrics, source list, manual trigger with a live
//! progress stream (SSE) and the pause/resume/reactivate switches.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use tokio_stream::{wrappers::UnboundedReceiverStream, Stream, StreamExt};
use tower_http::cors::CorsLayer;
use tracing::info;

use crate::extract::ResponseCache;
use crate::metrics::Metrics;
use crate::scheduler::{JobScheduler, SchedulerError, SourceRecord};
use crate::storage::SourceId;
use crate::workflow::{ProgressEvent, ProgressSink};

#[derive(Clone)]
pub struct AppState {
    pub scheduler: JobScheduler,
    pub cache: Option<Arc<ResponseCache>>,
}

impl AppState {
    pub fn new(scheduler: JobScheduler) -> Self {
        Self {
            scheduler,
            cache: None,
        }
    }

    pub fn with_cache(mut self, cache: Arc<ResponseCache>) -> Self {
        self.cache = Some(cache);
        self
    }
}

/// Router without `/metrics`; see [`router_with_metrics`].
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(|| async { "OK" }))
        .route("/status", get(status))
        .route("/sources", get(list_sources))
        .route("/sources/{id}", get(get_source))
        .route("/sources/{id}/trigger", post(trigger_source))
        .route("/sources/{id}/reactivate", post(reactivate_source))
        .route("/scheduler/pause", post(pause_all))
        .route("/scheduler/resume", post(resume_all))
        .layer(CorsLayer::very_permissive())
        .with_state(state)
}

pub fn router_with_metrics(state: AppState, metrics: &Metrics) -> Router {
    router(state).merge(metrics.router())
}

#[derive(Serialize)]
struct StatusOut {
    paused: bool,
    in_flight: usize,
    peak_in_flight: usize,
    max_concurrent: usize,
    sources: usize,
    cache_entries: Option<usize>,
    cache_hits: Option<u64>,
    cache_misses: Option<u64>,
}

async fn status(State(state): State<AppState>) -> Json<StatusOut> {
    let s = &state.scheduler;
    let stats = state.cache.as_ref().map(|c| c.stats());
    Json(StatusOut {
        paused: s.is_paused(),
        in_flight: s.in_flight(),
        peak_in_flight: s.peak_in_flight(),
        max_concurrent: s.config().max_concurrent,
        sources: s.list_sources().len(),
        cache_entries: stats.as_ref().map(|c| c.entries),
        cache_hits: stats.as_ref().map(|c| c.hits),
        cache_misses: stats.as_ref().map(|c| c.misses),
    })
}

async fn list_sources(State(state): State<AppState>) -> Json<Vec<SourceRecord>> {
    Json(state.scheduler.list_sources())
}

async fn get_source(State(state): State<AppState>, Path(id): Path<SourceId>) -> Response {
    match state.scheduler.get_source(id) {
        Some(src) => Json(src).into_response(),
        None => not_found(id),
    }
}

/// Starts a manual run in the background and streams its progress events. The stream
/// ends after the terminal `complete`/`error` event.
async fn trigger_source(State(state): State<AppState>, Path(id): Path<SourceId>) -> Response {
    if state.scheduler.get_source(id).is_none() {
        return not_found(id);
    }
    let (sink, rx) = ProgressSink::channel();
    let scheduler = state.scheduler.clone();
    tokio::spawn(async move {
        let outcome = scheduler.trigger_now(id, sink).await;
        info!(source_id = id, skipped = ?outcome.skip_reason(), "manual trigger finished");
    });
    Sse::new(progress_stream(rx))
        .keep_alive(KeepAlive::new().interval(Duration::from_secs(15)))
        .into_response()
}

fn progress_stream(
    rx: tokio::sync::mpsc::UnboundedReceiver<ProgressEvent>,
) -> impl Stream<Item = Result<Event, Infallible>> {
    UnboundedReceiverStream::new(rx).map(|ev| {
        let data = serde_json::to_string(&ev).unwrap_or_else(|_| "{}".to_string());
        Ok(Event::default().event(ev.event_type.as_str()).data(data))
    })
}

async fn reactivate_source(State(state): State<AppState>, Path(id): Path<SourceId>) -> Response {
    match state.scheduler.reactivate(id) {
        Ok(src) => Json(src).into_response(),
        Err(SchedulerError::UnknownSource(id)) => not_found(id),
        Err(e) => (StatusCode::BAD_REQUEST, Json(serde_json::json!({ "error": e.to_string() })))
            .into_response(),
    }
}

#[derive(Serialize)]
struct PauseOut {
    paused: bool,
}

async fn pause_all(State(state): State<AppState>) -> Json<PauseOut> {
    state.scheduler.pause_all();
    Json(PauseOut { paused: true })
}

async fn resume_all(State(state): State<AppState>) -> Json<PauseOut> {
    state.scheduler.resume_all();
    Json(PauseOut { paused: false })
}

fn not_found(id: SourceId) -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(serde_json::json!({ "error": format!("unknown source {id}") })),
    )
        .into_response()
}
