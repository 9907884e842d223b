// src/lib.rs
// Public library surface for the binary and the integration tests.

pub mod error;
pub mod state;
pub mod storage;
pub mod dedup;

// Acquisition: strategies, HTML helpers, browser fallback
pub mod acquire;
pub mod browser;

// Extraction capability, cache, response parsing
pub mod extract;

// Run orchestration and scheduling
pub mod workflow;
pub mod scheduler;
pub mod notify;

// Service plumbing
pub mod api;
pub mod bootstrap;
pub mod config;
pub mod metrics;

// Deterministic fakes shared by unit and integration tests
#[cfg(any(test, feature = "testing"))]
pub mod testing;

// ---- Re-exports for stable public API ----
pub use crate::api::router;
pub use crate::bootstrap::Runtime;
pub use crate::config::Settings;
pub use crate::scheduler::{JobScheduler, SourceRecord};
pub use crate::workflow::{Orchestrator, ProgressEvent, ProgressSink, RunRequest};

use axum::Router;

/// Full router the binary serves: API routes plus `/metrics`.
pub fn app(runtime: &Runtime, metrics: &metrics::Metrics) -> Router {
    let state = api::AppState::new(runtime.scheduler.clone()).with_cache(runtime.cache.clone());
    api::router_with_metrics(state, metrics)
}
