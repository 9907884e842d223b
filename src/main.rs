//! Stock news pipeline: binary entrypoint.
//! Loads settings, wires the runtime, starts the scheduler loop and serves the HTTP API.

use shuttle_axum::ShuttleAxum;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use stock_news_pipeline::metrics::Metrics;
use stock_news_pipeline::{app, Runtime, Settings};

/// `RUST_LOG` filter (default `stock_news_pipeline=info,warn`); JSON lines when
/// `LOG_FORMAT=json`, compact otherwise.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("stock_news_pipeline=info,warn"));
    let json = std::env::var("LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    let registry = tracing_subscriber::registry().with(filter);
    let res = if json {
        registry.with(fmt::layer().json()).try_init()
    } else {
        registry.with(fmt::layer().compact()).try_init()
    };
    if res.is_err() {
        // The hosting runtime may have installed a subscriber already.
        eprintln!("tracing subscriber already set");
    }
}

#[shuttle_runtime::main]
async fn axum() -> ShuttleAxum {
    // Load .env in local/dev; no-op in prod environments.
    let _ = dotenvy::dotenv();
    init_tracing();

    let settings = Settings::load()?;
    let metrics = Metrics::init(&settings)?;
    let runtime = Runtime::from_settings(settings)?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    runtime.scheduler.spawn(shutdown_rx);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_err() {
            warn!("ctrl-c handler unavailable");
            return;
        }
        info!("shutdown requested");
        let _ = shutdown_tx.send(true);
    });

    Ok(app(&runtime, &metrics).into())
}
