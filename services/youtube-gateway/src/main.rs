//! YouTube Data API gateway
//!
//! Single-binary Rust service that:
//! 1. Loads a pool of YouTube API keys
//! 2. Connects the shared ledger store (Redis, or in-memory after retries)
//! 3. Serves search/channel/playlist/video endpoints
//! 4. Rotates keys as their daily quota is consumed

mod config;
mod error;
mod metrics;
mod youtube;

use anyhow::{Context, Result};
use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use key_pool::{Backend, Dispatcher, KeyPool};
use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::Config;

/// Max time to wait for in-flight requests after a shutdown signal.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// Shared application state accessible from all handlers
#[derive(Clone)]
pub struct AppState {
    pub dispatcher: Arc<Dispatcher>,
    pub prometheus: PrometheusHandle,
    pub started_at: Instant,
}

impl AppState {
    fn pool(&self) -> &KeyPool {
        self.dispatcher.pool()
    }
}

/// Build the axum router with all routes and shared state.
///
/// A concurrency limit layer caps in-flight requests at `max_connections`.
fn build_router(state: AppState, max_connections: usize) -> Router {
    Router::new()
        .route("/youtube/search", get(youtube::search))
        .route("/youtube/channel", get(youtube::channel))
        .route("/youtube/playlist", get(youtube::playlist))
        .route("/youtube/playlist/video-ids", get(youtube::playlist_video_ids))
        .route("/youtube/video", get(youtube::video))
        .route("/status", get(status_handler))
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .layer(tower::limit::ConcurrencyLimitLayer::new(max_connections))
        .with_state(state)
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and LOG_LEVEL / RUST_LOG support
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_env("LOG_LEVEL")
                .or_else(|_| EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("starting youtube-gateway");

    // Install Prometheus metrics recorder before any metrics are emitted
    let prometheus =
        metrics::install_recorder().context("failed to install Prometheus recorder")?;

    // CLI: simple --config flag parsing
    let args: Vec<String> = std::env::args().collect();
    let cli_config_path = args
        .iter()
        .position(|a| a == "--config")
        .and_then(|i| args.get(i + 1))
        .map(|s| s.as_str());

    let config_path = Config::resolve_path(cli_config_path);
    let config = if cli_config_path.is_some() || config_path.exists() {
        info!(path = %config_path.display(), "loading configuration");
        Config::load(&config_path)
            .with_context(|| format!("failed to load config from {}", config_path.display()))?
    } else {
        info!(path = %config_path.display(), "no config file, using defaults and environment");
        Config::from_env().context("invalid configuration")?
    };

    info!(
        listen_addr = %config.server.listen_addr,
        base_url = %config.upstream.base_url,
        keys = config.api_keys.len(),
        daily_limit = config.quota.daily_limit,
        timezone = %config.quota.timezone,
        "configuration loaded"
    );

    let store = key_pool::connect(&config.redis_settings()).await;
    let pool = KeyPool::open(
        config.api_keys.clone(),
        store,
        Arc::new(config.clock()?),
        config.threshold_policy()?,
        config.pool_settings(),
    )
    .await
    .context("failed to initialize key pool")?;

    let dispatcher = Dispatcher::new(
        Arc::new(pool),
        reqwest::Client::new(),
        config.dispatch_settings(),
    );

    let state = AppState {
        dispatcher: Arc::new(dispatcher),
        prometheus,
        started_at: Instant::now(),
    };
    let app = build_router(state, config.server.max_connections);

    let listen_addr = config.server.listen_addr;
    let listener = TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("failed to bind to {listen_addr}"))?;
    info!(addr = %listen_addr, "accepting requests");

    // The drain timeout starts when the shutdown signal fires, not when the
    // server starts.
    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();

    let server_handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            })
            .await
    });

    shutdown_signal().await;
    let _ = shutdown_tx.send(());

    match tokio::time::timeout(DRAIN_TIMEOUT, server_handle).await {
        Ok(Ok(Ok(()))) => info!("all in-flight requests drained"),
        Ok(Ok(Err(e))) => error!(error = %e, "server error during shutdown"),
        Ok(Err(e)) => error!(error = %e, "server task panicked"),
        Err(_) => warn!(
            drain_timeout_secs = DRAIN_TIMEOUT.as_secs(),
            "drain timeout exceeded, forcing shutdown"
        ),
    }

    info!("shutdown complete");
    Ok(())
}

/// Per-key ledger, active index and backend.
async fn status_handler(State(state): State<AppState>) -> impl IntoResponse {
    let status = state.pool().status().await;
    (StatusCode::OK, axum::Json(status))
}

/// Health endpoint.
///
/// - `healthy` (200): durable store, at least one key with quota left
/// - `degraded` (200): running on the in-memory fallback
/// - `unhealthy` (503): every key exhausted until the next reset
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let pool = state.pool();
    let all_exhausted = pool.all_exhausted().await;
    let fallback = pool.backend() == Backend::Memory;

    let (status_code, status) = if all_exhausted {
        (StatusCode::SERVICE_UNAVAILABLE, "unhealthy")
    } else if fallback {
        (StatusCode::OK, "degraded")
    } else {
        (StatusCode::OK, "healthy")
    };

    let body = serde_json::json!({
        "status": status,
        "store": pool.backend().label(),
        "keys": pool.len(),
        "active_index": pool.active_index().await,
        "all_exhausted": all_exhausted,
        "uptime_seconds": state.started_at.elapsed().as_secs(),
    });

    (
        status_code,
        [(axum::http::header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
}

/// Prometheus metrics endpoint in text exposition format.
async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(
            axum::http::header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        state.prometheus.render(),
    )
}

/// Wait for SIGTERM or SIGINT for graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}
