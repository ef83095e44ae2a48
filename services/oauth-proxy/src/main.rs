//! Anthropic OAuth account rotation proxy
//!
//! Single-binary service that holds a pool of OAuth-enrolled Anthropic
//! accounts, rotates between them on rate limits, refreshes their tokens
//! proactively in the background, and exposes an HTTP surface for
//! enrollment and operator control.

mod config;
mod error;
mod metrics;
mod oauth;
mod proxy;
mod status;

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use anthropic_auth::{CredentialStore, FlowStore};
use anthropic_pool::Pool;

use crate::config::Config;
use crate::proxy::ProxyState;

/// Upper bound on concurrently pending OAuth enrollment flows.
const MAX_PENDING_FLOWS: usize = 1000;

#[derive(Clone)]
struct HealthState {
    pool: Arc<Pool>,
    started_at: Instant,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_env("LOG_LEVEL")
                .or_else(|_| EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("starting anthropic-oauth-proxy");

    let args: Vec<String> = std::env::args().collect();
    let cli_config_path = args
        .iter()
        .position(|a| a == "--config")
        .and_then(|i| args.get(i + 1))
        .map(|s| s.as_str());

    let config_path = Config::resolve_path(cli_config_path);
    info!(path = %config_path.display(), "loading configuration");

    let config = Config::load(&config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;

    info!(
        listen_addr = %config.server.listen_addr,
        upstream_url = %config.server.upstream_url,
        rotation_enabled = config.server.rotation_enabled,
        rotation_paths = config.server.rotation_paths.len(),
        "configuration loaded"
    );

    let credential_store = Arc::new(
        CredentialStore::load(config.pool.accounts_path.clone())
            .await
            .with_context(|| format!("failed to load accounts from {}", config.pool.accounts_path.display()))?,
    );
    let account_ids = credential_store.account_ids().await;

    let http_client = reqwest::Client::builder()
        .build()
        .context("failed to build HTTP client")?;

    let pool = Arc::new(Pool::new(
        account_ids,
        Duration::from_secs(config.pool.cooldown_secs),
        credential_store,
        http_client.clone(),
    ));

    anthropic_pool::spawn_refresh_task(
        pool.clone(),
        Duration::from_secs(config.refresh.check_interval_secs),
        Duration::from_secs(config.refresh.buffer_secs),
    );

    if config.server.hot_reload_enabled {
        anthropic_pool::spawn_hot_reload_task(pool.clone(), anthropic_pool::watcher::POLL_INTERVAL);
    } else {
        info!("hot reload disabled");
    }

    let metrics_handle = metrics::install_recorder();

    let proxy_state = ProxyState {
        pool: pool.clone(),
        http_client: http_client.clone(),
        upstream_url: config.server.upstream_url.clone(),
        max_retries: config.pool.max_retries,
    };
    let oauth_state = oauth::OAuthState::new(
        pool.clone(),
        Arc::new(FlowStore::new(MAX_PENDING_FLOWS)),
        http_client.clone(),
        config.oauth.redirect_uri.clone(),
        Duration::from_secs(config.oauth.flow_ttl_secs),
    );
    let status_state = status::StatusState::new(pool.clone());
    let health_state = HealthState {
        pool: pool.clone(),
        started_at: Instant::now(),
    };

    let rotation_router = build_rotation_router(proxy_state, config.server.rotation_paths.clone(), config.server.rotation_enabled);
    let health_router = Router::new().route("/health", get(health_handler)).with_state(health_state);
    let metrics_router = Router::new().route("/metrics", get(metrics_handler)).with_state(metrics_handle);

    let app = Router::new()
        .merge(health_router)
        .merge(metrics_router)
        .merge(oauth::build_oauth_router(oauth_state))
        .merge(status::build_status_router(status_state))
        .merge(rotation_router);

    let listener = TcpListener::bind(config.server.listen_addr)
        .await
        .with_context(|| format!("failed to bind to {}", config.server.listen_addr))?;

    info!(addr = %config.server.listen_addr, "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    info!("shutdown complete");
    Ok(())
}

/// Rotation-eligible paths are the only ones this middleware touches;
/// everything else belongs to the routers merged alongside it, so an
/// unmatched path here falls through to a plain 404.
fn build_rotation_router(state: ProxyState, rotation_paths: Vec<String>, rotation_enabled: bool) -> Router {
    Router::new().fallback(move |request: axum::http::Request<axum::body::Body>| {
        let state = state.clone();
        let rotation_paths = rotation_paths.clone();
        async move {
            if !rotation_enabled || !proxy::is_rotation_path(request.uri().path(), &rotation_paths) {
                return StatusCode::NOT_FOUND.into_response();
            }
            proxy::proxy_request(&state, request).await
        }
    })
}

async fn health_handler(State(state): State<HealthState>) -> impl IntoResponse {
    let pool_status = state.pool.get_status().await;
    let uptime = state.started_at.elapsed().as_secs();

    let body = serde_json::json!({
        "status": if pool_status.available > 0 { "healthy" } else { "degraded" },
        "uptimeSeconds": uptime,
        "availableAccounts": pool_status.available,
        "totalAccounts": pool_status.total,
    });

    (
        StatusCode::OK,
        [(axum::http::header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
}

async fn metrics_handler(State(handle): State<metrics_exporter_prometheus::PrometheusHandle>) -> impl IntoResponse {
    (StatusCode::OK, handle.render())
}

/// Wait for SIGTERM or SIGINT for graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}
