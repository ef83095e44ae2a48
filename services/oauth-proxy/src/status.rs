//! Pool and per-account status/control endpoints
//!
//! Read-only pool introspection (`/status`, `/status/accounts/{name}`) plus
//! the three operator actions that mutate account state outside the normal
//! request-driven transitions: forcing a refresh, and enabling/disabling.

use std::sync::Arc;

use anthropic_pool::{AccountRecord, AccountState, Pool, PoolStatus};
use axum::Router;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};

#[derive(Clone)]
pub struct StatusState {
    pool: Arc<Pool>,
}

impl StatusState {
    pub fn new(pool: Arc<Pool>) -> Self {
        Self { pool }
    }
}

pub fn build_status_router(state: StatusState) -> Router {
    Router::new()
        .route("/status", get(pool_status))
        .route("/status/accounts/{name}", get(account_status))
        .route("/status/accounts/{name}/refresh", post(account_refresh))
        .route("/status/accounts/{name}/enable", post(account_enable))
        .route("/status/accounts/{name}/disable", post(account_disable))
        .with_state(state)
}

fn pool_status_json(status: &PoolStatus) -> serde_json::Value {
    serde_json::json!({
        "totalAccounts": status.total,
        "availableAccounts": status.available,
        "rateLimitedAccounts": status.rate_limited,
        "authErrorAccounts": status.auth_error,
        "nextAccount": status.next_account,
        "accounts": status.accounts.iter().map(account_record_json).collect::<Vec<_>>(),
    })
}

fn account_record_json(record: &AccountRecord) -> serde_json::Value {
    serde_json::json!({
        "name": record.name,
        "state": record.state,
        "rateLimitedRemainingSecs": record.rate_limited_remaining_secs,
        "lastError": record.last_error,
        "lastUsed": record.last_used,
        "capacity": record.capacity,
    })
}

async fn pool_status(State(state): State<StatusState>) -> impl IntoResponse {
    let status = state.pool.get_status().await;
    json_response(StatusCode::OK, pool_status_json(&status))
}

async fn account_status(State(state): State<StatusState>, Path(name): Path<String>) -> impl IntoResponse {
    let status = state.pool.get_status().await;
    match status.accounts.iter().find(|a| a.name == name) {
        Some(record) => json_response(StatusCode::OK, account_record_json(record)),
        None => unknown_account(&name),
    }
}

async fn account_refresh(State(state): State<StatusState>, Path(name): Path<String>) -> impl IntoResponse {
    if !state.pool.contains(&name).await {
        return unknown_account(&name);
    }
    anthropic_pool::refresh_account_now(&state.pool, &name).await;
    let state_label = state.pool.state_of(&name).await.as_ref().map(AccountState::label).unwrap_or("absent");
    json_response(StatusCode::OK, serde_json::json!({ "name": name, "state": state_label }))
}

async fn account_enable(State(state): State<StatusState>, Path(name): Path<String>) -> impl IntoResponse {
    if !state.pool.contains(&name).await {
        return unknown_account(&name);
    }
    state.pool.mark_available(&name).await;
    json_response(StatusCode::OK, serde_json::json!({ "name": name, "state": "available" }))
}

async fn account_disable(State(state): State<StatusState>, Path(name): Path<String>) -> impl IntoResponse {
    if !state.pool.contains(&name).await {
        return unknown_account(&name);
    }
    state.pool.set_status(&name, AccountState::Disabled).await;
    json_response(StatusCode::OK, serde_json::json!({ "name": name, "state": "disabled" }))
}

fn unknown_account(name: &str) -> axum::response::Response {
    json_response(
        StatusCode::NOT_FOUND,
        serde_json::json!({ "error": { "type": "unknown_account", "message": format!("no such account: {name}") } }),
    )
}

fn json_response(status: StatusCode, body: serde_json::Value) -> axum::response::Response {
    (status, [(axum::http::header::CONTENT_TYPE, "application/json")], body.to_string()).into_response()
}
