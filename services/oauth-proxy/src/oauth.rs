//! OAuth enrollment endpoints
//!
//! Wraps `anthropic_auth::FlowStore` with the HTTP surface for adding a new
//! account: `start` hands back an authorization URL, `callback`/`exchange`
//! redeem the code the user pastes back from the vendor's landing page (the
//! `code=true` query parameter makes the vendor render the code instead of
//! performing a real browser redirect, so both a GET and a POST variant
//! exist for whichever the operator's tooling prefers).

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anthropic_auth::{AccountCredentials, CredentialStore, FlowStore};
use anthropic_pool::Pool;
use axum::Router;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use serde::Deserialize;
use tracing::{info, warn};

const MAX_CODE_LEN: usize = 1000;
const MAX_STATE_LEN: usize = 100;

#[derive(Clone)]
pub struct OAuthState {
    pool: Arc<Pool>,
    flows: Arc<FlowStore>,
    http_client: reqwest::Client,
    redirect_uri: String,
    flow_ttl: Duration,
}

impl OAuthState {
    pub fn new(
        pool: Arc<Pool>,
        flows: Arc<FlowStore>,
        http_client: reqwest::Client,
        redirect_uri: String,
        flow_ttl: Duration,
    ) -> Self {
        Self {
            pool,
            flows,
            http_client,
            redirect_uri,
            flow_ttl,
        }
    }
}

pub fn build_oauth_router(state: OAuthState) -> Router {
    Router::new()
        .route("/oauth/start", post(start))
        .route("/oauth/callback", get(callback))
        .route("/oauth/exchange", post(exchange))
        .with_state(state)
}

#[derive(Deserialize)]
struct StartRequest {
    account_name: String,
}

async fn start(State(state): State<OAuthState>, axum::Json(body): axum::Json<StartRequest>) -> impl IntoResponse {
    if let Err(e) = anthropic_pool::validate_account_name(&body.account_name) {
        return error_json(StatusCode::BAD_REQUEST, "invalid_account_name", &e);
    }

    let (oauth_state, auth_url) = state
        .flows
        .start(body.account_name.clone(), &state.redirect_uri, state.flow_ttl)
        .await;

    info!(account_name = body.account_name, "oauth enrollment started");

    ok_json(serde_json::json!({ "authUrl": auth_url, "state": oauth_state }))
}

#[derive(Deserialize)]
struct CallbackParams {
    code: Option<String>,
    state: Option<String>,
    error: Option<String>,
}

async fn callback(State(state): State<OAuthState>, Query(params): Query<CallbackParams>) -> impl IntoResponse {
    if let Some(error) = params.error {
        return error_json(StatusCode::BAD_REQUEST, "authorization_denied", &error);
    }
    let (Some(code), Some(oauth_state)) = (params.code, params.state) else {
        return error_json(StatusCode::BAD_REQUEST, "invalid_request", "missing code or state");
    };
    complete_enrollment(&state, &code, &oauth_state).await
}

#[derive(Deserialize)]
struct ExchangeRequest {
    code: String,
    state: String,
}

async fn exchange(State(state): State<OAuthState>, axum::Json(body): axum::Json<ExchangeRequest>) -> impl IntoResponse {
    complete_enrollment(&state, &body.code, &body.state).await
}

async fn complete_enrollment(state: &OAuthState, raw_code: &str, raw_state: &str) -> axum::response::Response {
    let Some(code) = anthropic_auth::sanitize_oauth_param(raw_code, MAX_CODE_LEN) else {
        return error_json(StatusCode::BAD_REQUEST, "invalid_code", "code is empty or too long");
    };
    let Some(oauth_state) = anthropic_auth::sanitize_oauth_param(raw_state, MAX_STATE_LEN) else {
        return error_json(StatusCode::BAD_REQUEST, "invalid_state", "state is empty or too long");
    };

    // The handle is consumed whether the exchange below succeeds or fails —
    // a dead state must never be retried against a fresh authorization code.
    let Some(handle) = state.flows.take(&oauth_state).await else {
        return error_json(StatusCode::BAD_REQUEST, "unknown_flow", "no pending enrollment for this state");
    };

    let token_response = match anthropic_auth::exchange_code(&state.http_client, &code, &oauth_state, &state.redirect_uri).await {
        Ok(r) => r,
        Err(e) => {
            warn!(account_name = handle.account_name, error = %e, "oauth token exchange failed");
            return error_json(StatusCode::BAD_GATEWAY, "token_exchange_failed", &e.to_string());
        }
    };

    let Some(refresh_token) = token_response.refresh_token else {
        warn!(account_name = handle.account_name, "token endpoint omitted refresh_token on initial exchange");
        return error_json(
            StatusCode::BAD_GATEWAY,
            "token_exchange_failed",
            "token endpoint did not return a refresh token",
        );
    };

    let expires_at = now_ms() + token_response.expires_in * 1000;
    let credentials = AccountCredentials {
        access_token: common::Secret::new(token_response.access_token),
        refresh_token: common::Secret::new(refresh_token),
        expires_at,
    };

    if let Err(e) = write_credential(state.pool.credential_store(), handle.account_name.clone(), credentials).await {
        warn!(account_name = handle.account_name, error = %e, "failed to persist enrolled credential");
        return error_json(StatusCode::INTERNAL_SERVER_ERROR, "storage_failed", &e.to_string());
    }

    state.pool.add_account(handle.account_name.clone()).await;
    info!(account_name = handle.account_name, "oauth enrollment completed");

    ok_json(serde_json::json!({ "accountName": handle.account_name, "status": "added" }))
}

async fn write_credential(
    store: &CredentialStore,
    account_name: String,
    credentials: AccountCredentials,
) -> anthropic_auth::Result<()> {
    store.add(account_name, credentials).await
}

fn now_ms() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as u64
}

fn ok_json(body: serde_json::Value) -> axum::response::Response {
    (StatusCode::OK, [(axum::http::header::CONTENT_TYPE, "application/json")], body.to_string()).into_response()
}

fn error_json(status: StatusCode, error_type: &str, message: &str) -> axum::response::Response {
    (
        status,
        [(axum::http::header::CONTENT_TYPE, "application/json")],
        serde_json::json!({ "error": { "type": error_type, "message": message } }).to_string(),
    )
        .into_response()
}
