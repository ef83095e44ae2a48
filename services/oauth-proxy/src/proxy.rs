//! Rotation middleware: buffered request/response proxying with
//! account rotation on 429.
//!
//! Every rotation-eligible request is fully buffered (body and, for
//! non-streaming replies, the response) so a 429 can be retried against a
//! different account without the client ever seeing it. Streaming replies
//! (`Content-Type: text/event-stream`) are flushed to the client as soon as
//! headers arrive and are never retried — once bytes are in flight a retry
//! would duplicate the stream.

use std::sync::Arc;
use std::time::Instant;

use anthropic_pool::{AccountState, Pool};
use axum::body::{Body, Bytes};
use axum::http::request::Parts;
use axum::http::{HeaderValue, Request, StatusCode};
use axum::response::{IntoResponse, Response};
use tracing::warn;

use crate::metrics;

/// Headers never forwarded between client and upstream.
const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
    "host",
];

/// Largest request body accepted from a client before rejecting with 400.
const MAX_BODY_BYTES: usize = 20 * 1024 * 1024;
const UPSTREAM_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(240);
const RATE_LIMIT_RETRY_AFTER: &str = "60";
const ACCOUNT_NAME_HEADER: &str = "x-account-name";

pub fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP_HEADERS.iter().any(|h| h.eq_ignore_ascii_case(name))
}

/// Whether `path` falls under one of the configured rotation-eligible
/// prefixes. Everything else passes through unrouted by this middleware.
pub fn is_rotation_path(path: &str, prefixes: &[String]) -> bool {
    prefixes.iter().any(|p| path.starts_with(p.as_str()))
}

#[derive(Clone)]
pub struct ProxyState {
    pub pool: Arc<Pool>,
    pub http_client: reqwest::Client,
    pub upstream_url: String,
    pub max_retries: u32,
}

/// Entry point called for every request matching a rotation-eligible path.
pub async fn proxy_request(state: &ProxyState, request: Request<Body>) -> Response {
    let start = Instant::now();
    let (parts, body) = request.into_parts();

    let body_bytes = match axum::body::to_bytes(body, MAX_BODY_BYTES).await {
        Ok(b) => b,
        Err(e) => {
            return error_response(
                StatusCode::BAD_REQUEST,
                "invalid_request",
                &format!("failed to read request body: {e}"),
            );
        }
    };

    let manual_account = parts
        .headers
        .get(ACCOUNT_NAME_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    match manual_account {
        Some(account_name) => handle_manual(state, &parts, body_bytes, &account_name, start).await,
        None => handle_automatic(state, &parts, body_bytes, start).await,
    }
}

/// Manual account-override mode: honour the caller's choice even if it gets
/// rate limited. No retry, no fallback to automatic rotation.
async fn handle_manual(
    state: &ProxyState,
    parts: &Parts,
    body: Bytes,
    account_name: &str,
    start: Instant,
) -> Response {
    if !state.pool.contains(account_name).await {
        metrics::record_request(404, account_name, start.elapsed().as_secs_f64());
        return error_response(
            StatusCode::NOT_FOUND,
            "unknown_account",
            &format!("no such account: {account_name}"),
        );
    }

    let account_state = state.pool.state_of(account_name).await;
    if !matches!(account_state, Some(AccountState::Available)) {
        let label = account_state.as_ref().map(AccountState::label).unwrap_or("absent");
        metrics::record_request(503, account_name, start.elapsed().as_secs_f64());
        return error_response_json(
            StatusCode::SERVICE_UNAVAILABLE,
            serde_json::json!({ "error": { "type": "account_unavailable", "state": label } }),
        );
    }

    let access_token = match state.pool.get_account_token(account_name).await {
        Some(t) => t,
        None => {
            metrics::record_request(503, account_name, start.elapsed().as_secs_f64());
            return error_response_json(
                StatusCode::SERVICE_UNAVAILABLE,
                serde_json::json!({ "error": { "type": "account_unavailable", "state": "no_credentials" } }),
            );
        }
    };

    let upstream_response = match send_attempt(state, parts, body, &access_token).await {
        Ok(r) => r,
        Err(e) => {
            warn!(account = account_name, error = %e, "upstream request failed");
            metrics::record_request(502, account_name, start.elapsed().as_secs_f64());
            return error_response(StatusCode::BAD_GATEWAY, "upstream_unreachable", &e.to_string());
        }
    };

    let status = upstream_response.status();
    if content_type_is_event_stream(upstream_response.headers()) {
        return stream_through(upstream_response, account_name, start);
    }

    let (headers, resp_body) = buffer_response(upstream_response).await;

    if status.as_u16() == 429 {
        let reset_ms = anthropic_pool::reset_at_from_headers(&headers);
        state.pool.mark_rate_limited_until_ms(account_name, reset_ms).await;
    } else if status.as_u16() == 401 || status.as_u16() == 403 {
        let message = extract_error_message(&resp_body).unwrap_or_else(|| "authentication failed".into());
        state.pool.mark_auth_error(account_name, message).await;
    }

    metrics::record_request(status.as_u16(), account_name, start.elapsed().as_secs_f64());
    build_response(status, &headers, resp_body)
}

/// Automatic rotation: up to `max_retries + 1` attempts, excluding every
/// account already tried, retrying only on a buffered 429.
async fn handle_automatic(state: &ProxyState, parts: &Parts, body: Bytes, start: Instant) -> Response {
    let max_attempts = state.max_retries + 1;
    let mut tried: Vec<String> = Vec::new();

    for attempt in 0..max_attempts {
        let selected = match state.pool.select(&tried).await {
            Ok(s) => s,
            Err(anthropic_pool::Error::PoolExhausted(body)) => {
                metrics::record_request(503, "none", start.elapsed().as_secs_f64());
                return error_response_raw(StatusCode::SERVICE_UNAVAILABLE, body);
            }
            Err(e) => {
                return error_response(StatusCode::INTERNAL_SERVER_ERROR, "internal_error", &e.to_string());
            }
        };
        tried.push(selected.name.clone());

        let upstream_response = match send_attempt(state, parts, body.clone(), &selected.access_token).await {
            Ok(r) => r,
            Err(e) => {
                warn!(account = selected.name, error = %e, "upstream request failed");
                if attempt + 1 < max_attempts {
                    metrics::record_retry();
                    continue;
                }
                metrics::record_request(502, &selected.name, start.elapsed().as_secs_f64());
                return error_response(StatusCode::BAD_GATEWAY, "upstream_unreachable", &e.to_string());
            }
        };

        let status = upstream_response.status();
        if content_type_is_event_stream(upstream_response.headers()) {
            return stream_through(upstream_response, &selected.name, start);
        }

        let (headers, resp_body) = buffer_response(upstream_response).await;

        if status.as_u16() == 429 {
            let reset_ms = anthropic_pool::reset_at_from_headers(&headers);
            // mark_rate_limited happens-before any byte of this response
            // reaches the client, for both the retried and terminal cases.
            state.pool.mark_rate_limited_until_ms(&selected.name, reset_ms).await;

            if attempt + 1 < max_attempts {
                metrics::record_retry();
                continue;
            }

            metrics::record_request(429, &selected.name, start.elapsed().as_secs_f64());
            let earliest_reset = earliest_rate_limited_reset(&state.pool, &tried).await;
            return (
                StatusCode::TOO_MANY_REQUESTS,
                [(axum::http::header::RETRY_AFTER, RATE_LIMIT_RETRY_AFTER)],
                axum::Json(serde_json::json!({
                    "error": {
                        "type": "all_accounts_rate_limited",
                        "triedAccounts": tried,
                        "retryAfter": earliest_reset,
                    }
                })),
            )
                .into_response();
        }

        if status.as_u16() == 401 || status.as_u16() == 403 {
            let message = extract_error_message(&resp_body).unwrap_or_else(|| "authentication failed".into());
            state.pool.mark_auth_error(&selected.name, message).await;
        }

        metrics::record_request(status.as_u16(), &selected.name, start.elapsed().as_secs_f64());
        return build_response(status, &headers, resp_body);
    }

    error_response(StatusCode::INTERNAL_SERVER_ERROR, "internal_error", "rotation loop exited without a response")
}

/// Best-effort "earliest reset" across the accounts tried this request, for
/// the terminal 429's `retryAfter` field. Falls back to the fixed
/// `Retry-After` header value if none report a remaining cooldown.
async fn earliest_rate_limited_reset(pool: &Pool, tried: &[String]) -> String {
    let status = pool.get_status().await;
    tried
        .iter()
        .filter_map(|name| status.accounts.iter().find(|a| &a.name == name))
        .filter_map(|a| a.rate_limited_remaining_secs)
        .min()
        .map(|secs| secs.to_string())
        .unwrap_or_else(|| RATE_LIMIT_RETRY_AFTER.to_string())
}

async fn send_attempt(
    state: &ProxyState,
    parts: &Parts,
    body: Bytes,
    access_token: &str,
) -> crate::error::Result<reqwest::Response> {
    let path_and_query = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or_else(|| parts.uri.path());
    let url = format!("{}{}", state.upstream_url.trim_end_matches('/'), path_and_query);

    let mut headers = forward_headers(&parts.headers);
    let bearer = HeaderValue::from_str(&format!("Bearer {access_token}"))
        .map_err(|e| crate::error::Error::UpstreamError(format!("invalid access token: {e}")))?;
    headers.insert(reqwest::header::AUTHORIZATION, bearer);

    state
        .http_client
        .request(parts.method.clone(), url)
        .headers(headers)
        .body(body)
        .timeout(UPSTREAM_TIMEOUT)
        .send()
        .await
        .map_err(|e| {
            if e.is_timeout() {
                crate::error::Error::UpstreamTimeout(UPSTREAM_TIMEOUT.as_secs())
            } else {
                crate::error::Error::UpstreamError(e.to_string())
            }
        })
}

fn forward_headers(src: &axum::http::HeaderMap) -> reqwest::header::HeaderMap {
    let mut out = reqwest::header::HeaderMap::new();
    for (name, value) in src.iter() {
        if is_hop_by_hop(name.as_str()) || name.as_str().eq_ignore_ascii_case("authorization") {
            continue;
        }
        out.insert(name.clone(), value.clone());
    }
    out
}

fn content_type_is_event_stream(headers: &reqwest::header::HeaderMap) -> bool {
    headers
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|ct| ct.starts_with("text/event-stream"))
        .unwrap_or(false)
}

/// Flush headers immediately and pipe the body through unchanged. Never
/// called for 401/403 in practice — upstream error bodies are always plain
/// JSON, never an event stream — so auth-error detection lives entirely in
/// the buffered path.
fn stream_through(response: reqwest::Response, account: &str, start: Instant) -> Response {
    let status = response.status();
    metrics::record_request(status.as_u16(), account, start.elapsed().as_secs_f64());

    let mut builder = Response::builder().status(status);
    for (name, value) in response.headers().iter() {
        if is_hop_by_hop(name.as_str()) {
            continue;
        }
        builder = builder.header(name, value);
    }
    builder
        .body(Body::from_stream(response.bytes_stream()))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

async fn buffer_response(response: reqwest::Response) -> (reqwest::header::HeaderMap, Bytes) {
    let headers = response.headers().clone();
    let body = response.bytes().await.unwrap_or_default();
    (headers, body)
}

fn build_response(status: reqwest::StatusCode, headers: &reqwest::header::HeaderMap, body: Bytes) -> Response {
    let mut builder = Response::builder().status(status);
    for (name, value) in headers.iter() {
        if is_hop_by_hop(name.as_str()) {
            continue;
        }
        builder = builder.header(name, value);
    }
    builder
        .body(Body::from(body))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

fn extract_error_message(body: &Bytes) -> Option<String> {
    let value: serde_json::Value = serde_json::from_slice(body).ok()?;
    value.get("error")?.get("message")?.as_str().map(str::to_string)
}

fn error_response(status: StatusCode, error_type: &str, message: &str) -> Response {
    error_response_json(status, serde_json::json!({ "error": { "type": error_type, "message": message } }))
}

fn error_response_json(status: StatusCode, body: serde_json::Value) -> Response {
    (status, [(axum::http::header::CONTENT_TYPE, "application/json")], body.to_string()).into_response()
}

/// `body` is already a complete JSON string (the pool's exhausted-message
/// builder produces one) — write it through without re-serializing.
fn error_response_raw(status: StatusCode, body: String) -> Response {
    (status, [(axum::http::header::CONTENT_TYPE, "application/json")], body).into_response()
}
