//! OAuth enrollment flow handles
//!
//! A flow handle tracks one in-progress PKCE enrollment from `start()`
//! (authorization URL issued) through `exchange()` (code redeemed for
//! tokens). The handle is keyed by `state`, which is the same string as
//! the PKCE `code_verifier` — see `pkce::build_authorization_url`'s doc
//! comment for why that reuse is required rather than incidental. Keying
//! on `state` this way means the challenge can always be rederived from
//! just the state string, with no second table.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;

use crate::pkce::{build_authorization_url, compute_challenge, generate_verifier};

/// An in-progress enrollment, keyed by its `state` (== `code_verifier`).
#[derive(Debug, Clone)]
pub struct FlowHandle {
    pub state: String,
    pub account_name: String,
    created_at: Instant,
    ttl: Duration,
}

impl FlowHandle {
    fn is_expired(&self) -> bool {
        self.created_at.elapsed() >= self.ttl
    }
}

/// Bounded, TTL'd store of in-progress enrollments.
///
/// Guarded by a single `tokio::sync::Mutex` — contention is negligible
/// since enrollment is an operator action, not request-path traffic.
pub struct FlowStore {
    handles: Mutex<HashMap<String, FlowHandle>>,
    max_entries: usize,
}

impl FlowStore {
    pub fn new(max_entries: usize) -> Self {
        Self {
            handles: Mutex::new(HashMap::new()),
            max_entries,
        }
    }

    /// Start a new enrollment: generate a verifier/state/challenge, build
    /// the authorization URL, and register the handle. Returns
    /// `(state, authorization_url)`.
    pub async fn start(&self, account_name: String, redirect_uri: &str, ttl: Duration) -> (String, String) {
        let verifier = generate_verifier();
        let challenge = compute_challenge(&verifier);
        let url = build_authorization_url(&verifier, &challenge, redirect_uri);

        let mut handles = self.handles.lock().await;
        handles.retain(|_, h| !h.is_expired());
        if handles.len() >= self.max_entries {
            if let Some(oldest) = handles
                .iter()
                .min_by_key(|(_, h)| h.created_at)
                .map(|(k, _)| k.clone())
            {
                handles.remove(&oldest);
            }
        }
        handles.insert(
            verifier.clone(),
            FlowHandle {
                state: verifier.clone(),
                account_name,
                created_at: Instant::now(),
                ttl,
            },
        );

        (verifier, url)
    }

    /// Rebuild the authorization URL for an already-registered state,
    /// without creating a new handle. Returns `None` if unknown or expired.
    pub async fn build_auth_url_for_state(&self, state: &str, redirect_uri: &str) -> Option<String> {
        let handles = self.handles.lock().await;
        let handle = handles.get(state)?;
        if handle.is_expired() {
            return None;
        }
        let challenge = compute_challenge(state);
        Some(build_authorization_url(state, &challenge, redirect_uri))
    }

    /// Consume a handle by state. Returns `None` if unknown or expired
    /// (an expired handle is removed but treated as absent).
    pub async fn take(&self, state: &str) -> Option<FlowHandle> {
        let mut handles = self.handles.lock().await;
        let handle = handles.remove(state)?;
        if handle.is_expired() { None } else { Some(handle) }
    }

    /// Remove every expired handle. Exposed so callers can run it on a
    /// schedule independent of `start()`'s lazy cleanup.
    pub async fn cleanup_expired(&self) {
        let mut handles = self.handles.lock().await;
        handles.retain(|_, h| !h.is_expired());
    }

    #[cfg(test)]
    async fn len(&self) -> usize {
        self.handles.lock().await.len()
    }
}

/// Sanitize a user-supplied OAuth `code` or `state` value: trim
/// whitespace, truncate at the first `#` (browsers sometimes paste URL
/// fragments), and reject values longer than `max_len`.
pub fn sanitize_oauth_param(raw: &str, max_len: usize) -> Option<String> {
    let trimmed = raw.trim();
    let truncated = trimmed.split('#').next().unwrap_or(trimmed);
    if truncated.is_empty() || truncated.len() > max_len {
        return None;
    }
    Some(truncated.to_string())
}
