//! Proactive background token refresh
//!
//! Spawns a periodic task that checks all accounts and refreshes tokens
//! approaching expiration, plus an on-demand entry point shared by the
//! `/status/accounts/{name}/refresh` operator endpoint. Both paths go
//! through the same retry primitive so a manually-triggered refresh and a
//! scheduled one behave identically.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::pool::{AccountState, Pool};

/// Refresh attempts per expiring token before giving up for this cycle.
const MAX_REFRESH_RETRIES: u32 = 3;
/// Base delay before the first retry; doubles each subsequent attempt.
const RETRY_BASE_DELAY: Duration = Duration::from_secs(5);

/// Spawn a background task that proactively refreshes expiring tokens.
///
/// Runs every `interval` and refreshes any token expiring within
/// `threshold`. Returns a `JoinHandle` for the spawned task.
pub fn spawn_refresh_task(
    pool: Arc<Pool>,
    interval: Duration,
    threshold: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // Skip the immediate first tick — tokens were just loaded
        ticker.tick().await;

        loop {
            ticker.tick().await;
            refresh_cycle(&pool, threshold).await;
        }
    })
}

/// Run one refresh cycle: check all accounts and refresh expiring tokens.
async fn refresh_cycle(pool: &Pool, threshold: Duration) {
    let ids = pool.account_ids().await;
    let threshold_millis = threshold.as_millis() as u64;
    let now_millis = now_ms();

    for id in &ids {
        let credential = match pool.credential_store().get(id).await {
            Some(c) => c,
            None => continue,
        };

        if !credential.needs_refresh(now_millis, threshold_millis) {
            continue;
        }

        refresh_account_now(pool, id).await;
    }
}

/// Refresh a single account's token now, with retry/backoff, transitioning
/// the account through `Refreshing` and back. Shared by the scheduled
/// cycle and the operator-triggered refresh endpoint.
///
/// If the account is already `Refreshing` (another caller got there
/// first), this is a no-op — callers should not assume a token was
/// actually refreshed just because this returned.
pub async fn refresh_account_now(pool: &Pool, id: &str) {
    if !pool.mark_refreshing(id).await {
        debug!(account = id, "refresh already in progress, skipping");
        return;
    }

    let credential = match pool.credential_store().get(id).await {
        Some(c) => c,
        None => {
            pool.mark_refresh_complete(id, Err("account removed during refresh".into()))
                .await;
            return;
        }
    };

    let client = pool.http_client();
    let mut delay = RETRY_BASE_DELAY;

    for attempt in 1..=MAX_REFRESH_RETRIES {
        match anthropic_auth::refresh_token(client, credential.refresh_token.expose()).await {
            Ok(token_response) => {
                let now_millis = now_ms();
                let new_expires = now_millis + token_response.expires_in * 1000;
                // The vendor's refresh response may omit refresh_token (rotation is
                // optional per-call); keep the existing one when that happens.
                let new_refresh_token = token_response
                    .refresh_token
                    .unwrap_or_else(|| credential.refresh_token.expose().clone());
                if let Err(e) = pool
                    .credential_store()
                    .update_token(
                        id,
                        token_response.access_token,
                        new_refresh_token,
                        new_expires,
                    )
                    .await
                {
                    warn!(account = id, error = %e, "failed to persist refreshed token");
                }
                info!(account = id, attempt, "token refresh succeeded");
                metrics::counter!("refresh_attempts_total", "outcome" => "success").increment(1);
                pool.mark_refresh_complete(id, Ok(())).await;
                return;
            }
            Err(anthropic_auth::Error::InvalidCredentials(msg)) => {
                warn!(account = id, error = %msg, "refresh token rejected, account needs re-enrollment");
                metrics::counter!("refresh_attempts_total", "outcome" => "terminal_failure").increment(1);
                pool.mark_refresh_complete(id, Err(msg)).await;
                return;
            }
            Err(e) if attempt < MAX_REFRESH_RETRIES => {
                warn!(
                    account = id,
                    attempt,
                    error = %e,
                    "transient refresh failure, retrying"
                );
                metrics::counter!("refresh_attempts_total", "outcome" => "transient_failure").increment(1);
                tokio::time::sleep(delay).await;
                delay *= 2;
            }
            Err(e) => {
                warn!(
                    account = id,
                    attempt,
                    error = %e,
                    "refresh failed after max retries, will retry next cycle"
                );
                metrics::counter!("refresh_attempts_total", "outcome" => "transient_failure").increment(1);
                pool.mark_refresh_abandoned(id).await;
                return;
            }
        }
    }
}

fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use anthropic_auth::{AccountCredentials, CredentialStore};

    async fn test_store(dir: &tempfile::TempDir, accounts: &[(&str, u64)]) -> Arc<CredentialStore> {
        let path = dir.path().join("accounts.json");
        let store = CredentialStore::load(path).await.unwrap();
        for (id, expires_at) in accounts {
            store
                .add(
                    id.to_string(),
                    AccountCredentials {
                        refresh_token: common::Secret::new(format!("rt_{id}")),
                        access_token: common::Secret::new(format!("at_{id}")),
                        expires_at: *expires_at,
                    },
                )
                .await
                .unwrap();
        }
        Arc::new(store)
    }

    #[tokio::test]
    async fn refresh_cycle_skips_valid_tokens() {
        let dir = tempfile::tempdir().unwrap();
        let store = test_store(&dir, &[("a", 4_102_444_800_000)]).await;
        let pool = Arc::new(crate::Pool::new(
            vec!["a".into()],
            Duration::from_secs(7200),
            store.clone(),
            reqwest::Client::new(),
        ));

        refresh_cycle(&pool, Duration::from_secs(900)).await;

        let cred = store.get("a").await.unwrap();
        assert_eq!(cred.access_token.expose(), "at_a");
        assert_eq!(pool.state_of("a").await, Some(AccountState::Available));
    }

    #[tokio::test]
    async fn refresh_already_in_progress_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let store = test_store(&dir, &[("a", 0)]).await;
        let pool = Arc::new(crate::Pool::new(
            vec!["a".into()],
            Duration::from_secs(7200),
            store,
            reqwest::Client::new(),
        ));

        assert!(pool.mark_refreshing("a").await);
        // Second call should be a no-op and leave the account Refreshing,
        // not touch the credential store or transition state.
        refresh_account_now(&pool, "a").await;
        assert_eq!(pool.state_of("a").await, Some(AccountState::Refreshing));
    }

    #[tokio::test]
    async fn refresh_missing_account_is_harmless() {
        let dir = tempfile::tempdir().unwrap();
        let store = test_store(&dir, &[]).await;
        let pool = Arc::new(crate::Pool::new(
            vec!["ghost".into()],
            Duration::from_secs(7200),
            store,
            reqwest::Client::new(),
        ));

        refresh_account_now(&pool, "ghost").await;
        match pool.state_of("ghost").await {
            Some(AccountState::AuthError { .. }) => {}
            other => panic!("expected AuthError, got {other:?}"),
        }
    }
}
