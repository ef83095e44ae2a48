//! Pool state machine and round-robin account selection
//!
//! The pool holds per-account runtime state (Available, RateLimited,
//! AuthError, Disabled, Refreshing) and selects accounts round-robin. The
//! credential store is the single source of truth for token data; the pool
//! reads credentials at selection time but never owns them.
//!
//! Rate-limit transitions happen automatically: when a RateLimited account
//! is swept and its reset time has passed, it transitions back to Available
//! without explicit action. Refreshing accounts are excluded from selection
//! entirely — refresh is owned by `refresh.rs`, not by selection.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use anthropic_auth::{AccountCredentials, CredentialStore};
use serde::Serialize;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::quota::ErrorClassification;

/// Validate an account name: lowercase alphanumeric plus `_`/`-`, max 32 chars.
pub fn validate_account_name(name: &str) -> std::result::Result<(), String> {
    if name.is_empty() || name.len() > 32 {
        return Err(format!("account name must be 1-32 characters: {name:?}"));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-')
    {
        return Err(format!(
            "account name must be lowercase alphanumeric plus '_'/'-': {name:?}"
        ));
    }
    Ok(())
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Best-effort capacity tracking reported by the upstream. Never consulted
/// by selection — surfaced only in status responses.
#[derive(Debug, Clone, Serialize)]
pub struct Capacity {
    pub tokens_limit: Option<u64>,
    pub tokens_remaining: Option<u64>,
    pub requests_limit: Option<u64>,
    pub requests_remaining: Option<u64>,
    pub checked_at: u64,
}

/// Runtime status of a pool account.
///
/// Transitions:
/// - Available → RateLimited (quota exhausted 429)
/// - Available → AuthError (401/403 from a proxied request)
/// - Available → Refreshing (scheduler picks it up) → Available | AuthError
/// - RateLimited → Available (reset time elapsed)
/// - Any → Disabled (operator action) → Available (operator re-enables)
#[derive(Debug, Clone, PartialEq)]
pub enum AccountState {
    Available,
    RateLimited { until: Instant },
    AuthError { message: String },
    Disabled,
    Refreshing,
}

impl AccountState {
    pub fn label(&self) -> &'static str {
        match self {
            AccountState::Available => "available",
            AccountState::RateLimited { .. } => "rate_limited",
            AccountState::AuthError { .. } => "auth_error",
            AccountState::Disabled => "disabled",
            AccountState::Refreshing => "refreshing",
        }
    }
}

#[derive(Debug, Clone)]
struct AccountRuntime {
    state: AccountState,
    last_used: Option<Instant>,
    capacity: Option<Capacity>,
    /// State the account had just before `mark_refreshing` overwrote it,
    /// so an inconclusive refresh attempt can restore it rather than
    /// forcing `Available`.
    pre_refresh_state: Option<AccountState>,
}

impl Default for AccountRuntime {
    fn default() -> Self {
        Self {
            state: AccountState::Available,
            last_used: None,
            capacity: None,
            pre_refresh_state: None,
        }
    }
}

/// A selected account with its access token, ready for a request.
#[derive(Debug)]
pub struct SelectedAccount {
    pub name: String,
    pub access_token: String,
}

/// Snapshot of one account for status endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct AccountRecord {
    pub name: String,
    pub state: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rate_limited_remaining_secs: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub last_used: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub capacity: Option<Capacity>,
}

/// Pool-wide counts for status endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct PoolStatus {
    pub total: usize,
    pub available: usize,
    pub rate_limited: usize,
    pub auth_error: usize,
    pub disabled: usize,
    pub next_account: Option<String>,
    pub accounts: Vec<AccountRecord>,
}

/// Rotation pool managing multiple OAuth accounts.
///
/// `order` establishes round-robin order; `runtime` tracks per-account
/// state. Both are behind separate locks (matching the selection path's
/// need to read credentials, which live in a third place, without holding
/// either lock across network I/O). Lock order when both are needed:
/// `order` before `runtime`.
pub struct Pool {
    order: RwLock<Vec<String>>,
    runtime: RwLock<HashMap<String, AccountRuntime>>,
    cursor: AtomicUsize,
    default_rate_limit_duration: Duration,
    credential_store: std::sync::Arc<CredentialStore>,
    http_client: reqwest::Client,
    /// mtime of the backing accounts file as of the last load/reload, used
    /// by the hot-reload watcher to detect external edits.
    last_mtime: RwLock<Option<std::time::SystemTime>>,
}

impl Pool {
    /// Create a new pool backed by the given credential store.
    ///
    /// `account_names` is the initial round-robin order. Each name should
    /// have a corresponding entry in the credential store. Accounts start
    /// Available.
    pub fn new(
        account_names: Vec<String>,
        default_rate_limit_duration: Duration,
        credential_store: std::sync::Arc<CredentialStore>,
        http_client: reqwest::Client,
    ) -> Self {
        let runtime: HashMap<String, AccountRuntime> = account_names
            .iter()
            .map(|name| (name.clone(), AccountRuntime::default()))
            .collect();
        info!(accounts = account_names.len(), "pool initialized");
        Self {
            order: RwLock::new(account_names),
            runtime: RwLock::new(runtime),
            cursor: AtomicUsize::new(0),
            default_rate_limit_duration,
            credential_store,
            http_client,
            last_mtime: RwLock::new(None),
        }
    }

    /// Record the accounts file's current mtime as the reload baseline.
    /// Call once after construction, before the hot-reload watcher starts,
    /// so the watcher's first poll doesn't treat the just-loaded file as
    /// "changed".
    pub async fn init_reload_baseline(&self) {
        *self.last_mtime.write().await = self.credential_store.file_mtime().await;
    }

    /// Sweep all accounts, transitioning any whose rate-limit window has
    /// elapsed back to Available. Called at the start of every selection
    /// and exposed standalone for status endpoints.
    async fn sweep(&self) {
        let mut runtime = self.runtime.write().await;
        let now = Instant::now();
        for (name, rt) in runtime.iter_mut() {
            if let AccountState::RateLimited { until } = rt.state {
                if now >= until {
                    debug!(account = name, "rate limit window elapsed, now available");
                    rt.state = AccountState::Available;
                }
            }
        }
    }

    /// Select the next available account via round-robin, excluding any
    /// name in `exclude` (used by the retry loop to avoid re-selecting an
    /// account already tried for this request).
    ///
    /// Sweeps expired rate limits first. The cursor only advances on a
    /// successful selection, so a run of unavailable accounts never causes
    /// it to "skip ahead".
    pub async fn select(&self, exclude: &[String]) -> Result<SelectedAccount> {
        self.sweep().await;

        let ids = self.order.read().await;
        let n = ids.len();
        if n == 0 {
            return Err(Error::PoolExhausted(self.exhausted_message().await));
        }

        let start = (self.cursor.load(Ordering::Relaxed) + 1) % n;

        for offset in 0..n {
            let idx = (start + offset) % n;
            let name = &ids[idx];

            if exclude.iter().any(|e| e == name) {
                continue;
            }

            let available = {
                let runtime = self.runtime.read().await;
                matches!(
                    runtime.get(name).map(|rt| &rt.state),
                    Some(AccountState::Available)
                )
            };
            if !available {
                continue;
            }

            let credentials = match self.credential_store.get(name).await {
                Some(c) => c,
                None => {
                    warn!(
                        account = name,
                        "account in pool but not in credential store, disabling"
                    );
                    self.set_state(name, AccountState::Disabled).await;
                    continue;
                }
            };

            if credentials.is_expired(now_ms()) {
                debug!(account = name, "access token expired, skipping until refreshed");
                continue;
            }

            self.cursor.store(idx, Ordering::Relaxed);
            self.mark_used(name).await;

            return Ok(SelectedAccount {
                name: name.clone(),
                access_token: credentials.access_token.expose().clone(),
            });
        }

        Err(Error::PoolExhausted(self.exhausted_message().await))
    }

    /// Mark an account rate-limited. `reset_at` is an absolute `Instant`;
    /// pass `None` to apply the pool's default duration.
    pub async fn mark_rate_limited(&self, name: &str, reset_at: Option<Instant>) {
        let until = reset_at.unwrap_or_else(|| Instant::now() + self.default_rate_limit_duration);
        info!(account = name, "account rate limited");
        self.set_state(name, AccountState::RateLimited { until })
            .await;
    }

    /// Mark an account rate-limited using a reset time derived from
    /// upstream headers (absolute unix millis), converting to the pool's
    /// monotonic clock.
    pub async fn mark_rate_limited_until_ms(&self, name: &str, reset_at_ms: u64) {
        let now = now_ms();
        let delay = reset_at_ms.saturating_sub(now);
        let until = Instant::now() + Duration::from_millis(delay);
        self.mark_rate_limited(name, Some(until)).await;
    }

    /// Mark an account as having failed authentication. Not retried by the
    /// middleware; only a fresh enrollment clears this.
    pub async fn mark_auth_error(&self, name: &str, message: String) {
        warn!(account = name, %message, "account auth error");
        self.set_state(name, AccountState::AuthError { message })
            .await;
    }

    /// Clear any rate-limit/auth-error/refreshing state.
    pub async fn mark_available(&self, name: &str) {
        self.set_state(name, AccountState::Available).await;
    }

    /// Transition to Refreshing, which excludes the account from selection.
    /// Returns false if the account was already Refreshing or doesn't exist.
    pub async fn mark_refreshing(&self, name: &str) -> bool {
        let mut runtime = self.runtime.write().await;
        match runtime.get_mut(name) {
            Some(rt) if rt.state != AccountState::Refreshing => {
                rt.pre_refresh_state = Some(rt.state.clone());
                rt.state = AccountState::Refreshing;
                true
            }
            _ => false,
        }
    }

    /// Transition out of Refreshing: Available on success, AuthError on
    /// terminal failure.
    pub async fn mark_refresh_complete(&self, name: &str, outcome: std::result::Result<(), String>) {
        match outcome {
            Ok(()) => self.mark_available(name).await,
            Err(message) => self.mark_auth_error(name, message).await,
        }
    }

    /// Abandon an in-progress refresh without a conclusive outcome (retries
    /// exhausted on a transient failure): restore whatever state the
    /// account had before the refresh attempt started, rather than forcing
    /// it back to `Available`. A `RateLimited`/`Disabled` account that got
    /// picked up for a routine token refresh must not have that cooldown
    /// silently cancelled by an unrelated refresh hiccup.
    pub async fn mark_refresh_abandoned(&self, name: &str) {
        let restore = {
            let mut runtime = self.runtime.write().await;
            runtime.get_mut(name).and_then(|rt| rt.pre_refresh_state.take())
        }
        .unwrap_or(AccountState::Available);
        info!(account = name, state = restore.label(), "refresh abandoned, restoring prior state");
        self.set_state(name, restore).await;
    }

    async fn mark_used(&self, name: &str) {
        let mut runtime = self.runtime.write().await;
        if let Some(rt) = runtime.get_mut(name) {
            rt.last_used = Some(Instant::now());
        }
    }

    async fn set_state(&self, name: &str, state: AccountState) {
        let mut runtime = self.runtime.write().await;
        let from = runtime
            .get(name)
            .map(|rt| rt.state.label())
            .unwrap_or("absent");
        let to = state.label();
        if let Some(rt) = runtime.get_mut(name) {
            rt.state = state;
        } else {
            runtime.insert(
                name.to_string(),
                AccountRuntime {
                    state,
                    ..AccountRuntime::default()
                },
            );
        }
        drop(runtime);
        if from != to {
            metrics::counter!("rotation_account_state_transitions_total", "from" => from, "to" => to)
                .increment(1);
        }
    }

    /// Set an account's state directly (used by the refresh scheduler on
    /// terminal failure and by operator enable/disable endpoints).
    pub async fn set_status(&self, name: &str, state: AccountState) {
        self.set_state(name, state).await;
    }

    /// Report an error classification, translating it into the appropriate
    /// state transition.
    pub async fn report_error(
        &self,
        name: &str,
        classification: ErrorClassification,
        reset_at: Option<Instant>,
    ) {
        match classification {
            ErrorClassification::QuotaExceeded => self.mark_rate_limited(name, reset_at).await,
            ErrorClassification::Permanent => {
                self.mark_auth_error(name, "authentication failed".into())
                    .await
            }
            ErrorClassification::Transient => {
                debug!(account = name, "transient error, no pool action");
            }
        }
    }

    /// Record best-effort capacity data reported by the upstream.
    pub async fn update_capacity(&self, name: &str, capacity: Capacity) {
        let mut runtime = self.runtime.write().await;
        if let Some(rt) = runtime.get_mut(name) {
            rt.capacity = Some(capacity);
        }
    }

    /// Add a new account to the pool. Starts Available.
    pub async fn add_account(&self, name: String) {
        let mut ids = self.order.write().await;
        if !ids.contains(&name) {
            ids.push(name.clone());
        }
        drop(ids);
        self.runtime
            .write()
            .await
            .insert(name.clone(), AccountRuntime::default());
        info!(account = name, "account added to pool");
    }

    /// Remove an account from the pool.
    pub async fn remove_account(&self, name: &str) {
        let mut ids = self.order.write().await;
        ids.retain(|n| n != name);
        drop(ids);
        self.runtime.write().await.remove(name);
        info!(account = name, "account removed from pool");
    }

    /// Whether the backing accounts file has changed since the last
    /// load/reload, comparing mtimes. A file that existed before and is now
    /// gone counts as changed too, so a deliberate deletion still surfaces
    /// through `reload_if_changed` rather than being silently ignored.
    pub async fn has_file_changed(&self) -> bool {
        let current = self.credential_store.file_mtime().await;
        let last = *self.last_mtime.read().await;
        current != last
    }

    /// Reload the accounts file if it changed, reconciling the pool's
    /// round-robin order and per-account runtime state against the new
    /// contents.
    ///
    /// Existing accounts keep their runtime state (rate-limit window, auth
    /// error, etc.) untouched, except: an account whose `refresh_token`
    /// changed while it was `AuthError` is reset to `Available`, since a
    /// changed refresh token means the operator re-authenticated it.
    /// Accounts no longer present in the file are dropped from the pool;
    /// new ones are appended as `Available`.
    ///
    /// Returns whether a reload actually happened.
    pub async fn reload_if_changed(&self) -> bool {
        if !self.has_file_changed().await {
            return false;
        }

        let previous_names = self.order.read().await.clone();
        let mut previous_refresh_tokens: HashMap<String, String> = HashMap::new();
        for name in &previous_names {
            if let Some(c) = self.credential_store.get(name).await {
                previous_refresh_tokens.insert(name.clone(), c.refresh_token.expose().clone());
            }
        }

        let accounts: HashMap<String, AccountCredentials> = match self.credential_store.reload().await {
            Ok(accounts) => accounts,
            Err(e) => {
                warn!(error = %e, "failed to reload accounts file, keeping prior state");
                return false;
            }
        };

        {
            let mut ids = self.order.write().await;
            let mut runtime = self.runtime.write().await;

            ids.retain(|name| {
                let keep = accounts.contains_key(name);
                if !keep {
                    runtime.remove(name);
                    info!(account = name, "account removed on reload");
                }
                keep
            });

            for name in accounts.keys() {
                if !ids.contains(name) {
                    ids.push(name.clone());
                    runtime.insert(name.clone(), AccountRuntime::default());
                    info!(account = name, "account added on reload");
                }
            }

            for (name, creds) in &accounts {
                let Some(prev_token) = previous_refresh_tokens.get(name) else {
                    continue;
                };
                if prev_token == creds.refresh_token.expose() {
                    continue;
                }
                if let Some(rt) = runtime.get_mut(name) {
                    if matches!(rt.state, AccountState::AuthError { .. }) {
                        info!(account = name, "refresh token changed on reload, clearing auth error");
                        rt.state = AccountState::Available;
                    }
                }
            }
        }

        *self.last_mtime.write().await = self.credential_store.file_mtime().await;
        info!("accounts file reloaded");
        true
    }

    /// Get the credential store reference (for background refresh).
    pub fn credential_store(&self) -> &std::sync::Arc<CredentialStore> {
        &self.credential_store
    }

    /// Get the HTTP client reference (for background refresh).
    pub fn http_client(&self) -> &reqwest::Client {
        &self.http_client
    }

    /// Snapshot of all account names, in round-robin order.
    pub async fn account_ids(&self) -> Vec<String> {
        self.order.read().await.clone()
    }

    /// Whether an account exists in the pool.
    pub async fn contains(&self, name: &str) -> bool {
        self.order.read().await.iter().any(|n| n == name)
    }

    /// Current state label for one account, if it exists.
    pub async fn state_of(&self, name: &str) -> Option<AccountState> {
        self.runtime.read().await.get(name).map(|rt| rt.state.clone())
    }

    /// Fetch the access token for a specific account without participating
    /// in round-robin selection. Used by manual account-override mode,
    /// which never advances the cursor.
    pub async fn get_account_token(&self, name: &str) -> Option<String> {
        self.credential_store
            .get(name)
            .await
            .map(|c| c.access_token.expose().clone())
    }

    /// Full status snapshot for `/status` and `/status/accounts/{name}`.
    pub async fn get_status(&self) -> PoolStatus {
        self.sweep().await;

        let ids = self.order.read().await;
        let runtime = self.runtime.read().await;
        let now = Instant::now();
        let n = ids.len();

        let mut accounts = Vec::with_capacity(n);
        let mut available = 0usize;
        let mut rate_limited = 0usize;
        let mut auth_error = 0usize;
        let mut disabled = 0usize;

        for name in ids.iter() {
            let rt = runtime.get(name).cloned().unwrap_or_default();
            match &rt.state {
                AccountState::Available | AccountState::Refreshing => available += 1,
                AccountState::RateLimited { .. } => rate_limited += 1,
                AccountState::AuthError { .. } => auth_error += 1,
                AccountState::Disabled => disabled += 1,
            }

            let rate_limited_remaining_secs = match &rt.state {
                AccountState::RateLimited { until } if *until > now => {
                    Some((*until - now).as_secs())
                }
                AccountState::RateLimited { .. } => Some(0),
                _ => None,
            };
            let last_error = match &rt.state {
                AccountState::AuthError { message } => Some(message.clone()),
                _ => None,
            };

            accounts.push(AccountRecord {
                name: name.clone(),
                state: rt.state.label().to_string(),
                rate_limited_remaining_secs,
                last_error,
                last_used: rt.last_used.is_some(),
                capacity: rt.capacity.clone(),
            });
        }

        // Peek the next selectable account without consuming the cursor.
        let start = (self.cursor.load(Ordering::Relaxed) + 1) % n.max(1);
        let mut next_account = None;
        if n > 0 {
            for offset in 0..n {
                let idx = (start + offset) % n;
                let name = &ids[idx];
                if matches!(
                    runtime.get(name).map(|rt| &rt.state),
                    Some(AccountState::Available)
                ) {
                    next_account = Some(name.clone());
                    break;
                }
            }
        }

        PoolStatus {
            total: n,
            available,
            rate_limited,
            auth_error,
            disabled,
            next_account,
            accounts,
        }
    }

    async fn exhausted_message(&self) -> String {
        let status = self.get_status().await;
        serde_json::json!({
            "error": {
                "type": "no_accounts_available",
                "totalAccounts": status.total,
                "rateLimited": status.rate_limited,
                "authErrors": status.auth_error,
            }
        })
        .to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anthropic_auth::{AccountCredentials, CredentialStore};
    use std::sync::Arc;

    async fn test_store(dir: &tempfile::TempDir, accounts: &[(&str, u64)]) -> Arc<CredentialStore> {
        let path = dir.path().join("accounts.json");
        let store = CredentialStore::load(path).await.unwrap();
        for (name, expires_at) in accounts {
            store
                .add(
                    name.to_string(),
                    AccountCredentials {
                        refresh_token: common::Secret::new(format!("rt_{name}")),
                        access_token: common::Secret::new(format!("at_{name}")),
                        expires_at: *expires_at,
                    },
                )
                .await
                .unwrap();
        }
        Arc::new(store)
    }

    fn future_expiry() -> u64 {
        4_102_444_800_000
    }

    fn pool(store: Arc<CredentialStore>, names: &[&str]) -> Pool {
        Pool::new(
            names.iter().map(|s| s.to_string()).collect(),
            Duration::from_secs(7200),
            store,
            reqwest::Client::new(),
        )
    }

    #[tokio::test]
    async fn round_robin_cycles_through_accounts() {
        let dir = tempfile::tempdir().unwrap();
        let store = test_store(&dir, &[("a", future_expiry()), ("b", future_expiry())]).await;
        let p = pool(store, &["a", "b"]);

        let s1 = p.select(&[]).await.unwrap();
        let s2 = p.select(&[]).await.unwrap();
        let s3 = p.select(&[]).await.unwrap();

        assert_eq!(s1.name, "a");
        assert_eq!(s2.name, "b");
        assert_eq!(s3.name, "a");
    }

    #[tokio::test]
    async fn exclude_skips_named_accounts() {
        let dir = tempfile::tempdir().unwrap();
        let store = test_store(
            &dir,
            &[("a", future_expiry()), ("b", future_expiry()), ("c", future_expiry())],
        )
        .await;
        let p = pool(store, &["a", "b", "c"]);

        let selected = p.select(&["a".to_string(), "b".to_string()]).await.unwrap();
        assert_eq!(selected.name, "c");
    }

    #[tokio::test]
    async fn skips_rate_limited_accounts() {
        let dir = tempfile::tempdir().unwrap();
        let store = test_store(
            &dir,
            &[("a", future_expiry()), ("b", future_expiry()), ("c", future_expiry())],
        )
        .await;
        let p = pool(store, &["a", "b", "c"]);

        p.mark_rate_limited("a", None).await;

        let s1 = p.select(&[]).await.unwrap();
        let s2 = p.select(&[]).await.unwrap();
        assert_ne!(s1.name, "a");
        assert_ne!(s2.name, "a");
    }

    #[tokio::test]
    async fn skips_disabled_accounts() {
        let dir = tempfile::tempdir().unwrap();
        let store = test_store(&dir, &[("a", future_expiry()), ("b", future_expiry())]).await;
        let p = pool(store, &["a", "b"]);

        p.set_status("a", AccountState::Disabled).await;

        for _ in 0..5 {
            let s = p.select(&[]).await.unwrap();
            assert_eq!(s.name, "b");
        }
    }

    #[tokio::test]
    async fn skips_refreshing_accounts() {
        let dir = tempfile::tempdir().unwrap();
        let store = test_store(&dir, &[("a", future_expiry()), ("b", future_expiry())]).await;
        let p = pool(store, &["a", "b"]);

        assert!(p.mark_refreshing("a").await);

        for _ in 0..3 {
            let s = p.select(&[]).await.unwrap();
            assert_eq!(s.name, "b");
        }
    }

    #[tokio::test]
    async fn expired_rate_limit_transitions_to_available() {
        let dir = tempfile::tempdir().unwrap();
        let store = test_store(&dir, &[("a", future_expiry())]).await;
        let p = Pool::new(
            vec!["a".into()],
            Duration::from_secs(0),
            store,
            reqwest::Client::new(),
        );

        p.mark_rate_limited("a", None).await;
        tokio::time::sleep(Duration::from_millis(1)).await;

        let s = p.select(&[]).await.unwrap();
        assert_eq!(s.name, "a");
    }

    #[tokio::test]
    async fn all_exhausted_returns_error_with_counts() {
        let dir = tempfile::tempdir().unwrap();
        let store = test_store(&dir, &[("a", future_expiry()), ("b", future_expiry())]).await;
        let p = pool(store, &["a", "b"]);

        p.mark_rate_limited("a", None).await;
        p.mark_auth_error("b", "bad creds".into()).await;

        let err = p.select(&[]).await.unwrap_err();
        let msg = err.to_string();
        let json: serde_json::Value =
            serde_json::from_str(msg.strip_prefix("pool exhausted: ").unwrap_or(&msg)).unwrap();
        assert_eq!(json["error"]["totalAccounts"], 2);
        assert_eq!(json["error"]["rateLimited"], 1);
        assert_eq!(json["error"]["authErrors"], 1);
    }

    #[tokio::test]
    async fn empty_pool_returns_exhausted() {
        let dir = tempfile::tempdir().unwrap();
        let store = test_store(&dir, &[]).await;
        let p = pool(store, &[]);

        let err = p.select(&[]).await.unwrap_err();
        assert!(err.to_string().contains("no_accounts_available"));
    }

    #[tokio::test]
    async fn add_and_remove_account() {
        let dir = tempfile::tempdir().unwrap();
        let store = test_store(&dir, &[("a", future_expiry())]).await;
        let p = pool(store, &["a"]);

        p.add_account("b".into()).await;
        assert_eq!(p.account_ids().await.len(), 2);

        p.remove_account("a").await;
        assert_eq!(p.account_ids().await, vec!["b"]);
    }

    #[tokio::test]
    async fn add_account_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = test_store(&dir, &[("a", future_expiry())]).await;
        let p = pool(store, &["a"]);

        p.add_account("a".into()).await;
        assert_eq!(p.account_ids().await.len(), 1);
    }

    #[tokio::test]
    async fn status_reports_counts_and_next_account() {
        let dir = tempfile::tempdir().unwrap();
        let store = test_store(&dir, &[("a", future_expiry()), ("b", future_expiry())]).await;
        let p = pool(store, &["a", "b"]);

        p.mark_rate_limited("a", None).await;

        let status = p.get_status().await;
        assert_eq!(status.total, 2);
        assert_eq!(status.available, 1);
        assert_eq!(status.rate_limited, 1);
        assert_eq!(status.next_account.as_deref(), Some("b"));
    }

    #[tokio::test]
    async fn status_includes_rate_limited_remaining_secs() {
        let dir = tempfile::tempdir().unwrap();
        let store = test_store(&dir, &[("a", future_expiry())]).await;
        let p = pool(store, &["a"]);

        p.mark_rate_limited("a", None).await;

        let status = p.get_status().await;
        let record = &status.accounts[0];
        assert_eq!(record.state, "rate_limited");
        assert!(record.rate_limited_remaining_secs.unwrap() > 0);
    }

    #[tokio::test]
    async fn select_returns_access_token_from_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = test_store(&dir, &[("acct-1", future_expiry())]).await;
        let p = pool(store, &["acct-1"]);

        let selected = p.select(&[]).await.unwrap();
        assert_eq!(selected.name, "acct-1");
        assert_eq!(selected.access_token, "at_acct-1");
    }

    #[tokio::test]
    async fn select_skips_account_with_expired_token() {
        let dir = tempfile::tempdir().unwrap();
        let store = test_store(&dir, &[("expired", 1), ("fresh", future_expiry())]).await;
        let p = pool(store, &["expired", "fresh"]);

        let selected = p.select(&[]).await.unwrap();
        assert_eq!(selected.name, "fresh");

        // The expired account's runtime state is untouched — it's still
        // Available, just skipped until the refresh scheduler catches it.
        assert_eq!(p.state_of("expired").await, Some(AccountState::Available));
    }

    #[tokio::test]
    async fn select_disables_account_missing_from_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = test_store(&dir, &[("real", future_expiry())]).await;
        let p = pool(store, &["ghost", "real"]);

        let s = p.select(&[]).await.unwrap();
        assert_eq!(s.name, "real");

        let status = p.get_status().await;
        assert_eq!(status.disabled, 1);
    }

    #[tokio::test]
    async fn mark_refresh_complete_success_returns_to_available() {
        let dir = tempfile::tempdir().unwrap();
        let store = test_store(&dir, &[("a", future_expiry())]).await;
        let p = pool(store, &["a"]);

        p.mark_refreshing("a").await;
        p.mark_refresh_complete("a", Ok(())).await;

        assert_eq!(p.state_of("a").await, Some(AccountState::Available));
    }

    #[tokio::test]
    async fn mark_refresh_abandoned_restores_prior_rate_limited_state() {
        let dir = tempfile::tempdir().unwrap();
        let store = test_store(&dir, &[("a", future_expiry())]).await;
        let p = pool(store, &["a"]);

        p.mark_rate_limited("a", None).await;
        assert!(p.mark_refreshing("a").await);
        p.mark_refresh_abandoned("a").await;

        assert!(matches!(
            p.state_of("a").await,
            Some(AccountState::RateLimited { .. })
        ));
    }

    #[tokio::test]
    async fn mark_refresh_abandoned_defaults_to_available_without_prior_state() {
        let dir = tempfile::tempdir().unwrap();
        let store = test_store(&dir, &[("a", future_expiry())]).await;
        let p = pool(store, &["a"]);

        p.mark_refresh_abandoned("a").await;

        assert_eq!(p.state_of("a").await, Some(AccountState::Available));
    }

    #[test]
    fn validate_account_name_accepts_valid() {
        assert!(validate_account_name("ok_name-1").is_ok());
    }

    #[test]
    fn validate_account_name_rejects_uppercase() {
        assert!(validate_account_name("A").is_err());
    }

    #[test]
    fn validate_account_name_rejects_too_long() {
        let name = "a".repeat(33);
        assert!(validate_account_name(&name).is_err());
    }

    #[tokio::test]
    async fn reload_if_changed_is_noop_when_file_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let store = test_store(&dir, &[("a", future_expiry())]).await;
        let p = pool(store, &["a"]);

        p.init_reload_baseline().await;
        assert!(!p.reload_if_changed().await);
    }

    #[tokio::test]
    async fn reload_if_changed_picks_up_new_account() {
        let dir = tempfile::tempdir().unwrap();
        let store = test_store(&dir, &[("a", future_expiry())]).await;
        let p = pool(store.clone(), &["a"]);
        p.init_reload_baseline().await;

        tokio::time::sleep(Duration::from_millis(10)).await;
        store
            .add(
                "b".to_string(),
                AccountCredentials {
                    refresh_token: common::Secret::new("rt_b".to_string()),
                    access_token: common::Secret::new("at_b".to_string()),
                    expires_at: future_expiry(),
                },
            )
            .await
            .unwrap();

        assert!(p.reload_if_changed().await);
        assert_eq!(p.account_ids().await.len(), 2);
        assert_eq!(p.state_of("b").await, Some(AccountState::Available));
    }

    #[tokio::test]
    async fn reload_if_changed_drops_removed_account() {
        let dir = tempfile::tempdir().unwrap();
        let store = test_store(&dir, &[("a", future_expiry()), ("b", future_expiry())]).await;
        let p = pool(store.clone(), &["a", "b"]);
        p.init_reload_baseline().await;

        tokio::time::sleep(Duration::from_millis(10)).await;
        store.remove("b").await.unwrap();

        assert!(p.reload_if_changed().await);
        assert_eq!(p.account_ids().await, vec!["a"]);
    }

    #[tokio::test]
    async fn reload_if_changed_clears_auth_error_on_refresh_token_rotation() {
        let dir = tempfile::tempdir().unwrap();
        let store = test_store(&dir, &[("a", future_expiry())]).await;
        let p = pool(store.clone(), &["a"]);
        p.init_reload_baseline().await;
        p.mark_auth_error("a", "bad creds".into()).await;

        tokio::time::sleep(Duration::from_millis(10)).await;
        store
            .update_token("a", "at_new".into(), "rt_new".into(), future_expiry())
            .await
            .unwrap();

        assert!(p.reload_if_changed().await);
        assert_eq!(p.state_of("a").await, Some(AccountState::Available));
    }

    #[tokio::test]
    async fn mark_refresh_complete_failure_sets_auth_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = test_store(&dir, &[("a", future_expiry())]).await;
        let p = pool(store, &["a"]);

        p.mark_refreshing("a").await;
        p.mark_refresh_complete("a", Err("refresh token expired".into()))
            .await;

        match p.state_of("a").await {
            Some(AccountState::AuthError { message }) => {
                assert_eq!(message, "refresh token expired");
            }
            other => panic!("expected AuthError, got {other:?}"),
        }
    }
}
