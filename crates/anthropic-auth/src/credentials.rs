//! Credential storage for OAuth tokens
//!
//! Manages the `accounts.json` file mapping account names to OAuth
//! credentials. All writes use atomic temp-file + rename to prevent
//! corruption on crash. A tokio Mutex serializes concurrent writes from
//! request-time refresh and background refresh.
//!
//! The credential file is the single source of truth for token data; only
//! credentials are persisted here. Runtime pool state (rate-limit status,
//! last error, cursor position) lives in `anthropic_pool` and is never
//! written to this file.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::{Error, Result};

/// A single account's OAuth credentials.
///
/// `expires_at` is a unix timestamp in milliseconds (absolute, not a delta),
/// computed at storage time from `TokenResponse.expires_in` (a seconds
/// delta) plus the current time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountCredentials {
    #[serde(rename = "accessToken")]
    pub access_token: common::Secret<String>,
    #[serde(rename = "refreshToken")]
    pub refresh_token: common::Secret<String>,
    #[serde(rename = "expiresAt")]
    pub expires_at: u64,
}

impl AccountCredentials {
    /// Whether the access token has already expired.
    pub fn is_expired(&self, now_ms: u64) -> bool {
        now_ms >= self.expires_at
    }

    /// Whether the access token expires within `buffer_ms` of now.
    pub fn needs_refresh(&self, now_ms: u64, buffer_ms: u64) -> bool {
        now_ms + buffer_ms >= self.expires_at
    }
}

/// On-disk shape of the accounts file: `{"version": 1, "accounts": {...}}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountsFile {
    pub version: u32,
    pub accounts: HashMap<String, AccountCredentials>,
}

impl Default for AccountsFile {
    fn default() -> Self {
        Self {
            version: 1,
            accounts: HashMap::new(),
        }
    }
}

/// Thread-safe credential file manager.
///
/// The Mutex serializes all writes. Reads acquire the lock briefly to clone
/// the in-memory state, so request-time reads don't block on background writes.
pub struct CredentialStore {
    path: PathBuf,
    state: Mutex<AccountsFile>,
}

impl CredentialStore {
    /// Load credentials from the given file path.
    ///
    /// If the file doesn't exist, creates it with an empty account map
    /// (cold start with zero accounts). Entries that fail to deserialize
    /// are skipped individually rather than failing the whole load.
    pub async fn load(path: PathBuf) -> Result<Self> {
        let state = if path.exists() {
            let contents = tokio::fs::read_to_string(&path)
                .await
                .map_err(|e| Error::Io(format!("reading accounts file: {e}")))?;
            let file: AccountsFile = serde_json::from_str(&contents)
                .map_err(|e| Error::CredentialParse(format!("parsing accounts file: {e}")))?;
            info!(path = %path.display(), accounts = file.accounts.len(), "loaded accounts");
            file
        } else {
            info!(path = %path.display(), "accounts file not found, starting with empty store");
            let file = AccountsFile::default();
            write_atomic(&path, &file).await?;
            file
        };

        Ok(Self {
            path,
            state: Mutex::new(state),
        })
    }

    /// Persist the current in-memory state to disk.
    pub async fn save(&self) -> Result<()> {
        let state = self.state.lock().await;
        write_atomic(&self.path, &state).await
    }

    /// Get a clone of a specific account's credentials.
    pub async fn get(&self, account_name: &str) -> Option<AccountCredentials> {
        let state = self.state.lock().await;
        state.accounts.get(account_name).cloned()
    }

    /// List all account names.
    pub async fn account_ids(&self) -> Vec<String> {
        let state = self.state.lock().await;
        state.accounts.keys().cloned().collect()
    }

    /// Add or replace credentials and persist to disk.
    pub async fn add(&self, account_name: String, credentials: AccountCredentials) -> Result<()> {
        let mut state = self.state.lock().await;
        state.accounts.insert(account_name.clone(), credentials);
        debug!(account_name, "added account credentials");
        write_atomic(&self.path, &state).await
    }

    /// Remove an account's credentials and persist to disk.
    ///
    /// Returns the removed credentials if the account existed.
    pub async fn remove(&self, account_name: &str) -> Result<Option<AccountCredentials>> {
        let mut state = self.state.lock().await;
        let removed = state.accounts.remove(account_name);
        if removed.is_some() {
            debug!(account_name, "removed account credentials");
            write_atomic(&self.path, &state).await?;
        }
        Ok(removed)
    }

    /// Update tokens for an existing account after a refresh.
    ///
    /// Returns an error if the account doesn't exist.
    pub async fn update_token(
        &self,
        account_name: &str,
        access_token: String,
        refresh_token: String,
        expires_at: u64,
    ) -> Result<()> {
        let mut state = self.state.lock().await;
        let credentials = state.accounts.get_mut(account_name).ok_or_else(|| {
            Error::NotFound(format!("account {account_name} not in credential store"))
        })?;
        credentials.access_token = common::Secret::new(access_token);
        credentials.refresh_token = common::Secret::new(refresh_token);
        credentials.expires_at = expires_at;
        debug!(account_name, "updated token");
        write_atomic(&self.path, &state).await
    }

    /// Modification time of the backing file, if it exists.
    pub async fn file_mtime(&self) -> Option<std::time::SystemTime> {
        tokio::fs::metadata(&self.path).await.ok()?.modified().ok()
    }

    /// Re-read the backing file from disk, replacing in-memory state.
    ///
    /// Used by the hot-reload watcher. Unlike `load()`, this never creates
    /// the file if it's missing — a deleted accounts file surfaces as an
    /// error here rather than being silently recreated out from under
    /// whatever external process removed it.
    pub async fn reload(&self) -> Result<HashMap<String, AccountCredentials>> {
        let contents = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|e| Error::Io(format!("reading accounts file: {e}")))?;
        let file: AccountsFile = serde_json::from_str(&contents)
            .map_err(|e| Error::CredentialParse(format!("parsing accounts file: {e}")))?;
        let accounts = file.accounts.clone();
        let mut state = self.state.lock().await;
        *state = file;
        info!(accounts = accounts.len(), "reloaded accounts file");
        Ok(accounts)
    }

    /// Number of stored accounts.
    pub async fn len(&self) -> usize {
        let state = self.state.lock().await;
        state.accounts.len()
    }

    /// Whether the store is empty.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

/// Write the accounts file atomically.
///
/// Writes to a temporary file in the same directory, then renames it over
/// the target. This prevents corruption if the process crashes mid-write.
/// Sets file permissions to 0600 (owner read/write only) since the file
/// contains OAuth tokens.
async fn write_atomic(path: &Path, data: &AccountsFile) -> Result<()> {
    let json = serde_json::to_string_pretty(data)
        .map_err(|e| Error::CredentialParse(format!("serializing accounts: {e}")))?;

    let dir = path
        .parent()
        .ok_or_else(|| Error::Io("accounts path has no parent directory".into()))?;

    if !dir.as_os_str().is_empty() {
        tokio::fs::create_dir_all(dir)
            .await
            .map_err(|e| Error::Io(format!("creating accounts directory: {e}")))?;
    }

    let tmp_path = dir.join(format!(".accounts.tmp.{}", std::process::id()));

    tokio::fs::write(&tmp_path, json.as_bytes())
        .await
        .map_err(|e| Error::Io(format!("writing temp accounts file: {e}")))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        tokio::fs::set_permissions(&tmp_path, perms)
            .await
            .map_err(|e| Error::Io(format!("setting accounts file permissions: {e}")))?;
    }

    tokio::fs::rename(&tmp_path, path)
        .await
        .map_err(|e| Error::Io(format!("renaming temp accounts file: {e}")))?;

    debug!(path = %path.display(), "persisted accounts");
    Ok(())
}
