//! Configuration types and loading

use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

/// Root configuration, loaded once at startup from TOML.
#[derive(Debug, Deserialize)]
pub struct Config {
    pub pool: PoolConfig,
    #[serde(default)]
    pub refresh: RefreshConfig,
    #[serde(default)]
    pub oauth: OAuthConfig,
    pub server: ServerConfig,
}

/// Rotation pool + middleware tuning.
#[derive(Debug, Deserialize)]
pub struct PoolConfig {
    #[serde(default = "default_accounts_path")]
    pub accounts_path: PathBuf,
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

/// Background refresh scheduler tuning.
#[derive(Debug, Deserialize)]
pub struct RefreshConfig {
    #[serde(default = "default_check_interval_secs")]
    pub check_interval_secs: u64,
    #[serde(default = "default_buffer_secs")]
    pub buffer_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_initial_backoff_secs")]
    pub initial_backoff_secs: u64,
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            check_interval_secs: default_check_interval_secs(),
            buffer_secs: default_buffer_secs(),
            max_retries: default_max_retries(),
            initial_backoff_secs: default_initial_backoff_secs(),
        }
    }
}

/// OAuth PKCE enrollment tuning.
#[derive(Debug, Deserialize)]
pub struct OAuthConfig {
    #[serde(default = "default_redirect_uri")]
    pub redirect_uri: String,
    #[serde(default = "default_flow_ttl_secs")]
    pub flow_ttl_secs: u64,
}

impl Default for OAuthConfig {
    fn default() -> Self {
        Self {
            redirect_uri: default_redirect_uri(),
            flow_ttl_secs: default_flow_ttl_secs(),
        }
    }
}

/// HTTP server settings.
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    pub upstream_url: String,
    #[serde(default)]
    pub rotation_paths: Vec<String>,
    #[serde(default = "default_true")]
    pub hot_reload_enabled: bool,
    #[serde(default = "default_true")]
    pub rotation_enabled: bool,
}

fn default_cooldown_secs() -> u64 {
    3600
}
fn default_max_retries() -> u32 {
    3
}
fn default_check_interval_secs() -> u64 {
    60
}
fn default_buffer_secs() -> u64 {
    600
}
fn default_initial_backoff_secs() -> u64 {
    5
}
fn default_flow_ttl_secs() -> u64 {
    600
}
fn default_redirect_uri() -> String {
    anthropic_auth::REDIRECT_URI.to_string()
}
fn default_true() -> bool {
    true
}
fn default_accounts_path() -> PathBuf {
    expand_home("~/.claude/accounts.json")
}

/// Expand a leading `~` against `$HOME`. Falls back to the literal path
/// (unexpanded) if `HOME` isn't set — the caller will find out soon enough
/// when the file operations against it fail.
fn expand_home(path: &str) -> PathBuf {
    match path.strip_prefix("~/") {
        Some(rest) => match std::env::var("HOME") {
            Ok(home) => PathBuf::from(home).join(rest),
            Err(_) => PathBuf::from(path),
        },
        None => PathBuf::from(path),
    }
}

/// Validate and resolve an `CCPROXY_ACCOUNTS_PATH` override: must be absolute
/// or `~`-prefixed, and its parent directory must already exist.
fn validate_accounts_path_override(path: &str) -> Result<PathBuf, &'static str> {
    if !(path.starts_with('/') || path.starts_with('~')) {
        return Err("must be absolute or ~-prefixed");
    }
    let resolved = expand_home(path);
    match resolved.parent() {
        Some(parent) if parent.as_os_str().is_empty() || parent.is_dir() => Ok(resolved),
        _ => Err("parent directory does not exist"),
    }
}

impl Config {
    /// Load configuration from a TOML file, then apply the environment
    /// variable overrides documented for the service.
    pub fn load(path: &Path) -> crate::error::Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| crate::error::Error::Config(format!("{}: {e}", path.display())))?;
        let mut config: Config = toml::from_str(&text)
            .map_err(|e| crate::error::Error::Config(format!("{}: {e}", path.display())))?;
        config.apply_env_overrides();
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(path) = std::env::var("CCPROXY_ACCOUNTS_PATH") {
            match validate_accounts_path_override(&path) {
                Ok(resolved) => self.pool.accounts_path = resolved,
                Err(reason) => {
                    tracing::warn!(path, reason, "ignoring invalid CCPROXY_ACCOUNTS_PATH");
                }
            }
        }
        if let Ok(v) = std::env::var("CCPROXY_ROTATION_ENABLED") {
            self.server.rotation_enabled = v != "false";
        }
        if let Ok(v) = std::env::var("CCPROXY_HOT_RELOAD") {
            self.server.hot_reload_enabled = v != "false";
        }
        if let Ok(uri) = std::env::var("CCPROXY_OAUTH_REDIRECT_URI") {
            self.oauth.redirect_uri = uri;
        }
    }

    /// Resolve the config file path: `--config` flag, then `CCPROXY_CONFIG`,
    /// then `./config.toml`.
    pub fn resolve_path(cli_arg: Option<&str>) -> PathBuf {
        if let Some(path) = cli_arg {
            return PathBuf::from(path);
        }
        if let Ok(path) = std::env::var("CCPROXY_CONFIG") {
            return PathBuf::from(path);
        }
        PathBuf::from("./config.toml")
    }
}
