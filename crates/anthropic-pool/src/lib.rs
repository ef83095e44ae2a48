//! Rotation pool for Anthropic OAuth accounts
//!
//! Manages multiple OAuth accounts with round-robin selection, quota
//! detection, a five-state account lifecycle, and proactive token refresh.
//! The pool reads credentials from `CredentialStore` (single source of
//! truth) and maintains per-account runtime status independently.
//!
//! Account lifecycle:
//! 1. Operator enrolls an account → credential stored, state `Available`
//! 2. Pool selects an account round-robin, skipping anything not `Available`
//! 3. Upstream returns 429 → `RateLimited` until the parsed reset time
//! 4. Upstream returns 401/403 → `AuthError`, excluded until re-enrolled
//! 5. Rate limit window elapses → automatic transition back to `Available`
//! 6. Background task refreshes tokens proactively, transitioning through
//!    `Refreshing` for the duration of the attempt

pub mod error;
pub mod pool;
pub mod quota;
pub mod ratelimit;
pub mod refresh;
pub mod watcher;

pub use error::{Error, Result};
pub use pool::{
    AccountRecord, AccountState, Capacity, Pool, PoolStatus, SelectedAccount, validate_account_name,
};
pub use quota::{ErrorClassification, classify_429, classify_status};
pub use ratelimit::{message_looks_rate_limited, reset_at_from_headers};
pub use refresh::{refresh_account_now, spawn_refresh_task};
pub use watcher::spawn_hot_reload_task;
