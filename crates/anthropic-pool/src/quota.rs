//! Quota detection for Anthropic API responses
//!
//! Distinguishes between transient rate limits (429 with generic message) and
//! subscription quota exhaustion (429 with 5-hour rolling window message).
//! Only quota exhaustion triggers account cooldown and failover.

/// Classification of upstream errors, driving account state transitions in
/// the pool:
/// - QuotaExceeded triggers rate-limiting and failover to the next account
/// - Permanent transitions the account to an auth-error state
/// - Transient is retried on the same account (no pool action)
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorClassification {
    /// Retryable on the same account (timeouts, 5xx)
    Transient,
    /// 5-hour quota exhausted, failover to next account
    QuotaExceeded,
    /// Invalid credentials (401/403), account needs re-authentication
    Permanent,
}

/// Quota exhaustion message patterns in Anthropic 429 responses.
///
/// These indicate the account has hit the 5-hour rolling subscription limit,
/// not a transient per-minute rate limit.
const QUOTA_PATTERNS: &[&str] = &[
    "5-hour",
    "5 hour",
    "rolling window",
    "usage limit for your plan",
    "subscription usage limit",
];

/// Classify a 429 response body as quota exhaustion or transient rate limit.
///
/// Checks the response body for known quota exhaustion phrases. If any match,
/// returns `QuotaExceeded` (account should enter cooldown). Otherwise returns
/// `Transient` (normal rate limit, retry on same account).
pub fn classify_429(body: &str) -> ErrorClassification {
    let lower = body.to_lowercase();
    for pattern in QUOTA_PATTERNS {
        if lower.contains(pattern) {
            return ErrorClassification::QuotaExceeded;
        }
    }
    ErrorClassification::Transient
}

/// Classify an upstream error by HTTP status and response body.
///
/// Dispatches to `classify_429` for 429 responses. Other statuses use fixed
/// classification: 401/403 are Permanent (invalid credentials), 408/5xx are
/// Transient (retryable), everything else is Transient.
pub fn classify_status(status: u16, body: &str) -> ErrorClassification {
    match status {
        429 => classify_429(body),
        401 | 403 => ErrorClassification::Permanent,
        408 | 500 | 502 | 503 | 504 => ErrorClassification::Transient,
        _ => ErrorClassification::Transient,
    }
}
