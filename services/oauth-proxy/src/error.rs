//! Service-specific error types

use thiserror::Error;

/// OAuth Proxy errors
#[derive(Error, Debug)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("failed to bind listener: {0}")]
    ListenerBind(String),

    #[error("upstream timeout after {0}s")]
    UpstreamTimeout(u64),

    #[error("upstream error: {0}")]
    UpstreamError(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

/// Result alias
pub type Result<T> = std::result::Result<T, Error>;
