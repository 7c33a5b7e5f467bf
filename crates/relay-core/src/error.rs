//! Shared error taxonomy (§7). Crates below this one mostly propagate
//! `anyhow::Result` at call sites; `RelayError` is the one place in the
//! stack that needs to branch on *kind* — the Sync Manager's failure
//! classification at the `(user, provider)` boundary.

use relay_providers::AdapterError;

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("authentication failed: {0}")]
    AuthFailed(String),
    #[error("transient upstream error: {0}")]
    TransientUpstream(String),
    #[error("permanent upstream error: {0}")]
    PermanentUpstream(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("rate limited: {0}")]
    RateLimited(String),
    #[error("parse error: {0}")]
    ParseError(String),
    #[error("storage error: {0}")]
    StorageError(String),
    #[error("classification unavailable: {0}")]
    ClassificationUnavailable(String),
    #[error("cancelled")]
    Cancelled,
}

impl From<sqlx::Error> for RelayError {
    fn from(e: sqlx::Error) -> Self {
        RelayError::StorageError(e.to_string())
    }
}

impl From<reqwest::Error> for RelayError {
    fn from(e: reqwest::Error) -> Self {
        RelayError::TransientUpstream(e.to_string())
    }
}

impl From<std::io::Error> for RelayError {
    fn from(e: std::io::Error) -> Self {
        RelayError::StorageError(e.to_string())
    }
}

impl From<AdapterError> for RelayError {
    fn from(e: AdapterError) -> Self {
        match e {
            AdapterError::AuthFailed(m) => RelayError::AuthFailed(m),
            AdapterError::TransientUpstream(m) => RelayError::TransientUpstream(m),
            AdapterError::PermanentUpstream(m) => RelayError::PermanentUpstream(m),
            AdapterError::NotFound(m) => RelayError::NotFound(m),
            AdapterError::InvalidArgument(m) => RelayError::InvalidArgument(m),
            AdapterError::RateLimited(m) => RelayError::RateLimited(m),
        }
    }
}

impl RelayError {
    /// Whether the Sync Manager should classify this `(user, provider)` run
    /// as `failed` vs. treating it as a soft, per-item skip. Every variant
    /// reaching this boundary is already non-retryable *within this cycle*
    /// (adapter-level retries are exhausted by [`relay_providers::RetryPolicy`]
    /// before their error ever surfaces here).
    pub fn kind(&self) -> &'static str {
        match self {
            RelayError::AuthFailed(_) => "auth_failed",
            RelayError::TransientUpstream(_) => "transient_upstream",
            RelayError::PermanentUpstream(_) => "permanent_upstream",
            RelayError::NotFound(_) => "not_found",
            RelayError::InvalidArgument(_) => "invalid_argument",
            RelayError::RateLimited(_) => "rate_limited",
            RelayError::ParseError(_) => "parse_error",
            RelayError::StorageError(_) => "storage_error",
            RelayError::ClassificationUnavailable(_) => "classification_unavailable",
            RelayError::Cancelled => "cancelled",
        }
    }
}
