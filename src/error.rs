//! The error taxonomy every component reports through.

use thiserror::Error;

/// Five-member error taxonomy. Call sites match on variant, not on string content.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("validation: {0}")]
    Validation(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("upstream transient: {0}")]
    UpstreamTransient(String),

    #[error("upstream permanent: {0}")]
    UpstreamPermanent(String),

    #[error("internal: {0}")]
    Internal(String),
}

impl GatewayError {
    pub fn validation(msg: impl Into<String>) -> Self {
        GatewayError::Validation(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        GatewayError::Conflict(msg.into())
    }

    pub fn upstream_transient(msg: impl Into<String>) -> Self {
        GatewayError::UpstreamTransient(msg.into())
    }

    pub fn upstream_permanent(msg: impl Into<String>) -> Self {
        GatewayError::UpstreamPermanent(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        GatewayError::Internal(msg.into())
    }

    /// True for errors the webhook dispatcher and chain watcher should retry.
    pub fn is_retryable(&self) -> bool {
        matches!(self, GatewayError::UpstreamTransient(_))
    }
}

impl From<sled::Error> for GatewayError {
    fn from(e: sled::Error) -> Self {
        GatewayError::Internal(format!("store: {e}"))
    }
}

impl From<sled::transaction::TransactionError<GatewayError>> for GatewayError {
    fn from(e: sled::transaction::TransactionError<GatewayError>) -> Self {
        match e {
            sled::transaction::TransactionError::Abort(inner) => inner,
            sled::transaction::TransactionError::Storage(e) => GatewayError::Internal(format!("store transaction: {e}")),
        }
    }
}

impl From<reqwest::Error> for GatewayError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() || e.is_connect() {
            GatewayError::UpstreamTransient(e.to_string())
        } else {
            GatewayError::UpstreamPermanent(e.to_string())
        }
    }
}
