//! Application error model
//!
//! Defines a typed error hierarchy using `thiserror`. Checker failures are
//! recorded per account and never abort a polling cycle; store failures are
//! returned to whoever called the store.

use thiserror::Error;

/// Application error type
///
/// Covers every failure the polling engine can observe. Per-account variants
/// (`Auth*`, `Connection`, `ProtocolParse`, `Timeout`) end up in a
/// [`CheckResult`](crate::models::CheckResult); store variants (`StateCorrupt`,
/// `PersistenceIo`) propagate to the caller of the store.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AppError {
    /// Invalid user input or account configuration (bad port, empty name)
    #[error("invalid input: {0}")]
    InvalidInput(String),
    /// Named account does not exist in the store
    #[error("not found: {0}")]
    NotFound(String),
    /// The user declined to supply a secret, or supplied an empty one
    #[error("authentication cancelled: {0}")]
    AuthCancelled(String),
    /// Server rejected the credentials
    #[error("authentication failed: {0}")]
    AuthFailed(String),
    /// TCP, TLS or mid-session transport failure
    #[error("connection error: {0}")]
    Connection(String),
    /// Server response could not be interpreted (e.g. no UNSEEN count)
    #[error("protocol parse error: {0}")]
    ProtocolParse(String),
    /// Operation timeout (TCP connect, TLS handshake, server response)
    #[error("operation timed out: {0}")]
    Timeout(String),
    /// Persisted account list exists but cannot be parsed
    #[error("persisted state corrupt: {0}")]
    StateCorrupt(String),
    /// Persisted account list could not be read or written
    #[error("persistence I/O error: {0}")]
    PersistenceIo(String),
    /// Internal error (unexpected failure, checker panic)
    #[error("internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// Convenience constructor for `InvalidInput`
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }

    /// Stable snake_case code for structured log fields
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidInput(_) => "invalid_input",
            Self::NotFound(_) => "not_found",
            Self::AuthCancelled(_) => "auth_cancelled",
            Self::AuthFailed(_) => "auth_failed",
            Self::Connection(_) => "connection",
            Self::ProtocolParse(_) => "protocol_parse",
            Self::Timeout(_) => "timeout",
            Self::StateCorrupt(_) => "state_corrupt",
            Self::PersistenceIo(_) => "persistence_io",
            Self::Internal(_) => "internal",
        }
    }

    /// Whether another credential round may succeed where this one failed
    ///
    /// Bad credentials and network-level failures are retried within the
    /// attempt budget. Cancellation, malformed responses and configuration
    /// problems are terminal for the current check.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::AuthFailed(_) | Self::Connection(_) | Self::Timeout(_)
        )
    }
}

/// Type alias for fallible return values
///
/// Use this for all internal functions that can fail. Provides a consistent
/// error type throughout the codebase.
pub type AppResult<T> = Result<T, AppError>;
