//! Common error types for Conclave components.

use thiserror::Error;

/// Common errors across Conclave components
#[derive(Debug, Error)]
pub enum ConclaveError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Malformed frame, unexpected payload shape, version mismatch
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Duplicate intent, failed-attempt ceiling, bad HMAC, untrusted caller
    #[error("Trust error: {0}")]
    Trust(String),

    /// No session is running
    #[error("No active session")]
    NoActiveSession,

    /// A session is already running
    #[error("There already is an active session")]
    SessionActive,

    /// Peer unreachable, multicast timeout
    #[error("Network error: {0}")]
    Network(String),

    /// Membership did not converge in time
    #[error("Convergence timeout: {0}")]
    Convergence(String),

    /// Peers disagree about an existing cluster
    #[error("Conflicting cluster state: {0}")]
    Conflict(String),

    /// Invalid input/request
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Internal server error
    #[error("Internal error: {0}")]
    Internal(String),

    /// Timeout
    #[error("Operation timed out: {0}")]
    Timeout(String),
}

impl ConclaveError {
    /// Returns the HTTP status code for this error
    pub fn status_code(&self) -> u16 {
        match self {
            Self::Config(_) => 500,
            Self::Protocol(_) => 400,
            Self::Trust(_) => 401,
            Self::NoActiveSession => 404,
            Self::SessionActive => 409,
            Self::Network(_) => 503,
            Self::Convergence(_) => 504,
            Self::Conflict(_) => 409,
            Self::InvalidInput(_) => 400,
            Self::Internal(_) => 500,
            Self::Timeout(_) => 504,
        }
    }

    /// Returns true if the outermost caller may retry this error
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Network(_) | Self::Timeout(_))
    }
}
