//! Passphrase trust sessions.
//!
//! A session holds the state of one establishment attempt: the shared
//! passphrase, the provisional trust store, the fingerprints that already
//! asked to join, and a failed-attempt counter bounding passphrase
//! guessing.

use thiserror::Error;

use conclave_common::ConclaveError;

pub mod passphrase;
mod trust;

pub use passphrase::{PassphraseError, format_passphrase, generate_passphrase};
pub use trust::Session;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Passphrase(#[from] PassphraseError),

    #[error("Fingerprint already exists")]
    DuplicateIntent,

    #[error("Exceeded the number of failed session join attempts")]
    TooManyFailedAttempts,

    #[error("Session stopped")]
    Stopped,

    #[error("Timeout waiting for an active consumer of the join intent")]
    NoConsumer,
}

impl From<SessionError> for ConclaveError {
    fn from(err: SessionError) -> Self {
        match err {
            SessionError::Passphrase(e) => ConclaveError::InvalidInput(e.to_string()),
            SessionError::Stopped => ConclaveError::NoActiveSession,
            SessionError::NoConsumer => ConclaveError::Timeout(err.to_string()),
            other => ConclaveError::Trust(other.to_string()),
        }
    }
}
