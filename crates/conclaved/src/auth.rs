//! Request authentication.
//!
//! Join intents prove knowledge of the session passphrase by signing the
//! request body:
//!
//! ```text
//! Authorization: Conclave-1.0 <hex(HMAC-SHA256(SHA-256(passphrase), body))>
//! ```
//!
//! Every other peer request is authorised by the TLS client certificate,
//! which must be in the session's temporary trust store.

use axum::http::HeaderMap;
use axum::http::header::AUTHORIZATION;
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use thiserror::Error;

use conclave_common::ConclaveError;
use conclave_common::constants::HMAC_VERSION;

use crate::context::Cause;
use crate::handler::Handler;
use crate::session::{Session, SessionError};
use crate::tls::PeerCertificate;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("Missing HMAC")]
    Missing,

    #[error("Unsupported HMAC version {0:?}")]
    Version(String),

    #[error("Invalid HMAC")]
    Invalid,
}

fn mac(passphrase: &str) -> HmacSha256 {
    let key = Sha256::digest(passphrase.as_bytes());
    // HMAC accepts keys of any length
    HmacSha256::new_from_slice(&key).unwrap_or_else(|_| unreachable!())
}

/// `Authorization` header value for `body`
pub fn sign(passphrase: &str, body: &[u8]) -> String {
    let mut mac = mac(passphrase);
    mac.update(body);
    format!("{HMAC_VERSION} {}", hex::encode(mac.finalize().into_bytes()))
}

/// Check an `Authorization` header value against `body`
pub fn verify(passphrase: &str, header: &str, body: &[u8]) -> Result<(), AuthError> {
    let (version, signature) = header.split_once(' ').ok_or(AuthError::Invalid)?;
    if version != HMAC_VERSION {
        return Err(AuthError::Version(version.to_string()));
    }

    let signature = hex::decode(signature.trim()).map_err(|_| AuthError::Invalid)?;
    let mut mac = mac(passphrase);
    mac.update(body);
    mac.verify_slice(&signature).map_err(|_| AuthError::Invalid)
}

/// Verify a request against the active session. Every failure counts
/// towards the session's failed-attempt ceiling; reaching it stops the
/// session.
pub async fn authenticate(
    handler: &Handler,
    headers: &HeaderMap,
    body: &[u8],
) -> Result<Arc<Session>, ConclaveError> {
    let session = handler.session().await?;
    let passphrase = session.passphrase().await;

    let result = headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .ok_or(AuthError::Missing)
        .and_then(|header| verify(&passphrase, header, body));

    if let Err(e) = result {
        tracing::warn!(error = %e, "Rejected session request");

        if let Err(SessionError::TooManyFailedAttempts) = session.register_failed_attempt().await {
            let cause = Cause::new("Stopping session after too many failed attempts");
            tracing::error!("{cause}");
            let _ = handler.stop_session(Some(cause)).await;
        }

        return Err(ConclaveError::Trust(e.to_string()));
    }

    Ok(session)
}

/// Require the caller's TLS certificate to be in the active session's
/// trust store. Returns the session and the name the certificate was
/// approved for.
pub async fn authorize_peer(
    handler: &Handler,
    peer: &PeerCertificate,
) -> Result<(Arc<Session>, String), ConclaveError> {
    let session = handler.session().await?;

    let name = session
        .temporary_trust_store()
        .await
        .into_iter()
        .find(|(_, cert)| cert.fingerprint() == peer.fingerprint())
        .map(|(name, _)| name)
        .ok_or_else(|| {
            ConclaveError::Trust(format!(
                "Certificate {} is not trusted",
                peer.0.short_fingerprint()
            ))
        })?;

    Ok((session, name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_err, assert_ok};

    #[test]
    fn test_sign_and_verify() {
        let body = br#"{"name":"node2"}"#;
        let header = sign("acorn adobe agent alarm", body);

        assert!(header.starts_with("Conclave-1.0 "));
        assert_ok!(verify("acorn adobe agent alarm", &header, body));
        assert_eq!(verify("acorn adobe agent amber", &header, body), Err(AuthError::Invalid));
        assert_eq!(
            verify("acorn adobe agent alarm", &header, br#"{"name":"node3"}"#),
            Err(AuthError::Invalid)
        );
    }

    #[test]
    fn test_rejects_other_schemes() {
        let header = sign("a b c d", b"").replace("Conclave-1.0", "Bearer");
        assert_eq!(verify("a b c d", &header, b""), Err(AuthError::Version("Bearer".into())));
        assert_err!(verify("a b c d", "garbage", b""));
        assert_eq!(verify("a b c d", "Conclave-1.0 zz", b""), Err(AuthError::Invalid));
    }
}
