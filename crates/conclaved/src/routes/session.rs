//! Session endpoints.

use std::time::Duration;

use axum::{Json, body::Bytes, extract::State, http::HeaderMap, http::StatusCode};

use conclave_common::constants::{PROTOCOL_VERSION, timeouts};
use conclave_common::{ConclaveError, JoinIntent, SessionRole, SessionStatus, SessionStopPut};

use super::ApiError;
use crate::auth;
use crate::certs::Certificate;
use crate::context::Cause;
use crate::state::AppState;
use crate::tls::PeerCertificate;

/// Whether a session is running, and in which role
pub async fn get_session(State(state): State<AppState>) -> Json<SessionStatus> {
    match state.handler.session().await {
        Ok(session) => Json(SessionStatus {
            active: true,
            role: Some(session.role()),
            expires_at: session.expires_at().await,
        }),
        Err(_) => Json(SessionStatus {
            active: false,
            role: None,
            expires_at: None,
        }),
    }
}

/// Accept a join intent signed with the session passphrase and hand it to
/// the session. The intent's certificate must be the one the caller
/// presented on the TLS connection. Answers with this system's own intent.
pub async fn join_intent(
    State(state): State<AppState>,
    peer: PeerCertificate,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<JoinIntent>, ApiError> {
    // Slow down passphrase guessing
    tokio::time::sleep(Duration::from_millis(timeouts::JOIN_INTENT_DELAY_MS)).await;

    let handler = &state.handler;
    let session = auth::authenticate(handler, &headers, &body).await?;

    let intent: JoinIntent = serde_json::from_slice(&body)
        .map_err(|e| ConclaveError::Protocol(format!("Invalid join intent: {e}")))?;

    if intent.version != PROTOCOL_VERSION {
        return Err(ConclaveError::Protocol(format!(
            "System {:?} (version {:?}) has a version mismatch: Expected {PROTOCOL_VERSION:?}",
            intent.name, intent.version
        ))
        .into());
    }

    let cert = Certificate::from_pem(&intent.certificate).map_err(|e| {
        ConclaveError::Protocol(format!("Invalid certificate of system {:?}: {e}", intent.name))
    })?;

    if cert.fingerprint() != peer.fingerprint() {
        return Err(ConclaveError::Trust(format!(
            "Certificate of system {:?} does not match its TLS connection",
            intent.name
        ))
        .into());
    }

    if session.role() == SessionRole::Initiating {
        let missing: Vec<String> = handler
            .services
            .types()
            .into_iter()
            .filter(|kind| !intent.services.contains(kind))
            .map(|kind| kind.to_string())
            .collect();

        if !missing.is_empty() {
            return Err(ConclaveError::InvalidInput(format!(
                "System {:?} is missing services: {}",
                intent.name,
                missing.join(", ")
            ))
            .into());
        }
    }

    session.register_intent(cert.fingerprint()).await?;

    tracing::info!(
        peer = %intent.name,
        address = %intent.address,
        fingerprint = %cert.short_fingerprint(),
        "📨 Join intent received"
    );
    session
        .publish_intent(intent, Duration::from_secs(timeouts::INTENT_CONSUMER_SECS))
        .await?;

    Ok(Json(handler.join_intent(&session.address().await)))
}

/// End the session. An empty reason means formation succeeded.
pub async fn stop_session(
    State(state): State<AppState>,
    peer: PeerCertificate,
    body: Bytes,
) -> Result<StatusCode, ApiError> {
    let (session, caller) = auth::authorize_peer(&state.handler, &peer).await?;
    let stop: SessionStopPut = serde_json::from_slice(&body)
        .map_err(|e| ConclaveError::Protocol(format!("Invalid stop request: {e}")))?;

    let cause = Some(stop.reason).filter(|r| !r.is_empty()).map(Cause::new);
    tracing::info!(caller = %caller, reason = ?cause, "Session stop requested");
    session.signal_exit(cause);

    Ok(StatusCode::OK)
}
