//! Service endpoints used by the orchestrating system.
//!
//! Callers authenticate with the TLS certificate a session approved.

use std::time::Duration;

use axum::{
    Json,
    body::Bytes,
    extract::{Path, State},
    http::StatusCode,
};

use conclave_common::constants::timeouts;
use conclave_common::{
    ClusterMember, ConclaveError, ServiceTokenResponse, ServiceTokensPost, ServiceType, ServicesPut,
};

use super::ApiError;
use crate::auth;
use crate::certs::Certificate;
use crate::formation;
use crate::services::ServiceError;
use crate::state::AppState;
use crate::tls::PeerCertificate;

/// Join every service a token was issued for
pub async fn join_services(
    State(state): State<AppState>,
    peer: PeerCertificate,
    body: Bytes,
) -> Result<StatusCode, ApiError> {
    let (_, caller) = auth::authorize_peer(&state.handler, &peer).await?;
    let put: ServicesPut = serde_json::from_slice(&body)
        .map_err(|e| ConclaveError::Protocol(format!("Invalid services request: {e}")))?;

    let cluster_cert = put
        .cluster_certificate
        .as_deref()
        .map(Certificate::from_pem)
        .transpose()
        .map_err(|e| ConclaveError::Protocol(format!("Invalid cluster certificate: {e}")))?;

    let limit = Duration::from_secs(timeouts::REMOTE_REQUEST_SECS);
    formation::join_services(&state.handler.services, &state.handler.name, &put, limit).await?;

    if let Some(cert) = cluster_cert {
        state
            .handler
            .certs
            .set_cluster(&cert)
            .map_err(|e| ConclaveError::Internal(e.to_string()))?;
    }

    tracing::info!(caller = %caller, services = put.tokens.len(), "✅ Joined services");
    Ok(StatusCode::OK)
}

/// Issue a token on behalf of a system outside the cluster
pub async fn issue_token(
    State(state): State<AppState>,
    Path(service): Path<ServiceType>,
    peer: PeerCertificate,
    body: Bytes,
) -> Result<Json<ServiceTokenResponse>, ApiError> {
    let (_, caller) = auth::authorize_peer(&state.handler, &peer).await?;
    let req: ServiceTokensPost = serde_json::from_slice(&body)
        .map_err(|e| ConclaveError::Protocol(format!("Invalid token request: {e}")))?;

    let client = state.handler.services.get(service)?;
    let limit = Duration::from_secs(timeouts::REMOTE_REQUEST_SECS);
    let join_token = tokio::time::timeout(limit, client.issue_token(&req.joiner_name))
        .await
        .map_err(|_| ServiceError::Timeout(format!("a {service} token")))??;

    tracing::info!(
        caller = %caller,
        service = %service,
        joiner = %req.joiner_name,
        cluster = %req.cluster_address,
        "🎟️ Issued token for remote joiner"
    );
    Ok(Json(ServiceTokenResponse { join_token }))
}

/// Current members of a service's cluster; empty while the service is
/// installed but not clustered
pub async fn cluster_members(
    State(state): State<AppState>,
    Path(service): Path<ServiceType>,
    peer: PeerCertificate,
) -> Result<Json<Vec<ClusterMember>>, ApiError> {
    auth::authorize_peer(&state.handler, &peer).await?;

    let members = match state.handler.services.get(service)?.cluster_members().await {
        Ok(members) => members,
        Err(e) if e.is_not_clustered() => Default::default(),
        Err(e) => return Err(e.into()),
    };
    let mut members: Vec<ClusterMember> = members
        .into_iter()
        .map(|(name, address)| ClusterMember { name, address })
        .collect();
    members.sort_by(|a, b| a.name.cmp(&b.name));

    Ok(Json(members))
}

#[cfg(test)]
mod tests {
    use super::super::tests::{app, call};
    use super::*;
    use crate::certs::tests::test_certificate;
    use crate::context::Context;
    use crate::gateway::tests::gateway_pair;
    use crate::handler::Handler;
    use crate::handler::tests::test_handler;
    use crate::services::ServiceRegistry;
    use crate::services::tests::FakeService;
    use axum::body::Body;
    use axum::http::Request;
    use axum::http::header::CONTENT_TYPE;
    use conclave_common::{ServiceToken, SessionRole};
    use std::sync::Arc;

    /// Joining system with `node1` trusted and a storage service
    async fn joiner(name: &str) -> (Arc<Handler>, Arc<FakeService>, Certificate) {
        let storage = FakeService::new(ServiceType::Storage, &[("node1", "10.0.0.1:7443")]);
        let mut services = ServiceRegistry::default();
        services.register(storage.clone());
        let handler = Arc::new(test_handler(name, services));

        let ctx = Context::new();
        let (gw, _cli) = gateway_pair(&ctx).await;
        let session = handler
            .start_session(SessionRole::Joining, None, gw, Duration::from_secs(600))
            .await
            .unwrap();
        let node1 = test_certificate("node1");
        session.allow("node1", node1.clone()).await.unwrap();

        (handler, storage, node1)
    }

    fn from(peer: &Certificate, method: &str, uri: &str, body: Vec<u8>) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header(CONTENT_TYPE, "application/json")
            .extension(Some(PeerCertificate(peer.clone())))
            .body(Body::from(body))
            .unwrap()
    }

    #[tokio::test]
    async fn test_join_services() {
        let (handler, storage, node1) = joiner("svc-join").await;
        let put = ServicesPut {
            tokens: vec![ServiceToken {
                service: ServiceType::Storage,
                join_token: "storage-token".to_string(),
            }],
            address: "10.0.0.2:9443".to_string(),
            cluster_certificate: None,
        };

        let (status, _) = call(
            app(handler.clone()),
            from(&node1, "PUT", "/1.0/services", serde_json::to_vec(&put).unwrap()),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(storage.calls(), vec!["join svc-join storage-token"]);
        assert_eq!(storage.members.lock().unwrap()["svc-join"], "10.0.0.2:7443");
        assert!(handler.certs.cluster().unwrap().is_none());
    }

    #[tokio::test]
    async fn test_join_stores_cluster_certificate() {
        let (handler, _storage, node1) = joiner("svc-cluster-cert").await;
        let put = ServicesPut {
            tokens: vec![ServiceToken {
                service: ServiceType::Storage,
                join_token: "storage-token".to_string(),
            }],
            address: "10.0.0.2:9443".to_string(),
            cluster_certificate: Some(node1.pem().to_string()),
        };

        let (status, _) = call(
            app(handler.clone()),
            from(&node1, "PUT", "/1.0/services", serde_json::to_vec(&put).unwrap()),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(handler.certs.identity().unwrap(), node1);
    }

    #[tokio::test]
    async fn test_untrusted_caller_is_rejected() {
        let (handler, storage, _) = joiner("svc-untrusted").await;
        let stranger = test_certificate("node9");

        let (status, body) = call(
            app(handler),
            from(&stranger, "GET", "/1.0/services/storage/members", Vec::new()),
        )
        .await;

        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(
            body["error"],
            format!("Trust error: Certificate {} is not trusted", stranger.short_fingerprint())
        );
        assert!(storage.calls().is_empty());
    }

    #[tokio::test]
    async fn test_members_and_remote_tokens() {
        let (handler, storage, node1) = joiner("svc-members").await;

        let (status, body) = call(
            app(handler.clone()),
            from(&node1, "GET", "/1.0/services/storage/members", Vec::new()),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, serde_json::json!([{"name": "node1", "address": "10.0.0.1:7443"}]));

        let req = ServiceTokensPost {
            cluster_address: "10.0.0.1:7443".to_string(),
            joiner_name: "node3".to_string(),
        };
        let (status, body) = call(
            app(handler.clone()),
            from(&node1, "POST", "/1.0/services/storage/tokens", serde_json::to_vec(&req).unwrap()),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["join_token"], "storage-token-node3");
        assert_eq!(storage.calls(), vec!["issue node3"]);

        let (status, body) = call(
            app(handler),
            from(&node1, "POST", "/1.0/services/compute/tokens", serde_json::to_vec(&req).unwrap()),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "Invalid input: Service compute is not installed");
    }

    #[tokio::test]
    async fn test_members_report_service_failures() {
        let (handler, storage, node1) = joiner("svc-members-failing").await;

        storage.fail_members(503, "Storage is not initialized");
        let (status, body) = call(
            app(handler.clone()),
            from(&node1, "GET", "/1.0/services/storage/members", Vec::new()),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, serde_json::json!([]));

        storage.fail_members(500, "Cluster database corrupted");
        let (status, body) = call(
            app(handler),
            from(&node1, "GET", "/1.0/services/storage/members", Vec::new()),
        )
        .await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["error"], "Internal error: Cluster database corrupted");
    }
}
