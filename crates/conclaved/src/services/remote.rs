//! Client for another Conclave daemon.
//!
//! Connections are mutual TLS: this host presents its own certificate and
//! only talks to a peer presenting the certificate a session approved.
//! Requests also carry the session passphrase HMAC.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use reqwest::tls::TlsInfo;
use reqwest::{Method, Response};
use serde::Serialize;

use conclave_common::constants::timeouts;
use conclave_common::{
    ClusterMember, JoinIntent, ServiceTokenResponse, ServiceTokensPost, ServiceType, ServicesPut,
    SessionStopPut,
};

use super::ServiceError;
use super::client::error_for_status;
use crate::auth;
use crate::certs::Certificate;
use crate::tls::TlsIdentity;

/// Operations the orchestrator performs on a confirmed peer
#[async_trait]
pub trait Peer: Send + Sync {
    fn name(&self) -> &str;

    /// Join every service listed in `put`
    async fn join_services(&self, put: &ServicesPut) -> Result<(), ServiceError>;

    /// Have the peer mint a token for `joiner` in a cluster it belongs to
    async fn issue_token(
        &self,
        service: ServiceType,
        joiner: &str,
        cluster_address: &str,
    ) -> Result<String, ServiceError>;

    /// Members of the peer's `service` cluster; empty when it has none
    async fn cluster_members(&self, service: ServiceType) -> Result<HashMap<String, String>, ServiceError>;

    /// End the peer's session; an empty reason means success
    async fn stop_session(&self, reason: &str) -> Result<(), ServiceError>;
}

/// HTTPS client of a peer daemon
#[derive(Clone)]
pub struct RemoteSystem {
    name: String,
    address: String,
    passphrase: String,
    http: reqwest::Client,
}

impl RemoteSystem {
    /// `address` is the peer's `host:port`. The peer must present
    /// `pinned`; without a pin any certificate is accepted, which is only
    /// meant for the first contact with an initiator.
    pub fn new(
        name: &str,
        address: &str,
        identity: &TlsIdentity,
        pinned: Option<&Certificate>,
        passphrase: &str,
    ) -> Result<Self, ServiceError> {
        let tls = identity.client_config(pinned.map(Certificate::fingerprint))?;
        let http = reqwest::Client::builder()
            .use_preconfigured_tls(tls)
            .tls_info(true)
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(timeouts::REMOTE_REQUEST_SECS))
            .build()?;

        Ok(Self {
            name: name.to_string(),
            address: address.to_string(),
            passphrase: passphrase.to_string(),
            http,
        })
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// Register `intent` with the peer's session. The peer answers with its
    /// own intent; the certificate it presented on the connection is
    /// returned alongside.
    pub async fn session_join(&self, intent: &JoinIntent) -> Result<(JoinIntent, Certificate), ServiceError> {
        let resp = self.send(Method::POST, "/1.0/session/join", Some(intent)).await?;

        let presented = resp
            .extensions()
            .get::<TlsInfo>()
            .and_then(TlsInfo::peer_certificate)
            .ok_or(ServiceError::MissingPeerCertificate)?;
        let cert = Certificate::from_der(presented)?;

        Ok((resp.json().await?, cert))
    }

    async fn send<B: Serialize + ?Sized>(
        &self,
        method: Method,
        path: &str,
        body: Option<&B>,
    ) -> Result<Response, ServiceError> {
        let url = format!("https://{}{}", self.address, path);
        let body = match body {
            Some(body) => serde_json::to_vec(body)?,
            None => Vec::new(),
        };
        tracing::debug!(peer = %self.name, method = %method, url = %url, "Peer request");

        let resp = self
            .http
            .request(method, &url)
            .header(AUTHORIZATION, auth::sign(&self.passphrase, &body))
            .header(CONTENT_TYPE, "application/json")
            .body(body)
            .send()
            .await?;

        error_for_status(resp).await
    }
}

#[async_trait]
impl Peer for RemoteSystem {
    fn name(&self) -> &str {
        &self.name
    }

    async fn join_services(&self, put: &ServicesPut) -> Result<(), ServiceError> {
        self.send(Method::PUT, "/1.0/services", Some(put)).await?;
        Ok(())
    }

    async fn issue_token(
        &self,
        service: ServiceType,
        joiner: &str,
        cluster_address: &str,
    ) -> Result<String, ServiceError> {
        let req = ServiceTokensPost {
            cluster_address: cluster_address.to_string(),
            joiner_name: joiner.to_string(),
        };

        let resp = self
            .send(Method::POST, &format!("/1.0/services/{service}/tokens"), Some(&req))
            .await?;
        let token: ServiceTokenResponse = resp.json().await?;
        Ok(token.join_token)
    }

    async fn cluster_members(&self, service: ServiceType) -> Result<HashMap<String, String>, ServiceError> {
        let resp = self
            .send(Method::GET, &format!("/1.0/services/{service}/members"), None::<&()>)
            .await?;
        let members: Vec<ClusterMember> = resp.json().await?;
        Ok(members.into_iter().map(|m| (m.name, m.address)).collect())
    }

    async fn stop_session(&self, reason: &str) -> Result<(), ServiceError> {
        let stop = SessionStopPut {
            reason: reason.to_string(),
        };
        self.send(Method::PUT, "/1.0/session/stop", Some(&stop)).await?;
        Ok(())
    }
}
