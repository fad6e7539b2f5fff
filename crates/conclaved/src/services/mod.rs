//! Clients for the clustered services.
//!
//! Every service is driven through [`ClusterService`]; the concrete client
//! is picked by matching on the [`ServiceType`] tag.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use conclave_common::{ConclaveError, ServiceType};

use crate::certs::CertificateError;
use crate::tls::TlsError;

mod client;
mod compute;
mod member;
pub mod remote;

pub use compute::ComputeService;
pub use member::MemberClusterService;
pub use remote::{Peer, RemoteSystem};

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("Request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// Error reported by the remote end, passed through verbatim
    #[error("{message}")]
    Status { status: u16, message: String },

    #[error("Service {0} is not installed")]
    NotInstalled(ServiceType),

    #[error("Timed out waiting for {0}")]
    Timeout(String),

    #[error(transparent)]
    Tls(#[from] TlsError),

    #[error("Peer's certificate is missing")]
    MissingPeerCertificate,

    #[error(transparent)]
    Certificate(#[from] CertificateError),

    #[error("Failed to encode request: {0}")]
    Encode(#[from] serde_json::Error),
}

impl ServiceError {
    /// An installed service answers 503 until it is part of a cluster
    pub fn is_not_clustered(&self) -> bool {
        matches!(self, Self::Status { status: 503, .. })
    }
}

impl From<ServiceError> for ConclaveError {
    fn from(err: ServiceError) -> Self {
        match err {
            ServiceError::Request(e) => ConclaveError::Network(e.to_string()),
            ServiceError::Status { status: 401, message } => ConclaveError::Trust(message),
            ServiceError::Status { message, .. } => ConclaveError::Internal(message),
            ServiceError::NotInstalled(_) => ConclaveError::InvalidInput(err.to_string()),
            ServiceError::Timeout(_) => ConclaveError::Timeout(err.to_string()),
            ServiceError::MissingPeerCertificate | ServiceError::Certificate(_) => {
                ConclaveError::Trust(err.to_string())
            }
            ServiceError::Tls(_) | ServiceError::Encode(_) => ConclaveError::Internal(err.to_string()),
        }
    }
}

/// Settings for joining a service's cluster
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinConfig {
    /// Name this host joins as
    pub name: String,
    /// Address this host advertises
    pub address: String,
    pub token: String,
}

/// Control operations every clustered service supports.
///
/// `cluster_members` fails with a 503 status while the service is
/// installed but not part of any cluster.
#[async_trait]
pub trait ClusterService: Send + Sync {
    fn service_type(&self) -> ServiceType;

    /// Form a new single-member cluster
    async fn bootstrap(&self, name: &str, address: &str) -> Result<(), ServiceError>;

    /// Mint a join token for `peer`
    async fn issue_token(&self, peer: &str) -> Result<String, ServiceError>;

    /// Revoke an unused token
    async fn delete_token(&self, peer: &str) -> Result<(), ServiceError>;

    async fn join(&self, config: &JoinConfig) -> Result<(), ServiceError>;

    /// Members by name, with their addresses
    async fn cluster_members(&self) -> Result<HashMap<String, String>, ServiceError>;

    async fn delete_cluster_member(&self, name: &str, force: bool) -> Result<(), ServiceError>;
}

/// Build the client for `kind` talking to `url`
pub fn build_service(kind: ServiceType, url: &str) -> Arc<dyn ClusterService> {
    match kind {
        ServiceType::Compute => Arc::new(ComputeService::new(url)),
        ServiceType::Orchestrator | ServiceType::Storage | ServiceType::Network => {
            Arc::new(MemberClusterService::new(kind, url))
        }
    }
}

/// Installed services of this host
#[derive(Clone, Default)]
pub struct ServiceRegistry {
    services: BTreeMap<ServiceType, Arc<dyn ClusterService>>,
}

impl ServiceRegistry {
    pub fn register(&mut self, service: Arc<dyn ClusterService>) {
        self.services.insert(service.service_type(), service);
    }

    pub fn get(&self, kind: ServiceType) -> Result<Arc<dyn ClusterService>, ServiceError> {
        self.services
            .get(&kind)
            .cloned()
            .ok_or(ServiceError::NotInstalled(kind))
    }

    pub fn contains(&self, kind: ServiceType) -> bool {
        self.services.contains_key(&kind)
    }

    /// Installed service types, orchestrator first
    pub fn types(&self) -> Vec<ServiceType> {
        self.services.keys().copied().collect()
    }
}

impl std::fmt::Debug for ServiceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.services.keys()).finish()
    }
}
