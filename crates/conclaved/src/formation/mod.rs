//! Cluster formation.
//!
//! Once a session has confirmed every peer, the initiator bootstraps or
//! extends each service's cluster: the orchestrator service first, then
//! tokens for every other service, then one join per host, strictly in
//! sequence, each waiting for membership to converge.

use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use thiserror::Error;
use tokio::task::JoinError;
use tokio::time::{Instant, sleep, timeout};

use conclave_common::constants::timeouts;
use conclave_common::{ConclaveError, ServiceToken, ServiceType, ServicesPut};

use crate::certs::{CertificateError, CertificateStore};
use crate::services::{ClusterService, JoinConfig, Peer, ServiceError, ServiceRegistry};

mod scheduler;

pub use scheduler::run_concurrent;

#[derive(Debug, Error)]
pub enum FormationError {
    #[error("Some systems are already part of different {0} clusters. Aborting initialization")]
    Conflict(ServiceType),

    #[error(transparent)]
    Service(#[from] ServiceError),

    #[error("Failed to reach {service} on system {system:?}: {source}")]
    Unreachable {
        service: ServiceType,
        system: String,
        source: ServiceError,
    },

    #[error(transparent)]
    Certificate(#[from] CertificateError),

    #[error("Timed out waiting for cluster member {peer:?} to appear")]
    Convergence { peer: String },

    #[error("Timed out waiting for {peer:?} to join")]
    JoinTimeout { peer: String },

    #[error("No system of the existing {0} cluster takes part in this session")]
    NoClusteredPeer(ServiceType),

    #[error("Task failed: {0}")]
    Task(#[from] JoinError),
}

impl From<FormationError> for ConclaveError {
    fn from(err: FormationError) -> Self {
        match err {
            FormationError::Service(e) => e.into(),
            FormationError::Conflict(_) => ConclaveError::Conflict(err.to_string()),
            FormationError::Convergence { .. } => ConclaveError::Convergence(err.to_string()),
            FormationError::JoinTimeout { .. } => ConclaveError::Timeout(err.to_string()),
            FormationError::Unreachable { .. } => ConclaveError::Network(err.to_string()),
            other => ConclaveError::Internal(other.to_string()),
        }
    }
}

/// Cluster membership a system reported before formation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SystemInformation {
    pub name: String,
    /// Daemon address, `ip:port`
    pub address: String,
    /// Members by name, per service; empty maps are dropped
    pub existing_clusters: HashMap<ServiceType, HashMap<String, String>>,
}

impl SystemInformation {
    /// Membership as seen by this host's own services. A service that is
    /// not clustered counts as empty; any other failure is an error.
    pub async fn local(name: &str, address: &str, services: &ServiceRegistry) -> Result<Self, FormationError> {
        let mut info = Self {
            name: name.to_string(),
            address: address.to_string(),
            existing_clusters: HashMap::new(),
        };

        for kind in services.types() {
            let members = services.get(kind)?.cluster_members().await;
            info.record(kind, members)?;
        }
        Ok(info)
    }

    /// Membership as reported by a peer for each of `kinds`
    pub async fn remote(peer: &dyn Peer, address: &str, kinds: &[ServiceType]) -> Result<Self, FormationError> {
        let mut info = Self {
            name: peer.name().to_string(),
            address: address.to_string(),
            existing_clusters: HashMap::new(),
        };

        for kind in kinds {
            let members = peer.cluster_members(*kind).await;
            info.record(*kind, members)?;
        }
        Ok(info)
    }

    fn record(
        &mut self,
        kind: ServiceType,
        members: Result<HashMap<String, String>, ServiceError>,
    ) -> Result<(), FormationError> {
        match members {
            Ok(members) if !members.is_empty() => {
                self.existing_clusters.insert(kind, members);
            }
            Ok(_) => {}
            Err(e) if e.is_not_clustered() => {
                tracing::debug!(system = %self.name, service = %kind, "Service not clustered")
            }
            Err(source) => {
                return Err(FormationError::Unreachable {
                    service: kind,
                    system: self.name.clone(),
                    source,
                });
            }
        }
        Ok(())
    }
}

/// Whether two systems report different clusters for one of `services`.
///
/// The first non-empty cluster seen for a service is the reference; any
/// other non-empty cluster must have exactly the same members and
/// addresses.
pub fn clusters_conflict<'a>(
    systems: impl IntoIterator<Item = &'a SystemInformation>,
    services: &[ServiceType],
) -> (bool, Option<ServiceType>) {
    let mut seen: HashMap<ServiceType, &HashMap<String, String>> = HashMap::new();

    for system in systems {
        for kind in services {
            let Some(members) = system.existing_clusters.get(kind) else { continue };
            if members.is_empty() {
                continue;
            }

            match seen.get(kind) {
                None => {
                    seen.insert(*kind, members);
                }
                Some(reference) if *reference != members => return (true, Some(*kind)),
                Some(_) => {}
            }
        }
    }

    (false, None)
}

/// Address a host's `service` listens on, derived from the host's
/// daemon address
pub fn service_address(address: &str, service: ServiceType) -> String {
    let port = service.default_port();
    match address.parse::<SocketAddr>() {
        Ok(addr) => SocketAddr::new(addr.ip(), port).to_string(),
        Err(_) => match address.parse::<std::net::IpAddr>() {
            Ok(ip) => SocketAddr::new(ip, port).to_string(),
            Err(_) => format!("{address}:{port}"),
        },
    }
}

/// Join every service listed in `put` on this host: the orchestrator
/// service alone first, compute alone last, the rest concurrently.
pub async fn join_services(
    services: &ServiceRegistry,
    name: &str,
    put: &ServicesPut,
    limit: Duration,
) -> Result<(), FormationError> {
    let kinds: Vec<ServiceType> = put.tokens.iter().map(|t| t.service).collect();
    let services = services.clone();
    let name = name.to_string();
    let put = Arc::new(put.clone());

    run_concurrent(
        &kinds,
        Some(ServiceType::Orchestrator),
        Some(ServiceType::Compute),
        move |kind| {
            let services = services.clone();
            let name = name.clone();
            let put = put.clone();
            async move {
                let service = services.get(kind)?;
                let config = JoinConfig {
                    name,
                    address: service_address(&put.address, kind),
                    token: put.token_for(kind).unwrap_or_default().to_string(),
                };

                tracing::info!(service = %kind, name = %config.name, "🔗 Joining cluster");
                timeout(limit, service.join(&config))
                    .await
                    .map_err(|_| ServiceError::Timeout(format!("{kind} to join")))??;
                Ok::<(), FormationError>(())
            }
        },
    )
    .await
}

/// Where a join token for one service comes from
#[derive(Clone)]
enum Issuer {
    Local(Arc<dyn ClusterService>),
    /// A clustered peer issues on the joiner's behalf
    Remote {
        peer: Arc<dyn Peer>,
        cluster_address: String,
    },
}

impl Issuer {
    async fn issue(&self, kind: ServiceType, joiner: &str) -> Result<String, FormationError> {
        match self {
            Issuer::Local(service) => Ok(service.issue_token(joiner).await?),
            Issuer::Remote { peer, cluster_address } => {
                let limit = Duration::from_secs(timeouts::REMOTE_REQUEST_SECS);
                let token = timeout(limit, peer.issue_token(kind, joiner, cluster_address))
                    .await
                    .map_err(|_| ServiceError::Timeout(format!("{} to issue a {kind} token", peer.name())))??;
                Ok(token)
            }
        }
    }
}

/// A token that must be revoked if formation fails
struct IssuedToken {
    service: Arc<dyn ClusterService>,
    joiner: String,
}

/// Forms or extends every service's cluster from this host
pub struct Formation {
    name: String,
    address: String,
    services: ServiceRegistry,
    peers: BTreeMap<String, Arc<dyn Peer>>,
    systems: BTreeMap<String, SystemInformation>,
    convergence_timeout: Duration,
    poll_interval: Duration,
    issued: Mutex<Vec<IssuedToken>>,
    /// Where the orchestrator's cluster certificate is kept
    certs: Option<CertificateStore>,
}

impl Formation {
    /// `systems` holds the reported membership of every host, this one
    /// included; `peers` every other confirmed host.
    pub fn new(
        name: &str,
        address: &str,
        services: ServiceRegistry,
        peers: Vec<Arc<dyn Peer>>,
        systems: Vec<SystemInformation>,
    ) -> Self {
        Self {
            name: name.to_string(),
            address: address.to_string(),
            services,
            peers: peers.into_iter().map(|p| (p.name().to_string(), p)).collect(),
            systems: systems.into_iter().map(|s| (s.name.clone(), s)).collect(),
            convergence_timeout: Duration::from_secs(timeouts::CONVERGENCE_SECS),
            poll_interval: Duration::from_millis(timeouts::CONVERGENCE_POLL_MS),
            issued: Mutex::new(Vec::new()),
            certs: None,
        }
    }

    /// Persist this host's certificate as the cluster certificate when it
    /// bootstraps the orchestrator, and hand the cluster certificate to
    /// orchestrator joiners
    pub fn with_certificates(mut self, certs: CertificateStore) -> Self {
        self.certs = Some(certs);
        self
    }

    pub fn with_convergence(mut self, limit: Duration, poll_interval: Duration) -> Self {
        self.convergence_timeout = limit;
        self.poll_interval = poll_interval;
        self
    }

    /// Refuse to continue when hosts disagree about an existing cluster
    pub fn validate(&self) -> Result<(), FormationError> {
        match clusters_conflict(self.systems.values(), &self.services.types()) {
            (true, Some(kind)) => Err(FormationError::Conflict(kind)),
            _ => Ok(()),
        }
    }

    /// Run formation to completion. On failure issued tokens are revoked
    /// and every peer's session is stopped with the error; on success every
    /// peer's session is ended cleanly.
    pub async fn run(&self) -> Result<(), FormationError> {
        let result = self.form().await;

        match &result {
            Ok(()) => {
                tracing::info!(peers = self.peers.len(), "✅ Cluster formed");
                self.stop_peers("").await;
            }
            Err(e) => {
                tracing::error!(error = %e, "❌ Cluster formation failed, reverting");
                self.revert().await;
                self.stop_peers(&e.to_string()).await;
            }
        }

        result
    }

    async fn form(&self) -> Result<(), FormationError> {
        self.validate()?;

        let kinds = self.services.types();
        let mut clusters = self.existing_clusters(&kinds);

        for kind in &kinds {
            if clusters.contains_key(kind) {
                continue;
            }
            let address = service_address(&self.address, *kind);
            tracing::info!(service = %kind, "🚀 Bootstrapping cluster");
            self.services.get(*kind)?.bootstrap(&self.name, &address).await?;
            clusters.insert(*kind, HashMap::from([(self.name.clone(), address)]));

            if *kind == ServiceType::Orchestrator {
                if let Some(certs) = &self.certs {
                    certs.set_cluster(certs.server())?;
                }
            }
        }

        let joiners = self.joiners();

        if kinds.contains(&ServiceType::Orchestrator) {
            for joiner in &joiners {
                if Self::is_member(&clusters, ServiceType::Orchestrator, &joiner.name) {
                    continue;
                }
                let issuer = self.issuer(&clusters, ServiceType::Orchestrator)?;
                let token = issuer.issue(ServiceType::Orchestrator, &joiner.name).await?;
                self.record(&issuer, &joiner.name);

                let put = ServicesPut {
                    tokens: vec![ServiceToken {
                        service: ServiceType::Orchestrator,
                        join_token: token,
                    }],
                    address: joiner.address.clone(),
                    cluster_certificate: self.cluster_certificate()?,
                };
                self.wait_for_join(joiner, &put, &mut clusters).await?;
            }
        }

        let others: Vec<ServiceType> = kinds
            .iter()
            .copied()
            .filter(|k| *k != ServiceType::Orchestrator)
            .collect();

        let mut puts = Vec::new();
        for joiner in &joiners {
            let put = self.issue_tokens(joiner, &others, &clusters).await?;
            puts.push(put);
        }

        // Local host first, then every peer in order
        for (joiner, put) in joiners.iter().zip(puts) {
            if put.tokens.is_empty() {
                continue;
            }
            self.wait_for_join(joiner, &put, &mut clusters).await?;
        }

        Ok(())
    }

    /// Issue tokens for every service `joiner` is not yet a member of
    async fn issue_tokens(
        &self,
        joiner: &Joiner,
        kinds: &[ServiceType],
        clusters: &HashMap<ServiceType, HashMap<String, String>>,
    ) -> Result<ServicesPut, FormationError> {
        let mut plan = HashMap::new();
        for kind in kinds {
            if Self::is_member(clusters, *kind, &joiner.name) {
                continue;
            }
            plan.insert(*kind, self.issuer(clusters, *kind)?);
        }

        let pending: Vec<ServiceType> = plan.keys().copied().collect();
        let plan = Arc::new(plan);
        let tokens = Arc::new(Mutex::new(Vec::new()));

        let name = joiner.name.clone();
        let collected = tokens.clone();
        let issuers = plan.clone();
        let result = run_concurrent(&pending, None, None, move |kind| {
            let issuers = issuers.clone();
            let collected = collected.clone();
            let name = name.clone();
            async move {
                let Some(issuer) = issuers.get(&kind) else { return Ok(()) };
                let join_token = issuer.issue(kind, &name).await?;
                tracing::debug!(service = %kind, joiner = %name, "Issued join token");
                if let Ok(mut tokens) = collected.lock() {
                    tokens.push(ServiceToken {
                        service: kind,
                        join_token,
                    });
                }
                Ok::<(), FormationError>(())
            }
        })
        .await;

        let mut tokens = tokens.lock().map(|t| t.clone()).unwrap_or_default();
        for token in &tokens {
            if let Some(issuer) = plan.get(&token.service) {
                self.record(issuer, &joiner.name);
            }
        }
        result?;

        tokens.sort_by_key(|t| t.service);
        Ok(ServicesPut {
            tokens,
            address: joiner.address.clone(),
            cluster_certificate: None,
        })
    }

    /// Request `joiner` to join every service in `put`, then wait until
    /// each of those clusters has grown by exactly one member.
    ///
    /// Joins run one at a time, so a cluster growing by one means this
    /// joiner has appeared.
    async fn wait_for_join(
        &self,
        joiner: &Joiner,
        put: &ServicesPut,
        clusters: &mut HashMap<ServiceType, HashMap<String, String>>,
    ) -> Result<(), FormationError> {
        let expected: Vec<(ServiceType, usize)> = put
            .tokens
            .iter()
            .map(|t| (t.service, clusters.get(&t.service).map_or(0, |m| m.len()) + 1))
            .collect();

        tracing::info!(peer = %joiner.name, services = put.tokens.len(), "Requesting join");
        match &joiner.peer {
            None => {
                let limit = Duration::from_secs(timeouts::LOCAL_JOIN_SECS);
                join_services(&self.services, &self.name, put, limit).await?;
            }
            Some(peer) => {
                let limit = Duration::from_secs(timeouts::REMOTE_REQUEST_SECS);
                timeout(limit, peer.join_services(put))
                    .await
                    .map_err(|_| FormationError::JoinTimeout {
                        peer: joiner.name.clone(),
                    })??;
            }
        }

        let deadline = Instant::now() + self.convergence_timeout;
        for (kind, size) in expected {
            let service = self.services.get(kind)?;
            loop {
                let members = service.cluster_members().await?;
                if members.len() == size {
                    clusters.insert(kind, members);
                    break;
                }
                if Instant::now() >= deadline {
                    return Err(FormationError::Convergence {
                        peer: joiner.name.clone(),
                    });
                }
                sleep(self.poll_interval).await;
            }
        }

        tracing::info!(peer = %joiner.name, "🤝 Peer joined");
        Ok(())
    }

    /// Issue locally when this host belongs to the cluster, otherwise ask a
    /// clustered peer
    fn issuer(
        &self,
        clusters: &HashMap<ServiceType, HashMap<String, String>>,
        kind: ServiceType,
    ) -> Result<Issuer, FormationError> {
        let members = match clusters.get(&kind) {
            Some(members) if !members.contains_key(&self.name) => members,
            _ => return Ok(Issuer::Local(self.services.get(kind)?)),
        };

        let mut names: Vec<&String> = members.keys().collect();
        names.sort();
        for name in names {
            if let Some(peer) = self.peers.get(name) {
                return Ok(Issuer::Remote {
                    peer: peer.clone(),
                    cluster_address: members[name].clone(),
                });
            }
        }

        Err(FormationError::NoClusteredPeer(kind))
    }

    /// PEM of the cluster certificate, if this host holds one
    fn cluster_certificate(&self) -> Result<Option<String>, FormationError> {
        let Some(certs) = &self.certs else { return Ok(None) };
        Ok(certs.cluster()?.map(|cert| cert.pem().to_string()))
    }

    fn record(&self, issuer: &Issuer, joiner: &str) {
        // Tokens minted by a peer expire with the peer's cluster
        if let Issuer::Local(service) = issuer {
            if let Ok(mut issued) = self.issued.lock() {
                issued.push(IssuedToken {
                    service: service.clone(),
                    joiner: joiner.to_string(),
                });
            }
        }
    }

    fn is_member(
        clusters: &HashMap<ServiceType, HashMap<String, String>>,
        kind: ServiceType,
        name: &str,
    ) -> bool {
        clusters.get(&kind).is_some_and(|m| m.contains_key(name))
    }

    /// First non-empty reported cluster per service
    fn existing_clusters(&self, kinds: &[ServiceType]) -> HashMap<ServiceType, HashMap<String, String>> {
        let mut clusters = HashMap::new();
        for system in self.systems.values() {
            for kind in kinds {
                if let Some(members) = system.existing_clusters.get(kind) {
                    if !members.is_empty() {
                        clusters.entry(*kind).or_insert_with(|| members.clone());
                    }
                }
            }
        }
        clusters
    }

    /// This host first, then peers by name
    fn joiners(&self) -> Vec<Joiner> {
        let mut joiners = vec![Joiner {
            name: self.name.clone(),
            address: self.address.clone(),
            peer: None,
        }];

        for (name, peer) in &self.peers {
            let address = self
                .systems
                .get(name)
                .map(|s| s.address.clone())
                .unwrap_or_default();
            joiners.push(Joiner {
                name: name.clone(),
                address,
                peer: Some(peer.clone()),
            });
        }

        joiners
    }

    async fn revert(&self) {
        let issued = self
            .issued
            .lock()
            .map(|mut issued| std::mem::take(&mut *issued))
            .unwrap_or_default();

        for token in issued {
            if let Err(e) = token.service.delete_token(&token.joiner).await {
                tracing::warn!(
                    service = %token.service.service_type(),
                    joiner = %token.joiner,
                    error = %e,
                    "Failed to revoke join token"
                );
            }
        }
    }

    async fn stop_peers(&self, reason: &str) {
        for peer in self.peers.values() {
            if let Err(e) = peer.stop_session(reason).await {
                tracing::warn!(peer = %peer.name(), error = %e, "Failed to stop peer session");
            }
        }
    }
}

struct Joiner {
    name: String,
    address: String,
    /// `None` for this host
    peer: Option<Arc<dyn Peer>>,
}
