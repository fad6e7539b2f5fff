//! Ownership of the single active trust session.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;

use conclave_common::{ConclaveError, JoinIntent, SessionRole};
use conclave_common::constants::PROTOCOL_VERSION;

use crate::certs::{Certificate, CertificateStore};
use crate::context::Cause;
use crate::gateway::Gateway;
use crate::services::ServiceRegistry;
use crate::session::Session;
use crate::tls::TlsIdentity;

/// Identity of this host plus the optional active session
pub struct Handler {
    pub name: String,
    pub address: String,
    pub multicast_port: u16,
    pub certs: CertificateStore,
    pub tls: TlsIdentity,
    pub services: ServiceRegistry,
    session: RwLock<Option<Arc<Session>>>,
}

impl Handler {
    pub fn new(
        name: String,
        address: String,
        multicast_port: u16,
        certs: CertificateStore,
        services: ServiceRegistry,
    ) -> Self {
        Self {
            name,
            address,
            multicast_port,
            tls: TlsIdentity::new(&certs),
            certs,
            services,
            session: RwLock::new(None),
        }
    }

    /// Open a session. Fails if one is already running.
    pub async fn start_session(
        &self,
        role: SessionRole,
        passphrase: Option<String>,
        gateway: Arc<Gateway>,
        timeout: Duration,
    ) -> Result<Arc<Session>, ConclaveError> {
        let mut slot = self.session.write().await;
        if let Some(existing) = slot.as_ref() {
            if !existing.is_stopped().await {
                return Err(ConclaveError::SessionActive);
            }
        }

        let session = Arc::new(Session::new(role, passphrase, gateway)?);
        let expires_at = chrono::Utc::now()
            + chrono::Duration::from_std(timeout).unwrap_or_else(|_| chrono::Duration::zero());
        session.set_expiry(expires_at).await;
        *slot = Some(session.clone());

        tracing::info!(role = %role, expires_at = %expires_at, "🔑 Session started");
        Ok(session)
    }

    /// Stop and forget the active session
    pub async fn stop_session(&self, cause: Option<Cause>) -> Result<(), ConclaveError> {
        let session = self.session.write().await.take();
        match session {
            Some(session) => {
                session.stop(cause).await;
                Ok(())
            }
            None => Err(ConclaveError::NoActiveSession),
        }
    }

    pub async fn active_session(&self) -> bool {
        match self.session.read().await.as_ref() {
            Some(session) => !session.is_stopped().await,
            None => false,
        }
    }

    /// The active session, or [`ConclaveError::NoActiveSession`]
    pub async fn session(&self) -> Result<Arc<Session>, ConclaveError> {
        let slot = self.session.read().await;
        match slot.as_ref() {
            Some(session) if !session.is_stopped().await => Ok(session.clone()),
            _ => Err(ConclaveError::NoActiveSession),
        }
    }

    /// Provisional trust of the active session; empty without one
    pub async fn temporary_trust_store(&self) -> HashMap<String, Certificate> {
        match self.session().await {
            Ok(session) => session.temporary_trust_store().await,
            Err(_) => HashMap::new(),
        }
    }

    /// This host's join intent, carrying its server certificate. An empty
    /// `address` falls back to the configured one.
    pub fn join_intent(&self, address: &str) -> JoinIntent {
        let address = if address.is_empty() { &self.address } else { address };
        JoinIntent {
            name: self.name.clone(),
            version: PROTOCOL_VERSION.to_string(),
            address: address.to_string(),
            certificate: self.certs.server().pem().to_string(),
            services: self.services.types(),
        }
    }
}
