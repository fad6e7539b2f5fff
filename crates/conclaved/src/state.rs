//! Application state and shared resources.

use anyhow::{Context, Result};
use std::sync::Arc;

use crate::certs::CertificateStore;
use crate::config::AppConfig;
use crate::handler::Handler;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    /// Application configuration
    pub config: AppConfig,

    /// Identity, installed services and the active session
    pub handler: Arc<Handler>,
}

impl AppState {
    /// Create application state, loading or generating this system's
    /// certificate
    pub fn new(config: AppConfig) -> Result<Self> {
        let certs = CertificateStore::load_or_generate(&config.state_dir(), &config.name)
            .context("Failed to load server certificate")?;

        let address = config.advertised_address()?;
        address
            .parse::<std::net::SocketAddr>()
            .with_context(|| format!("Invalid advertised address {address:?}"))?;

        let services = config.services.registry();
        tracing::info!(
            name = %config.name,
            address = %address,
            fingerprint = %certs.server().short_fingerprint(),
            services = ?services,
            "🪪 System identity loaded"
        );

        let handler = Arc::new(Handler::new(
            config.name.clone(),
            address,
            config.multicast_port,
            certs,
            services,
        ));

        Ok(Self { config, handler })
    }

    /// State around an existing handler
    pub fn with_handler(config: AppConfig, handler: Arc<Handler>) -> Self {
        Self { config, handler }
    }
}
