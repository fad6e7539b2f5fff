//! Configuration management for Conclave.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use conclave_common::ServiceType;
use conclave_common::constants::{
    DEFAULT_CONTROL_ADDR, DEFAULT_LISTEN_ADDR, DEFAULT_STATE_DIR, MULTICAST_PORT, timeouts,
};

use crate::services::{ServiceRegistry, build_service};

/// Application configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// Peer-facing HTTP listen address
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,

    /// Local websocket control socket
    #[serde(default = "default_control_addr")]
    pub control_addr: String,

    /// Where certificates are kept
    #[serde(default = "default_state_dir")]
    pub state_dir: String,

    /// Name this system joins clusters as (hostname if not set)
    #[serde(default = "default_name")]
    pub name: String,

    /// Address advertised to peers, `ip:port`. Derived from the listen
    /// address when empty.
    #[serde(default)]
    pub address: String,

    /// Multicast discovery port
    #[serde(default = "default_multicast_port")]
    pub multicast_port: u16,

    /// Session lifetime when the CLI asks for none
    #[serde(default = "default_session_timeout")]
    pub session_timeout_secs: u64,

    /// Clustered services installed on this system
    #[serde(default)]
    pub services: ServicesConfig,
}

/// Control endpoints of the installed services; absent means not installed
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ServicesConfig {
    #[serde(default)]
    pub orchestrator: Option<ServiceSettings>,
    #[serde(default)]
    pub compute: Option<ServiceSettings>,
    #[serde(default)]
    pub storage: Option<ServiceSettings>,
    #[serde(default)]
    pub network: Option<ServiceSettings>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServiceSettings {
    /// Base URL of the service's control API
    pub url: String,
}

impl ServicesConfig {
    fn get(&self, kind: ServiceType) -> Option<&ServiceSettings> {
        match kind {
            ServiceType::Orchestrator => self.orchestrator.as_ref(),
            ServiceType::Compute => self.compute.as_ref(),
            ServiceType::Storage => self.storage.as_ref(),
            ServiceType::Network => self.network.as_ref(),
        }
    }

    /// Clients for every configured service
    pub fn registry(&self) -> ServiceRegistry {
        let mut registry = ServiceRegistry::default();
        for kind in ServiceType::ALL {
            if let Some(settings) = self.get(kind) {
                registry.register(build_service(kind, &settings.url));
            }
        }
        registry
    }
}

/// Command line values that take precedence over the file
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub listen: Option<String>,
    pub control: Option<String>,
    pub state_dir: Option<String>,
    pub name: Option<String>,
    pub address: Option<String>,
}

// Default value functions
fn default_listen_addr() -> String { DEFAULT_LISTEN_ADDR.to_string() }
fn default_control_addr() -> String { DEFAULT_CONTROL_ADDR.to_string() }
fn default_state_dir() -> String { DEFAULT_STATE_DIR.to_string() }
fn default_multicast_port() -> u16 { MULTICAST_PORT }
fn default_session_timeout() -> u64 { timeouts::SESSION_DEFAULT_SECS } // 10 minutes

fn default_name() -> String {
    nix::unistd::gethostname()
        .ok()
        .and_then(|name| name.into_string().ok())
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| "conclave".to_string())
}

impl AppConfig {
    /// Load configuration from file, with CLI overrides
    pub fn load(config_path: &str, overrides: &Overrides) -> Result<Self> {
        let mut config = if Path::new(config_path).exists() {
            let settings = config::Config::builder()
                .add_source(config::File::with_name(config_path))
                .build()
                .context("Failed to load config file")?;

            settings
                .try_deserialize()
                .context("Failed to parse config")?
        } else {
            tracing::warn!(path = %config_path, "Config file not found, using defaults");
            Self::default()
        };

        if let Some(ref listen) = overrides.listen {
            config.listen_addr = listen.clone();
        }
        if let Some(ref control) = overrides.control {
            config.control_addr = control.clone();
        }
        if let Some(ref state_dir) = overrides.state_dir {
            config.state_dir = state_dir.clone();
        }
        if let Some(ref name) = overrides.name {
            config.name = name.clone();
        }
        if let Some(ref address) = overrides.address {
            config.address = address.clone();
        }

        if config.session_timeout_secs > timeouts::SESSION_MAX_SECS {
            anyhow::bail!(
                "Session timeout of {}s exceeds the maximum of {}s",
                config.session_timeout_secs,
                timeouts::SESSION_MAX_SECS
            );
        }

        Ok(config)
    }

    pub fn state_dir(&self) -> PathBuf {
        PathBuf::from(&self.state_dir)
    }

    pub fn session_timeout(&self) -> Duration {
        Duration::from_secs(self.session_timeout_secs)
    }

    /// Address advertised to peers. An unspecified listen IP is replaced
    /// by the first global address of this system.
    pub fn advertised_address(&self) -> Result<String> {
        if !self.address.is_empty() {
            return Ok(self.address.clone());
        }

        let listen: std::net::SocketAddr = self
            .listen_addr
            .parse()
            .with_context(|| format!("Invalid listen address {:?}", self.listen_addr))?;
        if !listen.ip().is_unspecified() {
            return Ok(listen.to_string());
        }

        let ip = crate::discovery::network_info()?
            .into_iter()
            .map(|info| info.address)
            .find(|ip| ip.is_ipv4())
            .context("No global address to advertise, set `address`")?;
        Ok(std::net::SocketAddr::new(ip, listen.port()).to_string())
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            control_addr: default_control_addr(),
            state_dir: default_state_dir(),
            name: default_name(),
            address: String::new(),
            multicast_port: default_multicast_port(),
            session_timeout_secs: default_session_timeout(),
            services: ServicesConfig::default(),
        }
    }
}
