//! Core wire types shared across Conclave components.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::constants::ports;

/// One of the coordinated sub-systems clustered together.
///
/// The orchestrator is always formed first; compute always joins last
/// because it consumes storage and network configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceType {
    /// Conclave itself
    Orchestrator,
    /// Hypervisor / container manager
    Compute,
    /// Block-storage daemon
    Storage,
    /// Software-defined-network daemon
    Network,
}

impl ServiceType {
    pub const ALL: [ServiceType; 4] = [
        ServiceType::Orchestrator,
        ServiceType::Compute,
        ServiceType::Storage,
        ServiceType::Network,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Orchestrator => "orchestrator",
            Self::Compute => "compute",
            Self::Storage => "storage",
            Self::Network => "network",
        }
    }

    /// Default control port of this service
    pub fn default_port(&self) -> u16 {
        match self {
            Self::Orchestrator => ports::ORCHESTRATOR,
            Self::Compute => ports::COMPUTE,
            Self::Storage => ports::STORAGE,
            Self::Network => ports::NETWORK,
        }
    }
}

impl fmt::Display for ServiceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ServiceType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "orchestrator" => Ok(Self::Orchestrator),
            "compute" => Ok(Self::Compute),
            "storage" => Ok(Self::Storage),
            "network" => Ok(Self::Network),
            other => Err(format!("Unknown service type {other:?}")),
        }
    }
}

/// Role a host plays in a trust session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionRole {
    Initiating,
    Joining,
}

impl SessionRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Initiating => "initiating",
            Self::Joining => "joining",
        }
    }
}

impl fmt::Display for SessionRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SessionRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "initiating" => Ok(Self::Initiating),
            "joining" => Ok(Self::Joining),
            other => Err(format!("Unknown session role {other:?}")),
        }
    }
}

/// Identity of one candidate host.
///
/// Also the multicast payload: a discovery query carries only `version`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerInfo {
    pub version: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub address: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub services: Vec<ServiceType>,

    /// PEM certificate, present once the peer was approved through a session
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub certificate: Option<String>,
}

impl ServerInfo {
    /// A discovery query for peers speaking `version`
    pub fn query(version: &str) -> Self {
        Self {
            version: version.to_string(),
            ..Default::default()
        }
    }
}

/// A joiner's certificate-bound declaration of wanting to join
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinIntent {
    pub name: String,
    pub version: String,
    pub address: String,
    /// PEM encoded server certificate of the sender
    pub certificate: String,
    #[serde(default)]
    pub services: Vec<ServiceType>,
}

/// Frame exchanged between the CLI and the daemon during a session.
///
/// Every field is optional on the wire; each step of the conversation
/// fills only what it needs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Session {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub address: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub initiator_address: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub initiator_name: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub initiator_fingerprint: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub interface: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub passphrase: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub services: Vec<ServiceType>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub intent: Option<JoinIntent>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub confirmed_intents: Vec<JoinIntent>,

    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub accepted: bool,

    #[serde(default, skip_serializing_if = "is_zero")]
    pub lookup_timeout_secs: u64,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,
}

fn is_zero(v: &u64) -> bool {
    *v == 0
}

/// Graceful close envelope carried as an ordinary text frame.
///
/// Unknown fields are rejected so that application frames never decode
/// as a close.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ControlClose {
    pub control_message: String,
}

/// Body of `PUT /1.0/session/stop`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionStopPut {
    #[serde(default)]
    pub reason: String,
}

/// Body of `GET /1.0/session`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionStatus {
    pub active: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<SessionRole>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

/// Join token for one service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceToken {
    pub service: ServiceType,
    pub join_token: String,
}

/// Body of `PUT /1.0/services`: everything a peer needs to join
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServicesPut {
    #[serde(default)]
    pub tokens: Vec<ServiceToken>,
    /// Address the joining host should advertise
    pub address: String,
    /// PEM certificate of the orchestrator cluster, sent along with an
    /// orchestrator token when the issuer knows it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_certificate: Option<String>,
}

impl ServicesPut {
    pub fn token_for(&self, service: ServiceType) -> Option<&str> {
        self.tokens
            .iter()
            .find(|t| t.service == service)
            .map(|t| t.join_token.as_str())
    }
}

/// Body of `POST /1.0/services/{service}/tokens`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceTokensPost {
    pub cluster_address: String,
    pub joiner_name: String,
}

/// Response of `POST /1.0/services/{service}/tokens`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceTokenResponse {
    pub join_token: String,
}

/// A member of one service's cluster
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterMember {
    pub name: String,
    pub address: String,
}

/// Error body returned by every failing REST endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}
