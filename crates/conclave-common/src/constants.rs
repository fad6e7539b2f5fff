//! Shared constants for Conclave components.

use std::net::Ipv4Addr;

/// Protocol version advertised over multicast and in join intents
pub const PROTOCOL_VERSION: &str = "1.0";

/// Default peer-facing HTTP listen address
pub const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:9443";

/// Default local control socket (CLI <-> daemon websocket)
pub const DEFAULT_CONTROL_ADDR: &str = "127.0.0.1:9440";

/// Default state directory (certificates)
pub const DEFAULT_STATE_DIR: &str = "/var/lib/conclave";

/// Organization-local multicast group used for discovery
pub const MULTICAST_GROUP: Ipv4Addr = Ipv4Addr::new(239, 100, 100, 100);

/// Multicast discovery port
pub const MULTICAST_PORT: u16 = 9444;

/// Largest discovery datagram (576 byte reassembly floor minus IP/UDP headers, rounded down)
pub const DATAGRAM_SIZE: usize = 500;

/// Number of words drawn for a generated passphrase
pub const PASSPHRASE_WORDS: usize = 4;

/// Failed join attempts tolerated before a session is torn down
pub const MAX_FAILED_ATTEMPTS: u32 = 50;

/// Characters of a fingerprint shown to operators
pub const SHORT_FINGERPRINT_LEN: usize = 12;

/// Scheme used in the session `Authorization` header
pub const HMAC_VERSION: &str = "Conclave-1.0";

/// Timeouts and cadences (seconds unless noted)
pub mod timeouts {
    /// Remote token issuance and join requests
    pub const REMOTE_REQUEST_SECS: u64 = 300;

    /// Joining a service on the local host
    pub const LOCAL_JOIN_SECS: u64 = 60;

    /// Per-peer membership convergence ceiling
    pub const CONVERGENCE_SECS: u64 = 30;

    /// Membership poll interval while waiting for convergence (milliseconds)
    pub const CONVERGENCE_POLL_MS: u64 = 500;

    /// Multicast query resend cadence
    pub const MULTICAST_RESEND_SECS: u64 = 1;

    /// How long a published join intent waits for a consumer
    pub const INTENT_CONSUMER_SECS: u64 = 10;

    /// Delay applied to every join intent request (milliseconds)
    pub const JOIN_INTENT_DELAY_MS: u64 = 100;

    /// Default session lifetime
    pub const SESSION_DEFAULT_SECS: u64 = 600;

    /// Longest session lifetime a caller may request
    pub const SESSION_MAX_SECS: u64 = 3600;

    /// Default joiner lookup timeout
    pub const LOOKUP_DEFAULT_SECS: u64 = 60;
}

/// Default control ports of each clustered service
pub mod ports {
    pub const ORCHESTRATOR: u16 = 9443;
    pub const COMPUTE: u16 = 8443;
    pub const STORAGE: u16 = 7443;
    pub const NETWORK: u16 = 6443;
}

