//! Multicast peer discovery (UDP)
//!
//! A responder joins the discovery group on one interface and answers
//! every query of its own protocol version with its [`ServerInfo`],
//! unicast back to the sender. A locator sends a version-only query to
//! the group once per second and takes the first reply.
//!
//! ```text
//! joiner ──{"version":"1.0"}──► 239.100.100.100:9444 ──► initiator
//! joiner ◄──────────── unicast ServerInfo ───────────────  initiator
//! ```

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Mutex;
use std::time::Duration;

use socket2::{Domain, Protocol, Socket, Type};
use thiserror::Error;
use tokio::net::UdpSocket;

use conclave_common::ServerInfo;
use conclave_common::constants::{DATAGRAM_SIZE, MULTICAST_GROUP, timeouts};

use crate::context::{Cause, Context};

mod interfaces;

pub use interfaces::{NetworkInfo, interface_ipv4, network_info};

#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("Failed to resolve lookup interface {name:?}: {reason}")]
    Interface { name: String, reason: String },

    #[error("Failed to prepare multicast socket: {0}")]
    Socket(#[source] std::io::Error),

    #[error("Failed to read from multicast network endpoint: {0}")]
    Cancelled(Cause),

    #[error("Failed to read from multicast network endpoint: {0}")]
    Read(#[source] std::io::Error),

    #[error("Failed to parse multicast response: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("System {name:?} (version {version:?}) has a version mismatch: Expected {expected:?}")]
    VersionMismatch {
        name: String,
        version: String,
        expected: String,
    },

    #[error("Server info of {size} bytes does not fit in one discovery datagram")]
    PayloadTooLarge { size: usize },
}

/// Discovery on one interface, group, and port
pub struct Discovery {
    interface: String,
    group: Ipv4Addr,
    port: u16,
    responder: Mutex<Option<Context>>,
}

impl Discovery {
    pub fn new(interface: impl Into<String>, port: u16) -> Self {
        Self {
            interface: interface.into(),
            group: MULTICAST_GROUP,
            port,
            responder: Mutex::new(None),
        }
    }

    pub fn interface(&self) -> &str {
        &self.interface
    }

    /// Answer queries for `info.version` until `ctx` is cancelled or
    /// [`Discovery::stop_responder`] is called. Returns once the socket
    /// has joined the group.
    pub async fn respond(&self, ctx: &Context, info: ServerInfo) -> Result<(), DiscoveryError> {
        let reply = serde_json::to_vec(&info)?;
        if reply.len() > DATAGRAM_SIZE {
            return Err(DiscoveryError::PayloadTooLarge { size: reply.len() });
        }

        let iface_addr = interface_ipv4(&self.interface)?;
        let listener = multicast_listener(self.group, self.port, iface_addr)?;
        let sender = UdpSocket::bind(SocketAddrV4::new(iface_addr, 0))
            .await
            .map_err(DiscoveryError::Socket)?;

        let ctx = ctx.child();
        if let Ok(mut slot) = self.responder.lock() {
            if let Some(previous) = slot.replace(ctx.clone()) {
                previous.cancel("Responder replaced");
            }
        }

        tracing::info!(
            interface = %self.interface,
            group = %self.group,
            port = self.port,
            name = %info.name,
            "📡 Multicast responder started"
        );

        tokio::spawn(async move {
            let mut buf = vec![0u8; DATAGRAM_SIZE];
            loop {
                tokio::select! {
                    _ = ctx.cancelled() => break,
                    result = listener.recv_from(&mut buf) => {
                        let (len, from) = match result {
                            Ok(received) => received,
                            Err(e) => {
                                tracing::warn!(error = %e, "Multicast receive error");
                                continue;
                            }
                        };

                        if !handle_query(&buf[..len], from, &info.version) {
                            continue;
                        }

                        if let Err(e) = sender.send_to(&reply, from).await {
                            tracing::warn!(peer = %from, error = %e, "Failed to answer multicast query");
                        }
                    }
                }
            }

            tracing::info!("📡 Multicast responder stopped");
        });

        Ok(())
    }

    /// Shut the responder down. Safe to call when none is running.
    pub fn stop_responder(&self) {
        let running = self.responder.lock().ok().and_then(|mut slot| slot.take());
        if let Some(ctx) = running {
            ctx.cancel("Responder stopped");
        }
    }

    /// Find a peer speaking `version`. Fails with the cause of `ctx` if it
    /// is cancelled first.
    pub async fn lookup(&self, ctx: &Context, version: &str) -> Result<ServerInfo, DiscoveryError> {
        let iface_addr = interface_ipv4(&self.interface)?;
        let socket = query_socket(iface_addr)?;
        let query = serde_json::to_vec(&ServerInfo::query(version))?;
        let target = SocketAddrV4::new(self.group, self.port);

        let mut resend = tokio::time::interval(Duration::from_secs(timeouts::MULTICAST_RESEND_SECS));
        let mut buf = vec![0u8; DATAGRAM_SIZE];

        tracing::debug!(interface = %self.interface, version, "🔎 Looking up peers");

        loop {
            tokio::select! {
                cause = ctx.done() => return Err(DiscoveryError::Cancelled(cause)),
                _ = resend.tick() => {
                    if let Err(e) = socket.send_to(&query, target).await {
                        tracing::warn!(error = %e, "Failed to send multicast query");
                    }
                }
                result = socket.recv_from(&mut buf) => {
                    let (len, from) = result.map_err(DiscoveryError::Read)?;
                    let info = parse_reply(&buf[..len], version)?;
                    tracing::info!(peer = %from, name = %info.name, "🔎 Found peer");
                    return Ok(info);
                }
            }
        }
    }
}

impl Drop for Discovery {
    fn drop(&mut self) {
        self.stop_responder();
    }
}

/// Whether a query datagram deserves a reply
fn handle_query(data: &[u8], from: SocketAddr, version: &str) -> bool {
    let query: ServerInfo = match serde_json::from_slice(data) {
        Ok(q) => q,
        Err(e) => {
            tracing::warn!(peer = %from, error = %e, "Invalid multicast query");
            return false;
        }
    };

    if query.version != version {
        tracing::warn!(
            peer = %from,
            version = %query.version,
            "Ignoring multicast query for another version"
        );
        return false;
    }

    true
}

/// Decode a reply and check its version
fn parse_reply(data: &[u8], version: &str) -> Result<ServerInfo, DiscoveryError> {
    let info: ServerInfo = serde_json::from_slice(data)?;
    if info.version != version {
        return Err(DiscoveryError::VersionMismatch {
            name: info.name,
            version: info.version,
            expected: version.to_string(),
        });
    }

    Ok(info)
}

/// Socket bound to the group address so only group traffic is delivered
fn multicast_listener(group: Ipv4Addr, port: u16, iface_addr: Ipv4Addr) -> Result<UdpSocket, DiscoveryError> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP)).map_err(DiscoveryError::Socket)?;
    socket.set_reuse_address(true).map_err(DiscoveryError::Socket)?;
    socket.set_nonblocking(true).map_err(DiscoveryError::Socket)?;
    socket
        .bind(&SocketAddrV4::new(group, port).into())
        .map_err(DiscoveryError::Socket)?;
    socket
        .join_multicast_v4(&group, &iface_addr)
        .map_err(DiscoveryError::Socket)?;

    UdpSocket::from_std(socket.into()).map_err(DiscoveryError::Socket)
}

/// Socket that sends queries out of `iface_addr` and receives unicast replies
fn query_socket(iface_addr: Ipv4Addr) -> Result<UdpSocket, DiscoveryError> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP)).map_err(DiscoveryError::Socket)?;
    socket.set_nonblocking(true).map_err(DiscoveryError::Socket)?;
    socket
        .set_multicast_if_v4(&iface_addr)
        .map_err(DiscoveryError::Socket)?;
    socket.set_multicast_loop_v4(true).map_err(DiscoveryError::Socket)?;
    socket
        .bind(&SocketAddrV4::new(iface_addr, 0).into())
        .map_err(DiscoveryError::Socket)?;

    UdpSocket::from_std(socket.into()).map_err(DiscoveryError::Socket)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer() -> SocketAddr {
        "10.0.0.2:40000".parse().unwrap()
    }

    #[test]
    fn test_query_with_matching_version_is_answered() {
        assert!(handle_query(br#"{"version":"2.0"}"#, peer(), "2.0"));
        assert!(!handle_query(br#"{"version":"3.0"}"#, peer(), "2.0"));
        assert!(!handle_query(b"not json", peer(), "2.0"));
    }

    #[test]
    fn test_reply_version_must_match() {
        let reply = br#"{"version":"2.0","name":"foo","address":"1.2.3.4"}"#;

        let info = parse_reply(reply, "2.0").unwrap();
        assert_eq!(info.name, "foo");
        assert_eq!(info.address, "1.2.3.4");

        let err = parse_reply(reply, "3.0").unwrap_err();
        assert_eq!(
            err.to_string(),
            r#"System "foo" (version "2.0") has a version mismatch: Expected "3.0""#
        );

        assert!(matches!(parse_reply(b"{", "2.0"), Err(DiscoveryError::Parse(_))));
    }

    #[tokio::test]
    async fn test_oversized_server_info_is_rejected() {
        let discovery = Discovery::new("lo", 19444);
        let info = ServerInfo {
            version: "2.0".to_string(),
            name: "a".repeat(DATAGRAM_SIZE),
            ..Default::default()
        };

        let err = discovery.respond(&Context::new(), info).await.unwrap_err();
        assert!(matches!(err, DiscoveryError::PayloadTooLarge { .. }));
    }

    #[tokio::test]
    async fn test_lookup_reports_cancel_cause() {
        let discovery = Discovery::new("lo", 19445);
        let ctx = Context::new().with_timeout(Duration::from_millis(50), "Timeout exceeded");

        let err = discovery.lookup(&ctx, "2.0").await.unwrap_err();
        assert_eq!(
            err.to_string(),
            "Failed to read from multicast network endpoint: Timeout exceeded"
        );
    }

    // Needs multicast routing on the loopback interface.
    #[tokio::test]
    #[ignore]
    async fn test_loopback_round_trip() {
        let responder = Discovery::new("lo", 19446);
        let info = ServerInfo {
            version: "2.0".to_string(),
            name: "foo".to_string(),
            address: "1.2.3.4".to_string(),
            ..Default::default()
        };
        responder.respond(&Context::new(), info.clone()).await.unwrap();

        let locator = Discovery::new("lo", 19446);
        let ctx = Context::new().with_timeout(Duration::from_secs(5), "Timeout exceeded");
        assert_eq!(locator.lookup(&ctx, "2.0").await.unwrap(), info);

        let ctx = Context::new().with_timeout(Duration::from_millis(1500), "Timeout exceeded");
        assert!(locator.lookup(&ctx, "3.0").await.is_err());

        responder.stop_responder();
        responder.stop_responder();
    }
}
