//! Network interface lookup.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddrV4, SocketAddrV6};

use nix::ifaddrs::getifaddrs;
use serde::Serialize;

use super::DiscoveryError;

/// One global unicast address of an interface
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NetworkInfo {
    pub interface: String,
    pub address: IpAddr,
    pub prefix_len: u8,
}

/// First IPv4 address assigned to `name`
pub fn interface_ipv4(name: &str) -> Result<Ipv4Addr, DiscoveryError> {
    let addrs = getifaddrs().map_err(|e| DiscoveryError::Interface {
        name: name.to_string(),
        reason: e.to_string(),
    })?;

    let mut seen = false;
    for ifaddr in addrs {
        if ifaddr.interface_name != name {
            continue;
        }
        seen = true;

        if let Some(sin) = ifaddr.address.as_ref().and_then(|a| a.as_sockaddr_in()) {
            return Ok(*SocketAddrV4::from(*sin).ip());
        }
    }

    let reason = if seen {
        "no IPv4 address assigned"
    } else {
        "no such network interface"
    };

    Err(DiscoveryError::Interface {
        name: name.to_string(),
        reason: reason.to_string(),
    })
}

/// Global unicast addresses of every interface, in kernel order
pub fn network_info() -> Result<Vec<NetworkInfo>, DiscoveryError> {
    let addrs = getifaddrs().map_err(|e| DiscoveryError::Interface {
        name: "*".to_string(),
        reason: e.to_string(),
    })?;

    let mut infos = Vec::new();
    for ifaddr in addrs {
        let Some(address) = ifaddr.address.as_ref() else {
            continue;
        };

        if let Some(sin) = address.as_sockaddr_in() {
            let ip = *SocketAddrV4::from(*sin).ip();
            if !is_global_v4(&ip) {
                continue;
            }

            let prefix_len = ifaddr
                .netmask
                .as_ref()
                .and_then(|m| m.as_sockaddr_in())
                .map(|m| u32::from(*SocketAddrV4::from(*m).ip()).count_ones() as u8)
                .unwrap_or(32);

            infos.push(NetworkInfo {
                interface: ifaddr.interface_name.clone(),
                address: IpAddr::V4(ip),
                prefix_len,
            });
        } else if let Some(sin6) = address.as_sockaddr_in6() {
            let ip = *SocketAddrV6::from(*sin6).ip();
            if !is_global_v6(&ip) {
                continue;
            }

            let prefix_len = ifaddr
                .netmask
                .as_ref()
                .and_then(|m| m.as_sockaddr_in6())
                .map(|m| u128::from(*SocketAddrV6::from(*m).ip()).count_ones() as u8)
                .unwrap_or(128);

            infos.push(NetworkInfo {
                interface: ifaddr.interface_name.clone(),
                address: IpAddr::V6(ip),
                prefix_len,
            });
        }
    }

    Ok(infos)
}

fn is_global_v4(ip: &Ipv4Addr) -> bool {
    !(ip.is_loopback()
        || ip.is_link_local()
        || ip.is_unspecified()
        || ip.is_multicast()
        || ip.is_broadcast())
}

fn is_global_v6(ip: &Ipv6Addr) -> bool {
    let link_local = (ip.segments()[0] & 0xffc0) == 0xfe80;
    !(ip.is_loopback() || ip.is_unspecified() || ip.is_multicast() || link_local)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_global_unicast_filter() {
        assert!(is_global_v4(&"10.0.0.5".parse().unwrap()));
        assert!(!is_global_v4(&Ipv4Addr::LOCALHOST));
        assert!(!is_global_v4(&"169.254.1.1".parse().unwrap()));
        assert!(!is_global_v4(&"239.100.100.100".parse().unwrap()));

        assert!(is_global_v6(&"fd42:c4cc:2e1d:132d::1".parse().unwrap()));
        assert!(!is_global_v6(&"fe80::1".parse().unwrap()));
        assert!(!is_global_v6(&Ipv6Addr::LOCALHOST));
    }

    #[test]
    fn test_unknown_interface() {
        let err = interface_ipv4("invalid-interface").unwrap_err();
        assert_eq!(
            err.to_string(),
            r#"Failed to resolve lookup interface "invalid-interface": no such network interface"#
        );
    }

    #[test]
    fn test_loopback_has_ipv4() {
        assert_eq!(interface_ipv4("lo").unwrap(), Ipv4Addr::LOCALHOST);
    }
}
