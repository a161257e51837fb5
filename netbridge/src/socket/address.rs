/// Network names and "host:port" strings as handed in by the host runtime.
use core::net::Ipv4Addr;
use core::str::FromStr;

use crate::config::to_wire;
use crate::error::EndpointError;
use crate::stack::{FullAddress, TransportProtocol};

/// Socket network family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Network {
    Tcp,
    Udp,
    Icmp,
}

impl Network {
    /// Parse a network name: `tcp`, `tcp4`, `udp`, `udp4`, `icmp`,
    /// `ip4:icmp` or `ip4:1`. IPv6 networks are not supported.
    pub fn parse(s: &str) -> Result<Self, EndpointError> {
        match s {
            "tcp" | "tcp4" => Ok(Network::Tcp),
            "udp" | "udp4" => Ok(Network::Udp),
            "icmp" | "ip4:icmp" | "ip4:1" => Ok(Network::Icmp),
            _ => Err(EndpointError::UnsupportedNetwork),
        }
    }

    pub fn transport(&self) -> TransportProtocol {
        match self {
            Network::Tcp => TransportProtocol::Tcp,
            Network::Udp => TransportProtocol::Udp,
            Network::Icmp => TransportProtocol::Icmpv4,
        }
    }

    /// Whether sockets of this network carry a byte stream.
    pub fn is_stream(&self) -> bool {
        matches!(self, Network::Tcp)
    }
}

impl FullAddress {
    /// Parse `"host:port"`, `"host"` or `":port"`. A missing host is the
    /// unspecified address, a missing port is 0.
    pub fn parse(s: &str) -> Result<Self, EndpointError> {
        let (host, port) = match s.rsplit_once(':') {
            Some((host, port)) => (host, port),
            None => (s, ""),
        };

        let addr = if host.is_empty() {
            Ipv4Addr::UNSPECIFIED
        } else {
            Ipv4Addr::from_str(host).map_err(|_| EndpointError::InvalidAddress)?
        };

        let port = if port.is_empty() {
            0
        } else if port.bytes().all(|b| b.is_ascii_digit()) {
            port.parse::<u16>().map_err(|_| EndpointError::InvalidPort)?
        } else {
            return Err(EndpointError::InvalidPort);
        };

        Ok(FullAddress::new(to_wire(addr), port))
    }
}
