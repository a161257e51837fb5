/// Address configuration and stack options.
///
/// `AddressConfig` turns the three strings handed to `Interface::init`
/// (CIDR address, MAC, gateway) into typed values, or a [`ConfigError`]
/// naming the bad field. Nothing here touches a stack.
use core::net::{IpAddr, Ipv4Addr};
use core::str::FromStr;

use rand_core::{CryptoRng, RngCore};
use smoltcp::wire::{EthernetAddress, Ipv4Address, Ipv4Cidr};

use crate::error::ConfigError;
use crate::stack::{NetworkProtocols, TransportProtocols};

/// Validated interface addressing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressConfig {
    /// Link-layer address of the NIC.
    pub mac: EthernetAddress,
    /// Interface address with its prefix length (host bits kept).
    pub ip: Ipv4Cidr,
    /// Default gateway. `None` when the gateway string was empty.
    pub gateway: Option<Ipv4Address>,
}

impl AddressConfig {
    /// Parse `addr` ("10.0.0.1/24"), `mac` ("02:00:00:00:00:01", or empty
    /// for a random one drawn from `rng`) and `gateway` ("10.0.0.2", or
    /// empty for no default route).
    pub fn parse<R>(addr: &str, mac: &str, gateway: &str, rng: &mut R) -> Result<Self, ConfigError>
    where
        R: RngCore + CryptoRng,
    {
        let ip = parse_cidr(addr)?;
        let mac = if mac.is_empty() {
            random_mac(rng)?
        } else {
            parse_mac(mac)?
        };
        let gateway = if gateway.is_empty() {
            None
        } else {
            Some(parse_gateway(gateway)?)
        };

        Ok(Self { mac, ip, gateway })
    }

    /// Subnet the interface address belongs to (host bits cleared).
    pub fn subnet(&self) -> Ipv4Cidr {
        self.ip.network()
    }
}

/// Parse an IPv4 CIDR address. The prefix length is mandatory.
pub fn parse_cidr(s: &str) -> Result<Ipv4Cidr, ConfigError> {
    let (ip, prefix) = s.split_once('/').ok_or(ConfigError::InvalidAddress)?;
    let ip = parse_ipv4(ip).map_err(|e| match e {
        ConfigError::NotIpv4 => ConfigError::NotIpv4,
        _ => ConfigError::InvalidAddress,
    })?;

    if prefix.is_empty() || !prefix.bytes().all(|b| b.is_ascii_digit()) {
        return Err(ConfigError::InvalidPrefix);
    }
    let prefix: u8 = prefix.parse().map_err(|_| ConfigError::InvalidPrefix)?;
    if prefix > 32 {
        return Err(ConfigError::InvalidPrefix);
    }

    Ok(Ipv4Cidr::new(ip, prefix))
}

/// Parse a gateway address.
pub fn parse_gateway(s: &str) -> Result<Ipv4Address, ConfigError> {
    parse_ipv4(s).map_err(|_| ConfigError::InvalidGateway)
}

/// Parse a MAC address written as six hex octets separated by `:` or `-`.
/// The address must be unicast.
pub fn parse_mac(s: &str) -> Result<EthernetAddress, ConfigError> {
    let mac = EthernetAddress::from_str(s).map_err(|_| ConfigError::InvalidMac)?;
    if !mac.is_unicast() {
        return Err(ConfigError::MulticastMac);
    }
    Ok(mac)
}

/// Draw a random unicast, locally administered MAC address.
pub fn random_mac<R>(rng: &mut R) -> Result<EthernetAddress, ConfigError>
where
    R: RngCore + CryptoRng,
{
    let mut octets = [0u8; 6];
    rng.try_fill_bytes(&mut octets)
        .map_err(|_| ConfigError::EntropyUnavailable)?;

    // unicast, locally administered
    octets[0] &= 0xfe;
    octets[0] |= 0x02;

    Ok(EthernetAddress(octets))
}

fn parse_ipv4(s: &str) -> Result<Ipv4Address, ConfigError> {
    match IpAddr::from_str(s) {
        Ok(IpAddr::V4(ip)) => Ok(to_wire(ip)),
        Ok(IpAddr::V6(_)) => Err(ConfigError::NotIpv4),
        Err(_) => Err(ConfigError::InvalidAddress),
    }
}

pub(crate) fn to_wire(ip: Ipv4Addr) -> Ipv4Address {
    Ipv4Address::from_bytes(&ip.octets())
}

/// Stack-wide settings, fixed when the stack is created.
#[derive(Debug, Clone)]
pub struct StackOptions {
    /// Largest frame accepted or emitted on a link, link header included.
    pub mtu: usize,
    /// Capacity of each link queue, in frames.
    pub queue_depth: usize,
    pub network_protocols: NetworkProtocols,
    pub transport_protocols: TransportProtocols,
    pub tcp_rx_buffer: usize,
    pub tcp_tx_buffer: usize,
    /// Datagrams buffered per UDP or ICMP endpoint, in each direction.
    pub packet_slots: usize,
    /// Payload bytes buffered per UDP or ICMP endpoint, in each direction.
    pub packet_buffer: usize,
    /// Default connect deadline.
    pub connect_timeout_ms: u64,
    /// Default read/write deadline on sockets. `None` blocks forever.
    pub io_timeout_ms: Option<u64>,
    /// First port handed out for unbound endpoints.
    pub ephemeral_start: u16,
    /// Last port handed out for unbound endpoints.
    pub ephemeral_end: u16,
    /// Echo identifier the interface ICMP endpoint binds to.
    pub icmp_ident: u16,
}

impl Default for StackOptions {
    fn default() -> Self {
        Self {
            mtu: crate::DEFAULT_MTU,
            queue_depth: crate::DEFAULT_QUEUE_DEPTH,
            network_protocols: NetworkProtocols::IPV4 | NetworkProtocols::ARP,
            transport_protocols: TransportProtocols::TCP
                | TransportProtocols::ICMPV4
                | TransportProtocols::UDP,
            tcp_rx_buffer: 65536,
            tcp_tx_buffer: 65536,
            packet_slots: 16,
            packet_buffer: 8192,
            connect_timeout_ms: 30_000,
            io_timeout_ms: Some(30_000),
            ephemeral_start: 49152,
            ephemeral_end: 65535,
            icmp_ident: 0x6e62,
        }
    }
}
