/// Error kinds surfaced by the interface, the stack and its sockets.
///
/// `ConfigError` and `StackError` abort `Interface::init`. `DeviceError`
/// (see [`crate::device`]) is only ever counted. `EndpointError` stays local
/// to the socket request that produced it.
use core::fmt;

use crate::device::DeviceError;
use crate::stack::NicId;

/// Malformed address configuration. The caller must fix the input and retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigError {
    /// The CIDR string is not `a.b.c.d/len`.
    InvalidAddress,
    /// The prefix length is missing or larger than 32.
    InvalidPrefix,
    /// The address parsed, but it is not IPv4.
    NotIpv4,
    /// The MAC string is not six hex octets.
    InvalidMac,
    /// The MAC is a group (multicast or broadcast) address.
    MulticastMac,
    /// The gateway string is not an IPv4 address.
    InvalidGateway,
    /// The random source could not produce a MAC address.
    EntropyUnavailable,
}

impl ConfigError {
    /// Name of the configuration field the error refers to.
    pub fn field(&self) -> &'static str {
        match self {
            ConfigError::InvalidAddress | ConfigError::InvalidPrefix | ConfigError::NotIpv4 => {
                "address"
            }
            ConfigError::InvalidMac | ConfigError::MulticastMac | ConfigError::EntropyUnavailable => {
                "mac"
            }
            ConfigError::InvalidGateway => "gateway",
        }
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self {
            ConfigError::InvalidAddress => "not a CIDR address",
            ConfigError::InvalidPrefix => "invalid prefix length",
            ConfigError::NotIpv4 => "not an IPv4 address",
            ConfigError::InvalidMac => "not a MAC address",
            ConfigError::MulticastMac => "not a unicast MAC address",
            ConfigError::InvalidGateway => "not an IPv4 address",
            ConfigError::EntropyUnavailable => "random source unavailable",
        };
        write!(f, "invalid {}: {}", self.field(), reason)
    }
}

impl core::error::Error for ConfigError {}

/// NIC, address or route registration failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StackError {
    UnknownNic(NicId),
    DuplicateNic(NicId),
    /// The interface already runs a NIC for a different device.
    AlreadyInitialized(NicId),
    /// A protocol the link needs is disabled in the stack options.
    ProtocolUnavailable(&'static str),
    AddressTableFull(NicId),
    NoAddress(NicId),
    RouteTableFull(NicId),
    /// NIC id 0 is reserved.
    InvalidNicId,
}

impl fmt::Display for StackError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StackError::UnknownNic(id) => write!(f, "unknown NIC {}", id),
            StackError::DuplicateNic(id) => write!(f, "NIC {} already exists", id),
            StackError::AlreadyInitialized(id) => {
                write!(f, "NIC {} already attached to another device", id)
            }
            StackError::ProtocolUnavailable(name) => write!(f, "protocol {} not enabled", name),
            StackError::AddressTableFull(id) => write!(f, "address table of NIC {} is full", id),
            StackError::NoAddress(id) => write!(f, "NIC {} has no address", id),
            StackError::RouteTableFull(id) => write!(f, "route table of NIC {} is full", id),
            StackError::InvalidNicId => write!(f, "invalid NIC id"),
        }
    }
}

impl core::error::Error for StackError {}

/// Per-socket failure: bind, connect, listen, accept or I/O.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointError {
    /// The host part of an address is not an IPv4 literal.
    InvalidAddress,
    InvalidPort,
    UnsupportedNetwork,
    UnsupportedProtocol,
    NoRoute,
    /// The local address is not assigned to the NIC, or no address is.
    AddressNotAvailable,
    AddressInUse,
    InvalidState,
    ConnectionRefused,
    ConnectionReset,
    Timeout,
    Canceled,
    Closed,
    BufferFull,
    Unaddressable,
}

impl fmt::Display for EndpointError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EndpointError::InvalidAddress => write!(f, "invalid address"),
            EndpointError::InvalidPort => write!(f, "invalid port"),
            EndpointError::UnsupportedNetwork => write!(f, "unsupported network"),
            EndpointError::UnsupportedProtocol => write!(f, "unsupported protocol"),
            EndpointError::NoRoute => write!(f, "no route to host"),
            EndpointError::AddressNotAvailable => write!(f, "address not available"),
            EndpointError::AddressInUse => write!(f, "address in use"),
            EndpointError::InvalidState => write!(f, "endpoint in invalid state"),
            EndpointError::ConnectionRefused => write!(f, "connection refused"),
            EndpointError::ConnectionReset => write!(f, "connection reset"),
            EndpointError::Timeout => write!(f, "operation timed out"),
            EndpointError::Canceled => write!(f, "operation canceled"),
            EndpointError::Closed => write!(f, "endpoint closed"),
            EndpointError::BufferFull => write!(f, "buffer full"),
            EndpointError::Unaddressable => write!(f, "destination unaddressable"),
        }
    }
}

impl core::error::Error for EndpointError {}

impl embedded_io::Error for EndpointError {
    fn kind(&self) -> embedded_io::ErrorKind {
        use embedded_io::ErrorKind;
        match self {
            EndpointError::InvalidAddress | EndpointError::InvalidPort => ErrorKind::InvalidInput,
            EndpointError::UnsupportedNetwork | EndpointError::UnsupportedProtocol => {
                ErrorKind::Unsupported
            }
            EndpointError::NoRoute | EndpointError::Unaddressable => ErrorKind::NotConnected,
            EndpointError::AddressNotAvailable => ErrorKind::AddrNotAvailable,
            EndpointError::AddressInUse => ErrorKind::AddrInUse,
            EndpointError::InvalidState => ErrorKind::InvalidInput,
            EndpointError::ConnectionRefused => ErrorKind::ConnectionRefused,
            EndpointError::ConnectionReset => ErrorKind::ConnectionReset,
            EndpointError::Timeout => ErrorKind::TimedOut,
            EndpointError::Canceled => ErrorKind::Interrupted,
            EndpointError::Closed => ErrorKind::BrokenPipe,
            EndpointError::BufferFull => ErrorKind::OutOfMemory,
        }
    }
}

/// Top-level error returned by [`crate::Interface`] operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetError {
    Config(ConfigError),
    /// A stack operation failed; `op` names it.
    Stack { op: &'static str, err: StackError },
    Device(DeviceError),
    Endpoint(EndpointError),
}

impl NetError {
    pub(crate) fn stack(op: &'static str) -> impl FnOnce(StackError) -> NetError {
        move |err| NetError::Stack { op, err }
    }
}

impl fmt::Display for NetError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NetError::Config(e) => write!(f, "config error: {}", e),
            NetError::Stack { op, err } => write!(f, "stack error ({}): {}", op, err),
            NetError::Device(e) => write!(f, "device error: {}", e),
            NetError::Endpoint(e) => write!(f, "endpoint error: {}", e),
        }
    }
}

impl core::error::Error for NetError {}

impl From<ConfigError> for NetError {
    fn from(e: ConfigError) -> Self {
        NetError::Config(e)
    }
}

impl From<DeviceError> for NetError {
    fn from(e: DeviceError) -> Self {
        NetError::Device(e)
    }
}

impl From<EndpointError> for NetError {
    fn from(e: EndpointError) -> Self {
        NetError::Endpoint(e)
    }
}
