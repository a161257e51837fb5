//! TCP/IP connectivity for bare-metal runtimes through a generic
//! [`NetworkDevice`].
//!
//! Architecture:
//!   NetworkDevice driver (raw Ethernet frames)
//!       ↓ FrameSink::deliver        ↑ LinkBridge::pump_outbound
//!   LinkChannel (bounded queues, implements smoltcp::phy::Device)
//!       ↓ ↑
//!   Stack (smoltcp Interface per NIC: ARP, IPv4, TCP, UDP, ICMP)
//!       ↓ ↑
//!   SocketProvider (dial / listen / bind → Socket, Listener)
//!
//! The TCP/IP protocol logic itself is smoltcp's; this crate is the glue.
#![no_std]

extern crate alloc;

pub mod config;
pub mod device;
pub mod error;
pub mod interface;
pub mod link;
#[cfg(any(test, feature = "mock"))]
pub mod mock;
pub mod ops;
pub mod socket;
pub mod stack;

pub use config::{AddressConfig, StackOptions};
pub use device::{DeviceError, FrameSink, NetworkDevice};
pub use error::{ConfigError, EndpointError, NetError, StackError};
pub use interface::Interface;
pub use link::{LinkBridge, LinkCapabilities, LinkChannel, LinkStats};
pub use ops::NetOps;
pub use socket::{
    CancelToken, Connecting, DialOptions, FullAddress, Listener, Network, Socket, SocketFactory,
    SocketProvider,
};
pub use stack::{
    Endpoint, NetworkProtocol, NetworkProtocols, NicId, ProtocolAddress, Route, RouteTable, Stack,
    TransportProtocol, TransportProtocols,
};

/// Ethernet Maximum Transmission Unit, in bytes, including the link header.
pub const DEFAULT_MTU: usize = 1518;

/// NIC identifier used when an [`Interface`] is created without one.
pub const DEFAULT_NIC_ID: NicId = 1;

/// Capacity of each link queue, in frames.
pub const DEFAULT_QUEUE_DEPTH: usize = 256;

static_assertions::const_assert!(DEFAULT_MTU >= 1514);
static_assertions::const_assert!(DEFAULT_QUEUE_DEPTH > 0);
static_assertions::const_assert!(DEFAULT_NIC_ID != 0);
