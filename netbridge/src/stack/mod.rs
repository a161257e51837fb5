/// Shared TCP/IP stack built on smoltcp.
///
/// One [`Stack`] can serve several NICs. Each NIC is a smoltcp `Interface`
/// running over a [`LinkChannel`], with its own socket set. The stack keeps
/// its own ordered [`RouteTable`] to pick the NIC for a destination and
/// mirrors gateway routes into each smoltcp interface.
///
/// Every mutation (NICs, addresses, routes, endpoints) and every poll goes
/// through one lock, so route and address changes never interleave with
/// packet processing.
mod endpoint;
mod route;

pub use endpoint::{Endpoint, FullAddress};
pub(crate) use endpoint::ConnectState;
pub use route::{Route, RouteTable};

use alloc::collections::{BTreeMap, BTreeSet};
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;

use bitflags::bitflags;
use log::{debug, info};
use smoltcp::config::IFACE_MAX_ROUTE_COUNT;
use smoltcp::iface::{Config, Interface, SocketHandle, SocketSet};
use smoltcp::socket::{icmp, tcp, udp};
use smoltcp::time::Instant;
use smoltcp::wire::{EthernetAddress, HardwareAddress, IpAddress, IpCidr, Ipv4Address, Ipv4Cidr};
use spin::Mutex;

use crate::config::StackOptions;
use crate::error::{EndpointError, StackError};
use crate::link::{LinkChannel, LinkDevice, SharedBridge};
use crate::ops::NetOps;

/// Logical NIC identifier within a stack. 0 is reserved.
pub type NicId = u32;

/// Network-layer protocol an endpoint or address belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum NetworkProtocol {
    Ipv4,
}

/// Transport (or control) protocol of an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TransportProtocol {
    Tcp,
    Udp,
    Icmpv4,
}

impl TransportProtocol {
    /// IP protocol number.
    pub fn number(&self) -> u8 {
        match self {
            TransportProtocol::Tcp => 6,
            TransportProtocol::Udp => 17,
            TransportProtocol::Icmpv4 => 1,
        }
    }

    fn flag(&self) -> TransportProtocols {
        match self {
            TransportProtocol::Tcp => TransportProtocols::TCP,
            TransportProtocol::Udp => TransportProtocols::UDP,
            TransportProtocol::Icmpv4 => TransportProtocols::ICMPV4,
        }
    }
}

bitflags! {
    /// Network protocols a stack runs.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct NetworkProtocols: u8 {
        const IPV4 = 1 << 0;
        const ARP  = 1 << 1;
    }
}

bitflags! {
    /// Transport protocols a stack creates endpoints for.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct TransportProtocols: u8 {
        const TCP    = 1 << 0;
        const UDP    = 1 << 1;
        const ICMPV4 = 1 << 2;
    }
}

/// Address assigned to a NIC.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProtocolAddress {
    pub protocol: NetworkProtocol,
    pub address: Ipv4Cidr,
}

impl ProtocolAddress {
    pub fn ipv4(address: Ipv4Cidr) -> Self {
        Self {
            protocol: NetworkProtocol::Ipv4,
            address,
        }
    }
}

pub(crate) struct Nic {
    /// Distinguishes this NIC from earlier ones registered under the same id.
    pub(crate) epoch: u64,
    pub(crate) iface: Interface,
    pub(crate) device: LinkDevice,
    pub(crate) sockets: SocketSet<'static>,
}

impl Nic {
    pub(crate) fn has_address(&self, addr: &Ipv4Address) -> bool {
        self.iface
            .ip_addrs()
            .iter()
            .filter_map(ipv4_cidr)
            .any(|c| c.address() == *addr)
    }
}

struct StackInner {
    nics: BTreeMap<NicId, Nic>,
    routes: RouteTable,
    /// Bound ports (ICMP: echo identifiers), per NIC and protocol.
    ports: BTreeSet<(NicId, TransportProtocol, u16)>,
    next_port: u16,
    next_epoch: u64,
    /// Closed TCP endpoints still finishing their close handshake.
    closing: Vec<(NicId, SocketHandle)>,
}

struct Shared {
    options: StackOptions,
    ops: Arc<dyn NetOps>,
    inner: Mutex<StackInner>,
    /// Outbound pumps by NIC. Kept outside `inner` so a slow device
    /// transmit never holds up packet processing.
    bridges: Mutex<BTreeMap<NicId, SharedBridge>>,
}

/// Handle to a shared protocol stack. Clones refer to the same stack.
#[derive(Clone)]
pub struct Stack {
    shared: Arc<Shared>,
}

impl Stack {
    /// Create a stack with `options`; `ops` supplies time and yielding.
    pub fn new(options: StackOptions, ops: Arc<dyn NetOps>) -> Self {
        let next_port = options.ephemeral_start;
        Self {
            shared: Arc::new(Shared {
                options,
                ops,
                inner: Mutex::new(StackInner {
                    nics: BTreeMap::new(),
                    routes: RouteTable::new(),
                    ports: BTreeSet::new(),
                    next_port,
                    next_epoch: 1,
                    closing: Vec::new(),
                }),
                bridges: Mutex::new(BTreeMap::new()),
            }),
        }
    }

    pub fn options(&self) -> &StackOptions {
        &self.shared.options
    }

    pub fn ops(&self) -> &Arc<dyn NetOps> {
        &self.shared.ops
    }

    pub fn now_ms(&self) -> u64 {
        self.shared.ops.now_ms()
    }

    fn now(&self) -> Instant {
        Instant::from_millis(self.now_ms() as i64)
    }

    /// Whether two handles refer to the same stack.
    pub fn same_as(&self, other: &Stack) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    /// Register `link` as NIC `id`. `seed` randomizes TCP initial sequence
    /// numbers and the ephemeral port cursor.
    ///
    /// Registering the same link twice is a no-op; another link under an
    /// existing id is an error.
    pub fn create_nic(&self, id: NicId, link: &Arc<LinkChannel>, seed: u64) -> Result<(), StackError> {
        if id == 0 {
            return Err(StackError::InvalidNicId);
        }
        let protocols = self.shared.options.network_protocols;
        if !protocols.contains(NetworkProtocols::IPV4) {
            return Err(StackError::ProtocolUnavailable("ipv4"));
        }
        if link.resolution_required() && !protocols.contains(NetworkProtocols::ARP) {
            return Err(StackError::ProtocolUnavailable("arp"));
        }

        let now = self.now();
        let mut inner = self.shared.inner.lock();
        if let Some(nic) = inner.nics.get(&id) {
            if Arc::ptr_eq(nic.device.link(), link) {
                return Ok(());
            }
            return Err(StackError::DuplicateNic(id));
        }

        let hardware_addr = if link.resolution_required() {
            HardwareAddress::Ethernet(link.mac())
        } else {
            HardwareAddress::Ip
        };
        let mut config = Config::new(hardware_addr);
        config.random_seed = seed;

        let mut device = LinkDevice::new(link.clone());
        let iface = Interface::new(config, &mut device, now);

        if inner.nics.is_empty() {
            let opts = &self.shared.options;
            let span = opts.ephemeral_end.saturating_sub(opts.ephemeral_start) as u64 + 1;
            inner.next_port = opts.ephemeral_start + (seed % span) as u16;
        }

        let epoch = inner.next_epoch;
        inner.next_epoch += 1;
        inner.nics.insert(
            id,
            Nic {
                epoch,
                iface,
                device,
                sockets: SocketSet::new(vec![]),
            },
        );
        info!("nic {}: created ({}, mtu {})", id, link.mac(), link.mtu());
        Ok(())
    }

    /// Remove NIC `id`, its routes and every endpoint on it.
    pub fn remove_nic(&self, id: NicId) -> bool {
        let mut inner = self.shared.inner.lock();
        let removed = inner.nics.remove(&id).is_some();
        if removed {
            inner.routes.remove_nic(id);
            inner.closing.retain(|(nic, _)| *nic != id);
            inner.ports.retain(|(nic, _, _)| *nic != id);
            info!("nic {}: removed", id);
        }
        drop(inner);
        self.shared.bridges.lock().remove(&id);
        removed
    }

    /// Route NIC `id`'s outbound frames through `bridge` when any socket
    /// waits on that NIC.
    pub(crate) fn register_bridge(&self, id: NicId, bridge: SharedBridge) {
        self.shared.bridges.lock().insert(id, bridge);
    }

    /// Hand NIC `id`'s queued outbound frames to its device. Returns the
    /// number of frames handed over.
    pub fn pump_nic(&self, id: NicId) -> usize {
        let Some(bridge) = self.shared.bridges.lock().get(&id).cloned() else {
            return 0;
        };
        let sent = bridge.lock().as_ref().map_or(0, |b| b.pump_outbound());
        sent
    }

    pub fn has_nic(&self, id: NicId) -> bool {
        self.shared.inner.lock().nics.contains_key(&id)
    }

    pub fn nic_count(&self) -> usize {
        self.shared.inner.lock().nics.len()
    }

    /// Link-layer address of NIC `id`.
    pub fn nic_mac(&self, id: NicId) -> Option<EthernetAddress> {
        let inner = self.shared.inner.lock();
        inner.nics.get(&id).map(|nic| nic.device.link().mac())
    }

    /// Assign an address to NIC `id`. Assigning an address twice is a no-op.
    pub fn add_protocol_address(&self, id: NicId, addr: ProtocolAddress) -> Result<(), StackError> {
        let NetworkProtocol::Ipv4 = addr.protocol;
        if !self.shared.options.network_protocols.contains(NetworkProtocols::IPV4) {
            return Err(StackError::ProtocolUnavailable("ipv4"));
        }

        let mut inner = self.shared.inner.lock();
        let nic = inner.nics.get_mut(&id).ok_or(StackError::UnknownNic(id))?;

        let cidr = IpCidr::Ipv4(addr.address);
        let mut result = Ok(());
        nic.iface.update_ip_addrs(|addrs| {
            if addrs.iter().any(|a| *a == cidr) {
                return;
            }
            if addrs.push(cidr).is_err() {
                result = Err(StackError::AddressTableFull(id));
            }
        });
        if result.is_ok() {
            info!("nic {}: address {}", id, addr.address);
        }
        result
    }

    /// Addresses of NIC `id`, in assignment order.
    pub fn addresses(&self, id: NicId) -> Result<Vec<Ipv4Cidr>, StackError> {
        let inner = self.shared.inner.lock();
        let nic = inner.nics.get(&id).ok_or(StackError::UnknownNic(id))?;
        Ok(nic.iface.ip_addrs().iter().filter_map(ipv4_cidr).collect())
    }

    /// Primary (first assigned) address of NIC `id`.
    pub fn main_address(&self, id: NicId, protocol: NetworkProtocol) -> Result<Ipv4Cidr, StackError> {
        let NetworkProtocol::Ipv4 = protocol;
        let inner = self.shared.inner.lock();
        let nic = inner.nics.get(&id).ok_or(StackError::UnknownNic(id))?;
        nic.iface
            .ip_addrs()
            .iter()
            .find_map(ipv4_cidr)
            .ok_or(StackError::NoAddress(id))
    }

    pub fn route_table(&self) -> RouteTable {
        self.shared.inner.lock().routes.clone()
    }

    /// Replace the route table.
    ///
    /// Every route must name an existing NIC. Gateway routes are also
    /// installed in the NIC's smoltcp interface, which holds at most
    /// `IFACE_MAX_ROUTE_COUNT` of them. On error nothing changes.
    pub fn set_route_table(&self, table: RouteTable) -> Result<(), StackError> {
        let mut inner = self.shared.inner.lock();

        for route in &table {
            if !inner.nics.contains_key(&route.nic) {
                return Err(StackError::UnknownNic(route.nic));
            }
        }
        for &id in inner.nics.keys() {
            let gateways = table
                .iter()
                .filter(|r| r.nic == id && r.gateway.is_some())
                .count();
            if gateways > IFACE_MAX_ROUTE_COUNT {
                return Err(StackError::RouteTableFull(id));
            }
        }

        for (&id, nic) in inner.nics.iter_mut() {
            nic.iface.routes_mut().update(|storage| {
                storage.clear();
                for route in table.iter().filter(|r| r.nic == id) {
                    if let Some(gw) = route.gateway {
                        let _ = storage.push(smoltcp::iface::Route {
                            cidr: IpCidr::Ipv4(route.destination),
                            via_router: IpAddress::Ipv4(gw),
                            preferred_until: None,
                            expires_at: None,
                        });
                    }
                }
            });
        }

        debug!("route table: {} entries", table.len());
        inner.routes = table;
        Ok(())
    }

    /// First route matching `dst`.
    pub fn find_route(&self, dst: &Ipv4Address) -> Option<Route> {
        self.shared.inner.lock().routes.lookup(dst).copied()
    }

    /// Create an endpoint of `protocol` on NIC `nic`.
    pub fn new_endpoint(
        &self,
        nic: NicId,
        protocol: TransportProtocol,
        network: NetworkProtocol,
    ) -> Result<Endpoint, EndpointError> {
        let NetworkProtocol::Ipv4 = network;
        let opts = &self.shared.options;
        if !opts.network_protocols.contains(NetworkProtocols::IPV4)
            || !opts.transport_protocols.contains(protocol.flag())
        {
            return Err(EndpointError::UnsupportedProtocol);
        }

        let mut inner = self.shared.inner.lock();
        let entry = inner
            .nics
            .get_mut(&nic)
            .ok_or(EndpointError::AddressNotAvailable)?;

        let epoch = entry.epoch;
        let handle = match protocol {
            TransportProtocol::Tcp => {
                let rx = tcp::SocketBuffer::new(vec![0u8; opts.tcp_rx_buffer]);
                let tx = tcp::SocketBuffer::new(vec![0u8; opts.tcp_tx_buffer]);
                entry.sockets.add(tcp::Socket::new(rx, tx))
            }
            TransportProtocol::Udp => {
                let rx = udp::PacketBuffer::new(
                    vec![udp::PacketMetadata::EMPTY; opts.packet_slots],
                    vec![0u8; opts.packet_buffer],
                );
                let tx = udp::PacketBuffer::new(
                    vec![udp::PacketMetadata::EMPTY; opts.packet_slots],
                    vec![0u8; opts.packet_buffer],
                );
                entry.sockets.add(udp::Socket::new(rx, tx))
            }
            TransportProtocol::Icmpv4 => {
                let rx = icmp::PacketBuffer::new(
                    vec![icmp::PacketMetadata::EMPTY; opts.packet_slots],
                    vec![0u8; opts.packet_buffer],
                );
                let tx = icmp::PacketBuffer::new(
                    vec![icmp::PacketMetadata::EMPTY; opts.packet_slots],
                    vec![0u8; opts.packet_buffer],
                );
                entry.sockets.add(icmp::Socket::new(rx, tx))
            }
        };
        drop(inner);

        debug!("nic {}: new {:?} endpoint", nic, protocol);
        Ok(Endpoint::new(self.clone(), nic, epoch, handle, protocol))
    }

    /// Run one processing step on every NIC: consume queued inbound frames,
    /// advance timers, emit outbound frames. Returns whether anything
    /// happened.
    pub fn poll(&self) -> bool {
        let now = self.now();
        let mut inner = self.shared.inner.lock();
        let mut activity = false;
        for nic in inner.nics.values_mut() {
            activity |= nic.iface.poll(now, &mut nic.device, &mut nic.sockets);
        }
        inner.reap_closed();
        activity
    }

    /// Run `f` on NIC `id` under the stack lock, if the NIC registered
    /// under `id` is still the one from `epoch`.
    pub(crate) fn with_nic<R>(&self, id: NicId, epoch: u64, f: impl FnOnce(&mut Nic) -> R) -> Option<R> {
        let mut inner = self.shared.inner.lock();
        inner
            .nics
            .get_mut(&id)
            .filter(|nic| nic.epoch == epoch)
            .map(f)
    }

    /// Reserve `port` for `protocol` on NIC `nic`, or the next free
    /// ephemeral port when `port` is 0.
    pub(crate) fn reserve_port(
        &self,
        nic: NicId,
        epoch: u64,
        protocol: TransportProtocol,
        port: u16,
    ) -> Result<u16, EndpointError> {
        let opts = &self.shared.options;
        let mut inner = self.shared.inner.lock();
        if !inner.nics.get(&nic).is_some_and(|n| n.epoch == epoch) {
            return Err(EndpointError::Closed);
        }

        if port != 0 {
            if !inner.ports.insert((nic, protocol, port)) {
                return Err(EndpointError::AddressInUse);
            }
            return Ok(port);
        }

        let (start, end) = (opts.ephemeral_start, opts.ephemeral_end);
        let span = end.saturating_sub(start) as u32 + 1;
        for _ in 0..span {
            let candidate = inner.next_port;
            inner.next_port = if candidate >= end { start } else { candidate + 1 };
            if candidate != 0 && inner.ports.insert((nic, protocol, candidate)) {
                return Ok(candidate);
            }
        }
        Err(EndpointError::AddressInUse)
    }

    /// Give back a port reserved on NIC `nic` while it was at `epoch`.
    /// Reservations of a removed NIC are already gone.
    pub(crate) fn release_port(&self, nic: NicId, epoch: u64, protocol: TransportProtocol, port: u16) {
        let mut inner = self.shared.inner.lock();
        if inner.nics.get(&nic).is_some_and(|n| n.epoch == epoch) {
            inner.ports.remove(&(nic, protocol, port));
        }
    }

    /// Close socket `handle` on NIC `id`. UDP and ICMP sockets are freed at
    /// once; TCP sockets stay until `poll` sees their close handshake end.
    /// `reset` aborts a TCP connection instead.
    pub(crate) fn close_socket(
        &self,
        id: NicId,
        epoch: u64,
        handle: SocketHandle,
        protocol: TransportProtocol,
        reset: bool,
    ) {
        let mut guard = self.shared.inner.lock();
        let inner = &mut *guard;
        let Some(nic) = inner.nics.get_mut(&id).filter(|nic| nic.epoch == epoch) else {
            return;
        };
        match protocol {
            TransportProtocol::Tcp => {
                let socket = nic.sockets.get_mut::<tcp::Socket>(handle);
                if reset {
                    socket.abort();
                } else {
                    socket.close();
                }
                inner.closing.push((id, handle));
            }
            TransportProtocol::Udp | TransportProtocol::Icmpv4 => {
                nic.sockets.remove(handle);
            }
        }
    }

    /// Endpoints (sockets) currently allocated on NIC `id`.
    pub fn endpoint_count(&self, id: NicId) -> usize {
        let inner = self.shared.inner.lock();
        inner
            .nics
            .get(&id)
            .map_or(0, |nic| nic.sockets.iter().count())
    }
}

impl StackInner {
    fn reap_closed(&mut self) {
        let nics = &mut self.nics;
        self.closing.retain(|&(id, handle)| {
            let Some(nic) = nics.get_mut(&id) else {
                return false;
            };
            let state = nic.sockets.get::<tcp::Socket>(handle).state();
            if matches!(state, tcp::State::Closed | tcp::State::TimeWait) {
                nic.sockets.remove(handle);
                false
            } else {
                true
            }
        });
    }
}

#[allow(unreachable_patterns)]
pub(crate) fn ipv4_cidr(cidr: &IpCidr) -> Option<Ipv4Cidr> {
    match cidr {
        IpCidr::Ipv4(c) => Some(*c),
        _ => None,
    }
}

#[allow(unreachable_patterns)]
pub(crate) fn ipv4_addr(addr: IpAddress) -> Option<Ipv4Address> {
    match addr {
        IpAddress::Ipv4(a) => Some(a),
        _ => None,
    }
}
