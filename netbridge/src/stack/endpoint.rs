/// Stack-native endpoint: one smoltcp socket on one NIC.
///
/// Calls never block: `connect` only starts the handshake, `send`/`recv`
/// report `Ok(0)` / `Ok(None)` when they would block. The socket layer
/// builds blocking semantics on top by polling the stack in between.
///
/// An endpoint is freed when closed or dropped. A closed TCP endpoint stays
/// in the stack until its FIN exchange completes.
use core::fmt;

use log::debug;
use smoltcp::iface::SocketHandle;
use smoltcp::socket::{icmp, tcp, udp};
use smoltcp::wire::{IpAddress, IpEndpoint, IpListenEndpoint, Ipv4Address};

use super::{ipv4_addr, NicId, Stack, TransportProtocol};
use crate::error::EndpointError;

/// IPv4 address and port. An unspecified address means "any".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FullAddress {
    pub addr: Ipv4Address,
    pub port: u16,
}

impl FullAddress {
    pub fn new(addr: Ipv4Address, port: u16) -> Self {
        Self { addr, port }
    }

    /// Any address, `port`.
    pub fn any(port: u16) -> Self {
        Self::new(Ipv4Address::UNSPECIFIED, port)
    }

    pub fn is_unspecified(&self) -> bool {
        self.addr.is_unspecified()
    }

    fn listen_endpoint(&self) -> IpListenEndpoint {
        IpListenEndpoint {
            addr: if self.is_unspecified() {
                None
            } else {
                Some(IpAddress::Ipv4(self.addr))
            },
            port: self.port,
        }
    }

    fn ip_endpoint(&self) -> IpEndpoint {
        IpEndpoint::new(IpAddress::Ipv4(self.addr), self.port)
    }

    fn from_ip_endpoint(ep: IpEndpoint) -> Option<Self> {
        Some(Self::new(ipv4_addr(ep.addr)?, ep.port))
    }
}

impl fmt::Display for FullAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.addr, self.port)
    }
}

/// Progress of a TCP connection attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ConnectState {
    Pending,
    Established,
}

pub struct Endpoint {
    stack: Stack,
    nic: NicId,
    epoch: u64,
    handle: SocketHandle,
    protocol: TransportProtocol,
    local: Option<FullAddress>,
    remote: Option<FullAddress>,
    /// Port (ICMP: identifier) this endpoint holds in the stack's port map.
    reserved: Option<u16>,
    closed: bool,
}

impl Endpoint {
    pub(crate) fn new(
        stack: Stack,
        nic: NicId,
        epoch: u64,
        handle: SocketHandle,
        protocol: TransportProtocol,
    ) -> Self {
        Self {
            stack,
            nic,
            epoch,
            handle,
            protocol,
            local: None,
            remote: None,
            reserved: None,
            closed: false,
        }
    }

    pub fn nic(&self) -> NicId {
        self.nic
    }

    pub fn protocol(&self) -> TransportProtocol {
        self.protocol
    }

    pub fn local_addr(&self) -> Option<FullAddress> {
        self.local
    }

    pub fn remote_addr(&self) -> Option<FullAddress> {
        self.remote
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Run `f` on this endpoint's smoltcp socket set under the stack lock.
    fn with_sockets<R>(
        &self,
        f: impl FnOnce(&mut super::Nic) -> Result<R, EndpointError>,
    ) -> Result<R, EndpointError> {
        if self.closed {
            return Err(EndpointError::Closed);
        }
        self.stack
            .with_nic(self.nic, self.epoch, f)
            .unwrap_or(Err(EndpointError::Closed))
    }

    /// Bind to `addr`. Port 0 picks an ephemeral port. For ICMP the port is
    /// the echo identifier.
    pub fn bind(&mut self, addr: FullAddress) -> Result<(), EndpointError> {
        if self.closed {
            return Err(EndpointError::Closed);
        }
        if self.local.is_some() {
            return Err(EndpointError::InvalidState);
        }
        if !addr.is_unspecified() {
            let assigned = self
                .stack
                .with_nic(self.nic, self.epoch, |nic| nic.has_address(&addr.addr))
                .ok_or(EndpointError::Closed)?;
            if !assigned {
                return Err(EndpointError::AddressNotAvailable);
            }
        }

        let port = self
            .stack
            .reserve_port(self.nic, self.epoch, self.protocol, addr.port)?;
        let local = FullAddress::new(addr.addr, port);
        let handle = self.handle;

        let bound = match self.protocol {
            // TCP binds when it listens or connects.
            TransportProtocol::Tcp => Ok(()),
            TransportProtocol::Udp => self.with_sockets(|nic| {
                nic.sockets
                    .get_mut::<udp::Socket>(handle)
                    .bind(local.listen_endpoint())
                    .map_err(|e| match e {
                        udp::BindError::InvalidState => EndpointError::InvalidState,
                        udp::BindError::Unaddressable => EndpointError::Unaddressable,
                    })
            }),
            TransportProtocol::Icmpv4 => self.with_sockets(|nic| {
                nic.sockets
                    .get_mut::<icmp::Socket>(handle)
                    .bind(icmp::Endpoint::Ident(port))
                    .map_err(|e| match e {
                        icmp::BindError::InvalidState => EndpointError::InvalidState,
                        icmp::BindError::Unaddressable => EndpointError::Unaddressable,
                    })
            }),
        };

        match bound {
            Ok(()) => {
                self.reserved = Some(port);
                self.local = Some(local);
                debug!("nic {}: {:?} endpoint bound to {}", self.nic, self.protocol, local);
                Ok(())
            }
            Err(e) => {
                self.stack
                    .release_port(self.nic, self.epoch, self.protocol, port);
                Err(e)
            }
        }
    }

    /// Start listening for TCP connections, binding an ephemeral port first
    /// if the endpoint is unbound.
    pub fn listen(&mut self) -> Result<(), EndpointError> {
        if self.protocol != TransportProtocol::Tcp {
            return Err(EndpointError::UnsupportedProtocol);
        }
        if self.local.is_none() {
            self.bind(FullAddress::any(0))?;
        }
        let local = self.local.ok_or(EndpointError::InvalidState)?;
        let handle = self.handle;

        self.with_sockets(|nic| {
            nic.sockets
                .get_mut::<tcp::Socket>(handle)
                .listen(local.listen_endpoint())
                .map_err(|e| match e {
                    tcp::ListenError::InvalidState => EndpointError::InvalidState,
                    tcp::ListenError::Unaddressable => EndpointError::Unaddressable,
                })
        })
    }

    /// Set the peer. For TCP this sends the SYN (once the neighbor is
    /// resolved); the handshake completes during later stack polls.
    /// UDP and ICMP only record the destination.
    pub fn connect(&mut self, remote: FullAddress) -> Result<(), EndpointError> {
        if remote.is_unspecified() {
            return Err(EndpointError::Unaddressable);
        }
        if self.protocol != TransportProtocol::Icmpv4 && remote.port == 0 {
            return Err(EndpointError::InvalidPort);
        }
        if self.remote.is_some() {
            return Err(EndpointError::InvalidState);
        }
        if self.local.is_none() {
            self.bind(FullAddress::any(0))?;
        }

        if self.protocol == TransportProtocol::Tcp {
            let local = self.local.ok_or(EndpointError::InvalidState)?;
            let handle = self.handle;
            self.with_sockets(|nic| {
                let socket = nic.sockets.get_mut::<tcp::Socket>(handle);
                socket
                    .connect(nic.iface.context(), remote.ip_endpoint(), local.listen_endpoint())
                    .map_err(|e| match e {
                        tcp::ConnectError::InvalidState => EndpointError::InvalidState,
                        tcp::ConnectError::Unaddressable => EndpointError::Unaddressable,
                    })
            })?;
            debug!("nic {}: connecting {} -> {}", self.nic, local, remote);
        }

        self.remote = Some(remote);
        Ok(())
    }

    /// Where a TCP connection attempt stands. A socket that fell back to
    /// `Closed` was refused or reset.
    pub(crate) fn poll_connect(&self) -> Result<ConnectState, EndpointError> {
        if self.protocol != TransportProtocol::Tcp {
            return Ok(ConnectState::Established);
        }
        let handle = self.handle;
        self.with_sockets(|nic| match nic.sockets.get::<tcp::Socket>(handle).state() {
            tcp::State::SynSent | tcp::State::SynReceived => Ok(ConnectState::Pending),
            tcp::State::Closed => Err(EndpointError::ConnectionRefused),
            tcp::State::Listen => Err(EndpointError::InvalidState),
            _ => Ok(ConnectState::Established),
        })
    }

    /// Whether a listening TCP endpoint holds an established connection.
    pub(crate) fn has_connection(&self) -> Result<bool, EndpointError> {
        let handle = self.handle;
        self.with_sockets(|nic| {
            let state = nic.sockets.get::<tcp::Socket>(handle).state();
            Ok(!matches!(
                state,
                tcp::State::Listen | tcp::State::SynReceived | tcp::State::Closed
            ))
        })
    }

    /// Send `data`. Returns how many bytes were queued; 0 means the
    /// send buffer is full.
    pub fn send(&mut self, data: &[u8]) -> Result<usize, EndpointError> {
        let handle = self.handle;
        match self.protocol {
            TransportProtocol::Tcp => self.with_sockets(|nic| {
                let socket = nic.sockets.get_mut::<tcp::Socket>(handle);
                if !socket.may_send() {
                    return Err(EndpointError::Closed);
                }
                socket.send_slice(data).map_err(|_| EndpointError::Closed)
            }),
            TransportProtocol::Udp => {
                let remote = self.remote.ok_or(EndpointError::Unaddressable)?;
                self.send_to(data, remote)
            }
            TransportProtocol::Icmpv4 => {
                let remote = self.remote.ok_or(EndpointError::Unaddressable)?;
                self.send_to(data, remote)
            }
        }
    }

    /// Send one datagram to `remote` (UDP, ICMP). Returns `data.len()`, or
    /// 0 when the send buffer is full.
    pub fn send_to(&mut self, data: &[u8], remote: FullAddress) -> Result<usize, EndpointError> {
        if data.len() > self.stack.options().packet_buffer {
            return Err(EndpointError::BufferFull);
        }
        let handle = self.handle;
        match self.protocol {
            TransportProtocol::Tcp => Err(EndpointError::UnsupportedProtocol),
            TransportProtocol::Udp => self.with_sockets(|nic| {
                match nic
                    .sockets
                    .get_mut::<udp::Socket>(handle)
                    .send_slice(data, remote.ip_endpoint())
                {
                    Ok(()) => Ok(data.len()),
                    Err(udp::SendError::BufferFull) => Ok(0),
                    Err(udp::SendError::Unaddressable) => Err(EndpointError::Unaddressable),
                }
            }),
            TransportProtocol::Icmpv4 => self.with_sockets(|nic| {
                match nic
                    .sockets
                    .get_mut::<icmp::Socket>(handle)
                    .send_slice(data, IpAddress::Ipv4(remote.addr))
                {
                    Ok(()) => Ok(data.len()),
                    Err(icmp::SendError::BufferFull) => Ok(0),
                    Err(icmp::SendError::Unaddressable) => Err(EndpointError::Unaddressable),
                }
            }),
        }
    }

    /// Receive into `buf`. `Ok(None)` means nothing is available yet;
    /// `Ok(Some(0))` is end of stream on TCP.
    pub fn recv(&mut self, buf: &mut [u8]) -> Result<Option<usize>, EndpointError> {
        Ok(self.recv_from(buf)?.map(|(n, _)| n))
    }

    /// Like [`Endpoint::recv`], also returning the sender. A UDP endpoint
    /// with a peer set discards datagrams from anyone else.
    pub fn recv_from(&mut self, buf: &mut [u8]) -> Result<Option<(usize, FullAddress)>, EndpointError> {
        let handle = self.handle;
        let remote = self.remote;
        match self.protocol {
            TransportProtocol::Tcp => self.with_sockets(|nic| {
                let socket = nic.sockets.get_mut::<tcp::Socket>(handle);
                let peer = socket
                    .remote_endpoint()
                    .and_then(FullAddress::from_ip_endpoint)
                    .or(remote)
                    .unwrap_or(FullAddress::any(0));
                if socket.can_recv() {
                    return match socket.recv_slice(buf) {
                        Ok(n) => Ok(Some((n, peer))),
                        Err(tcp::RecvError::Finished) => Ok(Some((0, peer))),
                        Err(tcp::RecvError::InvalidState) => Err(EndpointError::Closed),
                    };
                }
                if !socket.may_recv() {
                    return Ok(Some((0, peer)));
                }
                Ok(None)
            }),
            TransportProtocol::Udp => self.with_sockets(|nic| {
                let socket = nic.sockets.get_mut::<udp::Socket>(handle);
                while socket.can_recv() {
                    let (n, meta) = socket
                        .recv_slice(buf)
                        .map_err(|_| EndpointError::BufferFull)?;
                    let Some(from) = FullAddress::from_ip_endpoint(meta.endpoint) else {
                        continue;
                    };
                    if remote.is_some_and(|r| r != from) {
                        continue;
                    }
                    return Ok(Some((n, from)));
                }
                Ok(None)
            }),
            TransportProtocol::Icmpv4 => self.with_sockets(|nic| {
                let socket = nic.sockets.get_mut::<icmp::Socket>(handle);
                if !socket.can_recv() {
                    return Ok(None);
                }
                let (n, from) = socket
                    .recv_slice(buf)
                    .map_err(|_| EndpointError::BufferFull)?;
                Ok(ipv4_addr(from).map(|addr| (n, FullAddress::new(addr, 0))))
            }),
        }
    }

    /// Bytes queued for sending and not yet acknowledged. Always 0 for
    /// datagram endpoints.
    pub fn send_queue(&self) -> Result<usize, EndpointError> {
        let handle = self.handle;
        match self.protocol {
            TransportProtocol::Tcp => {
                self.with_sockets(|nic| Ok(nic.sockets.get::<tcp::Socket>(handle).send_queue()))
            }
            _ => Ok(0),
        }
    }

    /// Whether the TCP connection still exists. Datagram endpoints are
    /// active until closed.
    pub fn is_active(&self) -> bool {
        let handle = self.handle;
        match self.protocol {
            TransportProtocol::Tcp => self
                .with_sockets(|nic| Ok(nic.sockets.get::<tcp::Socket>(handle).is_active()))
                .unwrap_or(false),
            _ => !self.closed,
        }
    }

    /// Move the connection this listening endpoint accepted into a new
    /// endpoint, and leave `self` as a fresh socket listening on the same
    /// port. The port reservation stays with `self`.
    pub(crate) fn split_accepted(&mut self) -> Result<Endpoint, EndpointError> {
        let local = self.local.ok_or(EndpointError::InvalidState)?;
        let mut fresh = self.stack.new_endpoint(self.nic, self.protocol, super::NetworkProtocol::Ipv4)?;

        let handle = self.handle;
        let peer = self.with_sockets(|nic| {
            Ok(nic
                .sockets
                .get::<tcp::Socket>(handle)
                .remote_endpoint()
                .and_then(FullAddress::from_ip_endpoint))
        })?;

        // `fresh` takes over listening; `self` keeps the port reservation.
        core::mem::swap(&mut self.handle, &mut fresh.handle);
        fresh.local = Some(local);
        fresh.remote = peer;
        self.listen_reserved(local)?;
        Ok(fresh)
    }

    /// Listen on `local` without touching the port map (already reserved).
    fn listen_reserved(&mut self, local: FullAddress) -> Result<(), EndpointError> {
        let handle = self.handle;
        self.with_sockets(|nic| {
            nic.sockets
                .get_mut::<tcp::Socket>(handle)
                .listen(local.listen_endpoint())
                .map_err(|_| EndpointError::InvalidState)
        })
    }

    /// Close the endpoint. TCP sends FIN and lingers in the stack until the
    /// close handshake completes; UDP and ICMP are freed at once.
    /// Idempotent.
    pub fn close(&mut self) {
        self.shutdown(false);
    }

    /// Close the endpoint, resetting a TCP connection instead of the
    /// orderly FIN exchange.
    pub fn abort(&mut self) {
        self.shutdown(true);
    }

    fn shutdown(&mut self, reset: bool) {
        if self.closed {
            return;
        }
        self.stack
            .close_socket(self.nic, self.epoch, self.handle, self.protocol, reset);
        if let Some(port) = self.reserved.take() {
            self.stack
                .release_port(self.nic, self.epoch, self.protocol, port);
        }
        self.closed = true;
        debug!("nic {}: {:?} endpoint closed", self.nic, self.protocol);
    }
}

impl Drop for Endpoint {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Endpoint")
            .field("nic", &self.nic)
            .field("protocol", &self.protocol)
            .field("local", &self.local)
            .field("remote", &self.remote)
            .field("closed", &self.closed)
            .finish()
    }
}
