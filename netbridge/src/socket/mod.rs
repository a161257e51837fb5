/// Socket factory handed to the host runtime.
///
/// The runtime asks for sockets by network name and address string
/// ("tcp", "10.0.0.2:80"); [`SocketProvider`] resolves both, picks the NIC
/// from the route table and hands back a [`Socket`] or [`Listener`] over a
/// stack [`Endpoint`](crate::stack::Endpoint).
///
/// Blocking calls spin on the stack: each wait step polls the stack, pumps
/// the outbound queue of the NIC the socket lives on and calls
/// `NetOps::relax`. Closing the interface cancels every wait.
mod address;
mod stream;

pub use address::Network;
pub use crate::stack::FullAddress;
pub use stream::{Listener, Socket};

use alloc::sync::Arc;
use core::sync::atomic::{AtomicBool, Ordering};

use log::debug;

use crate::error::{EndpointError, NetError};
use crate::stack::{ConnectState, Endpoint, NetworkProtocol, NicId, Stack};

/// Hook the host runtime calls to open an outbound connection.
pub trait SocketFactory {
    fn create_socket(&self, network: &str, address: &str) -> Result<Socket, NetError>;
}

/// Shared cancellation flag. Clones observe the same flag.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_canceled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Extra knobs for [`SocketProvider::dial_with`].
#[derive(Debug, Clone, Default)]
pub struct DialOptions {
    /// Local address to bind before connecting.
    pub local: Option<FullAddress>,
    /// Connect deadline; the stack's `connect_timeout_ms` when `None`.
    pub timeout_ms: Option<u64>,
    pub cancel: Option<CancelToken>,
}

/// Creates sockets on one interface's stack.
#[derive(Clone)]
pub struct SocketProvider {
    stack: Stack,
    nic: NicId,
    closed: CancelToken,
}

impl SocketProvider {
    pub(crate) fn new(stack: Stack, nic: NicId, closed: CancelToken) -> Self {
        Self { stack, nic, closed }
    }

    pub fn stack(&self) -> &Stack {
        &self.stack
    }

    /// Whether the interface behind this provider has been closed.
    pub fn is_closed(&self) -> bool {
        self.closed.is_canceled()
    }

    /// One wait step for a socket on NIC `nic`: process frames, transmit
    /// on that NIC, yield. The route may have put the socket on another
    /// interface's NIC.
    pub(crate) fn step(&self, nic: NicId) {
        self.stack.poll();
        self.stack.pump_nic(nic);
        self.stack.ops().relax();
    }

    fn check_open(&self) -> Result<(), EndpointError> {
        if self.is_closed() {
            return Err(EndpointError::Closed);
        }
        Ok(())
    }

    /// Connect to `address` and wait until the connection is established.
    pub fn dial(&self, network: &str, address: &str) -> Result<Socket, NetError> {
        self.dial_with(network, address, DialOptions::default())
    }

    pub fn dial_with(&self, network: &str, address: &str, opts: DialOptions) -> Result<Socket, NetError> {
        let mut connecting = self.begin_dial(network, address, opts)?;
        loop {
            if let Some(socket) = connecting.poll()? {
                return Ok(socket);
            }
            self.step(connecting.nic);
        }
    }

    /// Start connecting without waiting. Drive the returned [`Connecting`]
    /// with [`Connecting::poll`] while the stack runs.
    ///
    /// Malformed networks or addresses fail here, before any endpoint
    /// exists.
    pub fn begin_dial(&self, network: &str, address: &str, opts: DialOptions) -> Result<Connecting, NetError> {
        let network = Network::parse(network)?;
        let remote = FullAddress::parse(address)?;
        self.check_open()?;
        if remote.is_unspecified() {
            return Err(EndpointError::Unaddressable.into());
        }
        if network != Network::Icmp && remote.port == 0 {
            return Err(EndpointError::InvalidPort.into());
        }

        let route = self
            .stack
            .find_route(&remote.addr)
            .ok_or(EndpointError::NoRoute)?;
        let mut endpoint = self
            .stack
            .new_endpoint(route.nic, network.transport(), NetworkProtocol::Ipv4)?;
        if let Some(local) = opts.local {
            endpoint.bind(local)?;
        }
        endpoint.connect(remote)?;

        let timeout = opts
            .timeout_ms
            .unwrap_or(self.stack.options().connect_timeout_ms);
        debug!("dial {:?} {} via {}", network, remote, route);

        Ok(Connecting {
            nic: route.nic,
            endpoint: Some(endpoint),
            deadline: self.stack.now_ms().saturating_add(timeout),
            cancel: opts.cancel,
            provider: self.clone(),
        })
    }

    /// Listen for TCP connections on `address` (":port", or "ip:port" for
    /// an address assigned to the interface).
    pub fn listen(&self, network: &str, address: &str) -> Result<Listener, NetError> {
        let network = Network::parse(network)?;
        let local = FullAddress::parse(address)?;
        if !network.is_stream() {
            return Err(EndpointError::UnsupportedProtocol.into());
        }
        self.check_open()?;

        let mut endpoint = self
            .stack
            .new_endpoint(self.nic, network.transport(), NetworkProtocol::Ipv4)?;
        endpoint.bind(local)?;
        endpoint.listen()?;
        debug!("listening on {:?}", endpoint.local_addr());
        Ok(Listener::new(endpoint, self.clone()))
    }

    /// Open a datagram (UDP or ICMP) socket bound to `address`.
    pub fn bind(&self, network: &str, address: &str) -> Result<Socket, NetError> {
        let network = Network::parse(network)?;
        let local = FullAddress::parse(address)?;
        if network.is_stream() {
            return Err(EndpointError::UnsupportedProtocol.into());
        }
        self.check_open()?;

        let mut endpoint = self
            .stack
            .new_endpoint(self.nic, network.transport(), NetworkProtocol::Ipv4)?;
        endpoint.bind(local)?;
        Ok(Socket::new(endpoint, self.clone()))
    }
}

impl SocketFactory for SocketProvider {
    fn create_socket(&self, network: &str, address: &str) -> Result<Socket, NetError> {
        self.dial(network, address)
    }
}

/// Connection attempt in progress. Dropping it abandons the attempt.
pub struct Connecting {
    nic: NicId,
    endpoint: Option<Endpoint>,
    deadline: u64,
    cancel: Option<CancelToken>,
    provider: SocketProvider,
}

impl Connecting {
    /// Check the attempt once. `Ok(None)` means still in progress. On any
    /// error the half-open endpoint is released.
    pub fn poll(&mut self) -> Result<Option<Socket>, EndpointError> {
        let state = match self.endpoint.as_ref() {
            Some(endpoint) => endpoint.poll_connect(),
            None => return Err(EndpointError::InvalidState),
        };

        let failure = if self.provider.is_closed() {
            Some(EndpointError::Closed)
        } else if self.cancel.as_ref().is_some_and(CancelToken::is_canceled) {
            Some(EndpointError::Canceled)
        } else {
            match state {
                Ok(ConnectState::Established) => {
                    let endpoint = self.endpoint.take().ok_or(EndpointError::InvalidState)?;
                    debug!("connected to {:?}", endpoint.remote_addr());
                    return Ok(Some(Socket::new(endpoint, self.provider.clone())));
                }
                Ok(ConnectState::Pending) if self.provider.stack().now_ms() >= self.deadline => {
                    Some(EndpointError::Timeout)
                }
                Ok(ConnectState::Pending) => None,
                Err(e) => Some(e),
            }
        };

        match failure {
            Some(err) => {
                if let Some(mut endpoint) = self.endpoint.take() {
                    endpoint.abort();
                }
                debug!("dial failed: {}", err);
                Err(err)
            }
            None => Ok(None),
        }
    }

    pub fn remote_addr(&self) -> Option<FullAddress> {
        self.endpoint.as_ref().and_then(Endpoint::remote_addr)
    }

    /// NIC the route picked for this connection.
    pub fn nic(&self) -> NicId {
        self.nic
    }
}

#[cfg(test)]
mod tests;
