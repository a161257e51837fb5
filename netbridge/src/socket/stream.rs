/// Blocking sockets over stack endpoints.
///
/// `Socket` implements `embedded_io::Read` / `Write`; each call spins on the
/// provider until data moves, the peer closes, the I/O deadline passes or
/// the interface closes. The `try_*` calls never wait.
use log::debug;

use super::{CancelToken, SocketProvider};
use crate::error::EndpointError;
use crate::stack::{Endpoint, FullAddress, TransportProtocol};

pub struct Socket {
    endpoint: Endpoint,
    provider: SocketProvider,
    timeout_ms: Option<u64>,
}

impl Socket {
    pub(crate) fn new(endpoint: Endpoint, provider: SocketProvider) -> Self {
        let timeout_ms = provider.stack().options().io_timeout_ms;
        Self {
            endpoint,
            provider,
            timeout_ms,
        }
    }

    pub fn protocol(&self) -> TransportProtocol {
        self.endpoint.protocol()
    }

    pub fn local_addr(&self) -> Option<FullAddress> {
        self.endpoint.local_addr()
    }

    pub fn remote_addr(&self) -> Option<FullAddress> {
        self.endpoint.remote_addr()
    }

    /// Deadline for each blocking call. `None` waits forever.
    pub fn set_timeout(&mut self, timeout_ms: Option<u64>) {
        self.timeout_ms = timeout_ms;
    }

    pub fn timeout(&self) -> Option<u64> {
        self.timeout_ms
    }

    /// Queue `data` without waiting. Returns 0 when the send buffer is full.
    pub fn try_send(&mut self, data: &[u8]) -> Result<usize, EndpointError> {
        self.endpoint.send(data)
    }

    /// `Ok(None)`: nothing yet. `Ok(Some(0))`: the peer closed the stream.
    pub fn try_recv(&mut self, buf: &mut [u8]) -> Result<Option<usize>, EndpointError> {
        self.endpoint.recv(buf)
    }

    pub fn try_send_to(&mut self, data: &[u8], remote: FullAddress) -> Result<usize, EndpointError> {
        self.endpoint.send_to(data, remote)
    }

    pub fn try_recv_from(&mut self, buf: &mut [u8]) -> Result<Option<(usize, FullAddress)>, EndpointError> {
        self.endpoint.recv_from(buf)
    }

    /// Send one datagram to `remote`, waiting for buffer space.
    pub fn send_to(&mut self, data: &[u8], remote: FullAddress) -> Result<usize, EndpointError> {
        self.wait(|ep| Ok(Some(ep.send_to(data, remote)?).filter(|&n| n > 0)))
    }

    /// Wait for one datagram.
    pub fn recv_from(&mut self, buf: &mut [u8]) -> Result<(usize, FullAddress), EndpointError> {
        self.wait(|ep| ep.recv_from(buf))
    }

    /// Close the socket. TCP finishes with an orderly FIN exchange.
    pub fn close(&mut self) {
        self.endpoint.close();
    }

    /// Close the socket, resetting a TCP connection.
    pub fn abort(&mut self) {
        self.endpoint.abort();
    }

    pub fn is_closed(&self) -> bool {
        self.endpoint.is_closed()
    }

    fn wait<R>(
        &mut self,
        mut attempt: impl FnMut(&mut Endpoint) -> Result<Option<R>, EndpointError>,
    ) -> Result<R, EndpointError> {
        let deadline = self
            .timeout_ms
            .map(|t| self.provider.stack().now_ms().saturating_add(t));
        loop {
            if let Some(r) = attempt(&mut self.endpoint)? {
                return Ok(r);
            }
            if self.provider.is_closed() {
                return Err(EndpointError::Closed);
            }
            if deadline.is_some_and(|d| self.provider.stack().now_ms() >= d) {
                return Err(EndpointError::Timeout);
            }
            self.provider.step(self.endpoint.nic());
        }
    }
}

impl embedded_io::ErrorType for Socket {
    type Error = EndpointError;
}

impl embedded_io::Read for Socket {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, Self::Error> {
        if buf.is_empty() {
            return Ok(0);
        }
        self.wait(|ep| ep.recv(buf))
    }
}

impl embedded_io::Write for Socket {
    fn write(&mut self, buf: &[u8]) -> Result<usize, Self::Error> {
        if buf.is_empty() {
            return Ok(0);
        }
        self.wait(|ep| Ok(Some(ep.send(buf)?).filter(|&n| n > 0)))
    }

    /// Wait until every queued byte has been acknowledged.
    fn flush(&mut self) -> Result<(), Self::Error> {
        self.wait(|ep| Ok((ep.send_queue()? == 0).then_some(())))
    }
}

/// Listening TCP socket.
pub struct Listener {
    endpoint: Endpoint,
    provider: SocketProvider,
}

impl Listener {
    pub(crate) fn new(endpoint: Endpoint, provider: SocketProvider) -> Self {
        Self { endpoint, provider }
    }

    pub fn local_addr(&self) -> Option<FullAddress> {
        self.endpoint.local_addr()
    }

    /// Take an established connection if one is waiting. The listener keeps
    /// listening on the same port afterwards.
    pub fn try_accept(&mut self) -> Result<Option<Socket>, EndpointError> {
        if self.provider.is_closed() {
            return Err(EndpointError::Closed);
        }
        if !self.endpoint.has_connection()? {
            return Ok(None);
        }
        let conn = self.endpoint.split_accepted()?;
        debug!("accepted {:?} on {:?}", conn.remote_addr(), conn.local_addr());
        Ok(Some(Socket::new(conn, self.provider.clone())))
    }

    /// Wait for a connection.
    pub fn accept(&mut self) -> Result<Socket, EndpointError> {
        self.accept_with(None)
    }

    /// Wait for a connection until one arrives, `cancel` fires or the
    /// interface closes.
    pub fn accept_with(&mut self, cancel: Option<&CancelToken>) -> Result<Socket, EndpointError> {
        loop {
            if let Some(socket) = self.try_accept()? {
                return Ok(socket);
            }
            if cancel.is_some_and(CancelToken::is_canceled) {
                return Err(EndpointError::Canceled);
            }
            self.provider.step(self.endpoint.nic());
        }
    }

    pub fn close(&mut self) {
        self.endpoint.close();
    }
}
