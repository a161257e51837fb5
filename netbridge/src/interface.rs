/// Ethernet interface: one [`NetworkDevice`] bridged onto one stack NIC.
///
/// `init` parses the address configuration, registers a NIC with its
/// address and routes, then attaches the device. The caller runs three
/// entry points, typically as separate tasks of its scheduler:
///   - the device driver calls `FrameSink::deliver` for each received frame
///   - `Interface::poll` runs the protocol stack
///   - `Interface::pump_outbound` hands queued frames to the device
use alloc::sync::Arc;

use log::{debug, info};
use rand_core::{CryptoRng, RngCore};
use smoltcp::wire::{EthernetAddress, Ipv4Cidr};
use spin::Mutex;

use crate::config::AddressConfig;
use crate::device::NetworkDevice;
use crate::error::{ConfigError, EndpointError, NetError, StackError};
use crate::link::{LinkBridge, LinkChannel, LinkStats, SharedBridge};
use crate::socket::{CancelToken, Socket, SocketFactory, SocketProvider};
use crate::stack::{
    Endpoint, FullAddress, NetworkProtocol, NicId, ProtocolAddress, Route, Stack, TransportProtocol,
};
use crate::DEFAULT_NIC_ID;

pub struct Interface {
    nic_id: NicId,
    stack: Stack,
    link: Option<Arc<LinkChannel>>,
    bridge: SharedBridge,
    icmp: Option<Endpoint>,
    closed: CancelToken,
}

impl Interface {
    /// Interface on `stack` using the default NIC id.
    pub fn new(stack: Stack) -> Self {
        Self::with_nic_id(stack, DEFAULT_NIC_ID)
    }

    /// Interface on `stack` registering its NIC as `nic_id` (0 selects the
    /// default).
    pub fn with_nic_id(stack: Stack, nic_id: NicId) -> Self {
        Self {
            nic_id: if nic_id == 0 { DEFAULT_NIC_ID } else { nic_id },
            stack,
            link: None,
            bridge: Arc::new(Mutex::new(None)),
            icmp: None,
            closed: CancelToken::new(),
        }
    }

    /// Bring the interface up on `device`.
    ///
    /// `addr` is the interface address in CIDR form ("10.0.0.1/24"), `mac`
    /// the hardware address (empty: random, drawn from `rng`) and `gateway`
    /// the default gateway (empty: no default route). The interface subnet
    /// route goes ahead of any default route already in the stack's table;
    /// the default route through `gateway` goes at the end.
    ///
    /// Calling `init` again with the same device does nothing; with another
    /// device it fails. On failure the stack is left as it was and `init`
    /// may be retried.
    pub fn init<R>(
        &mut self,
        device: Arc<dyn NetworkDevice>,
        addr: &str,
        mac: &str,
        gateway: &str,
        rng: &mut R,
    ) -> Result<(), NetError>
    where
        R: RngCore + CryptoRng,
    {
        let config = AddressConfig::parse(addr, mac, gateway, rng)?;

        if let Some(bridge) = self.bridge.lock().as_ref() {
            if bridge.is_attached_to(&device) {
                debug!("nic {}: already initialized", self.nic_id);
                return Ok(());
            }
            return Err(NetError::stack("init")(StackError::AlreadyInitialized(
                self.nic_id,
            )));
        }

        let mut seed = [0u8; 8];
        rng.try_fill_bytes(&mut seed)
            .map_err(|_| ConfigError::EntropyUnavailable)?;

        let opts = self.stack.options();
        let link = Arc::new(LinkChannel::new(opts.queue_depth, opts.mtu, config.mac));

        self.stack
            .create_nic(self.nic_id, &link, u64::from_le_bytes(seed))
            .map_err(NetError::stack("create_nic"))?;
        if let Err(e) = self.configure(&config) {
            self.stack.remove_nic(self.nic_id);
            return Err(e);
        }

        if self.closed.is_canceled() {
            self.closed = CancelToken::new();
        }
        *self.bridge.lock() = Some(LinkBridge::attach(device, link.clone()));
        self.stack.register_bridge(self.nic_id, self.bridge.clone());
        self.link = Some(link);

        info!(
            "nic {}: up, {} {} gateway {:?}",
            self.nic_id, config.mac, config.ip, config.gateway
        );
        Ok(())
    }

    fn configure(&self, config: &AddressConfig) -> Result<(), NetError> {
        self.stack
            .add_protocol_address(self.nic_id, ProtocolAddress::ipv4(config.ip))
            .map_err(NetError::stack("add_protocol_address"))?;

        // The subnet route must not end up behind another NIC's default route.
        let mut table = self.stack.route_table();
        table.insert_before_default(Route::subnet(config.ip, self.nic_id));
        if let Some(gw) = config.gateway {
            table.push(Route::default_via(gw, self.nic_id));
        }
        self.stack
            .set_route_table(table)
            .map_err(NetError::stack("set_route_table"))
    }

    /// Open an ICMP endpoint on the interface address so the host answers
    /// and sends pings. Needs an address; calling it again does nothing.
    pub fn enable_icmp(&mut self) -> Result<(), NetError> {
        if self.icmp.is_some() {
            return Ok(());
        }
        let addr = self
            .stack
            .main_address(self.nic_id, NetworkProtocol::Ipv4)
            .map_err(|_| EndpointError::AddressNotAvailable)?;

        let mut endpoint =
            self.stack
                .new_endpoint(self.nic_id, TransportProtocol::Icmpv4, NetworkProtocol::Ipv4)?;
        endpoint.bind(FullAddress::new(addr.address(), self.stack.options().icmp_ident))?;

        debug!("nic {}: icmp enabled on {}", self.nic_id, addr.address());
        self.icmp = Some(endpoint);
        Ok(())
    }

    /// Shut the interface down: cancel pending dials and accepts, detach the
    /// device, drop queued frames and remove the NIC. Idempotent.
    pub fn close(&mut self) {
        self.closed.cancel();
        if let Some(mut icmp) = self.icmp.take() {
            icmp.close();
        }
        if let Some(mut bridge) = self.bridge.lock().take() {
            bridge.close();
        }
        if self.link.take().is_some() {
            self.stack.remove_nic(self.nic_id);
            info!("nic {}: closed", self.nic_id);
        }
    }

    /// Run one stack processing step. Returns whether anything happened.
    pub fn poll(&self) -> bool {
        self.stack.poll()
    }

    /// Hand every queued outbound frame to the device.
    pub fn pump_outbound(&self) -> usize {
        self.bridge
            .lock()
            .as_ref()
            .map_or(0, |bridge| bridge.pump_outbound())
    }

    /// Socket factory for this interface, for the host runtime.
    pub fn socket_factory(&self) -> SocketProvider {
        SocketProvider::new(self.stack.clone(), self.nic_id, self.closed.clone())
    }

    pub fn is_initialized(&self) -> bool {
        self.link.is_some()
    }

    pub fn nic_id(&self) -> NicId {
        self.nic_id
    }

    pub fn stack(&self) -> &Stack {
        &self.stack
    }

    pub fn mac(&self) -> Option<EthernetAddress> {
        self.link.as_ref().map(|link| link.mac())
    }

    /// Primary interface address.
    pub fn address(&self) -> Option<Ipv4Cidr> {
        self.stack
            .main_address(self.nic_id, NetworkProtocol::Ipv4)
            .ok()
    }

    /// Link counters, once initialized.
    pub fn stats(&self) -> Option<LinkStats> {
        self.link.as_ref().map(|link| link.stats())
    }

    pub fn icmp_enabled(&self) -> bool {
        self.icmp.is_some()
    }
}

impl SocketFactory for Interface {
    fn create_socket(&self, network: &str, address: &str) -> Result<Socket, NetError> {
        self.socket_factory().dial(network, address)
    }
}

impl Drop for Interface {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests;
