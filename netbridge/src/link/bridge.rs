/// NIC adapter: binds a [`NetworkDevice`] to a [`LinkChannel`].
///
/// Inbound frames never pass through the bridge: `attach` hands the device
/// a [`FrameSink`] and the device feeds the link directly. The bridge runs
/// the outbound half: `pump_outbound` drains the link's outbound queue into
/// `NetworkDevice::transmit`. A transmit failure is counted and the frame
/// dropped; the pump keeps going with the next one.
use alloc::sync::Arc;

use log::{debug, warn};

use super::channel::LinkChannel;
use crate::device::{FrameSink, NetworkDevice};

pub struct LinkBridge {
    link: Arc<LinkChannel>,
    device: Option<Arc<dyn NetworkDevice>>,
}

impl LinkBridge {
    /// Register the link's sink with `device` and start bridging.
    pub fn attach(device: Arc<dyn NetworkDevice>, link: Arc<LinkChannel>) -> Self {
        device.attach(FrameSink::new(link.clone()));
        debug!("link {}: device attached", link.mac());
        Self {
            link,
            device: Some(device),
        }
    }

    pub fn link(&self) -> &Arc<LinkChannel> {
        &self.link
    }

    /// The bridged device, until the bridge is closed.
    pub fn device(&self) -> Option<&Arc<dyn NetworkDevice>> {
        self.device.as_ref()
    }

    /// Whether `device` is the one this bridge drives.
    pub fn is_attached_to(&self, device: &Arc<dyn NetworkDevice>) -> bool {
        self.device
            .as_ref()
            .is_some_and(|d| core::ptr::addr_eq(Arc::as_ptr(d), Arc::as_ptr(device)))
    }

    /// Transmit every queued outbound frame. Returns the number of frames
    /// handed to the device, failed ones included.
    pub fn pump_outbound(&self) -> usize {
        self.pump_outbound_budget(usize::MAX)
    }

    /// Transmit at most `budget` queued outbound frames.
    pub fn pump_outbound_budget(&self, budget: usize) -> usize {
        let Some(device) = self.device.as_ref() else {
            return 0;
        };

        let mut sent = 0;
        while sent < budget {
            let Some(frame) = self.link.next_outbound() else {
                break;
            };
            match device.transmit(&frame) {
                Ok(()) => self.link.record_tx(true),
                Err(e) => {
                    self.link.record_tx(false);
                    warn!("link {}: transmit failed: {}", self.link.mac(), e);
                }
            }
            sent += 1;
        }
        sent
    }

    /// Detach the device, release it and discard queued frames. Idempotent.
    pub fn close(&mut self) {
        self.link.close();
        if let Some(device) = self.device.take() {
            device.detach();
            debug!("link {}: device detached", self.link.mac());
        }
    }

    pub fn is_closed(&self) -> bool {
        self.device.is_none()
    }
}

impl Drop for LinkBridge {
    fn drop(&mut self) {
        self.close();
    }
}
