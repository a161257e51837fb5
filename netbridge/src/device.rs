/// NetworkDevice trait: the raw frame capability this crate bridges.
///
/// The driver (virtio-net, e1000, a USB gadget, ...) owns interrupts, DMA
/// and framing below Ethernet. It only has to transmit frames and push the
/// frames it receives into the [`FrameSink`] handed to it by `attach`.
use alloc::sync::Arc;
use core::fmt;

use crate::link::LinkChannel;

/// Transmit failure reported by a driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceError {
    /// Hardware I/O error.
    Io,
    /// Device not initialized or link down.
    NotReady,
    /// Driver transmit ring is full.
    QueueFull,
    /// Frame larger than the device accepts.
    FrameTooLarge,
}

impl fmt::Display for DeviceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceError::Io => write!(f, "device I/O error"),
            DeviceError::NotReady => write!(f, "device not ready"),
            DeviceError::QueueFull => write!(f, "device tx queue full"),
            DeviceError::FrameTooLarge => write!(f, "frame too large for device"),
        }
    }
}

impl core::error::Error for DeviceError {}

/// Ethernet device driven by the host runtime.
pub trait NetworkDevice: Send + Sync {
    /// Transmit one Ethernet frame.
    fn transmit(&self, frame: &[u8]) -> Result<(), DeviceError>;

    /// Register the sink inbound frames must be delivered to.
    ///
    /// The device calls [`FrameSink::deliver`] once per received frame,
    /// from whatever context it receives in (interrupt bottom half, poll
    /// task). Replaces any sink registered earlier.
    fn attach(&self, sink: FrameSink);

    /// Drop the registered sink. Frames received afterwards are discarded.
    fn detach(&self) {}
}

/// Inbound half of a link, handed to the device.
///
/// Cheap to clone. `deliver` never blocks on the stack: it only takes the
/// inbound queue lock, and drops the frame when the queue is full.
#[derive(Clone)]
pub struct FrameSink {
    link: Arc<LinkChannel>,
}

impl FrameSink {
    pub(crate) fn new(link: Arc<LinkChannel>) -> Self {
        Self { link }
    }

    /// Queue a received frame for the stack.
    ///
    /// Returns `false` if the frame was dropped (oversized, queue full, or
    /// link closed).
    pub fn deliver(&self, frame: &[u8]) -> bool {
        self.link.inject(frame)
    }

    /// Link this sink feeds.
    pub fn link(&self) -> &Arc<LinkChannel> {
        &self.link
    }
}

impl fmt::Debug for FrameSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameSink").field("mac", &self.link.mac()).finish()
    }
}
