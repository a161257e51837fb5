/// Link layer: the packet pump between a device and the stack.
///
///   NetworkDevice ──deliver──▶ LinkChannel.inbound  ──RxToken──▶ smoltcp
///   NetworkDevice ◀─transmit── LinkBridge ◀── LinkChannel.outbound ◀─TxToken── smoltcp
mod bridge;
mod channel;

pub use bridge::LinkBridge;
pub use channel::{LinkCapabilities, LinkChannel, LinkStats};
pub(crate) use channel::LinkDevice;

use alloc::sync::Arc;

use spin::Mutex;

/// Bridge slot shared between an interface and the stack it runs on.
pub(crate) type SharedBridge = Arc<Mutex<Option<LinkBridge>>>;
