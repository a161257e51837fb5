/// Virtual link endpoint between a device and the stack.
///
/// Two bounded FIFO queues, one per direction:
///   inbound:  FrameSink::deliver  →  [queue]  →  smoltcp (RxToken)
///   outbound: smoltcp (TxToken)   →  [queue]  →  LinkBridge::pump_outbound
///
/// Inbound overflow drops the incoming frame (drop-newest); frames already
/// queued keep their order. Outbound applies backpressure instead: smoltcp
/// is only offered a transmit token while the outbound queue has room, so
/// it keeps the packet and retries on its next poll.
use alloc::collections::VecDeque;
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use bitflags::bitflags;
use log::debug;
use smoltcp::phy::{self, ChecksumCapabilities, Device, DeviceCapabilities, Medium};
use smoltcp::time::Instant;
use smoltcp::wire::EthernetAddress;
use spin::Mutex;

/// Ethernet frame check sequence, counted in the link MTU but never handed
/// to or produced by smoltcp.
const ETHERNET_FCS_LEN: usize = 4;

bitflags! {
    /// What the link asks of the stack.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct LinkCapabilities: u32 {
        /// Link-layer addresses must be resolved (ARP) before IPv4 delivery.
        /// Without it the link carries bare IP packets.
        const RESOLUTION_REQUIRED = 1 << 0;
        /// The device computes and verifies checksums itself.
        const CHECKSUM_OFFLOAD    = 1 << 1;
    }
}

/// Fixed-capacity frame FIFO.
struct FrameQueue {
    frames: VecDeque<Vec<u8>>,
    capacity: usize,
}

impl FrameQueue {
    fn new(capacity: usize) -> Self {
        Self {
            frames: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    fn is_full(&self) -> bool {
        self.frames.len() >= self.capacity
    }

    /// Append a frame, handing it back if the queue is full.
    fn push(&mut self, frame: Vec<u8>) -> Result<(), Vec<u8>> {
        if self.is_full() {
            return Err(frame);
        }
        self.frames.push_back(frame);
        Ok(())
    }

    fn pop(&mut self) -> Option<Vec<u8>> {
        self.frames.pop_front()
    }

    /// Discard everything, returning how many frames were dropped.
    fn clear(&mut self) -> usize {
        let n = self.frames.len();
        self.frames.clear();
        n
    }
}

#[derive(Default)]
struct Counters {
    rx_frames: AtomicU64,
    rx_dropped: AtomicU64,
    rx_oversized: AtomicU64,
    tx_frames: AtomicU64,
    tx_errors: AtomicU64,
    tx_dropped: AtomicU64,
    discarded: AtomicU64,
}

/// Snapshot of a link's counters. Every counter only grows.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LinkStats {
    /// Frames accepted from the device.
    pub rx_frames: u64,
    /// Frames from the device dropped because the inbound queue was full
    /// or the link was closed.
    pub rx_dropped: u64,
    /// Frames from the device dropped for exceeding the MTU.
    pub rx_oversized: u64,
    /// Frames the device accepted for transmission.
    pub tx_frames: u64,
    /// Frames the device failed to transmit.
    pub tx_errors: u64,
    /// Frames from the stack dropped before reaching the device.
    pub tx_dropped: u64,
    /// Frames still queued when the link was closed.
    pub discarded: u64,
}

/// Virtual link endpoint fed by a device and drained by the stack.
pub struct LinkChannel {
    mac: EthernetAddress,
    mtu: usize,
    caps: LinkCapabilities,
    inbound: Mutex<FrameQueue>,
    outbound: Mutex<FrameQueue>,
    open: AtomicBool,
    counters: Counters,
}

impl LinkChannel {
    /// Create a link with `queue_depth` frames of buffering per direction
    /// and frames of at most `mtu` bytes. Address resolution is required.
    pub fn new(queue_depth: usize, mtu: usize, mac: EthernetAddress) -> Self {
        Self {
            mac,
            mtu,
            caps: LinkCapabilities::RESOLUTION_REQUIRED,
            inbound: Mutex::new(FrameQueue::new(queue_depth)),
            outbound: Mutex::new(FrameQueue::new(queue_depth)),
            open: AtomicBool::new(true),
            counters: Counters::default(),
        }
    }

    /// Replace the capability set.
    pub fn with_capabilities(mut self, caps: LinkCapabilities) -> Self {
        self.caps = caps;
        self
    }

    pub fn mac(&self) -> EthernetAddress {
        self.mac
    }

    pub fn mtu(&self) -> usize {
        self.mtu
    }

    pub fn capabilities(&self) -> LinkCapabilities {
        self.caps
    }

    pub fn resolution_required(&self) -> bool {
        self.caps.contains(LinkCapabilities::RESOLUTION_REQUIRED)
    }

    /// Medium the stack runs over this link.
    pub fn medium(&self) -> Medium {
        if self.resolution_required() {
            Medium::Ethernet
        } else {
            Medium::Ip
        }
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    /// Queue a frame received by the device. Never blocks on the stack.
    ///
    /// Returns `false` when the frame was dropped.
    pub fn inject(&self, frame: &[u8]) -> bool {
        if !self.is_open() {
            self.counters.rx_dropped.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        if frame.len() > self.mtu {
            self.counters.rx_oversized.fetch_add(1, Ordering::Relaxed);
            debug!("link {}: dropped oversized rx frame ({} bytes)", self.mac, frame.len());
            return false;
        }

        let mut inbound = self.inbound.lock();
        if inbound.is_full() {
            drop(inbound);
            self.counters.rx_dropped.fetch_add(1, Ordering::Relaxed);
            debug!("link {}: rx queue full, frame dropped", self.mac);
            return false;
        }
        let _ = inbound.push(frame.to_vec());
        self.counters.rx_frames.fetch_add(1, Ordering::Relaxed);
        true
    }

    /// Next frame waiting for the stack.
    pub(crate) fn next_inbound(&self) -> Option<Vec<u8>> {
        self.inbound.lock().pop()
    }

    /// Queue a frame produced by the stack for the device.
    pub(crate) fn emit(&self, frame: Vec<u8>) -> bool {
        if !self.is_open() || frame.len() > self.mtu {
            self.counters.tx_dropped.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        if self.outbound.lock().push(frame).is_err() {
            self.counters.tx_dropped.fetch_add(1, Ordering::Relaxed);
            debug!("link {}: tx queue full, frame dropped", self.mac);
            return false;
        }
        true
    }

    /// Next frame waiting for the device, in the order the stack produced
    /// them.
    pub fn next_outbound(&self) -> Option<Vec<u8>> {
        self.outbound.lock().pop()
    }

    fn outbound_has_room(&self) -> bool {
        self.is_open() && !self.outbound.lock().is_full()
    }

    pub fn inbound_len(&self) -> usize {
        self.inbound.lock().frames.len()
    }

    pub fn outbound_len(&self) -> usize {
        self.outbound.lock().frames.len()
    }

    pub(crate) fn record_tx(&self, ok: bool) {
        if ok {
            self.counters.tx_frames.fetch_add(1, Ordering::Relaxed);
        } else {
            self.counters.tx_errors.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Stop accepting frames in both directions and discard what is
    /// queued. Idempotent.
    pub fn close(&self) {
        if !self.open.swap(false, Ordering::AcqRel) {
            return;
        }
        let dropped = self.inbound.lock().clear() + self.outbound.lock().clear();
        self.counters.discarded.fetch_add(dropped as u64, Ordering::Relaxed);
        debug!("link {}: closed, {} queued frames discarded", self.mac, dropped);
    }

    pub fn stats(&self) -> LinkStats {
        let c = &self.counters;
        LinkStats {
            rx_frames: c.rx_frames.load(Ordering::Relaxed),
            rx_dropped: c.rx_dropped.load(Ordering::Relaxed),
            rx_oversized: c.rx_oversized.load(Ordering::Relaxed),
            tx_frames: c.tx_frames.load(Ordering::Relaxed),
            tx_errors: c.tx_errors.load(Ordering::Relaxed),
            tx_dropped: c.tx_dropped.load(Ordering::Relaxed),
            discarded: c.discarded.load(Ordering::Relaxed),
        }
    }

    /// smoltcp view of the link.
    pub fn device_capabilities(&self) -> DeviceCapabilities {
        let mut caps = DeviceCapabilities::default();
        caps.medium = self.medium();
        caps.max_transmission_unit = match caps.medium {
            Medium::Ethernet => self.mtu.saturating_sub(ETHERNET_FCS_LEN),
            _ => self.mtu,
        };
        caps.max_burst_size = None;
        if self.caps.contains(LinkCapabilities::CHECKSUM_OFFLOAD) {
            caps.checksum = ChecksumCapabilities::ignored();
        }
        caps
    }
}

/// Adapter that implements smoltcp's `Device` trait over a [`LinkChannel`].
pub(crate) struct LinkDevice {
    link: Arc<LinkChannel>,
}

impl LinkDevice {
    pub(crate) fn new(link: Arc<LinkChannel>) -> Self {
        Self { link }
    }

    pub(crate) fn link(&self) -> &Arc<LinkChannel> {
        &self.link
    }
}

impl Device for LinkDevice {
    type RxToken<'a> = RxToken;
    type TxToken<'a> = TxToken<'a>;

    fn receive(&mut self, _timestamp: Instant) -> Option<(Self::RxToken<'_>, Self::TxToken<'_>)> {
        let frame = self.link.next_inbound()?;
        Some((RxToken { frame }, TxToken { link: &self.link }))
    }

    fn transmit(&mut self, _timestamp: Instant) -> Option<Self::TxToken<'_>> {
        if self.link.outbound_has_room() {
            Some(TxToken { link: &self.link })
        } else {
            None
        }
    }

    fn capabilities(&self) -> DeviceCapabilities {
        self.link.device_capabilities()
    }
}

/// Receive token: holds one inbound frame.
pub(crate) struct RxToken {
    frame: Vec<u8>,
}

impl phy::RxToken for RxToken {
    fn consume<R, F>(mut self, f: F) -> R
    where
        F: FnOnce(&mut [u8]) -> R,
    {
        f(&mut self.frame)
    }
}

/// Transmit token: the frame smoltcp writes lands in the outbound queue.
pub(crate) struct TxToken<'a> {
    link: &'a Arc<LinkChannel>,
}

impl phy::TxToken for TxToken<'_> {
    fn consume<R, F>(self, len: usize, f: F) -> R
    where
        F: FnOnce(&mut [u8]) -> R,
    {
        let mut buf = vec![0u8; len];
        let result = f(&mut buf);
        self.link.emit(buf);
        result
    }
}
