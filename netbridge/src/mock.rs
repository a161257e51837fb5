/// In-memory devices, clock and entropy for tests and host-side harnesses.
///
/// - `MockDevice` records every transmitted frame and lets the test inject
///   received ones.
/// - `WireDevice::pair` connects two interfaces back to back.
/// - `TickOps` is a clock that moves forward on every read.
/// - `FixedRng` / `FailingRng` are deterministic entropy sources.
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use core::num::NonZeroU32;
use core::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use rand_core::{CryptoRng, RngCore};
use spin::Mutex;

use crate::device::{DeviceError, FrameSink, NetworkDevice};
use crate::ops::NetOps;

/// Device that records transmitted frames.
#[derive(Default)]
pub struct MockDevice {
    sink: Mutex<Option<FrameSink>>,
    sent: Mutex<Vec<Vec<u8>>>,
    failing: AtomicBool,
    attaches: AtomicUsize,
    tx_attempts: AtomicUsize,
}

impl MockDevice {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Simulate reception of `frame`. Returns `false` if no sink is
    /// attached or the link dropped it.
    pub fn receive(&self, frame: &[u8]) -> bool {
        let sink = self.sink.lock().clone();
        sink.is_some_and(|s| s.deliver(frame))
    }

    /// Make every following transmit fail (or succeed again).
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::Relaxed);
    }

    /// Frames transmitted successfully so far, in order.
    pub fn sent(&self) -> Vec<Vec<u8>> {
        self.sent.lock().clone()
    }

    pub fn take_sent(&self) -> Vec<Vec<u8>> {
        core::mem::take(&mut *self.sent.lock())
    }

    /// How many times `attach` was called.
    pub fn attach_count(&self) -> usize {
        self.attaches.load(Ordering::Relaxed)
    }

    pub fn tx_attempts(&self) -> usize {
        self.tx_attempts.load(Ordering::Relaxed)
    }

    pub fn is_attached(&self) -> bool {
        self.sink.lock().is_some()
    }
}

impl NetworkDevice for MockDevice {
    fn transmit(&self, frame: &[u8]) -> Result<(), DeviceError> {
        self.tx_attempts.fetch_add(1, Ordering::Relaxed);
        if self.failing.load(Ordering::Relaxed) {
            return Err(DeviceError::Io);
        }
        self.sent.lock().push(frame.to_vec());
        Ok(())
    }

    fn attach(&self, sink: FrameSink) {
        self.attaches.fetch_add(1, Ordering::Relaxed);
        *self.sink.lock() = Some(sink);
    }

    fn detach(&self) {
        *self.sink.lock() = None;
    }
}

/// One end of a point-to-point cable: frames transmitted on one end are
/// delivered to the other end's sink.
#[derive(Default)]
pub struct WireDevice {
    sink: Mutex<Option<FrameSink>>,
    peer: Mutex<Weak<WireDevice>>,
}

impl WireDevice {
    pub fn pair() -> (Arc<Self>, Arc<Self>) {
        let a = Arc::new(Self::default());
        let b = Arc::new(Self::default());
        *a.peer.lock() = Arc::downgrade(&b);
        *b.peer.lock() = Arc::downgrade(&a);
        (a, b)
    }
}

impl NetworkDevice for WireDevice {
    fn transmit(&self, frame: &[u8]) -> Result<(), DeviceError> {
        let peer = self.peer.lock().upgrade().ok_or(DeviceError::NotReady)?;
        let sink = peer.sink.lock().clone();
        match sink {
            Some(sink) => {
                // a full peer queue is the peer's loss, not a transmit error
                sink.deliver(frame);
                Ok(())
            }
            None => Err(DeviceError::NotReady),
        }
    }

    fn attach(&self, sink: FrameSink) {
        *self.sink.lock() = Some(sink);
    }

    fn detach(&self) {
        *self.sink.lock() = None;
    }
}

/// Clock advancing by `step` milliseconds each time it is read.
pub struct TickOps {
    now: AtomicU64,
    step: u64,
}

impl TickOps {
    pub fn new(step: u64) -> Arc<Self> {
        Arc::new(Self {
            now: AtomicU64::new(0),
            step,
        })
    }

    pub fn advance(&self, ms: u64) {
        self.now.fetch_add(ms, Ordering::Relaxed);
    }

    /// Current time, without advancing.
    pub fn peek(&self) -> u64 {
        self.now.load(Ordering::Relaxed)
    }
}

impl NetOps for TickOps {
    fn now_ms(&self) -> u64 {
        self.now.fetch_add(self.step, Ordering::Relaxed)
    }
}

/// Deterministic xorshift generator. Not a cryptographic source; it only
/// claims to be one so tests can pass it where one is required.
pub struct FixedRng(u64);

impl FixedRng {
    pub fn new(seed: u64) -> Self {
        Self(seed.wrapping_mul(0x9e37_79b9_7f4a_7c15) | 1)
    }
}

impl RngCore for FixedRng {
    fn next_u32(&mut self) -> u32 {
        (self.next_u64() >> 32) as u32
    }

    fn next_u64(&mut self) -> u64 {
        let mut x = self.0;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.0 = x;
        x
    }

    fn fill_bytes(&mut self, dest: &mut [u8]) {
        rand_core::impls::fill_bytes_via_next(self, dest)
    }

    fn try_fill_bytes(&mut self, dest: &mut [u8]) -> Result<(), rand_core::Error> {
        self.fill_bytes(dest);
        Ok(())
    }
}

impl CryptoRng for FixedRng {}

/// Entropy source that is never ready.
pub struct FailingRng;

impl RngCore for FailingRng {
    fn next_u32(&mut self) -> u32 {
        0
    }

    fn next_u64(&mut self) -> u64 {
        0
    }

    fn fill_bytes(&mut self, dest: &mut [u8]) {
        dest.fill(0);
    }

    fn try_fill_bytes(&mut self, _dest: &mut [u8]) -> Result<(), rand_core::Error> {
        Err(rand_core::Error::from(NonZeroU32::MIN))
    }
}

impl CryptoRng for FailingRng {}
