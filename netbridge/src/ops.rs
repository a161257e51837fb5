//! Runtime operations the stack needs from its host.
//!
//! Handed to [`crate::Stack::new`]; each stack holds its own.

/// Host runtime services: a monotonic clock and a cooperative yield point.
pub trait NetOps: Send + Sync {
    /// Monotonic time in milliseconds.
    ///
    /// Drives smoltcp timestamps (retransmission, ARP expiry) and every
    /// socket deadline.
    fn now_ms(&self) -> u64;

    /// Called by blocking socket operations between two polls of the stack.
    ///
    /// A cooperative scheduler yields to the other tasks here (device
    /// receive, outbound pump). The default only hints a spin loop.
    fn relax(&self) {
        core::hint::spin_loop();
    }
}
