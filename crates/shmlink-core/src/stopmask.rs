//! Link-wide transmit stop mask.
//!
//! Each contributor (a busy UL ring, the link-wide SUSPEND request) owns one
//! bit. The link is stopped while any bit is set; it resumes only when the
//! last contributor clears its bit. `stop`/`release` report edges of the
//! whole mask so the caller stops or restarts consumers exactly once.

use core::sync::atomic::{AtomicU64, Ordering};

/// Who is holding the link stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// UL ring `id` is waiting for the peer to drain it.
    RingBusy(u16),
    /// A software tx queue overflowed.
    TxqFull,
    /// Peer requested SUSPEND through the status word.
    Suspend,
}

const RING_BITS: u16 = 62;
const TXQ_FULL_BIT: u32 = 62;
const SUSPEND_BIT: u32 = 63;

impl StopReason {
    fn bit(self) -> u64 {
        match self {
            // Ring ids beyond 61 share the last ring bit.
            Self::RingBusy(id) => 1u64 << id.min(RING_BITS - 1),
            Self::TxqFull => 1u64 << TXQ_FULL_BIT,
            Self::Suspend => 1u64 << SUSPEND_BIT,
        }
    }
}

/// What a `stop`/`release` did to the mask as a whole.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaskEdge {
    /// Mask went from empty to non-empty: stop consumers now.
    Stopped,
    /// Mask became empty: resume consumers now.
    Resumed,
    /// This contributor changed, but the link-wide state did not.
    Held,
    /// This contributor was already in the requested state.
    Unchanged,
}

#[derive(Debug, Default)]
pub struct StopMask {
    bits: AtomicU64,
}

impl StopMask {
    pub const fn new() -> Self {
        Self { bits: AtomicU64::new(0) }
    }

    pub fn stop(&self, reason: StopReason) -> MaskEdge {
        let bit = reason.bit();
        let prev = self.bits.fetch_or(bit, Ordering::AcqRel);
        if prev & bit != 0 {
            MaskEdge::Unchanged
        } else if prev == 0 {
            MaskEdge::Stopped
        } else {
            MaskEdge::Held
        }
    }

    pub fn release(&self, reason: StopReason) -> MaskEdge {
        let bit = reason.bit();
        let prev = self.bits.fetch_and(!bit, Ordering::AcqRel);
        if prev & bit == 0 {
            MaskEdge::Unchanged
        } else if prev == bit {
            MaskEdge::Resumed
        } else {
            MaskEdge::Held
        }
    }

    #[inline]
    pub fn is_stopped(&self) -> bool {
        self.bits.load(Ordering::Acquire) != 0
    }

    #[inline]
    pub fn holds(&self, reason: StopReason) -> bool {
        self.bits.load(Ordering::Acquire) & reason.bit() != 0
    }

    /// Number of contributors currently holding the link.
    pub fn holders(&self) -> u32 {
        self.bits.load(Ordering::Acquire).count_ones()
    }

    /// Drop every contributor. Returns true if the link was stopped.
    pub fn reset(&self) -> bool {
        self.bits.swap(0, Ordering::AcqRel) != 0
    }

    pub fn raw(&self) -> u64 {
        self.bits.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resume_needs_every_contributor() {
        let mask = StopMask::new();
        assert_eq!(mask.stop(StopReason::RingBusy(0)), MaskEdge::Stopped);
        assert_eq!(mask.stop(StopReason::RingBusy(3)), MaskEdge::Held);
        assert_eq!(mask.stop(StopReason::Suspend), MaskEdge::Held);
        assert_eq!(mask.holders(), 3);

        assert_eq!(mask.release(StopReason::RingBusy(0)), MaskEdge::Held);
        assert_eq!(mask.release(StopReason::Suspend), MaskEdge::Held);
        assert!(mask.is_stopped());
        assert_eq!(mask.release(StopReason::RingBusy(3)), MaskEdge::Resumed);
        assert!(!mask.is_stopped());
    }

    #[test]
    fn test_repeats_are_unchanged() {
        let mask = StopMask::new();
        assert_eq!(mask.release(StopReason::Suspend), MaskEdge::Unchanged);
        assert_eq!(mask.stop(StopReason::Suspend), MaskEdge::Stopped);
        assert_eq!(mask.stop(StopReason::Suspend), MaskEdge::Unchanged);
        assert_eq!(mask.release(StopReason::Suspend), MaskEdge::Resumed);
        assert_eq!(mask.release(StopReason::Suspend), MaskEdge::Unchanged);
    }

    #[test]
    fn test_reset() {
        let mask = StopMask::new();
        mask.stop(StopReason::TxqFull);
        assert!(mask.holds(StopReason::TxqFull));
        assert!(mask.reset());
        assert!(!mask.reset());
        assert_eq!(mask.raw(), 0);
    }
}
