//! Doorbell / mailbox register abstraction.
//!
//! The link sees the hardware mailbox as three 16-bit registers plus the
//! ability to raise an interrupt on the CP:
//!
//! | Register | Written by | Meaning                                     |
//! |----------|------------|---------------------------------------------|
//! | int2ap   | CP         | last doorbell word sent to the AP           |
//! | int2cp   | AP         | last doorbell word sent to the CP           |
//! | status   | CP         | status word (link-wide flow-control bit)    |
//!
//! # Implementors
//!
//! - `RegisterMailbox` (shmlink-module): registers in process memory with an
//!   eventfd kick per direction. Used with the CP simulator and in tests.
//! - A platform mailbox driver maps the same contract onto MMIO.

use crate::error::Result;

/// AP side of the mailbox.
///
/// **Contract:**
/// - `send_int2cp()` must never block; it writes the word and raises the
///   CP interrupt.
/// - `take_irq()` is called from the IRQ classifier and must not block.
/// - Reads are side-effect free, so the IRQ classifier may snapshot them.
pub trait Mailbox: Send + Sync {
    /// Doorbell word most recently written by the CP.
    fn read_int2ap(&self) -> u16;

    /// Doorbell word most recently written by the AP.
    fn read_int2cp(&self) -> u16;

    /// CP status word.
    fn read_status(&self) -> u16;

    /// Write `value` to int2cp and interrupt the CP.
    fn send_int2cp(&self, value: u16) -> Result<()>;

    /// Acknowledge one pending AP interrupt and return its doorbell word.
    /// `None` when nothing is pending.
    fn take_irq(&self) -> Option<u16>;

    /// Whether the physical link is awake enough to carry a doorbell.
    fn link_active(&self) -> bool {
        true
    }
}
