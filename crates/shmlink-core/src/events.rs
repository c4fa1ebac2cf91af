//! Callbacks from the link into the surrounding driver.

use crate::frame::RxFrame;
use crate::state::LinkState;

/// Registered once at bring-up. Every consumer-visible outcome of the link
/// arrives through one of these: a data callback, a stop/start signal, a
/// state change, or link-down.
///
/// **Contract:** called from the deferred worker context (or the caller's
/// thread for `send`/`open_channel`), never from the IRQ classifier, and
/// never with the state lock held.
pub trait LinkEvents: Send + Sync {
    fn on_link_state_change(&self, old: LinkState, new: LinkState);

    fn on_receive(&self, frame: RxFrame);

    /// The consumer queue for `ch` must stop feeding the link.
    fn on_stop_channel(&self, ch: u16);

    /// The consumer queue for `ch` may resume.
    fn on_start_channel(&self, ch: u16);

    /// The CP went down; `reason` is the crash state delivered to consumers.
    fn on_link_down(&self, reason: LinkState);
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoEvents;

impl LinkEvents for NoEvents {
    fn on_link_state_change(&self, _old: LinkState, _new: LinkState) {}
    fn on_receive(&self, _frame: RxFrame) {}
    fn on_stop_channel(&self, _ch: u16) {}
    fn on_start_channel(&self, _ch: u16) {}
    fn on_link_down(&self, _reason: LinkState) {}
}
