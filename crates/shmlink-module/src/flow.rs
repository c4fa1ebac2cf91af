//! Flow control: per-UL-ring busy state, the REQ_ACK/RES_ACK handshake,
//! link-wide SUSPEND/RESUME and consumer stop/start.
//!
//! A UL ring goes BUSY when its usage crosses the high-water mark (or a
//! write finds no space). Going busy sets the ring's bit in the link-wide
//! `StopMask` and asks the CP for an acknowledgment with the class's
//! REQ_ACK doorbell. While busy, every tx attempt polls the ring:
//!
//! - drained to the low-water mark: clear busy, release the bit
//! - otherwise: count one busy poll; every `busy_count_mask + 1` polls a
//!   fresh REQ_ACK goes out (a lost doorbell does not stall the ring); at
//!   `max_tx_busy_count` the CP is declared stuck
//!
//! Consumers are stopped when the mask goes non-empty and restarted only
//! when every contributor has released its bit.

use std::collections::BTreeSet;

use shmlink_core::config::FlowThresholds;
use shmlink_core::error::{LinkError, Result};
use shmlink_core::spinlock::SpinLock;
use shmlink_core::stopmask::{MaskEdge, StopMask, StopReason};
use shmlink_core::wire::{
    mask2int, status2flowctl, traffic_class, TrafficClass, MASK_TX_FLOWCTL_SUSPEND,
};
use shmlink_core::{kdebug, kerror, kinfo};

use crate::link::LinkDevice;

/// Busy bookkeeping of one UL ring.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RingFlow {
    pub busy: bool,
    /// Consecutive polls that found the ring still above low water.
    pub busy_count: u32,
    /// REQ_ACKs sent and not yet answered.
    pub req_ack_cnt: u32,
}

/// Verdict of a tx attempt on a ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxGate {
    /// Ring was not busy.
    Open,
    /// Ring was busy and has drained; carries the mask edge.
    Released(MaskEdge),
    /// Still busy. `req_ack` asks the caller to send a fresh REQ_ACK.
    Busy { req_ack: bool },
    /// Busy polling ran out of budget.
    Exhausted,
}

/// Link-wide flow command carried in the status word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowCmd {
    Suspend,
    Resume,
}

pub struct FlowControl {
    th: FlowThresholds,
    rings: Vec<SpinLock<RingFlow>>,
    mask: StopMask,
    last_cmd: SpinLock<Option<FlowCmd>>,
    /// Channels whose consumer queue is currently stopped.
    stopped: SpinLock<BTreeSet<u16>>,
    /// Channels stopped by the mask, restarted when it clears.
    held: SpinLock<BTreeSet<u16>>,
}

impl FlowControl {
    pub fn new(num_rings: usize, th: FlowThresholds) -> Self {
        Self {
            th,
            rings: (0..num_rings).map(|_| SpinLock::new(RingFlow::default())).collect(),
            mask: StopMask::new(),
            last_cmd: SpinLock::new(None),
            stopped: SpinLock::new(BTreeSet::new()),
            held: SpinLock::new(BTreeSet::new()),
        }
    }

    pub fn thresholds(&self) -> &FlowThresholds {
        &self.th
    }

    pub fn mask(&self) -> &StopMask {
        &self.mask
    }

    /// `usage` of a ring of `len` slots is past the high-water mark.
    pub fn above_high_water(&self, len: u32, usage: u32) -> bool {
        usage as u64 * 100 > len as u64 * self.th.high_water_pct as u64
    }

    fn ring(&self, id: u16) -> Option<&SpinLock<RingFlow>> {
        self.rings.get(id as usize)
    }

    pub fn state(&self, id: u16) -> RingFlow {
        self.ring(id).map(|r| *r.lock()).unwrap_or_default()
    }

    pub fn is_busy(&self, id: u16) -> bool {
        self.state(id).busy
    }

    /// Mark ring `id` busy. `None` if it already was (no new REQ_ACK).
    pub fn start(&self, id: u16) -> Option<MaskEdge> {
        let ring = self.ring(id)?;
        {
            let mut f = ring.lock();
            if f.busy {
                return None;
            }
            f.busy = true;
            f.busy_count = 0;
            f.req_ack_cnt += 1;
        }
        Some(self.mask.stop(StopReason::RingBusy(id)))
    }

    fn release(&self, id: u16, f: &mut RingFlow) -> MaskEdge {
        f.busy = false;
        f.busy_count = 0;
        self.mask.release(StopReason::RingBusy(id))
    }

    /// Poll a ring before writing to it.
    pub fn check(&self, id: u16, usage: u32) -> TxGate {
        let Some(ring) = self.ring(id) else {
            return TxGate::Open;
        };
        let mut f = ring.lock();
        if !f.busy {
            return TxGate::Open;
        }
        if usage <= self.th.low_water {
            return TxGate::Released(self.release(id, &mut f));
        }
        f.busy_count += 1;
        if f.busy_count >= self.th.max_tx_busy_count {
            return TxGate::Exhausted;
        }
        let req_ack = f.busy_count & self.th.busy_count_mask == 0;
        if req_ack {
            f.req_ack_cnt += 1;
        }
        TxGate::Busy { req_ack }
    }

    /// The CP answered one REQ_ACK. Releases the ring if it has drained.
    pub fn res_ack(&self, id: u16, usage: u32) -> Option<MaskEdge> {
        let ring = self.ring(id)?;
        let mut f = ring.lock();
        f.req_ack_cnt = f.req_ack_cnt.saturating_sub(1);
        if f.busy && usage <= self.th.low_water {
            Some(self.release(id, &mut f))
        } else {
            None
        }
    }

    pub fn suspend(&self) -> MaskEdge {
        self.mask.stop(StopReason::Suspend)
    }

    pub fn resume(&self) -> MaskEdge {
        self.mask.release(StopReason::Suspend)
    }

    pub fn txq_full(&self) -> MaskEdge {
        self.mask.stop(StopReason::TxqFull)
    }

    pub fn txq_drained(&self) -> MaskEdge {
        self.mask.release(StopReason::TxqFull)
    }

    /// Decode the status word; repeats of the last command are dropped.
    pub fn status2flowctl(&self, status: u16) -> Option<FlowCmd> {
        let cmd = if status2flowctl(status) == MASK_TX_FLOWCTL_SUSPEND {
            FlowCmd::Suspend
        } else {
            FlowCmd::Resume
        };
        let mut last = self.last_cmd.lock();
        if *last == Some(cmd) {
            return None;
        }
        *last = Some(cmd);
        Some(cmd)
    }

    /// Forget all busy state, ack counters and mask bits.
    pub fn reset(&self) {
        for r in &self.rings {
            *r.lock() = RingFlow::default();
        }
        self.mask.reset();
        *self.last_cmd.lock() = None;
        self.held.lock().clear();
    }

    pub fn mark_stopped(&self, ch: u16) -> bool {
        self.stopped.lock().insert(ch)
    }

    pub fn mark_started(&self, ch: u16) -> bool {
        self.stopped.lock().remove(&ch)
    }

    pub fn is_stopped(&self, ch: u16) -> bool {
        self.stopped.lock().contains(&ch)
    }

    pub fn stopped_channels(&self) -> Vec<u16> {
        self.stopped.lock().iter().copied().collect()
    }

    fn hold(&self, ch: u16) {
        self.held.lock().insert(ch);
    }

    fn take_held(&self) -> Vec<u16> {
        std::mem::take(&mut *self.held.lock()).into_iter().collect()
    }
}

// ── Link glue ──

impl LinkDevice {
    /// Stop the consumer queue of `ch`. Returns false if it already was.
    pub fn stop_channel(&self, ch: u16) -> bool {
        if !self.flow.mark_stopped(ch) {
            return false;
        }
        kdebug!("{}: stop ch {}", self.name(), ch);
        self.events.on_stop_channel(ch);
        true
    }

    /// Restart the consumer queue of `ch`. Returns false if it was running.
    pub fn start_channel(&self, ch: u16) -> bool {
        if !self.flow.mark_started(ch) {
            return false;
        }
        kdebug!("{}: start ch {}", self.name(), ch);
        self.events.on_start_channel(ch);
        true
    }

    /// Stop every consumer (crash, teardown). Not restarted by flow control.
    pub(crate) fn stop_all_channels(&self) {
        for ch in self.consumer_channels() {
            self.stop_channel(ch);
        }
    }

    /// Act on a change of the whole stop mask. `origin` is the channel of
    /// the ring that caused it, if any.
    pub(crate) fn apply_mask_edge(&self, edge: MaskEdge, origin: Option<u16>) {
        match edge {
            MaskEdge::Stopped => {
                kdebug!("{}: tx stopped (mask {:#x})", self.name(), self.flow.mask().raw());
                let mut chs = self.consumer_channels();
                if let Some(ch) = origin {
                    if !chs.contains(&ch) {
                        chs.push(ch);
                    }
                }
                for ch in chs {
                    if self.stop_channel(ch) {
                        self.flow.hold(ch);
                    }
                }
            }
            MaskEdge::Resumed => {
                kdebug!("{}: tx resumed", self.name());
                for ch in self.flow.take_held() {
                    self.start_channel(ch);
                }
            }
            MaskEdge::Held | MaskEdge::Unchanged => {}
        }
    }

    pub fn send_req_ack(&self, class: TrafficClass) -> Result<()> {
        kdebug!("{}: REQ_ACK {:?} -> CP", self.name(), class);
        self.send_ipc_irq(mask2int(class.req_ack_mask()))
    }

    pub fn send_res_ack(&self, class: TrafficClass) -> Result<()> {
        kdebug!("{}: RES_ACK {:?} -> CP", self.name(), class);
        self.send_ipc_irq(mask2int(class.res_ack_mask()))
    }

    /// UL ring `id` crossed high water (or had no space).
    pub(crate) fn start_tx_flow_ctrl(&self, id: u16, ch: u16) {
        if let Some(edge) = self.flow.start(id) {
            kdebug!("{}: RB[{}:{}] BUSY", self.name(), id, ch);
            self.apply_mask_edge(edge, Some(ch));
            if let Err(e) = self.send_req_ack(traffic_class(ch)) {
                kerror!("{}: ERR! REQ_ACK failed: {}", self.name(), e);
            }
        }
    }

    /// Gate a write to UL ring `id` whose usage is `usage`.
    pub(crate) fn check_tx_flow_ctrl(&self, id: u16, ch: u16, usage: u32) -> Result<()> {
        match self.flow.check(id, usage) {
            TxGate::Open => Ok(()),
            TxGate::Released(edge) => {
                kdebug!("{}: RB[{}:{}] busy cleared", self.name(), id, ch);
                self.apply_mask_edge(edge, Some(ch));
                Ok(())
            }
            TxGate::Busy { req_ack } => {
                if req_ack {
                    self.send_req_ack(traffic_class(ch))?;
                }
                Err(LinkError::Busy(id))
            }
            TxGate::Exhausted => {
                kerror!(
                    "{}: ERR! RB[{}:{}] no RES_ACK after {} polls",
                    self.name(), id, ch, self.flow.thresholds().max_tx_busy_count
                );
                self.force_crash("tx busy retries exhausted");
                Err(LinkError::Crashed)
            }
        }
    }

    /// CP answered a REQ_ACK of `class`.
    pub(crate) fn recv_res_ack(&self, class: TrafficClass) -> Result<()> {
        let table = self.ring_table()?;
        for ring in table.ul.iter().filter(|r| traffic_class(r.ch()) == class) {
            let usage = ring.usage()?;
            if let Some(edge) = self.flow.res_ack(ring.id(), usage) {
                kdebug!("{}: RB[{}:{}] RES_ACK, busy cleared", self.name(), ring.id(), ring.ch());
                self.apply_mask_edge(edge, Some(ring.ch()));
            }
        }
        if table.has_pending_tx() {
            self.arm_tx_timer();
        }
        Ok(())
    }

    /// CP asked us to drain `class` and confirm.
    pub(crate) fn recv_req_ack(&self, class: TrafficClass) -> Result<()> {
        self.drain_class(class)?;
        self.send_res_ack(class)
    }

    pub(crate) fn handle_flowctl_status(&self, status: u16) {
        match self.flow.status2flowctl(status) {
            Some(FlowCmd::Suspend) => self.suspend_tx(),
            Some(FlowCmd::Resume) => self.resume_tx(),
            None => {}
        }
    }

    /// Link-wide stop requested from outside the ring occupancy.
    pub fn suspend_tx(&self) {
        let edge = self.flow.suspend();
        if edge != MaskEdge::Unchanged {
            kinfo!("{}: tx SUSPEND", self.name());
        }
        self.apply_mask_edge(edge, None);
    }

    pub fn resume_tx(&self) {
        let edge = self.flow.resume();
        if edge != MaskEdge::Unchanged {
            kinfo!("{}: tx RESUME", self.name());
        }
        self.apply_mask_edge(edge, None);
    }
}
