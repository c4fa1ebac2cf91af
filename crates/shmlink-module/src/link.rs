//! `LinkDevice`: one AP↔CP shared-memory link.
//!
//! The device is the single context every operation runs against: the
//! shared region, the mailbox, the ring table, flow control, the command
//! state machine, IOSM and diagnostics are all fields of it. It is built
//! once by `LinkBuilder` and shared as `Arc<LinkDevice>` between the IRQ
//! classifier, the deferred worker and the callers of `send`.
//!
//! ```text
//!   doorbell ──► classify_irq() ──► IrqWork ──► handle_irq()
//!                 (IRQ context)     hand-off     (worker)
//!                                                  ├─ Command ──► command.rs
//!                                                  ├─ Control ──► iosm.rs
//!                                                  └─ Data ─────► flow.rs + rx
//! ```

use std::borrow::Cow;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use shmlink_core::cell::CellAllocator;
use shmlink_core::completion::Completion;
use shmlink_core::config::LinkConfig;
use shmlink_core::error::{LinkError, Result, Severity};
use shmlink_core::events::{LinkEvents, NoEvents};
use shmlink_core::frame::RxFrame;
use shmlink_core::mailbox::Mailbox;
use shmlink_core::spinlock::SpinLock;
use shmlink_core::state::{Direction, LinkState};
use shmlink_core::wire::{
    cmd_valid, int2cmd, int_valid, mask2int, traffic_class, Command, LinkHeader, TrafficClass,
    CH_FMT_0, CH_RFS_0, LINK_HDR_SIZE, MASK_CMD_FIELD, MASK_SEND_DATA, MASK_SEND_FMT,
    MASK_SEND_RAW, MEM_IPC_MAGIC,
};
use shmlink_core::{kdebug, kerror, kerror_ratelimited, kinfo, ktrace, kwarn};

use crate::flow::FlowControl;
use crate::iosm::{IosmState, IosmTx};
use crate::layout::{ring_for_channel, CMD_RGN_SIZE, MIN_REGION_SIZE, OFF_ACCESS, OFF_CMD_RGN, OFF_MAGIC};
use crate::legacy::LegacyIpc;
use crate::region::SharedRegion;
use crate::sbd::SbdRing;
use crate::sbd_link::{RingTable, TxFrame};
use crate::snapshot::{Diagnostics, MemSnapshot};
use crate::zerocopy::BitmapCellPool;

/// What a doorbell word asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IrqKind {
    /// Link command (raw command field, may be unknown).
    Command(u16),
    /// A record is waiting in the IOSM area.
    Control,
    /// Data-ready and ack bits.
    Data(u16),
}

/// A classified interrupt, handed from IRQ context to the worker.
#[derive(Debug, Clone)]
pub struct IrqWork {
    pub kind: IrqKind,
    pub snap: MemSnapshot,
}

/// State guarded by the link's state lock.
#[derive(Debug, Default)]
pub(crate) struct LinkCore {
    pub state: LinkState,
    /// PHONE_STARTs seen since the link last went OFFLINE.
    pub phone_start_count: u32,
    pub cp_boot_done: bool,
    /// PHONE_START arrived before the consumers were ready.
    pub phone_start_pending: bool,
    /// Consumer channels currently open.
    pub opened: BTreeSet<u16>,
    /// Negotiated by INIT_START.
    pub aligned: bool,
}

impl LinkCore {
    /// Both control-channel consumers are open.
    pub fn consumers_ready(&self) -> bool {
        self.opened.contains(&CH_FMT_0) && self.opened.contains(&CH_RFS_0)
    }
}

#[derive(Debug, Default)]
pub(crate) struct Timers {
    tx: Option<Instant>,
    datalloc: Option<Instant>,
    crash_ack: Option<Instant>,
    iosm: Option<Instant>,
}

fn arm_at(slot: &mut Option<Instant>, due: Instant) {
    if slot.map_or(true, |d| due < d) {
        *slot = Some(due);
    }
}

fn take_due(slot: &mut Option<Instant>, now: Instant) -> bool {
    match *slot {
        Some(d) if d <= now => {
            *slot = None;
            true
        }
        _ => false,
    }
}

/// Keep the first error of a sequence of independent steps.
fn keep_first(acc: &mut Result<()>, r: Result<()>) {
    if let Err(e) = r {
        if acc.is_ok() {
            *acc = Err(e);
        }
    }
}

pub struct LinkDevice {
    pub(crate) cfg: LinkConfig,
    pub(crate) region: Arc<SharedRegion>,
    pub(crate) mbox: Arc<dyn Mailbox>,
    pub(crate) events: Arc<dyn LinkEvents>,
    pub(crate) core: SpinLock<LinkCore>,
    pub(crate) timers: SpinLock<Timers>,
    pub(crate) table: SpinLock<Option<Arc<RingTable>>>,
    pub(crate) sbd_active: AtomicBool,
    pub(crate) legacy: LegacyIpc,
    pub(crate) flow: FlowControl,
    pub(crate) iosm: IosmState,
    pub(crate) diag: Diagnostics,
    pub(crate) cells: Option<Arc<dyn CellAllocator>>,
    pub(crate) forced_crash: AtomicBool,
    pub(crate) boot_done: Completion,
}

impl LinkDevice {
    #[inline]
    pub fn name(&self) -> &str {
        &self.cfg.name
    }

    pub fn config(&self) -> &LinkConfig {
        &self.cfg
    }

    pub fn region(&self) -> &Arc<SharedRegion> {
        &self.region
    }

    pub fn mailbox(&self) -> &Arc<dyn Mailbox> {
        &self.mbox
    }

    pub fn flow(&self) -> &FlowControl {
        &self.flow
    }

    pub fn iosm(&self) -> &IosmState {
        &self.iosm
    }

    pub fn cells(&self) -> Option<&Arc<dyn CellAllocator>> {
        self.cells.as_ref()
    }

    pub fn state(&self) -> LinkState {
        self.core.lock().state
    }

    pub fn aligned(&self) -> bool {
        self.core.lock().aligned
    }

    pub fn opened_channels(&self) -> Vec<u16> {
        self.core.lock().opened.iter().copied().collect()
    }

    /// Channels whose consumer queues flow control stops and starts.
    pub(crate) fn consumer_channels(&self) -> Vec<u16> {
        self.opened_channels()
    }

    /// Commit a new link state. Notifies outside the lock.
    pub(crate) fn transition(&self, new: LinkState) -> LinkState {
        let old = {
            let mut core = self.core.lock();
            std::mem::replace(&mut core.state, new)
        };
        if old != new {
            kinfo!("{}: state {} -> {}", self.name(), old, new);
            self.events.on_link_state_change(old, new);
        }
        if new.is_online() {
            self.boot_done.complete_all();
        }
        old
    }

    /// Write a doorbell word to the CP.
    pub fn send_ipc_irq(&self, word: u16) -> Result<()> {
        ktrace!("{}: int2cp {:#06x}", self.name(), word);
        self.mbox.send_int2cp(word)
    }

    pub(crate) fn send_cmd(&self, cmd: Command) -> Result<()> {
        kdebug!("{}: {} -> CP", self.name(), cmd);
        self.send_ipc_irq(cmd.to_int())
    }

    /// The link may carry data: ONLINE, handshake words intact, and no
    /// forced crash under way.
    pub fn ipc_active(&self) -> bool {
        if !self.state().is_online() || self.crash_in_progress() {
            return false;
        }
        // IOSM links carry no magic/access handshake.
        if self.cfg.dpram_magic && !self.cfg.iosm {
            let magic = self.region.read_u32(OFF_MAGIC).unwrap_or(0);
            let access = self.region.read_u32(OFF_ACCESS).unwrap_or(0);
            if magic != MEM_IPC_MAGIC || access != 1 {
                kerror_ratelimited!(
                    "{}: ERR! magic:{:#x} access:{} -> not active",
                    self.name(), magic, access
                );
                return false;
            }
        }
        true
    }

    // ── Transmit ──

    /// Frame `payload` for `ring`: link-header rings get the header.
    fn frame_for<'a>(&self, ring: &SbdRing, ch: u16, payload: &'a [u8]) -> Result<Cow<'a, [u8]>> {
        if !ring.attrs().lnk_hdr {
            return Ok(Cow::Borrowed(payload));
        }
        let hdr = LinkHeader::for_payload(ch as u8, payload.len()).ok_or(LinkError::TooLarge {
            len: payload.len(),
            max: u16::MAX as usize - LINK_HDR_SIZE,
        })?;
        let mut frame = Vec::with_capacity(LINK_HDR_SIZE + payload.len());
        frame.extend_from_slice(&hdr.encode());
        frame.extend_from_slice(payload);
        Ok(Cow::Owned(frame))
    }

    /// Gate, write and account one frame on UL ring `id`. The caller rings
    /// the doorbell.
    fn write_ring(&self, table: &RingTable, id: u16, ch: u16, frame: &[u8]) -> Result<()> {
        let ring = &table.ul[id as usize];
        self.check_tx_flow_ctrl(id, ring.ch(), ring.usage()?)?;
        if let Err(e) = ring.tx(ch, frame) {
            if matches!(e, LinkError::NoSpace { .. }) {
                self.start_tx_flow_ctrl(id, ring.ch());
            }
            return Err(e);
        }
        if self.flow.above_high_water(ring.len(), ring.usage()?) {
            self.start_tx_flow_ctrl(id, ring.ch());
        }
        Ok(())
    }

    /// Write `payload` for channel `ch` straight into its UL ring and ring
    /// SEND_DATA. Returns the payload length.
    ///
    /// Errors: `Inactive` off-line, `NoSuchChannel`, `Busy` while the ring
    /// waits for the CP's ack, `NoSpace`/`TooLarge` from the ring.
    pub fn send(&self, ch: u16, payload: &[u8]) -> Result<usize> {
        if !self.ipc_active() {
            return Err(LinkError::Inactive);
        }
        if !self.cfg.sbd_ipc {
            return self.send_legacy(ch, payload);
        }
        if !self.sbd_active() {
            return Err(LinkError::Inactive);
        }
        let table = self.ring_table()?;
        let id = table.ring_id(ch)?;
        let frame = self.frame_for(&table.ul[id as usize], ch, payload)?;
        self.write_ring(&table, id, ch, &frame)?;
        self.send_ipc_irq(mask2int(MASK_SEND_DATA))?;
        Ok(payload.len())
    }

    fn send_legacy(&self, ch: u16, payload: &[u8]) -> Result<usize> {
        let class = traffic_class(ch);
        match self.legacy.send(class, ch as u8, payload) {
            Ok(n) => {
                self.send_ipc_irq(mask2int(class.send_mask()))?;
                Ok(n)
            }
            Err(e @ LinkError::NoSpace { .. }) => {
                self.send_req_ack(class)?;
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    /// Queue `payload` for the tx timer (SBD links only).
    ///
    /// A full queue stops the channel's consumer and returns `Busy`.
    pub fn enqueue(&self, ch: u16, payload: &[u8]) -> Result<()> {
        if !self.ipc_active() || !self.sbd_active() {
            return Err(LinkError::Inactive);
        }
        let table = self.ring_table()?;
        let id = table.ring_id(ch)?;
        let ring = &table.ul[id as usize];
        let data = self.frame_for(ring, ch, payload)?.into_owned();
        ring.slots_for(data.len())?;
        {
            let mut q = table.txq[id as usize].lock();
            if q.len() >= self.cfg.txq_depth {
                drop(q);
                kerror_ratelimited!("{}: TXQ[{}:{}] full ({})", self.name(), id, ch, self.cfg.txq_depth);
                let edge = self.flow.txq_full();
                self.apply_mask_edge(edge, Some(ch));
                return Err(LinkError::Busy(id));
            }
            q.push_back(TxFrame { ch, data });
        }
        self.arm_tx_timer();
        Ok(())
    }

    /// Move queued frames into their rings. Runs from the tx timer.
    ///
    /// A busy or full ring keeps its queue and the timer is re-armed after
    /// `res_ack_wait`; any other ring failure forces a crash.
    pub fn tx_pump(&self) -> Result<usize> {
        if !self.ipc_active() {
            return Ok(0);
        }
        let table = self.ring_table()?;
        let mut sent = 0usize;
        let mut blocked = false;

        for id in 0..table.num_rings() as u16 {
            let q = &table.txq[id as usize];
            loop {
                let Some(frame) = q.lock().pop_front() else {
                    break;
                };
                match self.write_ring(&table, id, frame.ch, &frame.data) {
                    Ok(()) => sent += 1,
                    Err(LinkError::Busy(_)) | Err(LinkError::NoSpace { .. }) => {
                        q.lock().push_front(frame);
                        blocked = true;
                        break;
                    }
                    Err(e) => {
                        kerror!("{}: ERR! TXQ[{}:{}] {}", self.name(), id, frame.ch, e);
                        self.force_crash("tx pump failure");
                        return Err(e);
                    }
                }
            }
        }

        if sent > 0 {
            self.send_ipc_irq(mask2int(MASK_SEND_DATA))?;
        }
        if table.txq.iter().all(|q| q.lock().len() < self.cfg.txq_depth) {
            let edge = self.flow.txq_drained();
            self.apply_mask_edge(edge, None);
        }
        if blocked {
            self.arm_timer_after(|t| &mut t.tx, self.cfg.flow.res_ack_wait);
        } else if table.has_pending_tx() {
            self.arm_tx_timer();
        }
        ktrace!("{}: tx pump sent {} blocked {}", self.name(), sent, blocked);
        Ok(sent)
    }

    // ── Receive ──

    /// Take every frame waiting on DL ring `ring_id`.
    ///
    /// Malformed slots are skipped and logged. If the ring turns out dirty
    /// after some frames were taken, those frames are still returned and the
    /// next poll reports the error.
    pub fn receive_poll(&self, ring_id: u16) -> Result<Vec<RxFrame>> {
        if !self.sbd_active() {
            return Err(LinkError::Inactive);
        }
        let table = self.ring_table()?;
        let dl = table
            .dl
            .get(ring_id as usize)
            .ok_or(LinkError::NoSuchChannel(ring_id))?;
        let zc = table.zc[ring_id as usize].as_ref();

        let frames = self.drain_ring(dl, || match zc {
            Some(z) => z.rx(),
            None => dl.rx(),
        })?;
        if let Some(z) = zc {
            if self.replenish(z) {
                self.arm_datalloc_timer();
            }
        }
        Ok(frames)
    }

    /// Pull at most one ring's worth of frames out of `next`.
    fn drain_ring<F>(&self, dl: &SbdRing, mut next: F) -> Result<Vec<RxFrame>>
    where
        F: FnMut() -> Result<Option<RxFrame>>,
    {
        let mut frames = Vec::new();
        for _ in 0..dl.len() {
            match next() {
                Ok(Some(f)) => frames.push(f),
                Ok(None) => break,
                Err(LinkError::Protocol(what)) => {
                    kerror!("{}: ERR! RXQ[{}:{}] {}", self.name(), dl.id(), dl.ch(), what);
                }
                Err(e) => {
                    kerror!("{}: ERR! RXQ[{}:{}] {}", self.name(), dl.id(), dl.ch(), e);
                    if frames.is_empty() {
                        return Err(e);
                    }
                    break;
                }
            }
        }
        Ok(frames)
    }

    fn deliver(&self, frames: Vec<RxFrame>) {
        for f in frames {
            self.events.on_receive(f);
        }
    }

    fn rx_all_rings(&self) -> Result<()> {
        let table = self.ring_table()?;
        let mut result = Ok(());
        for id in 0..table.num_rings() as u16 {
            let r = self.receive_poll(id).map(|frames| self.deliver(frames));
            keep_first(&mut result, r);
        }
        result
    }

    fn rx_legacy(&self, class: TrafficClass) -> Result<()> {
        let frames = self.legacy.recv(class)?;
        self.deliver(frames);
        Ok(())
    }

    /// Drain every DL path of `class` (before answering a REQ_ACK).
    pub(crate) fn drain_class(&self, class: TrafficClass) -> Result<()> {
        if !self.cfg.sbd_ipc {
            return self.rx_legacy(class);
        }
        let table = self.ring_table()?;
        let mut result = Ok(());
        for ring in table.dl.iter().filter(|r| traffic_class(r.ch()) == class) {
            let r = self.receive_poll(ring.id()).map(|frames| self.deliver(frames));
            keep_first(&mut result, r);
        }
        result
    }

    // ── Interrupts ──

    /// IRQ context: validate and classify one doorbell word and snapshot
    /// the link. `None` if the word is not a valid interrupt.
    pub fn classify_irq(&self, word: u16) -> Option<IrqWork> {
        if !int_valid(word) {
            kerror_ratelimited!("{}: ERR! invalid intr {:#06x}", self.name(), word);
            self.diag.count_dropped();
            return None;
        }
        let kind = if cmd_valid(word) {
            match int2cmd(word) {
                c if c == Command::IosmMessage as u16 => IrqKind::Control,
                c => IrqKind::Command(c),
            }
        } else {
            IrqKind::Data(word & MASK_CMD_FIELD)
        };
        ktrace!("{}: int2ap {:#06x} -> {:?}", self.name(), word, kind);
        Some(IrqWork {
            kind,
            snap: self.take_snapshot(Direction::Dl, word),
        })
    }

    /// Worker context: act on one classified interrupt.
    pub fn handle_irq(&self, work: IrqWork) -> Result<()> {
        let status = work.snap.status;
        self.diag.record(work.snap);
        match work.kind {
            IrqKind::Command(cmd) => self.handle_command(cmd),
            IrqKind::Control => self.iosm_rx().map(|_| ()),
            IrqKind::Data(mask) => self.handle_data(mask, status),
        }
    }

    fn handle_data(&self, mask: u16, status: u16) -> Result<()> {
        if !self.state().rx_possible() {
            kdebug!("{}: data intr {:#x} in {}, ignored", self.name(), mask, self.state());
            return Ok(());
        }
        self.handle_flowctl_status(status);

        let mut result = Ok(());
        if self.cfg.sbd_ipc {
            for class in TrafficClass::ALL {
                if mask & class.res_ack_mask() != 0 {
                    keep_first(&mut result, self.recv_res_ack(class));
                }
            }
            if mask & (MASK_SEND_FMT | MASK_SEND_RAW) != 0 {
                keep_first(&mut result, self.rx_all_rings());
            }
        } else {
            for class in TrafficClass::ALL {
                if mask & class.send_mask() != 0 {
                    keep_first(&mut result, self.rx_legacy(class));
                }
            }
        }
        for class in TrafficClass::ALL {
            if mask & class.req_ack_mask() != 0 {
                keep_first(&mut result, self.recv_req_ack(class));
            }
        }
        result
    }

    /// Log a worker-side failure at the level its severity calls for.
    pub fn report(&self, what: &str, e: &LinkError) {
        match e.severity() {
            Severity::Transient => kdebug!("{}: {}: {}", self.name(), what, e),
            Severity::Protocol => kerror!("{}: ERR! {}: {}", self.name(), what, e),
            Severity::Fatal => kerror!("{}: FATAL {}: {}", self.name(), what, e),
        }
    }

    /// Classify and handle every pending doorbell on the caller's thread.
    /// Returns how many words were taken.
    pub fn poll_irqs(&self) -> Result<usize> {
        let mut n = 0usize;
        while let Some(word) = self.mbox.take_irq() {
            n += 1;
            if let Some(work) = self.classify_irq(word) {
                if let Err(e) = self.handle_irq(work) {
                    self.report("irq", &e);
                }
            }
        }
        Ok(n)
    }

    // ── Timers ──

    fn arm_timer_after(&self, slot: impl FnOnce(&mut Timers) -> &mut Option<Instant>, after: Duration) {
        let due = Instant::now() + after;
        let mut t = self.timers.lock();
        arm_at(slot(&mut t), due);
    }

    pub(crate) fn arm_tx_timer(&self) {
        self.arm_timer_after(|t| &mut t.tx, self.cfg.tx_period);
    }

    pub(crate) fn arm_datalloc_timer(&self) {
        self.arm_timer_after(|t| &mut t.datalloc, self.cfg.datalloc_period);
    }

    /// Finish an IOSM drain on the next timer pass.
    pub(crate) fn arm_iosm_timer(&self) {
        self.arm_timer_after(|t| &mut t.iosm, Duration::ZERO);
    }

    pub(crate) fn arm_crash_ack_timer(&self) {
        let due = Instant::now() + self.cfg.crash_ack_timeout;
        self.timers.lock().crash_ack = Some(due);
    }

    /// Returns whether a deadline was pending.
    pub(crate) fn cancel_crash_ack_timer(&self) -> bool {
        self.timers.lock().crash_ack.take().is_some()
    }

    pub(crate) fn cancel_timers(&self) {
        *self.timers.lock() = Timers::default();
    }

    /// Earliest armed timer.
    pub fn next_deadline(&self) -> Option<Instant> {
        let t = self.timers.lock();
        [t.tx, t.datalloc, t.crash_ack, t.iosm].into_iter().flatten().min()
    }

    /// Fire every timer due at `now`. Returns how many fired.
    pub fn run_timers(&self, now: Instant) -> usize {
        let (tx, datalloc, crash_ack, iosm) = {
            let mut t = self.timers.lock();
            (
                take_due(&mut t.tx, now),
                take_due(&mut t.datalloc, now),
                take_due(&mut t.crash_ack, now),
                take_due(&mut t.iosm, now),
            )
        };
        if crash_ack {
            self.handle_no_crash_ack();
        }
        if tx {
            if let Err(e) = self.tx_pump() {
                self.report("tx timer", &e);
            }
        }
        if datalloc {
            if let Ok(table) = self.ring_table() {
                self.replenish_rings(&table);
            }
        }
        if iosm {
            if let Err(e) = self.iosm_rx() {
                self.report("iosm timer", &e);
            }
        }
        tx as usize + datalloc as usize + crash_ack as usize + iosm as usize
    }

    // ── Channels ──

    /// A consumer opened `ch`. Opening both control channels completes a
    /// pending PHONE_START.
    pub fn open_channel(&self, ch: u16) -> Result<()> {
        if self.cfg.sbd_ipc && ring_for_channel(&self.cfg.channels, ch).is_none() {
            return Err(LinkError::NoSuchChannel(ch));
        }
        if self.cfg.iosm {
            if !self.iosm.config_done() {
                return Err(LinkError::NotInitialized);
            }
            self.send_iosm(IosmTx::OpenCh(ch as u8))?;
        }
        let complete = {
            let mut core = self.core.lock();
            core.opened.insert(ch);
            core.phone_start_pending && core.consumers_ready()
        };
        kinfo!("{}: ch {} opened", self.name(), ch);
        if complete {
            self.complete_phone_start()?;
        }
        Ok(())
    }

    pub fn close_channel(&self, ch: u16) -> Result<()> {
        let was_open = self.core.lock().opened.remove(&ch);
        if !was_open {
            return Err(LinkError::NoSuchChannel(ch));
        }
        self.flow.mark_started(ch);
        if self.cfg.iosm && self.iosm.config_done() {
            self.send_iosm(IosmTx::CloseCh(ch as u8))?;
        }
        kinfo!("{}: ch {} closed", self.name(), ch);
        Ok(())
    }

    // ── Lifecycle ──

    /// The CP is being (re)booted: forget everything the previous boot
    /// negotiated and wait for INIT_START / MDM_READY.
    pub fn boot_on(&self) {
        kinfo!("{}: boot on", self.name());
        {
            let mut core = self.core.lock();
            core.cp_boot_done = false;
            core.phone_start_count = 0;
            core.phone_start_pending = false;
        }
        self.boot_done.reinit();
        self.forced_crash.store(false, Ordering::Release);
        self.cancel_timers();
        self.sbd_deactivate();
        if self.cfg.iosm {
            if let Err(e) = self.region.fill(OFF_CMD_RGN, CMD_RGN_SIZE, 0) {
                kerror!("{}: ERR! clearing command region: {}", self.name(), e);
            }
            self.iosm.reset();
        }
        self.purge_txq();
        self.flow.reset();
        self.diag.clear();
        self.transition(LinkState::Booting);
    }

    /// Block until the link reaches ONLINE.
    pub fn wait_boot_complete(&self, timeout: Duration) -> Result<()> {
        self.boot_done.wait_timeout(timeout, "boot complete")
    }

    /// Tear the link down: rings inactive, control region cleared, queues
    /// purged, zero-copy cells returned.
    pub fn shutdown(&self) {
        kinfo!("{}: shutdown", self.name());
        self.sbd_deactivate();
        self.cancel_timers();
        self.purge_txq();
        if let Ok(table) = self.ring_table() {
            let freed = table.reset_zerocopy();
            if freed > 0 {
                kdebug!("{}: {} zero-copy cells released", self.name(), freed);
            }
        }
        if let Err(e) = self.region.fill(OFF_CMD_RGN, CMD_RGN_SIZE, 0) {
            kwarn!("{}: clearing command region: {}", self.name(), e);
        }
        self.iosm.reset();
        self.stop_all_channels();
        self.transition(LinkState::Offline);
    }
}

/// Assembles a `LinkDevice` from a configuration and its collaborators.
pub struct LinkBuilder {
    cfg: LinkConfig,
    region: Option<Arc<SharedRegion>>,
    events: Option<Arc<dyn LinkEvents>>,
    cells: Option<Arc<dyn CellAllocator>>,
}

impl LinkBuilder {
    pub fn new(cfg: LinkConfig) -> Self {
        Self {
            cfg,
            region: None,
            events: None,
            cells: None,
        }
    }

    /// Use an existing mapping instead of an anonymous one.
    pub fn region(mut self, region: Arc<SharedRegion>) -> Self {
        self.region = Some(region);
        self
    }

    pub fn events(mut self, events: Arc<dyn LinkEvents>) -> Self {
        self.events = Some(events);
        self
    }

    /// Cell allocator for zero-copy DL rings. Defaults to a
    /// `BitmapCellPool` sized from the configuration.
    pub fn cells(mut self, cells: Arc<dyn CellAllocator>) -> Self {
        self.cells = Some(cells);
        self
    }

    /// Build the link.
    ///
    /// 1. Validates the configuration
    /// 2. Maps (or adopts) the shared region
    /// 3. Creates the zero-copy pool if any channel needs one
    /// 4. Wires flow control, IOSM and diagnostics
    pub fn build(self, mbox: Arc<dyn Mailbox>) -> Result<Arc<LinkDevice>> {
        // 1. Configuration
        self.cfg.validate().map_err(LinkError::Config)?;

        // 2. Shared region
        let region = match self.region {
            Some(r) => r,
            None => Arc::new(SharedRegion::anonymous(self.cfg.region_size)?),
        };
        if region.size() < MIN_REGION_SIZE {
            return Err(LinkError::Config("shared region smaller than the fixed map"));
        }

        // 3. Zero-copy pool
        let cells = match self.cells {
            Some(c) => Some(c),
            None if self.cfg.has_zerocopy() => Some(Arc::new(BitmapCellPool::new(
                self.cfg.zmb_cell_size,
                self.cfg.zmb_cell_count,
            )?) as Arc<dyn CellAllocator>),
            None => None,
        };

        // 4. Components
        self.cfg.dump();
        let cfg = self.cfg;
        Ok(Arc::new(LinkDevice {
            legacy: LegacyIpc::new(region.clone()),
            flow: FlowControl::new(cfg.channels.len(), cfg.flow.clone()),
            iosm: IosmState::new(),
            diag: Diagnostics::new(cfg.snapshot_depth),
            region,
            mbox,
            events: self.events.unwrap_or_else(|| Arc::new(NoEvents)),
            core: SpinLock::new(LinkCore::default()),
            timers: SpinLock::new(Timers::default()),
            table: SpinLock::new(None),
            sbd_active: AtomicBool::new(false),
            cells,
            forced_crash: AtomicBool::new(false),
            boot_done: Completion::new(),
            cfg,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mailbox::RegisterMailbox;
    use crate::sim::testing::{booted_pair, zerocopy_pair, Event};
    use shmlink_core::config::ChannelSpec;
    use shmlink_core::wire::{mask2int, CH_PDP_0};

    #[test]
    fn test_builder_rejects_bad_config() {
        let (ap, _cp) = RegisterMailbox::pair(8).unwrap();
        let cfg = LinkConfig::new().channels(vec![]);
        assert!(matches!(LinkBuilder::new(cfg).build(Arc::new(ap)), Err(LinkError::Config(_))));
    }

    #[test]
    fn test_offline_link_refuses_data() {
        let (ap, _cp) = RegisterMailbox::pair(8).unwrap();
        let link = LinkBuilder::new(LinkConfig::new()).build(Arc::new(ap)).unwrap();
        assert_eq!(link.state(), LinkState::Offline);
        assert_eq!(link.send(CH_FMT_0, b"x"), Err(LinkError::Inactive));
        assert!(matches!(link.receive_poll(0), Err(LinkError::Inactive)));
        assert!(matches!(link.ring_table(), Err(LinkError::NotInitialized)));
    }

    #[test]
    fn test_classify() {
        let (link, _cp, _events) = booted_pair();
        assert!(link.classify_irq(0x0001).is_none());
        assert_eq!(link.diagnostics().dropped(), 1);
        let w = link.classify_irq(Command::CrashExit.to_int()).unwrap();
        assert_eq!(w.kind, IrqKind::Command(Command::CrashExit as u16));
        assert_eq!(w.snap.int2ap, Command::CrashExit.to_int());
        assert_eq!(link.classify_irq(Command::IosmMessage.to_int()).unwrap().kind, IrqKind::Control);
        assert_eq!(link.classify_irq(mask2int(MASK_SEND_DATA)).unwrap().kind, IrqKind::Data(MASK_SEND_DATA));
    }

    #[test]
    fn test_send_reaches_cp() {
        let (link, cp, _events) = booted_pair();
        assert_eq!(link.send(CH_FMT_0, b"AT+CGMI").unwrap(), 7);
        assert_eq!(link.send(CH_PDP_0 + 2, b"ip packet").unwrap(), 9);
        assert_eq!(link.send(99, b"?"), Err(LinkError::NoSuchChannel(99)));

        cp.poll().unwrap();
        let got = cp.take_ul();
        assert_eq!(got.len(), 2);
        assert_eq!(got[0], (CH_FMT_0, b"AT+CGMI".to_vec()));
        assert_eq!(got[1], (CH_PDP_0 + 2, b"ip packet".to_vec()));
    }

    #[test]
    fn test_dl_frames_delivered() {
        let (link, cp, events) = booted_pair();
        events.take();
        cp.send_dl(CH_RFS_0, b"rfs reply").unwrap();
        cp.send_dl(CH_PDP_0 + 1, b"pkt").unwrap();
        link.poll_irqs().unwrap();

        let rx: Vec<(u16, Vec<u8>)> = events
            .take()
            .into_iter()
            .filter_map(|e| match e {
                Event::Rx(ch, data) => Some((ch, data)),
                _ => None,
            })
            .collect();
        assert_eq!(rx, vec![(CH_RFS_0, b"rfs reply".to_vec()), (CH_PDP_0 + 1, b"pkt".to_vec())]);
    }

    #[test]
    fn test_enqueue_and_tx_pump() {
        let (link, cp, _events) = booted_pair();
        for i in 0..5u8 {
            link.enqueue(CH_FMT_0, &[i; 3]).unwrap();
        }
        assert_eq!(link.ring_table().unwrap().txq_len(0), 5);
        assert!(link.next_deadline().is_some());

        let fired = link.run_timers(Instant::now() + Duration::from_secs(1));
        assert_eq!(fired, 1);
        assert_eq!(link.ring_table().unwrap().txq_len(0), 0);
        cp.poll().unwrap();
        assert_eq!(cp.take_ul().len(), 5);
    }

    #[test]
    fn test_txq_overflow_stops_channel() {
        let (link, _cp, events) = booted_pair();
        let depth = link.config().txq_depth;
        for _ in 0..depth {
            link.enqueue(CH_FMT_0, b"q").unwrap();
        }
        events.take();
        assert_eq!(link.enqueue(CH_FMT_0, b"q"), Err(LinkError::Busy(0)));
        assert!(link.flow().is_stopped(CH_FMT_0));
        assert!(events.take().contains(&Event::Stop(CH_FMT_0)));
    }

    #[test]
    fn test_zerocopy_dl() {
        let (link, cp, events) = zerocopy_pair();
        events.take();
        let pool = link.cells().unwrap().clone();
        let stocked = pool.in_use();
        assert!(stocked > 0);

        cp.send_dl(30, b"zero copy payload").unwrap();
        link.poll_irqs().unwrap();
        let rx: Vec<Event> = events.take().into_iter().filter(|e| matches!(e, Event::Rx(..))).collect();
        assert_eq!(rx, vec![Event::Rx(30, b"zero copy payload".to_vec())]);
        // The consumed cell went back and a fresh one was handed out.
        assert_eq!(pool.in_use(), stocked);
    }

    #[test]
    fn test_dirty_ring_keeps_frames_already_taken() {
        let (link, cp, _events) = booted_pair();
        let table = link.ring_table().unwrap();
        let id = table.ring_id(CH_RFS_0).unwrap();
        for i in 0..3u8 {
            cp.send_dl(CH_RFS_0, &[i; 4]).unwrap();
        }

        let dl = &table.dl[id as usize];
        let mut taken = 0;
        let frames = link
            .drain_ring(dl, || {
                let r = dl.rx();
                taken += 1;
                if taken == 2 {
                    dl.set_wp(dl.len() + 3).unwrap();
                }
                r
            })
            .unwrap();
        assert_eq!(frames.len(), 2);
        assert!(frames.iter().all(|f| f.ch == CH_RFS_0));

        // The corruption surfaces on the next poll.
        assert!(matches!(link.receive_poll(id), Err(LinkError::Dirty { .. })));
    }

    #[test]
    fn test_boot_on_resets_link() {
        let (link, _cp, _events) = booted_pair();
        link.enqueue(CH_FMT_0, b"stale").unwrap();
        link.boot_on();
        assert_eq!(link.state(), LinkState::Booting);
        assert!(!link.sbd_active());
        assert!(link.next_deadline().is_none());
        assert!(!link.ring_table().unwrap().has_pending_tx());
        assert_eq!(
            link.wait_boot_complete(Duration::from_millis(5)),
            Err(LinkError::Timeout("boot complete"))
        );
    }

    #[test]
    fn test_open_unknown_channel() {
        let (ap, _cp) = RegisterMailbox::pair(8).unwrap();
        let cfg = LinkConfig::new().channels(vec![ChannelSpec::fmt(CH_FMT_0, 8, 64)]);
        let link = LinkBuilder::new(cfg).build(Arc::new(ap)).unwrap();
        assert_eq!(link.open_channel(77), Err(LinkError::NoSuchChannel(77)));
        link.open_channel(CH_FMT_0).unwrap();
        assert_eq!(link.opened_channels(), vec![CH_FMT_0]);
        link.close_channel(CH_FMT_0).unwrap();
        assert_eq!(link.close_channel(CH_FMT_0), Err(LinkError::NoSuchChannel(CH_FMT_0)));
    }
}
