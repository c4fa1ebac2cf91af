//! `CpPeer`: a software CP on the far side of the shared region.
//!
//! Plays the modem's half of every protocol the link speaks: it drains UL
//! rings (or legacy queues), produces DL frames, fills zero-copy cells,
//! answers REQ_ACK with RES_ACK, and talks IOSM. It runs on the caller's
//! thread: every method first collects whatever doorbells the AP rang.
//!
//! Used by the smoke binary and by the tests of every module here.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use shmlink_core::barrier::wmb;
use shmlink_core::cell::CellAllocator;
use shmlink_core::circ::circ_new_ptr;
use shmlink_core::config::{ChannelFormat, ChannelSpec, LinkConfig};
use shmlink_core::error::{LinkError, Result};
use shmlink_core::events::LinkEvents;
use shmlink_core::frame::RxFrame;
use shmlink_core::spinlock::SpinLock;
use shmlink_core::state::{Direction, LinkState};
use shmlink_core::wire::{
    cmd_valid, int2cmd, mask2int, pack_size, traffic_class, Command, IosmRecord, LinkHeader,
    TrafficClass, CH_FMT_0, CH_RFS_0, LINK_HDR_SIZE, MASK_CMD_FIELD, MASK_REQ_ACK_FMT,
    MASK_REQ_ACK_RAW,
};
use shmlink_core::{kdebug, ktrace};

use crate::iosm::{MsgArea, A2C_ACK, A2C_AP_READY, A2C_NACK, C2A_ACK, C2A_MDM_READY};
use crate::layout::{ring_for_channel, SbdLayout};
use crate::legacy::{pop_frames, push_frame, LegacyQueue};
use crate::link::{LinkBuilder, LinkDevice};
use crate::mailbox::{CpMailbox, RegisterMailbox, DEFAULT_DOORBELL_DEPTH};
use crate::region::SharedRegion;
use crate::sbd::{RingAttrs, SbdRing};

/// Consumer-visible outcome recorded by `RecordingEvents`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    State(LinkState, LinkState),
    /// Channel and payload (link header stripped).
    Rx(u16, Vec<u8>),
    Stop(u16),
    Start(u16),
    Down(LinkState),
}

/// `LinkEvents` that keeps everything in order of arrival.
#[derive(Default)]
pub struct RecordingEvents {
    log: SpinLock<Vec<Event>>,
}

impl RecordingEvents {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Drain the log.
    pub fn take(&self) -> Vec<Event> {
        std::mem::take(&mut *self.log.lock())
    }

    fn push(&self, e: Event) {
        self.log.lock().push(e);
    }
}

/// Payload of one slot without its link header.
fn body(frame: &RxFrame) -> &[u8] {
    let p = frame.payload();
    if frame.lnk_hdr {
        &p[LINK_HDR_SIZE.min(p.len())..]
    } else {
        p
    }
}

impl LinkEvents for RecordingEvents {
    fn on_link_state_change(&self, old: LinkState, new: LinkState) {
        self.push(Event::State(old, new));
    }

    fn on_receive(&self, frame: RxFrame) {
        self.push(Event::Rx(frame.ch, body(&frame).to_vec()));
    }

    fn on_stop_channel(&self, ch: u16) {
        self.push(Event::Stop(ch));
    }

    fn on_start_channel(&self, ch: u16) {
        self.push(Event::Start(ch));
    }

    fn on_link_down(&self, reason: LinkState) {
        self.push(Event::Down(reason));
    }
}

/// The CP's view of the published rings.
struct CpRings {
    layout: SbdLayout,
    ul: Vec<SbdRing>,
    dl: Vec<SbdRing>,
}

impl CpRings {
    fn bind(region: &Arc<SharedRegion>, channels: &[ChannelSpec], layout: SbdLayout) -> Result<Self> {
        if layout.rings.len() != channels.len() {
            return Err(LinkError::Protocol("published ring count does not match channels"));
        }
        let mut ul = Vec::with_capacity(channels.len());
        let mut dl = Vec::with_capacity(channels.len());
        for (spec, [ul_geo, dl_geo]) in channels.iter().zip(layout.rings.iter()) {
            let attrs = RingAttrs {
                lnk_hdr: spec.lnk_hdr,
                zerocopy: false,
                multiplexed: spec.format == ChannelFormat::Multi,
            };
            ul.push(SbdRing::new(region.clone(), *ul_geo, attrs)?);
            dl.push(SbdRing::new(
                region.clone(),
                *dl_geo,
                RingAttrs { zerocopy: spec.zerocopy, ..attrs },
            )?);
        }
        Ok(Self { layout, ul, dl })
    }
}

pub struct CpPeer {
    region: Arc<SharedRegion>,
    mbox: CpMailbox,
    cfg: LinkConfig,
    cells: Option<Arc<dyn CellAllocator>>,
    rings: SpinLock<Option<Arc<CpRings>>>,
    stall_ul: AtomicBool,
    auto_ack: AtomicBool,
    /// REQ_ACK bits not answered yet.
    req_ack: SpinLock<u16>,
    doorbells: SpinLock<Vec<u16>>,
    ul: SpinLock<Vec<(u16, Vec<u8>)>>,
    /// Chained UL frames in progress, per ring.
    partial: SpinLock<HashMap<u16, (u16, Vec<u8>)>>,
    iosm_seen: SpinLock<Vec<IosmRecord>>,
    next_trans: SpinLock<u8>,
}

impl CpPeer {
    pub fn new(
        region: Arc<SharedRegion>,
        mbox: CpMailbox,
        cfg: LinkConfig,
        cells: Option<Arc<dyn CellAllocator>>,
    ) -> Self {
        Self {
            region,
            mbox,
            cfg,
            cells,
            rings: SpinLock::new(None),
            stall_ul: AtomicBool::new(false),
            auto_ack: AtomicBool::new(true),
            req_ack: SpinLock::new(0),
            doorbells: SpinLock::new(Vec::new()),
            ul: SpinLock::new(Vec::new()),
            partial: SpinLock::new(HashMap::new()),
            iosm_seen: SpinLock::new(Vec::new()),
            next_trans: SpinLock::new(1),
        }
    }

    pub fn mailbox(&self) -> &CpMailbox {
        &self.mbox
    }

    /// Stop consuming UL data (REQ_ACKs are remembered, not answered).
    pub fn set_stall_ul(&self, on: bool) {
        self.stall_ul.store(on, Ordering::Release);
    }

    /// ACK every IOSM request from the AP as it is read.
    pub fn set_auto_ack(&self, on: bool) {
        self.auto_ack.store(on, Ordering::Release);
    }

    pub fn send_cmd(&self, cmd: Command) -> Result<()> {
        kdebug!("cp: {} -> AP", cmd);
        self.mbox.send_int2ap(cmd.to_int())
    }

    /// Published layout, discovered on first use.
    pub fn layout(&self) -> Result<SbdLayout> {
        Ok(self.rings()?.layout.clone())
    }

    fn rings(&self) -> Result<Arc<CpRings>> {
        let mut slot = self.rings.lock();
        if let Some(r) = slot.as_ref() {
            return Ok(r.clone());
        }
        let layout = SbdLayout::discover(&self.region)?;
        let rings = Arc::new(CpRings::bind(&self.region, &self.cfg.channels, layout)?);
        *slot = Some(rings.clone());
        Ok(rings)
    }

    fn forget_rings(&self) {
        self.rings.lock().take();
        self.partial.lock().clear();
    }

    // ── Doorbells ──

    /// Take every doorbell from the AP and act on it. Unless stalled, UL
    /// data is drained and pending REQ_ACKs are answered afterwards.
    /// Returns how many words were taken.
    pub fn poll(&self) -> Result<usize> {
        let mut n = 0usize;
        while let Some(word) = self.mbox.take_int2cp() {
            n += 1;
            self.doorbells.lock().push(word);
            ktrace!("cp: int2cp {:#06x}", word);
            if cmd_valid(word) {
                match Command::from_u16(int2cmd(word)) {
                    Some(Command::PifInitDone) => self.forget_rings(),
                    Some(Command::IosmMessage) => self.take_iosm()?,
                    _ => {}
                }
            } else {
                *self.req_ack.lock() |= word & MASK_CMD_FIELD & (MASK_REQ_ACK_FMT | MASK_REQ_ACK_RAW);
            }
        }

        if !self.stall_ul.load(Ordering::Acquire) {
            self.drain_ul()?;
            let pending = std::mem::take(&mut *self.req_ack.lock());
            for class in TrafficClass::ALL {
                if pending & class.req_ack_mask() != 0 {
                    kdebug!("cp: RES_ACK {:?} -> AP", class);
                    self.mbox.send_int2ap(mask2int(class.res_ack_mask()))?;
                }
            }
        }
        Ok(n)
    }

    /// Every doorbell word seen so far, oldest first.
    pub fn doorbells(&self) -> Vec<u16> {
        let _ = self.poll();
        self.doorbells.lock().clone()
    }

    /// Data doorbells carrying any bit of `mask`.
    pub fn doorbells_with(&self, mask: u16) -> usize {
        self.doorbells()
            .into_iter()
            .filter(|&w| !cmd_valid(w) && w & mask != 0)
            .count()
    }

    pub fn commands_seen(&self, cmd: Command) -> usize {
        self.doorbells().into_iter().filter(|&w| w == cmd.to_int()).count()
    }

    // ── Data ──

    fn drain_ul(&self) -> Result<()> {
        if !self.cfg.sbd_ipc {
            for class in TrafficClass::ALL {
                let frames = pop_frames(&self.region, &LegacyQueue::of(class), Direction::Ul)?;
                let mut ul = self.ul.lock();
                ul.extend(frames.iter().map(|f| (f.ch, f.payload().to_vec())));
            }
            return Ok(());
        }
        // Nothing published yet.
        let Ok(rings) = self.rings() else {
            return Ok(());
        };
        for ring in &rings.ul {
            while let Some(frame) = ring.rx()? {
                let mut partial = self.partial.lock();
                let entry = partial.entry(ring.id()).or_insert_with(|| (frame.ch, Vec::new()));
                entry.1.extend_from_slice(body(&frame));
                if !frame.more {
                    if let Some(done) = partial.remove(&ring.id()) {
                        self.ul.lock().push(done);
                    }
                }
            }
        }
        Ok(())
    }

    /// Frames received on UL since the last call, as (channel, payload).
    pub fn take_ul(&self) -> Vec<(u16, Vec<u8>)> {
        let _ = self.poll();
        std::mem::take(&mut *self.ul.lock())
    }

    /// Produce one DL frame on `ch` and ring SEND.
    pub fn send_dl(&self, ch: u16, payload: &[u8]) -> Result<()> {
        let _ = self.poll();
        let class = traffic_class(ch);
        if !self.cfg.sbd_ipc {
            push_frame(&self.region, &LegacyQueue::of(class), Direction::Dl, ch as u8, payload)?;
            return self.mbox.send_int2ap(mask2int(class.send_mask()));
        }

        let rings = self.rings()?;
        let id = ring_for_channel(&self.cfg.channels, ch).ok_or(LinkError::NoSuchChannel(ch))?;
        let spec = &self.cfg.channels[id as usize];
        let mut frame = Vec::with_capacity(LINK_HDR_SIZE + payload.len());
        if spec.lnk_hdr {
            let hdr = LinkHeader::for_payload(ch as u8, payload.len()).ok_or(LinkError::TooLarge {
                len: payload.len(),
                max: u16::MAX as usize - LINK_HDR_SIZE,
            })?;
            frame.extend_from_slice(&hdr.encode());
        }
        frame.extend_from_slice(payload);

        let ring = &rings.dl[id as usize];
        if spec.zerocopy {
            self.fill_cell(ring, ch, &frame)?;
        } else {
            ring.tx(ch, &frame)?;
        }
        self.mbox.send_int2ap(mask2int(class.send_mask()))
    }

    /// Zero-copy DL: write into the cell the AP put at slot `wp`.
    fn fill_cell(&self, ring: &SbdRing, ch: u16, data: &[u8]) -> Result<()> {
        let cells = self
            .cells
            .as_ref()
            .ok_or(LinkError::Config("zero-copy ring without a cell pool"))?;
        let (wp, stocked) = ring.pointers()?;
        if wp == stocked {
            return Err(LinkError::NoSpace { ring: ring.id(), need: 1, space: 0 });
        }
        let geo = ring.geometry();
        let mut raw = [0u8; 8];
        self.region.read_bytes(geo.slot_off(wp), &mut raw)?;
        let base = (self.region.size() + self.cfg.net_headroom) as u64;
        let cell = u64::from_le_bytes(raw)
            .checked_sub(base)
            .and_then(|off| u32::try_from(off).ok())
            .and_then(|off| cells.cell_at(off))
            .ok_or(LinkError::Protocol("slot names no cell"))?;
        if !cells.write_cell(&cell, self.cfg.net_headroom, data) {
            return Err(LinkError::TooLarge {
                len: data.len(),
                max: cells.cell_size() - self.cfg.net_headroom,
            });
        }
        let tag = if ring.attrs().multiplexed { ch } else { 0 };
        self.region.write_u32(geo.size_v(wp), pack_size(data.len() as u16, tag))?;
        wmb();
        ring.set_wp(circ_new_ptr(ring.len(), wp, 1))
    }

    // ── IOSM ──

    fn take_trans(&self) -> u8 {
        let mut t = self.next_trans.lock();
        let id = *t;
        *t = if id == u8::MAX { 1 } else { id + 1 };
        id
    }

    fn take_iosm(&self) -> Result<()> {
        let recs = MsgArea::AP_TX.pop_all(&self.region)?;
        for rec in recs {
            let reply = rec.msg_id == A2C_ACK || rec.msg_id == A2C_NACK;
            if !reply && self.auto_ack.load(Ordering::Acquire) {
                self.send_ack(rec.msg_id, rec.payload[0], rec.trans_id)?;
            }
            if rec.msg_id == A2C_AP_READY {
                self.forget_rings();
            }
            self.iosm_seen.lock().push(rec);
        }
        Ok(())
    }

    /// IOSM records from the AP since the last call.
    pub fn poll_iosm(&self) -> Result<Vec<IosmRecord>> {
        self.poll()?;
        Ok(std::mem::take(&mut *self.iosm_seen.lock()))
    }

    pub fn send_iosm(&self, rec: IosmRecord) -> Result<()> {
        MsgArea::AP_RX.push(&self.region, &rec)?;
        self.mbox.send_int2ap(Command::IosmMessage.to_int())
    }

    pub fn send_mdm_ready(&self) -> Result<()> {
        let trans_id = self.take_trans();
        self.send_iosm(IosmRecord { msg_id: C2A_MDM_READY, trans_id, ..Default::default() })
    }

    pub fn send_ack(&self, msg: u8, ch: u8, trans_id: u8) -> Result<()> {
        let mut rec = IosmRecord { msg_id: C2A_ACK, trans_id, ..Default::default() };
        rec.payload[0] = msg;
        rec.payload[1] = ch;
        self.send_iosm(rec)
    }
}

/// Build a link over a fresh mailbox and attach a `CpPeer` to it.
pub fn connect(cfg: LinkConfig) -> Result<(Arc<LinkDevice>, CpPeer, Arc<RecordingEvents>)> {
    let (ap, cp_mbox) = RegisterMailbox::pair(DEFAULT_DOORBELL_DEPTH)?;
    let events = RecordingEvents::new();
    let link = LinkBuilder::new(cfg.clone())
        .events(events.clone())
        .build(Arc::new(ap))?;
    let cp = CpPeer::new(link.region().clone(), cp_mbox, cfg, link.cells().cloned());
    Ok((link, cp, events))
}

/// Drive a full boot on the caller's thread until the link is ONLINE with
/// the FMT and RFS consumers open.
pub fn bring_up(link: &LinkDevice, cp: &CpPeer) -> Result<()> {
    link.boot_on();
    if link.config().iosm {
        cp.send_mdm_ready()?;
        link.poll_irqs()?;
        cp.poll()?;
        link.poll_irqs()?;
        link.open_channel(CH_FMT_0)?;
        link.open_channel(CH_RFS_0)?;
        cp.poll()?;
        link.poll_irqs()?;
    } else {
        cp.send_cmd(Command::InitStart)?;
        link.poll_irqs()?;
        cp.poll()?;
        link.open_channel(CH_FMT_0)?;
        link.open_channel(CH_RFS_0)?;
        cp.send_cmd(Command::PhoneStart)?;
        link.poll_irqs()?;
        cp.poll()?;
    }
    if link.state() != LinkState::Online {
        return Err(LinkError::Protocol("link did not come online"));
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::Arc;
    use std::time::Duration;

    use shmlink_core::config::{ChannelSpec, LinkConfig};
    use shmlink_core::kprint::{set_log_level, LogLevel};
    use shmlink_core::wire::{CH_FMT_0, CH_RFS_0};

    pub use super::{Event, RecordingEvents};
    use super::{bring_up, connect, CpPeer};
    use crate::link::LinkDevice;

    pub type Pair = (Arc<LinkDevice>, CpPeer, Arc<RecordingEvents>);

    pub fn test_config() -> LinkConfig {
        set_log_level(LogLevel::Off);
        LinkConfig::new()
            .name("test")
            .link_active_probe(2, Duration::from_millis(1))
    }

    pub fn pair(cfg: LinkConfig) -> Pair {
        connect(cfg).unwrap()
    }

    pub fn booted_pair() -> Pair {
        let p = pair(test_config());
        bring_up(&p.0, &p.1).unwrap();
        p
    }

    /// Booted, with raw channel 30 on a zero-copy DL ring.
    pub fn zerocopy_pair() -> Pair {
        let cfg = test_config()
            .channels(vec![
                ChannelSpec::fmt(CH_FMT_0, 64, 2048),
                ChannelSpec::fmt(CH_RFS_0, 64, 2048),
                ChannelSpec::raw(30, 16, 512).with_zerocopy(true),
            ])
            .zmb(512, 64);
        let p = pair(cfg);
        bring_up(&p.0, &p.1).unwrap();
        p.0.open_channel(30).unwrap();
        p
    }

    /// IOSM link after `boot_on`, waiting for MDM_READY.
    pub fn iosm_pair() -> Pair {
        let p = pair(test_config().iosm(true));
        p.0.boot_on();
        p
    }
}
