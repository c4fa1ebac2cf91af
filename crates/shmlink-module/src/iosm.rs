//! IOSM control messages.
//!
//! Two message areas in the control region, one per direction. Each is a
//! circular queue of fixed 12-byte records:
//!
//! ```text
//! +0  write index (u32, producer)
//! +4  read index  (u32, consumer)
//! +8  records[170]
//! ```
//!
//! Every request the AP sends is tracked by (message id, channel) until the
//! CP answers with an ACK or NACK echoing its transaction id; a second
//! request with the same key is refused meanwhile. Every CP message other
//! than ACK/NACK is answered with exactly one ACK or NACK.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

use shmlink_core::barrier::{mb, rmb, wmb};
use shmlink_core::circ::{circ_new_ptr, CircQueue};
use shmlink_core::error::{LinkError, Result};
use shmlink_core::spinlock::SpinLock;
use shmlink_core::state::LinkState;
use shmlink_core::wire::{Command, IosmRecord, IOSM_PAYLOAD_LEN, IOSM_RECORD_SIZE, IOSM_TRANS_ID_MAX};
use shmlink_core::{kdebug, kerror, kinfo, kwarn};

use crate::layout::{IOSM_AREA_SIZE, OFF_IOSM_RX, OFF_IOSM_TX};
use crate::link::LinkDevice;
use crate::region::SharedRegion;

// CP -> AP
pub const C2A_MDM_READY: u8 = 0x80;
pub const C2A_CONF_CH_RSP: u8 = 0xA3;
pub const C2A_STOP_TX_CH: u8 = 0xB0;
pub const C2A_START_TX_CH: u8 = 0xB1;
pub const C2A_ACK: u8 = 0xE0;
pub const C2A_NACK: u8 = 0xE1;

// AP -> CP
pub const A2C_AP_READY: u8 = 0x00;
pub const A2C_CONF_CH_REQ: u8 = 0x22;
pub const A2C_OPEN_CH: u8 = 0x24;
pub const A2C_CLOSE_CH: u8 = 0x25;
pub const A2C_STOP_TX_CH: u8 = 0x30;
pub const A2C_START_TX_CH: u8 = 0x31;
pub const A2C_ACK: u8 = 0x60;
pub const A2C_NACK: u8 = 0x61;

const AREA_HDR: usize = 8;

/// Records per message area.
pub const IOSM_AREA_RECORDS: u32 = ((IOSM_AREA_SIZE - AREA_HDR) / IOSM_RECORD_SIZE) as u32;

/// Message sent by the AP.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IosmTx {
    ApReady,
    /// Flow control on/off for a channel.
    ConfChReq { ch: u8, on: bool },
    OpenCh(u8),
    CloseCh(u8),
    StopTxCh(u8),
    StartTxCh(u8),
    Ack { msg: u8, ch: u8 },
    Nack { msg: u8, ch: u8 },
}

impl IosmTx {
    pub fn msg_id(&self) -> u8 {
        match self {
            Self::ApReady => A2C_AP_READY,
            Self::ConfChReq { .. } => A2C_CONF_CH_REQ,
            Self::OpenCh(_) => A2C_OPEN_CH,
            Self::CloseCh(_) => A2C_CLOSE_CH,
            Self::StopTxCh(_) => A2C_STOP_TX_CH,
            Self::StartTxCh(_) => A2C_START_TX_CH,
            Self::Ack { .. } => A2C_ACK,
            Self::Nack { .. } => A2C_NACK,
        }
    }

    /// Channel the message is about (0 for link-wide messages).
    pub fn channel(&self) -> u8 {
        match *self {
            Self::ApReady => 0,
            Self::ConfChReq { ch, .. }
            | Self::OpenCh(ch)
            | Self::CloseCh(ch)
            | Self::StopTxCh(ch)
            | Self::StartTxCh(ch)
            | Self::Ack { ch, .. }
            | Self::Nack { ch, .. } => ch,
        }
    }

    pub fn is_reply(&self) -> bool {
        matches!(self, Self::Ack { .. } | Self::Nack { .. })
    }

    pub fn encode(&self, trans_id: u8) -> IosmRecord {
        let mut payload = [0u8; IOSM_PAYLOAD_LEN];
        match *self {
            Self::ApReady => {}
            Self::ConfChReq { ch, on } => {
                payload[0] = ch;
                payload[1] = on as u8;
            }
            Self::OpenCh(ch) | Self::CloseCh(ch) | Self::StopTxCh(ch) | Self::StartTxCh(ch) => {
                payload[0] = ch;
            }
            Self::Ack { msg, ch } | Self::Nack { msg, ch } => {
                payload[0] = msg;
                payload[1] = ch;
            }
        }
        IosmRecord {
            msg_id: self.msg_id(),
            trans_id,
            payload,
        }
    }
}

/// Message received from the CP.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IosmRx {
    MdmReady,
    ConfChRsp { ch: u8 },
    StopTxCh(u8),
    StartTxCh(u8),
    /// `msg` is the AP message being answered.
    Ack { msg: u8, ch: u8 },
    Nack { msg: u8, ch: u8 },
}

impl IosmRx {
    pub fn decode(rec: &IosmRecord) -> Result<Self> {
        let p = &rec.payload;
        Ok(match rec.msg_id {
            C2A_MDM_READY => Self::MdmReady,
            C2A_CONF_CH_RSP => Self::ConfChRsp { ch: p[0] },
            C2A_STOP_TX_CH => Self::StopTxCh(p[0]),
            C2A_START_TX_CH => Self::StartTxCh(p[0]),
            C2A_ACK => Self::Ack { msg: p[0], ch: p[1] },
            C2A_NACK => Self::Nack { msg: p[0], ch: p[1] },
            id => return Err(LinkError::UnknownMessage(id)),
        })
    }

    pub fn msg_id(&self) -> u8 {
        match self {
            Self::MdmReady => C2A_MDM_READY,
            Self::ConfChRsp { .. } => C2A_CONF_CH_RSP,
            Self::StopTxCh(_) => C2A_STOP_TX_CH,
            Self::StartTxCh(_) => C2A_START_TX_CH,
            Self::Ack { .. } => C2A_ACK,
            Self::Nack { .. } => C2A_NACK,
        }
    }

    pub fn channel(&self) -> u8 {
        match *self {
            Self::MdmReady => 0,
            Self::ConfChRsp { ch }
            | Self::StopTxCh(ch)
            | Self::StartTxCh(ch)
            | Self::Ack { ch, .. }
            | Self::Nack { ch, .. } => ch,
        }
    }
}

/// One direction's message area.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MsgArea {
    base: usize,
}

impl MsgArea {
    /// AP -> CP.
    pub const AP_TX: Self = Self { base: OFF_IOSM_TX };
    /// CP -> AP.
    pub const AP_RX: Self = Self { base: OFF_IOSM_RX };

    fn queue(&self, region: &SharedRegion) -> Result<CircQueue> {
        let head = region.atomic_u32(self.base)?.load(Ordering::Acquire);
        let tail = region.atomic_u32(self.base + 4)?.load(Ordering::Acquire);
        let q = CircQueue::new(self.base as u16, IOSM_AREA_RECORDS, head, tail);
        q.check()?;
        Ok(q)
    }

    fn record_off(&self, idx: u32) -> usize {
        self.base + AREA_HDR + idx as usize * IOSM_RECORD_SIZE
    }

    /// Producer: append one record and publish the write index.
    pub fn push(&self, region: &SharedRegion, rec: &IosmRecord) -> Result<()> {
        let q = self.queue(region)?;
        if q.space() == 0 {
            return Err(LinkError::NoSpace { ring: q.id, need: 1, space: 0 });
        }
        region.write_bytes(self.record_off(q.head), &rec.to_bytes())?;
        wmb();
        region
            .atomic_u32(self.base)?
            .store(circ_new_ptr(IOSM_AREA_RECORDS, q.head, 1), Ordering::Release);
        mb();
        Ok(())
    }

    /// Consumer: take every unread record and publish the read index.
    ///
    /// A corrupted index pair drops whatever the area held.
    pub fn pop_all(&self, region: &SharedRegion) -> Result<Vec<IosmRecord>> {
        self.pop(region, IOSM_AREA_RECORDS)
    }

    /// Consumer: take at most `max` unread records, oldest first.
    pub fn pop(&self, region: &SharedRegion, max: u32) -> Result<Vec<IosmRecord>> {
        let q = match self.queue(region) {
            Ok(q) => q,
            Err(e) => {
                let head = region.atomic_u32(self.base)?.load(Ordering::Acquire);
                region.atomic_u32(self.base + 4)?.store(head % IOSM_AREA_RECORDS, Ordering::Release);
                return Err(e);
            }
        };
        rmb();
        let n = q.usage().min(max);
        let mut out = Vec::with_capacity(n as usize);
        let mut idx = q.tail;
        for _ in 0..n {
            let mut raw = [0u8; IOSM_RECORD_SIZE];
            region.read_bytes(self.record_off(idx), &mut raw)?;
            out.push(IosmRecord::from_bytes(&raw));
            idx = circ_new_ptr(IOSM_AREA_RECORDS, idx, 1);
        }
        region.atomic_u32(self.base + 4)?.store(idx, Ordering::Release);
        mb();
        Ok(out)
    }

    pub fn pending(&self, region: &SharedRegion) -> Result<u32> {
        Ok(self.queue(region)?.usage())
    }
}

/// Transaction id source: 1..=255, wrapping.
#[derive(Debug)]
struct TransIds {
    next: u8,
}

impl TransIds {
    fn take(&mut self) -> u8 {
        let id = self.next;
        self.next = if id >= IOSM_TRANS_ID_MAX { 1 } else { id + 1 };
        id
    }
}

/// Sender and request-tracking state of the link.
pub struct IosmState {
    tx: SpinLock<TransIds>,
    /// (message id, channel) -> transaction id awaiting ACK/NACK.
    pending: SpinLock<HashMap<(u8, u8), u8>>,
    config_done: AtomicBool,
}

impl Default for IosmState {
    fn default() -> Self {
        Self::new()
    }
}

impl IosmState {
    pub fn new() -> Self {
        Self {
            tx: SpinLock::new(TransIds { next: 1 }),
            pending: SpinLock::new(HashMap::new()),
            config_done: AtomicBool::new(false),
        }
    }

    pub fn config_done(&self) -> bool {
        self.config_done.load(Ordering::Acquire)
    }

    pub fn outstanding(&self) -> Vec<(u8, u8)> {
        let mut v: Vec<_> = self.pending.lock().keys().copied().collect();
        v.sort_unstable();
        v
    }

    pub(crate) fn reset(&self) {
        self.pending.lock().clear();
        self.config_done.store(false, Ordering::Release);
    }

    /// Match a reply against the outstanding request it answers.
    fn resolve(&self, msg: u8, ch: u8, trans_id: u8) -> Result<()> {
        let mut p = self.pending.lock();
        match p.get(&(msg, ch)).copied() {
            Some(expected) if expected == trans_id => {
                p.remove(&(msg, ch));
                Ok(())
            }
            Some(expected) => Err(LinkError::TransactionMismatch { msg, expected, got: trans_id }),
            None => Err(LinkError::TransactionMismatch { msg, expected: 0, got: trans_id }),
        }
    }
}

/// Rounds of re-reading the RX area per notification.
const IOSM_RX_PASSES: usize = 4;
/// Records dispatched per round.
const IOSM_RX_BATCH: u32 = 32;

impl LinkDevice {
    /// Wait (bounded) for the physical link to carry a doorbell.
    fn wait_link_active(&self) -> Result<()> {
        for _ in 0..=self.cfg.link_active_retries {
            if self.mbox.link_active() {
                return Ok(());
            }
            thread::sleep(self.cfg.link_active_interval);
        }
        Err(LinkError::Timeout("link active"))
    }

    /// Send one request. Returns its transaction id.
    pub fn send_iosm(&self, msg: IosmTx) -> Result<u8> {
        self.tx_iosm(msg, None)
    }

    fn tx_iosm(&self, msg: IosmTx, echo: Option<u8>) -> Result<u8> {
        if let Err(e) = self.wait_link_active() {
            kerror!("{}: ERR! IOSM {:#04x}: link not active", self.name(), msg.msg_id());
            self.force_crash("IOSM link not active");
            return Err(e);
        }

        let mut ids = self.iosm.tx.lock();
        let trans_id = match echo {
            Some(t) => t,
            None => ids.take(),
        };
        let key = (msg.msg_id(), msg.channel());
        if !msg.is_reply() {
            let mut p = self.iosm.pending.lock();
            if p.contains_key(&key) {
                return Err(LinkError::RequestPending { msg: key.0, ch: key.1 });
            }
            p.insert(key, trans_id);
        }
        if let Err(e) = MsgArea::AP_TX.push(&self.region, &msg.encode(trans_id)) {
            kerror!("{}: ERR! IOSM {:#04x} not queued: {}", self.name(), key.0, e);
            if !msg.is_reply() {
                self.iosm.pending.lock().remove(&key);
            }
            return Err(e);
        }
        self.send_ipc_irq(Command::IosmMessage.to_int())?;
        drop(ids);

        kdebug!("{}: IOSM {:?} trans {} -> CP", self.name(), msg, trans_id);
        Ok(trans_id)
    }

    fn reply(&self, ok: bool, msg: u8, ch: u8, trans_id: u8) -> Result<()> {
        let m = if ok { IosmTx::Ack { msg, ch } } else { IosmTx::Nack { msg, ch } };
        self.tx_iosm(m, Some(trans_id)).map(|_| ())
    }

    /// Drain the CP -> AP area. Re-reads while records keep arriving; what
    /// is left after the last round is picked up by the IOSM timer.
    pub(crate) fn iosm_rx(&self) -> Result<usize> {
        let mut handled = 0usize;
        for _ in 0..IOSM_RX_PASSES {
            let recs = MsgArea::AP_RX.pop(&self.region, IOSM_RX_BATCH).map_err(|e| {
                kerror!("{}: ERR! IOSM RX area: {}", self.name(), e);
                e
            })?;
            if recs.is_empty() {
                break;
            }
            for rec in recs {
                if let Err(e) = self.dispatch_iosm(&rec) {
                    kerror!("{}: ERR! IOSM {:#04x} trans {}: {}", self.name(), rec.msg_id, rec.trans_id, e);
                }
                handled += 1;
            }
        }
        let left = MsgArea::AP_RX.pending(&self.region)?;
        if left > 0 {
            kdebug!("{}: IOSM {} records left after {} handled", self.name(), left, handled);
            self.arm_iosm_timer();
        }
        Ok(handled)
    }

    fn dispatch_iosm(&self, rec: &IosmRecord) -> Result<()> {
        let msg = match IosmRx::decode(rec) {
            Ok(m) => m,
            Err(e) => {
                self.reply(false, rec.msg_id, rec.payload[0], rec.trans_id)?;
                return Err(e);
            }
        };
        kdebug!("{}: IOSM {:?} trans {} <- CP", self.name(), msg, rec.trans_id);
        match msg {
            IosmRx::MdmReady => self.iosm_mdm_ready(rec.trans_id),
            IosmRx::ConfChRsp { ch } => {
                self.reply(true, C2A_CONF_CH_RSP, ch, rec.trans_id)?;
                self.iosm.pending.lock().remove(&(A2C_CONF_CH_REQ, ch));
                Ok(())
            }
            IosmRx::StopTxCh(ch) => {
                self.reply(true, C2A_STOP_TX_CH, ch, rec.trans_id)?;
                self.stop_channel(ch as u16);
                Ok(())
            }
            IosmRx::StartTxCh(ch) => {
                self.reply(true, C2A_START_TX_CH, ch, rec.trans_id)?;
                self.start_channel(ch as u16);
                Ok(())
            }
            IosmRx::Ack { msg, ch } => self.iosm.resolve(msg, ch, rec.trans_id),
            IosmRx::Nack { msg, ch } => {
                kwarn!("{}: IOSM NACK for {:#04x} ch {}", self.name(), msg, ch);
                self.iosm.resolve(msg, ch, rec.trans_id)
            }
        }
    }

    /// The CP is up: build the rings, then announce AP_READY.
    fn iosm_mdm_ready(&self, trans_id: u8) -> Result<()> {
        kinfo!("{}: MDM_READY <- CP (state {})", self.name(), self.state());
        self.reply(true, C2A_MDM_READY, 0, trans_id)?;

        if let Err(e) = self.init_sbd_link() {
            kerror!("{}: ERR! init_sbd_link: {}", self.name(), e);
            return Err(e);
        }
        self.sbd_activate()?;
        self.iosm.config_done.store(true, Ordering::Release);

        self.send_iosm(IosmTx::ApReady)?;
        kinfo!("{}: AP_READY -> CP", self.name());
        self.transition(LinkState::Online);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::MIN_REGION_SIZE;
    use crate::sim::testing::iosm_pair;
    use shmlink_core::config::MAX_LINK_CHANNELS;
    use shmlink_core::wire::CH_FMT_0;
    use std::time::{Duration, Instant};

    #[test]
    fn test_area_holds_170_records() {
        assert_eq!(IOSM_AREA_RECORDS, 170);
    }

    #[test]
    fn test_encode_ack_echoes_request() {
        let rec = IosmTx::Ack { msg: C2A_STOP_TX_CH, ch: 10 }.encode(42);
        assert_eq!(rec.msg_id, A2C_ACK);
        assert_eq!(rec.trans_id, 42);
        assert_eq!(&rec.payload[..2], &[C2A_STOP_TX_CH, 10]);
        assert_ne!(IosmTx::StartTxCh(1).msg_id(), IosmTx::StopTxCh(1).msg_id());
    }

    #[test]
    fn test_decode_unknown() {
        let rec = IosmRecord { msg_id: 0x7F, ..Default::default() };
        assert_eq!(IosmRx::decode(&rec), Err(LinkError::UnknownMessage(0x7F)));
        let rec = IosmRecord { msg_id: C2A_START_TX_CH, trans_id: 3, payload: [12, 0, 0, 0, 0, 0, 0, 0, 0, 0] };
        assert_eq!(IosmRx::decode(&rec), Ok(IosmRx::StartTxCh(12)));
    }

    #[test]
    fn test_area_fifo_and_full() {
        let region = SharedRegion::anonymous(MIN_REGION_SIZE).unwrap();
        let area = MsgArea::AP_TX;
        for i in 0..IOSM_AREA_RECORDS - 1 {
            area.push(&region, &IosmTx::OpenCh(i as u8).encode(1)).unwrap();
        }
        assert!(matches!(
            area.push(&region, &IosmTx::ApReady.encode(1)),
            Err(LinkError::NoSpace { .. })
        ));
        let recs = area.pop_all(&region).unwrap();
        assert_eq!(recs.len(), IOSM_AREA_RECORDS as usize - 1);
        assert_eq!(recs[5].payload[0], 5);

        // Wraps around the end of the area.
        for i in 0..10u8 {
            area.push(&region, &IosmTx::CloseCh(i).encode(i + 1)).unwrap();
        }
        let recs = area.pop_all(&region).unwrap();
        assert_eq!(recs.iter().map(|r| r.trans_id).collect::<Vec<_>>(), (1..=10).collect::<Vec<_>>());
        assert_eq!(area.pending(&region).unwrap(), 0);
    }

    #[test]
    fn test_trans_id_wraps_past_255() {
        let mut ids = TransIds { next: 254 };
        assert_eq!(ids.take(), 254);
        assert_eq!(ids.take(), 255);
        assert_eq!(ids.take(), 1);
    }

    #[test]
    fn test_rx_backlog_finished_by_timer() {
        let (link, _cp, _events) = iosm_pair();
        assert!(link.next_deadline().is_none());
        // Unsolicited ACKs: dispatched and dropped without a reply.
        let total = IOSM_RX_PASSES as u32 * IOSM_RX_BATCH + 20;
        for i in 0..total {
            let mut rec = IosmRecord { msg_id: C2A_ACK, trans_id: (i % 255) as u8 + 1, ..Default::default() };
            rec.payload[..2].copy_from_slice(&[A2C_OPEN_CH, 1]);
            MsgArea::AP_RX.push(&link.region, &rec).unwrap();
        }

        let handled = link.iosm_rx().unwrap();
        assert_eq!(handled, (IOSM_RX_PASSES as u32 * IOSM_RX_BATCH) as usize);
        assert_eq!(MsgArea::AP_RX.pending(&link.region).unwrap(), 20);
        assert!(link.next_deadline().is_some());

        assert_eq!(link.run_timers(Instant::now() + Duration::from_secs(1)), 1);
        assert_eq!(MsgArea::AP_RX.pending(&link.region).unwrap(), 0);
        assert!(link.next_deadline().is_none());
    }

    #[test]
    fn test_mdm_ready_brings_link_online() {
        let (link, cp, _events) = iosm_pair();
        assert_eq!(link.state(), LinkState::Booting);

        cp.send_mdm_ready().unwrap();
        link.poll_irqs().unwrap();
        assert_eq!(link.state(), LinkState::Online);

        let seen = cp.poll_iosm().unwrap();
        assert!(seen.iter().any(|r| r.msg_id == A2C_ACK && r.payload[0] == C2A_MDM_READY));
        assert!(seen.iter().any(|r| r.msg_id == A2C_AP_READY));

        // The CP sees every ring the AP announced.
        let layout = cp.layout().unwrap();
        let table = link.ring_table().unwrap();
        assert_eq!(layout.num_channels as usize, table.ul.len());
        assert!(layout.rings.len() <= MAX_LINK_CHANNELS);
        for (id, [ul, dl]) in layout.rings.iter().enumerate() {
            assert_eq!(ul, table.ul[id].geometry());
            assert_eq!(dl, table.dl[id].geometry());
        }
    }

    #[test]
    fn test_request_pending_until_acked() {
        let (link, cp, _events) = iosm_pair();
        cp.send_mdm_ready().unwrap();
        link.poll_irqs().unwrap();
        // Acks AP_READY, then stop answering.
        cp.poll_iosm().unwrap();
        link.poll_irqs().unwrap();
        cp.set_auto_ack(false);

        let t = link.send_iosm(IosmTx::OpenCh(CH_FMT_0 as u8)).unwrap();
        assert_eq!(
            link.send_iosm(IosmTx::OpenCh(CH_FMT_0 as u8)),
            Err(LinkError::RequestPending { msg: A2C_OPEN_CH, ch: CH_FMT_0 as u8 })
        );

        // A reply with the wrong id is dropped; the request stays pending.
        cp.send_ack(A2C_OPEN_CH, CH_FMT_0 as u8, t.wrapping_add(1)).unwrap();
        link.poll_irqs().unwrap();
        assert_eq!(link.iosm.outstanding(), vec![(A2C_OPEN_CH, CH_FMT_0 as u8)]);

        cp.send_ack(A2C_OPEN_CH, CH_FMT_0 as u8, t).unwrap();
        link.poll_irqs().unwrap();
        assert!(link.iosm.outstanding().is_empty());
        link.send_iosm(IosmTx::OpenCh(CH_FMT_0 as u8)).unwrap();
    }

    #[test]
    fn test_cp_messages_get_one_reply_each() {
        let (link, cp, _events) = iosm_pair();
        cp.send_mdm_ready().unwrap();
        link.poll_irqs().unwrap();
        cp.poll_iosm().unwrap();

        cp.send_iosm(IosmRecord { msg_id: C2A_STOP_TX_CH, trans_id: 9, payload: [10, 0, 0, 0, 0, 0, 0, 0, 0, 0] })
            .unwrap();
        cp.send_iosm(IosmRecord { msg_id: 0x99, trans_id: 10, ..Default::default() }).unwrap();
        link.poll_irqs().unwrap();
        assert!(link.flow.is_stopped(10));

        let seen = cp.poll_iosm().unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!((seen[0].msg_id, seen[0].trans_id), (A2C_ACK, 9));
        assert_eq!((seen[1].msg_id, seen[1].trans_id), (A2C_NACK, 10));
    }

    #[test]
    fn test_inactive_link_forces_crash() {
        let (link, cp, _events) = iosm_pair();
        cp.send_mdm_ready().unwrap();
        link.poll_irqs().unwrap();
        cp.mailbox().set_link_active(false);
        assert_eq!(link.send_iosm(IosmTx::CloseCh(1)), Err(LinkError::Timeout("link active")));
        assert!(link.crash_in_progress());
    }
}
