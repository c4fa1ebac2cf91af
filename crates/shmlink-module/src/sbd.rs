//! `SbdRing`: one direction of one channel's descriptor ring.
//!
//! A ring is `len` fixed-size slots. Slot `i`'s buffer sits at `addr_v[i]`,
//! its payload length (and, on the multiplexed ring, the channel tag) in
//! `size_v[i]`. `rp`/`wp` live in the shared pointer array:
//!
//! | Ring | AP writes | CP writes |
//! |------|-----------|-----------|
//! | UL   | wp        | rp        |
//! | DL   | rp        | wp        |
//!
//! # Publish order
//!
//! Producer: payload, size word, `wmb`, pointer (Release), `mb`.
//! Consumer: pointer (Acquire), `rmb`, size word, payload, pointer, `mb`.
//!
//! Both sides take the ring's own lock only around their pointer update and
//! the slot copy of the one frame they move; there is no cross-ring order.

use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;

use shmlink_core::barrier::{mb, rmb, wmb};
use shmlink_core::circ::{circ_get_space, circ_get_usage, circ_new_ptr, circ_valid};
use shmlink_core::error::{LinkError, Result};
use shmlink_core::frame::{FrameData, RxFrame};
use shmlink_core::spinlock::SpinLock;
use shmlink_core::state::Direction;
use shmlink_core::wire::{pack_size, size_len, size_tag, LinkHeader};
use shmlink_core::{kerror, kerror_ratelimited, ktrace};

use crate::layout::RingGeometry;
use crate::region::SharedRegion;

/// Progress through a frame chained over several slots.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ChainState {
    pub more: bool,
    pub total: u32,
    pub rcvd: u32,
}

impl ChainState {
    /// Account one received slot. `data` is the slot payload.
    ///
    /// A slot that starts a chain carries the link header whose frame
    /// length exceeds one buffer; continuation slots are counted until the
    /// announced length is reached.
    pub fn account(&mut self, buff_size: u32, data: &[u8]) {
        if !self.more {
            if let Some(hdr) = LinkHeader::parse(data) {
                if hdr.frame_len as u32 > buff_size {
                    self.more = true;
                    self.total = hdr.frame_len as u32;
                    self.rcvd = data.len() as u32;
                }
            }
        } else {
            self.rcvd += data.len() as u32;
            if self.rcvd >= self.total {
                *self = Self::default();
            }
        }
    }
}

/// Flags that shape how a ring's slots are interpreted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RingAttrs {
    pub lnk_hdr: bool,
    pub zerocopy: bool,
    pub multiplexed: bool,
}

pub struct SbdRing {
    region: Arc<SharedRegion>,
    geo: RingGeometry,
    attrs: RingAttrs,
    tx_lock: SpinLock<()>,
    chain: SpinLock<ChainState>,
}

impl SbdRing {
    /// Bind a ring to published geometry. Validates every shared offset once.
    pub fn new(region: Arc<SharedRegion>, geo: RingGeometry, attrs: RingAttrs) -> Result<Self> {
        region.atomic_u16(geo.rp_off as usize)?;
        region.atomic_u16(geo.wp_off as usize)?;
        if geo.len < 2 {
            return Err(LinkError::Config("ring length must be >= 2"));
        }
        let last = geo.len as u32 - 1;
        region.atomic_u32(geo.addr_v(last))?;
        region.atomic_u32(geo.size_v(last))?;
        region.read_u8(geo.slot_off(last) + geo.buff_size as usize - 1)?;
        Ok(Self {
            region,
            geo,
            attrs,
            tx_lock: SpinLock::new(()),
            chain: SpinLock::new(ChainState::default()),
        })
    }

    #[inline]
    pub fn id(&self) -> u16 {
        self.geo.id
    }

    #[inline]
    pub fn ch(&self) -> u16 {
        self.geo.ch
    }

    #[inline]
    pub fn dir(&self) -> Direction {
        self.geo.dir
    }

    #[inline]
    pub fn len(&self) -> u32 {
        self.geo.len as u32
    }

    #[inline]
    pub fn buff_size(&self) -> u32 {
        self.geo.buff_size
    }

    #[inline]
    pub fn attrs(&self) -> RingAttrs {
        self.attrs
    }

    #[inline]
    pub fn geometry(&self) -> &RingGeometry {
        &self.geo
    }

    pub fn region(&self) -> &Arc<SharedRegion> {
        &self.region
    }

    fn rp_word(&self) -> Result<&AtomicU16> {
        self.region.atomic_u16(self.geo.rp_off as usize)
    }

    fn wp_word(&self) -> Result<&AtomicU16> {
        self.region.atomic_u16(self.geo.wp_off as usize)
    }

    pub fn rp(&self) -> Result<u32> {
        Ok(self.rp_word()?.load(Ordering::Acquire) as u32)
    }

    pub fn wp(&self) -> Result<u32> {
        Ok(self.wp_word()?.load(Ordering::Acquire) as u32)
    }

    /// Publish a new read pointer.
    pub fn set_rp(&self, v: u32) -> Result<()> {
        wmb();
        self.rp_word()?.store(v as u16, Ordering::Release);
        mb();
        Ok(())
    }

    /// Publish a new write pointer.
    pub fn set_wp(&self, v: u32) -> Result<()> {
        wmb();
        self.wp_word()?.store(v as u16, Ordering::Release);
        mb();
        Ok(())
    }

    fn dirty(&self, wp: u32, rp: u32) -> LinkError {
        LinkError::Dirty {
            ring: self.geo.id,
            capacity: self.len(),
            head: wp,
            tail: rp,
        }
    }

    /// `(wp, rp)` after checking both are inside the ring.
    pub fn pointers(&self) -> Result<(u32, u32)> {
        let (wp, rp) = (self.wp()?, self.rp()?);
        if !circ_valid(self.len(), wp, rp) {
            return Err(self.dirty(wp, rp));
        }
        Ok((wp, rp))
    }

    pub fn usage(&self) -> Result<u32> {
        let (wp, rp) = self.pointers()?;
        Ok(circ_get_usage(self.len(), wp, rp))
    }

    pub fn space(&self) -> Result<u32> {
        let (wp, rp) = self.pointers()?;
        Ok(circ_get_space(self.len(), wp, rp))
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.usage()? == 0)
    }

    /// Slots a frame of `len` bytes occupies; only link-header rings chain.
    pub fn slots_for(&self, len: usize) -> Result<u32> {
        let buff = self.geo.buff_size as usize;
        if len <= buff {
            return Ok(1);
        }
        if !self.attrs.lnk_hdr {
            return Err(LinkError::TooLarge { len, max: buff });
        }
        let n = len.div_ceil(buff);
        if n >= self.len() as usize {
            return Err(LinkError::TooLarge {
                len,
                max: buff * (self.len() as usize - 1),
            });
        }
        Ok(n as u32)
    }

    /// Producer: write `frame` into the next slot(s) and publish `wp`.
    ///
    /// `tag` is stored in the high half of each size word on the
    /// multiplexed ring. A frame that needs more than one slot is written
    /// all-or-nothing. The caller rings the doorbell.
    pub fn tx(&self, tag: u16, frame: &[u8]) -> Result<usize> {
        let need = self.slots_for(frame.len())?;
        // An empty frame still takes one slot.
        let chunks: Vec<&[u8]> = if frame.is_empty() {
            vec![frame]
        } else {
            frame.chunks(self.geo.buff_size as usize).collect()
        };
        let sizes = chunks
            .iter()
            .map(|c| {
                u16::try_from(c.len()).map_err(|_| LinkError::TooLarge {
                    len: c.len(),
                    max: u16::MAX as usize,
                })
            })
            .collect::<Result<Vec<u16>>>()?;
        let _g = self.tx_lock.lock();

        let (wp, rp) = self.pointers().map_err(|e| {
            kerror!("ERR! TXQ[{}:{}] DIRTY {}", self.geo.id, self.geo.ch, e);
            e
        })?;
        let space = circ_get_space(self.len(), wp, rp);
        if space < need {
            kerror_ratelimited!(
                "TXQ[{}:{}] NOSPC (qlen:{} in:{} out:{} need:{})",
                self.geo.id, self.geo.ch, self.len(), wp, rp, need
            );
            return Err(LinkError::NoSpace { ring: self.geo.id, need, space });
        }

        let tag = if self.attrs.multiplexed { tag } else { 0 };
        let mut in_ = wp;
        for (chunk, len) in chunks.into_iter().zip(sizes) {
            self.region.write_bytes(self.geo.slot_off(in_), chunk)?;
            self.region.write_u32(self.geo.size_v(in_), pack_size(len, tag))?;
            in_ = circ_new_ptr(self.len(), in_, 1);
        }

        self.set_wp(in_)?;
        ktrace!("TX RB[{}:{}] {} bytes, wp {} -> {}", self.geo.id, self.geo.ch, frame.len(), wp, in_);
        Ok(frame.len())
    }

    /// Size word of slot `idx`.
    pub fn slot_size(&self, idx: u32) -> Result<u32> {
        self.region.read_u32(self.geo.size_v(idx))
    }

    pub fn read_slot(&self, idx: u32, len: usize) -> Result<Vec<u8>> {
        if len > self.geo.buff_size as usize {
            return Err(LinkError::Protocol("slot size exceeds buffer"));
        }
        let mut data = vec![0u8; len];
        self.region.read_bytes(self.geo.slot_off(idx), &mut data)?;
        Ok(data)
    }

    /// Channel a slot belongs to: the tag on the multiplexed ring.
    pub fn slot_channel(&self, size: u32) -> u16 {
        if self.attrs.multiplexed {
            size_tag(size)
        } else {
            self.geo.ch
        }
    }

    /// Run the chain accounting for one received slot and return
    /// `(starts_with_header, more_follows)`.
    pub fn account(&self, data: &[u8]) -> (bool, bool) {
        if !self.attrs.lnk_hdr {
            return (false, false);
        }
        let mut chain = self.chain.lock();
        let lnk_hdr = !chain.more;
        chain.account(self.geo.buff_size, data);
        (lnk_hdr, chain.more)
    }

    pub fn chain_state(&self) -> ChainState {
        *self.chain.lock()
    }

    pub fn reset_chain(&self) {
        *self.chain.lock() = ChainState::default();
    }

    /// Consumer: take the slot at `rp`, copying its payload out.
    ///
    /// A slot whose size word exceeds the buffer is skipped and reported as
    /// a protocol error; the ring stays usable.
    pub fn rx(&self) -> Result<Option<RxFrame>> {
        let (wp, out) = self.pointers()?;
        if wp == out {
            return Ok(None);
        }
        rmb();

        let size = self.slot_size(out)?;
        let len = size_len(size) as usize;
        let next = circ_new_ptr(self.len(), out, 1);
        let data = match self.read_slot(out, len) {
            Ok(d) => d,
            Err(e) => {
                kerror!(
                    "ERR! RXQ[{}:{}] size {} > space {}",
                    self.geo.id, self.geo.ch, len, self.geo.buff_size
                );
                self.set_rp(next)?;
                return Err(e);
            }
        };

        let ch = self.slot_channel(size);
        let (lnk_hdr, more) = self.account(&data);
        self.set_rp(next)?;
        ktrace!("RX RB[{}:{}] {} bytes ch {} more {}", self.geo.id, self.geo.ch, len, ch, more);

        Ok(Some(RxFrame {
            ring_id: self.geo.id,
            dir: self.geo.dir,
            ch,
            lnk_hdr,
            more,
            data: FrameData::Copied(data),
        }))
    }

    /// Zero both pointers and the chain state.
    pub fn reset(&self) -> Result<()> {
        self.rp_word()?.store(0, Ordering::Release);
        self.wp_word()?.store(0, Ordering::Release);
        mb();
        self.reset_chain();
        Ok(())
    }
}

impl std::fmt::Debug for SbdRing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SbdRing")
            .field("id", &self.geo.id)
            .field("ch", &self.geo.ch)
            .field("dir", &self.geo.dir)
            .field("len", &self.geo.len)
            .field("buff_size", &self.geo.buff_size)
            .field("attrs", &self.attrs)
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::layout::{SbdLayout, MIN_REGION_SIZE};
    use shmlink_core::config::ChannelSpec;

    /// One channel with tiny rings, published in a fresh region.
    pub(crate) fn ring_pair(spec: ChannelSpec, attrs: RingAttrs) -> (SbdRing, SbdRing) {
        let size = MIN_REGION_SIZE + (1 << 20);
        let region = Arc::new(SharedRegion::anonymous(size).unwrap());
        let layout = SbdLayout::plan(&[spec], size).unwrap();
        layout.publish(&region).unwrap();
        let [ul, dl] = layout.rings[0];
        (
            SbdRing::new(region.clone(), ul, attrs).unwrap(),
            SbdRing::new(region, dl, attrs).unwrap(),
        )
    }

    #[test]
    fn test_tx_then_peer_rx() {
        let (ul, _) = ring_pair(ChannelSpec::raw(30, 8, 64), RingAttrs::default());
        assert_eq!(ul.tx(0, b"abc").unwrap(), 3);
        assert_eq!(ul.usage().unwrap(), 1);

        // The peer reads the UL ring the same way the AP reads DL.
        let frame = ul.rx().unwrap().unwrap();
        assert_eq!(frame.payload(), b"abc");
        assert_eq!(frame.ch, 30);
        assert!(ul.rx().unwrap().is_none());
    }

    #[test]
    fn test_fill_to_capacity() {
        let (ul, _) = ring_pair(ChannelSpec::raw(30, 8, 64), RingAttrs::default());
        for _ in 0..7 {
            ul.tx(0, b"x").unwrap();
        }
        assert_eq!(ul.space().unwrap(), 0);
        assert!(matches!(ul.tx(0, b"x"), Err(LinkError::NoSpace { need: 1, space: 0, .. })));
    }

    #[test]
    fn test_multiplexed_tag() {
        let attrs = RingAttrs { multiplexed: true, ..Default::default() };
        let (ul, _) = ring_pair(ChannelSpec::multiplexed(10, 8, 64), attrs);
        ul.tx(12, b"ip").unwrap();
        assert_eq!(ul.slot_size(0).unwrap(), pack_size(2, 12));
        assert_eq!(ul.rx().unwrap().unwrap().ch, 12);
    }

    #[test]
    fn test_oversize_without_header_rejected() {
        let (ul, _) = ring_pair(ChannelSpec::raw(30, 8, 64), RingAttrs::default());
        assert!(matches!(ul.tx(0, &[0u8; 65]), Err(LinkError::TooLarge { len: 65, max: 64 })));
        assert_eq!(ul.usage().unwrap(), 0);
    }

    #[test]
    fn test_slot_length_must_fit_size_word() {
        let (ul, _) = ring_pair(ChannelSpec::raw(30, 4, 65536), RingAttrs::default());
        let full = vec![0x3Cu8; 65536];
        assert!(matches!(ul.tx(0, &full), Err(LinkError::TooLarge { len: 65536, max: 65535 })));
        assert_eq!(ul.usage().unwrap(), 0);

        ul.tx(0, &full[..65535]).unwrap();
        let frame = ul.rx().unwrap().unwrap();
        assert_eq!(frame.payload().len(), 65535);
    }

    #[test]
    fn test_chained_frame_spans_slots() {
        let attrs = RingAttrs { lnk_hdr: true, ..Default::default() };
        let (ul, _) = ring_pair(ChannelSpec::fmt(235, 8, 64), attrs);

        let mut frame = LinkHeader::for_payload(235, 150).unwrap().encode().to_vec();
        frame.extend(std::iter::repeat(0xA5).take(150));
        ul.tx(0, &frame).unwrap();
        assert_eq!(ul.usage().unwrap(), 3);

        let a = ul.rx().unwrap().unwrap();
        assert!(a.lnk_hdr && a.more);
        assert_eq!(ul.chain_state().total, 154);
        let b = ul.rx().unwrap().unwrap();
        assert!(!b.lnk_hdr && b.more);
        let c = ul.rx().unwrap().unwrap();
        assert!(!c.lnk_hdr && !c.more);
        assert_eq!(a.data.len() + b.data.len() + c.data.len(), 154);
        assert_eq!(ul.chain_state(), ChainState::default());
    }

    #[test]
    fn test_chain_is_all_or_nothing() {
        let attrs = RingAttrs { lnk_hdr: true, ..Default::default() };
        let (ul, _) = ring_pair(ChannelSpec::fmt(235, 4, 64), attrs);
        ul.tx(0, b"one").unwrap();
        ul.tx(0, b"two").unwrap();
        let big = vec![0u8; 100];
        assert!(matches!(ul.tx(0, &big), Err(LinkError::NoSpace { need: 2, space: 1, .. })));
        assert_eq!(ul.usage().unwrap(), 2);
    }

    #[test]
    fn test_dirty_pointer_detected() {
        let (ul, dl) = ring_pair(ChannelSpec::raw(30, 8, 64), RingAttrs::default());
        dl.set_wp(9).unwrap();
        assert!(matches!(dl.rx(), Err(LinkError::Dirty { capacity: 8, head: 9, .. })));
        ul.set_wp(8).unwrap();
        assert!(matches!(ul.tx(0, b"a"), Err(LinkError::Dirty { .. })));
    }

    #[test]
    fn test_bad_size_word_skips_slot() {
        let (_, dl) = ring_pair(ChannelSpec::raw(30, 8, 64), RingAttrs::default());
        let r = dl.region().clone();
        r.write_u32(dl.geometry().size_v(0), 500).unwrap();
        r.write_u32(dl.geometry().size_v(1), 2).unwrap();
        r.write_bytes(dl.geometry().slot_off(1), b"ok").unwrap();
        dl.set_wp(2).unwrap();

        assert!(matches!(dl.rx(), Err(LinkError::Protocol(_))));
        assert_eq!(dl.rx().unwrap().unwrap().payload(), b"ok");
    }

    #[test]
    fn test_wraparound_preserves_bytes() {
        let (ul, _) = ring_pair(ChannelSpec::raw(30, 4, 16), RingAttrs::default());
        for round in 0u8..10 {
            let msg = [round; 5];
            ul.tx(0, &msg).unwrap();
            assert_eq!(ul.rx().unwrap().unwrap().payload(), &msg);
        }
        assert_eq!(ul.wp().unwrap(), 10 % 4);
    }
}
