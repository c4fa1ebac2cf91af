//! The SBD ring table of a link and its bring-up.
//!
//! INIT_START (or MDM_READY on IOSM links) plans the layout for the
//! configured channel table, publishes it, and binds one UL and one DL
//! `SbdRing` per channel. Zero-copy DL rings get a `ZeroCopyAdaptor` over
//! the link's cell pool. Each UL ring also owns a bounded software queue
//! that `enqueue` fills and the tx timer drains.

use std::collections::VecDeque;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use shmlink_core::cell::CellAllocator;
use shmlink_core::config::{ChannelFormat, ChannelSpec};
use shmlink_core::error::{LinkError, Result};
use shmlink_core::spinlock::SpinLock;
use shmlink_core::{kdebug, kerror, kinfo};

use crate::layout::{ring_for_channel, SbdLayout};
use crate::link::LinkDevice;
use crate::region::SharedRegion;
use crate::sbd::{RingAttrs, SbdRing};
use crate::zerocopy::ZeroCopyAdaptor;

/// A frame waiting in a UL software queue. `data` is ready to write
/// (link header included where the ring uses one).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxFrame {
    pub ch: u16,
    pub data: Vec<u8>,
}

pub struct RingTable {
    pub layout: SbdLayout,
    pub ul: Vec<Arc<SbdRing>>,
    pub dl: Vec<Arc<SbdRing>>,
    /// Indexed by ring id; `Some` for zero-copy DL rings.
    pub zc: Vec<Option<ZeroCopyAdaptor>>,
    pub txq: Vec<SpinLock<VecDeque<TxFrame>>>,
    channels: Vec<ChannelSpec>,
}

impl RingTable {
    /// Plan, publish and bind the rings of `channels`.
    pub fn build(
        region: &Arc<SharedRegion>,
        channels: &[ChannelSpec],
        cells: Option<&Arc<dyn CellAllocator>>,
        headroom: usize,
    ) -> Result<Self> {
        let layout = SbdLayout::plan(channels, region.size())?;
        layout.publish(region)?;

        let n = channels.len();
        let mut ul = Vec::with_capacity(n);
        let mut dl = Vec::with_capacity(n);
        let mut zc = Vec::with_capacity(n);
        for (spec, [ul_geo, dl_geo]) in channels.iter().zip(layout.rings.iter()) {
            let attrs = RingAttrs {
                lnk_hdr: spec.lnk_hdr,
                zerocopy: false,
                multiplexed: spec.format == ChannelFormat::Multi,
            };
            let up = Arc::new(SbdRing::new(region.clone(), *ul_geo, attrs)?);
            let down = Arc::new(SbdRing::new(
                region.clone(),
                *dl_geo,
                RingAttrs { zerocopy: spec.zerocopy, ..attrs },
            )?);
            let adaptor = if spec.zerocopy {
                let pool = cells.ok_or(LinkError::Config("zero-copy channel without a cell pool"))?;
                Some(ZeroCopyAdaptor::new(down.clone(), pool.clone(), region.size(), headroom, false)?)
            } else {
                None
            };
            ul.push(up);
            dl.push(down);
            zc.push(adaptor);
        }

        Ok(Self {
            layout,
            ul,
            dl,
            zc,
            txq: (0..n).map(|_| SpinLock::new(VecDeque::new())).collect(),
            channels: channels.to_vec(),
        })
    }

    pub fn num_rings(&self) -> usize {
        self.ul.len()
    }

    /// Ring carrying `ch`; PS channels share the multiplexed ring.
    pub fn ring_id(&self, ch: u16) -> Result<u16> {
        ring_for_channel(&self.channels, ch).ok_or(LinkError::NoSuchChannel(ch))
    }

    /// Channel a ring was configured for.
    pub fn channel(&self, id: u16) -> Option<u16> {
        self.channels.get(id as usize).map(|c| c.ch)
    }

    pub fn txq_len(&self, id: u16) -> usize {
        self.txq.get(id as usize).map(|q| q.lock().len()).unwrap_or(0)
    }

    pub fn has_pending_tx(&self) -> bool {
        self.txq.iter().any(|q| !q.lock().is_empty())
    }

    /// Drop every queued frame. Returns how many were dropped.
    pub fn purge(&self) -> usize {
        self.txq
            .iter()
            .map(|q| {
                let mut q = q.lock();
                let n = q.len();
                q.clear();
                n
            })
            .sum()
    }

    /// Zero every ring pointer. Cells handed to the CP go back to the pool.
    pub fn reset_pointers(&self) -> Result<()> {
        for ring in self.ul.iter().chain(self.dl.iter()) {
            ring.reset()?;
        }
        self.reset_zerocopy();
        Ok(())
    }

    /// Free every cell handed to the CP. Returns the number freed.
    pub fn reset_zerocopy(&self) -> usize {
        self.zc
            .iter()
            .flatten()
            .map(|zc| {
                zc.arm_reset();
                zc.reset()
            })
            .sum()
    }
}

impl LinkDevice {
    pub fn ring_table(&self) -> Result<Arc<RingTable>> {
        self.table.lock().clone().ok_or(LinkError::NotInitialized)
    }

    pub fn sbd_active(&self) -> bool {
        self.sbd_active.load(Ordering::Acquire)
    }

    /// Build (or rebuild) every ring from the configured channel table.
    pub(crate) fn init_sbd_link(&self) -> Result<()> {
        self.sbd_deactivate();
        if let Some(old) = self.table.lock().take() {
            old.purge();
            old.reset_zerocopy();
        }
        let table = RingTable::build(
            &self.region,
            &self.cfg.channels,
            self.cells.as_ref(),
            self.cfg.net_headroom,
        )?;
        kinfo!(
            "{}: SBD {} rings, rbps {:#x}, buffers end {:#x}",
            self.name(),
            table.layout.num_channels,
            table.layout.rbps_offset,
            table.layout.buff_end
        );
        *self.table.lock() = Some(Arc::new(table));
        Ok(())
    }

    pub(crate) fn sbd_activate(&self) -> Result<()> {
        let table = self.ring_table()?;
        self.sbd_active.store(true, Ordering::Release);
        kdebug!("{}: SBD active", self.name());
        self.replenish_rings(&table);
        Ok(())
    }

    pub(crate) fn sbd_deactivate(&self) {
        if self.sbd_active.swap(false, Ordering::AcqRel) {
            kdebug!("{}: SBD inactive", self.name());
        }
    }

    /// Drop queued tx frames on every ring.
    pub(crate) fn purge_txq(&self) {
        if let Ok(table) = self.ring_table() {
            let n = table.purge();
            if n > 0 {
                kdebug!("{}: purged {} queued frames", self.name(), n);
            }
        }
    }

    /// Stock one zero-copy DL ring. Returns true if the pool ran dry and a
    /// retry is needed.
    pub(crate) fn replenish(&self, zc: &ZeroCopyAdaptor) -> bool {
        match zc.allocate_in_advance(self.sbd_active()) {
            Ok(_) => false,
            Err(LinkError::AllocExhausted) => true,
            Err(e) => {
                kerror!("{}: ERR! ZC RB[{}] replenish: {}", self.name(), zc.ring().id(), e);
                false
            }
        }
    }

    /// Stock every zero-copy DL ring. Arms the datalloc timer if the pool
    /// ran dry.
    pub(crate) fn replenish_rings(&self, table: &RingTable) {
        let mut retry = false;
        for zc in table.zc.iter().flatten() {
            retry |= self.replenish(zc);
        }
        if retry {
            self.arm_datalloc_timer();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::MIN_REGION_SIZE;
    use crate::zerocopy::BitmapCellPool;
    use shmlink_core::config::LinkConfig;
    use shmlink_core::wire::{CH_FMT_0, CH_PDP_0, CH_RFS_0};

    fn region() -> Arc<SharedRegion> {
        Arc::new(SharedRegion::anonymous(MIN_REGION_SIZE + (4 << 20)).unwrap())
    }

    #[test]
    fn test_build_default_table() {
        let r = region();
        let cfg = LinkConfig::new();
        let t = RingTable::build(&r, &cfg.channels, None, 0).unwrap();
        assert_eq!(t.num_rings(), 3);
        assert_eq!(t.ring_id(CH_FMT_0), Ok(0));
        assert_eq!(t.ring_id(CH_RFS_0), Ok(1));
        // Every PS channel lands on the multiplexed ring.
        assert_eq!(t.ring_id(CH_PDP_0 + 3), Ok(2));
        assert_eq!(t.ring_id(200), Err(LinkError::NoSuchChannel(200)));
        assert_eq!(t.channel(2), Some(CH_PDP_0));
        assert!(t.zc.iter().all(|z| z.is_none()));

        // What the CP discovers matches what was bound.
        let seen = SbdLayout::discover(&r).unwrap();
        assert_eq!(seen.num_channels, 3);
        assert_eq!(&seen.rings[1][0], t.ul[1].geometry());
    }

    #[test]
    fn test_zerocopy_needs_pool() {
        let r = region();
        let chans = [ChannelSpec::raw(30, 8, 512).with_zerocopy(true)];
        assert!(matches!(
            RingTable::build(&r, &chans, None, 64),
            Err(LinkError::Config(_))
        ));
        let pool: Arc<dyn CellAllocator> = Arc::new(BitmapCellPool::new(512, 16).unwrap());
        let t = RingTable::build(&r, &chans, Some(&pool), 64).unwrap();
        assert!(t.zc[0].is_some());
    }

    #[test]
    fn test_txq_purge_and_reset() {
        let r = region();
        let t = RingTable::build(&r, &LinkConfig::new().channels, None, 0).unwrap();
        t.txq[0].lock().push_back(TxFrame { ch: CH_FMT_0, data: vec![1] });
        t.txq[2].lock().push_back(TxFrame { ch: CH_PDP_0, data: vec![2] });
        assert!(t.has_pending_tx());
        assert_eq!(t.txq_len(0), 1);
        assert_eq!(t.purge(), 2);
        assert!(!t.has_pending_tx());

        t.ul[0].tx(0, b"x").unwrap();
        t.reset_pointers().unwrap();
        assert_eq!(t.ul[0].usage().unwrap(), 0);
    }
}
