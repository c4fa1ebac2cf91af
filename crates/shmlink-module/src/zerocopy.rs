//! Zero-copy DL: a bitmap cell pool plus the adaptor that keeps a DL ring
//! stocked with pool cells.
//!
//! On a zero-copy DL ring the roles of the two pointers change. The AP
//! hands empty cells to the CP by writing each cell's peer-visible offset
//! into a slot and advancing `rp`; the CP fills a cell, sets the slot's size
//! word and advances `wp`. The adaptor keeps its own `pre_rp`, the next
//! filled slot the AP has not consumed yet:
//!
//! ```text
//!   pre_rp ..(filled)..  wp  ..(handed to CP, not filled)..  rp  ..(free)..
//! ```
//!
//! - data available  = usage(len, wp, pre_rp)
//! - refill space    = space(len, rp, pre_rp)
//!
//! Slot payload is a little-endian `u64`:
//! `ipc_size + cell_offset + headroom`. Cells handed out are remembered in
//! order in an in-flight FIFO; every filled slot must name the cell at the
//! FIFO head.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use crossbeam_queue::ArrayQueue;

use shmlink_core::barrier::{mb, rmb, wmb};
use shmlink_core::bitmap::AtomicBitmap;
use shmlink_core::cell::{CellAllocator, CellBuf, CellHandle};
use shmlink_core::circ::{circ_get_space, circ_get_usage, circ_new_ptr, circ_valid};
use shmlink_core::error::{LinkError, Result};
use shmlink_core::frame::{FrameData, RxFrame};
use shmlink_core::spinlock::SpinLock;
use shmlink_core::wire::size_len;
use shmlink_core::{kdebug, kerror, ktrace};

use crate::region::SharedRegion;
use crate::sbd::SbdRing;

/// Fixed-size cells carved out of their own mapping.
///
/// Set bit in `free` = cell available.
pub struct BitmapCellPool {
    mem: SharedRegion,
    cell_size: usize,
    cell_count: usize,
    free: AtomicBitmap,
    hint: AtomicUsize,
}

impl BitmapCellPool {
    pub fn new(cell_size: usize, cell_count: usize) -> Result<Self> {
        if cell_size == 0 || cell_count == 0 {
            return Err(LinkError::Config("empty cell pool"));
        }
        Ok(Self {
            mem: SharedRegion::anonymous(cell_size * cell_count)?,
            cell_size,
            cell_count,
            free: AtomicBitmap::full(cell_count),
            hint: AtomicUsize::new(0),
        })
    }

    pub fn available(&self) -> usize {
        self.free.count()
    }

    fn handle(&self, index: usize) -> CellHandle {
        CellHandle {
            index: index as u32,
            offset: (index * self.cell_size) as u32,
        }
    }
}

impl CellAllocator for BitmapCellPool {
    fn acquire(&self) -> Option<CellHandle> {
        let idx = self.free.find_and_claim(self.hint.load(Ordering::Relaxed))?;
        self.hint.store(idx + 1, Ordering::Relaxed);
        Some(self.handle(idx))
    }

    fn release(&self, cell: CellHandle) {
        if !self.free.set(cell.index as usize) {
            kerror!("zmb: ERR! double free of cell {}", cell.index);
        }
    }

    fn cell_size(&self) -> usize {
        self.cell_size
    }

    fn cell_count(&self) -> usize {
        self.cell_count
    }

    fn in_use(&self) -> usize {
        self.cell_count - self.free.count()
    }

    fn cell_at(&self, offset: u32) -> Option<CellHandle> {
        let offset = offset as usize;
        if offset % self.cell_size != 0 || offset / self.cell_size >= self.cell_count {
            return None;
        }
        Some(self.handle(offset / self.cell_size))
    }

    fn cell_data(&self, cell: &CellHandle, start: usize, len: usize) -> Option<&[u8]> {
        if start.checked_add(len)? > self.cell_size {
            return None;
        }
        // Safety: the caller holds the cell, so the CP is done writing it.
        unsafe { self.mem.bytes(cell.offset as usize + start, len).ok() }
    }

    fn write_cell(&self, cell: &CellHandle, start: usize, src: &[u8]) -> bool {
        if start + src.len() > self.cell_size {
            return false;
        }
        self.mem.write_bytes(cell.offset as usize + start, src).is_ok()
    }
}

/// Keeps one zero-copy DL ring stocked and turns filled slots into frames.
pub struct ZeroCopyAdaptor {
    ring: Arc<SbdRing>,
    pool: Arc<dyn CellAllocator>,
    inflight: ArrayQueue<CellHandle>,
    pre_rp: SpinLock<u32>,
    /// Peer-visible base of the pool (the IPC region size).
    ipc_size: u64,
    headroom: usize,
    use_memcpy: bool,
    reset_done: AtomicBool,
}

impl ZeroCopyAdaptor {
    pub fn new(
        ring: Arc<SbdRing>,
        pool: Arc<dyn CellAllocator>,
        ipc_size: usize,
        headroom: usize,
        use_memcpy: bool,
    ) -> Result<Self> {
        if pool.cell_size() <= headroom {
            return Err(LinkError::Config("cell smaller than headroom"));
        }
        let pre_rp = ring.wp()?;
        let depth = ring.len() as usize;
        Ok(Self {
            ring,
            pool,
            inflight: ArrayQueue::new(depth),
            pre_rp: SpinLock::new(pre_rp),
            ipc_size: ipc_size as u64,
            headroom,
            use_memcpy,
            reset_done: AtomicBool::new(false),
        })
    }

    pub fn ring(&self) -> &Arc<SbdRing> {
        &self.ring
    }

    pub fn pre_rp(&self) -> u32 {
        *self.pre_rp.lock()
    }

    pub fn outstanding(&self) -> usize {
        self.inflight.len()
    }

    /// Peer-visible offset of a cell's data area.
    pub fn data_offset(&self, cell: &CellHandle) -> u64 {
        self.ipc_size + cell.offset as u64 + self.headroom as u64
    }

    fn offset_to_cell(&self, offset: u64) -> Option<CellHandle> {
        let buf = offset
            .checked_sub(self.headroom as u64)?
            .checked_sub(self.ipc_size)?;
        self.pool.cell_at(u32::try_from(buf).ok()?)
    }

    fn checked(&self, head: u32, tail: u32) -> Result<()> {
        if circ_valid(self.ring.len(), head, tail) {
            Ok(())
        } else {
            Err(LinkError::Dirty {
                ring: self.ring.id(),
                capacity: self.ring.len(),
                head,
                tail,
            })
        }
    }

    /// Filled slots waiting to be consumed.
    pub fn usage(&self) -> Result<u32> {
        let pre_rp = *self.pre_rp.lock();
        let wp = self.ring.wp()?;
        self.checked(wp, pre_rp)?;
        Ok(circ_get_usage(self.ring.len(), wp, pre_rp))
    }

    /// Slots that can take a fresh cell.
    pub fn space(&self) -> Result<u32> {
        let pre_rp = *self.pre_rp.lock();
        let rp = self.ring.rp()?;
        self.checked(rp, pre_rp)?;
        Ok(circ_get_space(self.ring.len(), rp, pre_rp))
    }

    /// Hand fresh cells to the CP until the ring is full.
    ///
    /// Returns the number of cells published. An exhausted pool yields
    /// `AllocExhausted` after publishing what it could; the caller retries
    /// from the datalloc timer. Does nothing while `online` is false.
    pub fn allocate_in_advance(&self, online: bool) -> Result<usize> {
        if !online {
            return Ok(0);
        }
        let pre_rp = self.pre_rp.lock();
        let len = self.ring.len();
        let mut wp = self.ring.rp()?;
        self.checked(wp, *pre_rp)?;

        let mut count = 0usize;
        let mut result = Ok(());
        while circ_get_space(len, wp, *pre_rp) > 0 {
            let cell = match self.pool.acquire() {
                Some(c) => c,
                None => {
                    result = Err(LinkError::AllocExhausted);
                    break;
                }
            };
            if let Err(cell) = self.inflight.push(cell) {
                self.pool.release(cell);
                result = Err(LinkError::Protocol("in-flight fifo overflow"));
                break;
            }
            let slot = self.ring.geometry().slot_off(wp);
            self.ring
                .region()
                .write_bytes(slot, &self.data_offset(&cell).to_le_bytes())?;
            wp = circ_new_ptr(len, wp, 1);
            count += 1;
        }

        if count > 0 {
            wmb();
            self.ring.set_rp(wp)?;
        }
        drop(pre_rp);
        mb();

        if count > 0 {
            ktrace!("ZC RB[{}] stocked {} cells", self.ring.id(), count);
        }
        if let Err(LinkError::AllocExhausted) = result {
            kdebug!("ZC RB[{}] pool exhausted after {} cells", self.ring.id(), count);
        }
        result.map(|_| count)
    }

    /// Consume one filled slot.
    ///
    /// The cell moves into the frame (`FrameData::Cell`) and returns to the
    /// pool when the frame is dropped. In memcpy mode the bytes are copied
    /// and the cell is released at once.
    pub fn rx(&self) -> Result<Option<RxFrame>> {
        let mut pre_rp = self.pre_rp.lock();
        let out = *pre_rp;
        let wp = self.ring.wp()?;
        self.checked(wp, out)?;
        if wp == out {
            return Ok(None);
        }
        rmb();

        let size = self.ring.slot_size(out)?;
        let len = size_len(size) as usize;
        let mut raw = [0u8; 8];
        self.ring
            .region()
            .read_bytes(self.ring.geometry().slot_off(out), &mut raw)?;
        let offset = u64::from_le_bytes(raw);
        *pre_rp = circ_new_ptr(self.ring.len(), out, 1);
        drop(pre_rp);

        let expected = self.inflight.pop().ok_or_else(|| {
            kerror!("ZC RB[{}] ERR! in-flight fifo empty", self.ring.id());
            LinkError::Protocol("in-flight fifo empty")
        })?;
        if self.offset_to_cell(offset) != Some(expected) {
            kerror!(
                "ZC RB[{}] ERR! unexpected offset {:#x} (cell {} expected)",
                self.ring.id(), offset, expected.index
            );
            self.pool.release(expected);
            return Err(LinkError::Protocol("offset does not match in-flight cell"));
        }
        if len > self.pool.cell_size() - self.headroom {
            self.pool.release(expected);
            return Err(LinkError::Protocol("slot size exceeds cell"));
        }

        let data = if self.use_memcpy {
            let copied = self
                .pool
                .cell_data(&expected, self.headroom, len)
                .map(|s| s.to_vec())
                .unwrap_or_default();
            self.pool.release(expected);
            FrameData::Copied(copied)
        } else {
            FrameData::Cell(CellBuf::new(self.pool.clone(), expected, self.headroom, len))
        };

        let (lnk_hdr, more) = self.ring.account(data.as_slice());
        Ok(Some(RxFrame {
            ring_id: self.ring.id(),
            dir: self.ring.dir(),
            ch: self.ring.slot_channel(size),
            lnk_hdr,
            more,
            data,
        }))
    }

    /// Arm a reset: the next `reset()` frees every outstanding cell.
    pub fn arm_reset(&self) {
        self.reset_done.store(false, Ordering::Release);
    }

    /// Free every cell still handed to the CP. Runs once per arm.
    pub fn reset(&self) -> usize {
        if self.reset_done.swap(true, Ordering::AcqRel) {
            return 0;
        }
        let mut pre_rp = self.pre_rp.lock();
        let mut freed = 0usize;
        while let Some(cell) = self.inflight.pop() {
            self.pool.release(cell);
            freed += 1;
        }
        *pre_rp = self.ring.wp().unwrap_or(0);
        self.ring.reset_chain();
        kdebug!("ZC RB[{}] reset, {} cells freed", self.ring.id(), freed);
        freed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sbd::tests::ring_pair;
    use crate::sbd::RingAttrs;
    use shmlink_core::config::ChannelSpec;
    use shmlink_core::wire::pack_size;

    const IPC: usize = 0x40_0000;
    const HEADROOM: usize = 64;

    fn setup(len: u16, cells: usize, memcpy: bool) -> (ZeroCopyAdaptor, Arc<BitmapCellPool>) {
        let attrs = RingAttrs { zerocopy: true, ..Default::default() };
        let (_, dl) = ring_pair(ChannelSpec::raw(30, len, 64).with_zerocopy(true), attrs);
        let pool = Arc::new(BitmapCellPool::new(512, cells).unwrap());
        let zd = ZeroCopyAdaptor::new(Arc::new(dl), pool.clone(), IPC, HEADROOM, memcpy).unwrap();
        (zd, pool)
    }

    /// What the CP does: fill the cell named by slot `wp`, publish wp+1.
    fn cp_fill(zd: &ZeroCopyAdaptor, pool: &BitmapCellPool, payload: &[u8]) {
        let ring = zd.ring();
        let wp = ring.wp().unwrap();
        let mut raw = [0u8; 8];
        ring.region().read_bytes(ring.geometry().slot_off(wp), &mut raw).unwrap();
        let off = u64::from_le_bytes(raw);
        let cell = pool.cell_at((off - HEADROOM as u64 - IPC as u64) as u32).unwrap();
        assert!(pool.write_cell(&cell, HEADROOM, payload));
        ring.region()
            .write_u32(ring.geometry().size_v(wp), pack_size(payload.len() as u16, 0))
            .unwrap();
        ring.set_wp(circ_new_ptr(ring.len(), wp, 1)).unwrap();
    }

    #[test]
    fn test_stock_fill_consume() {
        let (zd, pool) = setup(8, 32, false);
        assert_eq!(zd.allocate_in_advance(true).unwrap(), 7);
        assert_eq!(pool.in_use(), 7);
        assert_eq!(zd.space().unwrap(), 0);

        cp_fill(&zd, &pool, b"zero-copy");
        assert_eq!(zd.usage().unwrap(), 1);
        let frame = zd.rx().unwrap().unwrap();
        assert!(frame.data.is_zerocopy());
        assert_eq!(frame.payload(), b"zero-copy");
        assert_eq!(pool.in_use(), 7);
        drop(frame);
        assert_eq!(pool.in_use(), 6);

        // One slot freed up; restocking publishes exactly one cell.
        assert_eq!(zd.allocate_in_advance(true).unwrap(), 1);
    }

    #[test]
    fn test_memcpy_mode_releases_cell() {
        let (zd, pool) = setup(4, 8, true);
        zd.allocate_in_advance(true).unwrap();
        cp_fill(&zd, &pool, b"copied");
        let frame = zd.rx().unwrap().unwrap();
        assert!(!frame.data.is_zerocopy());
        assert_eq!(frame.payload(), b"copied");
        assert_eq!(pool.in_use(), 2);
    }

    #[test]
    fn test_exhaustion_is_soft() {
        let (zd, pool) = setup(8, 3, false);
        assert_eq!(zd.allocate_in_advance(true), Err(LinkError::AllocExhausted));
        assert_eq!(pool.in_use(), 3);
        assert_eq!(zd.ring().rp().unwrap(), 3);
        assert_eq!(zd.outstanding(), 3);

        cp_fill(&zd, &pool, b"a");
        drop(zd.rx().unwrap().unwrap());
        assert_eq!(zd.allocate_in_advance(true), Err(LinkError::AllocExhausted));
        assert_eq!(zd.ring().rp().unwrap(), 4);
    }

    #[test]
    fn test_offline_does_nothing() {
        let (zd, pool) = setup(8, 8, false);
        assert_eq!(zd.allocate_in_advance(false).unwrap(), 0);
        assert_eq!(pool.in_use(), 0);
    }

    #[test]
    fn test_foreign_offset_rejected() {
        let (zd, pool) = setup(4, 8, false);
        zd.allocate_in_advance(true).unwrap();
        let ring = zd.ring();
        ring.region().write_u64(ring.geometry().slot_off(0), 12345).unwrap();
        ring.set_wp(1).unwrap();
        assert!(matches!(zd.rx(), Err(LinkError::Protocol(_))));
        assert_eq!(pool.in_use(), 2);
    }

    #[test]
    fn test_reset_frees_outstanding_once() {
        let (zd, pool) = setup(8, 16, false);
        zd.allocate_in_advance(true).unwrap();
        cp_fill(&zd, &pool, b"held");
        let held = zd.rx().unwrap().unwrap();

        zd.arm_reset();
        assert_eq!(zd.reset(), 6);
        assert_eq!(zd.reset(), 0);
        assert_eq!(pool.in_use(), 1);
        drop(held);
        assert_eq!(pool.in_use(), 0);
    }

    #[test]
    fn test_pool_double_free_is_ignored() {
        let pool = BitmapCellPool::new(256, 4).unwrap();
        let c = pool.acquire().unwrap();
        assert_eq!(pool.cell_at(c.offset), Some(c));
        assert_eq!(pool.cell_at(c.offset + 1), None);
        pool.release(c);
        pool.release(c);
        assert_eq!(pool.available(), 4);
    }
}
