//! Legacy IPC: one byte-stream circular queue per direction for FMT and RAW
//! traffic, used when the SBD architecture is off (and for PHONE_START's
//! link reset either way).
//!
//! Frames carry a 4-byte link header so the receiver can cut the stream.
//! The AP writes tx head and rx tail; the CP writes tx tail and rx head.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use shmlink_core::barrier::{mb, rmb, wmb};
use shmlink_core::circ::{circ_new_ptr, CircQueue};
use shmlink_core::error::{LinkError, Result};
use shmlink_core::frame::{FrameData, RxFrame};
use shmlink_core::spinlock::SpinLock;
use shmlink_core::state::Direction;
use shmlink_core::wire::{LinkHeader, TrafficClass, LINK_HDR_SIZE};
use shmlink_core::kerror;

use crate::layout::{
    LegacyPtrs, FMT_BUFF_SIZE, OFF_FMT_PTRS, OFF_FMT_RX_BUFF, OFF_FMT_TX_BUFF, OFF_RAW_PTRS,
    OFF_RAW_RX_BUFF, OFF_RAW_TX_BUFF, RAW_BUFF_SIZE,
};
use crate::region::SharedRegion;

/// Where one class's queue pair lives.
#[derive(Debug, Clone, Copy)]
pub struct LegacyQueue {
    pub class: TrafficClass,
    pub ptrs: LegacyPtrs,
    pub tx_buff: usize,
    pub rx_buff: usize,
    pub size: u32,
}

impl LegacyQueue {
    pub const FMT: Self = Self {
        class: TrafficClass::Fmt,
        ptrs: LegacyPtrs::at(OFF_FMT_PTRS),
        tx_buff: OFF_FMT_TX_BUFF,
        rx_buff: OFF_FMT_RX_BUFF,
        size: FMT_BUFF_SIZE as u32,
    };

    pub const RAW: Self = Self {
        class: TrafficClass::Raw,
        ptrs: LegacyPtrs::at(OFF_RAW_PTRS),
        tx_buff: OFF_RAW_TX_BUFF,
        rx_buff: OFF_RAW_RX_BUFF,
        size: RAW_BUFF_SIZE as u32,
    };

    pub fn of(class: TrafficClass) -> Self {
        match class {
            TrafficClass::Fmt => Self::FMT,
            TrafficClass::Raw => Self::RAW,
        }
    }

    /// (buffer, head word, tail word) for one direction as the AP sees it.
    pub fn side(&self, dir: Direction) -> (usize, usize, usize) {
        match dir {
            Direction::Ul => (self.tx_buff, self.ptrs.tx_head, self.ptrs.tx_tail),
            Direction::Dl => (self.rx_buff, self.ptrs.rx_head, self.ptrs.rx_tail),
        }
    }
}

/// Write one framed payload into a byte queue as its producer.
///
/// Shared by the AP (UL) and the CP simulator (DL).
pub fn push_frame(
    region: &SharedRegion,
    q: &LegacyQueue,
    dir: Direction,
    ch: u8,
    payload: &[u8],
) -> Result<usize> {
    let (buff, head_off, tail_off) = q.side(dir);
    let head_w = region.atomic_u32(head_off)?;
    let tail_w = region.atomic_u32(tail_off)?;
    let cq = CircQueue::new(q.class.index() as u16, q.size, head_w.load(Ordering::Relaxed), tail_w.load(Ordering::Acquire));
    cq.check()?;

    let hdr = LinkHeader::for_payload(ch, payload.len()).ok_or(LinkError::TooLarge {
        len: payload.len(),
        max: u16::MAX as usize - LINK_HDR_SIZE,
    })?;
    let count = hdr.frame_len as u32;
    let space = cq.space();
    if count > space {
        return Err(LinkError::NoSpace { ring: cq.id, need: count, space });
    }

    region.write_circ(buff, q.size, cq.head, &hdr.encode())?;
    let body = circ_new_ptr(q.size, cq.head, LINK_HDR_SIZE as u32);
    region.write_circ(buff, q.size, body, payload)?;

    wmb();
    head_w.store(circ_new_ptr(q.size, cq.head, count), Ordering::Release);
    mb();
    Ok(count as usize)
}

/// Read every complete frame out of a byte queue as its consumer.
pub fn pop_frames(region: &SharedRegion, q: &LegacyQueue, dir: Direction) -> Result<Vec<RxFrame>> {
    let (buff, head_off, tail_off) = q.side(dir);
    let head_w = region.atomic_u32(head_off)?;
    let tail_w = region.atomic_u32(tail_off)?;
    let mut cq = CircQueue::new(q.class.index() as u16, q.size, head_w.load(Ordering::Acquire), tail_w.load(Ordering::Relaxed));
    cq.check()?;
    rmb();

    let mut frames = Vec::new();
    while cq.usage() >= LINK_HDR_SIZE as u32 {
        let mut raw = [0u8; LINK_HDR_SIZE];
        region.read_circ(buff, q.size, cq.tail, &mut raw)?;
        let hdr = match LinkHeader::parse(&raw) {
            Some(h) => h,
            None => {
                kerror!("legacy {:?}: ERR! bad link header {:02x?}, dropping queue", q.class, raw);
                tail_w.store(cq.head, Ordering::Release);
                return Err(LinkError::Protocol("bad link header"));
            }
        };
        if (hdr.frame_len as u32) > cq.usage() {
            // Producer has not finished publishing this frame.
            break;
        }
        let mut data = vec![0u8; hdr.frame_len as usize - LINK_HDR_SIZE];
        let body = circ_new_ptr(q.size, cq.tail, LINK_HDR_SIZE as u32);
        region.read_circ(buff, q.size, body, &mut data)?;
        cq.tail = circ_new_ptr(q.size, cq.tail, hdr.frame_len as u32);
        frames.push(RxFrame {
            ring_id: cq.id,
            dir,
            ch: hdr.ch as u16,
            lnk_hdr: false,
            more: false,
            data: FrameData::Copied(data),
        });
    }

    tail_w.store(cq.tail, Ordering::Release);
    mb();
    Ok(frames)
}

/// AP side of the legacy queues.
pub struct LegacyIpc {
    region: Arc<SharedRegion>,
    tx_lock: [SpinLock<()>; 2],
}

impl LegacyIpc {
    pub fn new(region: Arc<SharedRegion>) -> Self {
        Self {
            region,
            tx_lock: [SpinLock::new(()), SpinLock::new(())],
        }
    }

    pub fn send(&self, class: TrafficClass, ch: u8, payload: &[u8]) -> Result<usize> {
        let _g = self.tx_lock[class.index()].lock();
        push_frame(&self.region, &LegacyQueue::of(class), Direction::Ul, ch, payload)
    }

    pub fn recv(&self, class: TrafficClass) -> Result<Vec<RxFrame>> {
        pop_frames(&self.region, &LegacyQueue::of(class), Direction::Dl)
    }

    /// Zero every head/tail word.
    pub fn reset_map(&self) -> Result<()> {
        for q in [LegacyQueue::FMT, LegacyQueue::RAW] {
            for off in [q.ptrs.tx_head, q.ptrs.tx_tail, q.ptrs.rx_head, q.ptrs.rx_tail] {
                self.region.atomic_u32(off)?.store(0, Ordering::Release);
            }
        }
        mb();
        Ok(())
    }

    pub fn is_empty(&self, class: TrafficClass, dir: Direction) -> Result<bool> {
        let (_, head, tail) = LegacyQueue::of(class).side(dir);
        let h = self.region.atomic_u32(head)?.load(Ordering::Acquire);
        let t = self.region.atomic_u32(tail)?.load(Ordering::Acquire);
        Ok(h == t)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::MIN_REGION_SIZE;

    fn region() -> Arc<SharedRegion> {
        Arc::new(SharedRegion::anonymous(MIN_REGION_SIZE).unwrap())
    }

    #[test]
    fn test_ul_frames_reach_cp_side() {
        let r = region();
        let ipc = LegacyIpc::new(r.clone());
        ipc.send(TrafficClass::Fmt, 235, b"hello").unwrap();
        ipc.send(TrafficClass::Fmt, 235, b"world!").unwrap();
        assert!(!ipc.is_empty(TrafficClass::Fmt, Direction::Ul).unwrap());

        let frames = pop_frames(&r, &LegacyQueue::FMT, Direction::Ul).unwrap();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].ch, 235);
        assert_eq!(frames[0].payload(), b"hello");
        assert_eq!(frames[1].payload(), b"world!");
        assert!(ipc.is_empty(TrafficClass::Fmt, Direction::Ul).unwrap());
    }

    #[test]
    fn test_dl_wraps_and_fills() {
        let r = region();
        let ipc = LegacyIpc::new(r.clone());
        let payload = vec![0x5Au8; 1000];
        // 4 x 1004 bytes fit in 4095 usable bytes; a fifth does not.
        for _ in 0..4 {
            push_frame(&r, &LegacyQueue::FMT, Direction::Dl, 245, &payload).unwrap();
        }
        assert!(matches!(
            push_frame(&r, &LegacyQueue::FMT, Direction::Dl, 245, &payload),
            Err(LinkError::NoSpace { .. })
        ));
        assert_eq!(ipc.recv(TrafficClass::Fmt).unwrap().len(), 4);

        // Now head/tail sit near the end; the next frames straddle the wrap.
        for _ in 0..3 {
            push_frame(&r, &LegacyQueue::FMT, Direction::Dl, 245, &payload).unwrap();
        }
        let frames = ipc.recv(TrafficClass::Fmt).unwrap();
        assert_eq!(frames.len(), 3);
        assert!(frames.iter().all(|f| f.payload() == &payload[..]));
    }

    #[test]
    fn test_dirty_and_garbage() {
        let r = region();
        let ipc = LegacyIpc::new(r.clone());
        r.write_u32(LegacyQueue::RAW.ptrs.rx_head, 0x10_0000).unwrap();
        assert!(matches!(ipc.recv(TrafficClass::Raw), Err(LinkError::Dirty { .. })));

        ipc.reset_map().unwrap();
        r.write_bytes(OFF_RAW_RX_BUFF, &[0, 0, 0, 0, 0]).unwrap();
        r.write_u32(LegacyQueue::RAW.ptrs.rx_head, 5).unwrap();
        assert!(matches!(ipc.recv(TrafficClass::Raw), Err(LinkError::Protocol(_))));
        assert!(ipc.is_empty(TrafficClass::Raw, Direction::Dl).unwrap());
    }
}
