//! Shared-region map and the SBD descriptor region.
//!
//! ```text
//! 0x0000_0000  magic (u32)         access (u32)
//! 0x0000_0010  FMT  tx head/tail, rx head/tail (u32 x4)
//! 0x0000_0020  RAW  tx head/tail, rx head/tail (u32 x4)
//! 0x0000_1000  IOSM area AP->CP    (0x800)
//! 0x0000_1800  IOSM area CP->AP    (0x800)
//! 0x0000_2000  SBD descriptor region, up to 0x10000
//! 0x0001_0000  legacy buffers: FMT tx/rx 4K each, RAW tx/rx 16K each
//! 0x0002_0000  SBD data buffers
//! ```
//!
//! Descriptor region, in allocation order:
//!
//! ```text
//! global desc   version u8 | num_channels u8 | reserved u16 | rbps_offset u32
//! rb_ch[32]     ul_rbd, ul_sbdv, dl_rbd, dl_sbdv               (u32 x4)
//! rb_desc[32][2] id ch dir signaling sig_mask length (u16 x6)
//!               buff_size payload_offset reserved              (u32 x3)
//! rbps          rp[UL] | wp[UL] | rp[DL] | wp[DL]   (u16 x num_channels each)
//! per ring      addr_v[len] (u32 offsets) then size_v[len] (u32)
//! ```
//!
//! All offsets stored in shared memory are relative to the region base, so
//! the CP locates every ring from the global descriptor alone.

use shmlink_core::config::{ChannelFormat, ChannelSpec, MAX_LINK_CHANNELS};
use shmlink_core::error::{LinkError, Result};
use shmlink_core::state::Direction;
use shmlink_core::wire::{MASK_INT_VALID, MASK_SEND_DATA};

use crate::region::SharedRegion;

pub const OFF_MAGIC: usize = 0x0;
pub const OFF_ACCESS: usize = 0x4;

pub const OFF_FMT_PTRS: usize = 0x10;
pub const OFF_RAW_PTRS: usize = 0x20;

pub const OFF_IOSM_TX: usize = 0x1000;
pub const OFF_IOSM_RX: usize = 0x1800;
pub const IOSM_AREA_SIZE: usize = 0x800;
pub const OFF_CMD_RGN: usize = OFF_IOSM_TX;
pub const CMD_RGN_SIZE: usize = 2 * IOSM_AREA_SIZE;

pub const OFF_DESC_RGN: usize = 0x2000;
pub const DESC_RGN_SIZE: usize = 0x10000 - OFF_DESC_RGN;

pub const OFF_FMT_TX_BUFF: usize = 0x10000;
pub const FMT_BUFF_SIZE: usize = 0x1000;
pub const OFF_FMT_RX_BUFF: usize = OFF_FMT_TX_BUFF + FMT_BUFF_SIZE;
pub const OFF_RAW_TX_BUFF: usize = OFF_FMT_RX_BUFF + FMT_BUFF_SIZE;
pub const RAW_BUFF_SIZE: usize = 0x4000;
pub const OFF_RAW_RX_BUFF: usize = OFF_RAW_TX_BUFF + RAW_BUFF_SIZE;

pub const OFF_BUFF_RGN: usize = 0x20000;

/// Smallest region that holds everything but the SBD data buffers.
pub const MIN_REGION_SIZE: usize = OFF_BUFF_RGN;

pub const SBD_VERSION: u8 = 1;

const G_DESC_SIZE: usize = 8;
const RB_CH_SIZE: usize = 16;
const RB_DESC_SIZE: usize = 24;

const OFF_G_DESC: usize = OFF_DESC_RGN;
const OFF_RB_CH: usize = OFF_G_DESC + G_DESC_SIZE;
const OFF_RB_DESC: usize = OFF_RB_CH + RB_CH_SIZE * MAX_LINK_CHANNELS;
const OFF_RBPS: usize = OFF_RB_DESC + RB_DESC_SIZE * 2 * MAX_LINK_CHANNELS;

// ── Legacy pointer block ──

/// Offsets of one legacy byte queue pair's pointer words.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LegacyPtrs {
    pub tx_head: usize,
    pub tx_tail: usize,
    pub rx_head: usize,
    pub rx_tail: usize,
}

impl LegacyPtrs {
    pub const fn at(base: usize) -> Self {
        Self {
            tx_head: base,
            tx_tail: base + 4,
            rx_head: base + 8,
            rx_tail: base + 12,
        }
    }
}

// ── SBD descriptor structures ──

/// Global descriptor at the start of the descriptor region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GlobalDesc {
    pub version: u8,
    pub num_channels: u8,
    pub rbps_offset: u32,
}

impl GlobalDesc {
    pub fn write(&self, region: &SharedRegion) -> Result<()> {
        region.write_u8(OFF_G_DESC, self.version)?;
        region.write_u8(OFF_G_DESC + 1, self.num_channels)?;
        region.write_u16(OFF_G_DESC + 2, 0)?;
        region.write_u32(OFF_G_DESC + 4, self.rbps_offset)
    }

    pub fn read(region: &SharedRegion) -> Result<Self> {
        Ok(Self {
            version: region.read_u8(OFF_G_DESC)?,
            num_channels: region.read_u8(OFF_G_DESC + 1)?,
            rbps_offset: region.read_u32(OFF_G_DESC + 4)?,
        })
    }
}

/// Per-channel pointers to the two ring descriptors and slot arrays.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RbChannel {
    pub ul_rbd_offset: u32,
    pub ul_sbdv_offset: u32,
    pub dl_rbd_offset: u32,
    pub dl_sbdv_offset: u32,
}

impl RbChannel {
    fn offset(id: u16) -> usize {
        OFF_RB_CH + id as usize * RB_CH_SIZE
    }

    pub fn write(&self, region: &SharedRegion, id: u16) -> Result<()> {
        let off = Self::offset(id);
        region.write_u32(off, self.ul_rbd_offset)?;
        region.write_u32(off + 4, self.ul_sbdv_offset)?;
        region.write_u32(off + 8, self.dl_rbd_offset)?;
        region.write_u32(off + 12, self.dl_sbdv_offset)
    }

    pub fn read(region: &SharedRegion, id: u16) -> Result<Self> {
        let off = Self::offset(id);
        Ok(Self {
            ul_rbd_offset: region.read_u32(off)?,
            ul_sbdv_offset: region.read_u32(off + 4)?,
            dl_rbd_offset: region.read_u32(off + 8)?,
            dl_sbdv_offset: region.read_u32(off + 12)?,
        })
    }

    pub fn rbd_offset(&self, dir: Direction) -> u32 {
        match dir {
            Direction::Ul => self.ul_rbd_offset,
            Direction::Dl => self.dl_rbd_offset,
        }
    }

    pub fn sbdv_offset(&self, dir: Direction) -> u32 {
        match dir {
            Direction::Ul => self.ul_sbdv_offset,
            Direction::Dl => self.dl_sbdv_offset,
        }
    }
}

/// One ring descriptor as published to the CP.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RbDesc {
    pub id: u16,
    pub ch: u16,
    pub direction: u16,
    pub signaling: u16,
    pub sig_mask: u16,
    pub length: u16,
    pub buff_size: u32,
    pub payload_offset: u32,
}

impl RbDesc {
    pub fn offset(id: u16, dir: Direction) -> usize {
        OFF_RB_DESC + (id as usize * 2 + dir.index()) * RB_DESC_SIZE
    }

    pub fn write(&self, region: &SharedRegion, off: usize) -> Result<()> {
        region.write_u16(off, self.id)?;
        region.write_u16(off + 2, self.ch)?;
        region.write_u16(off + 4, self.direction)?;
        region.write_u16(off + 6, self.signaling)?;
        region.write_u16(off + 8, self.sig_mask)?;
        region.write_u16(off + 10, self.length)?;
        region.write_u32(off + 12, self.buff_size)?;
        region.write_u32(off + 16, self.payload_offset)?;
        region.write_u32(off + 20, 0)
    }

    pub fn read(region: &SharedRegion, off: usize) -> Result<Self> {
        Ok(Self {
            id: region.read_u16(off)?,
            ch: region.read_u16(off + 2)?,
            direction: region.read_u16(off + 4)?,
            signaling: region.read_u16(off + 6)?,
            sig_mask: region.read_u16(off + 8)?,
            length: region.read_u16(off + 10)?,
            buff_size: region.read_u32(off + 12)?,
            payload_offset: region.read_u32(off + 16)?,
        })
    }
}

// ── Planning ──

/// Where one ring lives. All offsets are region-relative.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingGeometry {
    pub id: u16,
    pub ch: u16,
    pub dir: Direction,
    pub len: u16,
    pub buff_size: u32,
    pub rbd_off: u32,
    pub addr_v_off: u32,
    pub size_v_off: u32,
    pub buff_off: u32,
    pub rp_off: u32,
    pub wp_off: u32,
}

impl RingGeometry {
    pub fn desc(&self) -> RbDesc {
        RbDesc {
            id: self.id,
            ch: self.ch,
            direction: self.dir.index() as u16,
            signaling: 1,
            sig_mask: MASK_INT_VALID | MASK_SEND_DATA,
            length: self.len,
            buff_size: self.buff_size,
            payload_offset: 0,
        }
    }

    /// Byte offset of slot `idx`'s data buffer.
    #[inline]
    pub fn slot_off(&self, idx: u32) -> usize {
        self.buff_off as usize + idx as usize * self.buff_size as usize
    }

    #[inline]
    pub fn addr_v(&self, idx: u32) -> usize {
        self.addr_v_off as usize + idx as usize * 4
    }

    #[inline]
    pub fn size_v(&self, idx: u32) -> usize {
        self.size_v_off as usize + idx as usize * 4
    }
}

/// Bump allocators over the descriptor and buffer regions.
struct Bump {
    next: usize,
    end: usize,
    what: &'static str,
}

impl Bump {
    fn alloc(&mut self, size: usize, align: usize) -> Result<usize> {
        let start = (self.next + align - 1) & !(align - 1);
        let end = start + size;
        if end > self.end {
            return Err(LinkError::Config(self.what));
        }
        self.next = end;
        Ok(start)
    }
}

/// Full SBD layout for a channel table, computed before anything is written.
#[derive(Debug, Clone)]
pub struct SbdLayout {
    pub num_channels: u8,
    pub rbps_offset: u32,
    /// `rings[id][dir]`.
    pub rings: Vec<[RingGeometry; 2]>,
    pub buff_end: usize,
}

impl SbdLayout {
    /// Plan the rings of `channels` (ring id = table index) in a region of
    /// `region_size` bytes.
    pub fn plan(channels: &[ChannelSpec], region_size: usize) -> Result<Self> {
        if channels.is_empty() || channels.len() > MAX_LINK_CHANNELS {
            return Err(LinkError::Config("channel count out of range"));
        }
        let n = channels.len();
        let mut desc = Bump {
            next: OFF_RBPS,
            end: OFF_DESC_RGN + DESC_RGN_SIZE,
            what: "descriptor region overflow",
        };
        let mut buff = Bump {
            next: OFF_BUFF_RGN,
            end: region_size,
            what: "buffer region overflow",
        };

        let rbps = desc.alloc(2 * 2 * 2 * n, 4)?;
        let ptr_off = |dir: Direction, wp: bool, id: usize| -> u32 {
            let set = dir.index() * 2 + wp as usize;
            (rbps + (set * n + id) * 2) as u32
        };

        let mut rings = Vec::with_capacity(n);
        for (id, spec) in channels.iter().enumerate() {
            let mut pair = Vec::with_capacity(2);
            for dir in Direction::BOTH {
                let (len, buff_size) = match dir {
                    Direction::Ul => (spec.ul_len, spec.ul_buff_size),
                    Direction::Dl => (spec.dl_len, spec.dl_buff_size),
                };
                let buff_off = buff.alloc(len as usize * buff_size as usize, 8)?;
                let addr_v_off = desc.alloc(len as usize * 4, 4)?;
                let size_v_off = desc.alloc(len as usize * 4, 4)?;
                pair.push(RingGeometry {
                    id: id as u16,
                    ch: spec.ch,
                    dir,
                    len,
                    buff_size,
                    rbd_off: RbDesc::offset(id as u16, dir) as u32,
                    addr_v_off: addr_v_off as u32,
                    size_v_off: size_v_off as u32,
                    buff_off: buff_off as u32,
                    rp_off: ptr_off(dir, false, id),
                    wp_off: ptr_off(dir, true, id),
                });
            }
            rings.push([pair[0], pair[1]]);
        }

        Ok(Self {
            num_channels: n as u8,
            rbps_offset: rbps as u32,
            rings,
            buff_end: buff.next,
        })
    }

    /// Zero the descriptor region and write every header, pointer and slot
    /// array. Pointers start at zero, sizes at zero, addr_v at each slot's
    /// buffer offset.
    pub fn publish(&self, region: &SharedRegion) -> Result<()> {
        region.fill(OFF_DESC_RGN, DESC_RGN_SIZE, 0)?;
        GlobalDesc {
            version: SBD_VERSION,
            num_channels: self.num_channels,
            rbps_offset: self.rbps_offset,
        }
        .write(region)?;

        for (id, pair) in self.rings.iter().enumerate() {
            let [ul, dl] = pair;
            RbChannel {
                ul_rbd_offset: ul.rbd_off,
                ul_sbdv_offset: ul.addr_v_off,
                dl_rbd_offset: dl.rbd_off,
                dl_sbdv_offset: dl.addr_v_off,
            }
            .write(region, id as u16)?;

            for geo in pair {
                geo.desc().write(region, geo.rbd_off as usize)?;
                for i in 0..geo.len as u32 {
                    region.write_u32(geo.addr_v(i), geo.slot_off(i) as u32)?;
                    region.write_u32(geo.size_v(i), 0)?;
                }
            }
        }
        Ok(())
    }

    /// Rebuild ring geometry from what is published in `region`, as the CP
    /// would: global descriptor, then each channel's descriptors.
    pub fn discover(region: &SharedRegion) -> Result<Self> {
        let g = GlobalDesc::read(region)?;
        if g.version != SBD_VERSION {
            return Err(LinkError::Protocol("unknown descriptor version"));
        }
        let n = g.num_channels as usize;
        if n == 0 || n > MAX_LINK_CHANNELS {
            return Err(LinkError::Protocol("bad channel count"));
        }
        let rbps = g.rbps_offset as usize;
        let mut rings = Vec::with_capacity(n);
        let mut buff_end = OFF_BUFF_RGN;
        for id in 0..n {
            let rb_ch = RbChannel::read(region, id as u16)?;
            let mut pair = Vec::with_capacity(2);
            for dir in Direction::BOTH {
                let rbd_off = rb_ch.rbd_offset(dir);
                let d = RbDesc::read(region, rbd_off as usize)?;
                if d.id as usize != id || d.direction as usize != dir.index() {
                    return Err(LinkError::Protocol("descriptor does not match its slot"));
                }
                let addr_v_off = rb_ch.sbdv_offset(dir);
                let buff_off = region.read_u32(addr_v_off as usize)?;
                let set = dir.index() * 2;
                let geo = RingGeometry {
                    id: d.id,
                    ch: d.ch,
                    dir,
                    len: d.length,
                    buff_size: d.buff_size,
                    rbd_off,
                    addr_v_off,
                    size_v_off: addr_v_off + d.length as u32 * 4,
                    buff_off,
                    rp_off: (rbps + (set * n + id) * 2) as u32,
                    wp_off: (rbps + ((set + 1) * n + id) * 2) as u32,
                };
                buff_end = buff_end.max(geo.slot_off(geo.len as u32));
                pair.push(geo);
            }
            rings.push([pair[0], pair[1]]);
        }
        Ok(Self {
            num_channels: g.num_channels,
            rbps_offset: g.rbps_offset,
            rings,
            buff_end,
        })
    }

    pub fn geometry(&self, id: u16, dir: Direction) -> Option<&RingGeometry> {
        self.rings.get(id as usize).map(|pair| &pair[dir.index()])
    }
}

/// Ring id that carries traffic for `ch`, given the channel table order.
pub fn ring_for_channel(channels: &[ChannelSpec], ch: u16) -> Option<u16> {
    if let Some(id) = channels.iter().position(|c| c.ch == ch) {
        return Some(id as u16);
    }
    if shmlink_core::wire::sipc_ps_ch(ch) {
        return channels
            .iter()
            .position(|c| c.format == ChannelFormat::Multi)
            .map(|id| id as u16);
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use shmlink_core::config::LinkConfig;

    #[test]
    fn test_plan_default_fits() {
        let cfg = LinkConfig::new();
        let l = SbdLayout::plan(&cfg.channels, cfg.region_size).unwrap();
        assert_eq!(l.num_channels, 3);
        assert_eq!(l.rbps_offset as usize, OFF_RBPS);
        let ul = l.geometry(0, Direction::Ul).unwrap();
        let dl = l.geometry(0, Direction::Dl).unwrap();
        assert_eq!(ul.buff_off as usize, OFF_BUFF_RGN);
        assert_eq!(dl.buff_off as usize, OFF_BUFF_RGN + 128 * 2048);
        assert_ne!(ul.rp_off, dl.rp_off);
        assert!(l.buff_end <= cfg.region_size);
    }

    #[test]
    fn test_plan_rejects_overflow() {
        let cfg = LinkConfig::new();
        assert!(matches!(
            SbdLayout::plan(&cfg.channels, OFF_BUFF_RGN + 4096),
            Err(LinkError::Config("buffer region overflow"))
        ));
        let many: Vec<_> = (0..(MAX_LINK_CHANNELS as u16 + 1))
            .map(|ch| ChannelSpec::raw(ch + 30, 4, 64))
            .collect();
        assert!(SbdLayout::plan(&many, 64 << 20).is_err());
    }

    #[test]
    fn test_publish_then_discover() {
        let cfg = LinkConfig::new();
        let region = SharedRegion::anonymous(cfg.region_size).unwrap();
        let l = SbdLayout::plan(&cfg.channels, cfg.region_size).unwrap();
        l.publish(&region).unwrap();

        let g = GlobalDesc::read(&region).unwrap();
        assert_eq!(g.version, 1);
        assert_eq!(g.num_channels, 3);

        let d = SbdLayout::discover(&region).unwrap();
        assert_eq!(d.rings, l.rings);

        let desc = RbDesc::read(&region, l.rings[2][1].rbd_off as usize).unwrap();
        assert_eq!(desc.ch, cfg.channels[2].ch);
        assert_eq!(desc.signaling, 1);
        assert_eq!(desc.sig_mask, MASK_INT_VALID | MASK_SEND_DATA);
    }

    #[test]
    fn test_discover_rejects_blank_region() {
        let region = SharedRegion::anonymous(MIN_REGION_SIZE).unwrap();
        assert!(SbdLayout::discover(&region).is_err());
    }

    #[test]
    fn test_ring_for_channel() {
        let cfg = LinkConfig::new();
        assert_eq!(ring_for_channel(&cfg.channels, 235), Some(0));
        assert_eq!(ring_for_channel(&cfg.channels, 245), Some(1));
        assert_eq!(ring_for_channel(&cfg.channels, 17), Some(2));
        assert_eq!(ring_for_channel(&cfg.channels, 100), None);
    }
}
