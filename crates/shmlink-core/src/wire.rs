//! Bit-exact encodings shared with the CP.
//!
//! Doorbell words, command codes, the status word, channel ids, the SBD
//! descriptor size field, the link header and the IOSM record. Offsets and
//! the ring-header layout live in `shmlink_module::layout`.

// ── Doorbell (int2ap / int2cp) word ──

pub const MASK_INT_VALID: u16 = 0x0080;
pub const MASK_CMD_VALID: u16 = 0x0040;
pub const MASK_CMD_FIELD: u16 = 0x003F;

pub const MASK_REQ_ACK_FMT: u16 = 0x0020;
pub const MASK_REQ_ACK_RAW: u16 = 0x0010;
pub const MASK_RES_ACK_FMT: u16 = 0x0008;
pub const MASK_RES_ACK_RAW: u16 = 0x0004;
pub const MASK_SEND_FMT: u16 = 0x0002;
pub const MASK_SEND_RAW: u16 = 0x0001;
pub const MASK_SEND_DATA: u16 = 0x0001;

#[inline]
pub const fn int_valid(x: u16) -> bool {
    x & MASK_INT_VALID != 0
}

#[inline]
pub const fn cmd_valid(x: u16) -> bool {
    x & MASK_CMD_VALID != 0
}

#[inline]
pub const fn int2cmd(x: u16) -> u16 {
    x & MASK_CMD_FIELD
}

#[inline]
pub const fn cmd2int(cmd: u16) -> u16 {
    (cmd & MASK_CMD_FIELD) | MASK_CMD_VALID | MASK_INT_VALID
}

#[inline]
pub const fn mask2int(mask: u16) -> u16 {
    mask | MASK_INT_VALID
}

// ── Status word (cp2ap status register) ──

pub const SHM_FLOWCTL_BIT: u16 = 1 << 2;
pub const MASK_TX_FLOWCTL_SUSPEND: u16 = 0x0010;
pub const MASK_TX_FLOWCTL_RESUME: u16 = 0x0000;

/// Map the status word's flow-control bit onto the suspend/resume command.
#[inline]
pub const fn status2flowctl(status: u16) -> u16 {
    (status & SHM_FLOWCTL_BIT) << 2
}

// ── Magic / access handshake words ──

pub const MEM_IPC_MAGIC: u32 = 0xAA;
pub const MEM_CRASH_MAGIC: u32 = 0xDEAD_DEAD;
pub const MEM_BOOT_MAGIC: u32 = 0x424F_4F54;
pub const MEM_DUMP_MAGIC: u32 = 0x4455_4D50;

// ── Link commands ──

#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    InitStart = 0x1,
    InitEnd = 0x2,
    ReqActive = 0x3,
    ResActive = 0x4,
    ReqTimeSync = 0x5,
    KernelPanic = 0x6,
    CrashReset = 0x7,
    PhoneStart = 0x8,
    CrashExit = 0x9,
    CpDeepSleep = 0xA,
    NvRebuilding = 0xB,
    EmerDown = 0xC,
    PifInitDone = 0xD,
    SilentNvRebuild = 0xE,
    NormalPowerOff = 0xF,
    /// A record is waiting in the IOSM message area.
    IosmMessage = 0x10,
}

impl Command {
    pub fn from_u16(v: u16) -> Option<Self> {
        Some(match v {
            0x1 => Self::InitStart,
            0x2 => Self::InitEnd,
            0x3 => Self::ReqActive,
            0x4 => Self::ResActive,
            0x5 => Self::ReqTimeSync,
            0x6 => Self::KernelPanic,
            0x7 => Self::CrashReset,
            0x8 => Self::PhoneStart,
            0x9 => Self::CrashExit,
            0xA => Self::CpDeepSleep,
            0xB => Self::NvRebuilding,
            0xC => Self::EmerDown,
            0xD => Self::PifInitDone,
            0xE => Self::SilentNvRebuild,
            0xF => Self::NormalPowerOff,
            0x10 => Self::IosmMessage,
            _ => return None,
        })
    }

    /// Doorbell word carrying this command.
    #[inline]
    pub fn to_int(self) -> u16 {
        cmd2int(self as u16)
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::InitStart => "INIT_START",
            Self::InitEnd => "INIT_END",
            Self::ReqActive => "REQ_ACTIVE",
            Self::ResActive => "RES_ACTIVE",
            Self::ReqTimeSync => "REQ_TIME_SYNC",
            Self::KernelPanic => "KERNEL_PANIC",
            Self::CrashReset => "CRASH_RESET",
            Self::PhoneStart => "PHONE_START",
            Self::CrashExit => "CRASH_EXIT",
            Self::CpDeepSleep => "CP_DEEP_SLEEP",
            Self::NvRebuilding => "NV_REBUILDING",
            Self::EmerDown => "EMER_DOWN",
            Self::PifInitDone => "PIF_INIT_DONE",
            Self::SilentNvRebuild => "SILENT_NV_REBUILD",
            Self::NormalPowerOff => "NORMAL_POWER_OFF",
            Self::IosmMessage => "IOSM_MESSAGE",
        }
    }
}

impl std::fmt::Display for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

// ── Traffic classes ──

/// Control (FMT/RFS) traffic vs. packet data (RAW/PS).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrafficClass {
    Fmt,
    Raw,
}

impl TrafficClass {
    pub const ALL: [TrafficClass; 2] = [TrafficClass::Fmt, TrafficClass::Raw];

    pub fn req_ack_mask(self) -> u16 {
        match self {
            Self::Fmt => MASK_REQ_ACK_FMT,
            Self::Raw => MASK_REQ_ACK_RAW,
        }
    }

    pub fn res_ack_mask(self) -> u16 {
        match self {
            Self::Fmt => MASK_RES_ACK_FMT,
            Self::Raw => MASK_RES_ACK_RAW,
        }
    }

    pub fn send_mask(self) -> u16 {
        match self {
            Self::Fmt => MASK_SEND_FMT,
            Self::Raw => MASK_SEND_RAW,
        }
    }

    pub fn index(self) -> usize {
        match self {
            Self::Fmt => 0,
            Self::Raw => 1,
        }
    }
}

// ── Channel ids ──

pub const CH_PDP_0: u16 = 10;
pub const CH_PDP_14: u16 = 24;
pub const CH_FMT_0: u16 = 235;
pub const CH_FMT_9: u16 = 244;
pub const CH_RFS_0: u16 = 245;
pub const CH_RFS_9: u16 = 254;

/// Packet-data channel (carried on the multiplexed ring).
#[inline]
pub fn sipc_ps_ch(ch: u16) -> bool {
    (CH_PDP_0..=CH_PDP_14).contains(&ch)
}

#[inline]
pub fn sipc_fmt_ch(ch: u16) -> bool {
    (CH_FMT_0..=CH_FMT_9).contains(&ch)
}

#[inline]
pub fn sipc_rfs_ch(ch: u16) -> bool {
    (CH_RFS_0..=CH_RFS_9).contains(&ch)
}

/// Class used for ack requests on rings carrying `ch`.
#[inline]
pub fn traffic_class(ch: u16) -> TrafficClass {
    if sipc_fmt_ch(ch) || sipc_rfs_ch(ch) {
        TrafficClass::Fmt
    } else {
        TrafficClass::Raw
    }
}

// ── SBD descriptor size field ──

pub const SIZE_LEN_MASK: u32 = 0xFFFF;
pub const SIZE_TAG_SHIFT: u32 = 16;

/// Length in bits 0-15, channel tag in bits 16-31 (multiplexed rings only).
#[inline]
pub const fn pack_size(len: u16, tag: u16) -> u32 {
    (len as u32) | ((tag as u32) << SIZE_TAG_SHIFT)
}

#[inline]
pub const fn size_len(v: u32) -> u16 {
    (v & SIZE_LEN_MASK) as u16
}

#[inline]
pub const fn size_tag(v: u32) -> u16 {
    (v >> SIZE_TAG_SHIFT) as u16
}

// ── Link header ──

pub const LINK_HDR_SIZE: usize = 4;
pub const LINK_HDR_START: u8 = 0xF8;

/// 4-byte frame header: start marker, channel, total frame length (LE,
/// header included). Lets a receiver frame a byte stream and know how many
/// slots a chained frame spans.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkHeader {
    pub ch: u8,
    pub frame_len: u16,
}

impl LinkHeader {
    pub fn for_payload(ch: u8, payload_len: usize) -> Option<Self> {
        let frame_len = u16::try_from(payload_len + LINK_HDR_SIZE).ok()?;
        Some(Self { ch, frame_len })
    }

    pub fn encode(&self) -> [u8; LINK_HDR_SIZE] {
        let len = self.frame_len.to_le_bytes();
        [LINK_HDR_START, self.ch, len[0], len[1]]
    }

    pub fn parse(buf: &[u8]) -> Option<Self> {
        if buf.len() < LINK_HDR_SIZE || buf[0] != LINK_HDR_START {
            return None;
        }
        let frame_len = u16::from_le_bytes([buf[2], buf[3]]);
        if (frame_len as usize) < LINK_HDR_SIZE {
            return None;
        }
        Some(Self { ch: buf[1], frame_len })
    }
}

// ── IOSM record ──

pub const IOSM_PAYLOAD_LEN: usize = 10;
pub const IOSM_TRANS_ID_MAX: u8 = 255;

/// One slot of an IOSM message area.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IosmRecord {
    pub msg_id: u8,
    pub trans_id: u8,
    pub payload: [u8; IOSM_PAYLOAD_LEN],
}

pub const IOSM_RECORD_SIZE: usize = std::mem::size_of::<IosmRecord>();
const _: () = assert!(IOSM_RECORD_SIZE == 12);

impl IosmRecord {
    pub fn to_bytes(&self) -> [u8; IOSM_RECORD_SIZE] {
        let mut out = [0u8; IOSM_RECORD_SIZE];
        out[0] = self.msg_id;
        out[1] = self.trans_id;
        out[2..].copy_from_slice(&self.payload);
        out
    }

    pub fn from_bytes(b: &[u8; IOSM_RECORD_SIZE]) -> Self {
        let mut payload = [0u8; IOSM_PAYLOAD_LEN];
        payload.copy_from_slice(&b[2..]);
        Self { msg_id: b[0], trans_id: b[1], payload }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cmd_roundtrip_through_doorbell() {
        let v = Command::PhoneStart.to_int();
        assert_eq!(v, 0x00C8);
        assert!(int_valid(v));
        assert!(cmd_valid(v));
        assert_eq!(Command::from_u16(int2cmd(v)), Some(Command::PhoneStart));
        assert_eq!(Command::from_u16(0x3F), None);
    }

    #[test]
    fn test_data_doorbell_is_not_a_command() {
        let v = mask2int(MASK_SEND_DATA);
        assert!(int_valid(v));
        assert!(!cmd_valid(v));
    }

    #[test]
    fn test_size_field_packing() {
        let v = pack_size(1500, CH_PDP_0 + 2);
        assert_eq!(v, 0x000C_05DC);
        assert_eq!(size_len(v), 1500);
        assert_eq!(size_tag(v), 12);
    }

    #[test]
    fn test_flowctl_status_mapping() {
        assert_eq!(status2flowctl(SHM_FLOWCTL_BIT), MASK_TX_FLOWCTL_SUSPEND);
        assert_eq!(status2flowctl(0x0003), MASK_TX_FLOWCTL_RESUME);
    }

    #[test]
    fn test_link_header() {
        let hdr = LinkHeader::for_payload(7, 100).unwrap();
        let raw = hdr.encode();
        assert_eq!(raw, [0xF8, 7, 104, 0]);
        assert_eq!(LinkHeader::parse(&raw), Some(hdr));
        assert_eq!(LinkHeader::parse(&[0x00, 7, 104, 0]), None);
        assert_eq!(LinkHeader::parse(&[0xF8, 7, 2, 0]), None);
        assert!(LinkHeader::for_payload(1, 70_000).is_none());
    }

    #[test]
    fn test_traffic_class() {
        assert_eq!(traffic_class(CH_FMT_0), TrafficClass::Fmt);
        assert_eq!(traffic_class(CH_RFS_0 + 1), TrafficClass::Fmt);
        assert_eq!(traffic_class(CH_PDP_0), TrafficClass::Raw);
        assert!(sipc_ps_ch(CH_PDP_14));
        assert!(!sipc_ps_ch(CH_PDP_14 + 1));
    }
}
