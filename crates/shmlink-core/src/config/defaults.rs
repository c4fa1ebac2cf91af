//! Library defaults for `LinkConfig`.

pub const NAME: &str = "shmem";

/// Shared region size (bytes).
pub const REGION_SIZE: usize = 4 << 20;

pub const SBD_IPC: bool = true;
pub const IOSM: bool = false;
pub const IPC_ALIGNED: bool = true;
pub const DPRAM_MAGIC: bool = true;

/// Ring occupancy (percent of length) above which a UL ring goes BUSY.
pub const HIGH_WATER_PCT: u8 = 75;
/// Occupancy at or below which a BUSY ring counts as drained.
pub const LOW_WATER: u32 = 0;
/// A fresh ack request goes out every `BUSY_COUNT_MASK + 1` busy polls.
pub const BUSY_COUNT_MASK: u32 = 0xF;
/// Busy polls without progress before the link is declared dead.
pub const MAX_TX_BUSY_COUNT: u32 = 1024;
pub const RES_ACK_WAIT_MS: u64 = 10;

pub const MAX_SKB_TXQ_DEPTH: usize = 1024;
pub const TX_PERIOD_MS: u64 = 1;
pub const DATALLOC_PERIOD_MS: u64 = 2;
pub const FORCE_CRASH_ACK_TIMEOUT_MS: u64 = 10_000;
pub const BOOT_TIMEOUT_MS: u64 = 30_000;
pub const LINK_ACTIVE_RETRIES: u32 = 100;
pub const LINK_ACTIVE_INTERVAL_MS: u64 = 1;

pub const ZMB_CELL_SIZE: usize = 2048;
pub const ZMB_CELL_COUNT: usize = 1024;
pub const NET_HEADROOM: usize = 64;

/// Re-signals of INIT_END on abnormal PHONE_START before forcing a crash.
pub const ABNORMAL_PHONE_START_LIMIT: u32 = 4;

pub const SNAPSHOT_DEPTH: usize = 32;
