//! Link configuration
//!
//! Library defaults with runtime environment overrides.
//!
//! # Configuration Priority (highest wins)
//!
//! 1. Builder setters
//! 2. Environment variables (`from_env()`)
//! 3. Library defaults (`defaults.rs`)
//!
//! # Example
//!
//! ```rust,ignore
//! use shmlink_core::config::{ChannelSpec, LinkConfig};
//!
//! let config = LinkConfig::from_env()
//!     .iosm(true)
//!     .high_water_pct(80)
//!     .channel(ChannelSpec::fmt(245, 64, 2048));
//! config.validate()?;
//! ```

pub mod defaults;

use std::time::Duration;

use crate::env::{env_get, env_get_bool, env_get_ms, env_get_str};
use crate::wire::{CH_FMT_0, CH_PDP_0, CH_RFS_0};

/// Upper bound on configured channels (one UL + one DL ring each).
pub const MAX_LINK_CHANNELS: usize = 32;

/// Ring format of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelFormat {
    /// Control channel (FMT/RFS), one consumer.
    Fmt,
    /// Raw data channel, one consumer.
    Raw,
    /// Packet-data ring shared by every PS channel; each slot carries the
    /// channel tag in the high half of its size word.
    Multi,
}

/// One logical channel and the geometry of its two rings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelSpec {
    pub ch: u16,
    pub format: ChannelFormat,
    pub ul_len: u16,
    pub ul_buff_size: u32,
    pub dl_len: u16,
    pub dl_buff_size: u32,
    /// DL ring hands pool cells to the consumer instead of copying.
    pub zerocopy: bool,
    /// Frames carry a link header (enables multi-slot chaining).
    pub lnk_hdr: bool,
}

impl ChannelSpec {
    pub fn fmt(ch: u16, len: u16, buff_size: u32) -> Self {
        Self {
            ch,
            format: ChannelFormat::Fmt,
            ul_len: len,
            ul_buff_size: buff_size,
            dl_len: len,
            dl_buff_size: buff_size,
            zerocopy: false,
            lnk_hdr: true,
        }
    }

    pub fn raw(ch: u16, len: u16, buff_size: u32) -> Self {
        Self {
            format: ChannelFormat::Raw,
            lnk_hdr: false,
            ..Self::fmt(ch, len, buff_size)
        }
    }

    pub fn multiplexed(ch: u16, len: u16, buff_size: u32) -> Self {
        Self {
            format: ChannelFormat::Multi,
            lnk_hdr: false,
            ..Self::fmt(ch, len, buff_size)
        }
    }

    pub fn with_zerocopy(mut self, on: bool) -> Self {
        self.zerocopy = on;
        self
    }

    pub fn with_lnk_hdr(mut self, on: bool) -> Self {
        self.lnk_hdr = on;
        self
    }

    pub fn with_dl(mut self, len: u16, buff_size: u32) -> Self {
        self.dl_len = len;
        self.dl_buff_size = buff_size;
        self
    }

    /// Shared-memory bytes for both rings' buffers.
    pub fn buffer_bytes(&self) -> usize {
        self.ul_len as usize * self.ul_buff_size as usize
            + self.dl_len as usize * self.dl_buff_size as usize
    }
}

/// Flow-control thresholds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlowThresholds {
    pub high_water_pct: u8,
    pub low_water: u32,
    pub busy_count_mask: u32,
    pub max_tx_busy_count: u32,
    /// Retry period of the tx pump while a ring is waiting for an ack.
    pub res_ack_wait: Duration,
}

impl Default for FlowThresholds {
    fn default() -> Self {
        Self {
            high_water_pct: defaults::HIGH_WATER_PCT,
            low_water: defaults::LOW_WATER,
            busy_count_mask: defaults::BUSY_COUNT_MASK,
            max_tx_busy_count: defaults::MAX_TX_BUSY_COUNT,
            res_ack_wait: Duration::from_millis(defaults::RES_ACK_WAIT_MS),
        }
    }
}

impl FlowThresholds {
    /// Usage above which a ring of `len` slots goes BUSY.
    pub fn high_water(&self, len: u32) -> u32 {
        (len as u64 * self.high_water_pct as u64 / 100) as u32
    }
}

#[derive(Debug, Clone)]
pub struct LinkConfig {
    pub name: String,
    pub region_size: usize,
    /// Ring-descriptor (SBD) architecture; INIT_START is honoured only then.
    pub sbd_ipc: bool,
    /// Control messages travel over the IOSM message areas.
    pub iosm: bool,
    pub aligned: bool,
    /// `ipc_active` also checks the magic/access words.
    pub dpram_magic: bool,
    pub channels: Vec<ChannelSpec>,
    pub flow: FlowThresholds,
    pub txq_depth: usize,
    pub tx_period: Duration,
    pub datalloc_period: Duration,
    pub crash_ack_timeout: Duration,
    pub boot_timeout: Duration,
    pub link_active_retries: u32,
    pub link_active_interval: Duration,
    pub zmb_cell_size: usize,
    pub zmb_cell_count: usize,
    pub net_headroom: usize,
    pub abnormal_phone_start_limit: u32,
    pub snapshot_depth: usize,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl LinkConfig {
    /// Library defaults, no environment.
    pub fn new() -> Self {
        Self {
            name: defaults::NAME.to_string(),
            region_size: defaults::REGION_SIZE,
            sbd_ipc: defaults::SBD_IPC,
            iosm: defaults::IOSM,
            aligned: defaults::IPC_ALIGNED,
            dpram_magic: defaults::DPRAM_MAGIC,
            channels: vec![
                ChannelSpec::fmt(CH_FMT_0, 128, 2048),
                ChannelSpec::fmt(CH_RFS_0, 128, 2048),
                ChannelSpec::multiplexed(CH_PDP_0, 512, 2048),
            ],
            flow: FlowThresholds::default(),
            txq_depth: defaults::MAX_SKB_TXQ_DEPTH,
            tx_period: Duration::from_millis(defaults::TX_PERIOD_MS),
            datalloc_period: Duration::from_millis(defaults::DATALLOC_PERIOD_MS),
            crash_ack_timeout: Duration::from_millis(defaults::FORCE_CRASH_ACK_TIMEOUT_MS),
            boot_timeout: Duration::from_millis(defaults::BOOT_TIMEOUT_MS),
            link_active_retries: defaults::LINK_ACTIVE_RETRIES,
            link_active_interval: Duration::from_millis(defaults::LINK_ACTIVE_INTERVAL_MS),
            zmb_cell_size: defaults::ZMB_CELL_SIZE,
            zmb_cell_count: defaults::ZMB_CELL_COUNT,
            net_headroom: defaults::NET_HEADROOM,
            abnormal_phone_start_limit: defaults::ABNORMAL_PHONE_START_LIMIT,
            snapshot_depth: defaults::SNAPSHOT_DEPTH,
        }
    }

    /// Defaults with environment overrides.
    ///
    /// Environment variables (all optional):
    /// - `SHMLINK_NAME` - Link name used in log lines
    /// - `SHMLINK_REGION_SIZE` - Shared region bytes
    /// - `SHMLINK_SBD_IPC` / `SHMLINK_IOSM` - Architecture switches (0/1)
    /// - `SHMLINK_HIGH_WATER_PCT` / `SHMLINK_LOW_WATER` - Flow thresholds
    /// - `SHMLINK_BUSY_COUNT_MASK` / `SHMLINK_MAX_TX_BUSY_COUNT` - Busy polling
    /// - `SHMLINK_RES_ACK_WAIT_MS` - Busy retry period
    /// - `SHMLINK_TXQ_DEPTH` - Software tx queue depth per ring
    /// - `SHMLINK_TX_PERIOD_MS` / `SHMLINK_DATALLOC_PERIOD_MS` - Timers
    /// - `SHMLINK_CRASH_ACK_TIMEOUT_MS` / `SHMLINK_BOOT_TIMEOUT_MS` - Waits
    /// - `SHMLINK_ZMB_CELL_SIZE` / `SHMLINK_ZMB_CELL_COUNT` - Zero-copy pool
    /// - `SHMLINK_SNAPSHOT_DEPTH` - Diagnostic history length
    pub fn from_env() -> Self {
        let d = Self::new();
        Self {
            name: env_get_str("SHMLINK_NAME", &d.name),
            region_size: env_get("SHMLINK_REGION_SIZE", d.region_size),
            sbd_ipc: env_get_bool("SHMLINK_SBD_IPC", d.sbd_ipc),
            iosm: env_get_bool("SHMLINK_IOSM", d.iosm),
            flow: FlowThresholds {
                high_water_pct: env_get("SHMLINK_HIGH_WATER_PCT", d.flow.high_water_pct),
                low_water: env_get("SHMLINK_LOW_WATER", d.flow.low_water),
                busy_count_mask: env_get("SHMLINK_BUSY_COUNT_MASK", d.flow.busy_count_mask),
                max_tx_busy_count: env_get("SHMLINK_MAX_TX_BUSY_COUNT", d.flow.max_tx_busy_count),
                res_ack_wait: env_get_ms("SHMLINK_RES_ACK_WAIT_MS", d.flow.res_ack_wait),
            },
            txq_depth: env_get("SHMLINK_TXQ_DEPTH", d.txq_depth),
            tx_period: env_get_ms("SHMLINK_TX_PERIOD_MS", d.tx_period),
            datalloc_period: env_get_ms("SHMLINK_DATALLOC_PERIOD_MS", d.datalloc_period),
            crash_ack_timeout: env_get_ms("SHMLINK_CRASH_ACK_TIMEOUT_MS", d.crash_ack_timeout),
            boot_timeout: env_get_ms("SHMLINK_BOOT_TIMEOUT_MS", d.boot_timeout),
            zmb_cell_size: env_get("SHMLINK_ZMB_CELL_SIZE", d.zmb_cell_size),
            zmb_cell_count: env_get("SHMLINK_ZMB_CELL_COUNT", d.zmb_cell_count),
            snapshot_depth: env_get("SHMLINK_SNAPSHOT_DEPTH", d.snapshot_depth),
            ..d
        }
    }

    // Builder methods

    pub fn name(mut self, name: &str) -> Self {
        self.name = name.to_string();
        self
    }

    pub fn region_size(mut self, bytes: usize) -> Self {
        self.region_size = bytes;
        self
    }

    pub fn sbd_ipc(mut self, on: bool) -> Self {
        self.sbd_ipc = on;
        self
    }

    pub fn iosm(mut self, on: bool) -> Self {
        self.iosm = on;
        self
    }

    pub fn dpram_magic(mut self, on: bool) -> Self {
        self.dpram_magic = on;
        self
    }

    /// Replace the channel table.
    pub fn channels(mut self, channels: Vec<ChannelSpec>) -> Self {
        self.channels = channels;
        self
    }

    /// Add (or replace, by channel id) one channel.
    pub fn channel(mut self, spec: ChannelSpec) -> Self {
        self.channels.retain(|c| c.ch != spec.ch);
        self.channels.push(spec);
        self
    }

    pub fn high_water_pct(mut self, pct: u8) -> Self {
        self.flow.high_water_pct = pct;
        self
    }

    pub fn low_water(mut self, slots: u32) -> Self {
        self.flow.low_water = slots;
        self
    }

    pub fn busy_count_mask(mut self, mask: u32) -> Self {
        self.flow.busy_count_mask = mask;
        self
    }

    pub fn max_tx_busy_count(mut self, n: u32) -> Self {
        self.flow.max_tx_busy_count = n;
        self
    }

    pub fn txq_depth(mut self, n: usize) -> Self {
        self.txq_depth = n;
        self
    }

    pub fn crash_ack_timeout(mut self, d: Duration) -> Self {
        self.crash_ack_timeout = d;
        self
    }

    pub fn boot_timeout(mut self, d: Duration) -> Self {
        self.boot_timeout = d;
        self
    }

    pub fn link_active_probe(mut self, retries: u32, interval: Duration) -> Self {
        self.link_active_retries = retries;
        self.link_active_interval = interval;
        self
    }

    pub fn zmb(mut self, cell_size: usize, cell_count: usize) -> Self {
        self.zmb_cell_size = cell_size;
        self.zmb_cell_count = cell_count;
        self
    }

    pub fn abnormal_phone_start_limit(mut self, n: u32) -> Self {
        self.abnormal_phone_start_limit = n;
        self
    }

    pub fn snapshot_depth(mut self, n: usize) -> Self {
        self.snapshot_depth = n;
        self
    }

    pub fn spec(&self, ch: u16) -> Option<&ChannelSpec> {
        self.channels.iter().find(|c| c.ch == ch)
    }

    pub fn has_zerocopy(&self) -> bool {
        self.channels.iter().any(|c| c.zerocopy)
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<(), &'static str> {
        if self.channels.is_empty() {
            return Err("at least one channel required");
        }
        if self.channels.len() > MAX_LINK_CHANNELS {
            return Err("too many channels");
        }
        for (i, c) in self.channels.iter().enumerate() {
            if self.channels[..i].iter().any(|o| o.ch == c.ch) {
                return Err("duplicate channel id");
            }
            if c.ch > u8::MAX as u16 {
                return Err("channel id must fit the link header");
            }
            if c.ul_len < 2 || c.dl_len < 2 {
                return Err("ring length must be >= 2");
            }
            if c.ul_buff_size < 8 || c.dl_buff_size < 8 {
                return Err("buffer size must be >= 8");
            }
            if c.ul_buff_size > u16::MAX as u32 || c.dl_buff_size > u16::MAX as u32 {
                return Err("buffer size must fit the 16-bit length field");
            }
        }
        if self
            .channels
            .iter()
            .filter(|c| c.format == ChannelFormat::Multi)
            .count()
            > 1
        {
            return Err("only one multiplexed ring");
        }
        if self.flow.high_water_pct == 0 || self.flow.high_water_pct > 100 {
            return Err("high_water_pct must be in 1..=100");
        }
        if self.txq_depth == 0 {
            return Err("txq_depth must be > 0");
        }
        if self.flow.max_tx_busy_count == 0 {
            return Err("max_tx_busy_count must be > 0");
        }
        if self.has_zerocopy() && (self.zmb_cell_count == 0 || self.zmb_cell_size <= self.net_headroom) {
            return Err("zero-copy pool too small");
        }
        if self.snapshot_depth == 0 {
            return Err("snapshot_depth must be > 0");
        }
        Ok(())
    }

    /// Log the configuration at info level.
    pub fn dump(&self) {
        crate::kinfo!("{}: sbd_ipc {} iosm {} region {:#x}", self.name, self.sbd_ipc, self.iosm, self.region_size);
        for c in &self.channels {
            crate::kinfo!(
                "{}:   ch {:3} {:?} UL {}x{} DL {}x{} zc {} hdr {}",
                self.name, c.ch, c.format, c.ul_len, c.ul_buff_size,
                c.dl_len, c.dl_buff_size, c.zerocopy, c.lnk_hdr
            );
        }
        crate::kinfo!(
            "{}:   flow hw {}% lw {} mask {:#x} max_busy {}",
            self.name, self.flow.high_water_pct, self.flow.low_water,
            self.flow.busy_count_mask, self.flow.max_tx_busy_count
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let c = LinkConfig::new();
        assert!(c.validate().is_ok());
        assert_eq!(c.channels.len(), 3);
        assert_eq!(c.flow.busy_count_mask, 0xF);
    }

    #[test]
    fn test_builder_replaces_channel() {
        let c = LinkConfig::new().channel(ChannelSpec::raw(CH_FMT_0, 16, 256));
        assert_eq!(c.channels.len(), 3);
        assert_eq!(c.spec(CH_FMT_0).unwrap().format, ChannelFormat::Raw);
    }

    #[test]
    fn test_validate_rejects() {
        let c = LinkConfig::new().channels(vec![]);
        assert!(c.validate().is_err());

        let c = LinkConfig::new().high_water_pct(0);
        assert_eq!(c.validate(), Err("high_water_pct must be in 1..=100"));

        let c = LinkConfig::new()
            .channel(ChannelSpec::multiplexed(11, 16, 2048));
        assert_eq!(c.validate(), Err("only one multiplexed ring"));

        let c = LinkConfig::new().channel(ChannelSpec::fmt(200, 1, 64));
        assert!(c.validate().is_err());

        // A full slot must still be expressible in the size word.
        let c = LinkConfig::new().channel(ChannelSpec::raw(30, 4, 65536));
        assert_eq!(c.validate(), Err("buffer size must fit the 16-bit length field"));
        let c = LinkConfig::new().channel(ChannelSpec::raw(30, 4, 65535));
        assert_eq!(c.validate(), Ok(()));
    }

    #[test]
    fn test_high_water() {
        let flow = FlowThresholds::default();
        assert_eq!(flow.high_water(128), 96);
        assert_eq!(flow.high_water(20), 15);
    }

    #[test]
    fn test_from_env_override() {
        std::env::set_var("SHMLINK_HIGH_WATER_PCT", "90");
        std::env::set_var("SHMLINK_BUSY_COUNT_MASK", "0x7");
        let c = LinkConfig::from_env();
        assert_eq!(c.flow.high_water_pct, 90);
        assert_eq!(c.flow.busy_count_mask, 7);
        std::env::remove_var("SHMLINK_HIGH_WATER_PCT");
        std::env::remove_var("SHMLINK_BUSY_COUNT_MASK");
    }
}
