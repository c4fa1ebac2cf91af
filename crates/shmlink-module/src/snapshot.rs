//! Point-in-time captures of the link for postmortem analysis.
//!
//! A snapshot is taken for every classified interrupt (and on demand). The
//! deferred worker records it in a bounded history; a crash freezes the
//! history into a `CrashDump`.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use shmlink_core::kprint::uptime_us;
use shmlink_core::mailbox::Mailbox;
use shmlink_core::spinlock::SpinLock;
use shmlink_core::state::{Direction, LinkState};
use shmlink_core::{kerror, kinfo};

use crate::layout::{LegacyPtrs, SbdLayout, OFF_ACCESS, OFF_FMT_PTRS, OFF_MAGIC, OFF_RAW_PTRS};
use crate::link::LinkDevice;
use crate::region::SharedRegion;

/// rp/wp of both rings of one channel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RingPtrs {
    pub id: u16,
    pub ch: u16,
    pub ul_rp: u16,
    pub ul_wp: u16,
    pub dl_rp: u16,
    pub dl_wp: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemSnapshot {
    pub taken_us: u64,
    /// Dl for interrupts from the CP, Ul for host-initiated captures.
    pub dir: Direction,
    pub state: LinkState,
    pub magic: u32,
    pub access: u32,
    pub int2ap: u16,
    pub int2cp: u16,
    pub status: u16,
    /// Legacy queue words, FMT then RAW: tx head, tx tail, rx head, rx tail.
    pub legacy: [[u32; 4]; 2],
    pub rings: Vec<RingPtrs>,
}

fn word16(region: &SharedRegion, off: u32) -> u16 {
    region
        .atomic_u16(off as usize)
        .map(|w| w.load(Ordering::Acquire))
        .unwrap_or(0)
}

fn word32(region: &SharedRegion, off: usize) -> u32 {
    region
        .atomic_u32(off)
        .map(|w| w.load(Ordering::Acquire))
        .unwrap_or(0)
}

impl MemSnapshot {
    /// Read everything the link shares with the CP. Unreadable words are
    /// reported as zero.
    pub fn capture(
        region: &SharedRegion,
        mbox: &dyn Mailbox,
        layout: Option<&SbdLayout>,
        dir: Direction,
        state: LinkState,
        int2ap: u16,
    ) -> Self {
        let legacy = [OFF_FMT_PTRS, OFF_RAW_PTRS].map(|base| {
            let p = LegacyPtrs::at(base);
            [p.tx_head, p.tx_tail, p.rx_head, p.rx_tail].map(|off| word32(region, off))
        });
        let rings = layout
            .map(|l| {
                l.rings
                    .iter()
                    .map(|[ul, dl]| RingPtrs {
                        id: ul.id,
                        ch: ul.ch,
                        ul_rp: word16(region, ul.rp_off),
                        ul_wp: word16(region, ul.wp_off),
                        dl_rp: word16(region, dl.rp_off),
                        dl_wp: word16(region, dl.wp_off),
                    })
                    .collect()
            })
            .unwrap_or_default();
        Self {
            taken_us: uptime_us(),
            dir,
            state,
            magic: word32(region, OFF_MAGIC),
            access: word32(region, OFF_ACCESS),
            int2ap,
            int2cp: mbox.read_int2cp(),
            status: mbox.read_status(),
            legacy,
            rings,
        }
    }
}

impl fmt::Display for MemSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}.{:06}] {} {} magic:{:#x} access:{} int2ap:{:#06x} int2cp:{:#06x} status:{:#06x}",
            self.taken_us / 1_000_000,
            self.taken_us % 1_000_000,
            self.dir,
            self.state,
            self.magic,
            self.access,
            self.int2ap,
            self.int2cp,
            self.status
        )?;
        for (name, q) in ["FMT", "RAW"].iter().zip(self.legacy.iter()) {
            write!(f, " {}{{tx {}/{} rx {}/{}}}", name, q[0], q[1], q[2], q[3])?;
        }
        for r in &self.rings {
            write!(
                f,
                " RB[{}:{}]{{UL wp {} rp {} DL wp {} rp {}}}",
                r.id, r.ch, r.ul_wp, r.ul_rp, r.dl_wp, r.dl_rp
            )?;
        }
        Ok(())
    }
}

/// Frozen history at the moment the link went down.
#[derive(Debug, Clone)]
pub struct CrashDump {
    pub reason: LinkState,
    pub at: MemSnapshot,
    pub history: Vec<MemSnapshot>,
}

/// Bounded snapshot history plus interrupt counters.
pub struct Diagnostics {
    depth: usize,
    history: SpinLock<VecDeque<MemSnapshot>>,
    last_crash: SpinLock<Option<CrashDump>>,
    irqs: AtomicU64,
    dropped: AtomicU64,
}

impl Diagnostics {
    pub fn new(depth: usize) -> Self {
        Self {
            depth: depth.max(1),
            history: SpinLock::new(VecDeque::with_capacity(depth.max(1))),
            last_crash: SpinLock::new(None),
            irqs: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    /// Keep `snap`, evicting the oldest entry when full.
    pub fn record(&self, snap: MemSnapshot) {
        self.irqs.fetch_add(1, Ordering::Relaxed);
        let mut h = self.history.lock();
        if h.len() == self.depth {
            h.pop_front();
        }
        h.push_back(snap);
    }

    /// An interrupt was discarded by the classifier.
    pub fn count_dropped(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn irqs(&self) -> u64 {
        self.irqs.load(Ordering::Relaxed)
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Oldest first.
    pub fn history(&self) -> Vec<MemSnapshot> {
        self.history.lock().iter().cloned().collect()
    }

    pub fn freeze(&self, reason: LinkState, at: MemSnapshot) {
        let dump = CrashDump {
            reason,
            at,
            history: self.history(),
        };
        *self.last_crash.lock() = Some(dump);
    }

    pub fn last_crash(&self) -> Option<CrashDump> {
        self.last_crash.lock().clone()
    }

    pub fn clear(&self) {
        self.history.lock().clear();
    }
}

impl LinkDevice {
    /// Capture the link now.
    pub fn take_snapshot(&self, dir: Direction, int2ap: u16) -> MemSnapshot {
        let table = self.ring_table().ok();
        MemSnapshot::capture(
            &self.region,
            self.mbox.as_ref(),
            table.as_ref().map(|t| &t.layout),
            dir,
            self.state(),
            int2ap,
        )
    }

    /// Dump the current state and the recent history at error level and
    /// freeze it for later inspection.
    pub(crate) fn capture_crash(&self, reason: LinkState) {
        let at = self.take_snapshot(Direction::Ul, self.mbox.read_int2ap());
        kerror!("{}: {} snapshot {}", self.name(), reason, at);
        for s in self.diag.history().iter().rev().take(4) {
            kinfo!("{}:   {}", self.name(), s);
        }
        self.diag.freeze(reason, at);
    }

    pub fn diagnostics(&self) -> &Diagnostics {
        &self.diag
    }
}
