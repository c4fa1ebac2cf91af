//! # shmlink-executor: The IRQ Hand-off and Worker Loop
//!
//! A link runs on two threads:
//!
//! ```text
//! irq thread (IRQ context)               worker thread (deferred)
//! loop {                                 loop {
//!     wait for the doorbell line             1. Pop classified work
//!     take each word from the mailbox           → handle_irq()
//!     classify_irq() + snapshot              2. Fire due timers
//!     push IrqWork ───── IrqHandoff ───►        (tx pump, datalloc,
//! }                                              crash ack, iosm)
//!                                            3. If no work → sleep until
//!                                               the next deadline
//!                                        }
//! ```
//!
//! The IRQ side never blocks on a link lock for longer than a snapshot
//! read and never calls a `LinkEvents` callback; everything with side
//! effects happens on the worker.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_queue::{ArrayQueue, SegQueue};

use shmlink_core::error::{LinkError, Result};
use shmlink_core::spinlock::SpinLock;
use shmlink_core::{kdebug, kerror_ratelimited, kinfo};
use shmlink_module::link::{IrqKind, IrqWork, LinkDevice};

/// Configuration for the irq and worker loops.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Classified interrupts buffered between the two threads.
    pub handoff_depth: usize,
    /// Maximum doorbell words the IRQ side takes per wakeup.
    pub max_irq_batch: usize,
    /// Maximum work items the worker handles before checking timers.
    pub max_work_batch: usize,
    /// Upper bound on one idle sleep (microseconds).
    pub idle_sleep_us: u64,
    /// How long the IRQ thread blocks on the line per wait.
    pub irq_wait: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            handoff_depth: 256,
            max_irq_batch: 64,
            max_work_batch: 64,
            idle_sleep_us: 100, // 100μs
            irq_wait: Duration::from_millis(10),
        }
    }
}

/// Classified interrupts on their way to the worker.
///
/// The ring is bounded. Commands and IOSM notifications are never dropped:
/// when the ring is full they wait in an overflow list, in arrival order.
/// Data-ready work only asks the worker to look at the rings again, so a
/// full ring folds it into one pending entry whose masks are OR-ed together.
pub struct IrqHandoff {
    queue: ArrayQueue<IrqWork>,
    urgent: SegQueue<IrqWork>,
    spill: SpinLock<Option<IrqWork>>,
    overflows: AtomicU64,
}

impl IrqHandoff {
    pub fn new(depth: usize) -> Self {
        Self {
            queue: ArrayQueue::new(depth.max(1)),
            urgent: SegQueue::new(),
            spill: SpinLock::new(None),
            overflows: AtomicU64::new(0),
        }
    }

    /// Queue `work`. Returns false if the ring was full.
    ///
    /// Single producer: only the IRQ side pushes.
    pub fn push(&self, work: IrqWork) -> bool {
        let work = match work.kind {
            IrqKind::Data(_) => match self.queue.push(work) {
                Ok(()) => return true,
                Err(work) => work,
            },
            // Commands already waiting keep their place ahead of new ones.
            _ if !self.urgent.is_empty() => work,
            _ => match self.queue.push(work) {
                Ok(()) => return true,
                Err(work) => work,
            },
        };

        self.overflows.fetch_add(1, Ordering::Relaxed);
        match work.kind {
            IrqKind::Data(mask) => {
                let mut spill = self.spill.lock();
                let merged = match spill.take() {
                    Some(IrqWork { kind: IrqKind::Data(prev), .. }) => prev | mask,
                    _ => mask,
                };
                kerror_ratelimited!("irq hand-off full, data {:#06x} pending", merged);
                *spill = Some(IrqWork { kind: IrqKind::Data(merged), snap: work.snap });
            }
            kind => {
                kdebug!("irq hand-off full, {:?} held", kind);
                self.urgent.push(work);
            }
        }
        false
    }

    pub fn pop(&self) -> Option<IrqWork> {
        self.queue
            .pop()
            .or_else(|| self.urgent.pop())
            .or_else(|| self.spill.lock().take())
    }

    pub fn len(&self) -> usize {
        self.queue.len() + self.urgent.len() + self.spill.lock().is_some() as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Pushes that found the ring full.
    pub fn overflows(&self) -> u64 {
        self.overflows.load(Ordering::Relaxed)
    }
}

/// Counters shared by both loops.
#[derive(Debug, Default)]
pub struct RunnerStats {
    pub classified: AtomicU64,
    pub handled: AtomicU64,
    pub failed: AtomicU64,
    pub timers: AtomicU64,
}

impl RunnerStats {
    pub fn snapshot(&self) -> [u64; 4] {
        [
            self.classified.load(Ordering::Relaxed),
            self.handled.load(Ordering::Relaxed),
            self.failed.load(Ordering::Relaxed),
            self.timers.load(Ordering::Relaxed),
        ]
    }
}

/// IRQ context: take up to `max` doorbell words, classify each and queue
/// it for the worker. Returns how many were queued.
pub fn irq_handler(link: &LinkDevice, handoff: &IrqHandoff, max: usize, stats: &RunnerStats) -> usize {
    let mut queued = 0usize;
    for _ in 0..max {
        let Some(word) = link.mailbox().take_irq() else {
            break;
        };
        if let Some(work) = link.classify_irq(word) {
            handoff.push(work);
            queued += 1;
        }
    }
    stats.classified.fetch_add(queued as u64, Ordering::Relaxed);
    queued
}

/// One pass of the worker: handle queued work, then due timers. Returns
/// whether anything was done.
pub fn worker_step(link: &LinkDevice, handoff: &IrqHandoff, config: &WorkerConfig, stats: &RunnerStats) -> bool {
    let mut did_work = false;

    // ── Step 1: Handle classified interrupts ──
    for _ in 0..config.max_work_batch {
        let Some(work) = handoff.pop() else {
            break;
        };
        did_work = true;
        match link.handle_irq(work) {
            Ok(()) => {
                stats.handled.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                stats.failed.fetch_add(1, Ordering::Relaxed);
                link.report("worker", &e);
            }
        }
    }

    // ── Step 2: Fire due timers ──
    let fired = link.run_timers(Instant::now());
    if fired > 0 {
        stats.timers.fetch_add(fired as u64, Ordering::Relaxed);
        did_work = true;
    }
    did_work
}

/// The worker loop. Returns when `shutdown` is set, after draining the
/// hand-off.
pub fn worker_loop(
    link: &LinkDevice,
    handoff: &IrqHandoff,
    config: &WorkerConfig,
    stats: &RunnerStats,
    shutdown: &AtomicBool,
) {
    let idle = Duration::from_micros(config.idle_sleep_us);
    loop {
        if shutdown.load(Ordering::Relaxed) {
            break;
        }

        if worker_step(link, handoff, config, stats) {
            continue;
        }

        // ── Step 3: Sleep if idle ──
        let nap = match link.next_deadline() {
            Some(due) => due.saturating_duration_since(Instant::now()).min(idle),
            None => idle,
        };
        if !nap.is_zero() {
            thread::sleep(nap);
        }
    }

    // Shutdown: handle whatever was already classified.
    while worker_step(link, handoff, config, stats) && !handoff.is_empty() {}
}

/// The IRQ loop. `wait` blocks until the doorbell line is raised or the
/// timeout passes.
pub fn irq_loop<F>(
    link: &LinkDevice,
    handoff: &IrqHandoff,
    config: &WorkerConfig,
    stats: &RunnerStats,
    shutdown: &AtomicBool,
    wait: F,
) where
    F: Fn(Duration) -> bool,
{
    while !shutdown.load(Ordering::Relaxed) {
        wait(config.irq_wait);
        while irq_handler(link, handoff, config.max_irq_batch, stats) == config.max_irq_batch {}
    }
}

/// Both loops of one link on their own threads.
pub struct LinkRunner {
    link: Arc<LinkDevice>,
    shutdown: Arc<AtomicBool>,
    stats: Arc<RunnerStats>,
    handoff: Arc<IrqHandoff>,
    threads: Vec<JoinHandle<()>>,
}

impl LinkRunner {
    /// Start the irq and worker threads for `link`.
    ///
    /// `wait` is the doorbell line (e.g. `RegisterMailbox::wait_irq`); a
    /// plain sleep turns the IRQ thread into a poller.
    pub fn spawn<F>(link: Arc<LinkDevice>, config: WorkerConfig, wait: F) -> Result<Self>
    where
        F: Fn(Duration) -> bool + Send + 'static,
    {
        let shutdown = Arc::new(AtomicBool::new(false));
        let stats = Arc::new(RunnerStats::default());
        let handoff = Arc::new(IrqHandoff::new(config.handoff_depth));
        let mut runner = Self {
            link: link.clone(),
            shutdown: shutdown.clone(),
            stats: stats.clone(),
            handoff: handoff.clone(),
            threads: Vec::with_capacity(2),
        };

        let irq = {
            let (link, handoff, stats, shutdown, config) =
                (link.clone(), handoff.clone(), stats.clone(), shutdown.clone(), config.clone());
            thread::Builder::new()
                .name(format!("{}-irq", link.name()))
                .spawn(move || irq_loop(&link, &handoff, &config, &stats, &shutdown, wait))
                .map_err(|e| LinkError::Os(e.raw_os_error().unwrap_or(0)))?
        };
        runner.threads.push(irq);

        let worker = thread::Builder::new()
            .name(format!("{}-worker", link.name()))
            .spawn(move || worker_loop(&link, &handoff, &config, &stats, &shutdown))
            .map_err(|e| LinkError::Os(e.raw_os_error().unwrap_or(0)))?;
        runner.threads.push(worker);

        kinfo!("{}: runner started", runner.link.name());
        Ok(runner)
    }

    pub fn link(&self) -> &Arc<LinkDevice> {
        &self.link
    }

    pub fn stats(&self) -> &RunnerStats {
        &self.stats
    }

    pub fn handoff(&self) -> &IrqHandoff {
        &self.handoff
    }

    /// Stop both threads and wait for them.
    pub fn stop(&mut self) {
        if self.threads.is_empty() {
            return;
        }
        self.shutdown.store(true, Ordering::Relaxed);
        for t in self.threads.drain(..) {
            if t.join().is_err() {
                kerror_ratelimited!("{}: runner thread panicked", self.link.name());
            }
        }
        kdebug!("{}: runner stopped {:?}", self.link.name(), self.stats.snapshot());
    }
}

impl Drop for LinkRunner {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shmlink_core::config::LinkConfig;
    use shmlink_core::kprint::{set_log_level, LogLevel};
    use shmlink_core::state::LinkState;
    use shmlink_core::wire::{
        mask2int, Command, CH_FMT_0, CH_RFS_0, MASK_REQ_ACK_FMT, MASK_SEND_FMT, MASK_SEND_RAW,
    };
    use shmlink_module::sim::{bring_up, connect, Event};

    fn quiet() -> LinkConfig {
        set_log_level(LogLevel::Off);
        LinkConfig::new().name("exec")
    }

    fn wait_for(mut cond: impl FnMut() -> bool) -> bool {
        let until = Instant::now() + Duration::from_secs(2);
        while Instant::now() < until {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(1));
        }
        false
    }

    #[test]
    fn test_full_handoff_keeps_commands() {
        let (link, _cp, _events) = connect(quiet()).unwrap();
        let h = IrqHandoff::new(4);
        let data = |mask| link.classify_irq(mask2int(mask)).unwrap();

        assert!(h.push(link.classify_irq(Command::CrashExit.to_int()).unwrap()));
        for mask in [MASK_SEND_FMT, MASK_SEND_RAW, MASK_SEND_FMT] {
            assert!(h.push(data(mask)));
        }
        // Full: data folds into one entry, the command waits.
        assert!(!h.push(data(MASK_REQ_ACK_FMT)));
        assert!(!h.push(link.classify_irq(Command::ReqTimeSync.to_int()).unwrap()));
        assert!(!h.push(data(MASK_SEND_RAW)));
        assert_eq!(h.overflows(), 3);
        assert_eq!(h.len(), 6);

        let kinds: Vec<IrqKind> = std::iter::from_fn(|| h.pop()).map(|w| w.kind).collect();
        assert_eq!(
            kinds,
            vec![
                IrqKind::Command(Command::CrashExit as u16),
                IrqKind::Data(MASK_SEND_FMT),
                IrqKind::Data(MASK_SEND_RAW),
                IrqKind::Data(MASK_SEND_FMT),
                IrqKind::Command(Command::ReqTimeSync as u16),
                IrqKind::Data(MASK_REQ_ACK_FMT | MASK_SEND_RAW),
            ]
        );
        assert!(h.is_empty());
    }

    #[test]
    fn test_held_commands_stay_in_order() {
        let (link, cp, _events) = connect(quiet()).unwrap();
        let h = IrqHandoff::new(1);
        let stats = RunnerStats::default();
        for cmd in [Command::InitStart, Command::ReqTimeSync, Command::PhoneStart] {
            cp.send_cmd(cmd).unwrap();
        }
        assert_eq!(irq_handler(&link, &h, 64, &stats), 3);
        assert_eq!(h.overflows(), 2);

        // A slot frees up, but the next command still queues behind the held ones.
        assert_eq!(h.pop().unwrap().kind, IrqKind::Command(Command::InitStart as u16));
        assert!(!h.push(link.classify_irq(Command::CrashExit.to_int()).unwrap()));
        let kinds: Vec<IrqKind> = std::iter::from_fn(|| h.pop()).map(|w| w.kind).collect();
        assert_eq!(
            kinds,
            vec![
                IrqKind::Command(Command::ReqTimeSync as u16),
                IrqKind::Command(Command::PhoneStart as u16),
                IrqKind::Command(Command::CrashExit as u16),
            ]
        );
    }

    #[test]
    fn test_invalid_word_not_queued() {
        let (link, cp, _events) = connect(quiet()).unwrap();
        let h = IrqHandoff::new(8);
        let stats = RunnerStats::default();
        cp.mailbox().send_int2ap(0x0001).unwrap();
        assert_eq!(irq_handler(&link, &h, 64, &stats), 0);
        assert!(h.is_empty());
        assert_eq!(link.diagnostics().dropped(), 1);
    }

    #[test]
    fn test_step_delivers_dl() {
        let (link, cp, events) = connect(quiet()).unwrap();
        bring_up(&link, &cp).unwrap();
        events.take();
        let h = IrqHandoff::new(8);
        let stats = RunnerStats::default();
        let cfg = WorkerConfig::default();

        let seen = link.diagnostics().history().len();
        cp.send_dl(CH_RFS_0, b"hello").unwrap();
        assert_eq!(irq_handler(&link, &h, 64, &stats), 1);
        // Nothing is delivered from IRQ context.
        assert!(events.take().is_empty());
        assert!(worker_step(&link, &h, &cfg, &stats));
        assert_eq!(events.take(), vec![Event::Rx(CH_RFS_0, b"hello".to_vec())]);
        assert_eq!(link.diagnostics().history().len(), seen + 1);
        assert!(!worker_step(&link, &h, &cfg, &stats));
    }

    #[test]
    fn test_runner_boots_link() {
        let (link, cp, events) = connect(quiet()).unwrap();
        let mut runner = LinkRunner::spawn(link.clone(), WorkerConfig::default(), |d| {
            thread::sleep(d.min(Duration::from_millis(1)));
            true
        })
        .unwrap();

        link.boot_on();
        cp.send_cmd(Command::InitStart).unwrap();
        assert!(wait_for(|| cp.commands_seen(Command::PifInitDone) == 1));
        link.open_channel(CH_FMT_0).unwrap();
        link.open_channel(CH_RFS_0).unwrap();
        cp.send_cmd(Command::PhoneStart).unwrap();
        link.wait_boot_complete(Duration::from_secs(2)).unwrap();
        assert_eq!(link.state(), LinkState::Online);

        // Queued UL frames go out from the worker's tx timer.
        link.enqueue(CH_FMT_0, b"queued").unwrap();
        let mut got = Vec::new();
        assert!(wait_for(|| {
            got.extend(cp.take_ul());
            !got.is_empty()
        }));
        assert_eq!(got, vec![(CH_FMT_0, b"queued".to_vec())]);

        cp.send_cmd(Command::CrashExit).unwrap();
        assert!(wait_for(|| link.state() == LinkState::CrashExit));
        runner.stop();
        assert!(events.take().contains(&Event::Down(LinkState::CrashExit)));
        assert!(runner.stats().snapshot()[0] >= 3);
    }
}
