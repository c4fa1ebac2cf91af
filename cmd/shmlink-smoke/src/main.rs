//! shmlink End-to-End Smoke Test
//!
//! Drives a `LinkDevice` against the software CP in `shmlink_module::sim`:
//!   Part A: Legacy queues (boot, UL and DL frames)
//!   Part B: SBD rings (boot handshake, chained UL, multiplexed DL)
//!   Part C: Flow control (high water, REQ_ACK / RES_ACK, consumer restart)
//!   Part D: Zero-copy DL (cell stocking and recycling)
//!   Part E: IOSM (MDM_READY, channel open, CP flow messages)
//!   Part F: Crash paths (forced crash, CP crash, ack timeout, reboot)
//!   Part G: Threaded runner (irq + worker threads, tx timer)
//!
//! Run: ./target/release/shmlink-smoke
//! (SHMLINK_LOG_LEVEL=debug shows the link's own log lines)

use shmlink_core::config::{ChannelSpec, LinkConfig};
use shmlink_core::kprint::{self, set_log_level, LogLevel};
use shmlink_core::state::LinkState;
use shmlink_core::wire::{Command, IosmRecord, CH_FMT_0, CH_PDP_0, CH_RFS_0, MASK_REQ_ACK_FMT};
use shmlink_core::LinkError;

use shmlink_executor::{LinkRunner, WorkerConfig};
use shmlink_module::iosm::{A2C_ACK, A2C_AP_READY, A2C_OPEN_CH, C2A_MDM_READY, C2A_START_TX_CH, C2A_STOP_TX_CH};
use shmlink_module::sim::{bring_up, connect, CpPeer, Event, RecordingEvents};
use shmlink_module::LinkDevice;

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Raw channel carried on a zero-copy DL ring in Part D.
const ZC_CH: u16 = 30;

type Pair = (Arc<LinkDevice>, CpPeer, Arc<RecordingEvents>);

// ── Test harness ──

struct TestRunner {
    total: usize,
    passed: usize,
    failed: usize,
}

const LINE: &str = "────────────────────────────────────────────────────────────";

impl TestRunner {
    fn new() -> Self {
        Self { total: 0, passed: 0, failed: 0 }
    }

    fn section(&self, name: &str) {
        println!("\n{}", LINE);
        println!("  {}", name);
        println!("{}", LINE);
    }

    fn pass(&mut self, name: &str) {
        self.total += 1;
        self.passed += 1;
        println!("  [{:2}] {:<52} PASS", self.total, name);
    }

    fn fail(&mut self, name: &str, reason: &str) {
        self.total += 1;
        self.failed += 1;
        println!("  [{:2}] {:<52} FAIL: {}", self.total, name, reason);
    }

    fn check(&mut self, name: &str, ok: bool, reason: &str) {
        if ok { self.pass(name); } else { self.fail(name, reason); }
    }

    fn summary(&self) {
        println!("\n{}", LINE);
        println!(
            "  Total: {}  Passed: {}  Failed: {}",
            self.total, self.passed, self.failed
        );
        println!("{}", LINE);
    }
}

/// Environment-tuned config with a short link-active probe.
fn base(name: &str) -> LinkConfig {
    LinkConfig::from_env()
        .name(name)
        .link_active_probe(10, Duration::from_millis(1))
}

/// Build a link + CP pair, and optionally boot it.
fn setup(t: &mut TestRunner, cfg: LinkConfig, boot: bool) -> Option<Pair> {
    let (link, cp, events) = match connect(cfg) {
        Ok(p) => p,
        Err(e) => {
            t.fail("link + CP peer built", &e.to_string());
            return None;
        }
    };
    if boot {
        if let Err(e) = bring_up(&link, &cp) {
            t.fail("boot to ONLINE", &format!("{} (state {})", e, link.state().name()));
            return None;
        }
        events.take();
    }
    Some((link, cp, events))
}

fn rx_of(events: &[Event]) -> Vec<(u16, Vec<u8>)> {
    events
        .iter()
        .filter_map(|e| match e {
            Event::Rx(ch, data) => Some((*ch, data.clone())),
            _ => None,
        })
        .collect()
}

fn wait_for(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let until = Instant::now() + timeout;
    while Instant::now() < until {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(1));
    }
    false
}

// ════════════════════════════════════════════════════════════
// Part A: Legacy queues
// ════════════════════════════════════════════════════════════

fn test_legacy(t: &mut TestRunner) {
    t.section("Part A: Legacy queues");

    let Some((link, cp, events)) = setup(t, base("legacy").sbd_ipc(false), false) else {
        return;
    };
    let up = bring_up(&link, &cp);
    t.check("INIT_START + PHONE_START -> ONLINE", up.is_ok(), &format!("{:?}", up));
    if up.is_err() {
        return;
    }
    t.check(
        "INIT_END sent once",
        cp.commands_seen(Command::InitEnd) == 1,
        &format!("{}", cp.commands_seen(Command::InitEnd)),
    );

    let sent = link.send(CH_FMT_0, b"legacy fmt ul");
    let got = cp.take_ul();
    t.check(
        "FMT UL frame reaches CP",
        sent.is_ok() && got == vec![(CH_FMT_0, b"legacy fmt ul".to_vec())],
        &format!("{:?} / {:?}", sent, got),
    );

    events.take();
    let dl = cp.send_dl(CH_PDP_0, b"legacy raw dl").and_then(|_| link.poll_irqs());
    let rx = rx_of(&events.take());
    t.check(
        "RAW DL frame delivered",
        dl.is_ok() && rx == vec![(CH_PDP_0, b"legacy raw dl".to_vec())],
        &format!("{:?} / {:?}", dl, rx),
    );

    let q = link.enqueue(CH_FMT_0, b"queued");
    t.check("tx queue refused without SBD", q == Err(LinkError::Inactive), &format!("{:?}", q));
}

// ════════════════════════════════════════════════════════════
// Part B: SBD rings
// ════════════════════════════════════════════════════════════

fn test_sbd(t: &mut TestRunner) {
    t.section("Part B: SBD rings");

    let Some((link, cp, events)) = setup(t, base("sbd"), false) else {
        return;
    };
    let up = bring_up(&link, &cp);
    t.check("INIT_START -> PIF_INIT_DONE -> ONLINE", up.is_ok(), &format!("{:?}", up));
    if up.is_err() {
        return;
    }
    t.check(
        "PIF_INIT_DONE + INIT_END sent",
        cp.commands_seen(Command::PifInitDone) == 1 && cp.commands_seen(Command::InitEnd) == 1,
        "missing handshake doorbell",
    );
    let evs = events.take();
    t.check(
        "BOOTING -> ONLINE reported",
        evs.contains(&Event::State(LinkState::Booting, LinkState::Online)),
        &format!("{:?}", evs),
    );

    match cp.layout() {
        Ok(layout) => t.check(
            "CP discovers every ring",
            layout.num_channels as usize == link.config().channels.len(),
            &format!("{} rings", layout.num_channels),
        ),
        Err(e) => t.fail("CP discovers every ring", &e.to_string()),
    }

    let small = link.send(CH_RFS_0, b"rfs ul");
    let got = cp.take_ul();
    t.check(
        "single-slot UL frame",
        small.is_ok() && got == vec![(CH_RFS_0, b"rfs ul".to_vec())],
        &format!("{:?} / {:?}", small, got),
    );

    let big: Vec<u8> = (0..5000u32).map(|i| i as u8).collect();
    let chained = link.send(CH_FMT_0, &big);
    let got = cp.take_ul();
    t.check(
        "5000-byte FMT frame chained + reassembled",
        chained.is_ok() && got == vec![(CH_FMT_0, big.clone())],
        &format!("{:?} / {} frames", chained, got.len()),
    );

    let dl = cp
        .send_dl(CH_PDP_0, b"pdp dl")
        .and_then(|_| cp.send_dl(CH_FMT_0, b"fmt dl"))
        .and_then(|_| link.poll_irqs());
    let rx = rx_of(&events.take());
    t.check(
        "multiplexed + FMT DL delivered",
        dl.is_ok()
            && rx.contains(&(CH_PDP_0, b"pdp dl".to_vec()))
            && rx.contains(&(CH_FMT_0, b"fmt dl".to_vec())),
        &format!("{:?} / {:?}", dl, rx),
    );

    let history = link.diagnostics().history();
    t.check("DL snapshots recorded", !history.is_empty(), "empty history");

    let closed = link.close_channel(CH_RFS_0).and_then(|_| link.open_channel(CH_RFS_0));
    t.check("close + reopen consumer", closed.is_ok(), &format!("{:?}", closed));
    t.check(
        "unknown channel rejected",
        link.send(99, b"x") == Err(LinkError::NoSuchChannel(99)),
        "accepted",
    );
}

// ════════════════════════════════════════════════════════════
// Part C: Flow control
// ════════════════════════════════════════════════════════════

fn test_flow(t: &mut TestRunner) {
    t.section("Part C: Flow control");

    let Some((link, cp, events)) = setup(t, base("flow"), true) else {
        return;
    };
    let len = match link.ring_table() {
        Ok(table) => table.ul[0].len(),
        Err(e) => {
            t.fail("ring table", &e.to_string());
            return;
        }
    };

    cp.set_stall_ul(true);
    let mut sent = 0u32;
    while !link.flow().is_busy(0) && sent < len {
        if link.send(CH_FMT_0, b"fmt").is_err() {
            break;
        }
        sent += 1;
    }
    t.check("FMT ring busy at high water", link.flow().is_busy(0), &format!("{} sent", sent));

    let bounced = link.send(CH_FMT_0, b"fmt");
    t.check("busy ring bounces writes", bounced == Err(LinkError::Busy(0)), &format!("{:?}", bounced));
    t.check(
        "one REQ_ACK per busy episode",
        cp.doorbells_with(MASK_REQ_ACK_FMT) == 1,
        &format!("{}", cp.doorbells_with(MASK_REQ_ACK_FMT)),
    );
    t.check(
        "FMT + RFS consumers stopped",
        link.flow().is_stopped(CH_FMT_0) && link.flow().is_stopped(CH_RFS_0),
        &format!("{:?}", link.flow().stopped_channels()),
    );

    events.take();
    cp.set_stall_ul(false);
    let drained = cp.poll().and_then(|_| link.poll_irqs());
    t.check(
        "RES_ACK clears busy",
        drained.is_ok() && !link.flow().is_busy(0),
        &format!("{:?}", drained),
    );
    let evs = events.take();
    t.check(
        "consumers restarted",
        evs.contains(&Event::Start(CH_FMT_0)) && evs.contains(&Event::Start(CH_RFS_0)),
        &format!("{:?}", evs),
    );
    let got = cp.take_ul();
    t.check("every accepted frame delivered", got.len() == sent as usize, &format!("{} of {}", got.len(), sent));

    events.take();
    link.suspend_tx();
    let stops = events.take().iter().filter(|e| matches!(e, Event::Stop(_))).count();
    link.resume_tx();
    let starts = events.take().iter().filter(|e| matches!(e, Event::Start(_))).count();
    t.check(
        "suspend / resume round trip",
        stops > 0 && stops == starts,
        &format!("{} stops, {} starts", stops, starts),
    );
}

// ════════════════════════════════════════════════════════════
// Part D: Zero-copy DL
// ════════════════════════════════════════════════════════════

fn test_zerocopy(t: &mut TestRunner) {
    t.section("Part D: Zero-copy DL");

    let cfg = base("zerocopy")
        .channels(vec![
            ChannelSpec::fmt(CH_FMT_0, 64, 2048),
            ChannelSpec::fmt(CH_RFS_0, 64, 2048),
            ChannelSpec::raw(ZC_CH, 16, 512).with_zerocopy(true),
        ])
        .zmb(512, 64);
    let Some((link, cp, events)) = setup(t, cfg, true) else {
        return;
    };
    if let Err(e) = link.open_channel(ZC_CH) {
        t.fail("open zero-copy channel", &e.to_string());
        return;
    }
    let Some(pool) = link.cells().cloned() else {
        t.fail("cell pool present", "no pool");
        return;
    };
    let stocked = pool.in_use();
    t.check("DL ring stocked with cells", stocked > 0, "nothing stocked");

    // More frames than the ring has slots, so every cell is recycled.
    let mut sent = Vec::new();
    let mut err = None;
    for i in 0..40u8 {
        let payload = vec![i; 100 + i as usize];
        if let Err(e) = cp.send_dl(ZC_CH, &payload).and_then(|_| link.poll_irqs()) {
            err = Some(e);
            break;
        }
        sent.push((ZC_CH, payload));
    }
    let rx = rx_of(&events.take());
    t.check(
        "40 frames through 16 slots",
        err.is_none() && rx == sent,
        &format!("{:?} / {} of {}", err, rx.len(), sent.len()),
    );
    t.check(
        "consumed cells returned + restocked",
        pool.in_use() == stocked,
        &format!("{} in use, {} stocked", pool.in_use(), stocked),
    );

    link.shutdown();
    t.check("shutdown returns every cell", pool.in_use() == 0, &format!("{} in use", pool.in_use()));
}

// ════════════════════════════════════════════════════════════
// Part E: IOSM
// ════════════════════════════════════════════════════════════

fn test_iosm(t: &mut TestRunner) {
    t.section("Part E: IOSM");

    let Some((link, cp, events)) = setup(t, base("iosm").iosm(true), false) else {
        return;
    };
    link.boot_on();
    let ready = cp.send_mdm_ready().and_then(|_| link.poll_irqs());
    t.check(
        "MDM_READY -> ONLINE",
        ready.is_ok() && link.state() == LinkState::Online,
        &format!("{:?} / {}", ready, link.state().name()),
    );

    let seen = cp.poll_iosm().unwrap_or_default();
    t.check(
        "MDM_READY acked + AP_READY sent",
        seen.iter().any(|r| r.msg_id == A2C_ACK && r.payload[0] == C2A_MDM_READY)
            && seen.iter().any(|r| r.msg_id == A2C_AP_READY),
        &format!("{:?}", seen.iter().map(|r| r.msg_id).collect::<Vec<_>>()),
    );
    // The CP's ACK of AP_READY.
    let _ = link.poll_irqs();

    let open = link.open_channel(CH_FMT_0);
    let seen = cp.poll_iosm().unwrap_or_default();
    t.check(
        "OPEN_CH reaches CP",
        open.is_ok() && seen.iter().any(|r| r.msg_id == A2C_OPEN_CH && r.payload[0] == CH_FMT_0 as u8),
        &format!("{:?}", open),
    );
    let _ = link.poll_irqs();
    t.check(
        "OPEN_CH ack clears request",
        link.iosm().outstanding().is_empty(),
        &format!("{:?}", link.iosm().outstanding()),
    );

    let mut stop = IosmRecord { msg_id: C2A_STOP_TX_CH, trans_id: 40, ..Default::default() };
    stop.payload[0] = CH_PDP_0 as u8;
    let r = cp.send_iosm(stop).and_then(|_| link.poll_irqs());
    let acked = cp
        .poll_iosm()
        .unwrap_or_default()
        .iter()
        .any(|rec| rec.msg_id == A2C_ACK && rec.trans_id == 40);
    t.check(
        "CP STOP_TX_CH stops + is acked",
        r.is_ok() && link.flow().is_stopped(CH_PDP_0) && acked,
        &format!("{:?}", r),
    );

    let mut start = IosmRecord { msg_id: C2A_START_TX_CH, trans_id: 41, ..Default::default() };
    start.payload[0] = CH_PDP_0 as u8;
    let r = cp.send_iosm(start).and_then(|_| link.poll_irqs());
    let _ = cp.poll_iosm();
    t.check("CP START_TX_CH restarts", r.is_ok() && !link.flow().is_stopped(CH_PDP_0), &format!("{:?}", r));

    events.take();
    let sent = link.send(CH_FMT_0, b"iosm ul");
    let got = cp.take_ul();
    t.check(
        "SBD data on IOSM link",
        sent.is_ok() && got == vec![(CH_FMT_0, b"iosm ul".to_vec())],
        &format!("{:?} / {:?}", sent, got),
    );
}

// ════════════════════════════════════════════════════════════
// Part F: Crash paths
// ════════════════════════════════════════════════════════════

fn test_crash(t: &mut TestRunner) {
    t.section("Part F: Crash paths");

    if let Some((link, cp, events)) = setup(t, base("crash-forced"), true) {
        link.force_crash("smoke");
        t.check(
            "forced crash stops data",
            link.crash_in_progress() && !link.ipc_active(),
            &format!("state {}", link.state().name()),
        );
        t.check(
            "CRASH_EXIT sent to CP once",
            cp.commands_seen(Command::CrashExit) == 1,
            &format!("{}", cp.commands_seen(Command::CrashExit)),
        );
        let ack = cp.send_cmd(Command::CrashExit).and_then(|_| link.poll_irqs());
        t.check(
            "CP ack -> CRASH_EXIT + link down",
            ack.is_ok()
                && link.state() == LinkState::CrashExit
                && events.take().contains(&Event::Down(LinkState::CrashExit)),
            &format!("{:?} / {}", ack, link.state().name()),
        );
        t.check("crash dump frozen", link.diagnostics().last_crash().is_some(), "no dump");

        // A crashed CP is rebooted from scratch.
        let again = bring_up(&link, &cp);
        t.check("reboot after crash", again.is_ok(), &format!("{:?}", again));
    }

    if let Some((link, _cp, events)) = setup(t, base("crash-timeout"), true) {
        link.force_crash("no answer");
        let at = Instant::now() + link.config().crash_ack_timeout + Duration::from_millis(1);
        let fired = link.run_timers(at);
        t.check(
            "crash ack timeout -> CRASH_EXIT",
            fired == 1
                && link.state() == LinkState::CrashExit
                && events.take().contains(&Event::Down(LinkState::CrashExit)),
            &format!("{} fired / {}", fired, link.state().name()),
        );
    }

    if let Some((link, cp, events)) = setup(t, base("crash-reset"), true) {
        let r = cp.send_cmd(Command::CrashReset).and_then(|_| link.poll_irqs());
        t.check(
            "CP CRASH_RESET -> OFFLINE",
            r.is_ok()
                && link.state() == LinkState::Offline
                && events.take().contains(&Event::Down(LinkState::CrashReset)),
            &format!("{:?} / {}", r, link.state().name()),
        );
    }

    if let Some((link, cp, _events)) = setup(t, base("phone-start"), true) {
        let limit = link.config().abnormal_phone_start_limit;
        for _ in 0..limit {
            let _ = cp.send_cmd(Command::PhoneStart).and_then(|_| link.poll_irqs());
        }
        let tolerated = !link.crash_in_progress();
        let _ = cp.send_cmd(Command::PhoneStart).and_then(|_| link.poll_irqs());
        t.check(
            "repeated PHONE_START escalates",
            tolerated && link.crash_in_progress(),
            &format!("limit {}", limit),
        );
    }

    if let Some((link, _cp, events)) = setup(t, base("watchdog"), true) {
        link.on_watchdog();
        t.check(
            "watchdog -> CRASH_WATCHDOG",
            link.state() == LinkState::CrashWatchdog
                && events.take().contains(&Event::Down(LinkState::CrashWatchdog)),
            link.state().name(),
        );
    }
}

// ════════════════════════════════════════════════════════════
// Part G: Threaded runner
// ════════════════════════════════════════════════════════════

fn test_runner(t: &mut TestRunner) {
    t.section("Part G: Threaded runner");

    let Some((link, cp, events)) = setup(t, base("runner"), false) else {
        return;
    };
    let mut runner = match LinkRunner::spawn(link.clone(), WorkerConfig::default(), |d| {
        thread::sleep(d.min(Duration::from_millis(1)));
        true
    }) {
        Ok(r) => r,
        Err(e) => {
            t.fail("runner spawned", &e.to_string());
            return;
        }
    };

    link.boot_on();
    let init = cp.send_cmd(Command::InitStart);
    let pif = init.is_ok() && wait_for(Duration::from_secs(2), || cp.commands_seen(Command::PifInitDone) == 1);
    t.check("INIT_START handled off-thread", pif, &format!("{:?}", init));

    let opened = link.open_channel(CH_FMT_0).and_then(|_| link.open_channel(CH_RFS_0));
    let booted = opened
        .and_then(|_| cp.send_cmd(Command::PhoneStart))
        .and_then(|_| link.wait_boot_complete(Duration::from_secs(2)));
    t.check("boot completes", booted.is_ok(), &format!("{:?}", booted));

    let q = link.enqueue(CH_FMT_0, b"queued");
    let mut got = Vec::new();
    let out = q.is_ok()
        && wait_for(Duration::from_secs(2), || {
            got.extend(cp.take_ul());
            !got.is_empty()
        });
    t.check(
        "tx timer pumps queued frame",
        out && got == vec![(CH_FMT_0, b"queued".to_vec())],
        &format!("{:?} / {:?}", q, got),
    );

    events.take();
    let dl = cp.send_dl(CH_RFS_0, b"worker dl");
    let delivered = dl.is_ok()
        && wait_for(Duration::from_secs(2), || {
            rx_of(&events.take()).contains(&(CH_RFS_0, b"worker dl".to_vec()))
        });
    t.check("DL delivered by worker", delivered, &format!("{:?}", dl));

    runner.stop();
    let [classified, handled, failed, timers] = runner.stats().snapshot();
    println!(
        "       irqs classified={} handled={} failed={} timers={}",
        classified, handled, failed, timers
    );
    t.check("runner stats", classified >= 3 && failed == 0, &format!("{} failed", failed));
}

fn main() {
    kprint::init();
    // Quiet unless the caller asked for link logs.
    if std::env::var("SHMLINK_LOG_LEVEL").is_err() {
        set_log_level(LogLevel::Error);
    }
    println!("=== shmlink End-to-End Smoke Test ===");

    let mut t = TestRunner::new();

    test_legacy(&mut t);
    test_sbd(&mut t);
    test_flow(&mut t);
    test_zerocopy(&mut t);
    test_iosm(&mut t);
    test_crash(&mut t);
    test_runner(&mut t);

    t.summary();
    std::process::exit(if t.failed > 0 { 1 } else { 0 });
}
