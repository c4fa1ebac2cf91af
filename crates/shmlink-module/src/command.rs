//! Link commands and the boot / crash state machine.
//!
//! ```text
//!            boot_on()            PHONE_START (+ consumers ready)
//!   OFFLINE ──────────► BOOTING ─────────────────────────────► ONLINE
//!      ▲                   │ INIT_START: rings built,              │
//!      │                   │ PIF_INIT_DONE -> CP                   │
//!      │ CRASH_RESET       ▼                                       │
//!      └──────────────── any ◄──── CRASH_EXIT / no CRASH_ACK ──────┘
//!                                   (CRASH_EXIT state)
//! ```
//!
//! The AP can also force a CP crash: it writes the crash magic, stops every
//! consumer and sends CRASH_EXIT, then waits `crash_ack_timeout` for the
//! CP's own CRASH_EXIT (the ack). The AP never answers a CRASH_EXIT.

use std::sync::atomic::Ordering;

use shmlink_core::barrier::mb;
use shmlink_core::error::{LinkError, Result};
use shmlink_core::state::{Direction, LinkState};
use shmlink_core::wire::{Command, MEM_CRASH_MAGIC, MEM_IPC_MAGIC};
use shmlink_core::{kdebug, kerror, kinfo, kwarn};

use crate::layout::{OFF_ACCESS, OFF_MAGIC};
use crate::link::LinkDevice;

impl LinkDevice {
    /// Act on one command word from the CP.
    pub(crate) fn handle_command(&self, raw: u16) -> Result<()> {
        let Some(cmd) = Command::from_u16(raw) else {
            kerror!("{}: ERR! unknown command {:#x}", self.name(), raw);
            return Err(LinkError::UnknownCommand(raw));
        };
        kinfo!("{}: {} <- CP (state {})", self.name(), cmd, self.state());
        match cmd {
            Command::InitStart => self.cmd_init_start(),
            Command::PhoneStart => self.cmd_phone_start(),
            Command::CrashReset => {
                self.cmd_crash_reset();
                Ok(())
            }
            Command::CrashExit => {
                self.cmd_crash_exit();
                Ok(())
            }
            Command::IosmMessage => self.iosm_rx().map(|_| ()),
            Command::ReqActive
            | Command::ResActive
            | Command::ReqTimeSync
            | Command::CpDeepSleep
            | Command::NvRebuilding
            | Command::EmerDown
            | Command::SilentNvRebuild
            | Command::NormalPowerOff
            | Command::KernelPanic
            | Command::InitEnd
            | Command::PifInitDone => {
                kdebug!("{}: {} needs no action", self.name(), cmd);
                Ok(())
            }
        }
    }

    fn cmd_init_start(&self) -> Result<()> {
        if !self.cfg.sbd_ipc {
            kinfo!("{}: INIT_START on a legacy link, nothing to build", self.name());
            return Ok(());
        }
        if let Err(e) = self.init_sbd_link() {
            kerror!("{}: ERR! init_sbd_link fail ({})", self.name(), e);
            return Err(e);
        }
        self.core.lock().aligned = self.cfg.aligned;
        self.sbd_activate()?;
        kinfo!("{}: PIF_INIT_DONE -> CP", self.name());
        self.send_cmd(Command::PifInitDone)
    }

    fn cmd_phone_start(&self) -> Result<()> {
        let (count, boot_done, state, ready) = {
            let mut core = self.core.lock();
            if core.state == LinkState::Offline {
                core.phone_start_count = 0;
            }
            core.phone_start_count += 1;
            (core.phone_start_count, core.cp_boot_done, core.state, core.consumers_ready())
        };

        if boot_done {
            // Repeats after a completed boot: re-send INIT_END a few times,
            // then give up on the CP.
            let repeat = count.saturating_sub(1);
            kerror!("{}: ERR! abnormal PHONE_START #{} (state {})", self.name(), repeat, state);
            if repeat > self.cfg.abnormal_phone_start_limit {
                self.force_crash("Abnormal PHONE_START");
                return Err(LinkError::Protocol("abnormal PHONE_START"));
            }
            return self.send_cmd(Command::InitEnd);
        }

        if state.is_online() {
            if ready {
                self.send_cmd(Command::InitEnd)?;
            }
            return Ok(());
        }

        if count == 1 {
            self.reset_ipc_link()?;
        }
        if ready {
            self.complete_phone_start()
        } else {
            self.core.lock().phone_start_pending = true;
            kinfo!("{}: PHONE_START held until FMT and RFS consumers open", self.name());
            Ok(())
        }
    }

    /// Finish a PHONE_START: the link goes ONLINE and the CP gets INIT_END.
    pub(crate) fn complete_phone_start(&self) -> Result<()> {
        {
            let mut core = self.core.lock();
            core.phone_start_pending = false;
            core.cp_boot_done = true;
        }
        self.transition(LinkState::Online);
        kinfo!("{}: INIT_END -> CP", self.name());
        self.send_cmd(Command::InitEnd)
    }

    fn cmd_crash_reset(&self) {
        kerror!("{}: CP CRASH_RESET", self.name());
        self.transition(LinkState::Offline);
        self.handle_cp_crash(LinkState::CrashReset);
    }

    /// The CP crashed, or acked a crash the AP forced.
    fn cmd_crash_exit(&self) {
        self.cancel_crash_ack_timer();
        if self.crash_in_progress() {
            kinfo!("{}: CP_CRASH_ACK", self.name());
        } else {
            kerror!("{}: ERR! CP_CRASH_EXIT", self.name());
        }
        self.transition(LinkState::CrashExit);
        self.handle_cp_crash(LinkState::CrashExit);
    }

    /// Common teardown once the CP is known to be down.
    pub(crate) fn handle_cp_crash(&self, reason: LinkState) {
        if let Err(e) = self.write_handshake(MEM_CRASH_MAGIC, 0) {
            kerror!("{}: ERR! writing crash magic: {}", self.name(), e);
        }
        self.sbd_deactivate();
        self.stop_all_channels();
        self.purge_txq();
        self.capture_crash(reason);
        self.events.on_link_down(reason);
        self.forced_crash.store(false, Ordering::Release);
    }

    /// Ask the CP to crash (it dumps its state and acks with CRASH_EXIT).
    ///
    /// Repeated calls while one is under way do nothing. Off-line, only the
    /// crash magic is written.
    pub fn force_crash(&self, why: &str) {
        if self.forced_crash.swap(true, Ordering::AcqRel) {
            kdebug!("{}: crash already forced, ignoring '{}'", self.name(), why);
            return;
        }
        kerror!("{}: forcing CP crash: {}", self.name(), why);
        if let Err(e) = self.write_handshake(MEM_CRASH_MAGIC, 0) {
            kerror!("{}: ERR! writing crash magic: {}", self.name(), e);
        }

        let state = self.state();
        if !state.is_online() {
            kwarn!("{}: CP not online ({}), no CRASH_EXIT sent", self.name(), state);
            return;
        }
        self.stop_all_channels();
        let at = self.take_snapshot(Direction::Ul, self.mbox.read_int2ap());
        kerror!("{}: {}", self.name(), at);
        self.arm_crash_ack_timer();
        if let Err(e) = self.send_cmd(Command::CrashExit) {
            kerror!("{}: ERR! CRASH_EXIT not sent: {}", self.name(), e);
        }
    }

    /// A forced crash is waiting for the CP's ack.
    pub fn crash_in_progress(&self) -> bool {
        self.forced_crash.load(Ordering::Acquire)
    }

    /// The crash-ack timer expired.
    pub(crate) fn handle_no_crash_ack(&self) {
        if self.state().is_crashed() {
            kdebug!("{}: already {}", self.name(), self.state());
            return;
        }
        kerror!("{}: ERR! no CRASH_ACK from CP", self.name());
        self.transition(LinkState::CrashExit);
        self.handle_cp_crash(LinkState::CrashExit);
    }

    fn write_handshake(&self, magic: u32, access: u32) -> Result<()> {
        self.region.write_u32(OFF_ACCESS, 0)?;
        self.region.write_u32(OFF_MAGIC, magic)?;
        self.region.write_u32(OFF_ACCESS, access)?;
        mb();
        Ok(())
    }

    /// Clear every queue and pointer and re-publish the handshake words.
    pub(crate) fn reset_ipc_link(&self) -> Result<()> {
        self.write_handshake(0, 0)?;
        self.legacy.reset_map()?;
        self.purge_txq();
        self.flow.reset();
        if let Ok(table) = self.ring_table() {
            table.reset_pointers()?;
            if self.sbd_active() {
                self.replenish_rings(&table);
            }
        }
        self.write_handshake(MEM_IPC_MAGIC, 1)?;

        let magic = self.region.read_u32(OFF_MAGIC)?;
        let access = self.region.read_u32(OFF_ACCESS)?;
        if magic != MEM_IPC_MAGIC || access != 1 {
            kerror!("{}: ERR! magic:{:#x} access:{} after reset", self.name(), magic, access);
            return Err(LinkError::AccessDenied { magic, access });
        }
        kdebug!("{}: IPC link reset", self.name());
        Ok(())
    }

    /// The CP watchdog fired.
    pub fn on_watchdog(&self) {
        let state = self.state();
        if state.is_crashed() {
            kdebug!("{}: watchdog while {}", self.name(), state);
            return;
        }
        kerror!("{}: CP watchdog expired (state {})", self.name(), state);
        self.transition(LinkState::CrashWatchdog);
        self.handle_cp_crash(LinkState::CrashWatchdog);
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use super::*;
    use crate::sim::testing::{booted_pair, pair, test_config, Event};
    use shmlink_core::wire::{CH_FMT_0, CH_RFS_0};

    #[test]
    fn test_cp_crash_exit_is_not_answered() {
        let (link, cp, events) = booted_pair();
        link.enqueue(CH_FMT_0, b"lost").unwrap();
        events.take();
        let sent_before = cp.doorbells().len();

        cp.send_cmd(Command::CrashExit).unwrap();
        link.poll_irqs().unwrap();

        assert_eq!(link.state(), LinkState::CrashExit);
        assert!(!link.ring_table().unwrap().has_pending_tx());
        assert!(!link.sbd_active());
        assert_eq!(link.region().read_u32(OFF_MAGIC).unwrap(), MEM_CRASH_MAGIC);
        let seen = events.take();
        assert!(seen.contains(&Event::State(LinkState::Online, LinkState::CrashExit)));
        assert!(seen.contains(&Event::Down(LinkState::CrashExit)));
        assert!(seen.contains(&Event::Stop(CH_FMT_0)));
        assert_eq!(link.diagnostics().last_crash().unwrap().reason, LinkState::CrashExit);

        cp.poll().unwrap();
        assert_eq!(cp.doorbells().len(), sent_before);
    }

    #[test]
    fn test_forced_crash_acked() {
        let (link, cp, events) = booted_pair();
        link.force_crash("test");
        assert!(link.crash_in_progress());
        assert!(!link.ipc_active());
        assert!(link.next_deadline().is_some());
        link.force_crash("again");

        cp.poll().unwrap();
        assert_eq!(cp.commands_seen(Command::CrashExit), 1);

        cp.send_cmd(Command::CrashExit).unwrap();
        link.poll_irqs().unwrap();
        assert_eq!(link.state(), LinkState::CrashExit);
        assert!(!link.crash_in_progress());
        assert!(link.next_deadline().is_none());
        assert!(events.take().contains(&Event::Down(LinkState::CrashExit)));
    }

    #[test]
    fn test_crash_ack_timeout() {
        let (link, _cp, events) = booted_pair();
        link.force_crash("no answer");
        let fired = link.run_timers(Instant::now() + link.config().crash_ack_timeout + Duration::from_millis(1));
        assert_eq!(fired, 1);
        assert_eq!(link.state(), LinkState::CrashExit);
        assert!(events.take().contains(&Event::Down(LinkState::CrashExit)));
    }

    #[test]
    fn test_crash_reset_goes_offline() {
        let (link, cp, events) = booted_pair();
        cp.send_cmd(Command::CrashReset).unwrap();
        link.poll_irqs().unwrap();
        assert_eq!(link.state(), LinkState::Offline);
        assert!(events.take().contains(&Event::Down(LinkState::CrashReset)));
    }

    #[test]
    fn test_phone_start_waits_for_consumers() {
        let (link, cp, _events) = pair(test_config());
        link.boot_on();
        cp.send_cmd(Command::InitStart).unwrap();
        link.poll_irqs().unwrap();
        cp.poll().unwrap();
        assert_eq!(cp.commands_seen(Command::PifInitDone), 1);

        cp.send_cmd(Command::PhoneStart).unwrap();
        link.poll_irqs().unwrap();
        assert_eq!(link.state(), LinkState::Booting);
        assert_eq!(link.region().read_u32(OFF_MAGIC).unwrap(), MEM_IPC_MAGIC);

        link.open_channel(CH_FMT_0).unwrap();
        assert_eq!(link.state(), LinkState::Booting);
        link.open_channel(CH_RFS_0).unwrap();
        assert_eq!(link.state(), LinkState::Online);
        assert!(link.wait_boot_complete(Duration::from_millis(1)).is_ok());
        cp.poll().unwrap();
        assert_eq!(cp.commands_seen(Command::InitEnd), 1);
    }

    #[test]
    fn test_abnormal_phone_start_escalates() {
        let (link, cp, _events) = booted_pair();
        let limit = link.config().abnormal_phone_start_limit;
        for _ in 0..limit {
            cp.send_cmd(Command::PhoneStart).unwrap();
            link.poll_irqs().unwrap();
        }
        cp.poll().unwrap();
        // One INIT_END from the boot plus one per tolerated repeat.
        assert_eq!(cp.commands_seen(Command::InitEnd), 1 + limit as usize);
        assert!(!link.crash_in_progress());

        cp.send_cmd(Command::PhoneStart).unwrap();
        link.poll_irqs().unwrap();
        assert!(link.crash_in_progress());
        cp.poll().unwrap();
        assert_eq!(cp.commands_seen(Command::CrashExit), 1);
    }

    #[test]
    fn test_unknown_command() {
        let (link, _cp, _events) = booted_pair();
        assert_eq!(link.handle_command(0x3E), Err(LinkError::UnknownCommand(0x3E)));
        assert_eq!(link.state(), LinkState::Online);
    }

    #[test]
    fn test_watchdog() {
        let (link, _cp, events) = booted_pair();
        link.on_watchdog();
        assert_eq!(link.state(), LinkState::CrashWatchdog);
        assert!(events.take().contains(&Event::Down(LinkState::CrashWatchdog)));
        link.on_watchdog();
        assert_eq!(link.state(), LinkState::CrashWatchdog);
    }
}
