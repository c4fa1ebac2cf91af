//! `RegisterMailbox`: default `Mailbox` implementation.
//!
//! Models the mailbox block as three 16-bit registers in process memory
//! plus an eventfd per direction standing in for the interrupt line.
//! Doorbell words are also queued per direction so a burst of doorbells is
//! not collapsed into the last register value; real hardware would latch
//! pending bits instead.
//!
//! The AP side implements `Mailbox`; `CpMailbox` is the other end, used by
//! the CP simulator.

use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_queue::ArrayQueue;

use shmlink_core::error::{LinkError, Result};
use shmlink_core::mailbox::Mailbox;

/// Doorbell words kept per direction before the oldest is dropped.
pub const DEFAULT_DOORBELL_DEPTH: usize = 256;

/// Owned eventfd used as an interrupt line.
pub struct EventFd {
    fd: RawFd,
}

impl EventFd {
    pub fn create() -> Result<Self> {
        let fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        if fd < 0 {
            return Err(LinkError::Os(nix::errno::Errno::last() as i32));
        }
        Ok(Self { fd })
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    /// Raise the line. Repeated raises before a drain coalesce.
    pub fn signal(&self) -> Result<()> {
        let val: u64 = 1;
        let ret = unsafe {
            libc::write(
                self.fd,
                &val as *const u64 as *const libc::c_void,
                std::mem::size_of::<u64>(),
            )
        };
        if ret < 0 {
            let errno = nix::errno::Errno::last();
            // Counter saturated: a wakeup is already pending.
            if errno == nix::errno::Errno::EAGAIN {
                return Ok(());
            }
            return Err(LinkError::Os(errno as i32));
        }
        Ok(())
    }

    /// Clear the line, returning how many raises were pending.
    pub fn drain(&self) -> u64 {
        let mut val: u64 = 0;
        let ret = unsafe {
            libc::read(
                self.fd,
                &mut val as *mut u64 as *mut libc::c_void,
                std::mem::size_of::<u64>(),
            )
        };
        if ret < 0 {
            0
        } else {
            val
        }
    }

    /// Block until raised or `timeout` passes. Does not clear the line.
    pub fn wait(&self, timeout: Duration) -> bool {
        let mut pfd = libc::pollfd {
            fd: self.fd,
            events: libc::POLLIN,
            revents: 0,
        };
        let ms = timeout.as_millis().min(i32::MAX as u128) as i32;
        let ret = unsafe { libc::poll(&mut pfd, 1, ms) };
        ret > 0 && pfd.revents & libc::POLLIN != 0
    }
}

impl Drop for EventFd {
    fn drop(&mut self) {
        if self.fd >= 0 {
            unsafe {
                libc::close(self.fd);
            }
            self.fd = -1;
        }
    }
}

struct Registers {
    int2ap: AtomicU16,
    int2cp: AtomicU16,
    status: AtomicU16,
    link_active: AtomicBool,
    to_ap: ArrayQueue<u16>,
    to_cp: ArrayQueue<u16>,
    ap_irq: EventFd,
    cp_irq: EventFd,
}

/// AP end of the register block.
pub struct RegisterMailbox {
    regs: Arc<Registers>,
}

/// CP end of the register block.
pub struct CpMailbox {
    regs: Arc<Registers>,
}

impl RegisterMailbox {
    /// Create both ends of one mailbox.
    pub fn pair(depth: usize) -> Result<(RegisterMailbox, CpMailbox)> {
        let regs = Arc::new(Registers {
            int2ap: AtomicU16::new(0),
            int2cp: AtomicU16::new(0),
            status: AtomicU16::new(0),
            link_active: AtomicBool::new(true),
            to_ap: ArrayQueue::new(depth.max(1)),
            to_cp: ArrayQueue::new(depth.max(1)),
            ap_irq: EventFd::create()?,
            cp_irq: EventFd::create()?,
        });
        Ok((RegisterMailbox { regs: regs.clone() }, CpMailbox { regs }))
    }

    /// Wait for an AP interrupt.
    pub fn wait_irq(&self, timeout: Duration) -> bool {
        self.regs.ap_irq.wait(timeout)
    }

    pub fn irq_fd(&self) -> RawFd {
        self.regs.ap_irq.fd()
    }
}

impl Mailbox for RegisterMailbox {
    fn read_int2ap(&self) -> u16 {
        self.regs.int2ap.load(Ordering::Acquire)
    }

    fn read_int2cp(&self) -> u16 {
        self.regs.int2cp.load(Ordering::Acquire)
    }

    fn read_status(&self) -> u16 {
        self.regs.status.load(Ordering::Acquire)
    }

    fn send_int2cp(&self, value: u16) -> Result<()> {
        self.regs.int2cp.store(value, Ordering::Release);
        self.regs.to_cp.force_push(value);
        self.regs.cp_irq.signal()
    }

    fn take_irq(&self) -> Option<u16> {
        let word = self.regs.to_ap.pop();
        if self.regs.to_ap.is_empty() {
            self.regs.ap_irq.drain();
        }
        word
    }

    fn link_active(&self) -> bool {
        self.regs.link_active.load(Ordering::Acquire)
    }
}

impl CpMailbox {
    /// Write `value` to int2ap and interrupt the AP.
    pub fn send_int2ap(&self, value: u16) -> Result<()> {
        self.regs.int2ap.store(value, Ordering::Release);
        self.regs.to_ap.force_push(value);
        self.regs.ap_irq.signal()
    }

    /// Next doorbell word sent by the AP.
    pub fn take_int2cp(&self) -> Option<u16> {
        let word = self.regs.to_cp.pop();
        if self.regs.to_cp.is_empty() {
            self.regs.cp_irq.drain();
        }
        word
    }

    pub fn set_status(&self, status: u16) {
        self.regs.status.store(status, Ordering::Release);
    }

    pub fn status(&self) -> u16 {
        self.regs.status.load(Ordering::Acquire)
    }

    /// Simulate the physical link dropping (or coming back).
    pub fn set_link_active(&self, on: bool) {
        self.regs.link_active.store(on, Ordering::Release);
    }

    pub fn wait_irq(&self, timeout: Duration) -> bool {
        self.regs.cp_irq.wait(timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shmlink_core::wire::{cmd2int, Command};

    #[test]
    fn test_doorbells_queue_in_order() {
        let (ap, cp) = RegisterMailbox::pair(8).unwrap();
        ap.send_int2cp(0x81).unwrap();
        ap.send_int2cp(Command::InitEnd.to_int()).unwrap();
        assert_eq!(ap.read_int2cp(), cmd2int(0x2));
        assert!(cp.wait_irq(Duration::from_millis(10)));
        assert_eq!(cp.take_int2cp(), Some(0x81));
        assert_eq!(cp.take_int2cp(), Some(cmd2int(0x2)));
        assert_eq!(cp.take_int2cp(), None);
        assert!(!cp.wait_irq(Duration::from_millis(1)));
    }

    #[test]
    fn test_ap_irq_and_status() {
        let (ap, cp) = RegisterMailbox::pair(8).unwrap();
        assert!(ap.take_irq().is_none());
        cp.set_status(0x4);
        cp.send_int2ap(0x81).unwrap();
        assert!(ap.wait_irq(Duration::from_millis(10)));
        assert_eq!(ap.read_status(), 0x4);
        assert_eq!(ap.take_irq(), Some(0x81));
        assert!(!ap.wait_irq(Duration::from_millis(1)));
    }

    #[test]
    fn test_overflow_keeps_newest() {
        let (ap, cp) = RegisterMailbox::pair(2).unwrap();
        for v in 1..=3u16 {
            cp.send_int2ap(0x80 | v).unwrap();
        }
        assert_eq!(ap.take_irq(), Some(0x82));
        assert_eq!(ap.take_irq(), Some(0x83));
    }

    #[test]
    fn test_link_active_flag() {
        let (ap, cp) = RegisterMailbox::pair(2).unwrap();
        assert!(ap.link_active());
        cp.set_link_active(false);
        assert!(!ap.link_active());
    }
}
