//! Link lifecycle state and ring direction.

use std::fmt;

/// Link-wide state. One authoritative copy per link, changed only under the
/// link's state lock.
///
/// ```text
/// OFFLINE → BOOTING → ONLINE → CRASH_RESET ─┐
///                        │   → CRASH_WATCHDOG → OFFLINE (next boot)
///                        └──→ CRASH_EXIT (terminal until re-boot)
/// ```
#[repr(u8)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum LinkState {
    #[default]
    Offline = 0,
    Booting = 1,
    Online = 2,
    CrashReset = 3,
    CrashExit = 4,
    CrashWatchdog = 5,
}

impl LinkState {
    /// Data may flow only while ONLINE.
    #[inline]
    pub fn is_online(self) -> bool {
        self == Self::Online
    }

    #[inline]
    pub fn is_crashed(self) -> bool {
        matches!(self, Self::CrashReset | Self::CrashExit | Self::CrashWatchdog)
    }

    /// Interrupts are worth classifying: the CP is running (or booting).
    #[inline]
    pub fn rx_possible(self) -> bool {
        matches!(self, Self::Booting | Self::Online)
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Offline => "OFFLINE",
            Self::Booting => "BOOTING",
            Self::Online => "ONLINE",
            Self::CrashReset => "CRASH_RESET",
            Self::CrashExit => "CRASH_EXIT",
            Self::CrashWatchdog => "CRASH_WATCHDOG",
        }
    }
}

impl From<u8> for LinkState {
    fn from(v: u8) -> Self {
        match v {
            0 => Self::Offline,
            1 => Self::Booting,
            2 => Self::Online,
            3 => Self::CrashReset,
            4 => Self::CrashExit,
            _ => Self::CrashWatchdog,
        }
    }
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Ring direction, seen from the AP.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// AP → CP. AP owns the write pointer.
    Ul = 0,
    /// CP → AP. AP owns the read pointer.
    Dl = 1,
}

impl Direction {
    pub const BOTH: [Direction; 2] = [Direction::Ul, Direction::Dl];

    #[inline]
    pub fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Ul => "UL",
            Self::Dl => "DL",
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_from_u8() {
        for s in [
            LinkState::Offline,
            LinkState::Booting,
            LinkState::Online,
            LinkState::CrashReset,
            LinkState::CrashExit,
            LinkState::CrashWatchdog,
        ] {
            assert_eq!(LinkState::from(s as u8), s);
        }
    }

    #[test]
    fn test_state_predicates() {
        assert!(LinkState::Online.is_online());
        assert!(LinkState::Booting.rx_possible());
        assert!(!LinkState::Offline.rx_possible());
        assert!(LinkState::CrashExit.is_crashed());
        assert!(!LinkState::Booting.is_crashed());
    }
}
