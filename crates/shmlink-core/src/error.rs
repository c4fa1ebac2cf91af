//! Link error types.

use std::fmt;

/// Error class, deciding who handles the failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// Caller retries or escalates (ring full/empty, busy, boot timeout).
    Transient,
    /// Scoped to one ring or channel; logged and the operation aborts.
    Protocol,
    /// Link goes down.
    Fatal,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkError {
    /// Not enough free slots/bytes in the ring.
    NoSpace { ring: u16, need: u32, space: u32 },
    /// Ring is flow-controlled (waiting for the peer's ack).
    Busy(u16),
    /// Payload larger than what the ring can carry in one frame.
    TooLarge { len: usize, max: usize },
    /// Head or tail outside `[0, capacity)`.
    Dirty { ring: u16, capacity: u32, head: u32, tail: u32 },
    /// Link is not ONLINE (or rings not built yet).
    Inactive,
    /// Ring id / channel never configured.
    NoSuchChannel(u16),
    /// Ring table has not been built.
    NotInitialized,
    /// Peer did not respond within the probe/completion budget.
    Timeout(&'static str),
    /// Magic/access handshake words did not read back.
    AccessDenied { magic: u32, access: u32 },
    /// Command code not handled by the state machine.
    UnknownCommand(u16),
    /// IOSM message id with no handler.
    UnknownMessage(u8),
    /// Reply does not match any outstanding request.
    TransactionMismatch { msg: u8, expected: u8, got: u8 },
    /// A request of this kind/channel is still waiting for its ACK.
    RequestPending { msg: u8, ch: u8 },
    /// Malformed descriptor, offset or header read from shared memory.
    Protocol(&'static str),
    /// Zero-copy cell pool has no free cells.
    AllocExhausted,
    /// Offset/length outside the shared region.
    OutOfBounds { offset: usize, len: usize, size: usize },
    /// Invalid configuration.
    Config(&'static str),
    /// Peer crashed or a forced crash is in progress.
    Crashed,
    /// mmap failed.
    MmapFailed(i32),
    /// OS error with errno.
    Os(i32),
}

impl LinkError {
    pub fn severity(&self) -> Severity {
        match self {
            Self::NoSpace { .. }
            | Self::Busy(_)
            | Self::Inactive
            | Self::Timeout(_)
            | Self::AllocExhausted
            | Self::RequestPending { .. } => Severity::Transient,
            Self::Crashed | Self::AccessDenied { .. } | Self::MmapFailed(_) => Severity::Fatal,
            _ => Severity::Protocol,
        }
    }

    /// Negative errno equivalent, for callers bridging to a C ABI.
    pub fn errno(&self) -> i32 {
        -match self {
            Self::NoSpace { .. } => libc_errno::ENOSPC,
            Self::Busy(_) | Self::RequestPending { .. } => libc_errno::EBUSY,
            Self::TooLarge { .. } => libc_errno::EMSGSIZE,
            Self::Dirty { .. } | Self::OutOfBounds { .. } => libc_errno::EIO,
            Self::Inactive | Self::Crashed => libc_errno::ENOLINK,
            Self::NoSuchChannel(_) | Self::NotInitialized => libc_errno::ENODEV,
            Self::Timeout(_) => libc_errno::ETIMEDOUT,
            Self::AccessDenied { .. } => libc_errno::EACCES,
            Self::UnknownCommand(_) | Self::Config(_) => libc_errno::EINVAL,
            Self::UnknownMessage(_) | Self::TransactionMismatch { .. } | Self::Protocol(_) => {
                libc_errno::EPROTO
            }
            Self::AllocExhausted => libc_errno::ENOMEM,
            Self::MmapFailed(e) | Self::Os(e) => *e,
        }
    }
}

// Linux values; the core crate has no libc dependency.
mod libc_errno {
    pub const EIO: i32 = 5;
    pub const ENOMEM: i32 = 12;
    pub const EACCES: i32 = 13;
    pub const EBUSY: i32 = 16;
    pub const ENODEV: i32 = 19;
    pub const EINVAL: i32 = 22;
    pub const ENOSPC: i32 = 28;
    pub const ENOLINK: i32 = 67;
    pub const EPROTO: i32 = 71;
    pub const EMSGSIZE: i32 = 90;
    pub const ETIMEDOUT: i32 = 110;
}

impl fmt::Display for LinkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoSpace { ring, need, space } => {
                write!(f, "ring {}: no space (need {}, space {})", ring, need, space)
            }
            Self::Busy(ring) => write!(f, "ring {}: busy", ring),
            Self::TooLarge { len, max } => write!(f, "payload {} exceeds {}", len, max),
            Self::Dirty { ring, capacity, head, tail } => write!(
                f,
                "ring {}: dirty (qsize {} head {} tail {})",
                ring, capacity, head, tail
            ),
            Self::Inactive => write!(f, "link inactive"),
            Self::NoSuchChannel(ch) => write!(f, "no ring for channel {}", ch),
            Self::NotInitialized => write!(f, "ring table not initialized"),
            Self::Timeout(what) => write!(f, "timeout waiting for {}", what),
            Self::AccessDenied { magic, access } => {
                write!(f, "handshake failed (magic {:#010x} access {})", magic, access)
            }
            Self::UnknownCommand(cmd) => write!(f, "unknown command {:#06x}", cmd),
            Self::UnknownMessage(id) => write!(f, "unknown IOSM message {:#04x}", id),
            Self::TransactionMismatch { msg, expected, got } => write!(
                f,
                "IOSM reply to {:#04x}: trans id {} (expected {})",
                msg, got, expected
            ),
            Self::RequestPending { msg, ch } => {
                write!(f, "IOSM {:#04x} on ch {} still awaiting ack", msg, ch)
            }
            Self::Protocol(what) => write!(f, "protocol violation: {}", what),
            Self::AllocExhausted => write!(f, "cell pool exhausted"),
            Self::OutOfBounds { offset, len, size } => write!(
                f,
                "access [{:#x}, +{}) outside region of {} bytes",
                offset, len, size
            ),
            Self::Config(what) => write!(f, "bad config: {}", what),
            Self::Crashed => write!(f, "peer crashed"),
            Self::MmapFailed(e) => write!(f, "mmap failed: errno {}", e),
            Self::Os(e) => write!(f, "OS error: errno {}", e),
        }
    }
}

impl std::error::Error for LinkError {}

pub type Result<T> = std::result::Result<T, LinkError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_severity_classes() {
        assert_eq!(LinkError::Busy(3).severity(), Severity::Transient);
        assert_eq!(
            LinkError::Dirty { ring: 0, capacity: 8, head: 9, tail: 0 }.severity(),
            Severity::Protocol
        );
        assert_eq!(LinkError::UnknownCommand(0x3F).severity(), Severity::Protocol);
        assert_eq!(LinkError::Crashed.severity(), Severity::Fatal);
    }

    #[test]
    fn test_errno_mapping() {
        assert_eq!(LinkError::NoSpace { ring: 1, need: 2, space: 0 }.errno(), -28);
        assert_eq!(LinkError::Dirty { ring: 0, capacity: 8, head: 8, tail: 0 }.errno(), -5);
        assert_eq!(LinkError::Os(4).errno(), -4);
    }

    #[test]
    fn test_display() {
        let e = LinkError::TransactionMismatch { msg: 0x24, expected: 7, got: 9 };
        assert_eq!(e.to_string(), "IOSM reply to 0x24: trans id 9 (expected 7)");
    }
}
