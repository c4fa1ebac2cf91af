//! # shmlink-core: Definitions for the AP↔CP shared-memory link
//!
//! This crate holds everything both sides of the link agree on and every
//! seam the rest of the stack is written against:
//!
//! - ring arithmetic over `(capacity, head, tail)` (`circ`)
//! - bit-exact doorbell words, command codes, size fields, link header and
//!   IOSM records (`wire`)
//! - link state, error taxonomy, configuration
//! - collaborator traits: `Mailbox`, `CellAllocator`, `LinkEvents`
//! - small synchronization primitives used from both execution contexts
//!   (`SpinLock`, `AtomicBitmap`, `StopMask`, `Completion`)
//!
//! Nothing here touches a mapping. The shared region, rings and protocol
//! engines live in `shmlink-module`; the interrupt classifier and worker
//! loop live in `shmlink-executor`.

pub mod kprint;
pub mod env;
pub mod config;
pub mod error;
pub mod circ;
pub mod wire;
pub mod state;
pub mod spinlock;
pub mod bitmap;
pub mod stopmask;
pub mod completion;
pub mod barrier;
pub mod mailbox;
pub mod cell;
pub mod frame;
pub mod events;

pub use error::{LinkError, Result, Severity};
pub use state::{Direction, LinkState};
