//! # shmlink-module: Default implementations
//!
//! Everything that touches the shared mapping lives here. `LinkDevice` is
//! the single context each operation runs against; the other modules are
//! either the data structures it owns or `impl LinkDevice` blocks for one
//! protocol each.
//!
//! ## Default stack
//!
//! | Seam / part      | Default Impl        | Notes                          |
//! |------------------|---------------------|--------------------------------|
//! | shared memory    | SharedRegion        | anonymous mmap or adopted base |
//! | Mailbox          | RegisterMailbox     | eventfd doorbells, queued words|
//! | CellAllocator    | BitmapCellPool      | zero-copy DL cells             |
//! | legacy queues    | LegacyIpc           | FMT/RAW byte queues            |
//! | SBD rings        | SbdRing + RingTable | per-channel UL/DL descriptors  |
//! | zero-copy DL     | ZeroCopyAdaptor     | pool cells handed to the CP    |
//! | control messages | IOSM (`iosm`)       | when `LinkConfig::iosm` is set |
//! | CP peer          | CpPeer (`sim`)      | software modem for tests/smoke |

pub mod region;
pub mod layout;
pub mod mailbox;
pub mod legacy;
pub mod sbd;
pub mod zerocopy;
pub mod link;
pub mod sbd_link;
pub mod flow;
pub mod command;
pub mod iosm;
pub mod snapshot;
pub mod sim;

pub use link::{IrqKind, IrqWork, LinkBuilder, LinkDevice};
pub use mailbox::{CpMailbox, RegisterMailbox};
pub use region::SharedRegion;
