//! Memory barriers at shared-memory transfer boundaries.
//!
//! Payload bytes are written with plain (volatile) stores; the pointer that
//! publishes them is written afterwards. `wmb` sits between the two,
//! `mb` after the publish, `rmb` between reading a pointer and reading the
//! bytes it covers.

use core::sync::atomic::{compiler_fence, fence, Ordering};

cfg_if::cfg_if! {
    if #[cfg(any(target_arch = "x86", target_arch = "x86_64"))] {
        // TSO: stores are not reordered with older stores, loads not with
        // older loads. Only the compiler has to be held back.
        #[inline(always)]
        pub fn wmb() {
            compiler_fence(Ordering::Release);
        }

        #[inline(always)]
        pub fn rmb() {
            compiler_fence(Ordering::Acquire);
        }
    } else {
        #[inline(always)]
        pub fn wmb() {
            fence(Ordering::Release);
        }

        #[inline(always)]
        pub fn rmb() {
            fence(Ordering::Acquire);
        }
    }
}

/// Full barrier. Commits an item before the peer is signalled.
#[inline(always)]
pub fn mb() {
    fence(Ordering::SeqCst);
}
