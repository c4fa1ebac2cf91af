//! Circular queue arithmetic.
//!
//! Every ring in the link (legacy byte queues, SBD descriptor rings, the IOSM
//! message areas) is described by `(qsize, head, tail)` where `head` is the
//! producer's write index and `tail` the consumer's read index. One slot is
//! always left unused so that `head == tail` unambiguously means empty:
//!
//! ```text
//!   usage + space == qsize - 1
//! ```
//!
//! The free functions are pure and do not check preconditions; callers check
//! `circ_valid` and the space/usage they need first. `CircQueue` bundles those
//! checks for byte queues.

use crate::error::{LinkError, Result};

/// Both indices inside `[0, qsize)`.
#[inline]
pub fn circ_valid(qsize: u32, head: u32, tail: u32) -> bool {
    head < qsize && tail < qsize
}

#[inline]
pub fn circ_empty(head: u32, tail: u32) -> bool {
    head == tail
}

/// Number of occupied units between `tail` and `head`.
#[inline]
pub fn circ_get_usage(qsize: u32, head: u32, tail: u32) -> u32 {
    if head >= tail {
        head - tail
    } else {
        qsize - tail + head
    }
}

/// Free units, keeping one in reserve.
#[inline]
pub fn circ_get_space(qsize: u32, head: u32, tail: u32) -> u32 {
    qsize
        .saturating_sub(circ_get_usage(qsize, head, tail))
        .saturating_sub(1)
}

/// Pointer `p` advanced by `len` with wraparound.
#[inline]
pub fn circ_new_ptr(qsize: u32, p: u32, len: u32) -> u32 {
    if qsize == 0 {
        return 0;
    }
    ((p as u64 + len as u64) % qsize as u64) as u32
}

/// Split a `len`-unit transfer starting at `p` into at most two contiguous
/// `(start, len)` pieces. The second piece is empty unless the transfer
/// crosses the end of the buffer.
#[inline]
pub fn circ_segments(qsize: u32, p: u32, len: u32) -> [(u32, u32); 2] {
    let first = len.min(qsize.saturating_sub(p));
    [(p, first), (0, len - first)]
}

/// Copy `src` into `ring` starting at `head`, wrapping once if needed.
pub fn circ_write(ring: &mut [u8], head: u32, src: &[u8]) {
    let qsize = ring.len() as u32;
    let mut done = 0usize;
    for (start, n) in circ_segments(qsize, head, src.len() as u32) {
        let (start, n) = (start as usize, n as usize);
        ring[start..start + n].copy_from_slice(&src[done..done + n]);
        done += n;
    }
}

/// Copy `dst.len()` bytes out of `ring` starting at `tail`.
pub fn circ_read(ring: &[u8], tail: u32, dst: &mut [u8]) {
    let qsize = ring.len() as u32;
    let mut done = 0usize;
    for (start, n) in circ_segments(qsize, tail, dst.len() as u32) {
        let (start, n) = (start as usize, n as usize);
        dst[done..done + n].copy_from_slice(&ring[start..start + n]);
        done += n;
    }
}

/// A snapshot of one ring's pointers.
///
/// Built from values read out of shared memory; the caller writes the
/// updated pointer back after a successful push/pop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircQueue {
    pub id: u16,
    pub qsize: u32,
    pub head: u32,
    pub tail: u32,
}

impl CircQueue {
    pub fn new(id: u16, qsize: u32, head: u32, tail: u32) -> Self {
        Self { id, qsize, head, tail }
    }

    /// `Err(Dirty)` when either pointer is out of range.
    pub fn check(&self) -> Result<()> {
        if circ_valid(self.qsize, self.head, self.tail) {
            Ok(())
        } else {
            Err(LinkError::Dirty {
                ring: self.id,
                capacity: self.qsize,
                head: self.head,
                tail: self.tail,
            })
        }
    }

    pub fn is_empty(&self) -> bool {
        circ_empty(self.head, self.tail)
    }

    pub fn usage(&self) -> u32 {
        circ_get_usage(self.qsize, self.head, self.tail)
    }

    pub fn space(&self) -> u32 {
        circ_get_space(self.qsize, self.head, self.tail)
    }

    /// Producer side: write `src` at head and advance head.
    pub fn push_bytes(&mut self, ring: &mut [u8], src: &[u8]) -> Result<()> {
        self.check()?;
        let len = src.len() as u32;
        let space = self.space();
        if len > space {
            return Err(LinkError::NoSpace { ring: self.id, need: len, space });
        }
        circ_write(ring, self.head, src);
        self.head = circ_new_ptr(self.qsize, self.head, len);
        Ok(())
    }

    /// Consumer side: fill `dst` from tail and advance tail.
    pub fn pop_bytes(&mut self, ring: &[u8], dst: &mut [u8]) -> Result<()> {
        self.check()?;
        let len = dst.len() as u32;
        let usage = self.usage();
        if len > usage {
            return Err(LinkError::Protocol("read past producer"));
        }
        circ_read(ring, self.tail, dst);
        self.tail = circ_new_ptr(self.qsize, self.tail, len);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_usage_plus_space_invariant() {
        for qsize in 1..=16u32 {
            for head in 0..qsize {
                for tail in 0..qsize {
                    let usage = circ_get_usage(qsize, head, tail);
                    let space = circ_get_space(qsize, head, tail);
                    assert_eq!(usage + space, qsize - 1, "q{} h{} t{}", qsize, head, tail);
                }
            }
        }
    }

    #[test]
    fn test_scenario_capacity8_head6_tail2() {
        let mut q = CircQueue::new(0, 8, 6, 2);
        assert_eq!(q.usage(), 4);
        assert_eq!(q.space(), 3);

        let mut ring = [0u8; 8];
        q.push_bytes(&mut ring, b"abc").unwrap();
        assert_eq!(q.space(), 0);
        assert_eq!(q.head, 1);
        assert_eq!(&ring[6..8], b"ab");
        assert_eq!(ring[0], b'c');

        let err = q.push_bytes(&mut ring, b"d").unwrap_err();
        assert_eq!(err, LinkError::NoSpace { ring: 0, need: 1, space: 0 });
        assert_eq!(q.head, 1);
    }

    #[test]
    fn test_new_ptr_is_pure() {
        let a = circ_new_ptr(8, 6, 3);
        let b = circ_new_ptr(8, 6, 3);
        assert_eq!(a, 1);
        assert_eq!(a, b);
        assert_eq!(circ_new_ptr(8, 7, 0), 7);
        assert_eq!(circ_new_ptr(8, 7, 8), 7);
        assert_eq!(circ_new_ptr(0, 3, 1), 0);
    }

    #[test]
    fn test_segments_split_at_wrap() {
        assert_eq!(circ_segments(8, 2, 4), [(2, 4), (0, 0)]);
        assert_eq!(circ_segments(8, 6, 4), [(6, 2), (0, 2)]);
        assert_eq!(circ_segments(8, 0, 7), [(0, 7), (0, 0)]);
    }

    #[test]
    fn test_write_then_read_across_wrap() {
        for start in 0..16u32 {
            let mut ring = [0u8; 16];
            let mut q = CircQueue::new(1, 16, start, start);
            let payload: Vec<u8> = (0..11u8).map(|b| b.wrapping_mul(37)).collect();
            q.push_bytes(&mut ring, &payload).unwrap();
            assert_eq!(q.usage(), 11);

            let mut out = vec![0u8; payload.len()];
            q.pop_bytes(&ring, &mut out).unwrap();
            assert_eq!(out, payload, "start {}", start);
            assert!(q.is_empty());
        }
    }

    #[test]
    fn test_dirty_pointers_rejected() {
        let mut ring = [0u8; 8];
        let mut q = CircQueue::new(5, 8, 8, 0);
        assert!(matches!(q.check(), Err(LinkError::Dirty { ring: 5, .. })));
        assert!(q.push_bytes(&mut ring, b"x").is_err());

        let mut q = CircQueue::new(5, 8, 0, 200);
        let mut out = [0u8; 1];
        assert!(matches!(q.pop_bytes(&ring, &mut out), Err(LinkError::Dirty { .. })));
    }

    #[test]
    fn test_pop_more_than_available() {
        let ring = [0u8; 8];
        let mut q = CircQueue::new(0, 8, 3, 1);
        let mut out = [0u8; 3];
        assert!(q.pop_bytes(&ring, &mut out).is_err());
        assert_eq!(q.tail, 1);
    }
}
