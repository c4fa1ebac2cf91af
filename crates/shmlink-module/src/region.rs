//! `SharedRegion`: the shared-memory window seen by both processors.
//!
//! Everything the link puts in shared memory is addressed by a byte offset
//! from the region base. Offsets come from the peer as often as from us, so
//! every accessor checks bounds (and alignment, for atomics) before touching
//! memory and reports `OutOfBounds` instead of faulting.
//!
//! # Ownership
//!
//! - `anonymous()` maps `MAP_SHARED | MAP_ANONYMOUS` memory and unmaps it on
//!   drop. Used for tests, the CP simulator and the zero-copy cell pool.
//! - `from_raw()` wraps a mapping owned by someone else (a device window).
//!
//! # Access model
//!
//! Payload bytes are copied with volatile-free `copy_nonoverlapping`;
//! ordering against the peer comes from the barriers in
//! `shmlink_core::barrier` plus Release/Acquire on the pointer words.

use std::ptr;
use std::sync::atomic::{AtomicU16, AtomicU32};

use shmlink_core::circ::circ_segments;
use shmlink_core::error::{LinkError, Result};

pub struct SharedRegion {
    base: *mut u8,
    size: usize,
    owned: bool,
}

// Safety: the region is plain memory shared with another processor.
// Concurrent access is coordinated by the ring protocol (single writer per
// field) and by atomics on the pointer words.
unsafe impl Send for SharedRegion {}
unsafe impl Sync for SharedRegion {}

impl SharedRegion {
    /// Map `size` bytes of zeroed, shareable anonymous memory.
    pub fn anonymous(size: usize) -> Result<Self> {
        if size == 0 {
            return Err(LinkError::Config("region size is zero"));
        }
        let base = unsafe {
            libc::mmap(
                ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(LinkError::MmapFailed(nix::errno::Errno::last() as i32));
        }
        Ok(Self {
            base: base as *mut u8,
            size,
            owned: true,
        })
    }

    /// Wrap an existing mapping. Not unmapped on drop.
    ///
    /// # Safety
    /// - `base` must be valid for reads and writes of `size` bytes.
    /// - The mapping must outlive this struct.
    pub unsafe fn from_raw(base: *mut u8, size: usize) -> Result<Self> {
        if base.is_null() || size == 0 {
            return Err(LinkError::Config("null or empty region"));
        }
        Ok(Self {
            base,
            size,
            owned: false,
        })
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    #[inline]
    fn check(&self, offset: usize, len: usize) -> Result<()> {
        match offset.checked_add(len) {
            Some(end) if end <= self.size => Ok(()),
            _ => Err(LinkError::OutOfBounds {
                offset,
                len,
                size: self.size,
            }),
        }
    }

    #[inline]
    fn check_aligned(&self, offset: usize, len: usize) -> Result<()> {
        self.check(offset, len)?;
        if (self.base as usize + offset) % len != 0 {
            return Err(LinkError::Protocol("misaligned pointer word"));
        }
        Ok(())
    }

    /// The 16-bit word at `offset` (ring pointers).
    #[inline]
    pub fn atomic_u16(&self, offset: usize) -> Result<&AtomicU16> {
        self.check_aligned(offset, 2)?;
        // Safety: in bounds, aligned, lives as long as &self.
        Ok(unsafe { &*(self.base.add(offset) as *const AtomicU16) })
    }

    /// The 32-bit word at `offset` (magic, access, queue pointers, indices).
    #[inline]
    pub fn atomic_u32(&self, offset: usize) -> Result<&AtomicU32> {
        self.check_aligned(offset, 4)?;
        // Safety: in bounds, aligned, lives as long as &self.
        Ok(unsafe { &*(self.base.add(offset) as *const AtomicU32) })
    }

    pub fn read_u8(&self, offset: usize) -> Result<u8> {
        self.check(offset, 1)?;
        Ok(unsafe { ptr::read_volatile(self.base.add(offset)) })
    }

    pub fn write_u8(&self, offset: usize, v: u8) -> Result<()> {
        self.check(offset, 1)?;
        unsafe { ptr::write_volatile(self.base.add(offset), v) };
        Ok(())
    }

    pub fn read_u16(&self, offset: usize) -> Result<u16> {
        let mut b = [0u8; 2];
        self.read_bytes(offset, &mut b)?;
        Ok(u16::from_ne_bytes(b))
    }

    pub fn write_u16(&self, offset: usize, v: u16) -> Result<()> {
        self.write_bytes(offset, &v.to_ne_bytes())
    }

    pub fn read_u32(&self, offset: usize) -> Result<u32> {
        let mut b = [0u8; 4];
        self.read_bytes(offset, &mut b)?;
        Ok(u32::from_ne_bytes(b))
    }

    pub fn write_u32(&self, offset: usize, v: u32) -> Result<()> {
        self.write_bytes(offset, &v.to_ne_bytes())
    }

    pub fn read_u64(&self, offset: usize) -> Result<u64> {
        let mut b = [0u8; 8];
        self.read_bytes(offset, &mut b)?;
        Ok(u64::from_ne_bytes(b))
    }

    pub fn write_u64(&self, offset: usize, v: u64) -> Result<()> {
        self.write_bytes(offset, &v.to_ne_bytes())
    }

    pub fn read_bytes(&self, offset: usize, dst: &mut [u8]) -> Result<()> {
        self.check(offset, dst.len())?;
        unsafe { ptr::copy_nonoverlapping(self.base.add(offset), dst.as_mut_ptr(), dst.len()) };
        Ok(())
    }

    pub fn write_bytes(&self, offset: usize, src: &[u8]) -> Result<()> {
        self.check(offset, src.len())?;
        unsafe { ptr::copy_nonoverlapping(src.as_ptr(), self.base.add(offset), src.len()) };
        Ok(())
    }

    pub fn fill(&self, offset: usize, len: usize, byte: u8) -> Result<()> {
        self.check(offset, len)?;
        unsafe { ptr::write_bytes(self.base.add(offset), byte, len) };
        Ok(())
    }

    /// Borrow `len` bytes at `offset`.
    ///
    /// # Safety
    /// The caller must own those bytes by protocol: the peer must not
    /// write them while the slice is alive.
    pub unsafe fn bytes(&self, offset: usize, len: usize) -> Result<&[u8]> {
        self.check(offset, len)?;
        Ok(std::slice::from_raw_parts(self.base.add(offset), len))
    }

    /// Copy `src` into the byte ring of `qsize` bytes at `ring`, starting at
    /// `head`. Wraps into at most two copies.
    pub fn write_circ(&self, ring: usize, qsize: u32, head: u32, src: &[u8]) -> Result<()> {
        self.check(ring, qsize as usize)?;
        let mut done = 0usize;
        for (off, n) in circ_segments(qsize, head, src.len() as u32) {
            let n = n as usize;
            if n == 0 {
                continue;
            }
            self.write_bytes(ring + off as usize, &src[done..done + n])?;
            done += n;
        }
        Ok(())
    }

    /// Copy out of a byte ring starting at `tail`; mirror of `write_circ`.
    pub fn read_circ(&self, ring: usize, qsize: u32, tail: u32, dst: &mut [u8]) -> Result<()> {
        self.check(ring, qsize as usize)?;
        let mut done = 0usize;
        let len = dst.len() as u32;
        for (off, n) in circ_segments(qsize, tail, len) {
            let n = n as usize;
            if n == 0 {
                continue;
            }
            self.read_bytes(ring + off as usize, &mut dst[done..done + n])?;
            done += n;
        }
        Ok(())
    }
}

impl Drop for SharedRegion {
    fn drop(&mut self) {
        if self.owned && !self.base.is_null() {
            unsafe {
                libc::munmap(self.base as *mut libc::c_void, self.size);
            }
            self.base = ptr::null_mut();
        }
    }
}

impl std::fmt::Debug for SharedRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedRegion")
            .field("base", &self.base)
            .field("size", &self.size)
            .field("owned", &self.owned)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;

    #[test]
    fn test_anonymous_is_zeroed() {
        let r = SharedRegion::anonymous(4096).unwrap();
        assert_eq!(r.read_u32(0).unwrap(), 0);
        assert_eq!(r.read_u64(4088).unwrap(), 0);
    }

    #[test]
    fn test_bounds_checked() {
        let r = SharedRegion::anonymous(4096).unwrap();
        assert!(matches!(
            r.read_u32(4094),
            Err(LinkError::OutOfBounds { offset: 4094, len: 4, size: 4096 })
        ));
        assert!(r.write_bytes(usize::MAX, &[1]).is_err());
        assert!(r.atomic_u32(3).is_err());
        assert!(r.atomic_u16(4096).is_err());
    }

    #[test]
    fn test_atomic_view_shares_memory() {
        let r = SharedRegion::anonymous(4096).unwrap();
        r.atomic_u32(8).unwrap().store(0xAA, Ordering::Release);
        assert_eq!(r.read_u32(8).unwrap(), 0xAA);
        r.write_u16(16, 7).unwrap();
        assert_eq!(r.atomic_u16(16).unwrap().load(Ordering::Acquire), 7);
    }

    #[test]
    fn test_circ_copy_wraps() {
        let r = SharedRegion::anonymous(4096).unwrap();
        let ring = 256;
        r.write_circ(ring, 8, 6, b"abcd").unwrap();
        assert_eq!(r.read_u8(ring + 6).unwrap(), b'a');
        assert_eq!(r.read_u8(ring + 7).unwrap(), b'b');
        assert_eq!(r.read_u8(ring).unwrap(), b'c');
        assert_eq!(r.read_u8(ring + 1).unwrap(), b'd');

        let mut out = [0u8; 4];
        r.read_circ(ring, 8, 6, &mut out).unwrap();
        assert_eq!(&out, b"abcd");
    }
}
