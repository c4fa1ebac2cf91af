//! Lock-free bitmaps.
//!
//! Used as the free-cell map of the zero-copy pool (set bit = free cell,
//! `find_and_claim` hands one out) and as channel sets (opened consumers,
//! stopped consumers).

use core::sync::atomic::{AtomicU64, Ordering};

const BITS_PER_BLOCK: usize = 64;

pub struct AtomicBitmap {
    blocks: Box<[AtomicU64]>,
    nbits: usize,
}

impl AtomicBitmap {
    /// All bits clear.
    pub fn new(nbits: usize) -> Self {
        let num_blocks = nbits.div_ceil(BITS_PER_BLOCK).max(1);
        let blocks: Vec<AtomicU64> = (0..num_blocks).map(|_| AtomicU64::new(0)).collect();
        Self {
            blocks: blocks.into_boxed_slice(),
            nbits,
        }
    }

    /// All `nbits` bits set.
    pub fn full(nbits: usize) -> Self {
        let map = Self::new(nbits);
        map.fill();
        map
    }

    /// Set every valid bit (tail bits of the last block stay clear).
    pub fn fill(&self) {
        for (i, block) in self.blocks.iter().enumerate() {
            let lo = i * BITS_PER_BLOCK;
            let n = self.nbits.saturating_sub(lo).min(BITS_PER_BLOCK);
            let mask = if n == BITS_PER_BLOCK { u64::MAX } else { (1u64 << n) - 1 };
            block.store(mask, Ordering::Release);
        }
    }

    pub fn clear_all(&self) {
        for block in self.blocks.iter() {
            block.store(0, Ordering::Release);
        }
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.nbits
    }

    #[inline]
    fn locate(&self, idx: usize) -> Option<(usize, u64)> {
        if idx >= self.nbits {
            return None;
        }
        Some((idx / BITS_PER_BLOCK, 1u64 << (idx % BITS_PER_BLOCK)))
    }

    /// Set bit `idx`. Returns true if it was previously clear.
    #[inline]
    pub fn set(&self, idx: usize) -> bool {
        match self.locate(idx) {
            Some((b, mask)) => self.blocks[b].fetch_or(mask, Ordering::AcqRel) & mask == 0,
            None => false,
        }
    }

    /// Clear bit `idx`. Returns true if it was previously set.
    #[inline]
    pub fn clear(&self, idx: usize) -> bool {
        match self.locate(idx) {
            Some((b, mask)) => self.blocks[b].fetch_and(!mask, Ordering::AcqRel) & mask != 0,
            None => false,
        }
    }

    #[inline]
    pub fn is_set(&self, idx: usize) -> bool {
        match self.locate(idx) {
            Some((b, mask)) => self.blocks[b].load(Ordering::Acquire) & mask != 0,
            None => false,
        }
    }

    /// Atomically clear and return one set bit, scanning from `start_hint`.
    pub fn find_and_claim(&self, start_hint: usize) -> Option<usize> {
        let num_blocks = self.blocks.len();
        let start_block = (start_hint / BITS_PER_BLOCK) % num_blocks;

        for i in 0..num_blocks {
            let block_idx = (start_block + i) % num_blocks;
            if self.blocks[block_idx].load(Ordering::Acquire) == 0 {
                continue;
            }
            if let Some(bit_idx) = self.try_claim_from_block(block_idx) {
                return Some(block_idx * BITS_PER_BLOCK + bit_idx);
            }
        }
        None
    }

    fn try_claim_from_block(&self, block_idx: usize) -> Option<usize> {
        loop {
            let current = self.blocks[block_idx].load(Ordering::Acquire);
            if current == 0 {
                return None;
            }
            let bit_idx = current.trailing_zeros() as usize;
            let mask = 1u64 << bit_idx;
            match self.blocks[block_idx].compare_exchange_weak(
                current,
                current & !mask,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Some(bit_idx),
                Err(_) => continue,
            }
        }
    }

    pub fn any(&self) -> bool {
        self.blocks.iter().any(|b| b.load(Ordering::Relaxed) != 0)
    }

    pub fn count(&self) -> usize {
        self.blocks
            .iter()
            .map(|b| b.load(Ordering::Relaxed).count_ones() as usize)
            .sum()
    }

    /// Indices of set bits, lowest first (a racy view, for iteration only).
    pub fn iter_set(&self) -> impl Iterator<Item = usize> + '_ {
        self.blocks.iter().enumerate().flat_map(|(b, block)| {
            let mut word = block.load(Ordering::Acquire);
            std::iter::from_fn(move || {
                if word == 0 {
                    return None;
                }
                let bit = word.trailing_zeros() as usize;
                word &= word - 1;
                Some(b * BITS_PER_BLOCK + bit)
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_set_clear_transitions() {
        let map = AtomicBitmap::new(256);
        assert!(map.set(245));
        assert!(!map.set(245));
        assert!(map.is_set(245));
        assert!(map.clear(245));
        assert!(!map.clear(245));
        assert!(!map.set(256)); // out of range
    }

    #[test]
    fn test_full_respects_capacity() {
        let map = AtomicBitmap::full(70);
        assert_eq!(map.count(), 70);
        assert!(!map.is_set(70));
    }

    #[test]
    fn test_claim_until_empty() {
        let map = AtomicBitmap::full(5);
        let mut got: Vec<usize> = (0..5).filter_map(|_| map.find_and_claim(0)).collect();
        got.sort();
        assert_eq!(got, vec![0, 1, 2, 3, 4]);
        assert_eq!(map.find_and_claim(0), None);
        map.set(3);
        assert_eq!(map.find_and_claim(128), Some(3));
    }

    #[test]
    fn test_iter_set() {
        let map = AtomicBitmap::new(200);
        for i in [1, 64, 65, 199] {
            map.set(i);
        }
        assert_eq!(map.iter_set().collect::<Vec<_>>(), vec![1, 64, 65, 199]);
    }

    #[test]
    fn test_concurrent_claims_are_unique() {
        let map = Arc::new(AtomicBitmap::full(512));
        let handles: Vec<_> = (0..4)
            .map(|t| {
                let map = Arc::clone(&map);
                std::thread::spawn(move || {
                    (0..128).filter_map(|_| map.find_and_claim(t * 64)).collect::<Vec<_>>()
                })
            })
            .collect();
        let mut all: Vec<usize> = handles.into_iter().flat_map(|h| h.join().unwrap()).collect();
        all.sort();
        all.dedup();
        assert_eq!(all.len(), 512);
        assert!(!map.any());
    }
}
