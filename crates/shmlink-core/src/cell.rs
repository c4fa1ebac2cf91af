//! Fixed-size cell allocator used by the zero-copy DL path.
//!
//! The allocator owns a pool the CP can DMA into. A cell is identified by
//! its index; `offset` is its byte offset inside the pool. The link turns
//! that into a peer-visible offset when it publishes the cell on a ring.

use std::sync::Arc;

/// A claimed cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CellHandle {
    pub index: u32,
    /// Byte offset of the cell inside the pool.
    pub offset: u32,
}

/// Provides fixed-size cells.
///
/// **Contract:**
/// - `acquire()` never blocks. `None` means exhausted; callers retry later.
/// - `release()` returns a cell exactly once.
/// - `cell_data()` is only called for cells the caller currently holds.
pub trait CellAllocator: Send + Sync {
    fn acquire(&self) -> Option<CellHandle>;

    fn release(&self, cell: CellHandle);

    fn cell_size(&self) -> usize;

    fn cell_count(&self) -> usize;

    fn in_use(&self) -> usize;

    /// Handle for the cell starting at `offset`, if it is a cell boundary.
    fn cell_at(&self, offset: u32) -> Option<CellHandle>;

    /// `len` bytes at `start` inside a held cell.
    fn cell_data(&self, cell: &CellHandle, start: usize, len: usize) -> Option<&[u8]>;

    /// Copy `src` into a held cell at `start`.
    fn write_cell(&self, cell: &CellHandle, start: usize, src: &[u8]) -> bool;
}

/// Payload living in a pool cell. Returns the cell on drop.
pub struct CellBuf {
    pool: Arc<dyn CellAllocator>,
    cell: Option<CellHandle>,
    start: usize,
    len: usize,
}

impl CellBuf {
    pub fn new(pool: Arc<dyn CellAllocator>, cell: CellHandle, start: usize, len: usize) -> Self {
        Self {
            pool,
            cell: Some(cell),
            start,
            len,
        }
    }

    pub fn as_slice(&self) -> &[u8] {
        match &self.cell {
            Some(cell) => self.pool.cell_data(cell, self.start, self.len).unwrap_or(&[]),
            None => &[],
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn cell(&self) -> Option<CellHandle> {
        self.cell
    }
}

impl Drop for CellBuf {
    fn drop(&mut self) {
        if let Some(cell) = self.cell.take() {
            self.pool.release(cell);
        }
    }
}

impl std::fmt::Debug for CellBuf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CellBuf")
            .field("cell", &self.cell)
            .field("start", &self.start)
            .field("len", &self.len)
            .finish()
    }
}
