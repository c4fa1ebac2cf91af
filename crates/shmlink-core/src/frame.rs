//! Frames handed to the upper transport.

use crate::cell::CellBuf;
use crate::state::Direction;

/// Received payload: copied out of the ring, or a pool cell whose
/// ownership moved to the consumer.
#[derive(Debug)]
pub enum FrameData {
    Copied(Vec<u8>),
    Cell(CellBuf),
}

impl FrameData {
    pub fn as_slice(&self) -> &[u8] {
        match self {
            Self::Copied(v) => v,
            Self::Cell(c) => c.as_slice(),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Self::Copied(v) => v.len(),
            Self::Cell(c) => c.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_zerocopy(&self) -> bool {
        matches!(self, Self::Cell(_))
    }

    pub fn into_vec(self) -> Vec<u8> {
        match self {
            Self::Copied(v) => v,
            Self::Cell(c) => c.as_slice().to_vec(),
        }
    }
}

/// One slot's worth of received data, tagged with the channel it belongs to.
#[derive(Debug)]
pub struct RxFrame {
    pub ring_id: u16,
    pub dir: Direction,
    /// Channel id: the ring's channel, or the tag in the size field for
    /// multiplexed rings.
    pub ch: u16,
    /// Payload starts with a link header.
    pub lnk_hdr: bool,
    /// More slots of the same frame follow.
    pub more: bool,
    pub data: FrameData,
}

impl RxFrame {
    pub fn payload(&self) -> &[u8] {
        self.data.as_slice()
    }
}
