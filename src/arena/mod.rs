//! Append-only arena segments and their durability framing.
//!
//! Ghost bytes live in fixed-capacity segments that only ever grow at the
//! head (bump allocation, no reclamation). A [`SegmentStore`] chains
//! segments together, choosing each new segment's capacity from a size tier
//! keyed by store mode and segment count. Persistent segments are backed by
//! memory-mapped files and framed with checksummed transaction records for
//! crash recovery.

mod framing;
mod segment;
mod store;

pub use framing::{
    read_txn_frame, write_txn_frame, FrameReader, FrameWriter, MetaFile, RecordHeader,
    SegmentFooter, SegmentHeader, TxnContinuation, TxnEnd, TxnFrame, TxnHeader, NO_FRAME,
};
pub use segment::Segment;
pub use store::SegmentStore;

use crate::error::{Result, WraithError};

/// Backing strategy for a repository's segments.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
#[repr(u8)]
pub enum StoreMode {
    /// Heap buffers; contents vanish with the process.
    Volatile = 0,
    /// Anonymous memory maps; volatile, but off the managed heap.
    MappedVolatile = 1,
    /// File-backed memory maps under a repository directory.
    Persistent = 2,
}

impl StoreMode {
    /// Decodes a mode byte from persistent framing.
    pub fn from_raw(raw: u8) -> Result<Self> {
        match raw {
            0 => Ok(Self::Volatile),
            1 => Ok(Self::MappedVolatile),
            2 => Ok(Self::Persistent),
            _ => Err(WraithError::Config("unsupported store mode byte")),
        }
    }

    /// Returns `true` for modes that survive process exit.
    pub fn is_persistent(&self) -> bool {
        matches!(self, Self::Persistent)
    }
}

/// Capacity tiers for in-memory segments: the first segments stay small,
/// later ones escalate up to the per-mode ceiling.
const VOLATILE_TIERS: &[usize] = &[64 << 10, 256 << 10, 1 << 20, 4 << 20, 16 << 20];

/// Capacity tiers for persistent segments.
const PERSISTENT_TIERS: &[usize] = &[1 << 20, 4 << 20, 16 << 20, 64 << 20];

/// No segment may exceed this, regardless of tier doubling.
pub const SEGMENT_CEILING: usize = 1 << 30;

/// Picks the capacity for segment number `ordinal` (zero-based), enlarging
/// the tier until it can hold `pending` twice over.
///
/// Fails when the doubled requirement would cross [`SEGMENT_CEILING`].
pub(crate) fn next_segment_capacity(
    mode: StoreMode,
    ordinal: usize,
    pending: usize,
) -> Result<usize> {
    let tiers = match mode {
        StoreMode::Volatile | StoreMode::MappedVolatile => VOLATILE_TIERS,
        StoreMode::Persistent => PERSISTENT_TIERS,
    };
    let mut capacity = tiers[ordinal.min(tiers.len() - 1)];
    let needed = pending
        .checked_mul(2)
        .ok_or(WraithError::Config("pending record size overflows"))?;
    while capacity < needed {
        capacity *= 2;
        if capacity > SEGMENT_CEILING {
            return Err(WraithError::CapacityExceeded {
                requested: needed,
                available: SEGMENT_CEILING,
            });
        }
    }
    Ok(capacity)
}
