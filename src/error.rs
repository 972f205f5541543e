//! Engine error taxonomy.

use std::io;
use thiserror::Error;

/// Convenience alias used across the crate.
pub type Result<T> = std::result::Result<T, WraithError>;

/// Engine-wide error taxonomy.
///
/// "Not found" is deliberately absent: lookups report absence through
/// `Option`, never through an error.
#[derive(Debug, Error)]
pub enum WraithError {
    /// Fatal configuration problem (unsupported store mode, missing layout
    /// builder for a requested version). Never retried.
    #[error("configuration error: {0}")]
    Config(&'static str),
    /// An allocation request exceeded the remaining free space of a segment.
    /// Recoverable: the caller obtains a new segment and retries.
    #[error("capacity exceeded: requested {requested} bytes, {available} free")]
    CapacityExceeded {
        /// Bytes the caller asked for.
        requested: usize,
        /// Bytes still free in the segment at the time of the request.
        available: usize,
    },
    /// Busy-guard re-entry or cross-transaction access. A programming
    /// defect, surfaced immediately and never retried.
    #[error("concurrency violation: {0}")]
    ConcurrencyViolation(&'static str),
    /// Persistent data failed structural or checksum validation.
    #[error("corruption: {0}")]
    Corruption(&'static str),
    /// Durability flush requested on a platform without support.
    #[error("unsupported: {0}")]
    Unsupported(&'static str),
    /// Underlying OS failure during durability I/O.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}
