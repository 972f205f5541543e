//! Wraith: an embedded, append-only object store.
//!
//! Objects ("ghosts") are flat binary blobs with a fixed 40-byte header,
//! identified by 128-bit time-ordered ids and laid out by versioned,
//! registered layouts. Blobs live in bump-allocated arena segments that
//! are heap-backed, anonymously mapped, or file-backed; persistent
//! repositories frame every commit with checksummed records for crash
//! recovery. All engine-internal waiting is spin-based.

#![warn(missing_docs)]

pub mod arena;
pub mod error;
pub mod ghost;
pub mod ident;
pub mod layout;
pub mod sync;
pub mod txn;

pub use arena::{Segment, SegmentStore, StoreMode};
pub use error::{Result, WraithError};
pub use ghost::{ArrayMapLarge, ArrayMapSmall, GhostHeader};
pub use ident::{GhostId, GhostKind};
pub use layout::{
    ArraySlotSpec, FieldKind, FieldSpec, Ghost, Layout, LayoutBuilder, LayoutRegistry,
};
pub use txn::{current, GhostIndex, Repository, Transaction, TxnScope};
