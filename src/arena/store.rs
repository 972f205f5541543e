#![allow(unsafe_code)]
//! Ordered, auto-growing collection of arena segments.

use std::cell::UnsafeCell;
use std::path::PathBuf;
use std::sync::Arc;

use tracing::debug;

use crate::arena::{next_segment_capacity, MetaFile, Segment, StoreMode};
use crate::error::{Result, WraithError};
use crate::sync::{RwSpinLock, WriteGuard};

/// Ordered list of segments sharing one store mode.
///
/// The list only ever grows; a segment is sealed before its successor is
/// created. Regular allocations take the shared side of the frame lock so
/// that a commit's frame writer can exclude them while it streams
/// contiguous frame bytes.
pub struct SegmentStore {
    mode: StoreMode,
    dir: Option<PathBuf>,
    list_lock: RwSpinLock,
    segments: UnsafeCell<Vec<Arc<Segment>>>,
    frame_lock: RwSpinLock,
}

// The segment list is only read or mutated under `list_lock`.
unsafe impl Send for SegmentStore {}
unsafe impl Sync for SegmentStore {}

impl SegmentStore {
    /// Creates a store with its first segment already allocated.
    pub fn create(mode: StoreMode, dir: Option<PathBuf>) -> Result<Self> {
        if mode.is_persistent() && dir.is_none() {
            return Err(WraithError::Config(
                "persistent store mode requires a directory",
            ));
        }
        let store = Self {
            mode,
            dir,
            list_lock: RwSpinLock::new(),
            segments: UnsafeCell::new(Vec::new()),
            frame_lock: RwSpinLock::new(),
        };
        let first = store.new_segment(0, 0)?;
        // Safety: the store is not shared yet.
        unsafe { (&mut *store.segments.get()).push(first) };
        Ok(store)
    }

    /// Reopens a persistent store from `meta`, loading every segment file.
    pub fn open(dir: PathBuf, meta: &MetaFile) -> Result<Self> {
        let mut segments = Vec::with_capacity(meta.segment_count as usize);
        for id in 0..meta.segment_count {
            segments.push(Arc::new(Segment::open_persistent(id, &dir)?));
        }
        if segments.is_empty() {
            return Err(WraithError::Corruption("meta file lists no segments"));
        }
        Ok(Self {
            mode: meta.mode,
            dir: Some(dir),
            list_lock: RwSpinLock::new(),
            segments: UnsafeCell::new(segments),
            frame_lock: RwSpinLock::new(),
        })
    }

    /// Store mode shared by all segments.
    pub fn mode(&self) -> StoreMode {
        self.mode
    }

    /// Number of segments, including sealed ones.
    pub fn segment_count(&self) -> usize {
        let _guard = self.list_lock.read();
        // Safety: guarded by the list lock.
        unsafe { (&*self.segments.get()).len() }
    }

    /// The segment currently accepting allocations.
    pub fn active(&self) -> Arc<Segment> {
        let _guard = self.list_lock.read();
        // Safety: guarded by the list lock; the list is never empty.
        unsafe {
            let list = &*self.segments.get();
            Arc::clone(list.last().expect("store always holds a segment"))
        }
    }

    /// Looks a segment up by id.
    pub fn segment(&self, id: u32) -> Option<Arc<Segment>> {
        let _guard = self.list_lock.read();
        // Safety: guarded by the list lock.
        unsafe { (&*self.segments.get()).get(id as usize).cloned() }
    }

    /// Snapshot of all segments in id order.
    pub fn segments(&self) -> Vec<Arc<Segment>> {
        let _guard = self.list_lock.read();
        // Safety: guarded by the list lock.
        unsafe { (&*self.segments.get()).clone() }
    }

    /// Seals the active segment and creates its successor, sized for
    /// `pending` bytes. Returns the new active segment.
    ///
    /// When another thread already grew the list past the segment the
    /// caller saw, the fresh active segment is returned without growing
    /// again.
    pub fn grow(&self, pending: usize) -> Result<Arc<Segment>> {
        let _guard = self.list_lock.write();
        // Safety: exclusive via the list write lock.
        let list = unsafe { &mut *self.segments.get() };
        let active = Arc::clone(list.last().expect("store always holds a segment"));
        if active.remaining() >= pending.max(1) && !active.is_sealed() {
            return Ok(active);
        }
        active.seal()?;
        let id = list.len() as u32;
        let segment = self.new_segment(id, pending)?;
        list.push(Arc::clone(&segment));
        debug!(
            segment = id,
            capacity = segment.capacity(),
            pending,
            "segment store grew"
        );
        Ok(segment)
    }

    /// Writes `bytes` into the active segment, growing the store when the
    /// active segment is out of space. Returns the segment and offset the
    /// bytes landed at.
    ///
    /// The reserve-and-copy pair runs under the shared side of the list
    /// lock, so a concurrent [`SegmentStore::grow`] cannot seal the segment
    /// between the two steps.
    pub fn append(&self, bytes: &[u8]) -> Result<(Arc<Segment>, u32)> {
        let _shared = self.frame_lock.read();
        loop {
            let (segment, outcome) = {
                let _pin = self.list_lock.read();
                // Safety: guarded by the list lock; the list is never empty.
                let segment = unsafe {
                    let list = &*self.segments.get();
                    Arc::clone(list.last().expect("store always holds a segment"))
                };
                let outcome = segment.write(bytes);
                (segment, outcome)
            };
            match outcome {
                Ok(offset) => return Ok((segment, offset)),
                Err(WraithError::CapacityExceeded { .. }) => {
                    self.grow(bytes.len())?;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Takes the exclusive side of the frame lock, blocking out all shared
    /// allocation until the guard drops.
    pub(crate) fn exclusive(&self) -> WriteGuard<'_> {
        self.frame_lock.write()
    }

    fn new_segment(&self, id: u32, pending: usize) -> Result<Arc<Segment>> {
        let capacity = next_segment_capacity(self.mode, id as usize, pending)?;
        let segment = match self.mode {
            StoreMode::Volatile => Segment::volatile(id, capacity),
            StoreMode::MappedVolatile => Segment::mapped_volatile(id, capacity)?,
            StoreMode::Persistent => {
                let dir = self
                    .dir
                    .as_deref()
                    .ok_or(WraithError::Config("persistent store lost its directory"))?;
                Segment::create_persistent(id, capacity, dir)?
            }
        };
        Ok(Arc::new(segment))
    }
}
