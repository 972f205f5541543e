#![allow(unsafe_code)]
//! Fixed-capacity append-only memory arenas.
//!
//! A segment hands out byte ranges by atomically advancing a head offset;
//! nothing is ever reclaimed in place. Writers only touch ranges they
//! reserved through [`Segment::alloc`], which keeps concurrent raw-pointer
//! writes disjoint.

use std::cell::UnsafeCell;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use memmap2::MmapMut;
use tracing::debug;

use crate::arena::framing::{SegmentFooter, SegmentHeader};
use crate::arena::StoreMode;
use crate::error::{Result, WraithError};
use crate::sync::SpinLock;

/// Bytes reserved in front of a persistent segment's data region.
pub(crate) const PERSISTENT_PREFIX: usize = SegmentHeader::SIZE;
/// Bytes reserved behind a persistent segment's data region for the sealed
/// footer.
pub(crate) const PERSISTENT_SUFFIX: usize = SegmentFooter::SIZE;

#[cfg(unix)]
const FLUSH_PAGE: usize = 4096;

enum Backing {
    Heap(Box<[u8]>),
    Mapped(MmapMut),
}

impl Backing {
    fn base_ptr(&mut self) -> *mut u8 {
        match self {
            Backing::Heap(buf) => buf.as_mut_ptr(),
            Backing::Mapped(map) => map.as_mut_ptr(),
        }
    }

    fn len(&self) -> usize {
        match self {
            Backing::Heap(buf) => buf.len(),
            Backing::Mapped(map) => map.len(),
        }
    }
}

/// A contiguous, fixed-capacity byte region plus a monotonically advancing
/// head offset.
///
/// All offsets in the public API are relative to the data region; the
/// on-disk header and footer of persistent segments are hidden from
/// callers.
pub struct Segment {
    id: u32,
    mode: StoreMode,
    capacity: usize,
    data_start: usize,
    head: AtomicUsize,
    sealed: AtomicBool,
    flush_lock: SpinLock,
    backing: UnsafeCell<Backing>,
    path: Option<PathBuf>,
}

// Bump allocation hands each writer a disjoint range, and reads below the
// head only observe bytes whose writer has already published the offset.
unsafe impl Send for Segment {}
unsafe impl Sync for Segment {}

impl Segment {
    /// Creates a heap-backed volatile segment of `capacity` data bytes.
    pub fn volatile(id: u32, capacity: usize) -> Self {
        Self {
            id,
            mode: StoreMode::Volatile,
            capacity,
            data_start: 0,
            head: AtomicUsize::new(0),
            sealed: AtomicBool::new(false),
            flush_lock: SpinLock::new(),
            backing: UnsafeCell::new(Backing::Heap(vec![0u8; capacity].into_boxed_slice())),
            path: None,
        }
    }

    /// Creates a segment backed by an anonymous memory map.
    pub fn mapped_volatile(id: u32, capacity: usize) -> Result<Self> {
        let map = MmapMut::map_anon(capacity)?;
        Ok(Self {
            id,
            mode: StoreMode::MappedVolatile,
            capacity,
            data_start: 0,
            head: AtomicUsize::new(0),
            sealed: AtomicBool::new(false),
            flush_lock: SpinLock::new(),
            backing: UnsafeCell::new(Backing::Mapped(map)),
            path: None,
        })
    }

    /// Creates a file-backed persistent segment under `dir` with `capacity`
    /// data bytes, writing its on-disk header immediately.
    pub fn create_persistent(id: u32, capacity: usize, dir: &Path) -> Result<Self> {
        let path = dir.join(segment_file_name(id));
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)?;
        let file_len = PERSISTENT_PREFIX + capacity + PERSISTENT_SUFFIX;
        file.set_len(file_len as u64)?;
        let map = unsafe { MmapMut::map_mut(&file)? };
        let segment = Self {
            id,
            mode: StoreMode::Persistent,
            capacity,
            data_start: PERSISTENT_PREFIX,
            head: AtomicUsize::new(0),
            sealed: AtomicBool::new(false),
            flush_lock: SpinLock::new(),
            backing: UnsafeCell::new(Backing::Mapped(map)),
            path: Some(path),
        };
        segment.sync_header();
        segment.flush_physical(0, PERSISTENT_PREFIX)?;
        debug!(segment = id, capacity, "created persistent segment");
        Ok(segment)
    }

    /// Reopens an existing persistent segment file, restoring capacity and
    /// head from its on-disk header.
    pub fn open_persistent(id: u32, dir: &Path) -> Result<Self> {
        let path = dir.join(segment_file_name(id));
        let file = OpenOptions::new().read(true).write(true).open(&path)?;
        let map = unsafe { MmapMut::map_mut(&file)? };
        if map.len() < PERSISTENT_PREFIX + PERSISTENT_SUFFIX {
            return Err(WraithError::Corruption("segment file shorter than framing"));
        }
        let header = SegmentHeader::decode(&map[..PERSISTENT_PREFIX])?;
        if header.segment_id != id {
            return Err(WraithError::Corruption("segment file id mismatch"));
        }
        let capacity = header.capacity as usize;
        if map.len() != PERSISTENT_PREFIX + capacity + PERSISTENT_SUFFIX {
            return Err(WraithError::Corruption("segment file length mismatch"));
        }
        let head = header.head as usize;
        if head > capacity {
            return Err(WraithError::Corruption("segment head past capacity"));
        }
        let sealed = head == capacity;
        Ok(Self {
            id,
            mode: StoreMode::Persistent,
            capacity,
            data_start: PERSISTENT_PREFIX,
            head: AtomicUsize::new(head),
            sealed: AtomicBool::new(sealed),
            flush_lock: SpinLock::new(),
            backing: UnsafeCell::new(Backing::Mapped(map)),
            path: Some(path),
        })
    }

    /// Segment ordinal within its store.
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Store mode this segment was created under.
    pub fn mode(&self) -> StoreMode {
        self.mode
    }

    /// Total allocatable data bytes.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Current head offset: bytes consumed so far.
    pub fn head(&self) -> usize {
        self.head.load(Ordering::Acquire)
    }

    /// Bytes still free.
    pub fn remaining(&self) -> usize {
        self.capacity - self.head()
    }

    /// Whether the segment has been sealed.
    pub fn is_sealed(&self) -> bool {
        self.sealed.load(Ordering::Acquire)
    }

    /// Atomically reserves `len` bytes, returning their data-relative
    /// offset.
    ///
    /// Fails with `CapacityExceeded` when the request does not fit; the
    /// head (and therefore the free space) is left untouched. The caller is
    /// expected to obtain a new segment from the store; a single allocation
    /// never spills across segments.
    pub fn alloc(&self, len: usize) -> Result<u32> {
        if self.is_sealed() {
            return Err(WraithError::CapacityExceeded {
                requested: len,
                available: 0,
            });
        }
        let mut current = self.head.load(Ordering::Acquire);
        loop {
            let available = self.capacity - current;
            if len > available {
                return Err(WraithError::CapacityExceeded {
                    requested: len,
                    available,
                });
            }
            match self.head.compare_exchange_weak(
                current,
                current + len,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(current as u32),
                Err(observed) => current = observed,
            }
        }
    }

    /// Allocate-and-copy convenience: reserves space for `bytes` and writes
    /// them, returning the data-relative offset.
    pub fn write(&self, bytes: &[u8]) -> Result<u32> {
        let offset = self.alloc(bytes.len())?;
        self.write_at(offset, bytes)?;
        Ok(offset)
    }

    /// Moves a written range into a fresh allocation of `new_len` bytes,
    /// returning the new data-relative offset.
    ///
    /// The old bytes are copied over (truncated when shrinking, the tail
    /// left zeroed when growing) and the old range is abandoned; nothing is
    /// ever reclaimed in place.
    pub fn resize(&self, offset: u32, old_len: usize, new_len: usize) -> Result<u32> {
        let moved = self.alloc(new_len)?;
        let keep = old_len.min(new_len);
        let bytes = self.read(offset, keep)?;
        self.write_at(moved, bytes)?;
        Ok(moved)
    }

    /// Writes into a previously reserved range.
    pub fn write_at(&self, offset: u32, bytes: &[u8]) -> Result<()> {
        if self.is_sealed() {
            return Err(WraithError::ConcurrencyViolation(
                "write into a sealed segment",
            ));
        }
        let offset = offset as usize;
        let end = offset
            .checked_add(bytes.len())
            .ok_or(WraithError::Corruption("segment write offset overflow"))?;
        if end > self.capacity {
            return Err(WraithError::Corruption("segment write out of bounds"));
        }
        if bytes.is_empty() {
            return Ok(());
        }
        // Safety: callers only write ranges handed out by `alloc`, which
        // are pairwise disjoint; the range is bounds-checked above.
        unsafe {
            let base = (&mut *self.backing.get()).base_ptr();
            std::ptr::copy_nonoverlapping(
                bytes.as_ptr(),
                base.add(self.data_start + offset),
                bytes.len(),
            );
        }
        Ok(())
    }

    /// Returns a view of `len` bytes at the data-relative `offset`.
    pub fn read(&self, offset: u32, len: usize) -> Result<&[u8]> {
        let offset = offset as usize;
        let end = offset
            .checked_add(len)
            .ok_or(WraithError::Corruption("segment read offset overflow"))?;
        if end > self.capacity {
            return Err(WraithError::Corruption("segment read out of bounds"));
        }
        // Safety: bounds-checked; concurrent writers never touch ranges
        // already published to readers.
        unsafe {
            let base = (&mut *self.backing.get()).base_ptr();
            Ok(std::slice::from_raw_parts(
                base.add(self.data_start + offset),
                len,
            ))
        }
    }

    /// Marks the segment immutable. Persistent segments get their footer
    /// written and the whole region flushed.
    pub fn seal(&self) -> Result<()> {
        if self.sealed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        debug!(segment = self.id, head = self.head(), "sealing segment");
        if self.mode.is_persistent() {
            let footer = SegmentFooter::new(self.head() as u32);
            let footer_off = self.data_start + self.capacity;
            // Safety: the footer region sits past the data region and is
            // only written here, guarded by the seal flag swap above.
            unsafe {
                let base = (&mut *self.backing.get()).base_ptr();
                std::ptr::copy_nonoverlapping(
                    footer.encode().as_ptr(),
                    base.add(footer_off),
                    SegmentFooter::SIZE,
                );
            }
            self.sync_header();
            self.flush_physical(0, self.backing_len())?;
        }
        Ok(())
    }

    /// Flushes a data-relative byte range to durable storage.
    ///
    /// Volatile segments treat this as a no-op. The range is widened to
    /// page boundaries internally, so unaligned input addresses are fine.
    pub fn flush(&self, offset: u32, len: usize) -> Result<()> {
        if !self.mode.is_persistent() {
            return Ok(());
        }
        self.sync_header();
        let start = self.data_start + offset as usize;
        // Header travels with every flush so a crash never observes data
        // ahead of the recorded head.
        self.flush_physical(0, PERSISTENT_PREFIX)?;
        self.flush_physical(start, len)
    }

    fn backing_len(&self) -> usize {
        // Safety: the length of the backing never changes after creation.
        unsafe { (&*self.backing.get()).len() }
    }

    /// Rewrites the on-disk segment header with the current head.
    fn sync_header(&self) {
        if !self.mode.is_persistent() {
            return;
        }
        let header = SegmentHeader {
            mode: self.mode,
            segment_id: self.id,
            capacity: self.capacity as u32,
            head: self.head() as u32,
        };
        // Safety: the header region precedes all data offsets and is only
        // rewritten under the flush lock.
        let _guard = self.flush_lock.lock();
        unsafe {
            let base = (&mut *self.backing.get()).base_ptr();
            std::ptr::copy_nonoverlapping(header.encode().as_ptr(), base, SegmentHeader::SIZE);
        }
    }

    #[cfg(unix)]
    fn flush_physical(&self, offset: usize, len: usize) -> Result<()> {
        if len == 0 {
            return Ok(());
        }
        let _guard = self.flush_lock.lock();
        let total = self.backing_len();
        // Widen to page boundaries; msync rejects unaligned addresses.
        let start = offset & !(FLUSH_PAGE - 1);
        let end = (offset + len + FLUSH_PAGE - 1) & !(FLUSH_PAGE - 1);
        let end = end.min(total);
        // Safety: the widened range stays within the mapping and the base
        // address of an mmap is always page aligned.
        let rc = unsafe {
            let base = (&mut *self.backing.get()).base_ptr();
            libc::msync(
                base.add(start) as *mut libc::c_void,
                end - start,
                libc::MS_SYNC,
            )
        };
        if rc != 0 {
            return Err(WraithError::Io(std::io::Error::last_os_error()));
        }
        Ok(())
    }

    #[cfg(all(windows, not(unix)))]
    fn flush_physical(&self, offset: usize, len: usize) -> Result<()> {
        if len == 0 {
            return Ok(());
        }
        let _guard = self.flush_lock.lock();
        // Safety: flush_range takes &self on the mapping; the range is
        // clamped to the mapping length.
        unsafe {
            if let Backing::Mapped(map) = &*self.backing.get() {
                let end = (offset + len).min(map.len());
                map.flush_range(offset, end - offset)?;
            }
        }
        Ok(())
    }

    #[cfg(not(any(unix, windows)))]
    fn flush_physical(&self, _offset: usize, _len: usize) -> Result<()> {
        Err(WraithError::Unsupported(
            "durability flush not implemented on this platform",
        ))
    }
}

fn segment_file_name(id: u32) -> String {
    format!("seg-{id:08}.wsg")
}
