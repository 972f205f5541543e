#![forbid(unsafe_code)]
//! Repositories, transactions, and the scope stack tying them to callers.
//!
//! A [`Repository`] owns a segment store, a layout registry, and the table
//! of committed blob locations. Callers open a [`TxnScope`] to create and
//! mutate ghosts; scopes nest within one repository and the innermost one
//! is the thread's current context. Commit appends the transaction's blobs
//! to the arena and, on persistent repositories, writes a checksummed
//! frame and rewrites the meta file.

mod index;

pub use index::{GhostIndex, MIN_CAPACITY};

use std::cell::RefCell;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;
use tracing::debug;

use crate::arena::{read_txn_frame, write_txn_frame, MetaFile, SegmentStore, StoreMode, NO_FRAME};
use crate::error::{Result, WraithError};
use crate::ghost::GhostHeader;
use crate::ident::{GhostId, GhostKind};
use crate::layout::{Ghost, Layout, LayoutBuilder, LayoutRegistry};
use crate::sync::TicketLock;

/// Distinguishes repositories so cross-repository nesting can be caught.
static REPO_TOKENS: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static SCOPES: RefCell<Vec<Arc<Transaction>>> = const { RefCell::new(Vec::new()) };
}

/// The innermost open transaction on this thread, if any.
pub fn current() -> Option<Arc<Transaction>> {
    SCOPES.with(|scopes| scopes.borrow().last().cloned())
}

/// Location of a committed blob.
enum Resident {
    /// Lives in the arena at a fixed position.
    Arena { segment: u32, offset: u32, len: u32 },
    /// Recovered from a frame record; held on the heap until rewritten.
    Heap(Arc<[u8]>),
}

struct RepositoryInner {
    token: u64,
    store: SegmentStore,
    registry: LayoutRegistry,
    dir: Option<PathBuf>,
    salt: u64,
    next_txn: AtomicU64,
    last_commit: AtomicU64,
    commit_lock: TicketLock,
    last_frame: Mutex<(u32, u32)>,
    resident: RwLock<FxHashMap<GhostId, Resident>>,
}

/// An embedded ghost store: one segment arena, one layout registry, one
/// commit sequence.
#[derive(Clone)]
pub struct Repository {
    inner: Arc<RepositoryInner>,
}

impl Repository {
    /// Opens a heap-backed repository; contents vanish with the process.
    pub fn volatile() -> Result<Self> {
        Self::fresh(StoreMode::Volatile, None)
    }

    /// Opens an anonymously mapped repository; volatile, but off the heap.
    pub fn mapped_volatile() -> Result<Self> {
        Self::fresh(StoreMode::MappedVolatile, None)
    }

    /// Opens or creates a persistent repository under `dir`, replaying the
    /// frame chain when a meta file is present.
    pub fn persistent(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        match MetaFile::read(&dir)? {
            Some(meta) => Self::recover(dir, meta),
            None => {
                let repo = Self::fresh(StoreMode::Persistent, Some(dir.clone()))?;
                repo.write_meta()?;
                Ok(repo)
            }
        }
    }

    fn fresh(mode: StoreMode, dir: Option<PathBuf>) -> Result<Self> {
        let store = SegmentStore::create(mode, dir.clone())?;
        Ok(Self {
            inner: Arc::new(RepositoryInner {
                token: REPO_TOKENS.fetch_add(1, Ordering::Relaxed),
                store,
                registry: LayoutRegistry::new(),
                dir,
                salt: rand::random(),
                next_txn: AtomicU64::new(1),
                last_commit: AtomicU64::new(0),
                commit_lock: TicketLock::new(),
                last_frame: Mutex::new((NO_FRAME, 0)),
                resident: RwLock::new(FxHashMap::default()),
            }),
        })
    }

    /// Rebuilds repository state from segment files and the frame chain.
    ///
    /// The chain is walked newest to oldest; the first record seen for an
    /// identifier is its latest committed version.
    fn recover(dir: PathBuf, meta: MetaFile) -> Result<Self> {
        if !meta.mode.is_persistent() {
            return Err(WraithError::Corruption("meta file names a volatile mode"));
        }
        let store = SegmentStore::open(dir.clone(), &meta)?;
        let mut resident: FxHashMap<GhostId, Resident> = FxHashMap::default();
        let mut frames = 0usize;
        let mut at = (meta.last_frame_segment, meta.last_frame_offset);
        while at.0 != NO_FRAME {
            let frame = read_txn_frame(&store, meta.salt, at.0, at.1)?;
            for record in frame.records {
                let header = GhostHeader::from_bytes(&record)?;
                resident
                    .entry(header.id)
                    .or_insert_with(|| Resident::Heap(Arc::from(record.into_boxed_slice())));
            }
            frames += 1;
            at = (frame.header.prev_segment, frame.header.prev_offset);
        }
        debug!(
            frames,
            ghosts = resident.len(),
            last_commit = meta.last_commit,
            "repository recovered"
        );
        Ok(Self {
            inner: Arc::new(RepositoryInner {
                token: REPO_TOKENS.fetch_add(1, Ordering::Relaxed),
                store,
                registry: LayoutRegistry::new(),
                dir: Some(dir),
                salt: meta.salt,
                next_txn: AtomicU64::new(meta.last_commit + 1),
                last_commit: AtomicU64::new(meta.last_commit),
                commit_lock: TicketLock::new(),
                last_frame: Mutex::new((meta.last_frame_segment, meta.last_frame_offset)),
                resident: RwLock::new(resident),
            }),
        })
    }

    /// Store mode of this repository.
    pub fn mode(&self) -> StoreMode {
        self.inner.store.mode()
    }

    /// The repository's layout registry; builders are registered here at
    /// start-up, before the first scope opens.
    pub fn register_layout(&self, builder: &dyn LayoutBuilder) -> Result<Arc<Layout>> {
        self.inner.registry.register(builder)
    }

    /// Highest committed transaction id.
    pub fn last_commit(&self) -> u64 {
        self.inner.last_commit.load(Ordering::Acquire)
    }

    /// Number of arena segments currently backing the repository.
    pub fn segment_count(&self) -> usize {
        self.inner.store.segment_count()
    }

    /// Opens a read scope: lookups only, commit is rejected.
    pub fn read(&self) -> Result<TxnScope> {
        self.open_scope(false)
    }

    /// Opens a write scope.
    pub fn write(&self) -> Result<TxnScope> {
        self.open_scope(true)
    }

    fn open_scope(&self, writable: bool) -> Result<TxnScope> {
        if let Some(active) = current() {
            if active.repo_token != self.inner.token {
                return Err(WraithError::ConcurrencyViolation(
                    "scopes nest only within one repository",
                ));
            }
        }
        let txn = Arc::new(Transaction {
            id: self.inner.next_txn.fetch_add(1, Ordering::AcqRel),
            repo_token: self.inner.token,
            writable,
            busy: AtomicBool::new(false),
            index: Mutex::new(GhostIndex::new()),
        });
        SCOPES.with(|scopes| scopes.borrow_mut().push(Arc::clone(&txn)));
        Ok(TxnScope {
            repo: Arc::clone(&self.inner),
            txn,
        })
    }

    fn write_meta(&self) -> Result<()> {
        self.inner.write_meta()
    }
}

impl RepositoryInner {
    fn write_meta(&self) -> Result<()> {
        let dir = self
            .dir
            .as_deref()
            .ok_or(WraithError::Config("persistent repository lost its directory"))?;
        let frame = *self.last_frame.lock();
        let meta = MetaFile {
            mode: self.store.mode(),
            last_commit: self.last_commit.load(Ordering::Acquire),
            last_frame_segment: frame.0,
            last_frame_offset: frame.1,
            segment_count: self.store.segment_count() as u32,
            salt: self.salt,
        };
        meta.write(dir)
    }
}

/// One transaction: a private object index plus the busy guard enforcing a
/// single in-flight writer.
pub struct Transaction {
    id: u64,
    repo_token: u64,
    writable: bool,
    busy: AtomicBool,
    index: Mutex<GhostIndex>,
}

impl Transaction {
    /// Transaction id, stamped into every ghost this transaction owns.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Whether this transaction may create or mutate ghosts.
    pub fn is_writable(&self) -> bool {
        self.writable
    }

    /// Claims the busy flag. Two threads writing through one transaction
    /// instance is a programming error, not contention, so a held flag
    /// fails immediately instead of spinning.
    fn guard_write(&self) -> Result<BusyGuard<'_>> {
        if !self.writable {
            return Err(WraithError::ConcurrencyViolation(
                "write through a read scope",
            ));
        }
        if self
            .busy
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            return Err(WraithError::ConcurrencyViolation(
                "transaction already has a write in flight",
            ));
        }
        Ok(BusyGuard { txn: self })
    }
}

struct BusyGuard<'a> {
    txn: &'a Transaction,
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.txn.busy.store(false, Ordering::Release);
    }
}

/// A disposable transaction scope. Dropping it closes the transaction and
/// restores the previous context; [`TxnScope::commit`] persists first.
pub struct TxnScope {
    repo: Arc<RepositoryInner>,
    txn: Arc<Transaction>,
}

impl TxnScope {
    /// The scope's transaction.
    pub fn txn(&self) -> &Arc<Transaction> {
        &self.txn
    }

    /// Transaction id of this scope.
    pub fn id(&self) -> u64 {
        self.txn.id
    }

    /// Creates a ghost of `type_id`'s latest registered layout, owned by
    /// this transaction, and returns its identifier.
    pub fn create(&self, kind: GhostKind, type_id: u16) -> Result<GhostId> {
        let _busy = self.txn.guard_write()?;
        let layout = self.repo.registry.latest(type_id)?;
        let id = GhostId::new(kind, type_id);
        let ghost = Ghost::standalone(layout, id, self.txn.id)?;
        self.txn.index.lock().set(id, ghost);
        Ok(id)
    }

    /// Inserts or replaces a body keyed by its own identifier, adopting it
    /// into this transaction.
    pub fn put(&self, mut ghost: Ghost) -> Result<()> {
        let _busy = self.txn.guard_write()?;
        ghost.adopt(self.txn.id)?;
        let id = ghost.id()?;
        self.txn.index.lock().set(id, ghost);
        Ok(())
    }

    /// Fetches a ghost: this transaction's working copy if it has one,
    /// otherwise a read-only view of the committed blob. Absence is
    /// ordinary, not an error.
    pub fn get(&self, id: &GhostId) -> Result<Option<Ghost>> {
        if let Some(ghost) = self.txn.index.lock().get(id) {
            return Ok(Some(ghost.clone()));
        }
        self.committed(id)
    }

    /// Applies `apply` to a ghost's working copy, pulling the committed
    /// blob into this transaction first when needed. Returns `false` when
    /// the identifier is unknown.
    pub fn update(
        &self,
        id: &GhostId,
        apply: impl FnOnce(&mut Ghost) -> Result<()>,
    ) -> Result<bool> {
        let busy = self.txn.guard_write()?;
        let mut index = self.txn.index.lock();
        if let Some(ghost) = index.get_mut(id) {
            if ghost.header()?.txn_id != self.txn.id {
                return Err(WraithError::ConcurrencyViolation(
                    "ghost belongs to another transaction",
                ));
            }
            apply(ghost)?;
            return Ok(true);
        }
        drop(index);
        drop(busy);
        let Some(mut ghost) = self.committed(id)? else {
            return Ok(false);
        };
        let busy = self.txn.guard_write()?;
        ghost.adopt(self.txn.id)?;
        apply(&mut ghost)?;
        self.txn.index.lock().set(*id, ghost);
        drop(busy);
        Ok(true)
    }

    /// Logically deletes a ghost by setting its tombstone flag. The blob
    /// itself is never reclaimed.
    pub fn remove(&self, id: &GhostId) -> Result<bool> {
        self.update(id, |ghost| ghost.tombstone())
    }

    /// Commits the scope: appends every working copy to the arena and, on
    /// a persistent repository, writes a checksummed frame and rewrites
    /// the meta file. Returns the commit id.
    ///
    /// Commits are admitted strictly in call order.
    pub fn commit(self) -> Result<u64> {
        let _busy = self.txn.guard_write()?;
        let ticket = self.repo.commit_lock.lock();

        let mut blobs: Vec<(GhostId, Vec<u8>)> = Vec::new();
        {
            let index = self.txn.index.lock();
            for (id, ghost) in index.iter() {
                if let Some((segment, offset, len)) = ghost.mapped_range() {
                    // Already arena-resident; make the in-place writes
                    // durable and keep the location.
                    segment.flush(offset, len as usize)?;
                }
                blobs.push((*id, ghost.bytes()?.to_vec()));
            }
        }

        let mut placed: Vec<(GhostId, u32, u32, u32)> = Vec::with_capacity(blobs.len());
        for (id, blob) in &blobs {
            let (segment, offset) = self.repo.store.append(blob)?;
            placed.push((*id, segment.id(), offset, blob.len() as u32));
        }

        if self.repo.store.mode().is_persistent() && !blobs.is_empty() {
            let records: Vec<&[u8]> = blobs.iter().map(|(_, blob)| blob.as_slice()).collect();
            let prev = *self.repo.last_frame.lock();
            let frame =
                write_txn_frame(&self.repo.store, self.repo.salt, self.txn.id, prev, &records)?;
            *self.repo.last_frame.lock() = frame;
        }

        {
            let mut resident = self.repo.resident.write();
            for (id, segment, offset, len) in placed {
                resident.insert(
                    id,
                    Resident::Arena {
                        segment,
                        offset,
                        len,
                    },
                );
            }
        }

        self.repo.last_commit.store(self.txn.id, Ordering::Release);
        if self.repo.store.mode().is_persistent() {
            self.repo.write_meta()?;
        }
        debug!(
            txn_id = self.txn.id,
            ghosts = blobs.len(),
            ticket = ticket.ticket(),
            "transaction committed"
        );
        Ok(self.txn.id)
    }

    /// Read-only view of a committed blob, if any.
    fn committed(&self, id: &GhostId) -> Result<Option<Ghost>> {
        let resident = self.repo.resident.read();
        match resident.get(id) {
            None => Ok(None),
            Some(Resident::Arena {
                segment,
                offset,
                len,
            }) => {
                let segment = self
                    .repo
                    .store
                    .segment(*segment)
                    .ok_or(WraithError::Corruption("resident blob names unknown segment"))?;
                let header = GhostHeader::from_bytes(segment.read(*offset, GhostHeader::SIZE)?)?;
                let layout = self.repo.registry.get(id.type_id(), header.version)?;
                Ghost::mapped(layout, segment, *offset, *len, false).map(Some)
            }
            Some(Resident::Heap(bytes)) => {
                let header = GhostHeader::from_bytes(bytes)?;
                let layout = self.repo.registry.get(id.type_id(), header.version)?;
                Ghost::owned(layout, bytes.to_vec()).map(Some)
            }
        }
    }
}

impl Drop for TxnScope {
    fn drop(&mut self) {
        SCOPES.with(|scopes| {
            let mut scopes = scopes.borrow_mut();
            if let Some(top) = scopes.last() {
                if Arc::ptr_eq(top, &self.txn) {
                    scopes.pop();
                }
            }
        });
    }
}
