#![forbid(unsafe_code)]
//! CAS-based spin primitives used across the engine.
//!
//! All five locks busy-wait with exponential backoff; none of them issue a
//! blocking syscall or support timeouts. They coordinate short critical
//! sections (segment list growth, flush serialization, commit ordering)
//! where parking a thread would cost more than the wait itself.

use std::cell::Cell;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicU64, AtomicUsize, Ordering};

const SPIN_LIMIT: u32 = 6;
const BACKOFF_LIMIT: u32 = 10;

/// Exponential spin-wait backoff, escalating to scheduler yields once the
/// spin budget is exhausted.
pub struct Backoff {
    step: u32,
}

impl Backoff {
    /// Creates a fresh backoff with zero accumulated contention.
    pub fn new() -> Self {
        Self { step: 0 }
    }

    /// Waits a little longer than the previous call did.
    pub fn snooze(&mut self) {
        if self.step <= SPIN_LIMIT {
            for _ in 0..(1u32 << self.step) {
                std::hint::spin_loop();
            }
        } else {
            std::thread::yield_now();
        }
        if self.step < BACKOFF_LIMIT {
            self.step += 1;
        }
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new()
    }
}

static NEXT_THREAD_TOKEN: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static THREAD_TOKEN: Cell<u64> = Cell::new(0);
}

/// Returns a small, process-unique, non-zero integer for the calling thread.
///
/// `std::thread::ThreadId` cannot be stored in an atomic, so the recursive
/// lock keys ownership off this token instead.
pub fn thread_token() -> u64 {
    THREAD_TOKEN.with(|slot| {
        let mut token = slot.get();
        if token == 0 {
            token = NEXT_THREAD_TOKEN.fetch_add(1, Ordering::Relaxed);
            slot.set(token);
        }
        token
    })
}

/// Exclusive spin lock: a single flag, CAS to acquire, plain store to
/// release.
pub struct SpinLock {
    locked: AtomicBool,
}

/// RAII guard for [`SpinLock`].
pub struct SpinGuard<'a> {
    lock: &'a SpinLock,
}

impl SpinLock {
    /// Creates an unlocked lock.
    pub const fn new() -> Self {
        Self {
            locked: AtomicBool::new(false),
        }
    }

    /// Spins until the lock is acquired.
    pub fn lock(&self) -> SpinGuard<'_> {
        let mut backoff = Backoff::new();
        while self
            .locked
            .compare_exchange_weak(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            backoff.snooze();
        }
        SpinGuard { lock: self }
    }

    /// Acquires the lock only if it is currently free.
    pub fn try_lock(&self) -> Option<SpinGuard<'_>> {
        self.locked
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| SpinGuard { lock: self })
    }
}

impl Default for SpinLock {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for SpinGuard<'_> {
    fn drop(&mut self) {
        self.lock.locked.store(false, Ordering::Release);
    }
}

/// Re-entrant spin lock: stores the owning thread token and a recursion
/// depth; the lock is released only when the depth returns to zero.
pub struct RecursiveSpinLock {
    owner: AtomicU64,
    // Mutated only by the thread recorded in `owner`.
    depth: AtomicU32,
    flag: SpinLock,
}

/// RAII guard for [`RecursiveSpinLock`].
pub struct RecursiveGuard<'a> {
    lock: &'a RecursiveSpinLock,
}

impl RecursiveSpinLock {
    /// Creates an unlocked lock.
    pub const fn new() -> Self {
        Self {
            owner: AtomicU64::new(0),
            depth: AtomicU32::new(0),
            flag: SpinLock::new(),
        }
    }

    /// Acquires the lock, spinning unless the caller already owns it.
    pub fn lock(&self) -> RecursiveGuard<'_> {
        let me = thread_token();
        if self.owner.load(Ordering::Acquire) == me {
            self.depth.fetch_add(1, Ordering::Relaxed);
            return RecursiveGuard { lock: self };
        }
        let guard = self.flag.lock();
        // Keep the inner flag held for the whole ownership span; it is
        // cleared directly on final release.
        std::mem::forget(guard);
        self.owner.store(me, Ordering::Release);
        self.depth.store(1, Ordering::Relaxed);
        RecursiveGuard { lock: self }
    }

    /// Returns the current recursion depth as seen by the owner.
    pub fn depth(&self) -> u32 {
        self.depth.load(Ordering::Relaxed)
    }
}

impl Default for RecursiveSpinLock {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for RecursiveGuard<'_> {
    fn drop(&mut self) {
        let depth = self.lock.depth.load(Ordering::Relaxed);
        debug_assert!(depth > 0, "recursive lock released below zero");
        if depth == 1 {
            self.lock.depth.store(0, Ordering::Relaxed);
            self.lock.owner.store(0, Ordering::Release);
            self.lock.flag.locked.store(false, Ordering::Release);
        } else {
            self.lock.depth.store(depth - 1, Ordering::Relaxed);
        }
    }
}

/// Bounded-count spin lock: admits up to `max` concurrent holders.
pub struct CountingSpinLock {
    max: usize,
    count: AtomicUsize,
}

/// RAII guard for [`CountingSpinLock`].
pub struct CountGuard<'a> {
    lock: &'a CountingSpinLock,
}

impl CountingSpinLock {
    /// Creates a lock admitting at most `max` holders; `max` must be
    /// non-zero.
    pub fn new(max: usize) -> Self {
        assert!(max > 0, "counting lock requires a positive holder limit");
        Self {
            max,
            count: AtomicUsize::new(0),
        }
    }

    /// Spins until a holder slot is free, then takes it.
    pub fn acquire(&self) -> CountGuard<'_> {
        let mut backoff = Backoff::new();
        loop {
            let current = self.count.load(Ordering::Acquire);
            if current < self.max
                && self
                    .count
                    .compare_exchange_weak(current, current + 1, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
            {
                return CountGuard { lock: self };
            }
            backoff.snooze();
        }
    }

    /// Number of slots currently held.
    pub fn holders(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }
}

impl Drop for CountGuard<'_> {
    fn drop(&mut self) {
        self.lock.count.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Writer sentinel for [`RwSpinLock`]: far below any reachable reader count.
const WRITER_SENTINEL: i64 = i64::MIN / 2;

/// Reader-writer spin lock over a single signed counter: positive values
/// count active readers, the negative sentinel marks one active writer.
pub struct RwSpinLock {
    state: AtomicI64,
}

/// RAII guard for a shared (reader) hold on [`RwSpinLock`].
pub struct ReadGuard<'a> {
    lock: &'a RwSpinLock,
}

/// RAII guard for an exclusive (writer) hold on [`RwSpinLock`].
pub struct WriteGuard<'a> {
    lock: &'a RwSpinLock,
}

impl RwSpinLock {
    /// Creates an unlocked lock.
    pub const fn new() -> Self {
        Self {
            state: AtomicI64::new(0),
        }
    }

    /// Acquires a shared hold; spins while a writer is active.
    pub fn read(&self) -> ReadGuard<'_> {
        let mut backoff = Backoff::new();
        loop {
            let current = self.state.load(Ordering::Acquire);
            if current >= 0
                && self
                    .state
                    .compare_exchange_weak(current, current + 1, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
            {
                return ReadGuard { lock: self };
            }
            backoff.snooze();
        }
    }

    /// Acquires the exclusive hold; spins while any reader or writer is
    /// active.
    pub fn write(&self) -> WriteGuard<'_> {
        let mut backoff = Backoff::new();
        while self
            .state
            .compare_exchange_weak(0, WRITER_SENTINEL, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            backoff.snooze();
        }
        WriteGuard { lock: self }
    }

    /// Number of active readers, or -1 while a writer holds the lock.
    pub fn readers(&self) -> i64 {
        let state = self.state.load(Ordering::Acquire);
        if state < 0 {
            -1
        } else {
            state
        }
    }
}

impl Default for RwSpinLock {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ReadGuard<'_> {
    fn drop(&mut self) {
        self.lock.state.fetch_sub(1, Ordering::AcqRel);
    }
}

impl Drop for WriteGuard<'_> {
    fn drop(&mut self) {
        self.lock.state.store(0, Ordering::Release);
    }
}

/// Ticket lock: strict FIFO admission via tickets-taken / tickets-served
/// counters, eliminating starvation under contention.
pub struct TicketLock {
    next_ticket: AtomicU64,
    now_serving: AtomicU64,
}

/// RAII guard for [`TicketLock`].
pub struct TicketGuard<'a> {
    lock: &'a TicketLock,
    ticket: u64,
}

impl TicketLock {
    /// Creates an unlocked lock.
    pub const fn new() -> Self {
        Self {
            next_ticket: AtomicU64::new(0),
            now_serving: AtomicU64::new(0),
        }
    }

    /// Takes a ticket and spins until it is served.
    pub fn lock(&self) -> TicketGuard<'_> {
        let ticket = self.next_ticket.fetch_add(1, Ordering::AcqRel);
        let mut backoff = Backoff::new();
        while self.now_serving.load(Ordering::Acquire) != ticket {
            backoff.snooze();
        }
        TicketGuard { lock: self, ticket }
    }
}

impl Default for TicketLock {
    fn default() -> Self {
        Self::new()
    }
}

impl TicketGuard<'_> {
    /// The ticket number admitted by this guard; tickets are handed out in
    /// strict call order.
    pub fn ticket(&self) -> u64 {
        self.ticket
    }
}

impl Drop for TicketGuard<'_> {
    fn drop(&mut self) {
        self.lock.now_serving.fetch_add(1, Ordering::AcqRel);
    }
}
