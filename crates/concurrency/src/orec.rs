//! Ownership record (orec): the per-ref lock and reader-registration word.
//!
//! All state lives in one `AtomicU64`:
//!
//! ```text
//!  63   62   61   60 ........ 40   39 ........ 10   9 ..... 0
//! +----+----+----+--------------+----------------+-----------+
//! | C  | W  | RB |  read locks  |    surplus     | readonly  |
//! +----+----+----+--------------+----------------+-----------+
//!  C  = commit lock (exclusive)
//!  W  = write lock
//!  RB = read-biased
//! ```
//!
//! - **surplus**: transactions currently registered (arrived) on the orec.
//!   A read-biased orec keeps surplus at 0 or 1 and readers no longer register.
//! - **read locks**: number of shared read locks held.
//! - **readonly**: consecutive read-only departures; once it reaches
//!   [`READ_BIASED_THRESHOLD`] while surplus drops to 0, the orec turns
//!   read-biased.
//!
//! The word only changes through CAS loops. The one plain store is made by the
//! commit-lock holder when it departs as the last registered transaction:
//! every other writer of the word is excluded at that point.
//!
//! Illegal transitions (departing without arriving, unlocking a lock that is
//! not held) are engine bugs and panic with the decoded state.

use crate::backoff::spin_yield;
use crate::conflict::GlobalConflictCounter;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use tessera_core::LockMode;

/// Consecutive read-only departures before an orec becomes read-biased.
pub const READ_BIASED_THRESHOLD: u32 = 16;

const COMMIT_LOCK: u64 = 1 << 63;
const WRITE_LOCK: u64 = 1 << 62;
const READ_BIASED: u64 = 1 << 61;

const READ_LOCKS_SHIFT: u32 = 40;
const READ_LOCKS_BITS: u32 = 21;
const READ_LOCKS_MAX: u64 = (1 << READ_LOCKS_BITS) - 1;
const READ_LOCKS_MASK: u64 = READ_LOCKS_MAX << READ_LOCKS_SHIFT;

const SURPLUS_SHIFT: u32 = 10;
const SURPLUS_BITS: u32 = 30;
const SURPLUS_MAX: u64 = (1 << SURPLUS_BITS) - 1;
const SURPLUS_MASK: u64 = SURPLUS_MAX << SURPLUS_SHIFT;

const READONLY_MASK: u64 = (1 << SURPLUS_SHIFT) - 1;

// ============================================================================
// Word accessors
// ============================================================================

mod word {
    use super::*;

    #[inline]
    pub fn has_commit_lock(w: u64) -> bool {
        w & COMMIT_LOCK != 0
    }

    #[inline]
    pub fn has_write_lock(w: u64) -> bool {
        w & WRITE_LOCK != 0
    }

    #[inline]
    pub fn is_read_biased(w: u64) -> bool {
        w & READ_BIASED != 0
    }

    #[inline]
    pub fn read_locks(w: u64) -> u64 {
        (w & READ_LOCKS_MASK) >> READ_LOCKS_SHIFT
    }

    #[inline]
    pub fn has_any_lock(w: u64) -> bool {
        w & (COMMIT_LOCK | WRITE_LOCK | READ_LOCKS_MASK) != 0
    }

    #[inline]
    pub fn surplus(w: u64) -> u64 {
        (w & SURPLUS_MASK) >> SURPLUS_SHIFT
    }

    #[inline]
    pub fn readonly_count(w: u64) -> u32 {
        (w & READONLY_MASK) as u32
    }

    #[inline]
    pub fn set_flag(w: u64, flag: u64, on: bool) -> u64 {
        if on {
            w | flag
        } else {
            w & !flag
        }
    }

    #[inline]
    pub fn set_read_locks(w: u64, n: u64) -> u64 {
        debug_assert!(n <= READ_LOCKS_MAX);
        (w & !READ_LOCKS_MASK) | (n << READ_LOCKS_SHIFT)
    }

    #[inline]
    pub fn set_surplus(w: u64, n: u64) -> u64 {
        debug_assert!(n <= SURPLUS_MAX);
        (w & !SURPLUS_MASK) | (n << SURPLUS_SHIFT)
    }

    #[inline]
    pub fn set_readonly_count(w: u64, n: u32) -> u64 {
        debug_assert!((n as u64) <= READONLY_MASK);
        (w & !READONLY_MASK) | n as u64
    }

    /// Whether a request for `mode` must wait given the current word.
    #[inline]
    pub fn blocks(w: u64, mode: LockMode) -> bool {
        match mode {
            LockMode::None | LockMode::Read => has_commit_lock(w),
            LockMode::Write => w & (COMMIT_LOCK | WRITE_LOCK) != 0,
            LockMode::Commit => has_any_lock(w),
        }
    }
}

// ============================================================================
// OrecState
// ============================================================================

/// Decoded view of an orec word, for diagnostics and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct OrecState {
    /// Commit lock held
    pub commit_lock: bool,
    /// Write lock held
    pub write_lock: bool,
    /// Readers no longer register
    pub read_biased: bool,
    /// Shared read locks held
    pub read_locks: u64,
    /// Registered transactions
    pub surplus: u64,
    /// Consecutive read-only departures
    pub readonly_count: u32,
}

impl OrecState {
    fn decode(w: u64) -> Self {
        OrecState {
            commit_lock: word::has_commit_lock(w),
            write_lock: word::has_write_lock(w),
            read_biased: word::is_read_biased(w),
            read_locks: word::read_locks(w),
            surplus: word::surplus(w),
            readonly_count: word::readonly_count(w),
        }
    }

    /// Strongest lock currently held by anyone.
    pub fn lock_mode(&self) -> LockMode {
        if self.commit_lock {
            LockMode::Commit
        } else if self.write_lock {
            LockMode::Write
        } else if self.read_locks > 0 {
            LockMode::Read
        } else {
            LockMode::None
        }
    }
}

impl fmt::Display for OrecState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Orec(commit={}, write={}, read_biased={}, read_locks={}, surplus={}, readonly={})",
            self.commit_lock,
            self.write_lock,
            self.read_biased,
            self.read_locks,
            self.surplus,
            self.readonly_count
        )
    }
}

/// Outcome of an arrival.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArriveStatus {
    /// Registered on the surplus; the caller owes a depart
    Normal,
    /// Read-biased orec; nothing to depart from
    Unregistered,
    /// Blocked by a lock for longer than the spin budget
    LockNotFree,
}

impl ArriveStatus {
    /// Whether the caller now has a depart obligation.
    #[inline]
    pub fn is_normal(self) -> bool {
        self == ArriveStatus::Normal
    }

    /// Whether the arrival failed.
    #[inline]
    pub fn is_lock_not_free(self) -> bool {
        self == ArriveStatus::LockNotFree
    }
}

// ============================================================================
// Orec
// ============================================================================

/// Ownership record guarding one ref.
pub struct Orec {
    word: AtomicU64,
}

impl Orec {
    /// A free orec: no locks, no registered transactions.
    pub const fn new() -> Self {
        Orec {
            word: AtomicU64::new(0),
        }
    }

    /// An orec commit-locked by the transaction constructing its ref, with
    /// that transaction registered.
    pub const fn new_locked_for_construction() -> Self {
        Orec {
            word: AtomicU64::new(COMMIT_LOCK | (1 << SURPLUS_SHIFT)),
        }
    }

    /// Decode the current word.
    pub fn state(&self) -> OrecState {
        OrecState::decode(self.load())
    }

    /// Strongest lock currently held.
    pub fn lock_mode(&self) -> LockMode {
        self.state().lock_mode()
    }

    /// Whether the commit lock is held.
    #[inline]
    pub fn has_commit_lock(&self) -> bool {
        word::has_commit_lock(self.load())
    }

    /// Whether the orec is read-biased.
    #[inline]
    pub fn is_read_biased(&self) -> bool {
        word::is_read_biased(self.load())
    }

    /// Registered transactions.
    #[inline]
    pub fn surplus(&self) -> u64 {
        word::surplus(self.load())
    }

    #[inline]
    fn load(&self) -> u64 {
        self.word.load(Ordering::Acquire)
    }

    #[inline]
    fn cas(&self, current: u64, next: u64) -> bool {
        self.word
            .compare_exchange_weak(current, next, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    #[cold]
    fn panic_with(&self, w: u64, msg: &str) -> ! {
        let state = OrecState::decode(w);
        tracing::error!(%state, "illegal orec transition: {}", msg);
        panic!("{}: {}", msg, state)
    }

    /// Surplus after one more arrival, respecting read bias.
    #[inline]
    fn arrived_surplus(&self, w: u64) -> u64 {
        let surplus = word::surplus(w);
        if word::is_read_biased(w) {
            match surplus {
                0 => 1,
                1 => 1,
                _ => self.panic_with(w, "read-biased orec with surplus larger than 1"),
            }
        } else {
            if surplus == SURPLUS_MAX {
                self.panic_with(w, "orec surplus overflow");
            }
            surplus + 1
        }
    }

    // ------------------------------------------------------------------------
    // Arrival and locking
    // ------------------------------------------------------------------------

    /// Register a reader, spinning while the commit lock is held.
    pub fn arrive(&self, spin_count: u32) -> ArriveStatus {
        let mut spins = spin_count as i64;
        loop {
            let current = self.load();
            if word::has_commit_lock(current) {
                spins -= 1;
                if spins < 0 {
                    return ArriveStatus::LockNotFree;
                }
                spin_yield(spins);
                continue;
            }

            let biased = word::is_read_biased(current);
            if biased && word::surplus(current) == 1 {
                return ArriveStatus::Unregistered;
            }
            let next = word::set_surplus(current, self.arrived_surplus(current));
            if self.cas(current, next) {
                return if biased {
                    ArriveStatus::Unregistered
                } else {
                    ArriveStatus::Normal
                };
            }
        }
    }

    /// Wait until the commit lock is free without registering.
    ///
    /// Returns false when the spin budget ran out.
    pub fn wait_for_no_commit_lock(&self, spin_count: u32) -> bool {
        let mut spins = spin_count as i64;
        while word::has_commit_lock(self.load()) {
            spins -= 1;
            if spins < 0 {
                return false;
            }
            spin_yield(spins);
        }
        true
    }

    /// Arrive and acquire `mode` in one step.
    ///
    /// # Panics
    ///
    /// If `mode` is `LockMode::None`.
    pub fn try_lock_and_arrive(&self, spin_count: u32, mode: LockMode) -> ArriveStatus {
        if mode == LockMode::None {
            panic!("try_lock_and_arrive requires a lock mode");
        }
        let mut spins = spin_count as i64;
        loop {
            let current = self.load();
            if word::blocks(current, mode) {
                spins -= 1;
                if spins < 0 {
                    return ArriveStatus::LockNotFree;
                }
                spin_yield(spins);
                continue;
            }

            let biased = word::is_read_biased(current);
            let mut next = word::set_surplus(current, self.arrived_surplus(current));
            next = self.add_lock(next, mode);
            if self.cas(current, next) {
                return if biased {
                    ArriveStatus::Unregistered
                } else {
                    ArriveStatus::Normal
                };
            }
        }
    }

    /// Acquire `mode` for a transaction that already arrived normally.
    ///
    /// # Panics
    ///
    /// If nobody is registered or the orec is read-biased.
    pub fn try_lock_after_normal_arrive(&self, spin_count: u32, mode: LockMode) -> bool {
        if mode == LockMode::None {
            panic!("try_lock_after_normal_arrive requires a lock mode");
        }
        let mut spins = spin_count as i64;
        loop {
            let current = self.load();
            if word::is_read_biased(current) {
                self.panic_with(current, "lock after normal arrive on a read-biased orec");
            }
            if word::surplus(current) == 0 {
                self.panic_with(current, "lock after normal arrive without surplus");
            }
            if word::blocks(current, mode) {
                spins -= 1;
                if spins < 0 {
                    return false;
                }
                spin_yield(spins);
                continue;
            }
            let next = self.add_lock(current, mode);
            if self.cas(current, next) {
                return true;
            }
        }
    }

    /// Upgrade a held read lock to `to` (`Write` or `Commit`).
    ///
    /// An upgrade to `Commit` waits until no other read lock is held.
    pub fn upgrade_read_lock(&self, spin_count: u32, to: LockMode) -> bool {
        let mut spins = spin_count as i64;
        loop {
            let current = self.load();
            let read_locks = word::read_locks(current);
            if read_locks == 0 {
                self.panic_with(current, "read lock upgrade without a read lock");
            }
            let blocked = match to {
                LockMode::Write => word::has_commit_lock(current) || word::has_write_lock(current),
                LockMode::Commit => {
                    word::has_commit_lock(current) || word::has_write_lock(current) || read_locks > 1
                }
                _ => panic!("read lock can only be upgraded to write or commit, not {}", to),
            };
            if blocked {
                spins -= 1;
                if spins < 0 {
                    return false;
                }
                spin_yield(spins);
                continue;
            }
            let next = self.add_lock(word::set_read_locks(current, read_locks - 1), to);
            if self.cas(current, next) {
                return true;
            }
        }
    }

    /// Upgrade a held write lock to the commit lock, waiting for read locks
    /// held by others to drain.
    pub fn upgrade_to_commit_lock(&self, spin_count: u32) -> bool {
        let mut spins = spin_count as i64;
        loop {
            let current = self.load();
            if !word::has_write_lock(current) {
                self.panic_with(current, "commit lock upgrade without a write lock");
            }
            if word::read_locks(current) > 0 {
                spins -= 1;
                if spins < 0 {
                    return false;
                }
                spin_yield(spins);
                continue;
            }
            let next = (current & !WRITE_LOCK) | COMMIT_LOCK;
            if self.cas(current, next) {
                return true;
            }
        }
    }

    fn add_lock(&self, w: u64, mode: LockMode) -> u64 {
        match mode {
            LockMode::None => w,
            LockMode::Read => {
                let n = word::read_locks(w);
                if n == READ_LOCKS_MAX {
                    self.panic_with(w, "read lock overflow");
                }
                word::set_read_locks(w, n + 1)
            }
            LockMode::Write => w | WRITE_LOCK,
            LockMode::Commit => w | COMMIT_LOCK,
        }
    }

    fn remove_lock(&self, w: u64, mode: LockMode) -> u64 {
        match mode {
            LockMode::None => self.panic_with(w, "unlock without a lock mode"),
            LockMode::Read => {
                let n = word::read_locks(w);
                if n == 0 {
                    self.panic_with(w, "read unlock without a read lock");
                }
                word::set_read_locks(w, n - 1)
            }
            LockMode::Write => {
                if !word::has_write_lock(w) {
                    self.panic_with(w, "write unlock without a write lock");
                }
                w & !WRITE_LOCK
            }
            LockMode::Commit => {
                if !word::has_commit_lock(w) {
                    self.panic_with(w, "commit unlock without a commit lock");
                }
                w & !COMMIT_LOCK
            }
        }
    }

    // ------------------------------------------------------------------------
    // Departure
    // ------------------------------------------------------------------------

    /// Depart after a read-only use of the ref.
    ///
    /// Counts toward the read bias: once [`READ_BIASED_THRESHOLD`] read-only
    /// departures leave the surplus at zero, the orec becomes read-biased.
    pub fn depart_after_reading(&self) {
        loop {
            let current = self.load();
            let surplus = word::surplus(current);
            if surplus == 0 {
                self.panic_with(current, "depart after reading without surplus");
            }
            if word::is_read_biased(current) {
                self.panic_with(current, "depart after reading on a read-biased orec");
            }
            if surplus <= 1 && word::has_any_lock(current) {
                self.panic_with(current, "depart after reading would leave a lock orphaned");
            }
            let next = self.read_departure(current, surplus - 1);
            if self.cas(current, next) {
                return;
            }
        }
    }

    /// Depart after a read-only use of the ref and release the caller's `mode` lock.
    pub fn depart_after_reading_and_unlock(&self, mode: LockMode) {
        loop {
            let current = self.load();
            let surplus = word::surplus(current);
            if surplus == 0 {
                self.panic_with(current, "depart after reading without surplus");
            }
            if word::is_read_biased(current) {
                self.panic_with(current, "depart after reading on a read-biased orec");
            }
            let unlocked = self.remove_lock(current, mode);
            let next = self.read_departure(unlocked, surplus - 1);
            if self.cas(current, next) {
                return;
            }
        }
    }

    fn read_departure(&self, w: u64, surplus: u64) -> u64 {
        let mut readonly = word::readonly_count(w);
        if readonly < READ_BIASED_THRESHOLD {
            readonly += 1;
        }
        let mut next = word::set_surplus(w, surplus);
        if surplus == 0 && !word::has_commit_lock(next) && readonly >= READ_BIASED_THRESHOLD {
            next = word::set_flag(next, READ_BIASED, true);
            readonly = 0;
        }
        word::set_readonly_count(next, readonly)
    }

    /// Whether committing an update must signal the conflict counter: some
    /// other transaction is registered, or the orec is read-biased and
    /// registrations are not counted.
    ///
    /// `registered` tells whether the caller itself arrived. Called by the
    /// commit-lock holder; no one can arrive while the lock is held, so the
    /// answer only changes from true to false.
    pub fn has_foreign_readers(&self, registered: bool) -> bool {
        let current = self.load();
        word::is_read_biased(current) || word::surplus(current) > registered as u64
    }

    /// Depart after publishing an update and release the commit lock.
    ///
    /// Signals `counter` exactly once if other transactions are still
    /// registered (or the orec was read-biased, where registrations are not
    /// counted). Clears read bias, read locks and the readonly count.
    /// Returns the surplus left behind.
    pub fn depart_after_update_and_unlock(&self, counter: &GlobalConflictCounter) -> u64 {
        self.depart_after_update(Some(counter))
    }

    /// Like [`Orec::depart_after_update_and_unlock`], for a committer that
    /// already signalled the conflict counter before publishing.
    pub fn depart_after_signalled_update_and_unlock(&self) -> u64 {
        self.depart_after_update(None)
    }

    fn depart_after_update(&self, counter: Option<&GlobalConflictCounter>) -> u64 {
        let mut signal = counter;
        loop {
            let current = self.load();
            if !word::has_commit_lock(current) {
                self.panic_with(current, "depart after update without the commit lock");
            }
            let mut surplus = word::surplus(current);
            if surplus == 0 {
                self.panic_with(current, "depart after update without surplus");
            }

            let biased = word::is_read_biased(current);
            if biased {
                if surplus > 1 {
                    self.panic_with(current, "read-biased orec with surplus larger than 1");
                }
                surplus = 0;
            } else {
                surplus -= 1;
            }

            if biased || surplus > 0 {
                if let Some(counter) = signal.take() {
                    counter.signal_conflict();
                }
            }

            if surplus == 0 {
                self.word.store(0, Ordering::Release);
                return 0;
            }

            if self.cas(current, word::set_surplus(0, surplus)) {
                return surplus;
            }
        }
    }

    /// Undo an arrival after an abort or a failed read.
    pub fn depart_after_failure(&self) {
        loop {
            let current = self.load();
            if word::is_read_biased(current) {
                self.panic_with(current, "depart after failure on a read-biased orec");
            }
            let surplus = word::surplus(current);
            if surplus == 0 {
                self.panic_with(current, "depart after failure without surplus");
            }
            if word::has_any_lock(current) && surplus < 2 {
                self.panic_with(current, "depart after failure would leave a lock orphaned");
            }
            let next = word::set_surplus(current, surplus - 1);
            if self.cas(current, next) {
                return;
            }
        }
    }

    /// Undo an arrival and release the caller's `mode` lock.
    ///
    /// A read-biased orec keeps its surplus. Returns the surplus left behind.
    pub fn depart_after_failure_and_unlock(&self, mode: LockMode) -> u64 {
        loop {
            let current = self.load();
            let mut surplus = word::surplus(current);
            if surplus == 0 {
                self.panic_with(current, "depart after failure without surplus");
            }
            if !word::is_read_biased(current) {
                surplus -= 1;
            }
            let next = word::set_surplus(self.remove_lock(current, mode), surplus);
            if self.cas(current, next) {
                return surplus;
            }
        }
    }

    /// Release the caller's `mode` lock on a read-biased orec, where the
    /// caller never registered.
    pub fn unlock_by_read_biased(&self, mode: LockMode) {
        loop {
            let current = self.load();
            if !word::is_read_biased(current) {
                self.panic_with(current, "unlock by read bias on an orec that is not read-biased");
            }
            if word::surplus(current) > 1 {
                self.panic_with(current, "read-biased orec with surplus larger than 1");
            }
            let next = self.remove_lock(current, mode);
            if self.cas(current, next) {
                return;
            }
        }
    }
}

impl Default for Orec {
    fn default() -> Self {
        Orec::new()
    }
}

impl fmt::Debug for Orec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.state())
    }
}
