//! Transactional references.
//!
//! A [`Ref`] is a shared cell owned by one [`Stm`]. Its committed value and
//! version live behind a `parking_lot::RwLock`; the version is mirrored in an
//! atomic so conflict scans never touch the lock. Access goes through a
//! [`Transaction`] (`open_for_read`, `open_for_write`, `commute`, ...) or, for
//! single-ref updates, through the `atomic_*` operations.
//!
//! Version 0 marks a ref constructed inside a transaction that has not
//! committed yet. Refs created outside a transaction start at version 1.

use crate::stm::{Stm, StmShared};
use crate::tranlocal::Tranlocal;
use crate::transaction::Transaction;
use parking_lot::RwLock;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tessera_concurrency::{ArriveStatus, BackoffPolicy, ExponentialBackoff, Orec, OrecState};
use tessera_core::{ConflictReason, LockMode, RefId, Result, StmError};

/// Values that can be stored in a [`Ref`].
pub trait TxValue: Clone + Send + Sync + 'static {}

impl<T: Clone + Send + Sync + 'static> TxValue for T {}

/// Version of a ref that has never been committed.
pub const VERSION_UNCOMMITTED: u64 = 0;

pub(crate) type EqFn<T> = fn(&T, &T) -> bool;

pub(crate) struct RefInner<T> {
    id: RefId,
    stm: Arc<StmShared>,
    orec: Orec,
    version: AtomicU64,
    value: RwLock<T>,
    eq: Option<EqFn<T>>,
}

/// Outcome of a successful load.
pub(crate) struct Loaded<T> {
    pub(crate) value: T,
    pub(crate) version: u64,
    pub(crate) lock_mode: LockMode,
    pub(crate) has_depart_obligation: bool,
}

/// Shared transactional cell.
///
/// Cloning a `Ref` clones the handle, not the value.
pub struct Ref<T> {
    inner: Arc<RefInner<T>>,
}

impl<T> Clone for Ref<T> {
    fn clone(&self) -> Self {
        Ref {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: TxValue + PartialEq> Ref<T> {
    /// Create a committed ref; writes of an equal value are not published.
    pub fn new(stm: &Stm, value: T) -> Self {
        Ref::build(stm.shared(), value, Some(<T as PartialEq>::eq), Orec::new(), 1)
    }

    /// Create a ref inside `tx`.
    ///
    /// The ref stays commit-locked and invisible to other transactions until
    /// `tx` commits. If `tx` aborts, the ref is never published and every
    /// later load fails with an `Uncommitted` conflict.
    pub fn new_in(tx: &mut Transaction, value: T) -> Result<Self> {
        tx.construct(value, Some(<T as PartialEq>::eq))
    }

    /// Compare-and-set outside any transaction.
    pub fn atomic_compare_and_set(&self, expected: &T, new_value: T) -> Result<bool> {
        self.lock_for_atomic_update()?;
        let matches = *self.inner.value.read() == *expected;
        if !matches {
            self.inner.orec.depart_after_failure_and_unlock(LockMode::Commit);
            return Ok(false);
        }
        self.finish_atomic_update(new_value);
        Ok(true)
    }
}

impl<T: TxValue> Ref<T> {
    /// Create a committed ref for a value without equality; every write is published.
    pub fn new_unchecked(stm: &Stm, value: T) -> Self {
        Ref::build(stm.shared(), value, None, Orec::new(), 1)
    }

    fn build(stm: &Arc<StmShared>, value: T, eq: Option<EqFn<T>>, orec: Orec, version: u64) -> Self {
        Ref {
            inner: Arc::new(RefInner {
                id: stm.next_ref_id(),
                stm: Arc::clone(stm),
                orec,
                version: AtomicU64::new(version),
                value: RwLock::new(value),
                eq,
            }),
        }
    }

    pub(crate) fn new_constructed(stm: &Arc<StmShared>, value: T, eq: Option<EqFn<T>>) -> Self {
        Ref::build(
            stm,
            value,
            eq,
            Orec::new_locked_for_construction(),
            VERSION_UNCOMMITTED,
        )
    }

    /// Identifier, unique within the owning STM.
    #[inline]
    pub fn id(&self) -> RefId {
        self.inner.id
    }

    /// Committed version.
    #[inline]
    pub fn version(&self) -> u64 {
        self.inner.version.load(Ordering::Acquire)
    }

    /// Strongest lock currently held on this ref by any transaction.
    pub fn atomic_lock_mode(&self) -> LockMode {
        self.inner.orec.lock_mode()
    }

    /// Decoded ownership record.
    pub fn orec_state(&self) -> OrecState {
        self.inner.orec.state()
    }

    #[inline]
    pub(crate) fn orec(&self) -> &Orec {
        &self.inner.orec
    }

    #[inline]
    pub(crate) fn eq_fn(&self) -> Option<EqFn<T>> {
        self.inner.eq
    }

    pub(crate) fn is_owned_by(&self, stm: &Arc<StmShared>) -> bool {
        Arc::ptr_eq(&self.inner.stm, stm)
    }

    fn snapshot(&self) -> (T, u64) {
        let guard = self.inner.value.read();
        (guard.clone(), self.version())
    }

    /// Install a new committed value. The caller holds the commit lock.
    pub(crate) fn publish(&self, value: T, version: u64) {
        let mut guard = self.inner.value.write();
        *guard = value;
        self.inner.version.store(version, Ordering::Release);
    }

    /// Read the committed value, optionally locking and/or arriving.
    ///
    /// With a lock mode the orec is locked first, so the value cannot change
    /// underneath. Without one, the value is read and then confirmed against
    /// the version once the commit lock is observed free.
    pub(crate) fn load(
        &self,
        lock_mode: LockMode,
        spin_count: u32,
        arrive: bool,
    ) -> std::result::Result<Loaded<T>, ConflictReason> {
        let orec = &self.inner.orec;

        if lock_mode.is_locked() {
            let status = orec.try_lock_and_arrive(spin_count, lock_mode);
            if status.is_lock_not_free() {
                return Err(ConflictReason::LockNotFree);
            }
            let (value, version) = self.snapshot();
            if version == VERSION_UNCOMMITTED {
                if status.is_normal() {
                    orec.depart_after_failure_and_unlock(lock_mode);
                } else {
                    orec.unlock_by_read_biased(lock_mode);
                }
                return Err(ConflictReason::Uncommitted);
            }
            return Ok(Loaded {
                value,
                version,
                lock_mode,
                has_depart_obligation: status.is_normal(),
            });
        }

        loop {
            let (value, version) = self.snapshot();
            let status = if arrive {
                match orec.arrive(spin_count) {
                    ArriveStatus::LockNotFree => return Err(ConflictReason::LockNotFree),
                    status => status,
                }
            } else {
                if !orec.wait_for_no_commit_lock(spin_count) {
                    return Err(ConflictReason::LockNotFree);
                }
                ArriveStatus::Unregistered
            };

            if self.version() == version {
                if version == VERSION_UNCOMMITTED {
                    if status.is_normal() {
                        orec.depart_after_failure();
                    }
                    return Err(ConflictReason::Uncommitted);
                }
                return Ok(Loaded {
                    value,
                    version,
                    lock_mode: LockMode::None,
                    has_depart_obligation: status.is_normal(),
                });
            }

            if status.is_normal() {
                orec.depart_after_failure();
            }
        }
    }

    // ------------------------------------------------------------------------
    // Transactional access
    // ------------------------------------------------------------------------

    /// Open for reading, acquiring at least `lock_mode`.
    pub fn open_for_read<'a>(
        &self,
        tx: &'a mut Transaction,
        lock_mode: LockMode,
    ) -> Result<&'a Tranlocal<T>> {
        tx.open_for_read(self, lock_mode)
    }

    /// Open for writing, acquiring at least `lock_mode`.
    pub fn open_for_write<'a>(
        &self,
        tx: &'a mut Transaction,
        lock_mode: LockMode,
    ) -> Result<&'a mut Tranlocal<T>> {
        tx.open_for_write(self, lock_mode)
    }

    /// Access the tranlocal of a ref that `tx` is constructing.
    pub fn open_for_construction<'a>(&self, tx: &'a mut Transaction) -> Result<&'a mut Tranlocal<T>> {
        tx.open_for_construction(self)
    }

    /// Queue `f` to be applied to the latest committed value at prepare.
    pub fn commute<F>(&self, tx: &mut Transaction, f: F) -> Result<()>
    where
        F: FnOnce(&T) -> Result<T> + Send + 'static,
    {
        tx.commute(self, f)
    }

    /// Read the value seen by `tx`.
    pub fn get(&self, tx: &mut Transaction) -> Result<T> {
        Ok(tx.open_for_read(self, LockMode::None)?.value().clone())
    }

    /// Write `value` in `tx`.
    pub fn set(&self, tx: &mut Transaction, value: T) -> Result<()> {
        tx.open_for_write(self, LockMode::None)?.set(value);
        Ok(())
    }

    /// Replace the value with `f(old)` in `tx` and return the new value.
    pub fn alter<F>(&self, tx: &mut Transaction, f: F) -> Result<T>
    where
        F: FnOnce(&T) -> T,
    {
        let tranlocal = tx.open_for_write(self, LockMode::None)?;
        let new_value = f(tranlocal.value());
        tranlocal.set(new_value.clone());
        Ok(new_value)
    }

    /// Write `value` in `tx` and return the value it replaced.
    pub fn get_and_set(&self, tx: &mut Transaction, value: T) -> Result<T> {
        let tranlocal = tx.open_for_write(self, LockMode::None)?;
        let old = tranlocal.value().clone();
        tranlocal.set(value);
        Ok(old)
    }

    /// Replace the value with `f(old)` in `tx` and return the old value.
    pub fn get_and_alter<F>(&self, tx: &mut Transaction, f: F) -> Result<T>
    where
        F: FnOnce(&T) -> T,
    {
        let tranlocal = tx.open_for_write(self, LockMode::None)?;
        let old = tranlocal.value().clone();
        tranlocal.set(f(&old));
        Ok(old)
    }

    /// Make sure `tx` holds at least `lock_mode` on this ref.
    pub fn acquire(&self, tx: &mut Transaction, lock_mode: LockMode) -> Result<()> {
        tx.open_for_read(self, lock_mode).map(|_| ())
    }

    /// Write-lock the ref so no other transaction can commit to it before `tx` completes.
    pub fn ensure(&self, tx: &mut Transaction) -> Result<()> {
        self.acquire(tx, LockMode::Write)
    }

    // ------------------------------------------------------------------------
    // Atomic access
    // ------------------------------------------------------------------------

    fn atomic_backoff(&self) -> (ExponentialBackoff, u32, u32) {
        let config = &self.inner.stm.config().transaction;
        (
            ExponentialBackoff::from(&config.backoff),
            config.spin_count,
            config.max_retries,
        )
    }

    /// Read the committed value outside any transaction.
    pub fn atomic_get(&self) -> Result<T> {
        let (backoff, spin_count, max_attempts) = self.atomic_backoff();
        for attempt in 1..=max_attempts {
            if self.inner.orec.wait_for_no_commit_lock(spin_count) {
                let (value, version) = self.snapshot();
                if version == VERSION_UNCOMMITTED {
                    return Err(StmError::conflict(ConflictReason::Uncommitted));
                }
                return Ok(value);
            }
            backoff.delay(attempt);
        }
        Err(StmError::conflict(ConflictReason::LockNotFree))
    }

    /// Write `value` outside any transaction and return the commit version.
    pub fn atomic_set(&self, value: T) -> Result<u64> {
        self.lock_for_atomic_update()?;
        Ok(self.finish_atomic_update(value))
    }

    /// Write `value` outside any transaction and return the previous value.
    pub fn atomic_get_and_set(&self, value: T) -> Result<T> {
        self.lock_for_atomic_update()?;
        let old = self.inner.value.read().clone();
        self.finish_atomic_update(value);
        Ok(old)
    }

    /// Replace the committed value with `f(old)` outside any transaction and
    /// return the new value. `f` runs once, under the commit lock.
    pub fn atomic_alter_and_get<F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&T) -> T,
    {
        self.lock_for_atomic_update()?;
        let new_value = f(&*self.inner.value.read());
        self.finish_atomic_update(new_value.clone());
        Ok(new_value)
    }

    /// Like [`Ref::atomic_alter_and_get`] but returns the previous value.
    pub fn atomic_get_and_alter<F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&T) -> T,
    {
        self.lock_for_atomic_update()?;
        let old = self.inner.value.read().clone();
        let new_value = f(&old);
        self.finish_atomic_update(new_value);
        Ok(old)
    }

    fn lock_for_atomic_update(&self) -> Result<()> {
        let (backoff, spin_count, max_attempts) = self.atomic_backoff();
        for attempt in 1..=max_attempts {
            match self.inner.orec.try_lock_and_arrive(spin_count, LockMode::Commit) {
                ArriveStatus::LockNotFree => backoff.delay(attempt),
                status => {
                    if self.version() == VERSION_UNCOMMITTED {
                        if status.is_normal() {
                            self.inner.orec.depart_after_failure_and_unlock(LockMode::Commit);
                        } else {
                            self.inner.orec.unlock_by_read_biased(LockMode::Commit);
                        }
                        return Err(StmError::conflict(ConflictReason::Uncommitted));
                    }
                    return Ok(());
                }
            }
        }
        Err(StmError::conflict(ConflictReason::LockNotFree))
    }

    fn finish_atomic_update(&self, value: T) -> u64 {
        let stm = &self.inner.stm;
        let commit_version = stm.manager().allocate_version();
        self.publish(value, self.version() + 1);
        self.inner.orec.depart_after_update_and_unlock(stm.conflict_counter());
        stm.metrics().record_commit();
        commit_version
    }
}

impl<T> PartialEq for Ref<T> {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl<T> Eq for Ref<T> {}

impl<T> Hash for Ref<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.inner.id.hash(state);
    }
}

impl<T> fmt::Debug for Ref<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ref")
            .field("id", &self.inner.id)
            .field("version", &self.inner.version.load(Ordering::Acquire))
            .field("orec", &self.inner.orec)
            .finish()
    }
}
