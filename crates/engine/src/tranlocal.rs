//! Transaction-local copies of refs.
//!
//! A [`Tranlocal`] records everything a transaction knows about one ref: the
//! version it read, its private value, the lock it holds and whether it owes
//! the orec a depart. Transactions store tranlocals of different value types
//! side by side through the object-safe [`TxEntry`] trait.

use crate::reference::{Loaded, Ref, TxValue};
use smallvec::SmallVec;
use std::any::Any;
use std::fmt;
use tessera_core::{ConflictReason, LockMode, RefId, Result, StmError};

/// Deferred update applied to the latest committed value at prepare.
pub type CommuteFn<T> = Box<dyn FnOnce(&T) -> Result<T> + Send>;

/// How a transaction uses a ref.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TranlocalMode {
    /// Only read
    Read,
    /// Opened for write; published at commit if dirty
    Write,
    /// Created by this transaction
    Constructing,
    /// Only commuting functions queued, value not loaded yet
    Commuting,
}

/// A transaction's private view of one ref.
pub struct Tranlocal<T> {
    pub(crate) owner: Ref<T>,
    pub(crate) read_version: u64,
    pub(crate) value: Option<T>,
    pub(crate) old_value: Option<T>,
    pub(crate) lock_mode: LockMode,
    pub(crate) mode: TranlocalMode,
    pub(crate) dirty: bool,
    pub(crate) has_depart_obligation: bool,
    pub(crate) write_skew_check: bool,
    pub(crate) commutes: SmallVec<[CommuteFn<T>; 2]>,
}

impl<T: TxValue> Tranlocal<T> {
    pub(crate) fn loaded(owner: Ref<T>, loaded: Loaded<T>, write_skew_check: bool) -> Self {
        Tranlocal {
            owner,
            read_version: loaded.version,
            value: Some(loaded.value),
            old_value: None,
            lock_mode: loaded.lock_mode,
            mode: TranlocalMode::Read,
            dirty: false,
            has_depart_obligation: loaded.has_depart_obligation,
            write_skew_check,
            commutes: SmallVec::new(),
        }
    }

    pub(crate) fn constructing(owner: Ref<T>, value: T) -> Self {
        Tranlocal {
            owner,
            read_version: 0,
            value: Some(value),
            old_value: None,
            lock_mode: LockMode::Commit,
            mode: TranlocalMode::Constructing,
            dirty: true,
            has_depart_obligation: true,
            write_skew_check: false,
            commutes: SmallVec::new(),
        }
    }

    pub(crate) fn commuting(owner: Ref<T>, f: CommuteFn<T>) -> Self {
        let mut commutes = SmallVec::new();
        commutes.push(f);
        Tranlocal {
            owner,
            read_version: 0,
            value: None,
            old_value: None,
            lock_mode: LockMode::None,
            mode: TranlocalMode::Commuting,
            dirty: false,
            has_depart_obligation: false,
            write_skew_check: false,
            commutes,
        }
    }

    /// The ref this tranlocal belongs to.
    pub fn owner(&self) -> &Ref<T> {
        &self.owner
    }

    /// Value as seen by the transaction.
    ///
    /// # Panics
    ///
    /// If the tranlocal only holds queued commutes. Transactions never hand
    /// such tranlocals out.
    pub fn value(&self) -> &T {
        match &self.value {
            Some(v) => v,
            None => panic!("tranlocal for {} has no loaded value", self.owner.id()),
        }
    }

    /// Mutable access to the transaction's private value.
    pub fn value_mut(&mut self) -> &mut T {
        match &mut self.value {
            Some(v) => v,
            None => panic!("tranlocal for {} has no loaded value", self.owner.id()),
        }
    }

    /// Replace the transaction's private value.
    pub fn set(&mut self, value: T) {
        self.value = Some(value);
    }

    /// Version of the ref when it was loaded (0 while constructing).
    pub fn read_version(&self) -> u64 {
        self.read_version
    }

    /// Lock held on the ref.
    pub fn lock_mode(&self) -> LockMode {
        self.lock_mode
    }

    /// How the ref is used.
    pub fn mode(&self) -> TranlocalMode {
        self.mode
    }

    /// Whether the ref will be published at commit. Decided during prepare.
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Whether this transaction is registered on the ref's orec.
    pub fn has_depart_obligation(&self) -> bool {
        self.has_depart_obligation
    }

    /// Turn a read into a write, keeping a copy of the read value for the dirty check.
    pub(crate) fn upgrade_to_write(&mut self, dirty_check: bool) {
        if self.mode != TranlocalMode::Read {
            return;
        }
        self.mode = TranlocalMode::Write;
        if dirty_check && self.owner.eq_fn().is_some() {
            self.old_value = self.value.clone();
        }
    }

    /// Queue a commute, or apply it right away if the value is already loaded.
    pub(crate) fn add_commute(&mut self, f: CommuteFn<T>, dirty_check: bool) -> Result<()> {
        if self.mode == TranlocalMode::Commuting {
            self.commutes.push(f);
            return Ok(());
        }
        self.upgrade_to_write(dirty_check);
        let next = f(self.value())?;
        self.value = Some(next);
        Ok(())
    }

    /// Load the committed value under `lock_mode` and apply the queued commutes in order.
    pub(crate) fn flatten_commute(
        &mut self,
        lock_mode: LockMode,
        spin_count: u32,
        arrive: bool,
        dirty_check: bool,
    ) -> Result<()> {
        debug_assert_eq!(self.mode, TranlocalMode::Commuting);
        let loaded = self
            .owner
            .load(lock_mode, spin_count, arrive)
            .map_err(StmError::conflict)?;

        self.read_version = loaded.version;
        self.lock_mode = loaded.lock_mode;
        self.has_depart_obligation = loaded.has_depart_obligation;
        self.mode = TranlocalMode::Write;

        let mut value = loaded.value;
        if dirty_check && self.owner.eq_fn().is_some() {
            self.old_value = Some(value.clone());
        }
        for f in self.commutes.drain(..) {
            value = f(&value)?;
        }
        self.value = Some(value);
        Ok(())
    }

    /// Make sure at least `desired` is held and the ref still has the version
    /// that was read. Any lock taken stays recorded in `lock_mode` so the abort
    /// path releases it, even when the version check fails afterwards.
    ///
    /// Fails with `LockNotFree` when the lock could not be acquired and with
    /// `InconsistentRead` when it was acquired over a newer version.
    pub(crate) fn try_lock_and_check_conflict(
        &mut self,
        spin_count: u32,
        desired: LockMode,
    ) -> std::result::Result<(), ConflictReason> {
        let current = self.lock_mode;
        if current >= desired {
            return Ok(());
        }
        let orec = self.owner.orec();
        match current {
            LockMode::None => {
                let expected = self.read_version;
                if self.has_depart_obligation {
                    if !orec.try_lock_after_normal_arrive(spin_count, desired) {
                        return Err(ConflictReason::LockNotFree);
                    }
                } else {
                    let status = orec.try_lock_and_arrive(spin_count, desired);
                    if status.is_lock_not_free() {
                        return Err(ConflictReason::LockNotFree);
                    }
                    self.has_depart_obligation = status.is_normal();
                }
                self.lock_mode = desired;
                if self.owner.version() != expected {
                    return Err(ConflictReason::InconsistentRead);
                }
                Ok(())
            }
            LockMode::Read => {
                if !orec.upgrade_read_lock(spin_count, desired) {
                    return Err(ConflictReason::LockNotFree);
                }
                self.lock_mode = desired;
                Ok(())
            }
            LockMode::Write => {
                if !orec.upgrade_to_commit_lock(spin_count) {
                    return Err(ConflictReason::LockNotFree);
                }
                self.lock_mode = LockMode::Commit;
                Ok(())
            }
            LockMode::Commit => Ok(()),
        }
    }

    fn compute_dirty(&self, dirty_check: bool) -> bool {
        if !dirty_check {
            return true;
        }
        match (self.owner.eq_fn(), &self.old_value, &self.value) {
            (Some(eq), Some(old), Some(new)) => !eq(old, new),
            _ => true,
        }
    }

    fn release(&mut self, after_update: bool) {
        let orec = self.owner.orec();
        match (after_update, self.has_depart_obligation, self.lock_mode) {
            (true, _, _) => {
                orec.depart_after_signalled_update_and_unlock();
            }
            (false, true, LockMode::None) => orec.depart_after_failure(),
            (false, true, mode) => {
                orec.depart_after_failure_and_unlock(mode);
            }
            (false, false, LockMode::None) => {}
            (false, false, mode) => orec.unlock_by_read_biased(mode),
        }
        self.lock_mode = LockMode::None;
        self.has_depart_obligation = false;
    }
}

impl<T> fmt::Debug for Tranlocal<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tranlocal")
            .field("ref", &self.owner)
            .field("read_version", &self.read_version)
            .field("mode", &self.mode)
            .field("lock_mode", &self.lock_mode)
            .field("dirty", &self.dirty)
            .field("has_depart_obligation", &self.has_depart_obligation)
            .field("commutes", &self.commutes.len())
            .finish()
    }
}

// ============================================================================
// TxEntry
// ============================================================================

/// Type-erased tranlocal, as stored in a transaction.
pub(crate) trait TxEntry: Send {
    fn ref_id(&self) -> RefId;

    fn mode(&self) -> TranlocalMode;

    fn lock_mode(&self) -> LockMode;

    fn is_dirty(&self) -> bool;

    /// A plain, unlocked read whose ref was updated (or is being committed) since.
    fn has_read_conflict(&self) -> bool;

    /// Flatten commutes, settle the dirty flag and take the locks commit needs.
    fn prepare(&mut self, spin_count: u32, dirty_check: bool) -> Result<()>;

    /// Whether publishing this entry must bump the conflict counter first.
    /// Only meaningful while the commit lock is held.
    fn needs_conflict_signal(&self) -> bool;

    /// Publish the private value at `read_version + 1` and release everything.
    /// The conflict counter has already been signalled if needed.
    fn publish(&mut self);

    /// Release after a successful commit that did not publish this entry.
    fn release_after_reading(&mut self);

    /// Release after an abort.
    fn release_after_failure(&mut self);

    fn as_any(&self) -> &dyn Any;

    fn as_any_mut(&mut self) -> &mut dyn Any;
}

impl<T: TxValue> TxEntry for Tranlocal<T> {
    fn ref_id(&self) -> RefId {
        self.owner.id()
    }

    fn mode(&self) -> TranlocalMode {
        self.mode
    }

    fn lock_mode(&self) -> LockMode {
        self.lock_mode
    }

    fn is_dirty(&self) -> bool {
        self.dirty
    }

    fn has_read_conflict(&self) -> bool {
        if self.lock_mode != LockMode::None {
            return false;
        }
        if matches!(self.mode, TranlocalMode::Constructing | TranlocalMode::Commuting) {
            return false;
        }
        if self.owner.orec().has_commit_lock() {
            return true;
        }
        self.owner.version() != self.read_version
    }

    fn prepare(&mut self, spin_count: u32, dirty_check: bool) -> Result<()> {
        match self.mode {
            TranlocalMode::Constructing => {
                self.dirty = true;
                return Ok(());
            }
            TranlocalMode::Commuting => {
                self.flatten_commute(LockMode::Commit, spin_count, false, dirty_check)?;
            }
            TranlocalMode::Read => {
                if self.write_skew_check
                    && self
                        .try_lock_and_check_conflict(spin_count, LockMode::Read)
                        .is_err()
                {
                    return Err(StmError::conflict(ConflictReason::PrepareFailed));
                }
                return Ok(());
            }
            TranlocalMode::Write => {}
        }

        self.dirty = self.compute_dirty(dirty_check);
        let needed = if self.dirty {
            LockMode::Commit
        } else if self.write_skew_check {
            LockMode::Read
        } else {
            LockMode::None
        };
        if self.try_lock_and_check_conflict(spin_count, needed).is_err() {
            return Err(StmError::conflict(ConflictReason::PrepareFailed));
        }
        Ok(())
    }

    fn needs_conflict_signal(&self) -> bool {
        self.owner.orec().has_foreign_readers(self.has_depart_obligation)
    }

    fn publish(&mut self) {
        debug_assert_eq!(self.lock_mode, LockMode::Commit);
        if let Some(value) = self.value.take() {
            self.owner.publish(value, self.read_version + 1);
        }
        self.old_value = None;
        self.release(true);
    }

    fn release_after_reading(&mut self) {
        let orec = self.owner.orec();
        match (self.has_depart_obligation, self.lock_mode) {
            (true, LockMode::None) => orec.depart_after_reading(),
            (true, mode) => orec.depart_after_reading_and_unlock(mode),
            (false, LockMode::None) => {}
            (false, mode) => orec.unlock_by_read_biased(mode),
        }
        self.lock_mode = LockMode::None;
        self.has_depart_obligation = false;
    }

    fn release_after_failure(&mut self) {
        self.commutes.clear();
        self.release(false);
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
