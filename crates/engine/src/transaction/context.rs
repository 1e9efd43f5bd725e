//! Transaction context: tranlocal tracking, conflict detection, prepare and commit.
//!
//! ## Lifecycle
//!
//! ```text
//! 1. open_for_read / open_for_write / commute / construct
//!      - load committed values (arriving on the orec when reads are tracked)
//!      - keep the snapshot consistent with a conflict scan
//! 2. prepare()
//!      - PrePrepare listeners
//!      - flatten commutes, settle dirty flags
//!      - commit-lock every dirty ref, read-lock reads if write skew is prevented
//! 3. commit()
//!      - allocate a commit version
//!      - publish dirty refs at read_version + 1, depart from every orec
//!      - PostCommit listeners
//! ```
//!
//! Any failure aborts the transaction before the error is returned, so locks
//! never outlive a failed operation. Dropping a live transaction aborts it.

use crate::reference::{EqFn, Ref, TxValue};
use crate::speculative::{SpeculativeConfiguration, UNBOUNDED};
use crate::stm::StmShared;
use crate::tranlocal::{Tranlocal, TranlocalMode, TxEntry};
use crate::transaction::listener::TransactionListener;
use crate::transaction::set::TranlocalSet;
use smallvec::SmallVec;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, trace};
use tessera_core::{
    ConflictReason, LockMode, RefId, Result, SpeculativeFailure, StmError, TransactionConfig,
    TransactionEvent, TransactionStatus, TxnId,
};

/// A transaction.
///
/// Created by [`Stm::begin`](crate::Stm::begin) or a
/// [`TransactionFactory`](crate::TransactionFactory). Not shared between
/// threads; each thread runs its own transactions.
pub struct Transaction {
    stm: Arc<StmShared>,
    id: TxnId,
    config: Arc<TransactionConfig>,
    family: Arc<str>,
    speculative: Option<Arc<SpeculativeConfiguration>>,
    status: TransactionStatus,
    attempt: u32,
    tranlocals: TranlocalSet,
    capacity: Option<usize>,
    speculative_readonly: bool,
    read_tracking: bool,
    write_skew_check: bool,
    has_writes: bool,
    has_dirty: bool,
    abort_only: bool,
    local_conflict_count: u64,
    commit_version: Option<u64>,
    listeners: SmallVec<[Box<dyn TransactionListener>; 2]>,
}

impl Transaction {
    pub(crate) fn new(
        stm: Arc<StmShared>,
        config: Arc<TransactionConfig>,
        family: Arc<str>,
        speculative: Option<Arc<SpeculativeConfiguration>>,
        attempt: u32,
    ) -> Self {
        let shape = speculative
            .as_ref()
            .filter(|_| config.speculative_config_enabled)
            .map(|s| s.shape());

        let (capacity, speculative_readonly, read_tracking) = match shape {
            Some(shape) => (
                (shape.optimal_size != UNBOUNDED).then_some(shape.optimal_size as usize),
                shape.is_readonly && !config.readonly,
                config.automatic_read_tracking || shape.is_automatic_read_tracking,
            ),
            None => (None, false, config.automatic_read_tracking),
        };
        let speculative = if shape.is_some() { speculative } else { None };

        let id = stm.manager().next_txn_id();
        let local_conflict_count = stm.conflict_counter().count();
        stm.metrics().record_start();
        trace!(txn_id = id.0, family = %family, attempt, "transaction started");

        Transaction {
            id,
            write_skew_check: config.prevent_write_skew && read_tracking,
            tranlocals: TranlocalSet::with_capacity(capacity.unwrap_or(0)),
            stm,
            config,
            family,
            speculative,
            status: TransactionStatus::Active,
            attempt,
            capacity,
            speculative_readonly,
            read_tracking,
            has_writes: false,
            has_dirty: false,
            abort_only: false,
            local_conflict_count,
            commit_version: None,
            listeners: SmallVec::new(),
        }
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    /// Transaction id.
    pub fn id(&self) -> TxnId {
        self.id
    }

    /// Current lifecycle state.
    pub fn status(&self) -> TransactionStatus {
        self.status
    }

    /// Configuration in effect.
    pub fn config(&self) -> &TransactionConfig {
        &self.config
    }

    /// Family this transaction belongs to.
    pub fn family_name(&self) -> &str {
        &self.family
    }

    /// 1-based attempt number assigned by the retry driver.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Number of refs opened.
    pub fn size(&self) -> usize {
        self.tranlocals.len()
    }

    /// Whether any ref was opened for write, commuted or constructed.
    pub fn has_writes(&self) -> bool {
        self.has_writes
    }

    /// Whether plain reads arrive on orecs.
    pub fn is_read_tracking(&self) -> bool {
        self.read_tracking
    }

    /// Whether reads are read-locked at prepare.
    pub fn is_write_skew_check(&self) -> bool {
        self.write_skew_check
    }

    /// Whether this attempt runs with the family's speculative read-only assumption.
    pub fn is_speculatively_readonly(&self) -> bool {
        self.speculative_readonly
    }

    /// Speculative capacity, `None` when unbounded.
    pub fn capacity(&self) -> Option<usize> {
        self.capacity
    }

    /// Whether the transaction can only abort.
    pub fn is_abort_only(&self) -> bool {
        self.abort_only
    }

    /// Version assigned by a successful commit.
    pub fn commit_version(&self) -> Option<u64> {
        self.commit_version
    }

    /// Tranlocal for `r`, if this transaction opened it.
    pub fn locate<T: TxValue>(&self, r: &Ref<T>) -> Option<&Tranlocal<T>> {
        self.tranlocals.position(r.id()).map(|idx| self.entry::<T>(idx))
    }

    /// Register a lifecycle listener.
    pub fn register<L>(&mut self, listener: L) -> Result<()>
    where
        L: TransactionListener + 'static,
    {
        self.check_active("register a listener")?;
        self.listeners.push(Box::new(listener));
        Ok(())
    }

    /// Make sure the transaction can only abort; `commit` will fail with `AbortOnly`.
    pub fn set_abort_only(&mut self) -> Result<()> {
        self.check_active("set abort only")?;
        self.abort_only = true;
        Ok(())
    }

    // ========================================================================
    // Opening refs
    // ========================================================================

    /// Open `r` for reading with at least `lock_mode`.
    ///
    /// Reopening escalates the held lock to the stronger of the two modes;
    /// it never downgrades.
    pub fn open_for_read<T: TxValue>(&mut self, r: &Ref<T>, lock_mode: LockMode) -> Result<&Tranlocal<T>> {
        self.check_active("open for read")?;
        self.check_owner(r)?;
        let desired = lock_mode.max(self.config.read_lock_mode());
        let idx = self.open_index(r, desired)?;
        Ok(self.entry::<T>(idx))
    }

    /// Open `r` for writing with at least `lock_mode`.
    pub fn open_for_write<T: TxValue>(
        &mut self,
        r: &Ref<T>,
        lock_mode: LockMode,
    ) -> Result<&mut Tranlocal<T>> {
        self.check_active("open for write")?;
        self.check_owner(r)?;
        self.check_writable()?;
        let desired = lock_mode.max(self.config.write_lock_mode());
        let idx = self.open_index(r, desired)?;

        let dirty_check = self.config.dirty_check_enabled;
        self.has_writes = true;
        let tranlocal = self.entry_mut::<T>(idx);
        tranlocal.upgrade_to_write(dirty_check);
        Ok(tranlocal)
    }

    /// Tranlocal of a ref this transaction is constructing.
    pub fn open_for_construction<T: TxValue>(&mut self, r: &Ref<T>) -> Result<&mut Tranlocal<T>> {
        self.check_active("open for construction")?;
        self.check_owner(r)?;
        let idx = match self.tranlocals.position(r.id()) {
            Some(idx) if self.tranlocals.get(idx).mode() == TranlocalMode::Constructing => idx,
            _ => {
                let msg = format!("{} is not under construction by {}", r.id(), self.id);
                return Err(self.fail(StmError::IllegalArgument(msg)));
            }
        };
        Ok(self.entry_mut::<T>(idx))
    }

    /// Queue `f` to be applied to the committed value of `r` at prepare.
    ///
    /// If `r` is already open, `f` is applied to the private value right away.
    pub fn commute<T, F>(&mut self, r: &Ref<T>, f: F) -> Result<()>
    where
        T: TxValue,
        F: FnOnce(&T) -> Result<T> + Send + 'static,
    {
        self.check_active("commute")?;
        self.check_owner(r)?;
        self.check_writable()?;
        let dirty_check = self.config.dirty_check_enabled;

        if let Some(idx) = self.tranlocals.position(r.id()) {
            let outcome = self.entry_mut::<T>(idx).add_commute(Box::new(f), dirty_check);
            if let Err(e) = outcome {
                return Err(self.fail(e));
            }
            self.has_writes = true;
            return Ok(());
        }

        self.check_capacity()?;
        self.tranlocals
            .push(Box::new(Tranlocal::commuting(r.clone(), Box::new(f))));
        self.has_writes = true;
        Ok(())
    }

    /// Create a new ref owned by this transaction until commit.
    pub(crate) fn construct<T: TxValue>(&mut self, value: T, eq: Option<EqFn<T>>) -> Result<Ref<T>> {
        self.check_active("construct")?;
        self.check_writable()?;
        self.check_capacity()?;

        let r = Ref::new_constructed(&self.stm, value.clone(), eq);
        self.tranlocals
            .push(Box::new(Tranlocal::constructing(r.clone(), value)));
        self.has_writes = true;
        trace!(txn_id = self.id.0, ref_id = r.id().0, "ref constructed");
        Ok(r)
    }

    fn open_index<T: TxValue>(&mut self, r: &Ref<T>, desired: LockMode) -> Result<usize> {
        let spin_count = self.config.spin_count;
        let arrive = self.read_tracking;

        if let Some(idx) = self.tranlocals.position(r.id()) {
            let dirty_check = self.config.dirty_check_enabled;
            let tranlocal = self.entry_mut::<T>(idx);
            let outcome = match tranlocal.mode {
                TranlocalMode::Constructing => Ok(()),
                TranlocalMode::Commuting => {
                    tranlocal.flatten_commute(desired, spin_count, arrive, dirty_check)
                }
                TranlocalMode::Read | TranlocalMode::Write => tranlocal
                    .try_lock_and_check_conflict(spin_count, desired)
                    .map_err(StmError::conflict),
            };
            if let Err(e) = outcome {
                return Err(self.fail_on_ref(e, r.id()));
            }
            self.ensure_read_consistent(None)?;
            return Ok(idx);
        }

        self.check_capacity()?;
        let loaded = match r.load(desired, spin_count, arrive) {
            Ok(loaded) => loaded,
            Err(reason) => return Err(self.fail_on_ref(StmError::conflict(reason), r.id())),
        };
        let tranlocal = Tranlocal::loaded(r.clone(), loaded, self.write_skew_check);
        let idx = self.tranlocals.push(Box::new(tranlocal));
        self.ensure_read_consistent(Some(idx))?;
        Ok(idx)
    }

    // ========================================================================
    // Conflict detection
    // ========================================================================

    /// Check that every unlocked read still matches its committed version.
    ///
    /// With read tracking the full scan only runs when the global conflict
    /// counter moved. Without it every new read revalidates the earlier ones.
    fn ensure_read_consistent(&mut self, just_added: Option<usize>) -> Result<()> {
        if self.config.read_lock_mode() != LockMode::None {
            return Ok(());
        }

        if self.read_tracking {
            let current = self.stm.conflict_counter().count();
            if current == self.local_conflict_count {
                return Ok(());
            }
            if self.scan_for_conflict(just_added) {
                return Err(self.fail(StmError::conflict(ConflictReason::InconsistentRead)));
            }
            self.local_conflict_count = current;
            return Ok(());
        }

        if just_added.is_none() {
            return Ok(());
        }
        if self.speculative.is_some()
            && self.tranlocals.len() > self.config.max_poor_mans_conflict_scan_length
        {
            return Err(self.fail(StmError::SpeculativeConfiguration(
                SpeculativeFailure::ReadTrackingRequired,
            )));
        }
        if self.scan_for_conflict(just_added) {
            return Err(self.fail(StmError::conflict(ConflictReason::InconsistentRead)));
        }
        Ok(())
    }

    fn scan_for_conflict(&self, skip: Option<usize>) -> bool {
        self.tranlocals
            .iter()
            .enumerate()
            .any(|(i, e)| Some(i) != skip && e.has_read_conflict())
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Take every lock commit needs.
    ///
    /// On success the transaction is `Prepared`. On failure it is aborted and
    /// the error returned: a `ReadWriteConflict` when a lock could not be
    /// taken or a read became stale, or the error of a failing commute.
    pub fn prepare(&mut self) -> Result<()> {
        match self.status {
            TransactionStatus::Prepared => return Ok(()),
            TransactionStatus::Active => {}
            TransactionStatus::Committed | TransactionStatus::Aborted => {
                return Err(self.dead_error("prepare"));
            }
        }
        if self.abort_only {
            return Err(self.fail(StmError::AbortOnly));
        }

        self.notify(TransactionEvent::PrePrepare);

        if self.has_writes {
            let spin_count = self.config.spin_count;
            let dirty_check = self.config.dirty_check_enabled;
            let mut has_dirty = false;
            let mut failure = None;
            for entry in self.tranlocals.iter_mut() {
                if let Err(e) = entry.prepare(spin_count, dirty_check) {
                    debug!(txn_id = self.id.0, ref_id = entry.ref_id().0, error = %e, "prepare failed");
                    failure = Some(e);
                    break;
                }
                has_dirty |= entry.is_dirty();
            }
            if let Some(e) = failure {
                return Err(self.fail(e));
            }
            self.has_dirty = has_dirty;
        }

        if self.read_tracking {
            self.ensure_read_consistent(None)?;
        }

        self.status = TransactionStatus::Prepared;
        trace!(txn_id = self.id.0, dirty = self.has_dirty, "transaction prepared");
        Ok(())
    }

    /// Commit and return the commit version.
    ///
    /// Update transactions draw a fresh version from the STM clock; read-only
    /// ones return the current clock value. Committing twice is a no-op.
    pub fn commit(&mut self) -> Result<u64> {
        match self.status {
            TransactionStatus::Committed => {
                return Ok(self
                    .commit_version
                    .unwrap_or_else(|| self.stm.manager().current_version()));
            }
            TransactionStatus::Aborted => return Err(self.dead_error("commit")),
            TransactionStatus::Active => self.prepare()?,
            TransactionStatus::Prepared => {}
        }

        let version = if self.has_dirty {
            self.stm.manager().allocate_version()
        } else {
            self.stm.manager().current_version()
        };

        // Readers must learn about the update before any value becomes visible.
        if self
            .tranlocals
            .iter()
            .any(|e| e.is_dirty() && e.needs_conflict_signal())
        {
            self.stm.conflict_counter().signal_conflict();
        }
        for entry in self.tranlocals.iter_mut() {
            if entry.is_dirty() {
                entry.publish();
            } else {
                entry.release_after_reading();
            }
        }
        self.tranlocals.clear();

        self.status = TransactionStatus::Committed;
        self.commit_version = Some(version);
        self.stm.metrics().record_commit();
        trace!(txn_id = self.id.0, version, "transaction committed");
        self.notify(TransactionEvent::PostCommit);
        Ok(version)
    }

    /// Abort, releasing every lock and arrival.
    ///
    /// Aborting an aborted transaction is a no-op; aborting a committed one
    /// fails with `DeadTransaction`.
    pub fn abort(&mut self) -> Result<()> {
        match self.status {
            TransactionStatus::Aborted => Ok(()),
            TransactionStatus::Committed => Err(self.dead_error("abort")),
            TransactionStatus::Active | TransactionStatus::Prepared => {
                self.abort_internal();
                Ok(())
            }
        }
    }

    /// Ask to be re-run once something this transaction read has changed.
    ///
    /// Returns the error to propagate out of the transaction body, normally
    /// `Retry`. The transaction is aborted in every case.
    pub fn retry(&mut self) -> StmError {
        if let Err(e) = self.check_active("retry") {
            return e;
        }
        if !self.config.blocking_allowed {
            let msg = format!("blocking is not allowed in family '{}'", self.family);
            return self.fail(StmError::RetryNotAllowed(msg));
        }
        if !self.read_tracking {
            if self.speculative.is_some() {
                return self.fail(StmError::SpeculativeConfiguration(
                    SpeculativeFailure::ReadTrackingRequired,
                ));
            }
            let msg = format!("{} does not track reads", self.id);
            return self.fail(StmError::RetryNotPossible(msg));
        }
        if self.tranlocals.is_empty() {
            let msg = format!("{} has not read anything", self.id);
            return self.fail(StmError::RetryNotPossible(msg));
        }
        self.fail(StmError::Retry)
    }

    pub(crate) fn abort_if_alive(&mut self) {
        if self.status.is_alive() {
            self.abort_internal();
        }
    }

    fn abort_internal(&mut self) {
        for entry in self.tranlocals.iter_mut() {
            entry.release_after_failure();
        }
        self.tranlocals.clear();
        self.status = TransactionStatus::Aborted;
        self.stm.metrics().record_abort();
        trace!(txn_id = self.id.0, "transaction aborted");
        self.notify(TransactionEvent::PostAbort);
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    fn notify(&mut self, event: TransactionEvent) {
        for listener in self.listeners.iter_mut() {
            listener.notify(event);
        }
    }

    /// Abort and hand `error` back, recording what went wrong.
    fn fail(&mut self, error: StmError) -> StmError {
        match &error {
            StmError::ReadWriteConflict { reason } => {
                debug!(txn_id = self.id.0, family = %self.family, %reason, "read/write conflict");
                self.stm.metrics().record_conflict();
            }
            StmError::SpeculativeConfiguration(failure) => {
                debug!(txn_id = self.id.0, family = %self.family, %failure, "speculative failure");
                self.stm.metrics().record_speculative_failure();
                if let Some(speculative) = &self.speculative {
                    speculative.relax(*failure);
                }
            }
            _ => {}
        }
        if self.status.is_alive() {
            self.abort_internal();
        }
        error
    }

    fn fail_on_ref(&mut self, error: StmError, ref_id: RefId) -> StmError {
        trace!(txn_id = self.id.0, ref_id = ref_id.0, error = %error, "open failed");
        self.fail(error)
    }

    fn dead_error(&self, op: &str) -> StmError {
        StmError::DeadTransaction(format!("cannot {} {}, it is {}", op, self.id, self.status))
    }

    fn check_active(&mut self, op: &str) -> Result<()> {
        match self.status {
            TransactionStatus::Active => Ok(()),
            TransactionStatus::Prepared => {
                let msg = format!("cannot {} {}, it is prepared", op, self.id);
                Err(self.fail(StmError::PreparedTransaction(msg)))
            }
            TransactionStatus::Committed | TransactionStatus::Aborted => Err(self.dead_error(op)),
        }
    }

    fn check_owner<T: TxValue>(&mut self, r: &Ref<T>) -> Result<()> {
        if r.is_owned_by(&self.stm) {
            return Ok(());
        }
        let msg = format!("{} belongs to a different stm than {}", r.id(), self.id);
        Err(self.fail(StmError::IllegalArgument(msg)))
    }

    fn check_writable(&mut self) -> Result<()> {
        if self.config.readonly {
            let msg = format!("{} in family '{}' is readonly", self.id, self.family);
            return Err(self.fail(StmError::Readonly(msg)));
        }
        if self.speculative_readonly {
            return Err(self.fail(StmError::SpeculativeConfiguration(
                SpeculativeFailure::ReadonlyViolated,
            )));
        }
        Ok(())
    }

    fn check_capacity(&mut self) -> Result<()> {
        let Some(capacity) = self.capacity else {
            return Ok(());
        };
        if self.tranlocals.len() < capacity {
            return Ok(());
        }
        let needed = self.tranlocals.len() + 1;
        let required = if needed <= self.config.max_fixed_length_size {
            self.config.max_fixed_length_size as u32
        } else {
            UNBOUNDED
        };
        Err(self.fail(StmError::SpeculativeConfiguration(
            SpeculativeFailure::TransactionTooSmall { required },
        )))
    }

    fn entry<T: TxValue>(&self, idx: usize) -> &Tranlocal<T> {
        let entry = self.tranlocals.get(idx);
        match entry.as_any().downcast_ref::<Tranlocal<T>>() {
            Some(t) => t,
            None => panic!("tranlocal for {} has an unexpected value type", entry.ref_id()),
        }
    }

    fn entry_mut<T: TxValue>(&mut self, idx: usize) -> &mut Tranlocal<T> {
        let entry = self.tranlocals.get_mut(idx);
        let ref_id = entry.ref_id();
        match entry.as_any_mut().downcast_mut::<Tranlocal<T>>() {
            Some(t) => t,
            None => panic!("tranlocal for {} has an unexpected value type", ref_id),
        }
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        self.abort_if_alive();
    }
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.id)
            .field("family", &self.family)
            .field("status", &self.status)
            .field("attempt", &self.attempt)
            .field("size", &self.tranlocals.len())
            .field("read_tracking", &self.read_tracking)
            .field("has_writes", &self.has_writes)
            .field("abort_only", &self.abort_only)
            .finish()
    }
}
