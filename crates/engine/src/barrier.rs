//! Commit barriers: commit or abort a group of transactions as one unit.
//!
//! Each party prepares its own transaction and parks on the barrier. Prepared
//! transactions hold commit locks on everything they will publish, so once the
//! barrier decides, every party can finish its transaction without failing:
//! either all of them commit or all of them abort.
//!
//! Two flavours exist:
//! - count-down: commits as soon as `parties` transactions have joined
//! - veto: commits when some party calls [`CommitBarrier::veto_commit`]
//!
//! Either flavour aborts on [`CommitBarrier::abort`], on a timeout, or when a
//! non-blocking join finds the barrier not ready.

use crate::transaction::Transaction;
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::fmt;
use std::sync::{Arc, Weak};
use std::thread;
use std::time::{Duration, Instant};
use tessera_core::{Result, StmError};
use tracing::{debug, trace};

/// Task run once when the barrier reaches a terminal state.
pub type BarrierTask = Box<dyn FnOnce() + Send>;

/// Barrier lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BarrierStatus {
    /// Accepting parties
    Open,
    /// Every party commits
    Committed,
    /// Every party aborts
    Aborted,
}

impl BarrierStatus {
    /// Whether the barrier has decided.
    pub fn is_closed(self) -> bool {
        self != BarrierStatus::Open
    }
}

impl fmt::Display for BarrierStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BarrierStatus::Open => write!(f, "open"),
            BarrierStatus::Committed => write!(f, "committed"),
            BarrierStatus::Aborted => write!(f, "aborted"),
        }
    }
}

/// How a barrier decides to commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BarrierKind {
    /// Commit once this many parties have joined
    CountDown {
        /// Number of parties
        parties: usize,
    },
    /// Commit when vetoed
    Veto,
}

struct BarrierState {
    status: BarrierStatus,
    waiting: usize,
    on_commit: Vec<BarrierTask>,
    on_abort: Vec<BarrierTask>,
}

/// Rendezvous that commits or aborts a group of transactions atomically.
pub struct CommitBarrier {
    kind: BarrierKind,
    state: Mutex<BarrierState>,
    cond: Condvar,
}

impl CommitBarrier {
    fn with_kind(kind: BarrierKind, status: BarrierStatus) -> Self {
        CommitBarrier {
            kind,
            state: Mutex::new(BarrierState {
                status,
                waiting: 0,
                on_commit: Vec::new(),
                on_abort: Vec::new(),
            }),
            cond: Condvar::new(),
        }
    }

    /// Barrier that commits when `parties` transactions have joined.
    ///
    /// With zero parties the barrier starts committed.
    pub fn new_count_down(parties: usize) -> Self {
        let status = if parties == 0 {
            BarrierStatus::Committed
        } else {
            BarrierStatus::Open
        };
        CommitBarrier::with_kind(BarrierKind::CountDown { parties }, status)
    }

    /// Barrier that commits when a party calls [`CommitBarrier::veto_commit`].
    pub fn new_veto() -> Self {
        CommitBarrier::with_kind(BarrierKind::Veto, BarrierStatus::Open)
    }

    /// Flavour of this barrier.
    pub fn kind(&self) -> BarrierKind {
        self.kind
    }

    /// Party count of a count-down barrier.
    pub fn parties(&self) -> Option<usize> {
        match self.kind {
            BarrierKind::CountDown { parties } => Some(parties),
            BarrierKind::Veto => None,
        }
    }

    /// Current status.
    pub fn status(&self) -> BarrierStatus {
        self.state.lock().status
    }

    /// Prepared parties waiting for the decision.
    pub fn number_waiting(&self) -> usize {
        self.state.lock().waiting
    }

    /// Whether the barrier committed.
    pub fn is_committed(&self) -> bool {
        self.status() == BarrierStatus::Committed
    }

    /// Whether the barrier aborted.
    pub fn is_aborted(&self) -> bool {
        self.status() == BarrierStatus::Aborted
    }

    // ------------------------------------------------------------------------
    // Joining
    // ------------------------------------------------------------------------

    /// Prepare `tx`, join, and block until the barrier decides.
    ///
    /// # Errors
    ///
    /// - `DeadTransaction` if `tx` is already committed or aborted
    /// - `CommitBarrierOpen` if the barrier already decided; `tx` is aborted
    /// - the prepare error if `tx` could not be prepared; the barrier stays open
    /// - `BarrierAborted` if the barrier aborted while waiting; `tx` is aborted
    pub fn join_commit(&self, tx: &mut Transaction) -> Result<()> {
        ensure_not_dead(tx, "join_commit")?;

        let tasks = {
            let mut state = self.enter(tx, "join_commit")?;
            if self.is_last_party(&state) {
                self.signal_commit(&mut state)
            } else {
                while state.status == BarrierStatus::Open {
                    self.cond.wait(&mut state);
                }
                Vec::new()
            }
        };

        let result = self.finish(tx);
        run_tasks(tasks);
        result
    }

    /// Join without blocking.
    ///
    /// If `tx` completes the party count the group commits and `true` is
    /// returned. Otherwise the barrier is aborted together with every party
    /// already waiting, and `false` is returned.
    pub fn try_join_commit(&self, tx: &mut Transaction) -> Result<bool> {
        ensure_not_dead(tx, "try_join_commit")?;

        let tasks = {
            let mut state = self.enter(tx, "try_join_commit")?;
            if self.is_last_party(&state) {
                self.signal_commit(&mut state)
            } else {
                debug!(txn_id = tx.id().0, "barrier not ready, aborting group");
                self.signal_abort(&mut state)
            }
        };

        let outcome = self.finish(tx);
        run_tasks(tasks);
        match outcome {
            Ok(()) => Ok(true),
            Err(StmError::BarrierAborted) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Join and wait at most `timeout` for the decision.
    ///
    /// Returns `true` if the group committed. On timeout the barrier and
    /// every waiting party abort and `false` is returned.
    pub fn try_join_commit_for(&self, tx: &mut Transaction, timeout: Duration) -> Result<bool> {
        ensure_not_dead(tx, "try_join_commit_for")?;
        let deadline = Instant::now() + timeout;

        let tasks = {
            let mut state = self.enter(tx, "try_join_commit_for")?;
            if self.is_last_party(&state) {
                self.signal_commit(&mut state)
            } else {
                let mut tasks = Vec::new();
                while state.status == BarrierStatus::Open {
                    if self.cond.wait_until(&mut state, deadline).timed_out()
                        && state.status == BarrierStatus::Open
                    {
                        debug!(txn_id = tx.id().0, ?timeout, "barrier join timed out");
                        tasks = self.signal_abort(&mut state);
                    }
                }
                tasks
            }
        };

        let outcome = self.finish(tx);
        run_tasks(tasks);
        match outcome {
            Ok(()) => Ok(true),
            Err(StmError::BarrierAborted) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Prepare `tx`, join, and commit the whole group.
    ///
    /// Only valid on a veto barrier.
    pub fn veto_commit_with(&self, tx: &mut Transaction) -> Result<()> {
        self.ensure_veto()?;
        ensure_not_dead(tx, "veto_commit_with")?;

        let tasks = {
            let mut state = self.enter(tx, "veto_commit_with")?;
            self.signal_commit(&mut state)
        };

        let result = self.finish(tx);
        run_tasks(tasks);
        result
    }

    // ------------------------------------------------------------------------
    // Deciding
    // ------------------------------------------------------------------------

    /// Commit every waiting party. Only valid on a veto barrier.
    ///
    /// Vetoing a committed barrier is a no-op; vetoing an aborted one fails
    /// with `IllegalState`.
    pub fn veto_commit(&self) -> Result<()> {
        self.ensure_veto()?;
        let tasks = {
            let mut state = self.state.lock();
            match state.status {
                BarrierStatus::Open => self.signal_commit(&mut state),
                BarrierStatus::Committed => return Ok(()),
                BarrierStatus::Aborted => {
                    return Err(StmError::IllegalState(
                        "cannot commit an aborted barrier".to_string(),
                    ))
                }
            }
        };
        run_tasks(tasks);
        Ok(())
    }

    /// Abort the barrier and every waiting party.
    ///
    /// Aborting an aborted barrier is a no-op; aborting a committed one fails
    /// with `IllegalState`.
    pub fn abort(&self) -> Result<()> {
        let tasks = {
            let mut state = self.state.lock();
            match state.status {
                BarrierStatus::Open => self.signal_abort(&mut state),
                BarrierStatus::Aborted => return Ok(()),
                BarrierStatus::Committed => {
                    return Err(StmError::IllegalState(
                        "cannot abort a committed barrier".to_string(),
                    ))
                }
            }
        };
        run_tasks(tasks);
        Ok(())
    }

    /// Abort the barrier if it is still open after `timeout`.
    ///
    /// The timer runs on a background thread and does not keep the barrier alive.
    pub fn set_timeout(self: &Arc<Self>, timeout: Duration) -> Result<()> {
        {
            let state = self.state.lock();
            if state.status.is_closed() {
                return Err(StmError::CommitBarrierOpen(format!(
                    "cannot set a timeout on a {} barrier",
                    state.status
                )));
            }
        }

        let barrier: Weak<CommitBarrier> = Arc::downgrade(self);
        thread::Builder::new()
            .name("commit-barrier-timeout".to_string())
            .spawn(move || {
                thread::sleep(timeout);
                if let Some(barrier) = barrier.upgrade() {
                    if barrier.abort().is_ok() {
                        trace!(?timeout, "barrier timeout fired");
                    }
                }
            })
            .map_err(|e| StmError::IllegalState(format!("cannot start barrier timer: {}", e)))?;
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Waiting and tasks
    // ------------------------------------------------------------------------

    /// Block until the barrier commits or aborts.
    pub fn await_open(&self) {
        let mut state = self.state.lock();
        while state.status == BarrierStatus::Open {
            self.cond.wait(&mut state);
        }
    }

    /// Block at most `timeout` for the barrier to decide. Returns whether it did.
    pub fn try_await_open(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        while state.status == BarrierStatus::Open {
            if self.cond.wait_until(&mut state, deadline).timed_out() {
                return state.status.is_closed();
            }
        }
        true
    }

    /// Run `task` when the barrier commits.
    ///
    /// Tasks run in registration order on the thread that commits the barrier.
    pub fn register_on_commit<F>(&self, task: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let mut state = self.state.lock();
        ensure_open(&state, "register an on-commit task")?;
        state.on_commit.push(Box::new(task));
        Ok(())
    }

    /// Run `task` when the barrier aborts.
    pub fn register_on_abort<F>(&self, task: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let mut state = self.state.lock();
        ensure_open(&state, "register an on-abort task")?;
        state.on_abort.push(Box::new(task));
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------------

    /// Prepare `tx` and count it as waiting. Returns with the state lock held.
    ///
    /// `tx` is prepared and aborted without the lock: its listeners may call
    /// back into the barrier.
    fn enter(&self, tx: &mut Transaction, op: &str) -> Result<MutexGuard<'_, BarrierState>> {
        let status = self.status();
        if status.is_closed() {
            return Err(reject(tx, op, status));
        }
        tx.prepare()?;

        let mut state = self.state.lock();
        if state.status.is_closed() {
            let status = state.status;
            drop(state);
            return Err(reject(tx, op, status));
        }
        state.waiting += 1;
        trace!(txn_id = tx.id().0, waiting = state.waiting, "joined barrier");
        Ok(state)
    }

    fn is_last_party(&self, state: &BarrierState) -> bool {
        match self.kind {
            BarrierKind::CountDown { parties } => state.waiting >= parties,
            BarrierKind::Veto => false,
        }
    }

    fn signal_commit(&self, state: &mut BarrierState) -> Vec<BarrierTask> {
        debug!(parties = state.waiting, "barrier committed");
        state.waiting = 0;
        state.status = BarrierStatus::Committed;
        state.on_abort.clear();
        self.cond.notify_all();
        std::mem::take(&mut state.on_commit)
    }

    fn signal_abort(&self, state: &mut BarrierState) -> Vec<BarrierTask> {
        debug!(parties = state.waiting, "barrier aborted");
        state.waiting = 0;
        state.status = BarrierStatus::Aborted;
        state.on_commit.clear();
        self.cond.notify_all();
        std::mem::take(&mut state.on_abort)
    }

    /// Commit or abort a prepared party according to the decision.
    fn finish(&self, tx: &mut Transaction) -> Result<()> {
        match self.status() {
            BarrierStatus::Committed => tx.commit().map(|_| ()),
            BarrierStatus::Aborted => {
                tx.abort()?;
                Err(StmError::BarrierAborted)
            }
            BarrierStatus::Open => Err(StmError::IllegalState(
                "barrier still open after join".to_string(),
            )),
        }
    }

    fn ensure_veto(&self) -> Result<()> {
        match self.kind {
            BarrierKind::Veto => Ok(()),
            BarrierKind::CountDown { .. } => Err(StmError::IllegalState(
                "veto is only supported by veto barriers".to_string(),
            )),
        }
    }
}

fn ensure_not_dead(tx: &Transaction, op: &str) -> Result<()> {
    if tx.status().is_dead() {
        return Err(StmError::DeadTransaction(format!(
            "cannot {} with {}, it is {}",
            op,
            tx.id(),
            tx.status()
        )));
    }
    Ok(())
}

/// Abort a party that arrived at a closed barrier.
fn reject(tx: &mut Transaction, op: &str, status: BarrierStatus) -> StmError {
    let msg = format!("cannot {} {} on a {} barrier", op, tx.id(), status);
    match tx.abort() {
        Ok(()) => StmError::CommitBarrierOpen(msg),
        Err(e) => e,
    }
}

fn ensure_open(state: &BarrierState, op: &str) -> Result<()> {
    if state.status.is_closed() {
        return Err(StmError::CommitBarrierOpen(format!(
            "cannot {} on a {} barrier",
            op, state.status
        )));
    }
    Ok(())
}

fn run_tasks(tasks: Vec<BarrierTask>) {
    for task in tasks {
        task();
    }
}

impl fmt::Debug for CommitBarrier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("CommitBarrier")
            .field("kind", &self.kind)
            .field("status", &state.status)
            .field("waiting", &state.waiting)
            .finish()
    }
}
