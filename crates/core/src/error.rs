//! Error types for Tessera.
//!
//! Every fallible operation in the workspace returns [`StmError`]. Errors fall
//! into three groups:
//!
//! - **Recoverable** (`ReadWriteConflict`, `SpeculativeConfiguration`, `Retry`):
//!   the retry driver catches these and starts a fresh attempt.
//! - **Lifecycle misuse** (`PreparedTransaction`, `DeadTransaction`, ...):
//!   the transaction was in the wrong state for the requested operation.
//! - **User** errors raised by transaction bodies or commute functions.
//!
//! Broken engine invariants (for example departing from an orec that was never
//! arrived on) are not represented here. They panic.

use std::fmt;
use thiserror::Error;

/// Why a transaction hit a read/write conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConflictReason {
    /// The orec was locked by another transaction for longer than the spin budget
    LockNotFree,
    /// A conflict scan found a read that no longer matches the committed version
    InconsistentRead,
    /// A lock needed during prepare could not be acquired or the version moved
    PrepareFailed,
    /// The ref was constructed by a transaction that never committed
    Uncommitted,
}

impl fmt::Display for ConflictReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConflictReason::LockNotFree => "lock not free",
            ConflictReason::InconsistentRead => "inconsistent read",
            ConflictReason::PrepareFailed => "prepare failed",
            ConflictReason::Uncommitted => "uncommitted ref",
        };
        f.write_str(s)
    }
}

/// The speculative assumption a transaction violated.
///
/// Each variant tells the family configuration in which direction to relax.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SpeculativeFailure {
    /// A speculatively read-only transaction attempted a write
    ReadonlyViolated,
    /// The transaction needed more tranlocals than its speculative capacity
    TransactionTooSmall {
        /// Capacity the next attempt should be started with
        required: u32,
    },
    /// Reads must be tracked (for `retry` or a conflict scan that grew too long)
    ReadTrackingRequired,
}

impl fmt::Display for SpeculativeFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SpeculativeFailure::ReadonlyViolated => write!(f, "write in a readonly transaction"),
            SpeculativeFailure::TransactionTooSmall { required } => {
                write!(f, "transaction too small, {} tranlocals required", required)
            }
            SpeculativeFailure::ReadTrackingRequired => write!(f, "read tracking required"),
        }
    }
}

/// All errors produced by the STM.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StmError {
    /// Optimistic conflict; the attempt was aborted and can be retried
    #[error("read/write conflict: {reason}")]
    ReadWriteConflict {
        /// What went wrong
        reason: ConflictReason,
    },

    /// The family's speculative shape was too tight; retry with the relaxed shape
    #[error("speculative configuration failure: {0}")]
    SpeculativeConfiguration(SpeculativeFailure),

    /// The transaction asked to be re-run once something it read changes
    #[error("retry requested")]
    Retry,

    /// Operation not allowed on a prepared transaction
    #[error("prepared transaction: {0}")]
    PreparedTransaction(String),

    /// Operation not allowed on a committed or aborted transaction
    #[error("dead transaction: {0}")]
    DeadTransaction(String),

    /// The transaction was marked abort-only and cannot commit
    #[error("transaction is abort-only")]
    AbortOnly,

    /// Write attempted in an explicitly read-only transaction
    #[error("readonly transaction: {0}")]
    Readonly(String),

    /// `retry` was used while blocking is not allowed
    #[error("retry not allowed: {0}")]
    RetryNotAllowed(String),

    /// `retry` was used but there is nothing to wait on
    #[error("retry not possible: {0}")]
    RetryNotPossible(String),

    /// The retry driver gave up
    #[error("too many retries in family '{family}' after {attempts} attempts")]
    TooManyRetries {
        /// Family of the transaction that kept failing
        family: String,
        /// Attempts made
        attempts: u32,
    },

    /// A commit barrier was used after it already reached a terminal state
    #[error("commit barrier is not open: {0}")]
    CommitBarrierOpen(String),

    /// The commit barrier the transaction joined was aborted
    #[error("commit barrier was aborted")]
    BarrierAborted,

    /// Operation does not fit the current state of the object
    #[error("illegal state: {0}")]
    IllegalState(String),

    /// Bad argument (for example a ref owned by another STM)
    #[error("illegal argument: {0}")]
    IllegalArgument(String),

    /// Configuration could not be parsed or failed validation
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Error raised by user code inside a transaction
    #[error("{0}")]
    User(String),
}

/// Result type for STM operations.
pub type Result<T> = std::result::Result<T, StmError>;

impl StmError {
    /// Shorthand for a conflict error.
    pub fn conflict(reason: ConflictReason) -> Self {
        StmError::ReadWriteConflict { reason }
    }

    /// Shorthand for a user error.
    pub fn user(msg: impl Into<String>) -> Self {
        StmError::User(msg.into())
    }

    /// Check if this error is retryable.
    ///
    /// The retry driver restarts the transaction on these instead of
    /// returning them to the caller.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            StmError::ReadWriteConflict { .. } | StmError::SpeculativeConfiguration(_) | StmError::Retry
        )
    }

    /// Check if this is a read/write conflict.
    pub fn is_conflict(&self) -> bool {
        matches!(self, StmError::ReadWriteConflict { .. })
    }

    /// Check if this is a speculative configuration failure.
    pub fn is_speculative(&self) -> bool {
        matches!(self, StmError::SpeculativeConfiguration(_))
    }

    /// Check if this is a retry request.
    pub fn is_retry(&self) -> bool {
        matches!(self, StmError::Retry)
    }

    /// Check if this error points at misuse of the API rather than contention.
    pub fn is_serious(&self) -> bool {
        matches!(
            self,
            StmError::PreparedTransaction(_)
                | StmError::DeadTransaction(_)
                | StmError::IllegalState(_)
                | StmError::IllegalArgument(_)
                | StmError::InvalidConfig(_)
        )
    }
}

impl From<toml::de::Error> for StmError {
    fn from(e: toml::de::Error) -> Self {
        StmError::InvalidConfig(e.to_string())
    }
}
