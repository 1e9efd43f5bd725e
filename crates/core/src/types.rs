//! Core types shared by the STM layers.
//!
//! - `LockMode`: pessimistic lock strength a transaction holds on a ref
//! - `TransactionStatus`: lifecycle state of a transaction
//! - `TransactionEvent`: lifecycle points observed by listeners
//! - `TxnId` / `RefId`: identifiers

use serde::{Deserialize, Serialize};
use std::fmt;

// ============================================================================
// LockMode
// ============================================================================

/// Lock strength on a single ref, ordered `None < Read < Write < Commit`.
///
/// | Held by another | blocks `None` | blocks `Read` | blocks `Write` | blocks `Commit` |
/// |-----------------|---------------|---------------|----------------|-----------------|
/// | `Read`          | no            | no            | no             | yes             |
/// | `Write`         | no            | no            | yes            | yes             |
/// | `Commit`        | yes           | yes           | yes            | yes             |
///
/// A transaction never holds a weaker mode than it asked for: reopening a ref
/// escalates to the maximum of the held and the requested mode.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub enum LockMode {
    /// Optimistic, no lock
    #[default]
    None,
    /// Shared: prevents others from committing a write
    Read,
    /// Exclusive against other writers, plain readers still proceed
    Write,
    /// Fully exclusive, taken on every dirty ref before publication
    Commit,
}

impl LockMode {
    /// All modes in ascending strength.
    pub const ALL: [LockMode; 4] = [LockMode::None, LockMode::Read, LockMode::Write, LockMode::Commit];

    /// Whether this mode holds any lock at all.
    #[inline]
    pub fn is_locked(self) -> bool {
        self != LockMode::None
    }
}

impl fmt::Display for LockMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LockMode::None => "none",
            LockMode::Read => "read",
            LockMode::Write => "write",
            LockMode::Commit => "commit",
        };
        f.write_str(s)
    }
}

// ============================================================================
// TransactionStatus
// ============================================================================

/// Transaction lifecycle state.
///
/// ```text
///   Active ──prepare──> Prepared ──commit──> Committed
///     │                    │
///     └──────abort─────────┴──────> Aborted
/// ```
///
/// `Committed` and `Aborted` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransactionStatus {
    /// Reads and writes allowed
    Active,
    /// All write locks taken, waiting for commit
    Prepared,
    /// Changes published
    Committed,
    /// Changes discarded, locks released
    Aborted,
}

impl TransactionStatus {
    /// Committed or aborted.
    #[inline]
    pub fn is_dead(self) -> bool {
        matches!(self, TransactionStatus::Committed | TransactionStatus::Aborted)
    }

    /// Active or prepared.
    #[inline]
    pub fn is_alive(self) -> bool {
        !self.is_dead()
    }
}

impl fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TransactionStatus::Active => "active",
            TransactionStatus::Prepared => "prepared",
            TransactionStatus::Committed => "committed",
            TransactionStatus::Aborted => "aborted",
        };
        f.write_str(s)
    }
}

/// Lifecycle points reported to transaction listeners.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransactionEvent {
    /// Fired right before the prepare phase acquires commit locks
    PrePrepare,
    /// Fired after all writes are published
    PostCommit,
    /// Fired after an abort released every lock
    PostAbort,
}

// ============================================================================
// Identifiers
// ============================================================================

/// Transaction identifier, unique within one STM instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TxnId(pub u64);

impl fmt::Display for TxnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "txn-{}", self.0)
    }
}

/// Ref identifier, unique within one STM instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RefId(pub u64);

impl fmt::Display for RefId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ref-{}", self.0)
    }
}
