//! Transaction manager: commit-version clock and transaction ids.
//!
//! Update transactions draw a fresh commit version from the shared clock
//! while they still hold the commit locks on every ref they publish, so
//! versions of transactions that touch a common ref are ordered the same way
//! as their publications.

use std::sync::atomic::{AtomicU64, Ordering};
use tessera_core::TxnId;

/// Hands out transaction ids and commit versions.
///
/// # Thread Safety
///
/// Both counters are plain atomics. There is no commit serialization lock:
/// mutual exclusion between writers comes from the orec commit locks.
#[derive(Debug)]
pub struct TransactionManager {
    /// Global version counter
    ///
    /// Monotonically increasing. Each committed update transaction increments by 1.
    version: AtomicU64,

    /// Next transaction ID
    next_txn_id: AtomicU64,
}

impl TransactionManager {
    /// Create a new transaction manager
    ///
    /// # Arguments
    /// * `initial_version` - Starting value of the commit clock
    pub fn new(initial_version: u64) -> Self {
        TransactionManager {
            version: AtomicU64::new(initial_version),
            next_txn_id: AtomicU64::new(1),
        }
    }

    /// Get current global version
    pub fn current_version(&self) -> u64 {
        self.version.load(Ordering::SeqCst)
    }

    /// Allocate next transaction ID
    pub fn next_txn_id(&self) -> TxnId {
        TxnId(self.next_txn_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Allocate next commit version (increment global version)
    ///
    /// Called once per update transaction, after prepare succeeded and before
    /// its writes are published. Read-only commits never call this.
    pub fn allocate_version(&self) -> u64 {
        self.version.fetch_add(1, Ordering::SeqCst) + 1
    }
}

impl Default for TransactionManager {
    fn default() -> Self {
        TransactionManager::new(0)
    }
}
