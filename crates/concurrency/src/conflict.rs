//! Global conflict counter.
//!
//! Every update that departs from an orec while other transactions are still
//! registered on it bumps this counter. Transactions remember the value they
//! last validated against; as long as it has not moved, none of their tracked
//! reads can have been overwritten and the full conflict scan is skipped.

use std::sync::atomic::{AtomicU64, Ordering};

/// STM-wide counter of potentially conflicting updates.
///
/// Padded to its own cache line since every tracked read polls it.
#[repr(align(64))]
#[derive(Debug, Default)]
pub struct GlobalConflictCounter {
    count: AtomicU64,
}

impl GlobalConflictCounter {
    /// Create a counter starting at zero.
    pub const fn new() -> Self {
        GlobalConflictCounter {
            count: AtomicU64::new(0),
        }
    }

    /// Current value.
    #[inline]
    pub fn count(&self) -> u64 {
        self.count.load(Ordering::SeqCst)
    }

    /// Announce that an update may have invalidated other transactions' reads.
    #[inline]
    pub fn signal_conflict(&self) {
        self.count.fetch_add(1, Ordering::SeqCst);
    }
}
