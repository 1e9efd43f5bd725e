//! Convenient imports for Tessera.
//!
//! ```ignore
//! use tessera::prelude::*;
//!
//! let stm = Stm::new();
//! let counter = stm.new_ref(0u64);
//! stm.atomically(|tx| counter.alter(tx, |v| v + 1))?;
//! ```

// Main entry points
pub use tessera_engine::{Ref, Stm, StmBuilder, Transaction, TransactionFactory};

// Group commit
pub use tessera_engine::CommitBarrier;

// Error handling
pub use tessera_core::{Result, StmError};

// Configuration and lifecycle
pub use tessera_core::{LockMode, PessimisticLockLevel, TransactionConfig, TransactionStatus};
