//! # Tessera
//!
//! Software transactional memory for Rust.
//!
//! Tessera lets threads update several shared cells atomically and in
//! isolation without managing locks themselves. Every cell is a [`Ref`];
//! every unit of work runs in a [`Transaction`].
//!
//! ## Quick Start
//!
//! ```ignore
//! use tessera::prelude::*;
//!
//! let stm = Stm::new();
//! let checking = stm.new_ref(100);
//! let savings = stm.new_ref(0);
//!
//! stm.atomically(|tx| {
//!     let amount = 40;
//!     if checking.get(tx)? < amount {
//!         return Err(StmError::user("insufficient funds"));
//!     }
//!     checking.alter(tx, |v| v - amount)?;
//!     savings.alter(tx, |v| v + amount)?;
//!     Ok(())
//! })?;
//! ```
//!
//! ## Concurrency control
//!
//! Each ref carries an ownership record (orec) with read, write and commit
//! locks, a reader surplus and a read-biased mode for read-mostly refs.
//! Transactions read optimistically and validate against a global conflict
//! counter; at commit they take commit locks, publish new versions and
//! release.
//!
//! ## Layers
//!
//! - [`tessera_core`]: errors, configuration, ids and lifecycle enums
//! - [`tessera_concurrency`]: orecs, the conflict counter, the commit clock and backoff
//! - [`tessera_engine`]: refs, transactions, factories, speculative families and commit barriers

#![warn(missing_docs)]

pub mod prelude;

pub use tessera_concurrency;
pub use tessera_core;
pub use tessera_engine;

// Main entry points
pub use tessera_engine::{Ref, Stm, StmBuilder, StmMetrics, Transaction, TransactionFactory};

// Group commit
pub use tessera_engine::{BarrierStatus, CommitBarrier};

// Errors and configuration
pub use tessera_core::{
    ConflictReason, LockMode, PessimisticLockLevel, Result, SpeculativeFailure, StmConfig,
    StmError, TransactionConfig, TransactionEvent, TransactionStatus,
};
