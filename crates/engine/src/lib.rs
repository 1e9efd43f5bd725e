//! Transaction engine for Tessera
//!
//! This crate implements the STM itself on top of the orec protocol:
//! - `Stm`: shared state, families, metrics and the `atomically` entry point
//! - `Ref` and `Tranlocal`: transactional cells and their per-transaction copies
//! - `Transaction`: open, prepare, commit and abort
//! - `TransactionFactory`: the retry driver with speculative family learning
//! - `CommitBarrier`: group commit of several transactions

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod barrier;
pub mod factory;
pub mod reference;
pub mod speculative;
pub mod stm;
pub mod tranlocal;
pub mod transaction;

pub use barrier::{BarrierKind, BarrierStatus, BarrierTask, CommitBarrier};
pub use factory::TransactionFactory;
pub use reference::{Ref, TxValue, VERSION_UNCOMMITTED};
pub use speculative::{SpeculativeConfiguration, SpeculativeShape, UNBOUNDED};
pub use stm::{Stm, StmBuilder, StmMetrics, DEFAULT_FAMILY};
pub use tranlocal::{CommuteFn, Tranlocal, TranlocalMode};
pub use transaction::{Transaction, TransactionListener};
