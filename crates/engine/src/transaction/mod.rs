//! Transactions
//!
//! This module provides:
//! - `Transaction`: the per-attempt context that opens refs, prepares and commits
//! - `TransactionListener`: callbacks fired at PrePrepare, PostCommit and PostAbort
//!
//! # Architecture
//!
//! A transaction keeps one tranlocal per opened ref in a `TranlocalSet`:
//! - Small transactions are searched linearly
//! - Past a handful of entries an `FxHashMap` index is built once and kept up to date
//! - Entries are type-erased so refs of different value types share one set

mod context;
mod listener;
mod set;

pub use context::Transaction;
pub use listener::TransactionListener;
pub use set::LINEAR_SCAN_LIMIT;
