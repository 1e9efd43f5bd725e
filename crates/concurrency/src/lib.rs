//! Concurrency primitives for Tessera
//!
//! This crate implements the lock-free building blocks of the STM:
//! - Orec: per-ref ownership record (locks, reader surplus, read bias)
//! - GlobalConflictCounter: STM-wide signal that tracked reads may be stale
//! - TransactionManager: commit-version clock and transaction ids
//! - Backoff policies for spinning and between retry attempts

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod backoff;
pub mod conflict;
pub mod manager;
pub mod orec;

pub use backoff::{BackoffAction, BackoffPolicy, ExponentialBackoff, YieldBackoff};
pub use conflict::GlobalConflictCounter;
pub use manager::TransactionManager;
pub use orec::{ArriveStatus, Orec, OrecState, READ_BIASED_THRESHOLD};
