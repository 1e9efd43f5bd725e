//! Core types for Tessera
//!
//! This crate defines the vocabulary shared by every layer of the STM:
//! - `StmError`: the error taxonomy and its classification helpers
//! - `LockMode`, `TransactionStatus`, `TransactionEvent`: lifecycle and locking enums
//! - `TxnId`, `RefId`: identifiers
//! - `TransactionConfig`, `StmConfig`: serde-backed configuration

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod error;
pub mod types;

pub use config::{BackoffConfig, PessimisticLockLevel, StmConfig, TransactionConfig};
pub use error::{ConflictReason, Result, SpeculativeFailure, StmError};
pub use types::{LockMode, RefId, TransactionEvent, TransactionStatus, TxnId};
