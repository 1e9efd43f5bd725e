//! Engine Integration Tests
//!
//! Tests for tessera-engine through the facade: lock modes, the commit
//! protocol, conflict detection, read bias, speculative families, commit
//! barriers, retry, write skew and concurrent stress.

#[path = "../common/mod.rs"]
mod common;

mod commit_barrier;
mod commit_protocol;
mod lock_modes;
mod retry;
mod speculative;
mod write_skew;
