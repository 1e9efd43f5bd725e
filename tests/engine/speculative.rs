//! Speculative Configuration Tests
//!
//! Families start as small read-only transactions without read tracking and
//! relax, once per violated assumption, as their transactions demand more.

use crate::common::*;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

// ============================================================================
// Read-only speculation
// ============================================================================

#[test]
fn first_write_flips_family_to_update() {
    let stm = stm();
    let f = factory(&stm, "transfer");
    let r = stm.new_ref(1);
    assert_eq!(stm.speculative_shape("transfer"), Some(SpeculativeShape::INITIAL));

    let mut tx = f.new_transaction();
    assert_eq!(
        r.set(&mut tx, 2),
        Err(StmError::SpeculativeConfiguration(
            SpeculativeFailure::ReadonlyViolated
        ))
    );
    assert_eq!(tx.status(), TransactionStatus::Aborted);
    assert!(!stm.speculative_shape("transfer").unwrap().is_readonly);

    let mut tx = f.new_transaction();
    r.set(&mut tx, 2).unwrap();
    tx.commit().unwrap();
    assert_eq!(r.atomic_get().unwrap(), 2);
}

#[test]
fn family_learning_is_shared_between_factories() {
    let stm = stm();
    let first = factory(&stm, "shared");
    let second = factory(&stm, "shared");
    let r = stm.new_ref(0);

    first.atomically(|tx| r.alter(tx, |v| v + 1)).unwrap();

    let attempts = AtomicUsize::new(0);
    second
        .atomically(|tx| {
            attempts.fetch_add(1, Ordering::Relaxed);
            r.alter(tx, |v| v + 1)
        })
        .unwrap();
    assert_eq!(attempts.load(Ordering::Relaxed), 1);
    assert_eq!(r.atomic_get().unwrap(), 2);
}

#[test]
fn families_learn_independently() {
    let stm = stm();
    let writer = factory(&stm, "writer");
    let reader = factory(&stm, "reader");
    let r = stm.new_ref(0);

    writer.atomically(|tx| r.set(tx, 1)).unwrap();
    reader.atomically(|tx| r.get(tx)).unwrap();

    assert!(!writer.speculative_shape().is_readonly);
    assert!(reader.speculative_shape().is_readonly);
}

#[test]
fn explicitly_readonly_transaction_is_not_speculative() {
    let stm = stm();
    let config = TransactionConfig::default()
        .with_family_name("reports")
        .with_readonly(true);
    let f = stm.transaction_factory(config).unwrap();
    let r = stm.new_ref(1);

    let mut tx = f.new_transaction();
    assert!(!tx.is_speculatively_readonly());
    assert!(matches!(r.set(&mut tx, 2), Err(StmError::Readonly(_))));
    assert!(f.speculative_shape().is_readonly);
}

// ============================================================================
// Size tiers
// ============================================================================

#[test]
fn capacity_grows_to_fixed_tier() {
    let stm = stm();
    let f = factory(&stm, "pair");
    let a = stm.new_ref(1);
    let b = stm.new_ref(2);

    let mut tx = f.new_transaction();
    assert_eq!(tx.capacity(), Some(1));
    a.get(&mut tx).unwrap();
    assert_eq!(
        b.get(&mut tx),
        Err(StmError::SpeculativeConfiguration(
            SpeculativeFailure::TransactionTooSmall { required: 20 }
        ))
    );
    assert_released(&a);

    let mut tx = f.new_transaction();
    assert_eq!(tx.capacity(), Some(20));
    assert_eq!(a.get(&mut tx).unwrap() + b.get(&mut tx).unwrap(), 3);
    tx.commit().unwrap();
}

#[test]
fn large_transaction_becomes_unbounded_and_tracked() {
    let stm = stm();
    let f = factory(&stm, "scan");
    let refs: Vec<_> = (0..50u64).map(|i| stm.new_ref(i)).collect();

    let attempts = AtomicUsize::new(0);
    let total = f
        .atomically(|tx| {
            attempts.fetch_add(1, Ordering::Relaxed);
            let mut total = 0;
            for r in &refs {
                total += r.get(tx)?;
            }
            Ok(total)
        })
        .unwrap();
    assert_eq!(total, (0..50).sum::<u64>());

    let shape = f.speculative_shape();
    assert_eq!(shape.optimal_size, UNBOUNDED);
    assert!(shape.is_automatic_read_tracking);
    assert!(shape.is_readonly);
    // 1 -> 20 -> unbounded, then tracking once the untracked scan grew too long
    assert_eq!(attempts.load(Ordering::Relaxed), 4);
    assert!(stm.metrics().speculative_failures >= 3);
}

#[test]
fn shape_never_tightens() {
    let stm = stm();
    let f = factory(&stm, "mixed");
    let refs: Vec<_> = (0..30).map(|i| stm.new_ref(i)).collect();

    f.atomically(|tx| {
        for r in &refs {
            r.alter(tx, |v| v + 1)?;
        }
        Ok(())
    })
    .unwrap();
    let grown = f.speculative_shape();

    // a tiny read-only run does not undo anything
    f.atomically(|tx| refs[0].get(tx)).unwrap();
    assert_eq!(f.speculative_shape(), grown);
    assert!(!grown.is_readonly);
    assert_eq!(grown.optimal_size, UNBOUNDED);
}

// ============================================================================
// Read tracking
// ============================================================================

#[test]
fn retry_in_untracked_family_turns_tracking_on() {
    let stm = stm();
    let f = factory(&stm, "waiter");
    let r = stm.new_ref(0);

    let mut tx = f.new_transaction();
    r.get(&mut tx).unwrap();
    assert_eq!(
        tx.retry(),
        StmError::SpeculativeConfiguration(SpeculativeFailure::ReadTrackingRequired)
    );
    assert!(f.speculative_shape().is_automatic_read_tracking);

    let mut tx = f.new_transaction();
    assert!(tx.is_read_tracking());
    r.get(&mut tx).unwrap();
    assert_eq!(tx.retry(), StmError::Retry);
}

#[test]
fn speculation_can_be_disabled_per_stm() {
    let stm = Stm::builder().speculative_config(false).build().unwrap();
    let r = stm.new_ref(1);
    let attempts = Arc::new(AtomicUsize::new(0));

    let counter = Arc::clone(&attempts);
    stm.atomically(move |tx| {
        counter.fetch_add(1, Ordering::Relaxed);
        r.set(tx, 2)
    })
    .unwrap();
    assert_eq!(attempts.load(Ordering::Relaxed), 1);
}
