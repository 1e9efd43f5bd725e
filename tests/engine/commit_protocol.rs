//! Commit Protocol Tests
//!
//! Prepare, publication and release across several refs, commit atomicity
//! when a commute fails, listeners and construction of new refs.

use crate::common::*;
use std::sync::{Arc, Mutex};

// ============================================================================
// Publication
// ============================================================================

#[test]
fn commit_publishes_every_dirty_ref() {
    let stm = stm();
    let a = stm.new_ref(1);
    let b = stm.new_ref(2);
    let untouched = stm.new_ref(3);

    let mut tx = stm.begin();
    a.set(&mut tx, 10).unwrap();
    b.alter(&mut tx, |v| v * 10).unwrap();
    untouched.get(&mut tx).unwrap();
    let version = tx.commit().unwrap();

    assert!(version > 0);
    assert_eq!(stm.current_version(), version);
    assert_eq!(a.atomic_get().unwrap(), 10);
    assert_eq!(b.atomic_get().unwrap(), 20);
    assert_eq!(a.version(), 2);
    assert_eq!(b.version(), 2);
    assert_eq!(untouched.version(), 1);
    for r in [&a, &b, &untouched] {
        assert_released(r);
    }
}

#[test]
fn prepared_transaction_blocks_readers_until_commit() {
    let stm = stm();
    let r = stm.new_ref(1);

    let mut writer = stm.begin();
    r.set(&mut writer, 2).unwrap();
    writer.prepare().unwrap();

    let mut reader = stm.begin_with(TransactionConfig::default().with_spin_count(1)).unwrap();
    assert!(r.get(&mut reader).unwrap_err().is_conflict());

    writer.commit().unwrap();
    let mut reader = stm.begin();
    assert_eq!(r.get(&mut reader).unwrap(), 2);
    reader.commit().unwrap();
}

#[test]
fn aborted_prepare_leaves_values_untouched() {
    let stm = stm();
    let a = stm.new_ref(1);
    let b = stm.new_ref(2);

    let mut tx = stm.begin();
    a.set(&mut tx, 100).unwrap();
    b.set(&mut tx, 200).unwrap();
    tx.prepare().unwrap();
    tx.abort().unwrap();

    assert_eq!(a.atomic_get().unwrap(), 1);
    assert_eq!(b.atomic_get().unwrap(), 2);
    assert_eq!(a.version(), 1);
    assert_released(&a);
    assert_released(&b);
}

#[test]
fn update_commit_advances_the_clock_once() {
    let stm = stm();
    let refs: Vec<_> = (0..5).map(|i| stm.new_ref(i)).collect();
    let before = stm.current_version();

    let mut tx = stm.begin();
    for r in &refs {
        r.alter(&mut tx, |v| v + 1).unwrap();
    }
    let version = tx.commit().unwrap();
    assert_eq!(version, before + 1);
    assert_eq!(tx.commit_version(), Some(version));
}

// ============================================================================
// Commute atomicity
// ============================================================================

#[test]
fn failing_commute_mutates_nothing() {
    let stm = stm();
    let a = stm.new_ref(1);
    let b = stm.new_ref(2);
    let c = stm.new_ref(3);

    let mut tx = stm.begin();
    a.set(&mut tx, 10).unwrap();
    b.set(&mut tx, 20).unwrap();
    c.commute(&mut tx, |_| Err(StmError::user("commute refused"))).unwrap();

    assert_eq!(tx.commit(), Err(StmError::user("commute refused")));
    assert_eq!(tx.status(), TransactionStatus::Aborted);

    assert_eq!(a.atomic_get().unwrap(), 1);
    assert_eq!(b.atomic_get().unwrap(), 2);
    assert_eq!(c.atomic_get().unwrap(), 3);
    for r in [&a, &b, &c] {
        assert_eq!(r.version(), 1);
        assert_released(r);
    }
}

#[test]
fn commutes_apply_to_latest_committed_value() {
    let stm = stm();
    let counter = stm.new_ref(0u64);

    let mut tx = stm.begin();
    counter.commute(&mut tx, |v| Ok(v + 1)).unwrap();
    counter.commute(&mut tx, |v| Ok(v * 10)).unwrap();

    // another transaction commits in between; the commutes see its value
    counter.atomic_set(5).unwrap();
    tx.commit().unwrap();

    assert_eq!(counter.atomic_get().unwrap(), 60);
    assert_released(&counter);
}

#[test]
fn reading_a_commuted_ref_flattens_it() {
    let stm = stm();
    let counter = stm.new_ref(1u64);

    let mut tx = stm.begin();
    counter.commute(&mut tx, |v| Ok(v + 1)).unwrap();
    assert_eq!(counter.get(&mut tx).unwrap(), 2);
    counter.commute(&mut tx, |v| Ok(v + 1)).unwrap();
    assert_eq!(counter.get(&mut tx).unwrap(), 3);
    tx.commit().unwrap();

    assert_eq!(counter.atomic_get().unwrap(), 3);
}

// ============================================================================
// Listeners
// ============================================================================

#[test]
fn listeners_see_lifecycle_in_registration_order() {
    let stm = stm();
    let r = stm.new_ref(1);
    let log = Arc::new(Mutex::new(Vec::new()));

    let mut tx = stm.begin();
    for name in ["first", "second"] {
        let log = Arc::clone(&log);
        tx.register(move |event: TransactionEvent| log.lock().unwrap().push((name, event)))
            .unwrap();
    }
    r.set(&mut tx, 2).unwrap();
    tx.commit().unwrap();

    assert_eq!(
        *log.lock().unwrap(),
        vec![
            ("first", TransactionEvent::PrePrepare),
            ("second", TransactionEvent::PrePrepare),
            ("first", TransactionEvent::PostCommit),
            ("second", TransactionEvent::PostCommit),
        ]
    );
}

#[test]
fn conflict_notifies_post_abort() {
    let stm = stm();
    let r = stm.new_ref(1);
    let events = Arc::new(Mutex::new(Vec::new()));

    let mut holder = stm.begin();
    r.acquire(&mut holder, LockMode::Commit).unwrap();

    let mut tx = stm.begin_with(TransactionConfig::default().with_spin_count(1)).unwrap();
    let sink = Arc::clone(&events);
    tx.register(move |event: TransactionEvent| sink.lock().unwrap().push(event))
        .unwrap();
    assert!(r.get(&mut tx).is_err());

    assert_eq!(*events.lock().unwrap(), vec![TransactionEvent::PostAbort]);
    holder.abort().unwrap();
}

// ============================================================================
// Construction
// ============================================================================

#[test]
fn constructed_ref_becomes_visible_on_commit() {
    let stm = stm();
    let mut tx = stm.begin();
    let r = Ref::new_in(&mut tx, String::from("fresh")).unwrap();
    r.open_for_construction(&mut tx).unwrap().value_mut().push_str(" value");

    let mut other = stm.begin_with(TransactionConfig::default().with_spin_count(1)).unwrap();
    assert!(r.get(&mut other).unwrap_err().is_conflict());

    tx.commit().unwrap();
    assert_eq!(r.atomic_get().unwrap(), "fresh value");
    assert_eq!(r.version(), 1);
    assert_released(&r);
}

#[test]
fn aborted_construction_is_never_visible() {
    let stm = stm();
    let mut tx = stm.begin();
    let r = Ref::new_in(&mut tx, 42).unwrap();
    tx.abort().unwrap();

    assert_eq!(
        r.atomic_get(),
        Err(StmError::conflict(ConflictReason::Uncommitted))
    );
    let mut reader = stm.begin();
    assert_eq!(
        r.get(&mut reader),
        Err(StmError::conflict(ConflictReason::Uncommitted))
    );
}

#[test]
fn constructed_refs_link_to_each_other() {
    let stm = stm();
    let (head, tail) = stm
        .atomically(|tx| {
            let tail = Ref::new_in(tx, 2)?;
            let head = Ref::new_in(tx, 1)?;
            Ok((head, tail))
        })
        .unwrap();
    assert_eq!(head.atomic_get().unwrap() + tail.atomic_get().unwrap(), 3);
}
