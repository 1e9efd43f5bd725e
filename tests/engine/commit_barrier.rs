//! Commit Barrier Tests
//!
//! Groups of transactions on separate threads commit or abort together.

use crate::common::*;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

const PARTIES: usize = 6;

fn wait_for_parties(barrier: &CommitBarrier, n: usize) {
    while barrier.number_waiting() < n {
        thread::yield_now();
    }
}

// ============================================================================
// Count-down barriers
// ============================================================================

#[test]
fn all_parties_commit_together() {
    let stm = stm();
    let refs: Vec<_> = (0..PARTIES).map(|_| stm.new_ref(0usize)).collect();
    let barrier = CommitBarrier::new_count_down(PARTIES);

    thread::scope(|s| {
        for (i, r) in refs.iter().enumerate() {
            let stm = &stm;
            let barrier = &barrier;
            s.spawn(move || {
                let mut tx = stm.begin();
                r.set(&mut tx, i + 1).unwrap();
                barrier.join_commit(&mut tx).unwrap();
                assert_eq!(tx.status(), TransactionStatus::Committed);
            });
        }
    });

    assert!(barrier.is_committed());
    assert_eq!(barrier.number_waiting(), 0);
    for (i, r) in refs.iter().enumerate() {
        assert_eq!(r.atomic_get().unwrap(), i + 1);
        assert_released(r);
    }
}

#[test]
fn external_abort_aborts_every_party() {
    let stm = stm();
    let refs: Vec<_> = (0..PARTIES).map(|_| stm.new_ref(0usize)).collect();
    let barrier = CommitBarrier::new_count_down(PARTIES + 1);

    thread::scope(|s| {
        for (i, r) in refs.iter().enumerate() {
            let stm = &stm;
            let barrier = &barrier;
            s.spawn(move || {
                let mut tx = stm.begin();
                r.set(&mut tx, i + 1).unwrap();
                assert_eq!(barrier.join_commit(&mut tx), Err(StmError::BarrierAborted));
                assert_eq!(tx.status(), TransactionStatus::Aborted);
            });
        }

        wait_for_parties(&barrier, PARTIES);
        // prepared parties hold their commit locks; nothing is visible yet
        for r in &refs {
            assert_eq!(r.atomic_lock_mode(), LockMode::Commit);
        }
        barrier.abort().unwrap();
    });

    assert!(barrier.is_aborted());
    for r in &refs {
        assert_eq!(r.atomic_get().unwrap(), 0);
        assert_eq!(r.version(), 1);
        assert_released(r);
    }
}

#[test]
fn late_joiner_is_rejected_and_aborted() {
    let stm = stm();
    let r = stm.new_ref(0);
    let barrier = CommitBarrier::new_count_down(1);

    let mut first = stm.begin();
    r.set(&mut first, 1).unwrap();
    barrier.join_commit(&mut first).unwrap();

    let mut late = stm.begin();
    r.set(&mut late, 2).unwrap();
    assert!(matches!(
        barrier.join_commit(&mut late),
        Err(StmError::CommitBarrierOpen(_))
    ));
    assert_eq!(late.status(), TransactionStatus::Aborted);
    assert_eq!(r.atomic_get().unwrap(), 1);
    assert_released(&r);
}

#[test]
fn party_that_fails_to_prepare_does_not_count() {
    let stm = stm();
    let r = stm.new_ref(0);
    let barrier = CommitBarrier::new_count_down(1);

    let mut stale = stm.begin();
    r.get(&mut stale).unwrap();
    r.atomic_set(5).unwrap();
    r.set(&mut stale, 1).unwrap();
    assert!(barrier.join_commit(&mut stale).unwrap_err().is_conflict());
    assert_eq!(barrier.status(), BarrierStatus::Open);
    assert_eq!(barrier.number_waiting(), 0);

    let mut fresh = stm.begin();
    r.alter(&mut fresh, |v| v + 1).unwrap();
    barrier.join_commit(&mut fresh).unwrap();
    assert_eq!(r.atomic_get().unwrap(), 6);
}

#[test]
fn timed_join_aborts_group_on_timeout() {
    let stm = stm();
    let a = stm.new_ref(0);
    let b = stm.new_ref(0);
    let barrier = CommitBarrier::new_count_down(3);

    thread::scope(|s| {
        s.spawn(|| {
            let mut tx = stm.begin();
            a.set(&mut tx, 1).unwrap();
            assert_eq!(barrier.join_commit(&mut tx), Err(StmError::BarrierAborted));
        });
        wait_for_parties(&barrier, 1);

        let mut tx = stm.begin();
        b.set(&mut tx, 1).unwrap();
        let committed = barrier
            .try_join_commit_for(&mut tx, Duration::from_millis(20))
            .unwrap();
        assert!(!committed);
        assert_eq!(tx.status(), TransactionStatus::Aborted);
    });

    assert!(barrier.is_aborted());
    assert_eq!(a.atomic_get().unwrap(), 0);
    assert_eq!(b.atomic_get().unwrap(), 0);
}

#[test]
fn barrier_timeout_aborts_waiting_parties() {
    let stm = stm();
    let r = stm.new_ref(0);
    let barrier = Arc::new(CommitBarrier::new_count_down(2));
    barrier.set_timeout(Duration::from_millis(20)).unwrap();

    let mut tx = stm.begin();
    r.set(&mut tx, 1).unwrap();
    assert_eq!(barrier.join_commit(&mut tx), Err(StmError::BarrierAborted));
    assert!(barrier.is_aborted());
    assert_released(&r);

    assert!(matches!(
        barrier.set_timeout(Duration::from_millis(1)),
        Err(StmError::CommitBarrierOpen(_))
    ));
}

// ============================================================================
// Veto barriers
// ============================================================================

#[test]
fn veto_commits_waiting_parties() {
    let stm = stm();
    let refs: Vec<_> = (0..PARTIES).map(|_| stm.new_ref(0usize)).collect();
    let barrier = CommitBarrier::new_veto();

    thread::scope(|s| {
        for r in &refs[1..] {
            let stm = &stm;
            let barrier = &barrier;
            s.spawn(move || {
                let mut tx = stm.begin();
                r.set(&mut tx, 7).unwrap();
                barrier.join_commit(&mut tx).unwrap();
            });
        }
        wait_for_parties(&barrier, PARTIES - 1);
        assert_eq!(barrier.status(), BarrierStatus::Open);

        let mut tx = stm.begin();
        refs[0].set(&mut tx, 7).unwrap();
        barrier.veto_commit_with(&mut tx).unwrap();
    });

    assert!(barrier.is_committed());
    assert!(refs.iter().all(|r| r.atomic_get().unwrap() == 7));
}

#[test]
fn veto_without_transaction() {
    let stm = stm();
    let r = stm.new_ref(0);
    let barrier = CommitBarrier::new_veto();

    thread::scope(|s| {
        s.spawn(|| {
            let mut tx = stm.begin();
            r.set(&mut tx, 3).unwrap();
            barrier.join_commit(&mut tx).unwrap();
        });
        wait_for_parties(&barrier, 1);
        barrier.veto_commit().unwrap();
    });

    assert_eq!(r.atomic_get().unwrap(), 3);
    assert!(matches!(barrier.abort(), Err(StmError::IllegalState(_))));
}

#[test]
fn veto_is_rejected_by_count_down_barrier() {
    let barrier = CommitBarrier::new_count_down(2);
    assert!(matches!(barrier.veto_commit(), Err(StmError::IllegalState(_))));
    assert_eq!(barrier.status(), BarrierStatus::Open);
}

// ============================================================================
// Tasks and waiting
// ============================================================================

#[test]
fn tasks_follow_the_decision() {
    let committed = Arc::new(AtomicUsize::new(0));
    let aborted = Arc::new(AtomicUsize::new(0));

    let barrier = CommitBarrier::new_veto();
    for _ in 0..3 {
        let c = Arc::clone(&committed);
        barrier
            .register_on_commit(move || {
                c.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        let a = Arc::clone(&aborted);
        barrier
            .register_on_abort(move || {
                a.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
    }
    barrier.veto_commit().unwrap();

    assert_eq!(committed.load(Ordering::SeqCst), 3);
    assert_eq!(aborted.load(Ordering::SeqCst), 0);
    assert!(matches!(
        barrier.register_on_abort(|| {}),
        Err(StmError::CommitBarrierOpen(_))
    ));
}

#[test]
fn await_open_returns_after_decision() {
    let barrier = Arc::new(CommitBarrier::new_veto());
    assert!(!barrier.try_await_open(Duration::from_millis(5)));

    let waiter = {
        let barrier = Arc::clone(&barrier);
        thread::spawn(move || {
            barrier.await_open();
            barrier.status()
        })
    };
    barrier.abort().unwrap();
    assert_eq!(waiter.join().unwrap(), BarrierStatus::Aborted);
    assert!(barrier.try_await_open(Duration::from_millis(5)));
}
