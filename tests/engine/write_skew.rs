//! Write Skew Tests
//!
//! Two transactions read the same pair and each writes a different half.
//! Plain optimistic commits allow both; write-skew prevention lets only one
//! through.

use crate::common::*;

/// Each transaction withdraws from its own account if the combined balance
/// stays non-negative.
fn withdraw(tx: &mut Transaction, from: &Ref<i64>, other: &Ref<i64>, amount: i64) -> Result<()> {
    let total = from.get(tx)? + other.get(tx)?;
    if total - amount >= 0 {
        from.alter(tx, |v| v - amount)?;
    }
    Ok(())
}

#[test]
fn default_config_allows_write_skew() {
    let stm = stm();
    let a = stm.new_ref(50i64);
    let b = stm.new_ref(50i64);

    let mut tx1 = stm.begin();
    let mut tx2 = stm.begin();
    withdraw(&mut tx1, &a, &b, 100).unwrap();
    withdraw(&mut tx2, &b, &a, 100).unwrap();

    tx1.commit().unwrap();
    tx2.commit().unwrap();
    assert_eq!(a.atomic_get().unwrap() + b.atomic_get().unwrap(), -100);
}

#[test]
fn prevention_rejects_second_transaction() {
    let stm = stm();
    let a = stm.new_ref(50i64);
    let b = stm.new_ref(50i64);
    let config = tracking().with_prevent_write_skew(true);

    let mut tx1 = stm.begin_with(config.clone()).unwrap();
    let mut tx2 = stm.begin_with(config).unwrap();
    assert!(tx1.is_write_skew_check());
    withdraw(&mut tx1, &a, &b, 100).unwrap();
    withdraw(&mut tx2, &b, &a, 100).unwrap();

    tx1.commit().unwrap();
    assert!(tx2.commit().unwrap_err().is_conflict());
    assert_eq!(tx2.status(), TransactionStatus::Aborted);

    assert_eq!(a.atomic_get().unwrap(), -50);
    assert_eq!(b.atomic_get().unwrap(), 50);
    assert_released(&a);
    assert_released(&b);
}

#[test]
fn prevention_read_locks_untouched_reads_at_prepare() {
    let stm = stm();
    let a = stm.new_ref(1i64);
    let b = stm.new_ref(2i64);
    let config = tracking()
        .with_prevent_write_skew(true)
        .with_spin_count(1);

    let mut tx = stm.begin_with(config.clone()).unwrap();
    a.get(&mut tx).unwrap();
    b.set(&mut tx, 3).unwrap();
    tx.prepare().unwrap();
    assert_eq!(a.atomic_lock_mode(), LockMode::Read);
    assert_eq!(b.atomic_lock_mode(), LockMode::Commit);

    // a writer to the read-only ref has to wait for the commit
    let mut writer = stm.begin_with(config).unwrap();
    a.set(&mut writer, 10).unwrap();
    assert!(writer.commit().unwrap_err().is_conflict());

    tx.commit().unwrap();
    assert_released(&a);
    assert_released(&b);
}

#[test]
fn concurrent_withdrawals_keep_invariant_with_prevention() {
    let stm = stm();
    let a = stm.new_ref(50i64);
    let b = stm.new_ref(50i64);
    let f = stm
        .transaction_factory(
            tracking()
                .with_prevent_write_skew(true)
                .with_family_name("withdraw"),
        )
        .unwrap()
        .with_backoff(YieldBackoff);

    let (a2, b2, f2) = (a.clone(), b.clone(), f.clone());
    run_concurrently(8, move |i| {
        for _ in 0..50 {
            if i % 2 == 0 {
                f2.atomically(|tx| withdraw(tx, &a2, &b2, 10)).unwrap();
            } else {
                f2.atomically(|tx| withdraw(tx, &b2, &a2, 10)).unwrap();
            }
        }
    });

    let total = a.atomic_get().unwrap() + b.atomic_get().unwrap();
    assert!(total >= 0, "balance went negative: {}", total);
    assert_released(&a);
    assert_released(&b);
}
