//! Lock Mode Tests
//!
//! Escalation on reopen, compatibility between transactions and the
//! open-for-write scenarios.

use crate::common::*;
use proptest::prelude::*;

fn quick() -> TransactionConfig {
    TransactionConfig::default().with_spin_count(1)
}

/// Whether `requested` can be taken while another transaction holds `held`.
fn compatible(held: LockMode, requested: LockMode) -> bool {
    match (held, requested) {
        (LockMode::None, _) => true,
        (_, LockMode::None) | (_, LockMode::Read) => held != LockMode::Commit,
        (_, LockMode::Write) => held == LockMode::Read,
        (_, LockMode::Commit) => false,
    }
}

// ============================================================================
// Escalation
// ============================================================================

#[test]
fn reopen_yields_strongest_mode() {
    let stm = stm();
    for a in LockMode::ALL {
        for b in LockMode::ALL {
            let r = stm.new_ref(10);
            let mut tx = stm.begin();
            r.open_for_read(&mut tx, a).unwrap();
            let mode = r.open_for_read(&mut tx, b).unwrap().lock_mode();
            assert_eq!(mode, a.max(b), "open {} then {}", a, b);
            assert_eq!(r.atomic_lock_mode(), a.max(b));
            tx.abort().unwrap();
            assert_released(&r);
        }
    }
}

#[test]
fn reopen_for_write_yields_strongest_mode() {
    let stm = stm();
    for a in LockMode::ALL {
        for b in LockMode::ALL {
            let r = stm.new_ref(10);
            let mut tx = stm.begin();
            r.open_for_read(&mut tx, a).unwrap();
            let mode = r.open_for_write(&mut tx, b).unwrap().lock_mode();
            assert_eq!(mode, a.max(b), "read {} then write {}", a, b);
            tx.commit().unwrap();
            assert_released(&r);
            assert_eq!(r.version(), 1);
        }
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn held_mode_is_running_maximum(
        opens in prop::collection::vec((prop::sample::select(LockMode::ALL.to_vec()), any::<bool>()), 1..8)
    ) {
        let stm = Stm::new();
        let r = stm.new_ref(0u32);
        let mut tx = stm.begin();
        let mut expected = LockMode::None;
        for (mode, write) in opens {
            expected = expected.max(mode);
            let held = if write {
                r.open_for_write(&mut tx, mode).unwrap().lock_mode()
            } else {
                r.open_for_read(&mut tx, mode).unwrap().lock_mode()
            };
            prop_assert_eq!(held, expected);
            prop_assert_eq!(r.atomic_lock_mode(), expected);
        }
        tx.abort().unwrap();
        prop_assert_eq!(r.atomic_lock_mode(), LockMode::None);
        prop_assert_eq!(r.orec_state().surplus, 0);
    }
}

#[test]
fn pessimistic_levels_raise_the_floor() {
    let stm = stm();
    let cases = [
        (PessimisticLockLevel::LockNone, LockMode::None, LockMode::None),
        (PessimisticLockLevel::ReadLockReads, LockMode::Read, LockMode::Read),
        (PessimisticLockLevel::WriteLockWrites, LockMode::None, LockMode::Write),
        (PessimisticLockLevel::WriteLockReads, LockMode::Write, LockMode::Write),
        (PessimisticLockLevel::CommitLockWrites, LockMode::None, LockMode::Commit),
        (PessimisticLockLevel::CommitLockReads, LockMode::Commit, LockMode::Commit),
    ];
    for (level, on_read, on_write) in cases {
        let config = TransactionConfig::default().with_pessimistic_lock_level(level);

        let r = stm.new_ref(1);
        let mut tx = stm.begin_with(config.clone()).unwrap();
        assert_eq!(r.open_for_read(&mut tx, LockMode::None).unwrap().lock_mode(), on_read);
        tx.abort().unwrap();

        let mut tx = stm.begin_with(config).unwrap();
        assert_eq!(r.open_for_write(&mut tx, LockMode::None).unwrap().lock_mode(), on_write);
        tx.abort().unwrap();
        assert_released(&r);
    }
}

// ============================================================================
// Compatibility
// ============================================================================

#[test]
fn lock_compatibility_between_transactions() {
    let stm = stm();
    for held in LockMode::ALL {
        for requested in LockMode::ALL {
            let r = stm.new_ref(1);
            let mut holder = stm.begin_with(quick()).unwrap();
            r.acquire(&mut holder, held).unwrap();

            let mut other = stm.begin_with(quick()).unwrap();
            let outcome = r.acquire(&mut other, requested);
            if compatible(held, requested) {
                assert!(outcome.is_ok(), "{} should not block {}", held, requested);
                other.abort().unwrap();
            } else {
                assert_eq!(
                    outcome,
                    Err(StmError::conflict(ConflictReason::LockNotFree)),
                    "{} should block {}",
                    held,
                    requested
                );
                assert_eq!(other.status(), TransactionStatus::Aborted);
            }
            assert_eq!(r.atomic_lock_mode(), held);

            holder.abort().unwrap();
            assert_released(&r);
        }
    }
}

#[test]
fn ensure_blocks_other_writers_until_completion() {
    let stm = stm();
    let r = stm.new_ref(1);
    let mut holder = stm.begin();
    r.ensure(&mut holder).unwrap();

    let mut writer = stm.begin_with(quick()).unwrap();
    r.set(&mut writer, 2).unwrap();
    assert!(writer.commit().unwrap_err().is_conflict());

    holder.commit().unwrap();
    assert_released(&r);
    assert_eq!(r.atomic_get().unwrap(), 1);
}

// ============================================================================
// Open-for-write scenarios
// ============================================================================

#[test]
fn open_for_write_with_read_lock_on_free_ref() {
    let stm = stm();
    let r = stm.new_ref(10);
    let version = r.version();

    let mut tx = stm.begin();
    let tranlocal = r.open_for_write(&mut tx, LockMode::Read).unwrap();
    assert_eq!(tranlocal.lock_mode(), LockMode::Read);
    assert_eq!(*tranlocal.value(), 10);

    assert_eq!(tx.status(), TransactionStatus::Active);
    assert_eq!(r.atomic_lock_mode(), LockMode::Read);
    assert_eq!(r.version(), version);
    assert_eq!(r.atomic_get().unwrap(), 10);
    tx.abort().unwrap();
}

#[test]
fn open_for_write_on_commit_locked_ref_conflicts() {
    let stm = stm();
    let r = stm.new_ref(10);

    let mut tx1 = stm.begin();
    r.open_for_write(&mut tx1, LockMode::Commit).unwrap();

    let mut tx2 = stm.begin();
    let err = r.open_for_write(&mut tx2, LockMode::None).unwrap_err();
    assert_eq!(err, StmError::conflict(ConflictReason::LockNotFree));
    assert_eq!(tx2.status(), TransactionStatus::Aborted);

    assert_eq!(tx1.status(), TransactionStatus::Active);
    assert_eq!(r.atomic_lock_mode(), LockMode::Commit);
    assert_eq!(r.version(), 1);
    tx1.abort().unwrap();
    assert_eq!(r.atomic_get().unwrap(), 10);
}

#[test]
fn prepare_escalates_to_commit_lock() {
    let stm = stm();
    let r = stm.new_ref(10);
    let version = r.version();

    let mut tx = stm.begin();
    *r.open_for_write(&mut tx, LockMode::None).unwrap().value_mut() += 5;
    assert_eq!(r.atomic_lock_mode(), LockMode::None);

    tx.prepare().unwrap();
    assert_eq!(tx.status(), TransactionStatus::Prepared);
    assert_eq!(r.atomic_lock_mode(), LockMode::Commit);
    assert_eq!(r.version(), version);

    tx.commit().unwrap();
    assert_eq!(r.version(), version + 1);
    assert_eq!(r.atomic_get().unwrap(), 15);
    assert_released(&r);
}
