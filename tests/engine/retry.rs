//! Retry Tests
//!
//! `retry` re-runs a transaction once what it read may have changed, and the
//! driver gives up after `max_retries` attempts.

use crate::common::*;
use std::sync::Arc;

fn consumer_factory(stm: &Stm) -> TransactionFactory {
    stm.transaction_factory(
        tracking()
            .with_family_name("consumer")
            .with_max_retries(1_000_000),
    )
    .unwrap()
    .with_backoff(YieldBackoff)
}

// ============================================================================
// Blocking hand-off
// ============================================================================

#[test]
fn consumer_waits_for_producer() {
    const ITEMS: u64 = 200;

    let stm = stm();
    let queue = stm.new_ref(Vec::<u64>::new());
    let consumer = consumer_factory(&stm);

    let producer = {
        let stm = stm.clone();
        let queue = queue.clone();
        std::thread::spawn(move || {
            for i in 0..ITEMS {
                stm.atomically(|tx| {
                    queue.alter(tx, |q| {
                        let mut q = q.clone();
                        q.push(i);
                        q
                    })
                })
                .unwrap();
            }
        })
    };

    let mut received = Vec::new();
    while received.len() < ITEMS as usize {
        let item = consumer
            .atomically(|tx| {
                let mut items = queue.get(tx)?;
                if items.is_empty() {
                    return Err(tx.retry());
                }
                let item = items.remove(0);
                queue.set(tx, items)?;
                Ok(item)
            })
            .unwrap();
        received.push(item);
    }
    producer.join().unwrap();

    assert_eq!(received, (0..ITEMS).collect::<Vec<_>>());
    assert!(queue.atomic_get().unwrap().is_empty());
    assert_released(&queue);
}

#[test]
fn retry_waits_on_every_read() {
    let stm = stm();
    let left = stm.new_ref(0);
    let right = stm.new_ref(0);
    let consumer = consumer_factory(&stm);

    let setter = {
        let right = right.clone();
        std::thread::spawn(move || {
            std::thread::sleep(std::time::Duration::from_millis(10));
            right.atomic_set(1).unwrap();
        })
    };

    let sum = consumer
        .atomically(|tx| {
            let sum = left.get(tx)? + right.get(tx)?;
            if sum == 0 {
                return Err(tx.retry());
            }
            Ok(sum)
        })
        .unwrap();
    setter.join().unwrap();
    assert_eq!(sum, 1);
}

// ============================================================================
// Retry preconditions
// ============================================================================

#[test]
fn retry_without_tracking_is_not_possible() {
    let stm = stm();
    let r = stm.new_ref(0);
    let mut tx = stm.begin();
    r.get(&mut tx).unwrap();
    assert!(matches!(tx.retry(), StmError::RetryNotPossible(_)));
    assert_eq!(tx.status(), TransactionStatus::Aborted);
}

#[test]
fn retry_without_reads_is_not_possible() {
    let stm = stm();
    let mut tx = stm.begin_with(tracking()).unwrap();
    assert!(matches!(tx.retry(), StmError::RetryNotPossible(_)));
}

#[test]
fn retry_in_non_blocking_family_is_refused() {
    let stm = stm();
    let r = stm.new_ref(0);
    let f = stm
        .transaction_factory(tracking().with_blocking_allowed(false))
        .unwrap();

    let mut attempts = 0;
    let result = f.atomically(|tx| {
        attempts += 1;
        r.get(tx)?;
        Err::<(), _>(tx.retry())
    });
    assert!(matches!(result, Err(StmError::RetryNotAllowed(_))));
    assert_eq!(attempts, 1);
    assert_released(&r);
}

// ============================================================================
// Giving up
// ============================================================================

#[test]
fn endless_retry_gives_up() {
    let stm = stm();
    let r = stm.new_ref(0);
    let f = stm
        .transaction_factory(tracking().with_family_name("hopeless").with_max_retries(5))
        .unwrap()
        .with_backoff(YieldBackoff);

    let attempts = Arc::new(std::sync::atomic::AtomicU32::new(0));
    let result: Result<()> = f.atomically(|tx| {
        attempts.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        r.get(tx)?;
        Err(tx.retry())
    });

    assert_eq!(
        result,
        Err(StmError::TooManyRetries {
            family: "hopeless".to_string(),
            attempts: 5
        })
    );
    assert_eq!(attempts.load(std::sync::atomic::Ordering::Relaxed), 5);
    assert_released(&r);
    assert_eq!(stm.metrics().transactions_aborted, 5);
}
