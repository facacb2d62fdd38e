//! Quota ceiling properties under concurrency.

use std::sync::Arc;
use std::time::Duration;

use quotagate::{KeySpace, ManualClock, MemoryStore, QuotaCounter, QuotaDecision, QuotaPolicy, Refund};

const DAY: Duration = Duration::from_secs(86_400);

fn counter(limit: u32) -> (QuotaCounter<MemoryStore>, ManualClock) {
    let clock = ManualClock::new(0);
    let store = Arc::new(MemoryStore::with_clock(Arc::new(clock.clone())));
    let counter = QuotaCounter::new(
        store,
        KeySpace::default(),
        QuotaPolicy::daily(limit),
        Arc::new(clock.clone()),
    );
    (counter, clock)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn exactly_limit_of_n_concurrent_consumes_succeed() {
    let (counter, _clock) = counter(7);
    let counter = Arc::new(counter);

    let mut handles = Vec::new();
    for _ in 0..32 {
        let counter = counter.clone();
        handles.push(tokio::spawn(async move { counter.try_consume("user-1").await }));
    }

    let results: Vec<_> = futures::future::join_all(handles).await;
    let mut granted = 0;
    let mut max_used = 0;
    for result in results {
        match result.unwrap().unwrap() {
            QuotaDecision::Granted { used, .. } => {
                granted += 1;
                max_used = max_used.max(used);
            }
            QuotaDecision::Exhausted { limit, .. } => assert_eq!(limit, 7),
        }
    }

    assert_eq!(granted, 7, "exactly min(N, limit) of N concurrent calls succeed");
    assert!(max_used <= 7, "no observed count may exceed the limit, got {}", max_used);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_refunds_and_consumes_never_go_negative() {
    let (counter, _clock) = counter(4);
    let counter = Arc::new(counter);

    // Burn the whole quota first.
    for _ in 0..4 {
        assert!(counter.try_consume("user-1").await.unwrap().is_granted());
    }

    // More refunds than grants outstanding: the surplus must no-op.
    let mut handles = Vec::new();
    for _ in 0..8 {
        let counter = counter.clone();
        handles.push(tokio::spawn(async move { counter.refund("user-1").await }));
    }

    let refunds: Vec<_> = futures::future::join_all(handles).await;
    let applied = refunds
        .into_iter()
        .filter(|r| matches!(r.as_ref().unwrap().as_ref().unwrap(), Refund::Applied { .. }))
        .count();
    assert_eq!(applied, 4, "only as many refunds apply as grants were consumed");

    // Counter is back at zero, full capacity again.
    assert_eq!(counter.remaining("user-1").await.unwrap(), 4);
}

#[tokio::test]
async fn consume_refund_cycle_is_balanced() {
    let (counter, _clock) = counter(3);

    let before = counter.remaining("user-1").await.unwrap();
    counter.try_consume("user-1").await.unwrap();
    counter.refund("user-1").await.unwrap();
    assert_eq!(counter.remaining("user-1").await.unwrap(), before);
}

#[tokio::test]
async fn rollover_isolates_periods() {
    let (counter, clock) = counter(2);

    counter.try_consume("user-1").await.unwrap();
    counter.try_consume("user-1").await.unwrap();
    clock.advance(DAY);

    // New period: full quota, and refunding the old period's grant no-ops.
    assert_eq!(counter.refund("user-1").await.unwrap(), Refund::Noop);
    assert!(counter.try_consume("user-1").await.unwrap().is_granted());
    assert!(counter.try_consume("user-1").await.unwrap().is_granted());
    assert!(!counter.try_consume("user-1").await.unwrap().is_granted());
}
