#![forbid(unsafe_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use reko_queue::{ExponentialBackoff, WorkQueue};
use tokio::time::Instant;

fn queue() -> Arc<WorkQueue<u32>> {
    Arc::new(WorkQueue::new("it", ExponentialBackoff::new(Duration::from_millis(100), Duration::from_secs(1))))
}

#[tokio::test(start_paused = true)]
async fn add_after_waits_for_the_delay() {
    let q = queue();
    let t0 = Instant::now();
    q.add_after(7, Duration::from_secs(60));
    assert_eq!(q.len(), 0);
    assert_eq!(q.delayed_len(), 1);
    assert_eq!(q.get().await, Some(7));
    assert!(t0.elapsed() >= Duration::from_secs(60));
}

#[tokio::test(start_paused = true)]
async fn earliest_delay_wins() {
    let q = queue();
    let t0 = Instant::now();
    q.add_after(1, Duration::from_secs(300));
    q.add_after(1, Duration::from_secs(5));
    q.add_after(1, Duration::from_secs(120));
    assert_eq!(q.delayed_len(), 1);
    assert_eq!(q.get().await, Some(1));
    let waited = t0.elapsed();
    assert!(waited >= Duration::from_secs(5) && waited < Duration::from_secs(120), "waited {waited:?}");
}

#[tokio::test(start_paused = true)]
async fn immediate_add_supersedes_pending_delay() {
    let q = queue();
    q.add_after(3, Duration::from_secs(30));
    q.add(3);
    assert_eq!(q.delayed_len(), 0);
    assert_eq!(q.get().await, Some(3));
    q.done(&3);
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert!(q.is_empty());
}

#[tokio::test(start_paused = true)]
async fn backoff_delays_double() {
    let q = queue();
    let mut delays = Vec::new();
    for _ in 0..5 {
        delays.push(q.add_rate_limited(9).as_millis());
        let got = q.get().await;
        assert_eq!(got, Some(9));
        q.done(&9);
    }
    assert_eq!(delays, vec![100, 200, 400, 800, 1000]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn workers_never_share_a_key() {
    let q = queue();
    let in_flight: Arc<Vec<AtomicUsize>> = Arc::new((0..4).map(|_| AtomicUsize::new(0)).collect());
    let max_seen = Arc::new(AtomicUsize::new(0));
    let passes = Arc::new(AtomicUsize::new(0));

    let mut workers = Vec::new();
    for _ in 0..4 {
        let q = Arc::clone(&q);
        let in_flight = Arc::clone(&in_flight);
        let max_seen = Arc::clone(&max_seen);
        let passes = Arc::clone(&passes);
        workers.push(tokio::spawn(async move {
            while let Some(k) = q.get().await {
                let now = in_flight[k as usize].fetch_add(1, Ordering::SeqCst) + 1;
                max_seen.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(2)).await;
                in_flight[k as usize].fetch_sub(1, Ordering::SeqCst);
                passes.fetch_add(1, Ordering::SeqCst);
                q.done(&k);
            }
        }));
    }

    for round in 0..200u32 {
        q.add(round % 4);
        if round % 10 == 0 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    }
    // let the last parked re-adds run
    while !(q.is_empty() && q.in_flight() == 0) {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    q.shut_down_with_drain().await;
    for w in workers {
        w.await.unwrap();
    }
    assert_eq!(max_seen.load(Ordering::SeqCst), 1);
    assert!(passes.load(Ordering::SeqCst) >= 4);
}

#[tokio::test]
async fn drain_waits_for_in_flight_keys() {
    let q = queue();
    q.add(1);
    let k = q.get().await.unwrap();
    let drained = {
        let q = Arc::clone(&q);
        tokio::spawn(async move { q.shut_down_with_drain().await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!drained.is_finished());
    q.done(&k);
    drained.await.unwrap();
    assert!(q.get().await.is_none());
}
