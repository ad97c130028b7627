//! Integration tests for the queue engine on the in-memory backend.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use workq::engine::{FixedInterval, Queue};
use workq::storage::Backend;
use workq::storage::memory::MemoryBackend;
use workq::{MessageId, QueueSettings};

fn test_queue() -> Queue<MemoryBackend> {
    Queue::in_memory("engine-test").expect("failed to create in-memory queue")
}

const NO_WAIT: Option<Duration> = Some(Duration::ZERO);

// ---------------------------------------------------------------------------
// Basic lifecycle: submit → reserve → finish
// ---------------------------------------------------------------------------

#[tokio::test]
async fn submit_reserve_finish_round_trip() {
    let queue = test_queue();

    let id = queue.submit(&json!({"x": 1})).await.unwrap().expect("inserted");
    assert_eq!(queue.count().await.unwrap(), 1);

    let message = queue.reserve(NO_WAIT).await.unwrap().expect("should reserve");
    assert_eq!(message.id, id);
    assert_eq!(message.payload, json!({"x": 1}));
    assert_eq!(message.failures, 0);

    // Reserved messages are not counted or peeked.
    assert_eq!(queue.count().await.unwrap(), 0);
    assert!(queue.peek(10).await.unwrap().is_empty());

    assert!(queue.finish(id).await.unwrap());
    assert_eq!(queue.count().await.unwrap(), 0);
    assert!(queue.peek(10).await.unwrap().is_empty());
}

#[tokio::test]
async fn reserve_serves_oldest_first() {
    let queue = test_queue();
    for payload in ["P1", "P2", "P3"] {
        queue.submit(payload).await.unwrap();
    }

    let mut seen = Vec::new();
    for _ in 0..3 {
        let message = queue.reserve(NO_WAIT).await.unwrap().expect("message");
        seen.push(message.payload_as::<String>().unwrap());
    }
    assert_eq!(seen, ["P1", "P2", "P3"]);
    assert!(queue.reserve(NO_WAIT).await.unwrap().is_none());
}

#[tokio::test]
async fn ids_increase_with_submission_order() {
    let queue = test_queue();
    let a = queue.submit(&1).await.unwrap().unwrap();
    let b = queue.submit(&2).await.unwrap().unwrap();
    assert!(b > a);
}

// ---------------------------------------------------------------------------
// Finish
// ---------------------------------------------------------------------------

#[tokio::test]
async fn finish_is_idempotent() {
    let queue = test_queue();
    queue.submit(&json!("job")).await.unwrap();
    let message = queue.reserve(NO_WAIT).await.unwrap().unwrap();

    assert!(queue.finish(message.id).await.unwrap());
    assert!(!queue.finish(message.id).await.unwrap());
}

#[tokio::test]
async fn finish_unknown_id_returns_false() {
    let queue = test_queue();
    assert!(!queue.finish(MessageId(999)).await.unwrap());
    assert!(!queue.finish(MessageId(999)).await.unwrap());
}

#[tokio::test]
async fn finish_requires_a_reservation() {
    let queue = test_queue();
    let id = queue.submit(&json!("job")).await.unwrap().unwrap();

    assert!(!queue.finish(id).await.unwrap());
    assert_eq!(queue.count().await.unwrap(), 1);
}

// ---------------------------------------------------------------------------
// Release
// ---------------------------------------------------------------------------

#[tokio::test]
async fn release_redelivers_with_failure_count() {
    let queue = test_queue();
    let id = queue.submit(&json!({"keep": "me"})).await.unwrap().unwrap();

    let first = queue.reserve(NO_WAIT).await.unwrap().unwrap();
    assert!(queue.release(first.id).await.unwrap());
    assert_eq!(queue.count().await.unwrap(), 1);

    let second = queue.reserve(NO_WAIT).await.unwrap().unwrap();
    assert_eq!(second.id, id);
    assert_eq!(second.failures, 1);
    assert_eq!(second.payload, json!({"keep": "me"}));
}

#[tokio::test]
async fn release_is_noop_unless_reserved() {
    let queue = test_queue();
    let id = queue.submit(&json!("job")).await.unwrap().unwrap();

    // Ready, not reserved.
    assert!(!queue.release(id).await.unwrap());

    let message = queue.reserve(NO_WAIT).await.unwrap().unwrap();
    assert!(queue.finish(message.id).await.unwrap());

    // Finished elsewhere: release must not resurrect it.
    assert!(!queue.release(id).await.unwrap());
    assert_eq!(queue.count().await.unwrap(), 0);
}

#[tokio::test]
async fn released_message_jumps_ahead_of_newer_ones() {
    let queue = test_queue();
    let old = queue.submit("old").await.unwrap().unwrap();
    let reserved = queue.reserve(NO_WAIT).await.unwrap().unwrap();
    assert_eq!(reserved.id, old);

    queue.submit("new").await.unwrap();
    queue.release(old).await.unwrap();

    let next = queue.reserve(NO_WAIT).await.unwrap().unwrap();
    assert_eq!(next.id, old);
}

// ---------------------------------------------------------------------------
// Abort
// ---------------------------------------------------------------------------

#[tokio::test]
async fn abort_buries_reserved_message() {
    let queue = test_queue();
    let id = queue.submit(&json!({"poison": true})).await.unwrap().unwrap();
    queue.reserve(NO_WAIT).await.unwrap().unwrap();

    assert!(queue.abort(id).await.unwrap());
    assert_eq!(queue.count().await.unwrap(), 0);
    assert!(queue.reserve(NO_WAIT).await.unwrap().is_none());
    assert!(!queue.finish(id).await.unwrap());

    let buried = queue.buried(10).await.unwrap();
    assert_eq!(buried.len(), 1);
    assert_eq!(buried[0].id, id);
    assert_eq!(buried[0].failures, 1);
    assert_eq!(buried[0].payload, json!({"poison": true}));
}

#[tokio::test]
async fn abort_is_noop_unless_reserved() {
    let queue = test_queue();
    let id = queue.submit(&json!("job")).await.unwrap().unwrap();

    assert!(!queue.abort(id).await.unwrap());
    assert!(!queue.abort(MessageId(12345)).await.unwrap());
    assert_eq!(queue.count().await.unwrap(), 1);
    assert!(queue.buried(10).await.unwrap().is_empty());
}

// ---------------------------------------------------------------------------
// Take, peek, count
// ---------------------------------------------------------------------------

#[tokio::test]
async fn take_deletes_the_message() {
    let queue = test_queue();
    let id = queue.submit(&json!("once")).await.unwrap().unwrap();

    let message = queue.take(NO_WAIT).await.unwrap().expect("message");
    assert_eq!(message.id, id);
    assert_eq!(message.reserved_until, None);

    assert_eq!(queue.count().await.unwrap(), 0);
    assert!(!queue.finish(id).await.unwrap());
    assert!(!queue.release(id).await.unwrap());
    assert!(queue.take(NO_WAIT).await.unwrap().is_none());
}

#[tokio::test]
async fn peek_does_not_claim() {
    let queue = test_queue();
    for n in 0..5 {
        queue.submit(&n).await.unwrap();
    }

    let peeked = queue.peek(3).await.unwrap();
    let payloads: Vec<i64> = peeked.iter().map(|m| m.payload_as().unwrap()).collect();
    assert_eq!(payloads, [0, 1, 2]);
    assert_eq!(queue.count().await.unwrap(), 5);

    let reserved = queue.reserve(NO_WAIT).await.unwrap().unwrap();
    assert_eq!(reserved.id, peeked[0].id);
    assert!(queue.peek(0).await.unwrap().is_empty());
}

#[tokio::test]
async fn count_tracks_ready_messages_only() {
    let queue = test_queue();
    assert_eq!(queue.count().await.unwrap(), 0);

    for n in 0..4 {
        queue.submit(&n).await.unwrap();
    }
    queue.reserve(NO_WAIT).await.unwrap().unwrap();
    queue.take(NO_WAIT).await.unwrap().unwrap();

    assert_eq!(queue.count().await.unwrap(), 2);
}

// ---------------------------------------------------------------------------
// Waiting
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn reserve_times_out_on_empty_queue() {
    let queue = test_queue();

    let started = tokio::time::Instant::now();
    let message = queue.reserve(Some(Duration::from_secs(1))).await.unwrap();
    let elapsed = started.elapsed();

    assert!(message.is_none());
    assert!(elapsed >= Duration::from_secs(1), "returned early: {elapsed:?}");
    assert!(elapsed < Duration::from_millis(1100), "overshot: {elapsed:?}");
}

#[tokio::test(start_paused = true)]
async fn reserve_uses_default_timeout() {
    let settings = QueueSettings {
        default_timeout: Duration::from_secs(3),
        ..QueueSettings::default()
    };
    let queue = Queue::with_backend("defaults", MemoryBackend::new(), settings).unwrap();

    let started = tokio::time::Instant::now();
    assert!(queue.take(None).await.unwrap().is_none());
    assert!(started.elapsed() >= Duration::from_secs(3));
}

#[tokio::test]
async fn submit_wakes_a_waiting_consumer() {
    // A poll interval far longer than the test: only the wakeup can deliver.
    let queue = Arc::new(test_queue().with_wait_strategy(FixedInterval(Duration::from_secs(60))));

    let consumer = {
        let queue = Arc::clone(&queue);
        tokio::spawn(async move { queue.reserve(Some(Duration::from_secs(30))).await })
    };

    tokio::time::sleep(Duration::from_millis(100)).await;
    let id = queue.submit(&json!("wake up")).await.unwrap().unwrap();

    let message = tokio::time::timeout(Duration::from_secs(5), consumer)
        .await
        .expect("consumer should wake before its poll interval")
        .unwrap()
        .unwrap()
        .expect("message");
    assert_eq!(message.id, id);
}

#[tokio::test]
async fn expired_reservation_is_redelivered() {
    let settings = QueueSettings {
        visibility_timeout: Some(Duration::from_secs(1)),
        ..QueueSettings::default()
    };
    let queue = Queue::with_backend("visibility", MemoryBackend::new(), settings).unwrap();
    let id = queue.submit(&json!("slow")).await.unwrap().unwrap();

    let first = queue.reserve(NO_WAIT).await.unwrap().unwrap();
    assert!(first.reserved_until.is_some());
    assert!(queue.reserve(NO_WAIT).await.unwrap().is_none());

    let second = queue
        .reserve(Some(Duration::from_secs(5)))
        .await
        .unwrap()
        .expect("lapsed reservation should come back");
    assert_eq!(second.id, id);
    assert_eq!(second.failures, 1);
    assert!(second.reserved_until > first.reserved_until);
    assert!(queue.finish(second.id).await.unwrap());
}

#[tokio::test]
async fn lapsed_reservation_cannot_be_settled_by_its_old_holder() {
    let settings = QueueSettings {
        visibility_timeout: Some(Duration::from_secs(1)),
        ..QueueSettings::default()
    };
    let queue = Queue::with_backend("leases", MemoryBackend::new(), settings).unwrap();
    queue.submit(&json!("contended")).await.unwrap();

    let a = queue.reserve(NO_WAIT).await.unwrap().unwrap();
    let b = queue
        .reserve(Some(Duration::from_secs(5)))
        .await
        .unwrap()
        .expect("lapsed reservation should come back");
    assert_eq!(b.id, a.id);
    assert_ne!(b.lease, a.lease);

    // A's reservation is gone; nothing it does may touch B's.
    assert!(!queue.finish(&a).await.unwrap());
    assert!(!queue.release(&a).await.unwrap());
    assert!(!queue.abort(&a).await.unwrap());
    assert!(queue.buried(10).await.unwrap().is_empty());

    assert!(queue.finish(&b).await.unwrap());
    assert!(!queue.finish(&b).await.unwrap());
}

#[tokio::test]
async fn each_reservation_gets_a_new_lease() {
    let queue = test_queue();
    let id = queue.submit(&json!("again")).await.unwrap().unwrap();

    let first = queue.reserve(NO_WAIT).await.unwrap().unwrap();
    assert!(queue.release(&first).await.unwrap());
    let second = queue.reserve(NO_WAIT).await.unwrap().unwrap();

    assert_eq!(second.id, id);
    assert!(second.lease > first.lease);
    assert!(!queue.release(&first).await.unwrap());
    assert!(queue.release(&second).await.unwrap());
}

// ---------------------------------------------------------------------------
// Undecodable payloads
// ---------------------------------------------------------------------------

#[tokio::test]
async fn take_buries_undecodable_payload_and_serves_the_next() {
    let queue = test_queue();
    let bad = queue.backend().insert("{not json").await.unwrap().unwrap();
    let good = queue.submit(&json!("fine")).await.unwrap().unwrap();

    let message = queue.take(NO_WAIT).await.unwrap().expect("decodable message");
    assert_eq!(message.id, good);
    assert_eq!(queue.count().await.unwrap(), 0);

    let buried = queue.buried(10).await.unwrap();
    assert_eq!(buried.len(), 1);
    assert_eq!(buried[0].id, bad);
    assert_eq!(buried[0].payload, json!("{not json"));
    assert!(buried[0].reason.as_deref().unwrap().starts_with("undecodable payload"));
}

#[tokio::test]
async fn reserve_never_strands_an_undecodable_payload() {
    let queue = test_queue();
    let bad = queue.backend().insert("{not json").await.unwrap().unwrap();

    // Visible to count, skipped by peek.
    assert_eq!(queue.count().await.unwrap(), 1);
    assert!(queue.peek(10).await.unwrap().is_empty());

    assert!(queue.reserve(NO_WAIT).await.unwrap().is_none());
    assert_eq!(queue.count().await.unwrap(), 0);
    assert!(!queue.finish(bad).await.unwrap());

    let buried = queue.buried(10).await.unwrap();
    assert_eq!(buried.len(), 1);
    assert_eq!(buried[0].id, bad);
    assert_eq!(buried[0].failures, 1);
}

// ---------------------------------------------------------------------------
// Concurrency
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_consumers_never_share_a_message() {
    let queue = Arc::new(test_queue());
    for n in 0..200 {
        queue.submit(&n).await.unwrap();
    }

    let mut workers = Vec::new();
    for _ in 0..8 {
        let queue = Arc::clone(&queue);
        workers.push(tokio::spawn(async move {
            let mut got = Vec::new();
            while let Some(message) = queue.reserve(Some(Duration::from_millis(100))).await.unwrap() {
                got.push(message.id);
                assert!(queue.finish(message.id).await.unwrap());
            }
            got
        }));
    }

    let mut all = Vec::new();
    for worker in workers {
        all.extend(worker.await.unwrap());
    }
    let unique: HashSet<_> = all.iter().copied().collect();
    assert_eq!(all.len(), 200);
    assert_eq!(unique.len(), 200);
}

// ---------------------------------------------------------------------------
// Construction and teardown
// ---------------------------------------------------------------------------

#[test]
fn empty_name_is_rejected() {
    assert!(matches!(Queue::in_memory("  "), Err(workq::Error::Config(_))));
}

#[tokio::test]
async fn flush_discards_everything() {
    let queue = test_queue();
    queue.submit(&json!("gone")).await.unwrap();
    queue.flush().await.unwrap();

    let fresh = test_queue();
    assert_eq!(fresh.count().await.unwrap(), 0);
}
