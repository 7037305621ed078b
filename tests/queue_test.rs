//! Queue semantics: at-least-once delivery, reclaim, dead-lettering.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use porter::event::{EventKind, EventLog};
use porter::model::JobId;
use porter::queue::Queue;

fn test_queue(max_deliveries: u32) -> (Arc<Queue>, Arc<EventLog>) {
    let log = Arc::new(EventLog::new());
    let queue = Arc::new(Queue::new(max_deliveries, Arc::clone(&log)));
    (queue, log)
}

#[tokio::test]
async fn enqueue_then_claim_delivers_entry() {
    let (queue, _log) = test_queue(5);
    let job_id = JobId::new();

    let entry_id = queue.enqueue(job_id, 0).await;
    let deliveries = queue.claim_at("w1", 10, Utc::now()).await;

    assert_eq!(deliveries.len(), 1);
    assert_eq!(deliveries[0].entry_id, entry_id);
    assert_eq!(deliveries[0].job_id, job_id);
    assert_eq!(deliveries[0].delivery_attempt, 1);
}

#[tokio::test]
async fn claim_prefers_higher_priority() {
    let (queue, _log) = test_queue(5);
    let low = JobId::new();
    let high = JobId::new();

    queue.enqueue(low, 0).await;
    queue.enqueue(high, 10).await;

    let deliveries = queue.claim_at("w1", 1, Utc::now()).await;
    assert_eq!(deliveries.len(), 1);
    assert_eq!(deliveries[0].job_id, high);

    let deliveries = queue.claim_at("w1", 1, Utc::now()).await;
    assert_eq!(deliveries[0].job_id, low);
}

#[tokio::test]
async fn claimed_entry_is_not_redelivered() {
    let (queue, _log) = test_queue(5);
    queue.enqueue(JobId::new(), 0).await;

    let first = queue.claim_at("w1", 10, Utc::now()).await;
    assert_eq!(first.len(), 1);
    let second = queue.claim_at("w2", 10, Utc::now()).await;
    assert!(second.is_empty());
}

#[tokio::test]
async fn unacked_claim_is_reclaimable_after_idle_threshold() {
    let (queue, _log) = test_queue(5);
    let job_id = JobId::new();
    let t0 = Utc::now();

    queue.enqueue_at(job_id, 0, t0, None).await;
    let claimed = queue.claim_at("w1", 1, t0).await;
    assert_eq!(claimed[0].delivery_attempt, 1);

    // Crash simulation: no ack, advance the clock past the threshold.
    let threshold = Duration::from_secs(30);
    let later = t0 + chrono::Duration::seconds(31);

    let (released, parked) = queue.reclaim_at(threshold, later).await;
    assert_eq!(released.len(), 1);
    assert_eq!(released[0].job_id, job_id);
    assert!(parked.is_empty());

    // Redelivery bumps the attempt counter.
    let reclaimed = queue.claim_at("w2", 1, later).await;
    assert_eq!(reclaimed.len(), 1);
    assert_eq!(reclaimed[0].entry_id, claimed[0].entry_id);
    assert_eq!(reclaimed[0].delivery_attempt, 2);
}

#[tokio::test]
async fn reclaim_before_threshold_leaves_claim_alone() {
    let (queue, _log) = test_queue(5);
    let t0 = Utc::now();
    queue.enqueue_at(JobId::new(), 0, t0, None).await;
    queue.claim_at("w1", 1, t0).await;

    let soon = t0 + chrono::Duration::seconds(5);
    let (released, parked) = queue.reclaim_at(Duration::from_secs(30), soon).await;
    assert!(released.is_empty());
    assert!(parked.is_empty());
}

#[tokio::test]
async fn ack_removes_entry_and_mirrors_to_event_log() {
    let (queue, log) = test_queue(5);
    let job_id = JobId::new();

    queue.enqueue(job_id, 0).await;
    let deliveries = queue.claim_at("w1", 1, Utc::now()).await;
    queue.ack(deliveries[0].entry_id).await.unwrap();

    assert_eq!(queue.pending_len().await, 0);

    let events = log.for_job(job_id).await;
    assert!(events.iter().any(|e| matches!(
        e.kind,
        EventKind::EntryAcked {
            delivery_attempt: 1,
            ..
        }
    )));

    // Ack is not idempotent; the entry is gone.
    assert!(queue.ack(deliveries[0].entry_id).await.is_err());
}

#[tokio::test]
async fn delivery_ceiling_moves_entry_to_dead_letter() {
    let (queue, log) = test_queue(2);
    let job_id = JobId::new();
    let t0 = Utc::now();
    let threshold = Duration::from_secs(30);

    queue.enqueue_at(job_id, 0, t0, None).await;

    // Two full claim/idle cycles reach the ceiling.
    queue.claim_at("w1", 1, t0).await;
    let t1 = t0 + chrono::Duration::seconds(31);
    let (released, _) = queue.reclaim_at(threshold, t1).await;
    assert_eq!(released.len(), 1);

    queue.claim_at("w2", 1, t1).await;
    let t2 = t1 + chrono::Duration::seconds(31);
    let (released, parked) = queue.reclaim_at(threshold, t2).await;

    assert!(released.is_empty());
    assert_eq!(parked.len(), 1);
    assert_eq!(parked[0].job_id, job_id);
    assert_eq!(parked[0].delivery_attempt, 2);

    // Parked, not dropped: reported in the dead-letter partition and log.
    assert_eq!(queue.dead_letters().await.len(), 1);
    assert_eq!(queue.pending_len().await, 0);
    let events = log.for_job(job_id).await;
    assert!(events
        .iter()
        .any(|e| matches!(e.kind, EventKind::EntryDeadLettered { .. })));

    // No further delivery.
    assert!(queue.claim_at("w3", 1, t2).await.is_empty());
}

#[tokio::test]
async fn released_entry_with_delay_is_deferred() {
    let (queue, _log) = test_queue(5);
    let job_id = JobId::new();
    let t0 = Utc::now();

    queue.enqueue_at(job_id, 0, t0, None).await;
    let deliveries = queue.claim_at("w1", 1, t0).await;

    queue
        .release_at(deliveries[0].entry_id, Some(Duration::from_secs(10)), t0)
        .await
        .unwrap();

    // Not deliverable during the backoff window.
    assert!(queue.claim_at("w1", 1, t0 + chrono::Duration::seconds(5)).await.is_empty());

    // Deliverable after, with the attempt bumped.
    let redelivered = queue
        .claim_at("w1", 1, t0 + chrono::Duration::seconds(11))
        .await;
    assert_eq!(redelivered.len(), 1);
    assert_eq!(redelivered[0].delivery_attempt, 2);
}

#[tokio::test]
async fn blocking_claim_wakes_on_enqueue() {
    let (queue, _log) = test_queue(5);
    let job_id = JobId::new();

    let waiter = {
        let queue = Arc::clone(&queue);
        tokio::spawn(async move { queue.claim("w1", 1, Duration::from_secs(5)).await })
    };

    tokio::time::sleep(Duration::from_millis(50)).await;
    queue.enqueue(job_id, 0).await;

    let deliveries = waiter.await.unwrap();
    assert_eq!(deliveries.len(), 1);
    assert_eq!(deliveries[0].job_id, job_id);
}

#[tokio::test]
async fn blocking_claim_times_out_empty() {
    let (queue, _log) = test_queue(5);
    let deliveries = queue.claim("w1", 1, Duration::from_millis(50)).await;
    assert!(deliveries.is_empty());
}
