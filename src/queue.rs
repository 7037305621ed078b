//! In-memory work queue with at-least-once delivery.
//!
//! Entries live in the pending partition until explicitly acknowledged.
//! A claim marks the current owner and bumps the delivery attempt; a
//! claimed-but-unacked entry becomes claimable again once its idle time
//! passes the reclaim threshold. Entries that exhaust the delivery
//! ceiling are parked in the dead-letter partition, never dropped.
//!
//! Ordering is best-effort: highest priority first, then enqueue order.
//! Clock-sensitive operations take an explicit `now` in their `*_at`
//! variants so tests can advance time without sleeping.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use opentelemetry::KeyValue;
use tokio::sync::{Notify, RwLock};
use tracing::warn;

use crate::error::{Error, Result};
use crate::event::{EventKind, EventLog};
use crate::model::JobId;
use crate::telemetry::metrics;

/// A delivery handed to a consumer by `claim`, or released by `reclaim`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Delivery {
    pub entry_id: u64,
    pub job_id: JobId,
    pub delivery_attempt: u32,
}

/// An entry parked after exceeding the delivery ceiling.
#[derive(Debug, Clone)]
pub struct DeadLetter {
    pub entry_id: u64,
    pub job_id: JobId,
    pub delivery_attempt: u32,
    pub parked_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
struct Entry {
    entry_id: u64,
    job_id: JobId,
    priority: i32,
    enqueued_at: DateTime<Utc>,
    /// Do not deliver before this instant (delayed requeue for retries).
    not_before: Option<DateTime<Utc>>,
    delivery_attempt: u32,
    claim: Option<Claim>,
}

#[derive(Debug, Clone)]
struct Claim {
    consumer_id: String,
    claimed_at: DateTime<Utc>,
}

/// The pending + dead-letter partitions.
pub struct Queue {
    entries: RwLock<HashMap<u64, Entry>>,
    dead: RwLock<Vec<DeadLetter>>,
    next_entry_id: AtomicU64,
    notify: Notify,
    /// Delivery-attempt ceiling. At the next reclaim past this, the entry
    /// is dead-lettered instead of released.
    max_deliveries: u32,
    events: Arc<EventLog>,
}

impl Queue {
    pub fn new(max_deliveries: u32, events: Arc<EventLog>) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            dead: RwLock::new(Vec::new()),
            next_entry_id: AtomicU64::new(1),
            notify: Notify::new(),
            max_deliveries,
            events,
        }
    }

    /// Add an entry to the pending partition. Returns the entry ID.
    pub async fn enqueue(&self, job_id: JobId, priority: i32) -> u64 {
        self.enqueue_at(job_id, priority, Utc::now(), None).await
    }

    pub async fn enqueue_at(
        &self,
        job_id: JobId,
        priority: i32,
        now: DateTime<Utc>,
        delay: Option<Duration>,
    ) -> u64 {
        let entry_id = self.next_entry_id.fetch_add(1, Ordering::Relaxed);
        let entry = Entry {
            entry_id,
            job_id,
            priority,
            enqueued_at: now,
            not_before: delay.map(|d| now + chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::zero())),
            delivery_attempt: 0,
            claim: None,
        };
        self.entries.write().await.insert(entry_id, entry);
        self.notify.notify_one();
        metrics::queue_operations().add(1, &[KeyValue::new("operation", "enqueue")]);
        entry_id
    }

    /// Claim up to `max_count` deliverable entries, waiting up to
    /// `block_timeout` for something to arrive. May return empty.
    pub async fn claim(
        &self,
        consumer_id: &str,
        max_count: usize,
        block_timeout: Duration,
    ) -> Vec<Delivery> {
        let deadline = tokio::time::Instant::now() + block_timeout;
        loop {
            let got = self.claim_at(consumer_id, max_count, Utc::now()).await;
            if !got.is_empty() {
                return got;
            }
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return Vec::new();
            }
            tokio::select! {
                _ = self.notify.notified() => {}
                _ = tokio::time::sleep(remaining) => return Vec::new(),
            }
        }
    }

    /// Non-blocking claim against an explicit clock.
    pub async fn claim_at(
        &self,
        consumer_id: &str,
        max_count: usize,
        now: DateTime<Utc>,
    ) -> Vec<Delivery> {
        let mut entries = self.entries.write().await;

        let mut deliverable: Vec<u64> = entries
            .values()
            .filter(|e| e.claim.is_none() && e.not_before.is_none_or(|t| t <= now))
            .map(|e| e.entry_id)
            .collect();

        // Highest priority first, then enqueue order. Best-effort only.
        deliverable.sort_by(|a, b| {
            let (ea, eb) = (&entries[a], &entries[b]);
            eb.priority
                .cmp(&ea.priority)
                .then(ea.enqueued_at.cmp(&eb.enqueued_at))
                .then(ea.entry_id.cmp(&eb.entry_id))
        });

        let mut claimed = Vec::new();
        for entry_id in deliverable.into_iter().take(max_count) {
            let entry = entries.get_mut(&entry_id).unwrap();
            entry.delivery_attempt += 1;
            entry.claim = Some(Claim {
                consumer_id: consumer_id.to_string(),
                claimed_at: now,
            });
            claimed.push(Delivery {
                entry_id,
                job_id: entry.job_id,
                delivery_attempt: entry.delivery_attempt,
            });
        }

        if !claimed.is_empty() {
            metrics::queue_operations().add(
                claimed.len() as u64,
                &[KeyValue::new("operation", "claim")],
            );
        }
        claimed
    }

    /// Acknowledge an entry: remove it from the pending partition and
    /// mirror the ack into the event log as a progress marker.
    pub async fn ack(&self, entry_id: u64) -> Result<()> {
        let entry = self
            .entries
            .write()
            .await
            .remove(&entry_id)
            .ok_or(Error::EntryNotFound(entry_id))?;
        self.events
            .append(
                entry.job_id,
                EventKind::EntryAcked {
                    entry_id,
                    delivery_attempt: entry.delivery_attempt,
                },
            )
            .await;
        metrics::queue_operations().add(1, &[KeyValue::new("operation", "ack")]);
        Ok(())
    }

    /// Release a claimed entry back to pending, optionally delaying its
    /// next delivery. Used for retry backoff so a crash during the wait
    /// cannot strand the job.
    pub async fn release(&self, entry_id: u64, delay: Option<Duration>) -> Result<()> {
        self.release_at(entry_id, delay, Utc::now()).await
    }

    pub async fn release_at(
        &self,
        entry_id: u64,
        delay: Option<Duration>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let mut entries = self.entries.write().await;
        let entry = entries
            .get_mut(&entry_id)
            .ok_or(Error::EntryNotFound(entry_id))?;
        entry.claim = None;
        entry.not_before =
            delay.map(|d| now + chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::zero()));
        drop(entries);
        self.notify.notify_one();
        metrics::queue_operations().add(1, &[KeyValue::new("operation", "release")]);
        Ok(())
    }

    /// Release entries whose claim has idled past `idle_threshold` without
    /// an ack. Entries at the delivery ceiling move to the dead-letter
    /// partition instead. Returns (released, dead-lettered).
    pub async fn reclaim(&self, idle_threshold: Duration) -> (Vec<Delivery>, Vec<DeadLetter>) {
        self.reclaim_at(idle_threshold, Utc::now()).await
    }

    pub async fn reclaim_at(
        &self,
        idle_threshold: Duration,
        now: DateTime<Utc>,
    ) -> (Vec<Delivery>, Vec<DeadLetter>) {
        let threshold =
            chrono::Duration::from_std(idle_threshold).unwrap_or_else(|_| chrono::Duration::zero());
        let mut entries = self.entries.write().await;

        let idle: Vec<u64> = entries
            .values()
            .filter(|e| {
                e.claim
                    .as_ref()
                    .is_some_and(|c| now - c.claimed_at >= threshold)
            })
            .map(|e| e.entry_id)
            .collect();

        let mut released = Vec::new();
        let mut parked = Vec::new();
        for entry_id in idle {
            let at_ceiling = entries
                .get(&entry_id)
                .is_some_and(|e| e.delivery_attempt >= self.max_deliveries);
            if at_ceiling {
                let Some(entry) = entries.remove(&entry_id) else {
                    continue;
                };
                let consumer = entry
                    .claim
                    .as_ref()
                    .map(|c| c.consumer_id.clone())
                    .unwrap_or_default();
                warn!(
                    entry_id,
                    job_id = %entry.job_id,
                    delivery_attempt = entry.delivery_attempt,
                    consumer = %consumer,
                    "delivery ceiling exceeded, dead-lettering entry"
                );
                self.events
                    .append(
                        entry.job_id,
                        EventKind::EntryDeadLettered {
                            entry_id,
                            delivery_attempt: entry.delivery_attempt,
                        },
                    )
                    .await;
                metrics::queue_operations()
                    .add(1, &[KeyValue::new("operation", "dead_letter")]);
                parked.push(DeadLetter {
                    entry_id,
                    job_id: entry.job_id,
                    delivery_attempt: entry.delivery_attempt,
                    parked_at: now,
                });
            } else if let Some(entry) = entries.get_mut(&entry_id) {
                entry.claim = None;
                released.push(Delivery {
                    entry_id,
                    job_id: entry.job_id,
                    delivery_attempt: entry.delivery_attempt,
                });
            }
        }

        if !parked.is_empty() {
            self.dead.write().await.extend(parked.iter().cloned());
        }
        if !released.is_empty() {
            metrics::queue_operations().add(
                released.len() as u64,
                &[KeyValue::new("operation", "reclaim")],
            );
            self.notify.notify_one();
        }
        (released, parked)
    }

    /// Number of entries in the pending partition (claimed or not).
    pub async fn pending_len(&self) -> usize {
        self.entries.read().await.len()
    }

    /// Snapshot of the dead-letter partition.
    pub async fn dead_letters(&self) -> Vec<DeadLetter> {
        self.dead.read().await.clone()
    }
}
