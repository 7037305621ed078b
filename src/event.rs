//! Append-only event log.
//!
//! Everything that happens to a job lands here first, in per-job sequence
//! order. The record store is a fold over this log; replaying a job's
//! events reconstructs its record exactly. Appends for different jobs may
//! interleave freely; appends for one job are totally ordered by `seq`.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::model::{JobFailure, JobId, Phase};
use crate::saga::UndoAction;

/// An immutable record of one thing that happened to a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseEvent {
    pub job_id: JobId,
    /// Monotonically increasing per-job sequence number, starting at 1.
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    pub kind: EventKind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    JobSubmitted {
        job_type: String,
        priority: i32,
    },
    PhaseStarted {
        phase: Phase,
        worker_id: String,
        delivery_attempt: u32,
    },
    PhaseCompleted {
        phase: Phase,
        undo: Option<UndoAction>,
    },
    RetryScheduled {
        phase: Phase,
        attempt: u32,
        delay_ms: u64,
        error: String,
    },
    JobCompleted {
        result: serde_json::Value,
    },
    JobFailed {
        failure: JobFailure,
    },
    /// Queue acknowledgment, mirrored here as an implicit progress marker.
    EntryAcked {
        entry_id: u64,
        delivery_attempt: u32,
    },
    EntryDeadLettered {
        entry_id: u64,
        delivery_attempt: u32,
    },
    CompensationRun {
        phase: Phase,
        action: UndoAction,
        ok: bool,
        detail: Option<String>,
    },
}

/// The append-only log. Safe for concurrent appenders across jobs.
pub struct EventLog {
    inner: RwLock<HashMap<JobId, Vec<PhaseEvent>>>,
}

impl EventLog {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(HashMap::new()),
        }
    }

    /// Append an event, assigning the next sequence number for the job.
    pub async fn append(&self, job_id: JobId, kind: EventKind) -> PhaseEvent {
        let mut inner = self.inner.write().await;
        let events = inner.entry(job_id).or_default();
        let event = PhaseEvent {
            job_id,
            seq: events.len() as u64 + 1,
            timestamp: Utc::now(),
            kind,
        };
        events.push(event.clone());
        event
    }

    /// All events for a job, in sequence order.
    pub async fn for_job(&self, job_id: JobId) -> Vec<PhaseEvent> {
        self.inner
            .read()
            .await
            .get(&job_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Drop a job's events. Called when the retention window closes.
    pub async fn purge(&self, job_id: JobId) {
        self.inner.write().await.remove(&job_id);
    }
}

impl Default for EventLog {
    fn default() -> Self {
        Self::new()
    }
}
