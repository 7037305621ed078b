//! Job record store: a materialized view over the event log.
//!
//! Records are never written in place: every mutation is an event
//! appended to the log and folded into the snapshot under the store
//! lock, so folds for one job serialize. Replaying a job's events from
//! scratch reconstructs the stored record exactly.
//!
//! Writers racing after a reclaim are fenced by delivery-attempt number:
//! the worker holding the newest claim wins, the zombie's writes bounce
//! with `LostClaim`.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::error::{Error, Result};
use crate::event::{EventKind, EventLog, PhaseEvent};
use crate::model::{Job, JobFailure, JobId, Phase, WORK_PHASES};

/// Write authorization for a claimed job: only the holder of the current
/// delivery attempt may fold transitions.
#[derive(Debug, Clone, Copy)]
pub struct Fence {
    pub job_id: JobId,
    pub delivery_attempt: u32,
}

/// Current-state projection of one job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    pub job_id: JobId,
    pub phase: Phase,
    pub phase_started_at: Option<DateTime<Utc>>,
    /// Phases completed so far, in completion order. Always a prefix of
    /// the work-phase sequence; consumed by the compensator.
    pub completed_phases: Vec<Phase>,
    pub retry_count: u32,
    /// Retries spent on the current phase. Internal bookkeeping.
    #[serde(skip)]
    pub(crate) phase_retries: u32,
    /// Owner while in flight, empty otherwise.
    pub worker_id: Option<String>,
    /// Present only in `Failed`.
    pub last_error: Option<JobFailure>,
    pub submitted_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
    /// Collaborator-supplied result, present only in `Completed`.
    pub result: Option<serde_json::Value>,
}

impl JobRecord {
    fn new(job_id: JobId, submitted_at: DateTime<Utc>) -> Self {
        Self {
            job_id,
            phase: Phase::Ingestion,
            phase_started_at: None,
            completed_phases: Vec::new(),
            retry_count: 0,
            phase_retries: 0,
            worker_id: None,
            last_error: None,
            submitted_at,
            resolved_at: None,
            result: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.phase.is_terminal()
    }

    /// Completion hint in [0.0, 1.0].
    pub fn progress(&self) -> f32 {
        if self.phase == Phase::Completed {
            1.0
        } else {
            self.completed_phases.len() as f32 / WORK_PHASES.len() as f32
        }
    }

    /// Would appending this event be a legal transition?
    fn admits(&self, kind: &EventKind) -> Result<()> {
        let illegal = |to: Phase| Error::InvalidTransition {
            from: self.phase,
            to,
        };
        match kind {
            EventKind::JobSubmitted { .. } => Err(Error::Other(format!(
                "job {} already submitted",
                self.job_id
            ))),
            EventKind::PhaseStarted { phase, .. } => {
                if self.is_terminal() || self.completed_phases.contains(phase) {
                    return Err(illegal(*phase));
                }
                if *phase == self.phase || self.phase.can_advance_to(*phase) {
                    Ok(())
                } else {
                    Err(illegal(*phase))
                }
            }
            EventKind::PhaseCompleted { phase, .. } => {
                if self.is_terminal() || *phase != self.phase {
                    return Err(illegal(*phase));
                }
                if self.completed_phases.contains(phase) {
                    return Err(illegal(*phase));
                }
                Ok(())
            }
            EventKind::RetryScheduled { phase, .. } => {
                if self.is_terminal() || *phase != self.phase {
                    return Err(illegal(*phase));
                }
                Ok(())
            }
            EventKind::JobCompleted { .. } => {
                if self.phase == Phase::Output && self.completed_phases.len() == WORK_PHASES.len()
                {
                    Ok(())
                } else {
                    Err(illegal(Phase::Completed))
                }
            }
            EventKind::JobFailed { .. } => {
                if self.is_terminal() {
                    Err(illegal(Phase::Failed))
                } else {
                    Ok(())
                }
            }
            // Progress markers are always admitted, terminal included.
            EventKind::EntryAcked { .. }
            | EventKind::EntryDeadLettered { .. }
            | EventKind::CompensationRun { .. } => Ok(()),
        }
    }

    /// Fold one event into the projection.
    fn apply(&mut self, event: &PhaseEvent) {
        match &event.kind {
            EventKind::JobSubmitted { .. } => {}
            EventKind::PhaseStarted {
                phase, worker_id, ..
            } => {
                if *phase != self.phase {
                    self.phase_retries = 0;
                }
                self.phase = *phase;
                self.phase_started_at = Some(event.timestamp);
                self.worker_id = Some(worker_id.clone());
            }
            EventKind::PhaseCompleted { phase, .. } => {
                self.completed_phases.push(*phase);
                self.phase_retries = 0;
            }
            EventKind::RetryScheduled { .. } => {
                self.retry_count += 1;
                self.phase_retries += 1;
                self.worker_id = None;
            }
            EventKind::JobCompleted { result } => {
                self.phase = Phase::Completed;
                self.resolved_at = Some(event.timestamp);
                self.result = Some(result.clone());
                self.worker_id = None;
            }
            EventKind::JobFailed { failure } => {
                self.phase = Phase::Failed;
                self.resolved_at = Some(event.timestamp);
                self.last_error = Some(failure.clone());
                self.worker_id = None;
            }
            EventKind::EntryAcked { .. }
            | EventKind::EntryDeadLettered { .. }
            | EventKind::CompensationRun { .. } => {}
        }
    }

    /// Rebuild a record from scratch by folding events in sequence order.
    /// The result must equal the stored snapshot.
    pub fn replay(events: &[PhaseEvent]) -> Option<JobRecord> {
        let first = events.first()?;
        let mut record = match &first.kind {
            EventKind::JobSubmitted { .. } => JobRecord::new(first.job_id, first.timestamp),
            _ => return None,
        };
        for event in &events[1..] {
            record.apply(event);
        }
        Some(record)
    }
}

#[derive(Default)]
struct Inner {
    jobs: HashMap<JobId, Job>,
    records: HashMap<JobId, JobRecord>,
    fences: HashMap<JobId, u32>,
}

/// The store. Holds submitted jobs, their record projections, and the
/// per-job claim fence.
pub struct JobRecordStore {
    inner: RwLock<Inner>,
}

impl JobRecordStore {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
        }
    }

    /// Register a newly submitted job.
    pub async fn insert_job(&self, job: Job) -> Result<()> {
        let mut inner = self.inner.write().await;
        if inner.jobs.contains_key(&job.id) {
            return Err(Error::Validation(format!("job {} already exists", job.id)));
        }
        inner.jobs.insert(job.id, job);
        Ok(())
    }

    pub async fn job(&self, id: JobId) -> Result<Job> {
        self.inner
            .read()
            .await
            .jobs
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::NotFound(id.to_string()))
    }

    pub async fn get(&self, id: JobId) -> Result<JobRecord> {
        self.inner
            .read()
            .await
            .records
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::NotFound(id.to_string()))
    }

    pub async fn list(&self) -> Vec<JobRecord> {
        self.inner.read().await.records.values().cloned().collect()
    }

    /// Take write ownership of a job for a delivery attempt. Fails with
    /// `LostClaim` if a newer attempt already owns it.
    pub async fn fence_claim(&self, job_id: JobId, delivery_attempt: u32) -> Result<()> {
        let mut inner = self.inner.write().await;
        let current = inner.fences.get(&job_id).copied().unwrap_or(0);
        if delivery_attempt < current {
            return Err(Error::LostClaim {
                job_id,
                held: delivery_attempt,
                current,
            });
        }
        inner.fences.insert(job_id, delivery_attempt);
        Ok(())
    }

    /// Validate, append to the log, and fold, atomically with respect to
    /// other writers of the same job. `fence: None` is the system writer
    /// (reaper), which is never fenced out.
    pub async fn commit(
        &self,
        log: &EventLog,
        job_id: JobId,
        kind: EventKind,
        fence: Option<&Fence>,
    ) -> Result<JobRecord> {
        let mut inner = self.inner.write().await;

        if let Some(fence) = fence {
            let current = inner.fences.get(&job_id).copied().unwrap_or(0);
            if fence.delivery_attempt < current {
                return Err(Error::LostClaim {
                    job_id,
                    held: fence.delivery_attempt,
                    current,
                });
            }
        }

        match inner.records.get(&job_id) {
            Some(record) => record.admits(&kind)?,
            None => {
                if !matches!(kind, EventKind::JobSubmitted { .. }) {
                    return Err(Error::NotFound(job_id.to_string()));
                }
            }
        }

        let event = log.append(job_id, kind).await;
        let record = inner
            .records
            .entry(job_id)
            .or_insert_with(|| JobRecord::new(job_id, event.timestamp));
        record.apply(&event);
        Ok(record.clone())
    }

    /// Drop terminal records whose retention window has closed. Returns
    /// the purged job IDs so callers can purge the log and saga entries.
    pub async fn purge_terminal(&self, retention: Duration, now: DateTime<Utc>) -> Vec<JobId> {
        let retention =
            chrono::Duration::from_std(retention).unwrap_or_else(|_| chrono::Duration::zero());
        let mut inner = self.inner.write().await;
        let expired: Vec<JobId> = inner
            .records
            .values()
            .filter(|r| {
                r.is_terminal() && r.resolved_at.is_some_and(|t| now - t >= retention)
            })
            .map(|r| r.job_id)
            .collect();
        for id in &expired {
            inner.records.remove(id);
            inner.jobs.remove(id);
            inner.fences.remove(id);
        }
        expired
    }
}

impl Default for JobRecordStore {
    fn default() -> Self {
        Self::new()
    }
}
