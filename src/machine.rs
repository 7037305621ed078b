//! Phase state machine. All phase transitions go through here.
//!
//! Each operation appends an event to the log and folds it into the
//! record store atomically, under the caller's fence. Phase-local errors
//! never escape as errors; they arrive here already translated into
//! transition events; only a `Failed` transition is user-visible.

use std::sync::Arc;
use std::time::Duration;

use opentelemetry::KeyValue;
use tracing::info;

use crate::error::Result;
use crate::event::{EventKind, EventLog};
use crate::model::{JobFailure, JobId, Phase, RetryPolicy};
use crate::record::{Fence, JobRecord, JobRecordStore};
use crate::saga::{CompensationLog, UndoAction};
use crate::telemetry::metrics;

pub struct PhaseMachine {
    log: Arc<EventLog>,
    store: Arc<JobRecordStore>,
    saga: Arc<CompensationLog>,
    policy: RetryPolicy,
}

impl PhaseMachine {
    pub fn new(
        log: Arc<EventLog>,
        store: Arc<JobRecordStore>,
        saga: Arc<CompensationLog>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            log,
            store,
            saga,
            policy,
        }
    }

    /// Record a fresh submission. The record starts in `Ingestion`.
    pub async fn record_submit(
        &self,
        job_id: JobId,
        job_type: &str,
        priority: i32,
    ) -> Result<JobRecord> {
        self.store
            .commit(
                &self.log,
                job_id,
                EventKind::JobSubmitted {
                    job_type: job_type.to_string(),
                    priority,
                },
                None,
            )
            .await
    }

    /// Enter a phase. Re-entering the current phase (retry, or crash
    /// recovery after a reclaim) is legal; re-entering a phase already
    /// durably completed is not.
    pub async fn start_phase(
        &self,
        job_id: JobId,
        phase: Phase,
        worker_id: &str,
        fence: &Fence,
    ) -> Result<JobRecord> {
        let from = self.store.get(job_id).await?.phase;
        let record = self
            .store
            .commit(
                &self.log,
                job_id,
                EventKind::PhaseStarted {
                    phase,
                    worker_id: worker_id.to_string(),
                    delivery_attempt: fence.delivery_attempt,
                },
                Some(fence),
            )
            .await?;
        self.count_transition(from, phase);
        Ok(record)
    }

    /// Mark a phase complete. The undo action is registered *before* the
    /// completion is folded, so a later failure unwinds exactly the
    /// phases that succeeded.
    pub async fn complete_phase(
        &self,
        job_id: JobId,
        phase: Phase,
        undo: Option<UndoAction>,
        fence: &Fence,
    ) -> Result<JobRecord> {
        if let Some(ref action) = undo {
            self.saga.record(job_id, phase, action.clone()).await;
        }
        self.store
            .commit(
                &self.log,
                job_id,
                EventKind::PhaseCompleted { phase, undo },
                Some(fence),
            )
            .await
    }

    /// Schedule a retry of the current phase, computing the backoff delay
    /// for the attempt. The claim is expected to be released for the
    /// delay so a crash during the wait cannot strand the job.
    pub async fn schedule_retry(
        &self,
        job_id: JobId,
        phase: Phase,
        error: &str,
        fence: &Fence,
    ) -> Result<(JobRecord, Duration)> {
        let attempt = self.store.get(job_id).await?.phase_retries + 1;
        let delay = self.policy.delay_for_attempt(attempt);
        info!(
            %job_id,
            %phase,
            attempt,
            delay_ms = delay.as_millis() as u64,
            error,
            "retry scheduled"
        );
        let record = self
            .store
            .commit(
                &self.log,
                job_id,
                EventKind::RetryScheduled {
                    phase,
                    attempt,
                    delay_ms: delay.as_millis() as u64,
                    error: error.to_string(),
                },
                Some(fence),
            )
            .await?;
        Ok((record, delay))
    }

    /// Final transition of the happy path.
    pub async fn complete_job(
        &self,
        job_id: JobId,
        result: serde_json::Value,
        fence: &Fence,
    ) -> Result<JobRecord> {
        let from = self.store.get(job_id).await?.phase;
        let record = self
            .store
            .commit(
                &self.log,
                job_id,
                EventKind::JobCompleted { result },
                Some(fence),
            )
            .await?;
        self.count_transition(from, Phase::Completed);
        self.record_duration(&record);
        Ok(record)
    }

    /// Absorbing failure transition. Idempotent on an already-terminal
    /// record: the first terminal transition wins and later calls return
    /// the existing record unchanged.
    pub async fn fail_job(
        &self,
        job_id: JobId,
        failure: JobFailure,
        fence: Option<&Fence>,
    ) -> Result<JobRecord> {
        let current = self.store.get(job_id).await?;
        if current.is_terminal() {
            return Ok(current);
        }
        let record = match self
            .store
            .commit(&self.log, job_id, EventKind::JobFailed { failure }, fence)
            .await
        {
            Ok(record) => record,
            // Lost the race against another terminal transition.
            Err(crate::error::Error::InvalidTransition { .. }) => {
                let latest = self.store.get(job_id).await?;
                if latest.is_terminal() {
                    return Ok(latest);
                }
                return Err(crate::error::Error::InvalidTransition {
                    from: latest.phase,
                    to: Phase::Failed,
                });
            }
            Err(e) => return Err(e),
        };
        self.count_transition(current.phase, Phase::Failed);
        self.record_duration(&record);
        Ok(record)
    }

    fn count_transition(&self, from: Phase, to: Phase) {
        metrics::phase_transitions().add(
            1,
            &[
                KeyValue::new("from", from.to_string()),
                KeyValue::new("to", to.to_string()),
            ],
        );
    }

    fn record_duration(&self, record: &JobRecord) {
        let duration_ms = record
            .resolved_at
            .map(|t| (t - record.submitted_at).num_milliseconds().max(0) as u64)
            .unwrap_or(0);
        metrics::job_duration_ms().record(
            duration_ms as f64,
            &[KeyValue::new("status", record.phase.to_string())],
        );
    }
}
