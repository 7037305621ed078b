//! Saga compensation: reverse-order undo of completed phases.
//!
//! Undo actions are recorded as (phase, action-reference) pairs at the
//! moment a phase completes, never as closures, so compensation can be
//! replayed after a process restart. The compensator only sequences;
//! the undo logic itself lives behind the `Undoer` capability.

use std::collections::HashMap;

use async_trait::async_trait;
use opentelemetry::KeyValue;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::event::{EventKind, EventLog};
use crate::model::{Job, JobId, Phase};
use crate::telemetry::metrics;

/// Reference to a registered undo action (e.g. "vcs/delete-branch",
/// "vcs/revert-commit", "vcs/close-pull-request").
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UndoAction(pub String);

impl UndoAction {
    pub fn new(reference: impl Into<String>) -> Self {
        Self(reference.into())
    }
}

impl std::fmt::Display for UndoAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Executes a single undo action. Implemented by the version-control
/// collaborator in production, by recorders in tests.
#[async_trait]
pub trait Undoer: Send + Sync {
    async fn undo(
        &self,
        job: &Job,
        phase: Phase,
        action: &UndoAction,
    ) -> std::result::Result<(), String>;
}

/// An `Undoer` that does nothing. For job types with no undo hooks.
pub struct NoopUndoer;

#[async_trait]
impl Undoer for NoopUndoer {
    async fn undo(
        &self,
        job: &Job,
        phase: Phase,
        action: &UndoAction,
    ) -> std::result::Result<(), String> {
        info!(job_id = %job.id, %phase, %action, "no undoer configured, skipping");
        Ok(())
    }
}

#[derive(Default)]
struct SagaEntry {
    steps: Vec<(Phase, UndoAction)>,
    compensated: bool,
}

/// Per-job ordered undo actions, recorded as phases complete.
pub struct CompensationLog {
    inner: RwLock<HashMap<JobId, SagaEntry>>,
}

impl CompensationLog {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(HashMap::new()),
        }
    }

    /// Record an undo action for a completed phase. Order of recording is
    /// the order of phase completion. Re-recording a phase (a reclaimed
    /// worker re-ran it) replaces the action in place, keeping one undo
    /// per phase.
    pub async fn record(&self, job_id: JobId, phase: Phase, action: UndoAction) {
        let mut inner = self.inner.write().await;
        let entry = inner.entry(job_id).or_default();
        if let Some(existing) = entry.steps.iter_mut().find(|(p, _)| *p == phase) {
            existing.1 = action;
        } else {
            entry.steps.push((phase, action));
        }
    }

    /// The recorded (phase, action) pairs in completion order.
    pub async fn steps(&self, job_id: JobId) -> Vec<(Phase, UndoAction)> {
        self.inner
            .read()
            .await
            .get(&job_id)
            .map(|e| e.steps.clone())
            .unwrap_or_default()
    }

    /// Atomically mark the job as compensated. Returns false if a
    /// compensation already ran; callers must then skip.
    pub async fn try_begin(&self, job_id: JobId) -> bool {
        let mut inner = self.inner.write().await;
        let entry = inner.entry(job_id).or_default();
        if entry.compensated {
            false
        } else {
            entry.compensated = true;
            true
        }
    }

    pub async fn purge(&self, job_id: JobId) {
        self.inner.write().await.remove(&job_id);
    }
}

impl Default for CompensationLog {
    fn default() -> Self {
        Self::new()
    }
}

/// Replays a failed job's undo actions in reverse completion order.
pub struct Compensator {
    log: Arc<CompensationLog>,
    undoer: Arc<dyn Undoer>,
    events: Arc<EventLog>,
}

impl Compensator {
    pub fn new(log: Arc<CompensationLog>, undoer: Arc<dyn Undoer>, events: Arc<EventLog>) -> Self {
        Self { log, undoer, events }
    }

    /// Run compensation for a failed job. Runs at most once per job;
    /// individual action failures are logged and recorded, never
    /// propagated, so one irreversible step does not block the rest.
    /// Returns the number of actions attempted.
    pub async fn compensate(&self, job: &Job) -> usize {
        if !self.log.try_begin(job.id).await {
            return 0;
        }

        let steps = self.log.steps(job.id).await;
        let mut attempted = 0;
        for (phase, action) in steps.iter().rev() {
            attempted += 1;
            let outcome = self.undoer.undo(job, *phase, action).await;
            let (ok, detail) = match outcome {
                Ok(()) => {
                    info!(job_id = %job.id, %phase, %action, "compensation applied");
                    (true, None)
                }
                Err(e) => {
                    warn!(job_id = %job.id, %phase, %action, error = %e, "compensation failed");
                    (false, Some(e))
                }
            };
            metrics::saga_compensations().add(
                1,
                &[
                    KeyValue::new("phase", phase.to_string()),
                    KeyValue::new("result", if ok { "ok" } else { "error" }),
                ],
            );
            self.events
                .append(
                    job.id,
                    EventKind::CompensationRun {
                        phase: *phase,
                        action: action.clone(),
                        ok,
                        detail,
                    },
                )
                .await;
        }
        attempted
    }
}
