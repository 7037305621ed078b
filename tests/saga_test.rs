//! Compensator behavior: reverse order, exactly-once, failure tolerance.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use porter::event::{EventKind, EventLog};
use porter::model::{Job, JobId, Phase};
use porter::saga::{CompensationLog, Compensator, UndoAction, Undoer};

fn test_job() -> Job {
    Job {
        id: JobId::new(),
        job_type: "code-migration".to_string(),
        idempotency_key: None,
        priority: 0,
        payload: serde_json::Value::Null,
        metadata: HashMap::new(),
        timeout: Duration::from_secs(600),
        max_retries: 3,
        created_at: Utc::now(),
    }
}

/// Records undo calls; fails any action listed in `fail_on`.
#[derive(Default)]
struct RecordingUndoer {
    fail_on: Vec<String>,
    calls: Mutex<Vec<String>>,
}

impl RecordingUndoer {
    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl Undoer for RecordingUndoer {
    async fn undo(
        &self,
        _job: &Job,
        _phase: Phase,
        action: &UndoAction,
    ) -> Result<(), String> {
        self.calls.lock().unwrap().push(action.0.clone());
        if self.fail_on.contains(&action.0) {
            Err(format!("cannot undo {action}"))
        } else {
            Ok(())
        }
    }
}

struct Rig {
    log: Arc<CompensationLog>,
    events: Arc<EventLog>,
    undoer: Arc<RecordingUndoer>,
    compensator: Compensator,
}

fn rig(fail_on: Vec<String>) -> Rig {
    let log = Arc::new(CompensationLog::new());
    let events = Arc::new(EventLog::new());
    let undoer = Arc::new(RecordingUndoer {
        fail_on,
        calls: Mutex::new(Vec::new()),
    });
    let compensator = Compensator::new(
        Arc::clone(&log),
        Arc::clone(&undoer) as Arc<dyn Undoer>,
        Arc::clone(&events),
    );
    Rig {
        log,
        events,
        undoer,
        compensator,
    }
}

#[tokio::test]
async fn compensation_runs_in_reverse_completion_order() {
    let rig = rig(vec![]);
    let job = test_job();

    rig.log
        .record(job.id, Phase::Ingestion, UndoAction::new("vcs/delete-branch"))
        .await;
    rig.log
        .record(job.id, Phase::Verification, UndoAction::new("vcs/revert-commit"))
        .await;
    rig.log
        .record(job.id, Phase::Execution, UndoAction::new("vcs/close-pull-request"))
        .await;

    let attempted = rig.compensator.compensate(&job).await;
    assert_eq!(attempted, 3);
    assert_eq!(
        rig.undoer.calls(),
        vec![
            "vcs/close-pull-request".to_string(),
            "vcs/revert-commit".to_string(),
            "vcs/delete-branch".to_string(),
        ]
    );
}

#[tokio::test]
async fn compensation_runs_exactly_once() {
    let rig = rig(vec![]);
    let job = test_job();

    rig.log
        .record(job.id, Phase::Ingestion, UndoAction::new("vcs/delete-branch"))
        .await;

    assert_eq!(rig.compensator.compensate(&job).await, 1);
    assert_eq!(rig.compensator.compensate(&job).await, 0);
    assert_eq!(rig.undoer.calls().len(), 1);
}

#[tokio::test]
async fn one_failing_action_does_not_block_the_rest() {
    let rig = rig(vec!["vcs/revert-commit".to_string()]);
    let job = test_job();

    rig.log
        .record(job.id, Phase::Ingestion, UndoAction::new("vcs/delete-branch"))
        .await;
    rig.log
        .record(job.id, Phase::Verification, UndoAction::new("vcs/revert-commit"))
        .await;
    rig.log
        .record(job.id, Phase::Execution, UndoAction::new("vcs/close-pull-request"))
        .await;

    // The middle action fails; the other two still run.
    let attempted = rig.compensator.compensate(&job).await;
    assert_eq!(attempted, 3);
    assert_eq!(rig.undoer.calls().len(), 3);

    // Every action left a CompensationRun event, failure included.
    let events = rig.events.for_job(job.id).await;
    let runs: Vec<(bool, String)> = events
        .iter()
        .filter_map(|e| match &e.kind {
            EventKind::CompensationRun { ok, action, .. } => Some((*ok, action.0.clone())),
            _ => None,
        })
        .collect();
    assert_eq!(runs.len(), 3);
    assert_eq!(
        runs.iter().find(|(_, a)| a == "vcs/revert-commit").unwrap().0,
        false
    );
    assert!(runs.iter().filter(|(ok, _)| *ok).count() == 2);
}

#[tokio::test]
async fn re_recording_a_phase_replaces_its_action() {
    let rig = rig(vec![]);
    let job = test_job();

    // A reclaimed worker re-ran Ingestion and re-registered its undo.
    rig.log
        .record(job.id, Phase::Ingestion, UndoAction::new("vcs/delete-branch"))
        .await;
    rig.log
        .record(job.id, Phase::Verification, UndoAction::new("vcs/revert-commit"))
        .await;
    rig.log
        .record(job.id, Phase::Ingestion, UndoAction::new("vcs/delete-branch-v2"))
        .await;

    assert_eq!(rig.compensator.compensate(&job).await, 2);
    assert_eq!(
        rig.undoer.calls(),
        vec![
            "vcs/revert-commit".to_string(),
            "vcs/delete-branch-v2".to_string(),
        ]
    );
}
