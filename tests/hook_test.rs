//! Hook executor: external commands per phase, workspace handoff, undo.

#![cfg(unix)]

use std::collections::HashMap;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::Utc;
use porter::executor::hook::{HookSpec, PhaseHook, PhaseHooks};
use porter::executor::{ExecutorRegistry, HookExecutor, HookUndoer, PhaseExecutor, PhaseOutcome};
use porter::model::{Job, JobId, Phase};
use porter::saga::{UndoAction, Undoer};
use uuid::Uuid;

fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
    let mut perms = std::fs::metadata(&path).unwrap().permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(&path, perms).unwrap();
    path
}

fn test_dirs() -> (PathBuf, PathBuf) {
    let base = std::env::temp_dir()
        .join("porter-test")
        .join(Uuid::new_v4().to_string());
    let hooks = base.join("hooks");
    let workspaces = base.join("workspaces");
    std::fs::create_dir_all(&hooks).unwrap();
    std::fs::create_dir_all(&workspaces).unwrap();
    (hooks, workspaces)
}

fn test_job() -> Job {
    Job {
        id: JobId::new(),
        job_type: "code-migration".to_string(),
        idempotency_key: None,
        priority: 0,
        payload: serde_json::json!({"repo": "git://example/app"}),
        metadata: HashMap::new(),
        timeout: Duration::from_secs(600),
        max_retries: 3,
        created_at: Utc::now(),
    }
}

fn spec_with(hooks: &Path, command: PathBuf, undo: Option<PathBuf>) -> HookSpec {
    let noop = write_script(hooks, "noop.sh", "exit 0");
    let hook = |cmd: PathBuf, undo: Option<PathBuf>| PhaseHook { command: cmd, undo };
    HookSpec {
        job_type: "code-migration".to_string(),
        phases: PhaseHooks {
            ingestion: hook(command, undo),
            verification: hook(noop.clone(), None),
            execution: hook(noop.clone(), None),
            output: hook(noop, None),
        },
    }
}

#[tokio::test]
async fn hook_success_reads_outcome_file_and_registers_undo() {
    let (hooks, workspaces) = test_dirs();
    let command = write_script(
        &hooks,
        "ingest.sh",
        r#"test -f job.json || exit 1
echo '{"cloned": true}' > "$PORTER_PHASE-out.json""#,
    );
    let undo = write_script(&hooks, "undo-ingest.sh", "exit 0");

    let executor = HookExecutor::new(
        spec_with(&hooks, command, Some(undo.clone())),
        workspaces,
    );
    let job = test_job();

    match executor.execute(&job, Phase::Ingestion).await {
        PhaseOutcome::Success { data, undo: action } => {
            assert_eq!(data, serde_json::json!({"cloned": true}));
            assert_eq!(action, Some(UndoAction::new(undo.display().to_string())));
        }
        other => panic!("expected Success, got {other:?}"),
    }
}

#[tokio::test]
async fn hook_exit_codes_map_to_retry_and_fatal() {
    let (hooks, workspaces) = test_dirs();
    let transient = write_script(&hooks, "transient.sh", "exit 1");
    let fatal = write_script(&hooks, "fatal.sh", "exit 2");

    let executor = HookExecutor::new(spec_with(&hooks, transient, None), workspaces.clone());
    let job = test_job();
    assert!(matches!(
        executor.execute(&job, Phase::Ingestion).await,
        PhaseOutcome::Retry { .. }
    ));

    let executor = HookExecutor::new(spec_with(&hooks, fatal, None), workspaces);
    assert!(matches!(
        executor.execute(&job, Phase::Ingestion).await,
        PhaseOutcome::Fatal { .. }
    ));
}

#[tokio::test]
async fn hook_undoer_runs_the_recorded_command() {
    let (hooks, workspaces) = test_dirs();
    let job = test_job();
    let marker = hooks.join("undone.marker");
    let undo = write_script(
        &hooks,
        "undo.sh",
        &format!("touch {}", marker.display()),
    );

    let undoer = HookUndoer::new(workspaces);
    undoer
        .undo(&job, Phase::Execution, &UndoAction::new(undo.display().to_string()))
        .await
        .unwrap();
    assert!(marker.exists());

    // A missing undo command is a compensation error, not a panic.
    let err = undoer
        .undo(
            &job,
            Phase::Execution,
            &UndoAction::new(hooks.join("gone.sh").display().to_string()),
        )
        .await
        .unwrap_err();
    assert!(err.contains("spawn"));
}

#[tokio::test]
async fn registry_loads_hook_specs_from_toml_dir() {
    let (hooks, workspaces) = test_dirs();
    let script = write_script(&hooks, "phase.sh", "exit 0");
    let undo = write_script(&hooks, "undo.sh", "exit 0");

    let config_dir = hooks.join("executors");
    std::fs::create_dir_all(&config_dir).unwrap();
    std::fs::write(
        config_dir.join("code-migration.toml"),
        format!(
            r#"[executor]
job_type = "code-migration"

[executor.phases.ingestion]
command = "{script}"
undo = "{undo}"

[executor.phases.verification]
command = "{script}"

[executor.phases.execution]
command = "{script}"

[executor.phases.output]
command = "{script}"
"#,
            script = script.display(),
            undo = undo.display(),
        ),
    )
    .unwrap();

    let registry = ExecutorRegistry::load_from_dir(&config_dir, &workspaces).unwrap();
    assert!(registry.get("code-migration").is_some());
    assert!(registry.get("schema-rollout").is_none());
}
