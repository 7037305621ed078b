//! Hook-based executor: phase work as external commands.
//!
//! Each job gets a workspace directory (stable across phases and across
//! re-deliveries, so re-execution overwrites rather than duplicates).
//! The job payload is handed over as `job.json`; a hook signals success
//! with exit 0 and may leave `<phase>-out.json` with its output. Exit
//! code 2 means non-retryable; any other non-zero exit is transient.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::Deserialize;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::model::{Job, Phase};
use crate::saga::{UndoAction, Undoer};

use super::{PhaseExecutor, PhaseOutcome};

/// Exit code a hook uses to signal a fatal (non-retryable) failure.
const FATAL_EXIT: i32 = 2;

/// Top-level TOML wrapper.
#[derive(Debug, Deserialize)]
struct HookConfig {
    executor: HookSpec,
}

/// Commands for one job type, one per phase.
#[derive(Debug, Clone, Deserialize)]
pub struct HookSpec {
    pub job_type: String,
    pub phases: PhaseHooks,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PhaseHooks {
    pub ingestion: PhaseHook,
    pub verification: PhaseHook,
    pub execution: PhaseHook,
    pub output: PhaseHook,
}

/// One phase's command, plus the compensating command registered on
/// success (undo branch creation, revert commit, close pull request).
#[derive(Debug, Clone, Deserialize)]
pub struct PhaseHook {
    pub command: PathBuf,
    #[serde(default)]
    pub undo: Option<PathBuf>,
}

impl HookSpec {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: HookConfig = toml::from_str(&content)
            .map_err(|e| Error::Config(format!("bad executor config {}: {e}", path.display())))?;
        Ok(config.executor)
    }

    fn hook(&self, phase: Phase) -> Option<&PhaseHook> {
        match phase {
            Phase::Ingestion => Some(&self.phases.ingestion),
            Phase::Verification => Some(&self.phases.verification),
            Phase::Execution => Some(&self.phases.execution),
            Phase::Output => Some(&self.phases.output),
            Phase::Completed | Phase::Failed => None,
        }
    }
}

/// Executor that shells out to per-phase hook commands.
pub struct HookExecutor {
    spec: HookSpec,
    workspace_base: PathBuf,
}

impl HookExecutor {
    pub fn new(spec: HookSpec, workspace_base: PathBuf) -> Self {
        Self {
            spec,
            workspace_base,
        }
    }

    fn workspace(&self, job: &Job) -> PathBuf {
        self.workspace_base.join(job.id.0.to_string())
    }

    async fn prepare_workspace(&self, job: &Job) -> Result<PathBuf> {
        let dir = self.workspace(job);
        tokio::fs::create_dir_all(&dir).await?;
        let job_json = serde_json::to_string_pretty(job)
            .map_err(|e| Error::Other(format!("serialize job: {e}")))?;
        tokio::fs::write(dir.join("job.json"), job_json).await?;
        Ok(dir)
    }
}

#[async_trait]
impl PhaseExecutor for HookExecutor {
    async fn execute(&self, job: &Job, phase: Phase) -> PhaseOutcome {
        let Some(hook) = self.spec.hook(phase) else {
            return PhaseOutcome::Fatal {
                error: format!("no hook for phase {phase}"),
            };
        };

        let dir = match self.prepare_workspace(job).await {
            Ok(dir) => dir,
            Err(e) => {
                return PhaseOutcome::Retry {
                    error: format!("workspace setup failed: {e}"),
                };
            }
        };

        let status = match run_command(&hook.command, &dir, job, phase).await {
            Ok(status) => status,
            Err(e) => {
                return PhaseOutcome::Retry {
                    error: format!("{phase} hook failed to spawn: {e}"),
                };
            }
        };

        if !status.success() {
            let code = status.code().unwrap_or(-1);
            let error = format!("{phase} hook exited with status {code}");
            return if code == FATAL_EXIT {
                PhaseOutcome::Fatal { error }
            } else {
                PhaseOutcome::Retry { error }
            };
        }

        // Hook output is optional for every phase but carries the job
        // result when the Output phase leaves it.
        let out_path = dir.join(format!("{phase}-out.json"));
        let data = match tokio::fs::read_to_string(&out_path).await {
            Ok(content) => match serde_json::from_str(&content) {
                Ok(data) => data,
                Err(e) => {
                    return PhaseOutcome::Retry {
                        error: format!("bad {phase}-out.json: {e}"),
                    };
                }
            },
            Err(_) => serde_json::Value::Null,
        };

        PhaseOutcome::Success {
            data,
            undo: hook
                .undo
                .as_ref()
                .map(|cmd| UndoAction::new(cmd.display().to_string())),
        }
    }

    async fn cleanup(&self, job: &Job) {
        let dir = self.workspace(job);
        if let Err(e) = tokio::fs::remove_dir_all(&dir).await {
            debug!(job_id = %job.id, dir = %dir.display(), "workspace cleanup skipped: {e}");
        }
    }
}

/// Runs undo hooks recorded by `HookExecutor`. The action reference is
/// the undo command path, so compensation replays after a restart.
pub struct HookUndoer {
    workspace_base: PathBuf,
}

impl HookUndoer {
    pub fn new(workspace_base: PathBuf) -> Self {
        Self { workspace_base }
    }
}

#[async_trait]
impl Undoer for HookUndoer {
    async fn undo(
        &self,
        job: &Job,
        phase: Phase,
        action: &UndoAction,
    ) -> std::result::Result<(), String> {
        let dir = self.workspace_base.join(job.id.0.to_string());
        if let Err(e) = tokio::fs::create_dir_all(&dir).await {
            return Err(format!("workspace unavailable: {e}"));
        }

        let command = PathBuf::from(&action.0);
        let status = run_command(&command, &dir, job, phase)
            .await
            .map_err(|e| format!("undo hook failed to spawn: {e}"))?;

        if status.success() {
            Ok(())
        } else {
            Err(format!(
                "undo hook exited with status {}",
                status.code().unwrap_or(-1)
            ))
        }
    }
}

async fn run_command(
    command: &Path,
    dir: &Path,
    job: &Job,
    phase: Phase,
) -> std::io::Result<std::process::ExitStatus> {
    // Resolve relative command paths against the process CWD, not the
    // workspace. Command::new + current_dir resolves relative paths after
    // chdir, which would look in the workspace instead.
    let abs_command = if command.is_relative() {
        std::env::current_dir()?.join(command)
    } else {
        command.to_path_buf()
    };

    debug!(
        job_id = %job.id,
        %phase,
        command = %abs_command.display(),
        "running hook"
    );

    let status = Command::new(&abs_command)
        .current_dir(dir)
        .env("PORTER_WORKSPACE", dir)
        .env("PORTER_JOB_ID", job.id.0.to_string())
        .env("PORTER_JOB_TYPE", &job.job_type)
        .env("PORTER_PHASE", phase.to_string())
        .status()
        .await;

    if let Err(ref e) = status {
        warn!(command = %abs_command.display(), "hook spawn error: {e}");
    }
    status
}
