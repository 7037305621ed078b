//! Phase executors: the collaborator boundary.
//!
//! Each phase of a job is fulfilled by an external collaborator behind
//! the `PhaseExecutor` capability, selected by job type. The core never
//! interprets the payload; it hands it over, waits (up to the job
//! timeout), and translates the outcome into a transition.

pub mod hook;

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::{Error, Result};
use crate::model::{Job, Phase};
use crate::saga::UndoAction;

pub use hook::{HookExecutor, HookUndoer};

/// What a collaborator reported back for one phase.
#[derive(Debug, Clone)]
pub enum PhaseOutcome {
    /// Phase done. `data` carries collaborator output (the Output phase's
    /// data becomes the job result); `undo` is the compensating action to
    /// register, if the phase created anything worth unwinding.
    Success {
        data: serde_json::Value,
        undo: Option<UndoAction>,
    },
    /// Transient failure, retried for the retryable phases. Rate-limit
    /// rejections from downstream collaborators land here.
    Retry { error: String },
    /// Non-retryable failure (e.g. unparseable source). Skips remaining
    /// retries.
    Fatal { error: String },
}

/// A phase-work collaborator. Must tolerate re-execution of a phase after
/// a crash-recovery reclaim (e.g. re-cloning overwrites, not duplicates).
#[async_trait]
pub trait PhaseExecutor: Send + Sync {
    async fn execute(&self, job: &Job, phase: Phase) -> PhaseOutcome;

    /// Called once after the job reaches a terminal state.
    async fn cleanup(&self, _job: &Job) {}
}

/// Registry of executors, indexed by job type.
pub struct ExecutorRegistry {
    executors: HashMap<String, Arc<dyn PhaseExecutor>>,
}

impl ExecutorRegistry {
    /// Create an empty registry with no executors.
    pub fn empty() -> Self {
        Self {
            executors: HashMap::new(),
        }
    }

    pub fn register(
        &mut self,
        job_type: impl Into<String>,
        executor: Arc<dyn PhaseExecutor>,
    ) -> &mut Self {
        self.executors.insert(job_type.into(), executor);
        self
    }

    /// Load all `.toml` hook specs from a directory and build the registry.
    pub fn load_from_dir(dir: &Path, workspace_base: &Path) -> Result<Self> {
        let mut registry = Self::empty();

        let entries = std::fs::read_dir(dir).map_err(|e| {
            Error::Config(format!("cannot read executor dir {}: {e}", dir.display()))
        })?;

        for entry in entries {
            let entry = entry?;
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "toml") {
                let spec = hook::HookSpec::load(&path)?;
                let job_type = spec.job_type.clone();
                registry.register(
                    job_type,
                    Arc::new(HookExecutor::new(spec, workspace_base.to_path_buf())),
                );
            }
        }

        Ok(registry)
    }

    /// Look up the executor for a job type.
    pub fn get(&self, job_type: &str) -> Option<Arc<dyn PhaseExecutor>> {
        self.executors.get(job_type).cloned()
    }
}
