//! Core data model.
//!
//! A job is a unit of migration-style work. It has identity (type +
//! idempotency key), an opaque payload, correlation metadata, and a
//! budget (timeout + retries). Lifecycle state lives in the record
//! store, not here.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Job
// ---------------------------------------------------------------------------

/// A unit of work tracked by the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    /// Unique identifier. Immutable once assigned.
    pub id: JobId,

    /// What kind of work this is (e.g., "code-migration").
    /// Determines which executor handles each phase.
    pub job_type: String,

    /// Caller-supplied dedup token. Resubmission with a known key returns
    /// the existing job instead of creating a second one.
    pub idempotency_key: Option<String>,

    /// Priority. Higher = dispatched first within the pending partition.
    pub priority: i32,

    /// Arbitrary parameters for the executors. The engine doesn't interpret these.
    pub payload: serde_json::Value,

    /// Free-form correlation identifiers (workflow id, session id).
    /// Passed through unmodified.
    pub metadata: HashMap<String, String>,

    /// Wall-clock budget. A job in flight past this is reaped as failed.
    pub timeout: Duration,

    /// Maximum retries for the retryable phases.
    pub max_retries: u32,

    pub created_at: DateTime<Utc>,
}

/// Newtype for job IDs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobId(pub Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Short display: first 8 chars of UUID
        write!(f, "{}", &self.0.to_string()[..8])
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Phase
// ---------------------------------------------------------------------------

/// A stage of job execution.
///
/// The happy path is linear: Ingestion → Verification → Execution → Output
/// → Completed. `Failed` is absorbing and reachable from any work phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// Fetch and validate inputs (clone + validate).
    Ingestion,
    /// Check preconditions (lint + dependency check).
    Verification,
    /// Perform the transformation.
    Execution,
    /// Test and publish results.
    Output,
    /// Done successfully. Terminal.
    Completed,
    /// Unrecoverable failure. Terminal.
    Failed,
}

/// The ordered work phases, excluding the terminal states.
pub const WORK_PHASES: [Phase; 4] = [
    Phase::Ingestion,
    Phase::Verification,
    Phase::Execution,
    Phase::Output,
];

impl Phase {
    /// Can transition from self to `to`?
    pub fn can_advance_to(self, to: Phase) -> bool {
        use Phase::*;
        matches!(
            (self, to),
            (Ingestion, Verification)
                | (Verification, Execution)
                | (Execution, Output)
                | (Output, Completed)
                | (Ingestion, Failed)
                | (Verification, Failed)
                | (Execution, Failed)
                | (Output, Failed)
        )
    }

    /// The next work phase on the happy path, if any.
    pub fn next(self) -> Option<Phase> {
        match self {
            Phase::Ingestion => Some(Phase::Verification),
            Phase::Verification => Some(Phase::Execution),
            Phase::Execution => Some(Phase::Output),
            Phase::Output | Phase::Completed | Phase::Failed => None,
        }
    }

    /// Is this a terminal state?
    pub fn is_terminal(self) -> bool {
        matches!(self, Phase::Completed | Phase::Failed)
    }

    /// Fail-fast phases go straight to `Failed` on any error: their inputs
    /// are presumed static, so a failure is not transient.
    pub fn fail_fast(self) -> bool {
        matches!(self, Phase::Ingestion | Phase::Verification)
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Phase::Ingestion => "ingestion",
            Phase::Verification => "verification",
            Phase::Execution => "execution",
            Phase::Output => "output",
            Phase::Completed => "completed",
            Phase::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for Phase {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "ingestion" => Ok(Phase::Ingestion),
            "verification" => Ok(Phase::Verification),
            "execution" => Ok(Phase::Execution),
            "output" => Ok(Phase::Output),
            "completed" => Ok(Phase::Completed),
            "failed" => Ok(Phase::Failed),
            _ => Err(format!("unknown phase: {s}")),
        }
    }
}

// ---------------------------------------------------------------------------
// Failure
// ---------------------------------------------------------------------------

/// How a phase failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Phase-specific transient error. Retried for the retryable phases.
    Transient,
    /// Phase explicitly signalled non-retryable (e.g. unparseable source).
    Fatal,
    /// Job-level budget exceeded.
    Timeout,
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            FailureKind::Transient => "transient",
            FailureKind::Fatal => "fatal",
            FailureKind::Timeout => "timeout",
        };
        write!(f, "{s}")
    }
}

/// The user-visible failure attached to a `Failed` job: originating phase,
/// error kind, human-readable detail. Retry bookkeeping is not exposed
/// beyond `retry_count`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobFailure {
    pub phase: Phase,
    pub kind: FailureKind,
    pub detail: String,
    pub retry_count: u32,
}

// ---------------------------------------------------------------------------
// Retry policy
// ---------------------------------------------------------------------------

/// Backoff configuration for the retryable phases.
///
/// Delay for the n-th retry is `base * 2^(n-1)` plus jitter, clamped to
/// `[base, cap]`. The jitter is derived from the attempt counter so a
/// replayed schedule is reproducible.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub base: Duration,
    pub cap: Duration,
    /// Jitter factor (0.0-1.0) applied to the computed delay.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            cap: Duration::from_secs(30),
            jitter: 0.1,
        }
    }
}

impl RetryPolicy {
    /// Calculate the delay before retry `attempt` (1-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return self.base;
        }

        let base_ms = self.base.as_millis() as f64;
        let cap_ms = self.cap.as_millis() as f64;

        let exp = 2_f64.powi((attempt - 1).min(20) as i32);
        let delay_ms = (base_ms * exp).min(cap_ms);

        let jitter_range = delay_ms * self.jitter;
        let jitter = if jitter_range > 0.0 {
            let pseudo_random = ((attempt as f64 * 17.0) % 100.0) / 100.0;
            jitter_range * (pseudo_random - 0.5) * 2.0
        } else {
            0.0
        };

        Duration::from_millis((delay_ms + jitter).clamp(base_ms, cap_ms) as u64)
    }
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Builder for submitting new jobs. The dispatcher's public entry point.
pub struct NewJob {
    pub(crate) id: Option<JobId>,
    pub(crate) job_type: String,
    pub(crate) idempotency_key: Option<String>,
    pub(crate) priority: i32,
    pub(crate) payload: serde_json::Value,
    pub(crate) metadata: HashMap<String, String>,
    pub(crate) timeout: Duration,
    pub(crate) max_retries: u32,
}

impl NewJob {
    pub fn new(job_type: impl Into<String>) -> Self {
        Self {
            id: None,
            job_type: job_type.into(),
            idempotency_key: None,
            priority: 0,
            payload: serde_json::Value::Null,
            metadata: HashMap::new(),
            timeout: Duration::from_secs(600),
            max_retries: 3,
        }
    }

    /// Use a caller-supplied job ID instead of generating one.
    pub fn id(mut self, id: JobId) -> Self {
        self.id = Some(id);
        self
    }

    pub fn idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn max_retries(mut self, n: u32) -> Self {
        self.max_retries = n;
        self
    }

    pub(crate) fn into_job(self, now: DateTime<Utc>) -> Job {
        Job {
            id: self.id.unwrap_or_default(),
            job_type: self.job_type,
            idempotency_key: self.idempotency_key,
            priority: self.priority,
            payload: self.payload,
            metadata: self.metadata,
            timeout: self.timeout,
            max_retries: self.max_retries,
            created_at: now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_delay_stays_within_bounds() {
        let policy = RetryPolicy::default();
        for attempt in 1..=1000 {
            let delay = policy.delay_for_attempt(attempt);
            assert!(
                delay >= policy.base && delay <= policy.cap,
                "attempt {attempt}: delay {delay:?} outside [{:?}, {:?}]",
                policy.base,
                policy.cap,
            );
        }
    }

    #[test]
    fn backoff_grows_toward_cap() {
        let policy = RetryPolicy {
            base: Duration::from_millis(100),
            cap: Duration::from_secs(10),
            jitter: 0.0,
        };
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(400));
        assert_eq!(policy.delay_for_attempt(20), Duration::from_secs(10));
    }

    #[test]
    fn phase_happy_path_is_linear() {
        let mut phase = Phase::Ingestion;
        let mut walked = vec![phase];
        while let Some(next) = phase.next() {
            assert!(phase.can_advance_to(next));
            phase = next;
            walked.push(phase);
        }
        assert_eq!(
            walked,
            vec![
                Phase::Ingestion,
                Phase::Verification,
                Phase::Execution,
                Phase::Output
            ]
        );
    }

    #[test]
    fn every_work_phase_can_fail() {
        for phase in WORK_PHASES {
            assert!(phase.can_advance_to(Phase::Failed));
        }
        assert!(!Phase::Completed.can_advance_to(Phase::Failed));
    }

    #[test]
    fn only_early_phases_fail_fast() {
        assert!(Phase::Ingestion.fail_fast());
        assert!(Phase::Verification.fail_fast());
        assert!(!Phase::Execution.fail_fast());
        assert!(!Phase::Output.fail_fast());
    }
}
