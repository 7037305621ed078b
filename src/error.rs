//! Error types for porter.

use thiserror::Error;

use crate::model::{JobId, Phase};

#[derive(Debug, Error)]
pub enum Error {
    /// Malformed submission. Surfaced immediately to the caller, never retried.
    #[error("invalid submission: {0}")]
    Validation(String),

    #[error("job not found: {0}")]
    NotFound(String),

    #[error("invalid phase transition: {from} -> {to}")]
    InvalidTransition { from: Phase, to: Phase },

    /// The caller's claim was fenced out by a newer delivery attempt.
    #[error("claim lost for job {job_id}: held attempt {held}, current attempt {current}")]
    LostClaim { job_id: JobId, held: u32, current: u32 },

    #[error("queue entry not found: {0}")]
    EntryNotFound(u64),

    #[error("config error: {0}")]
    Config(String),

    #[error("callback delivery failed: {0}")]
    Delivery(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;
