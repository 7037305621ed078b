//! Job execution span helpers.

use tracing::Span;
use uuid::Uuid;

use crate::model::Phase;

/// Start a span wrapping one claimed delivery of a job.
pub fn start_job_span(job_type: &str, job_id: &Uuid) -> Span {
    tracing::info_span!(
        "job.execute",
        "job.type" = job_type,
        "job.id" = %job_id,
        "job.phase" = tracing::field::Empty,
    )
}

/// Record a phase transition as an event scoped to the given span.
pub fn record_phase_transition(span: &Span, from: Phase, to: Phase) {
    span.record("job.phase", tracing::field::display(to));
    span.in_scope(|| {
        tracing::info!(from = %from, to = %to, "phase_transition");
    });
}
