//! Worker loop: claim an entry, drive its job through the phases, ack.
//!
//! Per-job phase transitions are strictly sequential: one worker drives
//! one job at a time under a claim fence. A worker that loses its claim
//! to a reclaim abandons the job without side effects; the new claim
//! holder picks up at the first phase not yet durably completed.

use chrono::Utc;
use tracing::{Instrument, debug, error, info};

use crate::error::{Error, Result};
use crate::executor::{PhaseExecutor, PhaseOutcome};
use crate::model::{FailureKind, Job, JobFailure, Phase, WORK_PHASES};
use crate::queue::Delivery;
use crate::record::Fence;
use crate::telemetry::job::{record_phase_transition, start_job_span};

use super::Engine;

pub(crate) async fn run(engine: Engine, worker_id: String) {
    info!(%worker_id, "worker started");
    loop {
        if engine.is_stopping() {
            break;
        }
        let deliveries = tokio::select! {
            _ = engine.shutdown_notified() => break,
            deliveries = engine.queue.claim(&worker_id, 1, engine.config.claim_block) => deliveries,
        };
        for delivery in deliveries {
            match process(&engine, &worker_id, delivery).await {
                Ok(()) => {}
                Err(Error::LostClaim { job_id, held, current }) => {
                    debug!(%job_id, held, current, "claim lost mid-flight, abandoning");
                }
                Err(Error::InvalidTransition { .. }) => {
                    // The job resolved under another writer (reaper
                    // timeout, racing claim); the entry will drain on its
                    // next delivery.
                    debug!(job_id = %delivery.job_id, "job resolved elsewhere, abandoning");
                }
                Err(e) => {
                    error!(%worker_id, job_id = %delivery.job_id, "worker error: {e}");
                }
            }
        }
    }
    info!(%worker_id, "worker stopped");
}

async fn process(engine: &Engine, worker_id: &str, delivery: Delivery) -> Result<()> {
    let job = match engine.store.job(delivery.job_id).await {
        Ok(job) => job,
        Err(Error::NotFound(_)) => {
            // Entry outlived its job (retention purge). Drop it.
            engine.queue.ack(delivery.entry_id).await.ok();
            return Ok(());
        }
        Err(e) => return Err(e),
    };

    let fence = Fence {
        job_id: delivery.job_id,
        delivery_attempt: delivery.delivery_attempt,
    };
    engine
        .store
        .fence_claim(delivery.job_id, delivery.delivery_attempt)
        .await?;

    let record = engine.store.get(delivery.job_id).await?;
    if record.is_terminal() {
        // Redelivered after a crash between the terminal transition and
        // the ack. Nothing left to do.
        engine.queue.ack(delivery.entry_id).await.ok();
        return Ok(());
    }

    let span = start_job_span(&job.job_type, &job.id.0);
    drive(engine, worker_id, &job, delivery, fence, record)
        .instrument(span)
        .await
}

async fn drive(
    engine: &Engine,
    worker_id: &str,
    job: &Job,
    delivery: Delivery,
    fence: Fence,
    mut record: crate::record::JobRecord,
) -> Result<()> {
    let Some(executor) = engine.registry.get(&job.job_type) else {
        let failure = JobFailure {
            phase: record.phase,
            kind: FailureKind::Fatal,
            detail: format!("no executor registered for job type {:?}", job.job_type),
            retry_count: record.retry_count,
        };
        engine
            .retire_failed(job, failure, Some(&fence), Some(delivery.entry_id))
            .await;
        return Ok(());
    };

    for phase in WORK_PHASES {
        // Crash-recovery idempotency: never re-run a phase the log
        // already records as completed.
        if record.completed_phases.contains(&phase) {
            continue;
        }

        let from = record.phase;
        record = engine
            .machine
            .start_phase(job.id, phase, worker_id, &fence)
            .await?;
        record_phase_transition(&tracing::Span::current(), from, phase);

        let outcome = match execute_within_budget(job, executor.as_ref(), phase).await {
            Some(outcome) => outcome,
            None => {
                let failure = JobFailure {
                    phase,
                    kind: FailureKind::Timeout,
                    detail: format!("job exceeded its {:?} budget during {phase}", job.timeout),
                    retry_count: record.retry_count,
                };
                engine
                    .retire_failed(job, failure, Some(&fence), Some(delivery.entry_id))
                    .await;
                executor.cleanup(job).await;
                return Ok(());
            }
        };

        match outcome {
            PhaseOutcome::Success { data, undo } => {
                record = engine
                    .machine
                    .complete_phase(job.id, phase, undo, &fence)
                    .await?;
                if phase == Phase::Output {
                    record = engine.machine.complete_job(job.id, data, &fence).await?;
                    engine
                        .retire_completed(job, &record, delivery.entry_id)
                        .await;
                    executor.cleanup(job).await;
                    return Ok(());
                }
            }
            PhaseOutcome::Retry { error } => {
                if phase.fail_fast() {
                    let failure = JobFailure {
                        phase,
                        kind: FailureKind::Transient,
                        detail: error,
                        retry_count: record.retry_count,
                    };
                    engine
                        .retire_failed(job, failure, Some(&fence), Some(delivery.entry_id))
                        .await;
                    executor.cleanup(job).await;
                    return Ok(());
                }
                if record.phase_retries >= job.max_retries {
                    let failure = JobFailure {
                        phase,
                        kind: FailureKind::Transient,
                        detail: format!(
                            "retries exhausted after {} attempts: {error}",
                            record.phase_retries + 1
                        ),
                        retry_count: record.retry_count,
                    };
                    engine
                        .retire_failed(job, failure, Some(&fence), Some(delivery.entry_id))
                        .await;
                    executor.cleanup(job).await;
                    return Ok(());
                }
                let (_, delay) = engine
                    .machine
                    .schedule_retry(job.id, phase, &error, &fence)
                    .await?;
                // The claim is released with the backoff as a delivery
                // delay; the entry stays pending, so a crash during the
                // wait cannot strand the job.
                engine
                    .queue
                    .release(delivery.entry_id, Some(delay))
                    .await
                    .ok();
                return Ok(());
            }
            PhaseOutcome::Fatal { error } => {
                let failure = JobFailure {
                    phase,
                    kind: FailureKind::Fatal,
                    detail: error,
                    retry_count: record.retry_count,
                };
                engine
                    .retire_failed(job, failure, Some(&fence), Some(delivery.entry_id))
                    .await;
                executor.cleanup(job).await;
                return Ok(());
            }
        }
    }

    // All four phases were already completed but the job never resolved;
    // a crash landed between the last completion and the terminal event.
    record = engine
        .machine
        .complete_job(job.id, record.result.clone().unwrap_or_default(), &fence)
        .await?;
    engine
        .retire_completed(job, &record, delivery.entry_id)
        .await;
    executor.cleanup(job).await;
    Ok(())
}

/// Run a phase under the job's remaining wall-clock budget. `None` means
/// the budget is spent.
async fn execute_within_budget(
    job: &Job,
    executor: &dyn PhaseExecutor,
    phase: Phase,
) -> Option<PhaseOutcome> {
    let elapsed = Utc::now()
        .signed_duration_since(job.created_at)
        .to_std()
        .unwrap_or_default();
    let remaining = job.timeout.checked_sub(elapsed)?;
    tokio::time::timeout(remaining, executor.execute(job, phase))
        .await
        .ok()
}
