//! Background reaper: job timeouts, claim reclaim, retention.
//!
//! Runs on a fixed cadence. A job whose elapsed time exceeds its budget
//! is failed with a timeout (compensating and notifying as usual); idle
//! claims are swept back to claimable; terminal records past the
//! retention window are purged from the store, log, and saga.

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::model::{FailureKind, JobFailure};

use super::Engine;

pub(crate) async fn run(engine: Engine) {
    info!("reaper started");
    loop {
        tokio::select! {
            _ = engine.shutdown_notified() => break,
            _ = tokio::time::sleep(engine.config.reaper_interval) => {}
        }
        if engine.is_stopping() {
            break;
        }
        sweep(&engine).await;
    }
    info!("reaper stopped");
}

async fn sweep(engine: &Engine) {
    let now = Utc::now();

    // Abandoned jobs: elapsed time past the job budget.
    for record in engine.store.list().await {
        if record.is_terminal() {
            continue;
        }
        let Ok(job) = engine.store.job(record.job_id).await else {
            continue;
        };
        let elapsed = now
            .signed_duration_since(job.created_at)
            .to_std()
            .unwrap_or_default();
        if elapsed >= job.timeout {
            warn!(
                job_id = %job.id,
                phase = %record.phase,
                elapsed_ms = elapsed.as_millis() as u64,
                "job exceeded its budget, reaping"
            );
            let failure = JobFailure {
                phase: record.phase,
                kind: FailureKind::Timeout,
                detail: format!("job exceeded its {:?} budget", job.timeout),
                retry_count: record.retry_count,
            };
            engine.retire_failed(&job, failure, None, None).await;
        }
    }

    // Dangling claims back to claimable; ceiling breaches to dead-letter.
    let (released, parked) = engine.queue.reclaim(engine.config.idle_threshold).await;
    for delivery in &released {
        debug!(
            entry_id = delivery.entry_id,
            job_id = %delivery.job_id,
            delivery_attempt = delivery.delivery_attempt,
            "idle claim reclaimed"
        );
    }
    for dead in parked {
        // The entry is parked; without it the job can never progress, so
        // the failure is surfaced rather than left to the timeout.
        let Ok(job) = engine.store.job(dead.job_id).await else {
            continue;
        };
        let Ok(record) = engine.store.get(dead.job_id).await else {
            continue;
        };
        if record.is_terminal() {
            continue;
        }
        let failure = JobFailure {
            phase: record.phase,
            kind: FailureKind::Fatal,
            detail: format!(
                "queue entry dead-lettered after {} delivery attempts",
                dead.delivery_attempt
            ),
            retry_count: record.retry_count,
        };
        engine.retire_failed(&job, failure, None, None).await;
    }

    // Retention: terminal records past the window expire everywhere.
    let purged = engine
        .store
        .purge_terminal(engine.config.retention, now)
        .await;
    if !purged.is_empty() {
        for job_id in &purged {
            engine.log.purge(*job_id).await;
            engine.saga.purge(*job_id).await;
        }
        engine.dispatcher.forget(&purged).await;
        debug!(count = purged.len(), "expired terminal records purged");
    }
}
