//! Dispatcher: the process-facing API.
//!
//! Submission (idempotent on the caller's key), status snapshots, and
//! terminal callback delivery. Callback delivery is best-effort with its
//! own bounded retry, independent of phase retries; notifications that
//! exhaust delivery retries are dead-lettered and logged, never silently
//! dropped, and never reopen the job.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use opentelemetry::KeyValue;
use secrecy::{ExposeSecret, SecretString};
use serde::Serialize;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::machine::PhaseMachine;
use crate::model::{Job, JobFailure, JobId, NewJob, Phase};
use crate::queue::Queue;
use crate::record::{JobRecord, JobRecordStore};
use crate::telemetry::metrics;

/// Snapshot returned by `status`.
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub job_id: JobId,
    pub job_type: String,
    pub phase: Phase,
    pub progress: f32,
    pub phases_completed: Vec<Phase>,
    pub retry_count: u32,
    pub metadata: HashMap<String, String>,
    /// Present only once `Completed`.
    pub result: Option<serde_json::Value>,
    /// Present only once `Failed`.
    pub error: Option<JobFailure>,
}

/// Terminal notification pushed to a registered callback target.
#[derive(Debug, Clone, Serialize)]
pub struct Notification {
    pub job_id: JobId,
    pub status: Phase,
    pub phases_completed: Vec<Phase>,
    pub metadata: HashMap<String, String>,
    pub result: Option<serde_json::Value>,
    pub error: Option<JobFailure>,
    pub metrics: RunMetrics,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunMetrics {
    pub duration_ms: u64,
    pub retry_count: u32,
}

/// A notification that exhausted its delivery retries.
#[derive(Debug, Clone)]
pub struct UndeliveredCallback {
    pub target: String,
    pub notification: Notification,
    pub attempts: u32,
}

/// Outbound notification transport. HTTP in production, channels in tests.
#[async_trait]
pub trait CallbackSink: Send + Sync {
    async fn deliver(
        &self,
        target: &str,
        notification: &Notification,
    ) -> std::result::Result<(), String>;
}

/// POSTs the notification as JSON, with an optional bearer token.
pub struct HttpCallbackSink {
    client: reqwest::Client,
    token: Option<SecretString>,
}

impl HttpCallbackSink {
    pub fn new(token: Option<SecretString>) -> Self {
        Self {
            client: reqwest::Client::new(),
            token,
        }
    }
}

#[async_trait]
impl CallbackSink for HttpCallbackSink {
    async fn deliver(
        &self,
        target: &str,
        notification: &Notification,
    ) -> std::result::Result<(), String> {
        let mut request = self.client.post(target).json(notification);
        if let Some(ref token) = self.token {
            request = request.bearer_auth(token.expose_secret());
        }
        let response = request.send().await.map_err(|e| e.to_string())?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(format!("callback endpoint returned {}", response.status()))
        }
    }
}

fn report(job: Job, record: JobRecord) -> StatusReport {
    StatusReport {
        job_id: record.job_id,
        job_type: job.job_type,
        phase: record.phase,
        progress: record.progress(),
        phases_completed: record.completed_phases,
        retry_count: record.retry_count,
        metadata: job.metadata,
        result: record.result,
        error: record.last_error,
    }
}

struct CallbackEntry {
    target: String,
    delivered: bool,
}

pub struct Dispatcher {
    store: Arc<JobRecordStore>,
    queue: Arc<Queue>,
    machine: Arc<PhaseMachine>,
    idempotency: RwLock<HashMap<String, JobId>>,
    callbacks: RwLock<HashMap<JobId, CallbackEntry>>,
    dead_letters: Arc<RwLock<Vec<UndeliveredCallback>>>,
    sink: Arc<dyn CallbackSink>,
    delivery_retries: u32,
    delivery_backoff: Duration,
}

impl Dispatcher {
    pub fn new(
        store: Arc<JobRecordStore>,
        queue: Arc<Queue>,
        machine: Arc<PhaseMachine>,
        sink: Arc<dyn CallbackSink>,
        delivery_retries: u32,
        delivery_backoff: Duration,
    ) -> Self {
        Self {
            store,
            queue,
            machine,
            idempotency: RwLock::new(HashMap::new()),
            callbacks: RwLock::new(HashMap::new()),
            dead_letters: Arc::new(RwLock::new(Vec::new())),
            sink,
            delivery_retries,
            delivery_backoff,
        }
    }

    /// Submit new work. Idempotent on the caller's key: resubmission with
    /// a known key returns the existing job ID without re-enqueueing.
    pub async fn submit(&self, new: NewJob) -> Result<JobId> {
        if new.job_type.trim().is_empty() {
            return Err(Error::Validation("job_type is required".to_string()));
        }
        if new.timeout.is_zero() {
            return Err(Error::Validation("timeout must be positive".to_string()));
        }

        // The key map lock spans the whole submission so two concurrent
        // submits with the same key cannot both enqueue.
        let key = new.idempotency_key.clone();
        let mut idempotency = self.idempotency.write().await;
        if let Some(ref key) = key {
            if let Some(&existing) = idempotency.get(key) {
                info!(job_id = %existing, key = %key, "duplicate submission, returning existing job");
                metrics::jobs_submitted().add(1, &[KeyValue::new("result", "duplicate")]);
                return Ok(existing);
            }
        }

        let job = new.into_job(Utc::now());
        let job_id = job.id;
        let job_type = job.job_type.clone();
        let priority = job.priority;

        self.store.insert_job(job).await?;
        self.machine
            .record_submit(job_id, &job_type, priority)
            .await?;
        self.queue.enqueue(job_id, priority).await;
        if let Some(key) = key {
            idempotency.insert(key, job_id);
        }

        info!(%job_id, job_type = %job_type, priority, "job submitted");
        metrics::jobs_submitted().add(
            1,
            &[
                KeyValue::new("job_type", job_type),
                KeyValue::new("result", "ok"),
            ],
        );
        Ok(job_id)
    }

    /// Current status of a job. `NotFound` for unknown or expired IDs.
    pub async fn status(&self, job_id: JobId) -> Result<StatusReport> {
        let record = self.store.get(job_id).await?;
        let job = self.store.job(job_id).await?;
        Ok(report(job, record))
    }

    /// Status snapshots for every job still inside the retention window.
    pub async fn list(&self) -> Vec<StatusReport> {
        let mut reports = Vec::new();
        for record in self.store.list().await {
            if let Ok(job) = self.store.job(record.job_id).await {
                reports.push(report(job, record));
            }
        }
        reports.sort_by_key(|r| r.job_id.0);
        reports
    }

    /// Register a callback target, invoked exactly once on first arrival
    /// at a terminal phase. Registering against an already-terminal job
    /// delivers immediately.
    pub async fn register_callback(&self, job_id: JobId, target: impl Into<String>) -> Result<()> {
        self.store.get(job_id).await?;
        {
            let mut callbacks = self.callbacks.write().await;
            let delivered = callbacks
                .get(&job_id)
                .map(|entry| entry.delivered)
                .unwrap_or(false);
            callbacks.insert(
                job_id,
                CallbackEntry {
                    target: target.into(),
                    delivered,
                },
            );
        }

        // The job may have resolved before (or while) the target landed;
        // the delivered flag keeps this single-shot against a racing
        // notify_terminal.
        let record = self.store.get(job_id).await?;
        if record.is_terminal() {
            let job = self.store.job(job_id).await?;
            self.notify_terminal(&job, &record).await;
        }
        Ok(())
    }

    /// Fire the registered callback for a job that just reached a terminal
    /// phase. A second call for the same job is a no-op.
    pub async fn notify_terminal(&self, job: &Job, record: &JobRecord) {
        let target = {
            let mut callbacks = self.callbacks.write().await;
            match callbacks.get_mut(&job.id) {
                Some(entry) if !entry.delivered => {
                    entry.delivered = true;
                    Some(entry.target.clone())
                }
                _ => None,
            }
        };

        if let Some(target) = target {
            self.spawn_delivery(target, self.notification(job, record));
        }
    }

    /// Notifications that exhausted delivery retries.
    pub async fn undelivered(&self) -> Vec<UndeliveredCallback> {
        self.dead_letters.read().await.clone()
    }

    /// Drop bookkeeping for purged jobs so idempotency keys expire with
    /// the retention window.
    pub async fn forget(&self, job_ids: &[JobId]) {
        if job_ids.is_empty() {
            return;
        }
        let mut idempotency = self.idempotency.write().await;
        idempotency.retain(|_, id| !job_ids.contains(id));
        drop(idempotency);
        let mut callbacks = self.callbacks.write().await;
        for id in job_ids {
            callbacks.remove(id);
        }
    }

    fn notification(&self, job: &Job, record: &JobRecord) -> Notification {
        Notification {
            job_id: job.id,
            status: record.phase,
            phases_completed: record.completed_phases.clone(),
            metadata: job.metadata.clone(),
            result: record.result.clone(),
            error: record.last_error.clone(),
            metrics: RunMetrics {
                duration_ms: record
                    .resolved_at
                    .map(|t| (t - record.submitted_at).num_milliseconds().max(0) as u64)
                    .unwrap_or(0),
                retry_count: record.retry_count,
            },
        }
    }

    fn spawn_delivery(&self, target: String, notification: Notification) {
        let sink = Arc::clone(&self.sink);
        let dead_letters = Arc::clone(&self.dead_letters);
        let retries = self.delivery_retries.max(1);
        let backoff = self.delivery_backoff;

        tokio::spawn(async move {
            for attempt in 1..=retries {
                match sink.deliver(&target, &notification).await {
                    Ok(()) => {
                        debug!(job_id = %notification.job_id, target = %target, attempt, "callback delivered");
                        metrics::callback_deliveries()
                            .add(1, &[KeyValue::new("result", "ok")]);
                        return;
                    }
                    Err(e) => {
                        warn!(
                            job_id = %notification.job_id,
                            target = %target,
                            attempt,
                            error = %e,
                            "callback delivery failed"
                        );
                        if attempt < retries {
                            tokio::time::sleep(backoff).await;
                        }
                    }
                }
            }
            warn!(
                job_id = %notification.job_id,
                target = %target,
                attempts = retries,
                "callback undelivered, dead-lettering notification"
            );
            metrics::callback_deliveries().add(1, &[KeyValue::new("result", "dead_letter")]);
            dead_letters.write().await.push(UndeliveredCallback {
                target,
                notification,
                attempts: retries,
            });
        });
    }
}
