//! Engine: wires the queue, log, store, machine, saga, and dispatcher
//! together, and owns the worker pool and reaper lifecycles.

pub mod reaper;
pub mod worker;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::dispatcher::{CallbackSink, Dispatcher};
use crate::event::EventLog;
use crate::executor::ExecutorRegistry;
use crate::machine::PhaseMachine;
use crate::model::{Job, JobFailure, RetryPolicy};
use crate::queue::Queue;
use crate::record::{Fence, JobRecord, JobRecordStore};
use crate::saga::{CompensationLog, Compensator, Undoer};

/// Tuning knobs for the engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Number of concurrent worker loops.
    pub workers: usize,
    /// How long a claim call blocks waiting for work.
    pub claim_block: Duration,
    /// Idle time after which a claimed-but-unacked entry is reclaimable.
    pub idle_threshold: Duration,
    /// Delivery attempts before an entry is dead-lettered.
    pub max_deliveries: u32,
    /// Cadence of the timeout/reclaim/retention sweep.
    pub reaper_interval: Duration,
    /// How long terminal records and events are kept before purging.
    pub retention: Duration,
    /// Backoff for the retryable phases.
    pub retry_policy: RetryPolicy,
    /// Callback delivery attempts before dead-lettering the notification.
    pub callback_retries: u32,
    /// Delay between callback delivery attempts.
    pub callback_backoff: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            claim_block: Duration::from_millis(500),
            idle_threshold: Duration::from_secs(60),
            max_deliveries: 5,
            reaper_interval: Duration::from_secs(1),
            retention: Duration::from_secs(24 * 60 * 60),
            retry_policy: RetryPolicy::default(),
            callback_retries: 3,
            callback_backoff: Duration::from_secs(1),
        }
    }
}

/// The orchestration engine. Cheap to clone; all state is shared.
pub struct Engine {
    pub(crate) config: EngineConfig,
    pub(crate) log: Arc<EventLog>,
    pub(crate) queue: Arc<Queue>,
    pub(crate) store: Arc<JobRecordStore>,
    pub(crate) machine: Arc<PhaseMachine>,
    pub(crate) saga: Arc<CompensationLog>,
    pub(crate) compensator: Arc<Compensator>,
    pub(crate) dispatcher: Arc<Dispatcher>,
    pub(crate) registry: Arc<ExecutorRegistry>,
    shutdown: Arc<Notify>,
    stopping: Arc<AtomicBool>,
}

impl Clone for Engine {
    fn clone(&self) -> Self {
        Self {
            config: self.config.clone(),
            log: Arc::clone(&self.log),
            queue: Arc::clone(&self.queue),
            store: Arc::clone(&self.store),
            machine: Arc::clone(&self.machine),
            saga: Arc::clone(&self.saga),
            compensator: Arc::clone(&self.compensator),
            dispatcher: Arc::clone(&self.dispatcher),
            registry: Arc::clone(&self.registry),
            shutdown: Arc::clone(&self.shutdown),
            stopping: Arc::clone(&self.stopping),
        }
    }
}

impl Engine {
    pub fn new(
        config: EngineConfig,
        registry: ExecutorRegistry,
        undoer: Arc<dyn Undoer>,
        sink: Arc<dyn CallbackSink>,
    ) -> Self {
        let log = Arc::new(EventLog::new());
        let queue = Arc::new(Queue::new(config.max_deliveries, Arc::clone(&log)));
        let store = Arc::new(JobRecordStore::new());
        let saga = Arc::new(CompensationLog::new());
        let machine = Arc::new(PhaseMachine::new(
            Arc::clone(&log),
            Arc::clone(&store),
            Arc::clone(&saga),
            config.retry_policy,
        ));
        let compensator = Arc::new(Compensator::new(
            Arc::clone(&saga),
            undoer,
            Arc::clone(&log),
        ));
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&store),
            Arc::clone(&queue),
            Arc::clone(&machine),
            sink,
            config.callback_retries,
            config.callback_backoff,
        ));

        Self {
            config,
            log,
            queue,
            store,
            machine,
            saga,
            compensator,
            dispatcher,
            registry: Arc::new(registry),
            shutdown: Arc::new(Notify::new()),
            stopping: Arc::new(AtomicBool::new(false)),
        }
    }

    /// The process-facing API.
    pub fn dispatcher(&self) -> Arc<Dispatcher> {
        Arc::clone(&self.dispatcher)
    }

    pub fn events(&self) -> Arc<EventLog> {
        Arc::clone(&self.log)
    }

    pub fn queue(&self) -> Arc<Queue> {
        Arc::clone(&self.queue)
    }

    pub fn store(&self) -> Arc<JobRecordStore> {
        Arc::clone(&self.store)
    }

    /// Spawn the worker pool and the reaper.
    pub fn start(&self) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::with_capacity(self.config.workers + 1);
        for i in 0..self.config.workers {
            let engine = self.clone();
            let worker_id = format!("worker-{i}");
            handles.push(tokio::spawn(async move {
                worker::run(engine, worker_id).await;
            }));
        }
        let engine = self.clone();
        handles.push(tokio::spawn(async move {
            reaper::run(engine).await;
        }));
        info!(workers = self.config.workers, "engine started");
        handles
    }

    /// Signal all loops to stop after their current iteration.
    pub fn shutdown(&self) {
        self.stopping.store(true, Ordering::SeqCst);
        self.shutdown.notify_waiters();
    }

    pub(crate) fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::SeqCst)
    }

    pub(crate) async fn shutdown_notified(&self) {
        self.shutdown.notified().await;
    }

    /// Retire a job that reached `Completed`: ack its entry and fire the
    /// terminal callback.
    pub(crate) async fn retire_completed(&self, job: &Job, record: &JobRecord, entry_id: u64) {
        if let Err(e) = self.queue.ack(entry_id).await {
            warn!(job_id = %job.id, entry_id, "ack after completion failed: {e}");
        }
        self.dispatcher.notify_terminal(job, record).await;
        info!(job_id = %job.id, "job completed");
    }

    /// Drive a job into `Failed`: transition, compensate completed phases
    /// in reverse order, then report to the dispatcher. Safe to call from
    /// racing writers: the first terminal transition wins and the
    /// compensator and callback both run at most once.
    pub(crate) async fn retire_failed(
        &self,
        job: &Job,
        failure: JobFailure,
        fence: Option<&Fence>,
        entry_id: Option<u64>,
    ) {
        let record = match self.machine.fail_job(job.id, failure, fence).await {
            Ok(record) => record,
            Err(e) => {
                // A newer claim owns the job; its worker will retire it.
                warn!(job_id = %job.id, "failure transition rejected: {e}");
                return;
            }
        };

        self.compensator.compensate(job).await;
        self.dispatcher.notify_terminal(job, &record).await;

        if let Some(entry_id) = entry_id {
            if let Err(e) = self.queue.ack(entry_id).await {
                warn!(job_id = %job.id, entry_id, "ack after failure failed: {e}");
            }
        }
        info!(
            job_id = %job.id,
            phase = %record.last_error.as_ref().map(|f| f.phase.to_string()).unwrap_or_default(),
            "job failed"
        );
    }
}
