//! Worker pool for processing jobs.
//!
//! A fixed-width set of cooperative worker tasks polls the queue, takes the
//! per-job lock, runs the handler under its timeout, and reports the outcome
//! back to the queue. Two companion tasks drain the scheduled set and
//! reconcile stranded locks.

use crate::config::WorkerConfig;
use crate::error::{panic_message, JobError, JobResult};
use crate::job::{JobRecord, JobStatus};
use crate::lock::{JobLock, JobLockManager};
use crate::metrics::{names, WorkerMetrics};
use crate::redis::RedisJobQueue;
use crate::registry::HandlerRegistry;
use metrics::gauge;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout};
use tracing::{debug, error, info, warn, Instrument};
use uuid::Uuid;

/// Worker pool configuration.
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    /// Number of concurrent workers.
    pub concurrency: usize,

    /// Polling interval.
    pub poll_interval: Duration,

    /// Shutdown timeout.
    pub shutdown_timeout: Duration,

    /// Enable per-job distributed locking.
    pub enable_locking: bool,

    /// Enable the idempotency precheck.
    pub enable_idempotency: bool,

    /// Stale-lock cleanup interval.
    pub stale_cleanup_interval: Duration,

    /// Age after which a running-job entry is considered stranded.
    pub stale_threshold: Duration,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            concurrency: 8,
            poll_interval: Duration::from_millis(100),
            shutdown_timeout: Duration::from_secs(30),
            enable_locking: true,
            enable_idempotency: true,
            stale_cleanup_interval: Duration::from_secs(60),
            stale_threshold: Duration::from_secs(600),
        }
    }
}

impl From<&WorkerConfig> for WorkerPoolConfig {
    fn from(config: &WorkerConfig) -> Self {
        Self {
            concurrency: config.concurrency.max(1),
            poll_interval: config.poll_interval(),
            shutdown_timeout: config.shutdown_timeout(),
            enable_locking: config.enable_locking,
            enable_idempotency: config.enable_idempotency,
            stale_cleanup_interval: config.stale_cleanup_interval(),
            stale_threshold: config.stale_threshold(),
        }
    }
}

/// Generates a fresh worker id.
pub fn worker_id() -> String {
    format!("worker-{}", Uuid::new_v4())
}

struct WorkerShared {
    worker_id: String,
    queue: Arc<RedisJobQueue>,
    locks: Arc<JobLockManager>,
    registry: Arc<HandlerRegistry>,
    config: WorkerPoolConfig,
    shutting_down: AtomicBool,
    active_workers: AtomicU64,
    processed: AtomicU64,
    failed: AtomicU64,
    skipped: AtomicU64,
}

/// Worker pool statistics.
#[derive(Debug, Clone)]
pub struct WorkerPoolStats {
    /// Worker id shared by all tasks in this pool.
    pub worker_id: String,
    /// Is the pool running.
    pub running: bool,
    /// Configured concurrency.
    pub concurrency: usize,
    /// Worker tasks currently alive.
    pub active_workers: u64,
    /// Jobs completed by this pool.
    pub processed: u64,
    /// Jobs failed by this pool.
    pub failed: u64,
    /// Jobs skipped (idempotent replay or lost lock race).
    pub skipped: u64,
}

/// Fixed-width worker pool.
///
/// The pool's worker id is the lock manager's: every lock taken by any task
/// in the pool carries the same owner.
pub struct WorkerPool {
    shared: Arc<WorkerShared>,
    shutdown_tx: broadcast::Sender<()>,
    running: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    /// Create a new worker pool.
    pub fn new(
        queue: Arc<RedisJobQueue>,
        locks: Arc<JobLockManager>,
        registry: Arc<HandlerRegistry>,
        config: WorkerPoolConfig,
    ) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);

        Self {
            shared: Arc::new(WorkerShared {
                worker_id: locks.worker_id().to_string(),
                queue,
                locks,
                registry,
                config,
                shutting_down: AtomicBool::new(false),
                active_workers: AtomicU64::new(0),
                processed: AtomicU64::new(0),
                failed: AtomicU64::new(0),
                skipped: AtomicU64::new(0),
            }),
            shutdown_tx,
            running: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// The pool's worker id.
    pub fn worker_id(&self) -> &str {
        &self.shared.worker_id
    }

    /// Check if the pool is running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Start the pool: `concurrency` worker tasks, the scheduled processor,
    /// and (with locking enabled) the stale cleaner.
    pub fn start(&self) -> JobResult<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(JobError::Worker("Worker pool already running".to_string()));
        }

        self.shared.shutting_down.store(false, Ordering::SeqCst);

        info!(
            worker_id = %self.shared.worker_id,
            concurrency = self.shared.config.concurrency,
            locking = self.shared.config.enable_locking,
            idempotency = self.shared.config.enable_idempotency,
            "Starting worker pool"
        );

        let mut tasks = self.tasks.lock();

        for index in 0..self.shared.config.concurrency {
            let shared = self.shared.clone();
            let mut shutdown_rx = self.shutdown_tx.subscribe();

            tasks.push(tokio::spawn(
                async move {
                    let count = shared.active_workers.fetch_add(1, Ordering::SeqCst) + 1;
                    WorkerMetrics::workers_active(count);

                    let mut ticker = interval(shared.config.poll_interval);
                    loop {
                        tokio::select! {
                            _ = shutdown_rx.recv() => break,
                            _ = ticker.tick() => process_next_job(&shared).await,
                        }
                    }

                    let count = shared.active_workers.fetch_sub(1, Ordering::SeqCst) - 1;
                    WorkerMetrics::workers_active(count);
                }
                .instrument(tracing::info_span!("worker", index)),
            ));
        }

        // Scheduled processor: drains the scheduled set once a second.
        {
            let shared = self.shared.clone();
            let mut shutdown_rx = self.shutdown_tx.subscribe();

            tasks.push(tokio::spawn(async move {
                let mut ticker = interval(Duration::from_secs(1));
                loop {
                    tokio::select! {
                        _ = shutdown_rx.recv() => break,
                        _ = ticker.tick() => {
                            if let Err(e) = shared.queue.process_scheduled().await {
                                if !shared.shutting_down.load(Ordering::SeqCst) {
                                    warn!(error = %e, "Failed to process scheduled jobs");
                                }
                            }
                        }
                    }
                }
            }));
        }

        if self.shared.config.enable_locking {
            let shared = self.shared.clone();
            let mut shutdown_rx = self.shutdown_tx.subscribe();

            tasks.push(tokio::spawn(async move {
                let mut ticker = interval(shared.config.stale_cleanup_interval);
                ticker.tick().await; // skip the immediate first tick
                loop {
                    tokio::select! {
                        _ = shutdown_rx.recv() => break,
                        _ = ticker.tick() => {
                            match shared.locks.cleanup_stale_jobs(shared.config.stale_threshold).await {
                                Ok(cleaned) if !cleaned.is_empty() => {
                                    info!(count = cleaned.len(), "Cleaned up stale jobs");
                                }
                                Ok(_) => {}
                                Err(e) => warn!(error = %e, "Stale job cleanup failed"),
                            }
                        }
                    }
                }
            }));
        }

        Ok(())
    }

    /// Stop the pool.
    ///
    /// Workers stop dequeuing immediately; in-flight handlers get up to
    /// `shutdown_timeout` to finish. Wrap this future in `tokio::time::timeout`
    /// for a caller-imposed tighter bound. All locks held by this worker are
    /// released.
    pub async fn stop(&self) -> JobResult<()> {
        if !self.running.swap(false, Ordering::SeqCst) {
            return Ok(());
        }

        info!(worker_id = %self.shared.worker_id, "Stopping worker pool");
        self.shared.shutting_down.store(true, Ordering::SeqCst);
        let _ = self.shutdown_tx.send(());

        let handles: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        let aborts: Vec<_> = handles.iter().map(|h| h.abort_handle()).collect();

        if timeout(
            self.shared.config.shutdown_timeout,
            futures::future::join_all(handles),
        )
        .await
        .is_err()
        {
            warn!(
                worker_id = %self.shared.worker_id,
                "Shutdown window elapsed, aborting remaining worker tasks"
            );
            for abort in aborts {
                abort.abort();
            }
        }

        if self.shared.config.enable_locking {
            if let Err(e) = self.shared.locks.release_all_locks().await {
                warn!(error = %e, "Failed to release locks on shutdown");
            }
        }

        info!(
            worker_id = %self.shared.worker_id,
            processed = self.shared.processed.load(Ordering::Relaxed),
            failed = self.shared.failed.load(Ordering::Relaxed),
            skipped = self.shared.skipped.load(Ordering::Relaxed),
            "Worker pool stopped"
        );

        Ok(())
    }

    /// Pool statistics snapshot.
    pub fn stats(&self) -> WorkerPoolStats {
        WorkerPoolStats {
            worker_id: self.shared.worker_id.clone(),
            running: self.is_running(),
            concurrency: self.shared.config.concurrency,
            active_workers: self.shared.active_workers.load(Ordering::SeqCst),
            processed: self.shared.processed.load(Ordering::Relaxed),
            failed: self.shared.failed.load(Ordering::Relaxed),
            skipped: self.shared.skipped.load(Ordering::Relaxed),
        }
    }
}

/// One poll: dequeue, precheck, lock, execute, report.
async fn process_next_job(shared: &Arc<WorkerShared>) {
    let job = match shared.queue.dequeue(None).await {
        Ok(job) => job,
        Err(JobError::QueueEmpty) => return,
        Err(e) => {
            if !shared.shutting_down.load(Ordering::SeqCst) {
                warn!(error = %e, "Failed to dequeue job");
            }
            return;
        }
    };
    let job_id = job.id.clone();

    // Idempotency precheck: a unique key already in the ledger means this
    // job's work has run before; complete without invoking the handler.
    if shared.config.enable_idempotency {
        if let Some(unique_key) = &job.unique_key {
            match shared.locks.check_idempotency(unique_key).await {
                Ok(true) => {
                    debug!(job_id = %job_id, unique_key = %unique_key, "Job already completed, skipping");
                    if let Err(e) = shared.queue.complete(&job_id).await {
                        warn!(job_id = %job_id, error = %e, "Failed to complete replayed job");
                    }
                    shared.skipped.fetch_add(1, Ordering::Relaxed);
                    return;
                }
                Ok(false) => {}
                Err(e) => {
                    warn!(job_id = %job_id, error = %e, "Idempotency check failed, continuing");
                }
            }
        }
    }

    let lock = if shared.config.enable_locking {
        match shared.locks.acquire_lock(&job_id).await {
            Ok(lock) => Some(lock),
            Err(JobError::LockNotAcquired(_)) => {
                debug!(job_id = %job_id, "Lock held elsewhere, requeuing");
                if let Err(e) = requeue_job(shared, job).await {
                    warn!(job_id = %job_id, error = %e, "Failed to requeue job");
                }
                shared.skipped.fetch_add(1, Ordering::Relaxed);
                return;
            }
            Err(e) => {
                warn!(job_id = %job_id, error = %e, "Failed to acquire lock");
                shared.skipped.fetch_add(1, Ordering::Relaxed);
                return;
            }
        }
    } else {
        None
    };

    let Some(handler) = shared.registry.get(&job.job_type) else {
        let err = JobError::HandlerMissing(job.job_type.clone());
        warn!(job_id = %job_id, job_type = %job.job_type, "No handler for job type");
        if let Err(e) = shared.queue.fail(&job_id, &err).await {
            error!(job_id = %job_id, error = %e, "Failed to mark job as failed");
        }
        shared.failed.fetch_add(1, Ordering::Relaxed);
        release(shared, lock).await;
        return;
    };

    let ctx = job.to_context(&shared.worker_id);
    let payload = job.payload.clone().into_bytes();

    gauge!(names::JOBS_RUNNING).increment(1.0);
    let started = Instant::now();

    // The handler runs in its own task so a panic surfaces as a JoinError
    // instead of tearing down the worker.
    let mut task = tokio::spawn(handler(ctx, payload));
    let outcome: Result<(), JobError> = match timeout(job.timeout, &mut task).await {
        Ok(Ok(result)) => result,
        Ok(Err(join_err)) => {
            if join_err.is_panic() {
                Err(panic_message(&*join_err.into_panic()))
            } else {
                Err(JobError::Worker("Handler task cancelled".to_string()))
            }
        }
        Err(_elapsed) => {
            task.abort();
            Err(JobError::Timeout(job.timeout.as_secs()))
        }
    };

    let duration = started.elapsed();
    gauge!(names::JOBS_RUNNING).decrement(1.0);

    match outcome {
        Ok(()) => {
            debug!(job_id = %job_id, duration_ms = duration.as_millis() as u64, "Job completed");
            WorkerMetrics::job_duration(&job.job_type, "completed", duration);

            if let Err(e) = shared.queue.complete(&job_id).await {
                error!(job_id = %job_id, error = %e, "Failed to mark job as complete");
            }
            shared.processed.fetch_add(1, Ordering::Relaxed);

            if shared.config.enable_idempotency {
                if let Some(unique_key) = &job.unique_key {
                    if let Err(e) = shared.locks.mark_completed(unique_key, &job_id).await {
                        warn!(job_id = %job_id, error = %e, "Failed to record idempotency");
                    }
                }
            }
        }
        Err(err) => {
            warn!(job_id = %job_id, error = %err, attempt = job.attempts, "Job execution failed");
            WorkerMetrics::job_duration(&job.job_type, "failed", duration);

            if let Err(e) = shared.queue.fail(&job_id, &err).await {
                error!(job_id = %job_id, error = %e, "Failed to mark job as failed");
            }
            shared.failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    release(shared, lock).await;
}

/// Put a job lost to a lock race back at the head of its priority list.
///
/// The blocked attempt is not billed: `attempts` rolls back by one and
/// `started_at` clears.
async fn requeue_job(shared: &Arc<WorkerShared>, mut job: JobRecord) -> JobResult<()> {
    job.status = JobStatus::Pending;
    job.started_at = None;
    job.attempts = job.attempts.saturating_sub(1);

    shared.queue.update_job(&job).await?;
    shared.queue.requeue(&job.id, job.priority.queue_name()).await
}

async fn release(shared: &Arc<WorkerShared>, lock: Option<JobLock>) {
    if let Some(lock) = lock {
        if let Err(e) = shared.locks.release_lock(&lock).await {
            warn!(job_id = %lock.job_id(), error = %e, "Failed to release lock");
        }
    }
}
