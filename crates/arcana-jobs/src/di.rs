//! Dependency injection interface for the job system.
//!
//! The facade external collaborators (REST/gRPC layers, operator tooling)
//! program against. Handlers and transports stay outside this crate.

use crate::error::{JobError, JobResult};
use crate::job::{JobId, JobRecord, JobStatus};
use crate::metrics::{health_status, HealthStatus};
use crate::redis::{QueueStats, RedisJobQueue};
use crate::scheduler::CronScheduler;
use crate::worker::WorkerPool;
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use shaku::Interface;
use std::sync::Arc;
use std::time::Duration;

/// Interface for producer and operator access to the job system.
#[async_trait]
pub trait JobServiceInterface: Interface {
    /// Enqueue a job for immediate dispatch.
    async fn enqueue(&self, job: JobRecord) -> JobResult<JobId>;

    /// Enqueue a job due at a specific time.
    async fn enqueue_at(&self, job: JobRecord, at: DateTime<Utc>) -> JobResult<JobId>;

    /// Enqueue a job due after a delay.
    async fn enqueue_in(&self, job: JobRecord, delay: Duration) -> JobResult<JobId>;

    /// Get a job record by id.
    async fn get_job(&self, job_id: &JobId) -> JobResult<JobRecord>;

    /// Cancel a job that is not currently running.
    async fn cancel_job(&self, job_id: &JobId) -> JobResult<()>;

    /// Retry a job: pull a retrying job forward, or resurrect a dead one.
    ///
    /// Returns the id the retried work runs under (a fresh id for
    /// dead-lettered jobs).
    async fn retry_job(&self, job_id: &JobId) -> JobResult<JobId>;

    /// Queue statistics snapshot.
    async fn queue_stats(&self) -> JobResult<QueueStats>;

    /// List dead-lettered jobs, newest first.
    async fn dlq_jobs(&self, limit: usize) -> JobResult<Vec<JobRecord>>;

    /// Retry a dead-lettered job under a fresh id.
    async fn retry_dlq_job(&self, job_id: &JobId) -> JobResult<JobId>;

    /// Drain the dead letter queue (up to 10,000 entries per call).
    async fn purge_dlq(&self) -> JobResult<u64>;

    /// Health snapshot of the job system.
    async fn health(&self) -> JobResult<HealthStatus>;
}

/// Job service implementation over the Redis queue.
pub struct JobService {
    queue: Arc<RedisJobQueue>,
    workers: Option<Arc<WorkerPool>>,
    scheduler: Option<Arc<CronScheduler>>,
}

impl JobService {
    /// Create a service over the queue alone.
    pub fn new(queue: Arc<RedisJobQueue>) -> Self {
        Self {
            queue,
            workers: None,
            scheduler: None,
        }
    }

    /// Attach the local worker pool, enriching health reporting.
    pub fn with_workers(mut self, workers: Arc<WorkerPool>) -> Self {
        self.workers = Some(workers);
        self
    }

    /// Attach the local scheduler, enriching health reporting.
    pub fn with_scheduler(mut self, scheduler: Arc<CronScheduler>) -> Self {
        self.scheduler = Some(scheduler);
        self
    }
}

#[async_trait]
impl JobServiceInterface for JobService {
    async fn enqueue(&self, job: JobRecord) -> JobResult<JobId> {
        let id = job.id.clone();
        self.queue.enqueue(&job).await?;
        Ok(id)
    }

    async fn enqueue_at(&self, mut job: JobRecord, at: DateTime<Utc>) -> JobResult<JobId> {
        job.scheduled_at = Some(at);
        let id = job.id.clone();
        self.queue.enqueue(&job).await?;
        Ok(id)
    }

    async fn enqueue_in(&self, job: JobRecord, delay: Duration) -> JobResult<JobId> {
        let at = Utc::now() + ChronoDuration::from_std(delay).unwrap_or_default();
        self.enqueue_at(job, at).await
    }

    async fn get_job(&self, job_id: &JobId) -> JobResult<JobRecord> {
        self.queue.get_job(job_id).await
    }

    async fn cancel_job(&self, job_id: &JobId) -> JobResult<()> {
        let job = self.queue.get_job(job_id).await?;
        if job.status == JobStatus::Running {
            return Err(JobError::InvalidState {
                expected: "pending".to_string(),
                actual: "running".to_string(),
            });
        }

        self.queue.delete_job(job_id).await
    }

    async fn retry_job(&self, job_id: &JobId) -> JobResult<JobId> {
        let job = self.queue.get_job(job_id).await?;

        match job.status {
            JobStatus::Dead => self.queue.retry_dlq(job_id).await,
            JobStatus::Retrying => {
                self.queue.promote_scheduled(job_id).await?;
                Ok(job_id.clone())
            }
            status => Err(JobError::InvalidState {
                expected: "retrying or dead".to_string(),
                actual: status.to_string(),
            }),
        }
    }

    async fn queue_stats(&self) -> JobResult<QueueStats> {
        self.queue.stats().await
    }

    async fn dlq_jobs(&self, limit: usize) -> JobResult<Vec<JobRecord>> {
        self.queue.dlq_jobs(limit).await
    }

    async fn retry_dlq_job(&self, job_id: &JobId) -> JobResult<JobId> {
        self.queue.retry_dlq(job_id).await
    }

    async fn purge_dlq(&self) -> JobResult<u64> {
        self.queue.purge_dlq().await
    }

    async fn health(&self) -> JobResult<HealthStatus> {
        let stats = self.queue.stats().await?;

        let workers_active = self
            .workers
            .as_ref()
            .map(|pool| pool.stats().active_workers)
            .unwrap_or(0);
        let is_leader = self
            .scheduler
            .as_ref()
            .map(|s| s.is_leader())
            .unwrap_or(false);

        Ok(health_status(workers_active, stats.pending, is_leader))
    }
}
