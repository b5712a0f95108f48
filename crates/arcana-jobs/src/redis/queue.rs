//! Redis job queue implementation.
//!
//! State layout (all under the configured prefix):
//! one list per priority (head-pushed, tail-popped job ids), a sorted set of
//! scheduled job ids keyed by due time, a dead-letter list, per-key dedup
//! strings, the JSON job records themselves, and a counters hash.

use super::RedisKeys;
use crate::error::{JobError, JobResult};
use crate::job::{JobId, JobRecord, JobStatus, Priority};
use crate::metrics::names;
use chrono::{Duration as ChronoDuration, Utc};
use deadpool_redis::Pool;
use metrics::{counter, gauge};
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Rolling TTL for job records and dedup keys (24 hours).
pub(crate) const JOB_TTL_SECS: u64 = 86_400;

/// Soft limit on dead-letter entries drained per purge call.
const DLQ_PURGE_BATCH: isize = 10_000;

/// Queue statistics snapshot.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueueStats {
    /// Total jobs enqueued.
    pub enqueued_total: u64,
    /// Total jobs completed.
    pub completed_total: u64,
    /// Total failed executions.
    pub failed_total: u64,
    /// Total retries scheduled.
    pub retries_total: u64,
    /// Total jobs dead-lettered.
    pub dead_total: u64,
    /// Pending counter (priority lists + scheduled set, up to counter lag).
    pub pending: i64,
    /// Live sum of priority list lengths.
    pub queued: u64,
    /// Live scheduled set size.
    pub scheduled: u64,
    /// Live running-jobs registry size.
    pub running: u64,
    /// Live dead letter queue length.
    pub dlq: u64,
}

/// Redis-backed job queue.
pub struct RedisJobQueue {
    pool: Pool,
    keys: RedisKeys,
}

impl RedisJobQueue {
    /// Create a new Redis job queue.
    pub fn new(pool: Pool, keys: RedisKeys) -> Self {
        Self { pool, keys }
    }

    /// The key builder for this queue.
    pub fn keys(&self) -> &RedisKeys {
        &self.keys
    }

    /// Get a connection from the pool.
    async fn conn(&self) -> JobResult<deadpool_redis::Connection> {
        Ok(self.pool.get().await?)
    }

    /// Best-effort counter bump in the stats hash.
    ///
    /// Storage errors here are logged and swallowed; counters may lag.
    async fn bump_stat(&self, conn: &mut deadpool_redis::Connection, field: &str, delta: i64) {
        let result: Result<i64, _> = conn.hincr(self.keys.stats(), field, delta).await;
        if let Err(e) = result {
            warn!(field = field, error = %e, "Failed to bump stats counter");
        }
    }

    /// Persist a record under its job key with the rolling TTL.
    async fn persist(
        &self,
        conn: &mut deadpool_redis::Connection,
        job: &JobRecord,
    ) -> JobResult<()> {
        let json = job.to_json()?;
        let _: () = conn
            .set_ex(self.keys.job(job.id.as_str()), json, JOB_TTL_SECS)
            .await?;
        Ok(())
    }

    /// Load a record, or `NotFound`.
    async fn load(
        &self,
        conn: &mut deadpool_redis::Connection,
        job_id: &JobId,
    ) -> JobResult<JobRecord> {
        let json: Option<String> = conn.get(self.keys.job(job_id.as_str())).await?;
        match json {
            Some(json) => JobRecord::from_json(&json),
            None => Err(JobError::NotFound(job_id.to_string())),
        }
    }

    /// Enqueue a job.
    ///
    /// Fails with `Duplicate` when the job carries a unique key that is
    /// already in flight. Jobs scheduled in the future land in the scheduled
    /// set; everything else goes to the head of its priority list.
    pub async fn enqueue(&self, job: &JobRecord) -> JobResult<()> {
        let mut conn = self.conn().await?;

        if let Some(unique_key) = &job.unique_key {
            let exists: bool = conn.exists(self.keys.unique(unique_key)).await?;
            if exists {
                return Err(JobError::Duplicate(unique_key.clone()));
            }
        }

        self.persist(&mut conn, job).await?;

        let now = Utc::now();
        match job.scheduled_at.filter(|at| *at > now) {
            Some(at) => {
                let _: () = conn
                    .zadd(self.keys.scheduled(), job.id.as_str(), at.timestamp())
                    .await?;
                debug!(job_id = %job.id, job_type = %job.job_type, scheduled_at = %at, "Enqueued scheduled job");
            }
            None => {
                let _: () = conn
                    .lpush(self.keys.queue(job.priority.queue_name()), job.id.as_str())
                    .await?;
                debug!(job_id = %job.id, job_type = %job.job_type, priority = %job.priority, "Enqueued job");
            }
        }

        if let Some(unique_key) = &job.unique_key {
            // Dedup key outlives the record by however long the job waits in
            // the scheduled set.
            let wait = job
                .scheduled_at
                .map(|at| (at - now).num_seconds().max(0) as u64)
                .unwrap_or(0);
            let _: () = conn
                .set_ex(
                    self.keys.unique(unique_key),
                    job.id.as_str(),
                    JOB_TTL_SECS + wait,
                )
                .await?;
        }

        self.bump_stat(&mut conn, "enqueued_total", 1).await;
        self.bump_stat(&mut conn, "pending", 1).await;
        counter!(names::JOBS_ENQUEUED_TOTAL).increment(1);
        gauge!(names::JOBS_PENDING).increment(1.0);

        Ok(())
    }

    /// Dequeue the next ready job, scanning priorities strictly in order.
    ///
    /// The returned record is already transitioned to `Running` with
    /// `attempts` incremented. Returns `QueueEmpty` when every list is empty.
    pub async fn dequeue(&self, preferred: Option<&[Priority]>) -> JobResult<JobRecord> {
        let mut conn = self.conn().await?;
        let order = preferred.unwrap_or(&Priority::DESCENDING);

        for priority in order {
            let id: Option<String> = conn
                .rpop(self.keys.queue(priority.queue_name()), None)
                .await?;
            let Some(id) = id else { continue };

            let json: Option<String> = conn.get(self.keys.job(&id)).await?;
            let Some(json) = json else {
                // Record deleted while queued; skip to the next priority.
                debug!(job_id = %id, "Dequeued id without record, skipping");
                continue;
            };

            let mut job = JobRecord::from_json(&json)?;
            if matches!(job.status, JobStatus::Completed | JobStatus::Dead) {
                // Stale list entry from a lock-race requeue; the record
                // reached a terminal state in the meantime.
                debug!(job_id = %id, status = %job.status, "Dropping terminal job from queue");
                self.bump_stat(&mut conn, "pending", -1).await;
                gauge!(names::JOBS_PENDING).decrement(1.0);
                continue;
            }
            job.status = JobStatus::Running;
            job.started_at = Some(Utc::now());
            job.attempts += 1;
            self.persist(&mut conn, &job).await?;

            self.bump_stat(&mut conn, "pending", -1).await;
            gauge!(names::JOBS_PENDING).decrement(1.0);

            debug!(job_id = %job.id, job_type = %job.job_type, attempt = job.attempts, "Dequeued job");
            return Ok(job);
        }

        Err(JobError::QueueEmpty)
    }

    /// Get a job record by ID.
    pub async fn get_job(&self, job_id: &JobId) -> JobResult<JobRecord> {
        let mut conn = self.conn().await?;
        self.load(&mut conn, job_id).await
    }

    /// Overwrite a job record, resetting its rolling TTL.
    pub async fn update_job(&self, job: &JobRecord) -> JobResult<()> {
        let mut conn = self.conn().await?;
        self.persist(&mut conn, job).await
    }

    /// Mark a job completed.
    pub async fn complete(&self, job_id: &JobId) -> JobResult<()> {
        let mut conn = self.conn().await?;

        let mut job = self.load(&mut conn, job_id).await?;
        job.status = JobStatus::Completed;
        job.completed_at = Some(Utc::now());
        self.persist(&mut conn, &job).await?;

        if let Some(unique_key) = &job.unique_key {
            let _: () = conn.del(self.keys.unique(unique_key)).await?;
        }

        self.bump_stat(&mut conn, "completed_total", 1).await;
        counter!(names::JOBS_COMPLETED_TOTAL).increment(1);

        debug!(job_id = %job_id, "Completed job");
        Ok(())
    }

    /// Mark an execution failed: schedule a retry while the budget lasts,
    /// otherwise move the job to the dead letter queue.
    pub async fn fail(&self, job_id: &JobId, error: &JobError) -> JobResult<()> {
        let mut conn = self.conn().await?;

        let mut job = self.load(&mut conn, job_id).await?;
        job.last_error = Some(error.to_string());

        if job.attempts <= job.max_retries {
            let delay = if job.retry_policy.jitter_enabled {
                job.retry_policy.delay_with_jitter(job.attempts)
            } else {
                job.retry_policy.delay_for_attempt(job.attempts)
            };
            let retry_at = Utc::now() + ChronoDuration::from_std(delay).unwrap_or_default();

            job.status = JobStatus::Retrying;
            job.scheduled_at = Some(retry_at);
            self.persist(&mut conn, &job).await?;

            let _: () = conn
                .zadd(self.keys.scheduled(), job.id.as_str(), retry_at.timestamp())
                .await?;

            self.bump_stat(&mut conn, "retries_total", 1).await;
            self.bump_stat(&mut conn, "pending", 1).await;
            counter!(names::JOBS_RETRIED_TOTAL).increment(1);
            gauge!(names::JOBS_PENDING).increment(1.0);

            debug!(
                job_id = %job_id,
                attempt = job.attempts,
                retry_at = %retry_at,
                error = %error,
                "Scheduled job retry"
            );
        } else {
            job.status = JobStatus::Dead;
            job.scheduled_at = None;
            self.persist(&mut conn, &job).await?;

            let _: () = conn.lpush(self.keys.dlq(), job.id.as_str()).await?;

            if let Some(unique_key) = &job.unique_key {
                let _: () = conn.del(self.keys.unique(unique_key)).await?;
            }

            self.bump_stat(&mut conn, "dead_total", 1).await;
            counter!(names::JOBS_DEAD_TOTAL).increment(1);

            warn!(
                job_id = %job_id,
                attempts = job.attempts,
                error = %error,
                "Moved job to dead letter queue"
            );
        }

        self.bump_stat(&mut conn, "failed_total", 1).await;
        counter!(names::JOBS_FAILED_TOTAL).increment(1);

        Ok(())
    }

    /// Move due jobs from the scheduled set onto their priority lists.
    ///
    /// Returns the number of jobs moved.
    pub async fn process_scheduled(&self) -> JobResult<u64> {
        let mut conn = self.conn().await?;
        let now = Utc::now().timestamp();

        let due: Vec<String> = conn.zrangebyscore(self.keys.scheduled(), 0, now).await?;

        let mut moved = 0u64;
        for id in due {
            let _: () = conn.zrem(self.keys.scheduled(), &id).await?;

            let json: Option<String> = conn.get(self.keys.job(&id)).await?;
            let Some(json) = json else {
                debug!(job_id = %id, "Scheduled id without record, dropping");
                continue;
            };

            let mut job = JobRecord::from_json(&json)?;
            job.scheduled_at = None;
            job.status = JobStatus::Pending;
            self.persist(&mut conn, &job).await?;

            let _: () = conn
                .lpush(self.keys.queue(job.priority.queue_name()), &id)
                .await?;

            moved += 1;
            debug!(job_id = %id, priority = %job.priority, "Moved scheduled job to queue");
        }

        if moved > 0 {
            debug!(count = moved, "Processed scheduled jobs");
        }

        Ok(moved)
    }

    /// Pull a retrying or delayed job out of the scheduled set and make it
    /// dispatchable now.
    pub async fn promote_scheduled(&self, job_id: &JobId) -> JobResult<()> {
        let mut conn = self.conn().await?;

        let removed: u64 = conn.zrem(self.keys.scheduled(), job_id.as_str()).await?;
        if removed == 0 {
            return Err(JobError::InvalidState {
                expected: "scheduled".to_string(),
                actual: "not in scheduled set".to_string(),
            });
        }

        let mut job = self.load(&mut conn, job_id).await?;
        job.scheduled_at = None;
        job.status = JobStatus::Pending;
        self.persist(&mut conn, &job).await?;

        let _: () = conn
            .lpush(self.keys.queue(job.priority.queue_name()), job_id.as_str())
            .await?;

        debug!(job_id = %job_id, "Promoted scheduled job");
        Ok(())
    }

    /// Push a job id back onto the head of the given queue list.
    ///
    /// Used when a worker loses the lock race after dequeuing; pairs with a
    /// record reset done by the caller.
    pub async fn requeue(&self, job_id: &JobId, queue_name: &str) -> JobResult<()> {
        let mut conn = self.conn().await?;
        let _: () = conn
            .lpush(self.keys.queue(queue_name), job_id.as_str())
            .await?;

        self.bump_stat(&mut conn, "pending", 1).await;
        gauge!(names::JOBS_PENDING).increment(1.0);

        debug!(job_id = %job_id, queue = queue_name, "Requeued job");
        Ok(())
    }

    /// List jobs currently in the dead letter queue, newest first.
    pub async fn dlq_jobs(&self, limit: usize) -> JobResult<Vec<JobRecord>> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        let mut conn = self.conn().await?;
        let ids: Vec<String> = conn.lrange(self.keys.dlq(), 0, limit as isize - 1).await?;

        let mut jobs = Vec::with_capacity(ids.len());
        for id in ids {
            let json: Option<String> = conn.get(self.keys.job(&id)).await?;
            if let Some(json) = json {
                jobs.push(JobRecord::from_json(&json)?);
            }
        }

        Ok(jobs)
    }

    /// Retry a dead-lettered job by minting a fresh record with a new id.
    ///
    /// The old id is removed from the DLQ and its record deleted; the fresh
    /// `Pending` record starts with a clean retry budget.
    pub async fn retry_dlq(&self, job_id: &JobId) -> JobResult<JobId> {
        let mut conn = self.conn().await?;

        let old = self.load(&mut conn, job_id).await?;

        let _: () = conn.lrem(self.keys.dlq(), 0, job_id.as_str()).await?;

        let mut fresh = old.clone();
        fresh.id = JobId::new();
        fresh.status = JobStatus::Pending;
        fresh.attempts = 0;
        fresh.last_error = None;
        fresh.scheduled_at = None;
        fresh.started_at = None;
        fresh.completed_at = None;
        self.persist(&mut conn, &fresh).await?;

        let _: () = conn
            .lpush(self.keys.queue(fresh.priority.queue_name()), fresh.id.as_str())
            .await?;
        let _: () = conn.del(self.keys.job(job_id.as_str())).await?;

        self.bump_stat(&mut conn, "pending", 1).await;
        gauge!(names::JOBS_PENDING).increment(1.0);

        info!(old_id = %job_id, new_id = %fresh.id, "Retried job from DLQ");
        Ok(fresh.id)
    }

    /// Delete a job everywhere: record, priority list, scheduled set, DLQ,
    /// running registry, and dedup key.
    pub async fn delete_job(&self, job_id: &JobId) -> JobResult<()> {
        let mut conn = self.conn().await?;

        let json: Option<String> = conn.get(self.keys.job(job_id.as_str())).await?;
        let Some(json) = json else {
            return Err(JobError::NotFound(job_id.to_string()));
        };
        let job = JobRecord::from_json(&json)?;

        let _: () = redis::pipe()
            .del(self.keys.job(job_id.as_str()))
            .lrem(self.keys.queue(job.priority.queue_name()), 0, job_id.as_str())
            .zrem(self.keys.scheduled(), job_id.as_str())
            .lrem(self.keys.dlq(), 0, job_id.as_str())
            .hdel(self.keys.running(), job_id.as_str())
            .query_async(&mut *conn)
            .await?;

        if let Some(unique_key) = &job.unique_key {
            let _: () = conn.del(self.keys.unique(unique_key)).await?;
        }

        debug!(job_id = %job_id, "Deleted job");
        Ok(())
    }

    /// Drain the dead letter queue.
    ///
    /// Reads at most 10,000 entries per call (soft limit); callers loop when
    /// they need to purge more. Returns the number of entries removed.
    pub async fn purge_dlq(&self) -> JobResult<u64> {
        let mut conn = self.conn().await?;

        let ids: Vec<String> = conn.lrange(self.keys.dlq(), 0, DLQ_PURGE_BATCH - 1).await?;
        if ids.is_empty() {
            return Ok(0);
        }

        for id in &ids {
            let _: () = conn.del(self.keys.job(id)).await?;
        }
        let _: () = conn
            .ltrim(self.keys.dlq(), ids.len() as isize, -1)
            .await?;

        info!(count = ids.len(), "Purged dead letter queue");
        Ok(ids.len() as u64)
    }

    /// Snapshot the stats hash plus live structure sizes.
    pub async fn stats(&self) -> JobResult<QueueStats> {
        let mut conn = self.conn().await?;

        let counters: std::collections::HashMap<String, i64> =
            conn.hgetall(self.keys.stats()).await?;
        let field = |name: &str| counters.get(name).copied().unwrap_or(0);

        let mut queued = 0u64;
        for priority in &Priority::DESCENDING {
            let len: u64 = conn.llen(self.keys.queue(priority.queue_name())).await?;
            queued += len;
        }

        let scheduled: u64 = conn.zcard(self.keys.scheduled()).await?;
        let running: u64 = conn.hlen(self.keys.running()).await?;
        let dlq: u64 = conn.llen(self.keys.dlq()).await?;

        Ok(QueueStats {
            enqueued_total: field("enqueued_total").max(0) as u64,
            completed_total: field("completed_total").max(0) as u64,
            failed_total: field("failed_total").max(0) as u64,
            retries_total: field("retries_total").max(0) as u64,
            dead_total: field("dead_total").max(0) as u64,
            pending: field("pending"),
            queued,
            scheduled,
            running,
            dlq,
        })
    }

    /// Health check against the backing store.
    pub async fn health_check(&self) -> JobResult<()> {
        let mut conn = self.conn().await?;
        let _: String = redis::cmd("PING").query_async(&mut *conn).await?;
        Ok(())
    }
}
