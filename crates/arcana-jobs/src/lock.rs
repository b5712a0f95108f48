//! Distributed per-job locks with heartbeat, plus the idempotency ledger and
//! the running-jobs registry.
//!
//! Ownership checks run server-side as Lua with plain fixed-string matching
//! (`string.sub`, never Lua patterns): job ids are UUIDs and contain
//! pattern-special characters.

use crate::config::LockConfig;
use crate::error::{JobError, JobResult};
use crate::job::JobId;
use crate::redis::RedisKeys;
use chrono::Utc;
use deadpool_redis::Pool;
use parking_lot::Mutex;
use redis::{AsyncCommands, Script};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Extend the lock TTL only while the value still starts with the owner prefix.
const EXTEND_IF_OWNER: &str = r#"
local value = redis.call("get", KEYS[1])
if value and string.sub(value, 1, string.len(ARGV[1])) == ARGV[1] then
    return redis.call("expire", KEYS[1], ARGV[2])
end
return 0
"#;

/// Delete the lock only while the value still starts with the owner prefix.
const RELEASE_IF_OWNER: &str = r#"
local value = redis.call("get", KEYS[1])
if value and string.sub(value, 1, string.len(ARGV[1])) == ARGV[1] then
    return redis.call("del", KEYS[1])
end
return 0
"#;

/// An acquired per-job lock.
///
/// The heartbeat task lives exactly as long as the lock: releasing the lock
/// stops the task, and a failed heartbeat marks the lock as lost.
pub struct JobLock {
    job_id: JobId,
    held: Arc<AtomicBool>,
    released: AtomicBool,
    stop: watch::Sender<bool>,
    heartbeat: Mutex<Option<JoinHandle<()>>>,
}

impl JobLock {
    /// The locked job id.
    pub fn job_id(&self) -> &JobId {
        &self.job_id
    }

    /// Returns true while the lock is believed held.
    ///
    /// Flips to false when a heartbeat observes another owner or a storage
    /// error; the worker then treats the job as lost to another worker.
    pub fn is_held(&self) -> bool {
        self.held.load(Ordering::SeqCst)
    }
}

/// Manager for per-job locks, the idempotency ledger, and the running-jobs
/// registry, scoped to one worker id.
pub struct JobLockManager {
    pool: Pool,
    keys: RedisKeys,
    worker_id: String,
    lock_ttl: Duration,
    heartbeat_rate: Duration,
    idempotency_ttl: Duration,
}

impl JobLockManager {
    /// Create a lock manager for the given worker.
    pub fn new(pool: Pool, keys: RedisKeys, worker_id: impl Into<String>, config: &LockConfig) -> Self {
        Self {
            pool,
            keys,
            worker_id: worker_id.into(),
            lock_ttl: config.lock_ttl(),
            heartbeat_rate: config.heartbeat_rate(),
            idempotency_ttl: config.idempotency_ttl(),
        }
    }

    /// The worker id this manager locks on behalf of.
    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    async fn conn(&self) -> JobResult<deadpool_redis::Connection> {
        Ok(self.pool.get().await?)
    }

    /// Owner prefix used in every ownership check.
    fn owner_prefix(&self) -> String {
        format!("{}:", self.worker_id)
    }

    /// Try to acquire the exclusive lock for a job.
    ///
    /// On success the lock is registered in the running-jobs hash and the
    /// per-worker set, and a heartbeat task keeps extending the TTL until the
    /// lock is released or lost.
    pub async fn acquire_lock(&self, job_id: &JobId) -> JobResult<JobLock> {
        let mut conn = self.conn().await?;
        let lock_key = self.keys.lock(job_id.as_str());
        let now = Utc::now();
        let value = format!(
            "{}:{}",
            self.worker_id,
            now.timestamp_nanos_opt().unwrap_or_default()
        );

        let acquired: Option<String> = redis::cmd("SET")
            .arg(&lock_key)
            .arg(&value)
            .arg("NX")
            .arg("EX")
            .arg(self.lock_ttl.as_secs())
            .query_async(&mut *conn)
            .await?;

        if acquired.is_none() {
            return Err(JobError::LockNotAcquired(job_id.to_string()));
        }

        let _: () = conn
            .hset(
                self.keys.running(),
                job_id.as_str(),
                format!("{}:{}", self.worker_id, now.timestamp()),
            )
            .await?;
        let _: () = conn
            .sadd(self.keys.worker(&self.worker_id), job_id.as_str())
            .await?;

        let held = Arc::new(AtomicBool::new(true));
        let (stop_tx, stop_rx) = watch::channel(false);
        let heartbeat = self.spawn_heartbeat(lock_key, held.clone(), stop_rx);

        debug!(job_id = %job_id, worker_id = %self.worker_id, "Acquired job lock");

        Ok(JobLock {
            job_id: job_id.clone(),
            held,
            released: AtomicBool::new(false),
            stop: stop_tx,
            heartbeat: Mutex::new(Some(heartbeat)),
        })
    }

    fn spawn_heartbeat(
        &self,
        lock_key: String,
        held: Arc<AtomicBool>,
        mut stop_rx: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let pool = self.pool.clone();
        let owner_prefix = self.owner_prefix();
        let ttl_secs = self.lock_ttl.as_secs();
        let rate = self.heartbeat_rate;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(rate);
            ticker.tick().await; // the first tick fires immediately

            loop {
                tokio::select! {
                    _ = stop_rx.changed() => break,
                    _ = ticker.tick() => {
                        let extended = async {
                            let mut conn = pool.get().await?;
                            let result: i64 = Script::new(EXTEND_IF_OWNER)
                                .key(&lock_key)
                                .arg(&owner_prefix)
                                .arg(ttl_secs)
                                .invoke_async(&mut *conn)
                                .await?;
                            Ok::<bool, JobError>(result == 1)
                        }
                        .await;

                        match extended {
                            Ok(true) => {}
                            Ok(false) => {
                                warn!(lock_key = %lock_key, "Lock no longer owned, stopping heartbeat");
                                held.store(false, Ordering::SeqCst);
                                break;
                            }
                            Err(e) => {
                                // Conservative: assume the lock is lost.
                                warn!(lock_key = %lock_key, error = %e, "Heartbeat failed, assuming lock lost");
                                held.store(false, Ordering::SeqCst);
                                break;
                            }
                        }
                    }
                }
            }
        })
    }

    /// Release a lock.
    ///
    /// Idempotent: the second and later calls are no-ops. Deletion happens
    /// only while this worker still owns the lock value.
    pub async fn release_lock(&self, lock: &JobLock) -> JobResult<()> {
        if lock.released.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let _ = lock.stop.send(true);
        if let Some(handle) = lock.heartbeat.lock().take() {
            handle.abort();
        }

        let mut conn = self.conn().await?;
        let _: i64 = Script::new(RELEASE_IF_OWNER)
            .key(self.keys.lock(lock.job_id.as_str()))
            .arg(self.owner_prefix())
            .invoke_async(&mut *conn)
            .await?;

        let _: () = conn
            .hdel(self.keys.running(), lock.job_id.as_str())
            .await?;
        let _: () = conn
            .srem(self.keys.worker(&self.worker_id), lock.job_id.as_str())
            .await?;

        lock.held.store(false, Ordering::SeqCst);
        debug!(job_id = %lock.job_id, worker_id = %self.worker_id, "Released job lock");

        Ok(())
    }

    /// Returns true iff an idempotency record exists for the key.
    ///
    /// An empty key never matches.
    pub async fn check_idempotency(&self, unique_key: &str) -> JobResult<bool> {
        if unique_key.is_empty() {
            return Ok(false);
        }

        let mut conn = self.conn().await?;
        let exists: bool = conn.exists(self.keys.idempotency(unique_key)).await?;
        Ok(exists)
    }

    /// Record a completed execution in the idempotency ledger.
    pub async fn mark_completed(&self, unique_key: &str, job_id: &JobId) -> JobResult<()> {
        if unique_key.is_empty() {
            return Ok(());
        }

        let mut conn = self.conn().await?;
        let _: () = conn
            .set_ex(
                self.keys.idempotency(unique_key),
                format!("{}:{}", job_id, Utc::now().timestamp()),
                self.idempotency_ttl.as_secs(),
            )
            .await?;
        Ok(())
    }

    /// Reconcile stranded running-job entries older than `threshold`.
    ///
    /// Removes the lock key and the registry entry for each stranded job and
    /// returns the cleaned job ids.
    pub async fn cleanup_stale_jobs(&self, threshold: Duration) -> JobResult<Vec<JobId>> {
        let mut conn = self.conn().await?;
        let now = Utc::now().timestamp();

        let running: std::collections::HashMap<String, String> =
            conn.hgetall(self.keys.running()).await?;

        let mut cleaned = Vec::new();
        for (job_id, entry) in running {
            // Entry format: `worker_id:start_epoch`; worker ids carry no ':'.
            let Some((owner, start)) = entry.rsplit_once(':') else {
                continue;
            };
            let Ok(start) = start.parse::<i64>() else {
                continue;
            };

            if now - start > threshold.as_secs() as i64 {
                let _: () = conn.del(self.keys.lock(&job_id)).await?;
                let _: () = conn.hdel(self.keys.running(), &job_id).await?;
                let _: () = conn.srem(self.keys.worker(owner), &job_id).await?;

                warn!(job_id = %job_id, owner = owner, "Cleaned up stale running job");
                cleaned.push(JobId::from_string(job_id));
            }
        }

        Ok(cleaned)
    }

    /// Release every lock owned by this worker and drop its ownership set.
    pub async fn release_all_locks(&self) -> JobResult<()> {
        let mut conn = self.conn().await?;
        let worker_key = self.keys.worker(&self.worker_id);

        let owned: Vec<String> = conn.smembers(&worker_key).await?;
        for job_id in owned {
            let _: i64 = Script::new(RELEASE_IF_OWNER)
                .key(self.keys.lock(&job_id))
                .arg(self.owner_prefix())
                .invoke_async(&mut *conn)
                .await?;
            let _: () = conn.hdel(self.keys.running(), &job_id).await?;
        }

        let _: () = conn.del(&worker_key).await?;

        debug!(worker_id = %self.worker_id, "Released all locks");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scripts_use_fixed_string_matching() {
        // Owner checks must not go through Lua pattern matching: job ids and
        // worker ids are UUIDs.
        assert!(EXTEND_IF_OWNER.contains("string.sub"));
        assert!(RELEASE_IF_OWNER.contains("string.sub"));
        assert!(!EXTEND_IF_OWNER.contains("string.match"));
        assert!(!RELEASE_IF_OWNER.contains("string.match"));
    }

    #[test]
    fn test_running_entry_parses_from_the_right() {
        let entry = "worker-5f7d:1700000000";
        let (owner, start) = entry.rsplit_once(':').unwrap();
        assert_eq!(owner, "worker-5f7d");
        assert_eq!(start.parse::<i64>().unwrap(), 1_700_000_000);
    }
}
