//! Redis-backed storage for the job system.

mod queue;

pub use queue::{QueueStats, RedisJobQueue};

use crate::config::RedisConfig;
use crate::error::{JobError, JobResult};
use deadpool_redis::{Config, Pool, Runtime};
use tracing::info;

/// Create a Redis connection pool.
pub async fn create_pool(config: &RedisConfig) -> JobResult<Pool> {
    let cfg = Config::from_url(config.url());

    let pool = cfg
        .builder()
        .map_err(|e| JobError::Configuration(format!("Invalid Redis config: {}", e)))?
        .max_size(config.pool_size)
        .runtime(Runtime::Tokio1)
        .build()
        .map_err(|e| JobError::Configuration(format!("Failed to create pool: {}", e)))?;

    // Test connection
    let mut conn = pool.get().await?;
    redis::cmd("PING").query_async::<String>(&mut *conn).await?;

    info!(host = %config.host, port = config.port, "Redis connection pool created");

    Ok(pool)
}

/// Redis key builder for the job system.
///
/// The layout is stable and compatibility-sensitive; every component goes
/// through this builder.
#[derive(Debug, Clone)]
pub struct RedisKeys {
    prefix: String,
}

impl RedisKeys {
    /// Create a new key builder with the given prefix.
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    /// Priority queue list (head-pushed, tail-popped job ids).
    pub fn queue(&self, priority_name: &str) -> String {
        format!("{}:queue:{}", self.prefix, priority_name)
    }

    /// Job record key (JSON-encoded record, 24h rolling TTL).
    pub fn job(&self, job_id: &str) -> String {
        format!("{}:job:{}", self.prefix, job_id)
    }

    /// Scheduled jobs sorted set (member = job id, score = due epoch seconds).
    pub fn scheduled(&self) -> String {
        format!("{}:scheduled", self.prefix)
    }

    /// Dead letter queue list.
    pub fn dlq(&self) -> String {
        format!("{}:dlq", self.prefix)
    }

    /// Unique job key for deduplication.
    pub fn unique(&self, key: &str) -> String {
        format!("{}:unique:{}", self.prefix, key)
    }

    /// Per-job lock key.
    pub fn lock(&self, job_id: &str) -> String {
        format!("{}:lock:{}", self.prefix, job_id)
    }

    /// Running jobs hash (job id -> `worker_id:start_epoch`).
    pub fn running(&self) -> String {
        format!("{}:running", self.prefix)
    }

    /// Per-worker set of owned job ids.
    pub fn worker(&self, worker_id: &str) -> String {
        format!("{}:worker:{}", self.prefix, worker_id)
    }

    /// Idempotency ledger entry.
    pub fn idempotency(&self, key: &str) -> String {
        format!("{}:idempotency:{}", self.prefix, key)
    }

    /// Stats counters hash.
    pub fn stats(&self) -> String {
        format!("{}:stats", self.prefix)
    }

    /// Scheduler leader key.
    pub fn scheduler_leader(&self) -> String {
        format!("{}:scheduler:leader", self.prefix)
    }

    /// Cron per-window execution key.
    pub fn cron_execution(&self, job_name: &str, window: &str) -> String {
        format!("{}:cron:execution:{}:{}", self.prefix, job_name, window)
    }

    /// Cron singleton lock key.
    pub fn singleton_lock(&self, job_name: &str) -> String {
        format!("{}:cron:lock:singleton:{}", self.prefix, job_name)
    }
}

impl Default for RedisKeys {
    fn default() -> Self {
        Self::new("arcana:jobs")
    }
}
