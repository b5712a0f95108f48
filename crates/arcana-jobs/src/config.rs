//! Job system configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration for the job system.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobsConfig {
    /// Redis connection configuration.
    #[serde(default)]
    pub redis: RedisConfig,

    /// Worker pool configuration.
    #[serde(default)]
    pub worker: WorkerConfig,

    /// Distributed lock configuration.
    #[serde(default)]
    pub lock: LockConfig,

    /// Scheduler configuration.
    #[serde(default)]
    pub scheduler: SchedulerConfig,
}

/// Redis connection configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    /// Redis host.
    #[serde(default = "default_redis_host")]
    pub host: String,

    /// Redis port.
    #[serde(default = "default_redis_port")]
    pub port: u16,

    /// Optional password.
    #[serde(default)]
    pub password: Option<String>,

    /// Database index.
    #[serde(default)]
    pub db: u8,

    /// Connection pool size.
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,

    /// Key prefix for all job-related keys.
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            host: default_redis_host(),
            port: default_redis_port(),
            password: None,
            db: 0,
            pool_size: default_pool_size(),
            key_prefix: default_key_prefix(),
        }
    }
}

impl RedisConfig {
    /// Builds the Redis connection URL.
    pub fn url(&self) -> String {
        match &self.password {
            Some(password) => format!(
                "redis://:{}@{}:{}/{}",
                password, self.host, self.port, self.db
            ),
            None => format!("redis://{}:{}/{}", self.host, self.port, self.db),
        }
    }
}

fn default_redis_host() -> String {
    "localhost".to_string()
}

fn default_redis_port() -> u16 {
    6379
}

fn default_pool_size() -> usize {
    10
}

fn default_key_prefix() -> String {
    "arcana:jobs".to_string()
}

/// Worker pool configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Number of concurrent workers.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Polling interval in milliseconds.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,

    /// Shutdown timeout in seconds.
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_secs: u64,

    /// Enable per-job distributed locking.
    #[serde(default = "default_true")]
    pub enable_locking: bool,

    /// Enable the idempotency precheck.
    #[serde(default = "default_true")]
    pub enable_idempotency: bool,

    /// Stale-lock cleanup interval in seconds.
    #[serde(default = "default_stale_cleanup_interval")]
    pub stale_cleanup_interval_secs: u64,

    /// Age after which a running-job entry is considered stranded, in seconds.
    #[serde(default = "default_stale_threshold")]
    pub stale_threshold_secs: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            poll_interval_ms: default_poll_interval(),
            shutdown_timeout_secs: default_shutdown_timeout(),
            enable_locking: true,
            enable_idempotency: true,
            stale_cleanup_interval_secs: default_stale_cleanup_interval(),
            stale_threshold_secs: default_stale_threshold(),
        }
    }
}

impl WorkerConfig {
    /// Returns poll interval as Duration.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Returns shutdown timeout as Duration.
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    /// Returns stale cleanup interval as Duration.
    pub fn stale_cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.stale_cleanup_interval_secs)
    }

    /// Returns stale threshold as Duration.
    pub fn stale_threshold(&self) -> Duration {
        Duration::from_secs(self.stale_threshold_secs)
    }
}

fn default_concurrency() -> usize {
    8
}

fn default_poll_interval() -> u64 {
    100
}

fn default_shutdown_timeout() -> u64 {
    30
}

fn default_true() -> bool {
    true
}

fn default_stale_cleanup_interval() -> u64 {
    60
}

fn default_stale_threshold() -> u64 {
    600
}

/// Distributed lock configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockConfig {
    /// Lock TTL in seconds.
    #[serde(default = "default_lock_ttl")]
    pub lock_ttl_secs: u64,

    /// Heartbeat interval in seconds. Zero means `lock_ttl / 3`.
    #[serde(default = "default_heartbeat")]
    pub heartbeat_secs: u64,

    /// Idempotency record TTL in seconds.
    #[serde(default = "default_idempotency_ttl")]
    pub idempotency_ttl_secs: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            lock_ttl_secs: default_lock_ttl(),
            heartbeat_secs: default_heartbeat(),
            idempotency_ttl_secs: default_idempotency_ttl(),
        }
    }
}

impl LockConfig {
    /// Returns lock TTL as Duration.
    pub fn lock_ttl(&self) -> Duration {
        Duration::from_secs(self.lock_ttl_secs)
    }

    /// Returns the effective heartbeat interval.
    pub fn heartbeat_rate(&self) -> Duration {
        if self.heartbeat_secs == 0 {
            Duration::from_secs(self.lock_ttl_secs / 3)
        } else {
            Duration::from_secs(self.heartbeat_secs)
        }
    }

    /// Returns idempotency TTL as Duration.
    pub fn idempotency_ttl(&self) -> Duration {
        Duration::from_secs(self.idempotency_ttl_secs)
    }
}

fn default_lock_ttl() -> u64 {
    300
}

fn default_heartbeat() -> u64 {
    30
}

fn default_idempotency_ttl() -> u64 {
    86400
}

/// Scheduler configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Leader lock TTL in seconds.
    #[serde(default = "default_leader_lock_ttl")]
    pub leader_lock_ttl_secs: u64,

    /// Cron execution lock TTL in seconds.
    #[serde(default = "default_cron_execution_lock_ttl")]
    pub cron_execution_lock_ttl_secs: u64,

    /// Cron per-window dedup TTL in seconds.
    #[serde(default = "default_cron_dedup_ttl")]
    pub cron_dedup_ttl_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            leader_lock_ttl_secs: default_leader_lock_ttl(),
            cron_execution_lock_ttl_secs: default_cron_execution_lock_ttl(),
            cron_dedup_ttl_secs: default_cron_dedup_ttl(),
        }
    }
}

impl SchedulerConfig {
    /// Returns leader lock TTL as Duration.
    pub fn leader_lock_ttl(&self) -> Duration {
        Duration::from_secs(self.leader_lock_ttl_secs)
    }

    /// Returns the leader election interval (`TTL / 3`).
    pub fn election_interval(&self) -> Duration {
        Duration::from_secs((self.leader_lock_ttl_secs / 3).max(1))
    }

    /// Returns cron dedup TTL as Duration.
    pub fn cron_dedup_ttl(&self) -> Duration {
        Duration::from_secs(self.cron_dedup_ttl_secs)
    }
}

fn default_leader_lock_ttl() -> u64 {
    30
}

fn default_cron_execution_lock_ttl() -> u64 {
    60
}

fn default_cron_dedup_ttl() -> u64 {
    86400
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = JobsConfig::default();

        assert_eq!(config.worker.concurrency, 8);
        assert_eq!(config.worker.poll_interval(), Duration::from_millis(100));
        assert_eq!(config.worker.shutdown_timeout(), Duration::from_secs(30));
        assert!(config.worker.enable_locking);
        assert!(config.worker.enable_idempotency);
        assert_eq!(config.lock.lock_ttl(), Duration::from_secs(300));
        assert_eq!(config.lock.heartbeat_rate(), Duration::from_secs(30));
        assert_eq!(config.scheduler.leader_lock_ttl(), Duration::from_secs(30));
        assert_eq!(config.redis.key_prefix, "arcana:jobs");
    }

    #[test]
    fn test_heartbeat_falls_back_to_ttl_third() {
        let lock = LockConfig {
            lock_ttl_secs: 90,
            heartbeat_secs: 0,
            idempotency_ttl_secs: 86400,
        };
        assert_eq!(lock.heartbeat_rate(), Duration::from_secs(30));
    }

    #[test]
    fn test_redis_url() {
        let mut redis = RedisConfig::default();
        assert_eq!(redis.url(), "redis://localhost:6379/0");

        redis.password = Some("secret".to_string());
        redis.db = 2;
        assert_eq!(redis.url(), "redis://:secret@localhost:6379/2");
    }

    #[test]
    fn test_partial_deserialization_uses_defaults() {
        let config: JobsConfig =
            serde_json::from_str(r#"{"worker": {"concurrency": 2}}"#).unwrap();
        assert_eq!(config.worker.concurrency, 2);
        assert_eq!(config.worker.poll_interval_ms, 100);
        assert_eq!(config.redis.port, 6379);
    }
}
