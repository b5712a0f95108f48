//! Common test infrastructure for Redis integration tests.

use arcana_jobs::{
    create_pool, HandlerRegistry, JobLockManager, LockConfig, RedisConfig, RedisJobQueue,
    RedisKeys, WorkerPool, WorkerPoolConfig,
};
use deadpool_redis::Pool;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use testcontainers::{runners::AsyncRunner, ContainerAsync};
use testcontainers_modules::redis::Redis;

/// Test Redis container wrapper.
///
/// Manages a Redis testcontainer lifecycle and provides a connected queue.
/// Requires Docker to be available on the system.
pub struct TestRedis {
    _container: ContainerAsync<Redis>,
    pool: Pool,
    keys: RedisKeys,
    queue: Arc<RedisJobQueue>,
}

impl TestRedis {
    /// Creates a fresh Redis container with a connected pool and queue.
    pub async fn new() -> Self {
        let container = Redis::default()
            .start()
            .await
            .expect("Failed to start Redis container");

        let port = container
            .get_host_port_ipv4(6379)
            .await
            .expect("Failed to get Redis port");

        let config = RedisConfig {
            host: "127.0.0.1".to_string(),
            port,
            ..RedisConfig::default()
        };

        let pool = Self::connect_with_retry(&config, 30).await;
        let keys = RedisKeys::default();
        let queue = Arc::new(RedisJobQueue::new(pool.clone(), keys.clone()));

        Self {
            _container: container,
            pool,
            keys,
            queue,
        }
    }

    /// Returns the connection pool.
    pub fn pool(&self) -> Pool {
        self.pool.clone()
    }

    /// Returns the key builder.
    pub fn keys(&self) -> RedisKeys {
        self.keys.clone()
    }

    /// Returns the shared queue.
    pub fn queue(&self) -> Arc<RedisJobQueue> {
        self.queue.clone()
    }

    /// Creates a lock manager for the given worker id with default TTLs.
    pub fn lock_manager(&self, worker_id: &str) -> Arc<JobLockManager> {
        self.lock_manager_with(worker_id, &LockConfig::default())
    }

    /// Creates a lock manager for the given worker id.
    pub fn lock_manager_with(&self, worker_id: &str, config: &LockConfig) -> Arc<JobLockManager> {
        Arc::new(JobLockManager::new(
            self.pool(),
            self.keys(),
            worker_id,
            config,
        ))
    }

    /// Creates a worker pool over this store with a fast poll interval.
    pub fn worker_pool(
        &self,
        worker_id: &str,
        registry: Arc<HandlerRegistry>,
        mut config: WorkerPoolConfig,
    ) -> Arc<WorkerPool> {
        config.poll_interval = Duration::from_millis(20);
        Arc::new(WorkerPool::new(
            self.queue(),
            self.lock_manager(worker_id),
            registry,
            config,
        ))
    }

    /// Connects to Redis with retry logic.
    async fn connect_with_retry(config: &RedisConfig, max_attempts: u32) -> Pool {
        let mut attempts = 0;
        loop {
            attempts += 1;
            match create_pool(config).await {
                Ok(pool) => return pool,
                Err(e) => {
                    if attempts >= max_attempts {
                        panic!(
                            "Failed to connect to Redis after {} attempts: {}",
                            max_attempts, e
                        );
                    }
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
    }
}

/// Polls `check` until it returns true or the deadline passes.
pub async fn eventually<F, Fut>(deadline: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let start = Instant::now();
    while start.elapsed() < deadline {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    false
}
