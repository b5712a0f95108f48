//! Arcana Jobs - Distributed Background Job System
//!
//! A Redis-backed distributed job system with:
//! - Four priority classes dispatched strictly in order (critical, high,
//!   normal, low)
//! - Deduplication by unique key and an idempotency ledger for effective
//!   at-most-once execution under retry
//! - Per-job distributed locks with heartbeat renewal
//! - Configurable retry policies and a dead letter queue
//! - Delayed and recurring (cron) jobs with leader election
//!
//! # Architecture
//!
//! ```text
//! Producer ──▶ priority lists ──▶ Worker pool ──▶ Handler
//!     │             ▲   ▲            │  │
//!     │             │   │            │  └─ complete ──▶ idempotency ledger
//!     └─ scheduled ─┘   │            └─ fail ─┬─ retry ──▶ scheduled set
//!        sorted set     │                     └─ exhausted ──▶ DLQ
//!                       │
//! Scheduler (leader) ───┘  cron fires, one per execution window
//! ```
//!
//! Every worker takes a per-job lock before invoking the handler, so a job is
//! executed by at most one worker at a time even across processes.
//!
//! # Example
//!
//! ```rust,ignore
//! use arcana_jobs::{HandlerRegistry, JobRecord, Priority};
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Debug, Serialize, Deserialize)]
//! struct SendEmail {
//!     to: String,
//!     subject: String,
//! }
//!
//! let registry = HandlerRegistry::new();
//! registry.register("send_email", |ctx, payload: SendEmail| async move {
//!     println!("[{}] sending to {}", ctx.job_id, payload.to);
//!     Ok(())
//! });
//!
//! let job = JobRecord::builder("send_email")
//!     .payload(&SendEmail {
//!         to: "user@example.com".into(),
//!         subject: "Welcome!".into(),
//!     })?
//!     .priority(Priority::High)
//!     .unique_key("welcome:user@example.com")
//!     .build();
//!
//! queue.enqueue(&job).await?;
//! ```

pub mod config;
pub mod di;
pub mod error;
pub mod job;
pub mod lock;
pub mod metrics;
pub mod redis;
pub mod registry;
pub mod retry;
pub mod scheduler;
pub mod worker;

pub use config::{JobsConfig, LockConfig, RedisConfig, SchedulerConfig, WorkerConfig};
pub use di::{JobService, JobServiceInterface};
pub use error::{JobError, JobResult};
pub use job::{JobBuilder, JobContext, JobId, JobRecord, JobStatus, Priority};
pub use lock::{JobLock, JobLockManager};
pub use registry::{HandlerRegistry, JobHandler};
pub use retry::{RetryPolicy, RetryStrategy};
pub use scheduler::{CronJobInfo, CronScheduler, ScheduledCronJob, SchedulerStats};
pub use self::metrics::{health_status, register_metrics, HealthState, HealthStatus, WorkerMetrics};
pub use self::redis::{create_pool, QueueStats, RedisJobQueue, RedisKeys};
pub use worker::{worker_id, WorkerPool, WorkerPoolConfig, WorkerPoolStats};

/// Re-export commonly used types.
pub mod prelude {
    pub use crate::job::{JobContext, JobId, JobRecord, JobStatus, Priority};
    pub use crate::registry::HandlerRegistry;
    pub use crate::retry::RetryPolicy;
    pub use crate::worker::WorkerPool;
    pub use crate::{JobError, JobResult};
}
