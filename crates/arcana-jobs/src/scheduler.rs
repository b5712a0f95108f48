//! Cron scheduler with distributed leader election.
//!
//! Every instance in the fleet runs the same registrations; only the elected
//! leader enqueues. A per-window execution key deduplicates fires across
//! leader handoffs, and the queued job's unique key deduplicates again at the
//! queue level.

use crate::config::SchedulerConfig;
use crate::error::{JobError, JobResult};
use crate::job::{JobRecord, Priority};
use crate::redis::{RedisJobQueue, RedisKeys};
use chrono::{DateTime, Datelike, Timelike, Utc};
use cron::Schedule;
use deadpool_redis::Pool;
use parking_lot::{Mutex, RwLock};
use redis::{AsyncCommands, Script};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt::Write as _;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Delete the key only while it holds exactly this instance id.
const RELEASE_IF_SELF: &str = r#"
if redis.call("get", KEYS[1]) == ARGV[1] then
    return redis.call("del", KEYS[1])
else
    return 0
end
"#;

/// A registered recurring job.
#[derive(Debug, Clone)]
pub struct ScheduledCronJob {
    /// Unique registration name.
    pub name: String,

    /// Five-field cron expression (minute hour day month weekday).
    pub schedule: String,

    /// Job type enqueued on each fire.
    pub job_type: String,

    /// Payload enqueued with each instance.
    pub payload: serde_json::Value,

    /// Priority of the enqueued jobs.
    pub priority: Priority,

    /// Base for the per-window unique key; defaults to the registration name.
    pub unique_key_base: Option<String>,

    /// Extra tags for the enqueued jobs.
    pub tags: Vec<String>,

    /// Whether executions must never overlap in wall-clock time.
    pub singleton: bool,
}

impl ScheduledCronJob {
    /// Create a registration with default priority and no payload.
    pub fn new(
        name: impl Into<String>,
        schedule: impl Into<String>,
        job_type: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            schedule: schedule.into(),
            job_type: job_type.into(),
            payload: serde_json::Value::Null,
            priority: Priority::Normal,
            unique_key_base: None,
            tags: Vec::new(),
            singleton: false,
        }
    }

    /// Sets the payload.
    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    /// Sets the priority.
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Sets the unique key base.
    pub fn with_unique_key_base(mut self, base: impl Into<String>) -> Self {
        self.unique_key_base = Some(base.into());
        self
    }

    /// Adds a tag.
    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    /// Marks the job as a singleton.
    pub fn singleton(mut self) -> Self {
        self.singleton = true;
        self
    }
}

/// Registration snapshot returned by [`CronScheduler::list_jobs`].
#[derive(Debug, Clone)]
pub struct CronJobInfo {
    /// Registration name.
    pub name: String,
    /// Cron expression.
    pub schedule: String,
    /// Enqueued job type.
    pub job_type: String,
    /// Priority.
    pub priority: Priority,
    /// Singleton flag.
    pub singleton: bool,
    /// Next fire time.
    pub next_run: Option<DateTime<Utc>>,
}

/// Scheduler statistics.
#[derive(Debug, Clone)]
pub struct SchedulerStats {
    /// Instance id.
    pub instance_id: String,
    /// Whether this instance currently leads.
    pub is_leader: bool,
    /// Number of registered jobs.
    pub registered_jobs: usize,
    /// Fires emitted by this instance.
    pub fires: u64,
}

struct CronEntry {
    job: ScheduledCronJob,
    schedule: Schedule,
    next_run: Option<DateTime<Utc>>,
}

/// Distributed cron scheduler.
pub struct CronScheduler {
    instance_id: String,
    pool: Pool,
    queue: Arc<RedisJobQueue>,
    keys: RedisKeys,
    config: SchedulerConfig,
    jobs: RwLock<HashMap<String, CronEntry>>,
    shutdown_tx: broadcast::Sender<()>,
    running: AtomicBool,
    is_leader: AtomicBool,
    fires: AtomicU64,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl CronScheduler {
    /// Create a new scheduler instance.
    pub fn new(pool: Pool, queue: Arc<RedisJobQueue>, keys: RedisKeys, config: SchedulerConfig) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);

        Self {
            instance_id: format!("scheduler-{}", Uuid::new_v4()),
            pool,
            queue,
            keys,
            config,
            jobs: RwLock::new(HashMap::new()),
            shutdown_tx,
            running: AtomicBool::new(false),
            is_leader: AtomicBool::new(false),
            fires: AtomicU64::new(0),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// This instance's id.
    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Whether this instance currently leads.
    pub fn is_leader(&self) -> bool {
        self.is_leader.load(Ordering::SeqCst)
    }

    async fn conn(&self) -> JobResult<deadpool_redis::Connection> {
        Ok(self.pool.get().await?)
    }

    /// Register a recurring job.
    ///
    /// The schedule must be a five-field cron expression; duplicate names are
    /// rejected.
    pub fn register(&self, job: ScheduledCronJob) -> JobResult<()> {
        let schedule = parse_schedule(&job.schedule)?;

        let mut jobs = self.jobs.write();
        if jobs.contains_key(&job.name) {
            return Err(JobError::Scheduler(format!(
                "Cron job already registered: {}",
                job.name
            )));
        }

        let next_run = schedule.after(&Utc::now()).next();
        info!(job_name = %job.name, schedule = %job.schedule, "Registered cron job");
        jobs.insert(
            job.name.clone(),
            CronEntry {
                job,
                schedule,
                next_run,
            },
        );

        Ok(())
    }

    /// Remove a registration.
    pub fn unregister(&self, name: &str) -> bool {
        self.jobs.write().remove(name).is_some()
    }

    /// Snapshot of all registrations.
    pub fn list_jobs(&self) -> Vec<CronJobInfo> {
        self.jobs
            .read()
            .values()
            .map(|entry| CronJobInfo {
                name: entry.job.name.clone(),
                schedule: entry.job.schedule.clone(),
                job_type: entry.job.job_type.clone(),
                priority: entry.job.priority,
                singleton: entry.job.singleton,
                next_run: entry.next_run,
            })
            .collect()
    }

    /// Next fire time for a registration.
    pub fn next_run(&self, name: &str) -> JobResult<Option<DateTime<Utc>>> {
        let jobs = self.jobs.read();
        let entry = jobs
            .get(name)
            .ok_or_else(|| JobError::NotFound(name.to_string()))?;
        Ok(entry.schedule.after(&Utc::now()).next())
    }

    /// Scheduler statistics.
    pub fn stats(&self) -> SchedulerStats {
        SchedulerStats {
            instance_id: self.instance_id.clone(),
            is_leader: self.is_leader(),
            registered_jobs: self.jobs.read().len(),
            fires: self.fires.load(Ordering::Relaxed),
        }
    }

    /// Start the election and cron tick loops.
    pub fn start(self: &Arc<Self>) -> JobResult<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(JobError::Scheduler("Scheduler already running".to_string()));
        }

        info!(
            instance_id = %self.instance_id,
            leader_ttl_secs = self.config.leader_lock_ttl_secs,
            "Starting scheduler"
        );

        let mut tasks = self.tasks.lock();

        {
            let scheduler = self.clone();
            let mut shutdown_rx = self.shutdown_tx.subscribe();

            tasks.push(tokio::spawn(async move {
                let mut ticker = interval(scheduler.config.election_interval());
                loop {
                    tokio::select! {
                        _ = shutdown_rx.recv() => break,
                        _ = ticker.tick() => {
                            if let Err(e) = scheduler.election_tick().await {
                                error!(error = %e, "Leader election tick failed");
                            }
                        }
                    }
                }
            }));
        }

        {
            let scheduler = self.clone();
            let mut shutdown_rx = self.shutdown_tx.subscribe();

            tasks.push(tokio::spawn(async move {
                let mut ticker = interval(Duration::from_secs(1));
                loop {
                    tokio::select! {
                        _ = shutdown_rx.recv() => break,
                        _ = ticker.tick() => scheduler.cron_tick().await,
                    }
                }
            }));
        }

        Ok(())
    }

    /// Stop the scheduler, releasing leadership only if still held.
    ///
    /// Wrap in `tokio::time::timeout` for a caller-imposed bound.
    pub async fn stop(&self) -> JobResult<()> {
        if !self.running.swap(false, Ordering::SeqCst) {
            return Ok(());
        }

        info!(instance_id = %self.instance_id, "Stopping scheduler");
        let _ = self.shutdown_tx.send(());

        let handles: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        futures::future::join_all(handles).await;

        if self.is_leader.swap(false, Ordering::SeqCst) {
            let mut conn = self.conn().await?;
            let _: i64 = Script::new(RELEASE_IF_SELF)
                .key(self.keys.scheduler_leader())
                .arg(&self.instance_id)
                .invoke_async(&mut *conn)
                .await?;
            info!(instance_id = %self.instance_id, "Released scheduler leadership");
        }

        Ok(())
    }

    /// One leader-election round: acquire, or refresh if already leading.
    ///
    /// Transitions are logged only when the leader flag flips.
    async fn election_tick(&self) -> JobResult<()> {
        let mut conn = self.conn().await?;
        let leader_key = self.keys.scheduler_leader();
        let ttl_secs = self.config.leader_lock_ttl_secs;

        let acquired: Option<String> = redis::cmd("SET")
            .arg(&leader_key)
            .arg(&self.instance_id)
            .arg("NX")
            .arg("EX")
            .arg(ttl_secs)
            .query_async(&mut *conn)
            .await?;

        let leading = if acquired.is_some() {
            true
        } else {
            let current: Option<String> = conn.get(&leader_key).await?;
            if current.as_deref() == Some(self.instance_id.as_str()) {
                let _: () = conn.expire(&leader_key, ttl_secs as i64).await?;
                true
            } else {
                false
            }
        };

        let was_leading = self.is_leader.swap(leading, Ordering::SeqCst);
        if leading && !was_leading {
            info!(instance_id = %self.instance_id, "Acquired scheduler leadership");
        } else if !leading && was_leading {
            info!(instance_id = %self.instance_id, "Lost scheduler leadership");
        }

        Ok(())
    }

    /// Fire every registration whose next run time has passed.
    async fn cron_tick(&self) {
        let now = Utc::now();

        let due: Vec<ScheduledCronJob> = {
            let mut jobs = self.jobs.write();
            let mut due = Vec::new();
            for entry in jobs.values_mut() {
                if entry.next_run.is_some_and(|at| at <= now) {
                    due.push(entry.job.clone());
                    entry.next_run = entry.schedule.after(&now).next();
                }
            }
            due
        };

        for job in due {
            if let Err(e) = self.fire(&job, now).await {
                warn!(job_name = %job.name, error = %e, "Cron fire failed");
            }
        }
    }

    /// Emit one instance of a registration for the current window.
    async fn fire(&self, job: &ScheduledCronJob, now: DateTime<Utc>) -> JobResult<()> {
        if !self.is_leader() {
            debug!(job_name = %job.name, "Not leader, skipping cron fire");
            return Ok(());
        }

        let window = execution_window(&job.schedule, now);
        let mut conn = self.conn().await?;

        let claimed: Option<String> = redis::cmd("SET")
            .arg(self.keys.cron_execution(&job.name, &window))
            .arg(&self.instance_id)
            .arg("NX")
            .arg("EX")
            .arg(self.config.cron_dedup_ttl_secs)
            .query_async(&mut *conn)
            .await?;

        if claimed.is_none() {
            debug!(job_name = %job.name, window = %window, "Window already fired, skipping");
            return Ok(());
        }

        if job.singleton {
            let held: bool = conn.exists(self.keys.singleton_lock(&job.name)).await?;
            if held {
                debug!(job_name = %job.name, "Singleton still running, skipping");
                return Ok(());
            }
        }

        let mut tags = job.tags.clone();
        tags.push("scheduled".to_string());
        tags.push(format!("cron:{}", job.name));

        let record = JobRecord::builder(&job.job_type)
            .raw_payload(job.payload.to_string())
            .priority(job.priority)
            .unique_key(cron_unique_key(job, &window))
            .tags(tags)
            .build();

        match self.queue.enqueue(&record).await {
            Ok(()) => {
                self.fires.fetch_add(1, Ordering::Relaxed);
                info!(job_name = %job.name, job_id = %record.id, window = %window, "Enqueued cron job");
                Ok(())
            }
            // Expected when a relinquished-then-regained leader replays a window.
            Err(JobError::Duplicate(key)) => {
                debug!(job_name = %job.name, unique_key = %key, "Cron instance already enqueued");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Run the fire path for a registration immediately.
    ///
    /// Goes through the same leader gate and per-window dedup as a cron
    /// boundary; useful for operator tooling and tests.
    pub async fn trigger(&self, name: &str) -> JobResult<()> {
        let job = {
            let jobs = self.jobs.read();
            jobs.get(name)
                .map(|entry| entry.job.clone())
                .ok_or_else(|| JobError::NotFound(name.to_string()))?
        };

        self.fire(&job, Utc::now()).await
    }

    /// Acquire the singleton lock for a registration.
    ///
    /// Handlers of singleton jobs take this on start and release it on end;
    /// the scheduler itself only checks existence as a fast-path skip.
    pub async fn acquire_singleton_lock(&self, name: &str, ttl: Duration) -> JobResult<bool> {
        let mut conn = self.conn().await?;

        let acquired: Option<String> = redis::cmd("SET")
            .arg(self.keys.singleton_lock(name))
            .arg(&self.instance_id)
            .arg("NX")
            .arg("EX")
            .arg(ttl.as_secs())
            .query_async(&mut *conn)
            .await?;

        Ok(acquired.is_some())
    }

    /// Release the singleton lock, only if this instance holds it.
    pub async fn release_singleton_lock(&self, name: &str) -> JobResult<()> {
        let mut conn = self.conn().await?;
        let _: i64 = Script::new(RELEASE_IF_SELF)
            .key(self.keys.singleton_lock(name))
            .arg(&self.instance_id)
            .invoke_async(&mut *conn)
            .await?;
        Ok(())
    }
}

/// Parse and validate a five-field cron expression.
///
/// The `cron` crate wants a seconds field, so a `0` is prefixed before
/// parsing.
fn parse_schedule(expr: &str) -> JobResult<Schedule> {
    let fields = expr.split_whitespace().count();
    if fields != 5 {
        return Err(JobError::Scheduler(format!(
            "Invalid cron expression (expected 5 fields, got {}): {}",
            fields, expr
        )));
    }

    Schedule::from_str(&format!("0 {}", expr))
        .map_err(|e| JobError::Scheduler(format!("Invalid cron expression: {}", e)))
}

/// Compute the execution window: the coarsest time bucket in which a single
/// firing of the schedule should occur.
fn execution_window(expr: &str, now: DateTime<Utc>) -> String {
    let minute_window = || now.format("%Y-%m-%dT%H:%M").to_string();

    let fields: Vec<&str> = expr.split_whitespace().collect();
    if fields.len() != 5 {
        return minute_window();
    }
    let (minute, hour, dom, month, dow) = (fields[0], fields[1], fields[2], fields[3], fields[4]);

    if minute == "*" && hour == "*" && dom == "*" && month == "*" && dow == "*" {
        return minute_window();
    }

    // `*/N * * * *`: N-minute bucket.
    if let Some(step) = minute.strip_prefix("*/") {
        if hour == "*" && dom == "*" && month == "*" && dow == "*" {
            if let Ok(step) = step.parse::<u32>() {
                if step > 0 && step < 60 {
                    let bucket = (now.minute() / step) * step;
                    let mut window = now.format("%Y-%m-%dT%H:").to_string();
                    let _ = write!(window, "{:02}", bucket);
                    return window;
                }
            }
        }
        return minute_window();
    }

    if minute == "0" && hour == "*" && dom == "*" && month == "*" && dow == "*" {
        return now.format("%Y-%m-%dT%H").to_string();
    }

    if minute == "0" && hour == "0" && month == "*" {
        if dom == "*" && dow == "*" {
            return now.format("%Y-%m-%d").to_string();
        }
        if dom == "*" && dow != "*" {
            let iso = now.iso_week();
            return format!("{}-W{:02}", iso.year(), iso.week());
        }
        if dom == "1" && dow == "*" {
            return now.format("%Y-%m").to_string();
        }
    }

    minute_window()
}

/// Compose the queue-level unique key for one window of a registration:
/// `cron:<name>:<first 8 bytes of SHA-256(base || type || window || payload), hex>`.
fn cron_unique_key(job: &ScheduledCronJob, window: &str) -> String {
    let base = job.unique_key_base.as_deref().unwrap_or(&job.name);

    let mut hasher = Sha256::new();
    hasher.update(base.as_bytes());
    hasher.update(job.job_type.as_bytes());
    hasher.update(window.as_bytes());
    hasher.update(job.payload.to_string().as_bytes());
    let digest = hasher.finalize();

    let mut hex = String::with_capacity(16);
    for byte in &digest[..8] {
        let _ = write!(hex, "{:02x}", byte);
    }

    format!("cron:{}:{}", job.name, hex)
}
