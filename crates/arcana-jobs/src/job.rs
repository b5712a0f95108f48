//! Job records and related definitions.

use crate::error::JobResult;
use crate::retry::RetryPolicy;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

/// Serde helper encoding a `Duration` as integer nanoseconds.
pub mod duration_nanos {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_nanos() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let nanos = u64::deserialize(deserializer)?;
        Ok(Duration::from_nanos(nanos))
    }
}

/// Unique job identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobId(String);

impl JobId {
    /// Creates a new random job ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Creates a job ID from a string.
    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Returns the job ID as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for JobId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for JobId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Job priority levels.
///
/// Each priority maps to its own queue list; dequeue scans them strictly in
/// descending order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    /// Low priority (background tasks).
    Low = 0,
    /// Normal priority (default).
    Normal = 1,
    /// High priority (important tasks).
    High = 2,
    /// Critical priority (time-sensitive).
    Critical = 3,
}

impl Priority {
    /// Dequeue scan order: Critical first, Low last.
    pub const DESCENDING: [Priority; 4] = [
        Priority::Critical,
        Priority::High,
        Priority::Normal,
        Priority::Low,
    ];

    /// The queue name for this priority.
    pub fn queue_name(&self) -> &'static str {
        match self {
            Priority::Critical => "critical",
            Priority::High => "high",
            Priority::Normal => "normal",
            Priority::Low => "low",
        }
    }
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Normal
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.queue_name())
    }
}

/// Job status enumeration.
///
/// ```text
/// Pending ─▶ Running ─▶ Completed
///               │
///               ├─ (attempts ≤ max_retries) ─▶ Retrying ─▶ Pending
///               └─ (attempts > max_retries) ─▶ Dead
/// ```
///
/// `Completed` and `Dead` are terminal; retrying a dead-letter job mints a
/// fresh `Pending` record with a new id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Job is waiting in a priority queue.
    Pending,
    /// Job is currently executing on a worker.
    Running,
    /// Job failed and is waiting in the scheduled set for its retry.
    Retrying,
    /// Job completed successfully.
    Completed,
    /// Job failed.
    Failed,
    /// Job exhausted its retries and sits in the dead letter queue.
    Dead,
}

impl Default for JobStatus {
    fn default() -> Self {
        JobStatus::Pending
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobStatus::Pending => write!(f, "pending"),
            JobStatus::Running => write!(f, "running"),
            JobStatus::Retrying => write!(f, "retrying"),
            JobStatus::Completed => write!(f, "completed"),
            JobStatus::Failed => write!(f, "failed"),
            JobStatus::Dead => write!(f, "dead"),
        }
    }
}

/// The serialized unit of work.
///
/// This is the stable wire format stored under `job:<id>`: snake_case field
/// names, durations as integer nanoseconds, timestamps as RFC 3339 strings,
/// optional fields omitted when empty.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    /// Job ID.
    pub id: JobId,

    /// Job type name used to look up the handler.
    #[serde(rename = "type")]
    pub job_type: String,

    /// Serialized handler-specific payload (JSON text).
    pub payload: String,

    /// Priority class.
    pub priority: Priority,

    /// Current status.
    pub status: JobStatus,

    /// Number of executions started so far.
    pub attempts: u32,

    /// Maximum retries after the initial attempt.
    pub max_retries: u32,

    /// Retry policy.
    pub retry_policy: RetryPolicy,

    /// Per-execution timeout.
    #[serde(with = "duration_nanos")]
    pub timeout: Duration,

    /// Due time for delayed or retrying jobs.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub scheduled_at: Option<DateTime<Utc>>,

    /// When the job was created.
    pub created_at: DateTime<Utc>,

    /// When the current (or last) execution started.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub started_at: Option<DateTime<Utc>>,

    /// When the job completed.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub completed_at: Option<DateTime<Utc>>,

    /// Error from the last failed attempt.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub last_error: Option<String>,

    /// Correlation ID for tracing.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub correlation_id: Option<String>,

    /// Unique key for deduplication and idempotency.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub unique_key: Option<String>,

    /// Tags for categorization.
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub tags: Vec<String>,
}

impl JobRecord {
    /// Starts building a job of the given type.
    pub fn builder(job_type: impl Into<String>) -> JobBuilder {
        JobBuilder::new(job_type)
    }

    /// Returns true if the retry budget is exhausted.
    pub fn is_exhausted(&self) -> bool {
        self.attempts > self.max_retries
    }

    /// Serialize to the wire format.
    pub fn to_json(&self) -> JobResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Deserialize from the wire format.
    pub fn from_json(json: &str) -> JobResult<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Create an execution context for a worker.
    pub fn to_context(&self, worker_id: &str) -> JobContext {
        JobContext {
            job_id: self.id.clone(),
            job_type: self.job_type.clone(),
            attempt: self.attempts,
            max_retries: self.max_retries,
            worker_id: worker_id.to_string(),
            correlation_id: self.correlation_id.clone(),
        }
    }
}

/// Builder for job records.
pub struct JobBuilder {
    job_type: String,
    payload: String,
    priority: Priority,
    max_retries: Option<u32>,
    retry_policy: RetryPolicy,
    timeout: Duration,
    scheduled_at: Option<DateTime<Utc>>,
    correlation_id: Option<String>,
    unique_key: Option<String>,
    tags: Vec<String>,
}

impl JobBuilder {
    /// Default per-execution timeout (5 minutes).
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);

    fn new(job_type: impl Into<String>) -> Self {
        Self {
            job_type: job_type.into(),
            payload: "null".to_string(),
            priority: Priority::Normal,
            max_retries: None,
            retry_policy: RetryPolicy::default(),
            timeout: Self::DEFAULT_TIMEOUT,
            scheduled_at: None,
            correlation_id: None,
            unique_key: None,
            tags: Vec::new(),
        }
    }

    /// Sets the typed payload, serializing it to JSON.
    pub fn payload<P: Serialize>(mut self, payload: &P) -> JobResult<Self> {
        self.payload = serde_json::to_string(payload)?;
        Ok(self)
    }

    /// Sets a pre-serialized payload.
    pub fn raw_payload(mut self, payload: impl Into<String>) -> Self {
        self.payload = payload.into();
        self
    }

    /// Sets the priority.
    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Overrides the maximum retries, independent of the retry policy.
    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    /// Overrides the retry policy.
    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    /// Sets the per-execution timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Schedules the job for a specific time.
    pub fn schedule_at(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled_at = Some(at);
        self
    }

    /// Schedules the job after a delay.
    pub fn schedule_in(mut self, delay: Duration) -> Self {
        self.scheduled_at = Some(Utc::now() + ChronoDuration::from_std(delay).unwrap_or_default());
        self
    }

    /// Sets the correlation ID for tracing.
    pub fn correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    /// Sets the unique key for deduplication.
    pub fn unique_key(mut self, key: impl Into<String>) -> Self {
        self.unique_key = Some(key.into());
        self
    }

    /// Adds a tag.
    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    /// Adds multiple tags.
    pub fn tags(mut self, tags: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.tags.extend(tags.into_iter().map(|t| t.into()));
        self
    }

    /// Builds the record with a fresh id and `Pending` status.
    pub fn build(self) -> JobRecord {
        let max_retries = self.max_retries.unwrap_or(self.retry_policy.max_retries);

        JobRecord {
            id: JobId::new(),
            job_type: self.job_type,
            payload: self.payload,
            priority: self.priority,
            status: JobStatus::Pending,
            attempts: 0,
            max_retries,
            retry_policy: self.retry_policy,
            timeout: self.timeout,
            scheduled_at: self.scheduled_at,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            last_error: None,
            correlation_id: self.correlation_id,
            unique_key: self.unique_key,
            tags: self.tags,
        }
    }
}

/// Job execution context handed to handlers.
#[derive(Debug, Clone)]
pub struct JobContext {
    /// Job ID.
    pub job_id: JobId,

    /// Job type name.
    pub job_type: String,

    /// Current attempt number (1-based).
    pub attempt: u32,

    /// Maximum retries after the initial attempt.
    pub max_retries: u32,

    /// Worker ID processing this job.
    pub worker_id: String,

    /// Correlation ID for tracing.
    pub correlation_id: Option<String>,
}

impl JobContext {
    /// Returns true if this is the last attempt.
    pub fn is_last_attempt(&self) -> bool {
        self.attempt >= self.max_retries + 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Serialize, Deserialize)]
    struct SumPayload {
        a: i64,
        b: i64,
    }

    #[test]
    fn test_job_id_generation() {
        let id1 = JobId::new();
        let id2 = JobId::new();
        assert_ne!(id1, id2);
    }

    #[test]
    fn test_priority_ordering() {
        assert!(Priority::Critical > Priority::High);
        assert!(Priority::High > Priority::Normal);
        assert!(Priority::Normal > Priority::Low);
        assert_eq!(
            Priority::DESCENDING,
            [
                Priority::Critical,
                Priority::High,
                Priority::Normal,
                Priority::Low
            ]
        );
    }

    #[test]
    fn test_priority_queue_names() {
        assert_eq!(Priority::Critical.queue_name(), "critical");
        assert_eq!(Priority::Low.queue_name(), "low");
    }

    #[test]
    fn test_builder_defaults() {
        let job = JobRecord::builder("sum")
            .payload(&SumPayload { a: 2, b: 3 })
            .unwrap()
            .build();

        assert_eq!(job.job_type, "sum");
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.attempts, 0);
        assert_eq!(job.priority, Priority::Normal);
        assert_eq!(job.max_retries, job.retry_policy.max_retries);
        assert!(job.scheduled_at.is_none());
        assert!(job.started_at.is_none());
    }

    #[test]
    fn test_record_round_trip_is_stable() {
        let job = JobRecord::builder("sum")
            .payload(&SumPayload { a: 2, b: 3 })
            .unwrap()
            .priority(Priority::High)
            .unique_key("order-42")
            .tag("billing")
            .build();

        let json = job.to_json().unwrap();
        let restored = JobRecord::from_json(&json).unwrap();
        assert_eq!(job, restored);

        // Serialize -> deserialize -> serialize yields identical bytes.
        assert_eq!(json, restored.to_json().unwrap());
    }

    #[test]
    fn test_optional_fields_omitted_when_empty() {
        let job = JobRecord::builder("noop").build();
        let json = job.to_json().unwrap();

        assert!(!json.contains("scheduled_at"));
        assert!(!json.contains("last_error"));
        assert!(!json.contains("unique_key"));
        assert!(!json.contains("tags"));
    }

    #[test]
    fn test_wire_format_fields() {
        // The stored encoding is compatibility-sensitive: snake_case names,
        // "type" for the handler key, RFC 3339 timestamps, nanosecond
        // durations in the retry policy.
        let job = JobRecord::builder("sum")
            .payload(&SumPayload { a: 2, b: 3 })
            .unwrap()
            .priority(Priority::Critical)
            .build();
        let value: serde_json::Value = serde_json::from_str(&job.to_json().unwrap()).unwrap();

        assert_eq!(value["type"], "sum");
        assert_eq!(value["priority"], "critical");
        assert_eq!(value["status"], "pending");
        assert_eq!(value["attempts"], 0);
        assert_eq!(value["payload"], r#"{"a":2,"b":3}"#);
        assert_eq!(value["retry_policy"]["strategy"], "exponential");
        assert_eq!(
            value["retry_policy"]["initial_delay"].as_u64(),
            Some(1_000_000_000)
        );
        // RFC 3339 with a UTC offset.
        let created_at = value["created_at"].as_str().unwrap();
        assert!(chrono::DateTime::parse_from_rfc3339(created_at).is_ok());
    }

    #[test]
    fn test_timeout_encoded_as_nanos() {
        let job = JobRecord::builder("noop")
            .timeout(Duration::from_secs(2))
            .build();
        let value: serde_json::Value = serde_json::from_str(&job.to_json().unwrap()).unwrap();

        assert_eq!(value["timeout"].as_u64(), Some(2_000_000_000));
    }

    #[test]
    fn test_context_last_attempt() {
        let mut job = JobRecord::builder("noop").max_retries(2).build();
        job.attempts = 3;

        let ctx = job.to_context("worker-1");
        assert!(ctx.is_last_attempt());
    }
}
