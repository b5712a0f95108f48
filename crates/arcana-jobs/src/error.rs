//! Job error types.

use thiserror::Error;

/// Result type for job operations.
pub type JobResult<T> = Result<T, JobError>;

/// Job-related errors.
#[derive(Debug, Error)]
pub enum JobError {
    /// Job not found.
    #[error("Job not found: {0}")]
    NotFound(String),

    /// A job with the same unique key is already in flight.
    #[error("Duplicate job with unique key: {0}")]
    Duplicate(String),

    /// All priority queues are empty.
    #[error("Queue is empty")]
    QueueEmpty,

    /// Another worker is already processing this job.
    #[error("Job already taken: {0}")]
    AlreadyTaken(String),

    /// The distributed lock could not be acquired.
    #[error("Lock not acquired for job: {0}")]
    LockNotAcquired(String),

    /// The distributed lock is not held by this worker.
    #[error("Lock not held for job: {0}")]
    LockNotHeld(String),

    /// No handler registered for the job type.
    #[error("No handler registered for job type: {0}")]
    HandlerMissing(String),

    /// Handler exceeded the job timeout.
    #[error("Job timed out after {0} seconds")]
    Timeout(u64),

    /// Handler returned an error.
    #[error("Job execution failed: {0}")]
    ExecutionFailed(String),

    /// Handler panicked; the panic was caught and the job failed.
    #[error("Job handler panicked: {0}")]
    PanicRecovered(String),

    /// Invalid job state for the requested operation.
    #[error("Invalid job state: expected {expected}, got {actual}")]
    InvalidState { expected: String, actual: String },

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Redis error.
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// Redis pool error.
    #[error("Redis pool error: {0}")]
    Pool(#[from] deadpool_redis::PoolError),

    /// Scheduler error.
    #[error("Scheduler error: {0}")]
    Scheduler(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Worker error.
    #[error("Worker error: {0}")]
    Worker(String),
}

/// Fold a caught handler panic into a job error.
pub(crate) fn panic_message(err: &(dyn std::any::Any + Send)) -> JobError {
    let msg = if let Some(s) = err.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = err.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    };
    JobError::PanicRecovered(msg)
}

impl JobError {
    /// Returns true if this is a transient storage error.
    ///
    /// Worker loops log and continue on storage errors; enqueue callers see
    /// them directly.
    pub fn is_storage(&self) -> bool {
        matches!(self, JobError::Redis(_) | JobError::Pool(_))
    }

    /// Returns true if the failure counts against the job's retry budget.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            JobError::ExecutionFailed(_)
                | JobError::Timeout(_)
                | JobError::PanicRecovered(_)
                | JobError::HandlerMissing(_)
                | JobError::Serialization(_)
                | JobError::Worker(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_classification() {
        assert!(!JobError::QueueEmpty.is_storage());
        assert!(!JobError::NotFound("x".into()).is_storage());
        let parse: Result<serde_json::Value, _> = serde_json::from_str("{");
        assert!(!JobError::Serialization(parse.unwrap_err()).is_storage());
    }

    #[test]
    fn test_retryable_classification() {
        assert!(JobError::ExecutionFailed("boom".into()).is_retryable());
        assert!(JobError::Timeout(5).is_retryable());
        assert!(JobError::PanicRecovered("oops".into()).is_retryable());
        assert!(!JobError::QueueEmpty.is_retryable());
        assert!(!JobError::LockNotAcquired("j".into()).is_retryable());
    }
}
