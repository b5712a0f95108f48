//! Metrics and health surface for the job system.
//!
//! The crate only emits through the `metrics` facade; installing an exporter
//! is the host's concern.

use metrics::{describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Metric names for the job system.
pub mod names {
    /// Total jobs enqueued.
    pub const JOBS_ENQUEUED_TOTAL: &str = "jobs_enqueued_total";
    /// Total jobs completed successfully.
    pub const JOBS_COMPLETED_TOTAL: &str = "jobs_completed_total";
    /// Total failed executions.
    pub const JOBS_FAILED_TOTAL: &str = "jobs_failed_total";
    /// Total retries scheduled.
    pub const JOBS_RETRIED_TOTAL: &str = "jobs_retried_total";
    /// Total jobs dead-lettered.
    pub const JOBS_DEAD_TOTAL: &str = "jobs_dead_total";

    /// Current pending jobs (priority lists + scheduled set).
    pub const JOBS_PENDING: &str = "jobs_pending";
    /// Current running jobs.
    pub const JOBS_RUNNING: &str = "jobs_running";
    /// Active workers across the pool.
    pub const WORKERS_ACTIVE: &str = "workers_active";

    /// Handler execution duration in seconds.
    pub const JOB_DURATION_SECONDS: &str = "job_duration_seconds";
}

/// Register all metric descriptions.
pub fn register_metrics() {
    describe_counter!(names::JOBS_ENQUEUED_TOTAL, "Total number of jobs enqueued");
    describe_counter!(
        names::JOBS_COMPLETED_TOTAL,
        "Total number of jobs completed successfully"
    );
    describe_counter!(names::JOBS_FAILED_TOTAL, "Total number of failed executions");
    describe_counter!(names::JOBS_RETRIED_TOTAL, "Total number of retries scheduled");
    describe_counter!(
        names::JOBS_DEAD_TOTAL,
        "Total number of jobs moved to the dead letter queue"
    );

    describe_gauge!(names::JOBS_PENDING, "Current number of pending jobs");
    describe_gauge!(names::JOBS_RUNNING, "Current number of running jobs");
    describe_gauge!(names::WORKERS_ACTIVE, "Number of active workers");

    describe_histogram!(
        names::JOB_DURATION_SECONDS,
        "Handler execution duration in seconds"
    );
}

/// Worker-side metric recorder.
#[derive(Clone, Copy)]
pub struct WorkerMetrics;

impl WorkerMetrics {
    /// Record a handler execution duration.
    pub fn job_duration(job_type: &str, outcome: &'static str, duration: Duration) {
        histogram!(
            names::JOB_DURATION_SECONDS,
            "job_type" => job_type.to_string(),
            "outcome" => outcome
        )
        .record(duration.as_secs_f64());
    }

    /// Update the active-workers gauge.
    pub fn workers_active(count: u64) {
        gauge!(names::WORKERS_ACTIVE).set(count as f64);
    }

    /// Update the running-jobs gauge.
    pub fn jobs_running(count: u64) {
        gauge!(names::JOBS_RUNNING).set(count as f64);
    }
}

/// Health state reported by [`health_status`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthState {
    /// Backlog within bounds.
    Healthy,
    /// Backlog above the pending threshold.
    Degraded,
}

/// Health-check snapshot of the job system.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthStatus {
    /// Overall state.
    pub status: HealthState,
    /// Active workers in this process.
    pub workers_active: u64,
    /// Pending jobs across priority lists and the scheduled set.
    pub jobs_pending: i64,
    /// Whether this process holds scheduler leadership.
    pub is_leader: bool,
}

/// Pending backlog above which the system reports `Degraded`.
const DEGRADED_PENDING_THRESHOLD: i64 = 1000;

/// Compute the health snapshot.
pub fn health_status(workers_active: u64, jobs_pending: i64, is_leader: bool) -> HealthStatus {
    let status = if jobs_pending > DEGRADED_PENDING_THRESHOLD {
        HealthState::Degraded
    } else {
        HealthState::Healthy
    };

    HealthStatus {
        status,
        workers_active,
        jobs_pending,
        is_leader,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_metrics() {
        // Registration must not panic without an installed recorder.
        register_metrics();
    }

    #[test]
    fn test_health_threshold() {
        assert_eq!(health_status(4, 1000, false).status, HealthState::Healthy);
        assert_eq!(health_status(4, 1001, false).status, HealthState::Degraded);
    }

    #[test]
    fn test_health_serialization() {
        let health = health_status(2, 10, true);
        let json = serde_json::to_value(&health).unwrap();
        assert_eq!(json["status"], "healthy");
        assert_eq!(json["is_leader"], true);
    }
}
