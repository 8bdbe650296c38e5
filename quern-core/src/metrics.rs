//! Prometheus instruments for the job lifecycle.
//!
//! The core only records; exposition (HTTP endpoint, push gateway) is the
//! embedding application's concern via `prometheus::gather()`.

use lazy_static::lazy_static;
use prometheus::{
    HistogramVec, IntCounterVec, IntGauge, IntGaugeVec, register_histogram_vec,
    register_int_counter_vec, register_int_gauge, register_int_gauge_vec,
};

/// Terminal status labels for `jobs_total` and `jobs_duration_seconds`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum JobStatus {
    Succeeded,
    Failed,
    Cancelled,
    Retried,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Succeeded => "succeeded",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
            JobStatus::Retried => "retried",
        }
    }
}

lazy_static! {
    /// Jobs currently queued or processing, by name.
    pub static ref JOBS_METER: IntGaugeVec = register_int_gauge_vec!(
        "jobs_meter",
        "Jobs currently queued or processing",
        &["name", "status"]
    )
    .expect("Failed to register JOBS_METER");

    /// Terminal status transitions, by name.
    pub static ref JOBS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "jobs_total",
        "Job terminal status transitions",
        &["name", "status"]
    )
    .expect("Failed to register JOBS_TOTAL");

    /// Execution duration of terminally-completed jobs.
    pub static ref JOBS_DURATION_SECONDS: HistogramVec = register_histogram_vec!(
        "jobs_duration_seconds",
        "Job execution duration in seconds",
        &["name", "status"],
        vec![0.005, 0.025, 0.1, 0.5, 1.0, 5.0, 30.0, 120.0, 600.0]
    )
    .expect("Failed to register JOBS_DURATION_SECONDS");

    /// Time a job spent queued before its first execution.
    pub static ref JOBS_QUEUED_FOR_DURATION_SECONDS: HistogramVec = register_histogram_vec!(
        "jobs_queued_for_duration_seconds",
        "Time between enqueue and execution in seconds",
        &["name"],
        vec![0.005, 0.025, 0.1, 0.5, 1.0, 5.0, 30.0, 120.0, 600.0]
    )
    .expect("Failed to register JOBS_QUEUED_FOR_DURATION_SECONDS");

    /// Configured worker pool size.
    pub static ref WORKERS: IntGauge =
        register_int_gauge!("workers", "Configured worker pool size")
            .expect("Failed to register WORKERS");

    /// Driver transport failures, by operation.
    pub static ref DRIVER_ERRORS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "driver_errors_total",
        "Queue driver transport failures",
        &["op"]
    )
    .expect("Failed to register DRIVER_ERRORS_TOTAL");
}

pub(crate) fn job_queued(name: &str) {
    JOBS_METER.with_label_values(&[name, "queued"]).inc();
}

pub(crate) fn job_dequeued(name: &str) {
    JOBS_METER.with_label_values(&[name, "queued"]).dec();
    JOBS_METER.with_label_values(&[name, "processing"]).inc();
}

pub(crate) fn job_processing_done(name: &str) {
    JOBS_METER.with_label_values(&[name, "processing"]).dec();
}

pub(crate) fn job_terminal(name: &str, status: JobStatus, duration_secs: f64) {
    JOBS_TOTAL.with_label_values(&[name, status.as_str()]).inc();
    JOBS_DURATION_SECONDS
        .with_label_values(&[name, status.as_str()])
        .observe(duration_secs);
}

pub(crate) fn job_retried(name: &str) {
    JOBS_TOTAL
        .with_label_values(&[name, JobStatus::Retried.as_str()])
        .inc();
}

pub(crate) fn observe_queued_wait(name: &str, wait_secs: f64) {
    JOBS_QUEUED_FOR_DURATION_SECONDS
        .with_label_values(&[name])
        .observe(wait_secs.max(0.0));
}

pub(crate) fn set_worker_count(count: usize) {
    WORKERS.set(count as i64);
}

pub(crate) fn driver_error(op: &str) {
    DRIVER_ERRORS_TOTAL.with_label_values(&[op]).inc();
}
