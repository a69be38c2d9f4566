//! Job queue trait for abstracting job persistence.
//!
//! This module provides the [`JobQueue`] trait that abstracts the durable job
//! record store, enabling different storage backends (PostgreSQL, in-memory for
//! tests) and facilitating dependency injection in the producer, worker and driver.

use std::future::Future;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::AppError;
use crate::job::{Job, JobStatus, NewJob, QueueStats, RecordKind};

/// Trait for job queue persistence operations.
///
/// # Implementation Notes
///
/// Implementations must ensure:
/// - `claim_batch` selects and marks jobs `processing` in one atomic step
///   (`UPDATE … WHERE id IN (SELECT … FOR UPDATE SKIP LOCKED)` semantics), so
///   concurrent claimers never return overlapping jobs
/// - at most one non-terminal job exists per `(record_id, record_kind)`
/// - every operation is safe to retry
pub trait JobQueue: Send + Sync + Clone {
    /// Insert a pending job unless a non-terminal job already exists for the
    /// same `(record_id, record_kind)`.
    ///
    /// Returns the created job, or `None` when it was deduplicated.
    fn insert_if_absent(
        &self,
        job: NewJob,
    ) -> impl Future<Output = Result<Option<Job>, AppError>> + Send;

    /// Latest `processed_at` of a completed job for the given record, if any.
    fn last_processed_at(
        &self,
        record_id: &str,
        record_kind: &RecordKind,
    ) -> impl Future<Output = Result<Option<DateTime<Utc>>, AppError>> + Send;

    /// Atomically claim up to `limit` claimable jobs.
    ///
    /// Jobs are claimed in order of priority (highest first), then creation
    /// time (oldest first). Jobs whose cooldown has not expired are skipped.
    /// Claimed jobs are moved to `processing` with `processed_at = now`.
    ///
    /// Returns an empty vector if no jobs are available.
    fn claim_batch(&self, limit: usize)
    -> impl Future<Output = Result<Vec<Job>, AppError>> + Send;

    /// Mark a job as completed.
    ///
    /// Only a `processing` job can be finalized; otherwise the claim was lost
    /// and [`AppError::ClaimLost`] is returned without touching the job.
    fn complete_job(&self, job_id: Uuid) -> impl Future<Output = Result<(), AppError>> + Send;

    /// Mark a job as failed, increment `attempts` and record the error.
    ///
    /// Same `processing` guard as [`JobQueue::complete_job`].
    fn fail_job(
        &self,
        job_id: Uuid,
        error: &str,
    ) -> impl Future<Output = Result<(), AppError>> + Send;

    /// Release a job back to pending state without touching `attempts`.
    ///
    /// Used when a worker needs to give up a job (e.g., during shutdown).
    /// Only affects jobs in `processing` status.
    fn release_job(&self, job_id: Uuid) -> impl Future<Output = Result<(), AppError>> + Send;

    /// Reset every `processing` job whose `processed_at` (or `created_at` when
    /// unset) is older than `older_than` back to `pending`.
    ///
    /// `attempts` is preserved. Returns the number of jobs reclaimed.
    fn reclaim_stuck(
        &self,
        older_than: DateTime<Utc>,
    ) -> impl Future<Output = Result<u64, AppError>> + Send;

    /// Get count of jobs by status.
    fn count_by_status(
        &self,
        status: JobStatus,
    ) -> impl Future<Output = Result<u64, AppError>> + Send;

    /// Get counts for every status at once.
    fn queue_stats(&self) -> impl Future<Output = Result<QueueStats, AppError>> + Send;

    /// Delete the lowest-priority, oldest `pending` jobs until the non-terminal
    /// count is at most `max_non_terminal`.
    ///
    /// Returns the number of jobs deleted.
    fn trim_surplus(
        &self,
        max_non_terminal: u64,
    ) -> impl Future<Output = Result<u64, AppError>> + Send;

    /// Delete all but the `keep` most recent terminal jobs.
    fn prune_terminal(&self, keep: u64) -> impl Future<Output = Result<u64, AppError>> + Send;

    /// Delete every `pending` and `processing` job.
    fn clear_non_terminal(&self) -> impl Future<Output = Result<u64, AppError>> + Send;

    /// Reset terminal jobs back to `pending`, clearing `last_error`.
    ///
    /// Records that already have a non-terminal job are left alone, and only
    /// the newest terminal job per record is reset.
    fn reset_terminal(&self) -> impl Future<Output = Result<u64, AppError>> + Send;

    /// Reset `failed` jobs with `attempts < max_attempts` back to `pending`.
    fn requeue_failed(
        &self,
        max_attempts: u32,
    ) -> impl Future<Output = Result<u64, AppError>> + Send;

    /// Get a job by ID.
    fn get_job(&self, job_id: Uuid)
    -> impl Future<Output = Result<Option<Job>, AppError>> + Send;

    /// List jobs with optional status filter.
    ///
    /// Results are ordered by creation time (newest first).
    fn list_jobs(
        &self,
        status: Option<JobStatus>,
        limit: usize,
    ) -> impl Future<Output = Result<Vec<Job>, AppError>> + Send;
}
