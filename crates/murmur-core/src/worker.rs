//! Batch worker: claims a batch of jobs and drives each one to a terminal state.
//!
//! # Architecture
//!
//! ```text
//! run_batch(n):
//!     1. Claim up to n jobs atomically (retried on transient store errors)
//!     2. For each job, in claim order:
//!        a. process_item with a hard timeout, retried on transient errors
//!        b. completed on success, failed (+1 attempt, last_error) otherwise
//!        c. pause inter_item_delay before the next job
//!     3. Return a BatchReport for the adaptive controller
//! ```
//!
//! A job never stays `processing` after [`BatchWorker::process`] returns unless
//! the store itself is unreachable, in which case the orphan reaper picks it up.
//! Panics inside the processor are caught and recorded as failures.
//!
//! # Graceful Shutdown
//!
//! When the cancellation token fires mid-batch, jobs that have not started yet
//! are released back to `pending` with their attempts untouched.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::time::{Duration, Instant};

use futures::FutureExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::adaptive::BatchPerformance;
use crate::config::{env_millis, env_or, env_secs};
use crate::error::{AppError, ErrorClass};
use crate::job::Job;
use crate::job_queue::JobQueue;
use crate::retry::{RetryPolicy, with_retry, with_retry_notify};
use crate::traits::ContentProcessor;

// =============================================================================
// Configuration
// =============================================================================

/// Worker configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Pause between two items of the same batch.
    pub inter_item_delay: Duration,
    /// Hard timeout of a single `process_item` call.
    pub item_timeout: Duration,
    /// Retry policy around `process_item`.
    pub item_retry: RetryPolicy,
    /// Retry policy around claim and status updates.
    pub store_retry: RetryPolicy,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            inter_item_delay: Duration::from_millis(250),
            item_timeout: Duration::from_secs(240),
            item_retry: RetryPolicy::default().with_max_attempts(2),
            store_retry: RetryPolicy::database(),
        }
    }
}

impl WorkerConfig {
    /// Defaults with `MURMUR_WORKER_*` overrides.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            inter_item_delay: env_millis(
                "MURMUR_WORKER_ITEM_DELAY_MS",
                defaults.inter_item_delay,
            ),
            item_timeout: env_secs("MURMUR_WORKER_ITEM_TIMEOUT_SECS", defaults.item_timeout),
            item_retry: defaults.item_retry.with_max_attempts(env_or(
                "MURMUR_WORKER_ITEM_ATTEMPTS",
                2,
            )),
            store_retry: defaults.store_retry,
        }
    }

    pub fn with_inter_item_delay(mut self, delay: Duration) -> Self {
        self.inter_item_delay = delay;
        self
    }

    pub fn with_item_timeout(mut self, timeout: Duration) -> Self {
        self.item_timeout = timeout;
        self
    }

    pub fn with_item_retry(mut self, policy: RetryPolicy) -> Self {
        self.item_retry = policy;
        self
    }

    pub fn with_store_retry(mut self, policy: RetryPolicy) -> Self {
        self.store_retry = policy;
        self
    }
}

// =============================================================================
// Worker Events
// =============================================================================

/// Events emitted by the worker during operation.
#[derive(Debug)]
pub enum WorkerEvent<'a> {
    /// A batch claimed its jobs.
    BatchClaimed { batch_size: usize, claimed: usize },
    /// The claim itself failed after retries.
    ClaimFailed { batch_size: usize, error: &'a AppError },
    /// Job processing started.
    JobStarted { job: &'a Job },
    /// Job completed successfully.
    JobCompleted { job_id: Uuid, elapsed: Duration },
    /// Job was marked failed.
    JobFailed {
        job_id: Uuid,
        attempts: u32,
        batch_size: usize,
        error: &'a AppError,
    },
    /// Job was handed back to the queue untouched.
    JobReleased { job_id: Uuid },
    /// The store rejected the final status update; the reaper will recover the job.
    FinalizeFailed { job_id: Uuid, error: &'a AppError },
    /// The batch finished.
    BatchFinished { report: &'a BatchReport },
}

// =============================================================================
// Worker Reporter Trait
// =============================================================================

/// Trait for reporting worker events.
pub trait WorkerReporter: Send + Sync {
    /// Called when a worker event occurs.
    ///
    /// The default implementation does nothing (silent mode).
    fn report(&self, event: WorkerEvent<'_>) {
        let _ = event;
    }
}

/// Silent worker reporter that ignores all events.
#[derive(Debug, Default, Clone, Copy)]
pub struct SilentWorkerReporter;

impl WorkerReporter for SilentWorkerReporter {}

/// Tracing-based worker reporter for CLI logging.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingWorkerReporter;

impl WorkerReporter for TracingWorkerReporter {
    fn report(&self, event: WorkerEvent<'_>) {
        match event {
            WorkerEvent::BatchClaimed {
                batch_size,
                claimed,
            } => {
                debug!(batch_size, claimed, "Batch claimed");
            }
            WorkerEvent::ClaimFailed { batch_size, error } => {
                error!(batch_size, %error, "Failed to claim batch");
            }
            WorkerEvent::JobStarted { job } => {
                debug!(
                    job_id = %job.id,
                    record_id = %job.record_id,
                    kind = %job.record_kind,
                    priority = job.priority,
                    "Processing job"
                );
            }
            WorkerEvent::JobCompleted { job_id, elapsed } => {
                debug!(%job_id, elapsed_ms = elapsed.as_millis() as u64, "Job completed");
            }
            WorkerEvent::JobFailed {
                job_id,
                attempts,
                batch_size,
                error,
            } => {
                warn!(%job_id, attempts, batch_size, class = error.class().label(), %error, "Job failed");
            }
            WorkerEvent::JobReleased { job_id } => {
                info!(%job_id, "Job released back to queue");
            }
            WorkerEvent::FinalizeFailed { job_id, error } => {
                error!(%job_id, %error, "Failed to record job outcome");
            }
            WorkerEvent::BatchFinished { report } => {
                info!(
                    batch_size = report.batch_size,
                    claimed = report.claimed,
                    completed = report.completed,
                    failed = report.failed,
                    released = report.released,
                    elapsed_ms = report.duration().as_millis() as u64,
                    "Batch finished"
                );
            }
        }
    }
}

// =============================================================================
// Batch report
// =============================================================================

/// Result of one claim-and-process batch.
#[derive(Debug)]
pub struct BatchReport {
    pub batch_size: usize,
    pub claimed: usize,
    pub completed: usize,
    pub failed: usize,
    /// Jobs handed back to `pending` because of cancellation or a fatal error.
    pub released: usize,
    /// An item hit its hard timeout at least once.
    pub timed_out: bool,
    /// The claim failed after retries; nothing was processed.
    pub claim_failed: bool,
    /// Non-fatal error behind a failed claim.
    pub claim_error: Option<AppError>,
    /// Class of the first error seen.
    pub error_class: Option<ErrorClass>,
    /// A process-level error that must stop the run.
    pub fatal: Option<AppError>,
    pub started_at: Instant,
    pub finished_at: Instant,
}

impl BatchReport {
    fn new(batch_size: usize, started_at: Instant) -> Self {
        Self {
            batch_size,
            claimed: 0,
            completed: 0,
            failed: 0,
            released: 0,
            timed_out: false,
            claim_failed: false,
            claim_error: None,
            error_class: None,
            fatal: None,
            started_at,
            finished_at: started_at,
        }
    }

    pub fn duration(&self) -> Duration {
        self.finished_at.saturating_duration_since(self.started_at)
    }

    /// Jobs this batch moved to a terminal state.
    pub fn processed(&self) -> usize {
        self.completed + self.failed
    }

    /// Claim succeeded, nothing timed out and fewer than half the jobs failed.
    pub fn is_success(&self) -> bool {
        !self.claim_failed
            && self.fatal.is_none()
            && !self.timed_out
            && self.failed * 2 < self.claimed.max(1)
    }

    /// Converts the report into a controller sample.
    ///
    /// Returns `None` for an empty claim, which says nothing about the downstream.
    pub fn performance(&self) -> Option<BatchPerformance> {
        if self.claimed == 0 && !self.claim_failed {
            return None;
        }
        Some(BatchPerformance {
            batch_size: self.batch_size,
            records_processed: self.processed(),
            records_failed: self.failed,
            started_at: self.started_at,
            finished_at: self.finished_at,
            success: self.is_success(),
            error_class: self.error_class,
            timed_out: self.timed_out,
            tokens_estimate: None,
        })
    }

    fn note_error(&mut self, error: &AppError) {
        if self.error_class.is_none() {
            self.error_class = Some(error.class());
        }
        if error.is_timeout() {
            self.timed_out = true;
        }
    }
}

/// Outcome of one `process_item` call, retries included.
struct ItemResult {
    result: Result<(), AppError>,
    timed_out: bool,
}

// =============================================================================
// Batch Worker
// =============================================================================

/// Claims batches and processes their jobs one by one.
#[derive(Clone)]
pub struct BatchWorker<Q, P>
where
    Q: JobQueue,
    P: ContentProcessor,
{
    queue: Q,
    processor: P,
    config: WorkerConfig,
}

impl<Q, P> BatchWorker<Q, P>
where
    Q: JobQueue,
    P: ContentProcessor,
{
    pub fn new(queue: Q, processor: P, config: WorkerConfig) -> Self {
        Self {
            queue,
            processor,
            config,
        }
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    /// Processes one claimed job and records its terminal status.
    ///
    /// Returns the processing error, if any, after the job has been marked failed.
    pub async fn process(&self, job: &Job) -> Result<(), AppError> {
        let mut report = BatchReport::new(1, Instant::now());
        self.process_job(job, 1, &mut report, &SilentWorkerReporter)
            .await
    }

    /// Claims up to `batch_size` jobs and processes them sequentially.
    pub async fn run_batch<R>(
        &self,
        batch_size: usize,
        cancel: &CancellationToken,
        reporter: &R,
    ) -> BatchReport
    where
        R: WorkerReporter,
    {
        let mut report = BatchReport::new(batch_size, Instant::now());

        let claimed = with_retry(&self.config.store_retry, || {
            self.queue.claim_batch(batch_size)
        })
        .await;
        let jobs = match claimed {
            Ok(jobs) => jobs,
            Err(e) => {
                reporter.report(WorkerEvent::ClaimFailed {
                    batch_size,
                    error: &e,
                });
                report.claim_failed = true;
                report.note_error(&e);
                if e.is_fatal() {
                    report.fatal = Some(e);
                } else {
                    report.claim_error = Some(e);
                }
                report.finished_at = Instant::now();
                return report;
            }
        };

        report.claimed = jobs.len();
        reporter.report(WorkerEvent::BatchClaimed {
            batch_size,
            claimed: jobs.len(),
        });

        for (index, job) in jobs.iter().enumerate() {
            if index > 0 && !self.config.inter_item_delay.is_zero() {
                tokio::select! {
                    _ = tokio::time::sleep(self.config.inter_item_delay) => {}
                    _ = cancel.cancelled() => {}
                }
            }
            if cancel.is_cancelled() || report.fatal.is_some() {
                self.release_all(&jobs[index..], &mut report, reporter)
                    .await;
                break;
            }

            if let Err(e) = self
                .process_job(job, batch_size, &mut report, reporter)
                .await
            {
                if e.is_fatal() {
                    report.fatal = Some(e);
                }
            }
        }

        report.finished_at = Instant::now();
        reporter.report(WorkerEvent::BatchFinished { report: &report });
        report
    }

    async fn process_job<R>(
        &self,
        job: &Job,
        batch_size: usize,
        report: &mut BatchReport,
        reporter: &R,
    ) -> Result<(), AppError>
    where
        R: WorkerReporter,
    {
        reporter.report(WorkerEvent::JobStarted { job });
        let started = Instant::now();

        let item = self.run_item(job).await;
        if item.timed_out {
            report.timed_out = true;
        }

        match item.result {
            Ok(()) => {
                let finalize = with_retry(&self.config.store_retry, || {
                    self.queue.complete_job(job.id)
                })
                .await;
                match finalize {
                    Ok(()) => {
                        report.completed += 1;
                        reporter.report(WorkerEvent::JobCompleted {
                            job_id: job.id,
                            elapsed: started.elapsed(),
                        });
                        Ok(())
                    }
                    Err(e) => {
                        reporter.report(WorkerEvent::FinalizeFailed {
                            job_id: job.id,
                            error: &e,
                        });
                        report.failed += 1;
                        report.note_error(&e);
                        Err(e)
                    }
                }
            }
            Err(e) if e.is_fatal() => {
                // Not the job's fault: hand it back instead of burning an attempt.
                report.note_error(&e);
                self.release_one(job.id, report, reporter).await;
                Err(e)
            }
            Err(e) => {
                report.note_error(&e);
                let message = e.job_message();
                let finalize = with_retry(&self.config.store_retry, || {
                    self.queue.fail_job(job.id, &message)
                })
                .await;
                report.failed += 1;
                match finalize {
                    Ok(()) => reporter.report(WorkerEvent::JobFailed {
                        job_id: job.id,
                        attempts: job.attempts + 1,
                        batch_size,
                        error: &e,
                    }),
                    Err(store_err) => reporter.report(WorkerEvent::FinalizeFailed {
                        job_id: job.id,
                        error: &store_err,
                    }),
                }
                Err(e)
            }
        }
    }

    /// Runs the processor under timeout, retry and panic capture.
    async fn run_item(&self, job: &Job) -> ItemResult {
        let mut timed_out = false;
        let timeout = self.config.item_timeout;

        let result = with_retry_notify(
            &self.config.item_retry,
            AppError::is_retryable,
            |_, err: &AppError, _| {
                if err.is_timeout() {
                    timed_out = true;
                }
            },
            || async move {
                let call = AssertUnwindSafe(
                    self.processor
                        .process_item(&job.record_id, &job.record_kind),
                )
                .catch_unwind();
                match tokio::time::timeout(timeout, call).await {
                    Err(_) => Err(AppError::timeout(timeout.as_secs())),
                    Ok(Err(panic)) => Err(AppError::permanent(format!(
                        "processor panicked: {}",
                        panic_message(panic.as_ref())
                    ))),
                    Ok(Ok(result)) => result,
                }
            },
        )
        .await;

        if result.as_ref().is_err_and(AppError::is_timeout) {
            timed_out = true;
        }
        ItemResult { result, timed_out }
    }

    async fn release_one<R>(&self, job_id: Uuid, report: &mut BatchReport, reporter: &R)
    where
        R: WorkerReporter,
    {
        match with_retry(&self.config.store_retry, || self.queue.release_job(job_id)).await {
            Ok(()) => {
                report.released += 1;
                reporter.report(WorkerEvent::JobReleased { job_id });
            }
            Err(e) => reporter.report(WorkerEvent::FinalizeFailed {
                job_id,
                error: &e,
            }),
        }
    }

    async fn release_all<R>(&self, jobs: &[Job], report: &mut BatchReport, reporter: &R)
    where
        R: WorkerReporter,
    {
        for job in jobs {
            self.release_one(job.id, report, reporter).await;
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
