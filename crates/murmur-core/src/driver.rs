//! Queue driver: runs the queue until every pending job has been processed.
//!
//! # State machine
//!
//! ```text
//! INIT   reap orphans, snapshot queue stats
//! LOOP   recommend settings
//!        → launch `parallelism` batches (staggered), join them
//!        → feed outcomes to the adaptive controller
//!        → report progress / ETA
//!        → pause (scaled by consecutive failures)
//!        → reap orphans when due
//!        until no pending job is claimable
//! DRAIN  poll until nothing is `processing` (reaping when due)
//! DONE   optional terminal pruning, final statistics
//! ```
//!
//! Job failures never stop the loop. Fatal errors (bad credentials, broken
//! configuration) do, and so does a store that keeps failing. Cancellation
//! stops launching new work; in-flight batches release their unstarted jobs and
//! the summary is still returned. An aborted run returns [`RunAborted`], which
//! keeps the partial summary.

use std::time::{Duration, Instant};

use futures::future::join_all;
use serde::Serialize;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::adaptive::{
    AdaptiveConfig, AdaptiveController, ControllerState, OptimalSettings, Recommendation,
};
use crate::config::{env_or, env_secs};
use crate::error::AppError;
use crate::job::{JobStatus, QueueStats};
use crate::job_queue::JobQueue;
use crate::progress::{DriverEvent, Progress, ProgressReporter};
use crate::reaper::{DEFAULT_MAX_PROCESSING, OrphanReaper, ReapSchedule};
use crate::retry::{RetryPolicy, with_retry};
use crate::traits::ContentProcessor;
use crate::worker::{BatchReport, BatchWorker, WorkerConfig, WorkerReporter};

// =============================================================================
// Configuration
// =============================================================================

/// Driver configuration.
#[derive(Debug, Clone)]
pub struct DriverConfig {
    /// Initial batch size.
    pub batch_size: usize,
    /// Initial number of concurrent batches.
    pub parallelism: usize,
    pub adaptive: AdaptiveConfig,
    pub worker: WorkerConfig,
    /// Base pause between rounds; multiplied by `1 + consecutive failures`.
    pub round_pause: Duration,
    /// Pause used once `hard_pause_after` consecutive batches failed.
    pub hard_pause: Duration,
    pub hard_pause_after: u32,
    /// Start offset between batches of one round, multiplied by the batch index.
    pub stagger: Duration,
    pub reap_every_rounds: u64,
    pub reap_interval: Duration,
    /// `processing` age after which a job counts as orphaned.
    pub max_processing: Duration,
    pub drain_poll: Duration,
    /// Consecutive failed store calls after which the run gives up.
    pub max_store_errors: u32,
    /// Keep only this many terminal jobs once the run is done.
    pub prune_keep: Option<u64>,
    pub store_retry: RetryPolicy,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            batch_size: 20,
            parallelism: 1,
            adaptive: AdaptiveConfig::default(),
            worker: WorkerConfig::default(),
            round_pause: Duration::from_secs(1),
            hard_pause: Duration::from_secs(120),
            hard_pause_after: 5,
            stagger: Duration::from_secs(2),
            reap_every_rounds: 10,
            reap_interval: Duration::from_secs(5 * 60),
            max_processing: DEFAULT_MAX_PROCESSING,
            drain_poll: Duration::from_secs(5),
            max_store_errors: 10,
            prune_keep: None,
            store_retry: RetryPolicy::database(),
        }
    }
}

impl DriverConfig {
    /// Defaults with `MURMUR_*` overrides for the driver, worker and controller.
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            batch_size: env_or("MURMUR_BATCH_SIZE", d.batch_size),
            parallelism: env_or("MURMUR_PARALLELISM", d.parallelism),
            adaptive: AdaptiveConfig::from_env(),
            worker: WorkerConfig::from_env(),
            round_pause: env_secs("MURMUR_ROUND_PAUSE_SECS", d.round_pause),
            hard_pause: env_secs("MURMUR_HARD_PAUSE_SECS", d.hard_pause),
            hard_pause_after: env_or("MURMUR_HARD_PAUSE_AFTER", d.hard_pause_after),
            stagger: env_secs("MURMUR_STAGGER_SECS", d.stagger),
            reap_every_rounds: env_or("MURMUR_REAP_EVERY_ROUNDS", d.reap_every_rounds),
            reap_interval: env_secs("MURMUR_REAP_INTERVAL_SECS", d.reap_interval),
            max_processing: env_secs("MURMUR_MAX_PROCESSING_SECS", d.max_processing),
            drain_poll: env_secs("MURMUR_DRAIN_POLL_SECS", d.drain_poll),
            max_store_errors: env_or("MURMUR_MAX_STORE_ERRORS", d.max_store_errors),
            prune_keep: std::env::var("MURMUR_PRUNE_KEEP")
                .ok()
                .and_then(|v| v.parse().ok()),
            store_retry: d.store_retry,
        }
    }

    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size.max(1);
        self
    }

    pub fn with_parallelism(mut self, parallelism: usize) -> Self {
        self.parallelism = parallelism.max(1);
        self
    }

    pub fn with_adaptive(mut self, adaptive: AdaptiveConfig) -> Self {
        self.adaptive = adaptive;
        self
    }

    pub fn with_worker(mut self, worker: WorkerConfig) -> Self {
        self.worker = worker;
        self
    }

    pub fn with_round_pause(mut self, pause: Duration) -> Self {
        self.round_pause = pause;
        self
    }

    pub fn with_hard_pause(mut self, pause: Duration) -> Self {
        self.hard_pause = pause;
        self
    }

    pub fn with_stagger(mut self, stagger: Duration) -> Self {
        self.stagger = stagger;
        self
    }

    pub fn with_drain_poll(mut self, poll: Duration) -> Self {
        self.drain_poll = poll;
        self
    }

    pub fn with_max_processing(mut self, max: Duration) -> Self {
        self.max_processing = max;
        self
    }

    pub fn with_prune_keep(mut self, keep: Option<u64>) -> Self {
        self.prune_keep = keep;
        self
    }

    pub fn with_store_retry(mut self, policy: RetryPolicy) -> Self {
        self.store_retry = policy;
        self
    }

    /// Pause before the next round given the current failure streak.
    pub fn pause_for(&self, consecutive_failures: u32) -> Duration {
        if consecutive_failures >= self.hard_pause_after {
            return self.hard_pause;
        }
        self.round_pause
            .saturating_mul(consecutive_failures.saturating_add(1))
    }
}

// =============================================================================
// Run summary
// =============================================================================

/// Final statistics of a driver run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunSummary {
    /// Jobs this run completed.
    pub completed: u64,
    /// Jobs this run marked failed.
    pub failed: u64,
    /// Jobs handed back to the queue (cancellation or fatal error).
    pub released: u64,
    /// Orphans reclaimed during the run.
    pub reclaimed: u64,
    /// Terminal jobs pruned at the end.
    pub pruned: u64,
    pub initial_pending: u64,
    pub rounds: u64,
    pub batches: u64,
    pub elapsed: Duration,
    pub final_batch_size: usize,
    pub final_parallelism: usize,
    /// Settings with the best observed throughput.
    pub optimal: Option<OptimalSettings>,
    /// Queue state after the run.
    pub final_stats: QueueStats,
    /// The run stopped because it was cancelled.
    pub interrupted: bool,
}

impl RunSummary {
    pub fn processed(&self) -> u64 {
        self.completed + self.failed
    }

    /// Fraction of processed jobs that completed; 1.0 when nothing ran.
    pub fn success_rate(&self) -> f64 {
        let processed = self.processed();
        if processed == 0 {
            return 1.0;
        }
        self.completed as f64 / processed as f64
    }
}

/// A run stopped by a fatal error or a store that kept failing.
///
/// Carries the statistics gathered up to that point.
#[derive(Debug, Error)]
#[error("queue run aborted: {error}")]
pub struct RunAborted {
    pub error: AppError,
    pub summary: Box<RunSummary>,
}

// =============================================================================
// Queue Driver
// =============================================================================

/// Top-level loop over the job queue.
pub struct QueueDriver<Q, P>
where
    Q: JobQueue,
    P: ContentProcessor,
{
    queue: Q,
    worker: BatchWorker<Q, P>,
    reaper: OrphanReaper<Q>,
    controller: AdaptiveController,
    config: DriverConfig,
}

/// Where the loop is in its state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Loop,
    Drain,
}

impl<Q, P> QueueDriver<Q, P>
where
    Q: JobQueue,
    P: ContentProcessor,
{
    pub fn new(queue: Q, processor: P, config: DriverConfig) -> Self {
        let adaptive = config
            .adaptive
            .clone()
            .admitting(config.batch_size, config.parallelism);
        Self {
            worker: BatchWorker::new(queue.clone(), processor, config.worker.clone()),
            reaper: OrphanReaper::new(queue.clone(), config.max_processing)
                .with_retry(config.store_retry.clone()),
            controller: AdaptiveController::new(adaptive),
            queue,
            config,
        }
    }

    pub fn config(&self) -> &DriverConfig {
        &self.config
    }

    /// Runs INIT → LOOP → DRAIN → DONE and returns the final statistics.
    ///
    /// Job failures are counted, not returned. A fatal error or a store that
    /// keeps failing aborts the run; the error then carries the statistics
    /// gathered so far.
    pub async fn run<PR, WR>(
        &self,
        cancel: CancellationToken,
        progress: &PR,
        worker_reporter: &WR,
    ) -> Result<RunSummary, RunAborted>
    where
        PR: ProgressReporter,
        WR: WorkerReporter,
    {
        let started = Instant::now();
        let mut summary = RunSummary::default();
        let mut state = self
            .controller
            .initial_state(self.config.batch_size, self.config.parallelism);

        let outcome = self
            .drive(
                &mut summary,
                &mut state,
                started,
                &cancel,
                progress,
                worker_reporter,
            )
            .await;

        summary.interrupted = cancel.is_cancelled();
        summary.final_stats = self.stats().await.unwrap_or_default();
        summary.elapsed = started.elapsed();
        summary.final_batch_size = state.batch_size();
        summary.final_parallelism = state.parallelism();
        summary.optimal = state.best();

        progress.report(DriverEvent::Finished { summary: &summary });
        match outcome {
            Ok(()) => Ok(summary),
            Err(error) => Err(RunAborted {
                error,
                summary: Box::new(summary),
            }),
        }
    }

    async fn drive<PR, WR>(
        &self,
        summary: &mut RunSummary,
        state: &mut ControllerState,
        started: Instant,
        cancel: &CancellationToken,
        progress: &PR,
        worker_reporter: &WR,
    ) -> Result<(), AppError>
    where
        PR: ProgressReporter,
        WR: WorkerReporter,
    {
        // INIT: repair what a crashed run left behind.
        summary.reclaimed += self.reap(progress).await?;
        let mut schedule = ReapSchedule::new(
            self.config.reap_every_rounds,
            self.config.reap_interval,
            Instant::now(),
        );

        let initial = self.stats().await?;
        summary.initial_pending = initial.pending;
        progress.report(DriverEvent::Started { stats: &initial });

        let mut phase = Phase::Loop;
        let mut store_errors = 0u32;

        while !cancel.is_cancelled() {
            let stats = match self.stats().await {
                Ok(stats) => stats,
                Err(e) => {
                    self.on_store_error(e, &mut store_errors, progress)?;
                    self.sleep(self.config.pause_for(store_errors), cancel).await;
                    continue;
                }
            };

            if phase == Phase::Loop && stats.pending == 0 {
                phase = Phase::Drain;
            }

            match phase {
                Phase::Loop => {
                    summary.rounds += 1;
                    let reports = self.run_round(state, cancel, worker_reporter).await;

                    let mut claimed = 0usize;
                    let mut fatal = None;
                    let mut claim_error = None;
                    for report in reports {
                        summary.batches += 1;
                        claimed += report.claimed;
                        summary.completed += report.completed as u64;
                        summary.failed += report.failed as u64;
                        summary.released += report.released as u64;
                        if let Some(perf) = report.performance() {
                            self.controller.record_outcome(state, perf);
                        }
                        if fatal.is_none() {
                            fatal = report.fatal;
                        }
                        if claim_error.is_none() {
                            claim_error = report.claim_error;
                        }
                    }
                    if let Some(e) = fatal {
                        return Err(e);
                    }

                    let remaining = match self.queue.count_by_status(JobStatus::Pending).await {
                        Ok(remaining) => remaining,
                        Err(e) => {
                            progress.report(DriverEvent::LoopError { error: &e });
                            stats.pending
                        }
                    };
                    let snapshot = Progress::compute(
                        summary.initial_pending,
                        summary.completed,
                        summary.failed,
                        remaining,
                        started.elapsed(),
                        self.current_settings(state),
                    );
                    progress.report(DriverEvent::RoundFinished {
                        round: summary.rounds,
                        progress: &snapshot,
                    });

                    match claim_error {
                        // Every claim failed: the pending jobs are still there.
                        Some(e) if claimed == 0 => {
                            self.on_store_error(e, &mut store_errors, progress)?
                        }
                        // Pending jobs remain but none is claimable (cooldown,
                        // or another host got them first).
                        None if claimed == 0 => {
                            store_errors = 0;
                            phase = Phase::Drain;
                            continue;
                        }
                        _ => store_errors = 0,
                    }

                    let delay = self.config.pause_for(state.consecutive_failures());
                    progress.report(DriverEvent::Pausing {
                        delay,
                        consecutive_failures: state.consecutive_failures(),
                    });
                    self.sleep(delay, cancel).await;
                }
                Phase::Drain => {
                    store_errors = 0;
                    if stats.processing == 0 {
                        break;
                    }
                    progress.report(DriverEvent::Draining {
                        processing: stats.processing,
                    });
                    self.sleep(self.config.drain_poll, cancel).await;
                }
            }

            if schedule.is_due(summary.rounds, Instant::now()) {
                let reclaimed = self.reap(progress).await?;
                schedule.mark(summary.rounds, Instant::now());
                if reclaimed > 0 {
                    // Reclaimed jobs are pending again and need another round.
                    summary.reclaimed += reclaimed;
                    phase = Phase::Loop;
                }
            }
        }

        // DONE
        if !cancel.is_cancelled() {
            if let Some(keep) = self.config.prune_keep {
                summary.pruned =
                    with_retry(&self.config.store_retry, || self.queue.prune_terminal(keep))
                        .await?;
                info!(pruned = summary.pruned, keep, "Pruned terminal jobs");
            }
        }
        Ok(())
    }

    /// Launches one round of staggered, concurrent batches and joins them.
    async fn run_round<WR>(
        &self,
        state: &mut ControllerState,
        cancel: &CancellationToken,
        worker_reporter: &WR,
    ) -> Vec<BatchReport>
    where
        WR: WorkerReporter,
    {
        let rec = self.controller.recommend(state, Instant::now());
        let stagger = self.config.stagger;

        let batches = (0..rec.parallelism).map(move |index| async move {
            if index > 0 && !stagger.is_zero() {
                tokio::select! {
                    _ = tokio::time::sleep(stagger.saturating_mul(index as u32)) => {}
                    _ = cancel.cancelled() => return None,
                }
            }
            if cancel.is_cancelled() {
                return None;
            }
            Some(
                self.worker
                    .run_batch(rec.batch_size, cancel, worker_reporter)
                    .await,
            )
        });

        join_all(batches).await.into_iter().flatten().collect()
    }

    fn current_settings(&self, state: &ControllerState) -> Recommendation {
        Recommendation {
            batch_size: state.batch_size(),
            parallelism: state.parallelism(),
            panic: state.in_panic(),
        }
    }

    async fn stats(&self) -> Result<QueueStats, AppError> {
        with_retry(&self.config.store_retry, || self.queue.queue_stats()).await
    }

    async fn reap<PR: ProgressReporter>(&self, progress: &PR) -> Result<u64, AppError> {
        match self.reaper.reap().await {
            Ok(reclaimed) => {
                progress.report(DriverEvent::Reaped { reclaimed });
                Ok(reclaimed)
            }
            Err(e) if e.is_fatal() => Err(e),
            Err(e) => {
                progress.report(DriverEvent::LoopError { error: &e });
                Ok(0)
            }
        }
    }

    fn on_store_error<PR: ProgressReporter>(
        &self,
        error: AppError,
        store_errors: &mut u32,
        progress: &PR,
    ) -> Result<(), AppError> {
        progress.report(DriverEvent::LoopError { error: &error });
        *store_errors += 1;
        if error.is_fatal() || *store_errors >= self.config.max_store_errors {
            return Err(error);
        }
        Ok(())
    }

    async fn sleep(&self, delay: Duration, cancel: &CancellationToken) {
        if delay.is_zero() {
            return;
        }
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = cancel.cancelled() => {}
        }
    }
}
