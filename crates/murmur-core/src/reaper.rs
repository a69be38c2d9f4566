//! Orphan reaper: puts jobs stuck in `processing` back into the queue.
//!
//! A job is stuck when it has been `processing` longer than the threshold,
//! which means its worker crashed or hung. Reclaiming keeps `attempts` as is;
//! a stuck job has not necessarily failed.

use std::time::{Duration, Instant};

use chrono::{TimeDelta, Utc};
use tracing::{info, warn};

use crate::error::AppError;
use crate::job_queue::JobQueue;
use crate::retry::{RetryPolicy, with_retry};

/// Default threshold after which a `processing` job counts as orphaned.
pub const DEFAULT_MAX_PROCESSING: Duration = Duration::from_secs(30 * 60);

/// Reclaims orphaned jobs.
#[derive(Debug, Clone)]
pub struct OrphanReaper<Q: JobQueue> {
    queue: Q,
    max_processing: Duration,
    retry: RetryPolicy,
}

impl<Q: JobQueue> OrphanReaper<Q> {
    pub fn new(queue: Q, max_processing: Duration) -> Self {
        Self {
            queue,
            max_processing,
            retry: RetryPolicy::database(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn max_processing(&self) -> Duration {
        self.max_processing
    }

    /// Reclaims jobs older than the configured threshold.
    pub async fn reap(&self) -> Result<u64, AppError> {
        self.reclaim_stuck(self.max_processing).await
    }

    /// Reclaims every job that has been `processing` longer than `max_processing`.
    pub async fn reclaim_stuck(&self, max_processing: Duration) -> Result<u64, AppError> {
        let older_than = TimeDelta::from_std(max_processing)
            .ok()
            .and_then(|age| Utc::now().checked_sub_signed(age))
            .ok_or_else(|| {
                AppError::ConfigError(format!(
                    "reap threshold of {}s is out of range",
                    max_processing.as_secs()
                ))
            })?;

        let reclaimed = with_retry(&self.retry, || self.queue.reclaim_stuck(older_than)).await?;
        if reclaimed > 0 {
            warn!(
                reclaimed,
                max_processing_secs = max_processing.as_secs(),
                "Reclaimed orphaned jobs"
            );
        } else {
            info!("No orphaned jobs found");
        }
        Ok(reclaimed)
    }
}

/// Decides when the driver runs the reaper again: every `every_rounds` rounds
/// or once `interval` has elapsed, whichever comes first.
#[derive(Debug, Clone)]
pub struct ReapSchedule {
    every_rounds: u64,
    interval: Duration,
    last_round: u64,
    last_at: Instant,
}

impl ReapSchedule {
    pub fn new(every_rounds: u64, interval: Duration, now: Instant) -> Self {
        Self {
            every_rounds: every_rounds.max(1),
            interval,
            last_round: 0,
            last_at: now,
        }
    }

    pub fn is_due(&self, round: u64, now: Instant) -> bool {
        round.saturating_sub(self.last_round) >= self.every_rounds
            || now.saturating_duration_since(self.last_at) >= self.interval
    }

    pub fn mark(&mut self, round: u64, now: Instant) {
        self.last_round = round;
        self.last_at = now;
    }
}
