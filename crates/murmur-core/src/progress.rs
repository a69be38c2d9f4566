//! Run-level progress reporting for the queue driver.
//!
//! [`Progress`] is computed by a pure function from counters the driver
//! already has; [`ProgressReporter`] decides where it goes.

use std::time::Duration;

use serde::Serialize;
use tracing::{error, info, warn};

use crate::adaptive::Recommendation;
use crate::driver::RunSummary;
use crate::error::AppError;
use crate::job::QueueStats;

// =============================================================================
// Progress
// =============================================================================

/// Snapshot of a run in progress.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Progress {
    /// Jobs this run moved to a terminal state.
    pub processed: u64,
    pub completed: u64,
    pub failed: u64,
    /// Pending count when the run started.
    pub initial_pending: u64,
    /// `processed / initial_pending`, capped at 100.
    pub percent: f64,
    pub elapsed: Duration,
    pub records_per_minute: f64,
    /// `None` until a rate has been observed.
    pub eta: Option<Duration>,
    pub batch_size: usize,
    pub parallelism: usize,
    pub panic: bool,
}

impl Progress {
    /// Computes progress from run counters and the current pending count.
    pub fn compute(
        initial_pending: u64,
        completed: u64,
        failed: u64,
        remaining: u64,
        elapsed: Duration,
        settings: Recommendation,
    ) -> Self {
        let processed = completed + failed;
        let percent = if initial_pending == 0 {
            100.0
        } else {
            (processed as f64 / initial_pending as f64 * 100.0).min(100.0)
        };

        let minutes = elapsed.as_secs_f64() / 60.0;
        let records_per_minute = if minutes > 0.0 {
            processed as f64 / minutes
        } else {
            0.0
        };

        let eta = if remaining == 0 {
            Some(Duration::ZERO)
        } else if records_per_minute > 0.0 {
            Some(Duration::from_secs_f64(
                remaining as f64 / records_per_minute * 60.0,
            ))
        } else {
            None
        };

        Self {
            processed,
            completed,
            failed,
            initial_pending,
            percent,
            elapsed,
            records_per_minute,
            eta,
            batch_size: settings.batch_size,
            parallelism: settings.parallelism,
            panic: settings.panic,
        }
    }
}

/// Formats a duration as `1h 02m 03s`, `4m 05s` or `7s`.
pub fn format_duration(duration: Duration) -> String {
    let total = duration.as_secs();
    let (hours, minutes, seconds) = (total / 3600, (total % 3600) / 60, total % 60);
    if hours > 0 {
        format!("{}h {:02}m {:02}s", hours, minutes, seconds)
    } else if minutes > 0 {
        format!("{}m {:02}s", minutes, seconds)
    } else {
        format!("{}s", seconds)
    }
}

// =============================================================================
// Driver Events
// =============================================================================

/// Events emitted by the queue driver.
#[derive(Debug)]
pub enum DriverEvent<'a> {
    /// The run started with this queue state.
    Started { stats: &'a QueueStats },
    /// The orphan reaper ran.
    Reaped { reclaimed: u64 },
    /// A round of parallel batches finished.
    RoundFinished { round: u64, progress: &'a Progress },
    /// Waiting before the next round.
    Pausing {
        delay: Duration,
        consecutive_failures: u32,
    },
    /// No more pending jobs; waiting for in-flight ones.
    Draining { processing: u64 },
    /// A store call in the loop failed; the loop continues.
    LoopError { error: &'a AppError },
    /// The run finished (or was interrupted).
    Finished { summary: &'a RunSummary },
}

// =============================================================================
// Progress Reporter Trait
// =============================================================================

/// Trait for reporting driver events.
pub trait ProgressReporter: Send + Sync {
    /// Called when a driver event occurs.
    ///
    /// The default implementation does nothing (silent mode).
    fn report(&self, event: DriverEvent<'_>) {
        let _ = event;
    }
}

/// Silent reporter that ignores all events.
#[derive(Debug, Default, Clone, Copy)]
pub struct SilentReporter;

impl ProgressReporter for SilentReporter {}

/// Tracing-based reporter for CLI logging.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingReporter;

impl ProgressReporter for TracingReporter {
    fn report(&self, event: DriverEvent<'_>) {
        match event {
            DriverEvent::Started { stats } => {
                info!(
                    pending = stats.pending,
                    processing = stats.processing,
                    completed = stats.completed,
                    failed = stats.failed,
                    "Queue processing started"
                );
            }
            DriverEvent::Reaped { reclaimed } => {
                if reclaimed > 0 {
                    info!(reclaimed, "Orphaned jobs returned to queue");
                }
            }
            DriverEvent::RoundFinished { round, progress } => {
                let eta = progress
                    .eta
                    .map(format_duration)
                    .unwrap_or_else(|| "unknown".to_string());
                info!(
                    round,
                    "[{:.1}%] {}/{} done ({} failed), {:.1}/min, elapsed {}, eta {}, batch {} x{}{}",
                    progress.percent,
                    progress.processed,
                    progress.initial_pending,
                    progress.failed,
                    progress.records_per_minute,
                    format_duration(progress.elapsed),
                    eta,
                    progress.batch_size,
                    progress.parallelism,
                    if progress.panic { " (panic)" } else { "" }
                );
            }
            DriverEvent::Pausing {
                delay,
                consecutive_failures,
            } => {
                if consecutive_failures > 0 {
                    warn!(
                        consecutive_failures,
                        delay_secs = delay.as_secs_f64(),
                        "Backing off after failed batches"
                    );
                }
            }
            DriverEvent::Draining { processing } => {
                info!(processing, "Waiting for in-flight jobs");
            }
            DriverEvent::LoopError { error } => {
                error!(%error, "Queue loop error");
            }
            DriverEvent::Finished { summary } => {
                info!(
                    completed = summary.completed,
                    failed = summary.failed,
                    success_rate = %format!("{:.1}%", summary.success_rate() * 100.0),
                    elapsed = %format_duration(summary.elapsed),
                    interrupted = summary.interrupted,
                    "Queue processing finished"
                );
            }
        }
    }
}
