//! Adaptive batch sizing and parallelism.
//!
//! The [`AdaptiveController`] holds only configuration. Everything it learns
//! lives in a [`ControllerState`] owned by the driver and passed to each call,
//! so two drivers in one process never share tuning state.
//!
//! # Algorithm
//!
//! Over a sliding window of recent batch outcomes:
//! - success rate above `scale_up_success_rate` with fast batches: grow the
//!   batch size by `batch_step` and parallelism by one, up to the maxima
//! - success rate below `scale_down_success_rate`: shrink both, down to the minima
//! - otherwise hold steady
//!
//! Independently of the window, `panic_threshold` consecutive failed batches
//! (or a single timed-out batch) enter panic mode: parallelism drops to 1 and the
//! batch size is halved. After `panic_cooloff` without another failure the
//! pre-panic batch size is restored.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{info, warn};

use crate::config::{env_or, env_secs};
use crate::error::ErrorClass;

// =============================================================================
// Configuration
// =============================================================================

/// Bounds and thresholds of the adaptive controller.
#[derive(Debug, Clone, PartialEq)]
pub struct AdaptiveConfig {
    pub min_batch_size: usize,
    pub max_batch_size: usize,
    pub batch_step: usize,
    pub min_parallelism: usize,
    pub max_parallelism: usize,
    /// Number of batch outcomes kept in the sliding window.
    pub window_size: usize,
    /// Outcomes needed in the window before the controller adapts.
    pub min_samples: usize,
    pub scale_up_success_rate: f64,
    pub scale_down_success_rate: f64,
    /// Successful batches averaging at most this long count as "fast".
    pub fast_batch_threshold: Duration,
    /// Consecutive failed batches that trigger panic mode.
    pub panic_threshold: u32,
    /// Failure-free time after which panic mode ends.
    pub panic_cooloff: Duration,
}

impl Default for AdaptiveConfig {
    fn default() -> Self {
        Self {
            min_batch_size: 10,
            max_batch_size: 100,
            batch_step: 5,
            min_parallelism: 1,
            max_parallelism: 4,
            window_size: 30,
            min_samples: 3,
            scale_up_success_rate: 0.9,
            scale_down_success_rate: 0.7,
            fast_batch_threshold: Duration::from_secs(30),
            panic_threshold: 5,
            panic_cooloff: Duration::from_secs(5 * 60),
        }
    }
}

impl AdaptiveConfig {
    /// Defaults with `MURMUR_ADAPTIVE_*` overrides.
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            min_batch_size: env_or("MURMUR_ADAPTIVE_MIN_BATCH", d.min_batch_size),
            max_batch_size: env_or("MURMUR_ADAPTIVE_MAX_BATCH", d.max_batch_size),
            batch_step: env_or("MURMUR_ADAPTIVE_BATCH_STEP", d.batch_step),
            min_parallelism: env_or("MURMUR_ADAPTIVE_MIN_PARALLELISM", d.min_parallelism),
            max_parallelism: env_or("MURMUR_ADAPTIVE_MAX_PARALLELISM", d.max_parallelism),
            window_size: env_or("MURMUR_ADAPTIVE_WINDOW", d.window_size),
            min_samples: env_or("MURMUR_ADAPTIVE_MIN_SAMPLES", d.min_samples),
            scale_up_success_rate: env_or("MURMUR_ADAPTIVE_SCALE_UP_RATE", d.scale_up_success_rate),
            scale_down_success_rate: env_or(
                "MURMUR_ADAPTIVE_SCALE_DOWN_RATE",
                d.scale_down_success_rate,
            ),
            fast_batch_threshold: env_secs(
                "MURMUR_ADAPTIVE_FAST_BATCH_SECS",
                d.fast_batch_threshold,
            ),
            panic_threshold: env_or("MURMUR_ADAPTIVE_PANIC_THRESHOLD", d.panic_threshold),
            panic_cooloff: env_secs("MURMUR_ADAPTIVE_PANIC_COOLOFF_SECS", d.panic_cooloff),
        }
        .normalized()
    }

    pub fn with_batch_bounds(mut self, min: usize, max: usize) -> Self {
        self.min_batch_size = min;
        self.max_batch_size = max;
        self.normalized()
    }

    pub fn with_parallelism_bounds(mut self, min: usize, max: usize) -> Self {
        self.min_parallelism = min;
        self.max_parallelism = max;
        self.normalized()
    }

    pub fn with_panic_threshold(mut self, threshold: u32) -> Self {
        self.panic_threshold = threshold.max(1);
        self
    }

    pub fn with_panic_cooloff(mut self, cooloff: Duration) -> Self {
        self.panic_cooloff = cooloff;
        self
    }

    pub fn with_window_size(mut self, size: usize) -> Self {
        self.window_size = size;
        self.normalized()
    }

    /// Widens the bounds so an operator-chosen starting point is reachable.
    pub fn admitting(mut self, batch_size: usize, parallelism: usize) -> Self {
        self.min_batch_size = self.min_batch_size.min(batch_size.max(1));
        self.max_batch_size = self.max_batch_size.max(batch_size);
        self.min_parallelism = self.min_parallelism.min(parallelism.max(1));
        self.max_parallelism = self.max_parallelism.max(parallelism);
        self
    }

    fn normalized(mut self) -> Self {
        self.min_batch_size = self.min_batch_size.max(1);
        self.max_batch_size = self.max_batch_size.max(self.min_batch_size);
        self.min_parallelism = self.min_parallelism.max(1);
        self.max_parallelism = self.max_parallelism.max(self.min_parallelism);
        self.window_size = self.window_size.max(1);
        self
    }

    fn clamp_batch(&self, size: usize) -> usize {
        size.clamp(self.min_batch_size, self.max_batch_size)
    }

    fn clamp_parallelism(&self, parallelism: usize) -> usize {
        parallelism.clamp(self.min_parallelism, self.max_parallelism)
    }
}

// =============================================================================
// Outcomes
// =============================================================================

/// Outcome of one claim-and-process batch.
#[derive(Debug, Clone)]
pub struct BatchPerformance {
    /// Batch size the batch was launched with.
    pub batch_size: usize,
    /// Jobs that reached a terminal state.
    pub records_processed: usize,
    pub records_failed: usize,
    pub started_at: Instant,
    pub finished_at: Instant,
    pub success: bool,
    /// Class of the most significant error seen, if any.
    pub error_class: Option<ErrorClass>,
    /// An external call hit its hard timeout.
    pub timed_out: bool,
    pub tokens_estimate: Option<u64>,
}

impl BatchPerformance {
    pub fn duration(&self) -> Duration {
        self.finished_at.saturating_duration_since(self.started_at)
    }

    /// Records per second for this batch alone.
    pub fn rate(&self) -> f64 {
        let secs = self.duration().as_secs_f64();
        if secs <= 0.0 {
            return 0.0;
        }
        self.records_processed as f64 / secs
    }
}

/// Aggregates over the sliding window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct WindowStats {
    pub samples: usize,
    pub success_rate: f64,
    /// Mean duration of successful batches.
    pub avg_duration: Option<Duration>,
    /// Records per second over successful batches.
    pub throughput: f64,
    pub tokens: u64,
}

/// Settings that produced the best observed throughput.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct OptimalSettings {
    pub batch_size: usize,
    pub parallelism: usize,
    pub records_per_minute: f64,
}

/// What the driver should use for the next round.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Recommendation {
    pub batch_size: usize,
    pub parallelism: usize,
    pub panic: bool,
}

// =============================================================================
// State
// =============================================================================

#[derive(Debug, Clone, Copy)]
struct PanicState {
    restore_batch_size: usize,
    last_failure: Instant,
}

/// Everything the controller has learned during a run.
#[derive(Debug, Clone)]
pub struct ControllerState {
    window: VecDeque<BatchPerformance>,
    batch_size: usize,
    parallelism: usize,
    consecutive_failures: u32,
    panic: Option<PanicState>,
    best: Option<OptimalSettings>,
}

impl ControllerState {
    /// Starting state, clamped into the configured bounds.
    pub fn new(config: &AdaptiveConfig, batch_size: usize, parallelism: usize) -> Self {
        Self {
            window: VecDeque::with_capacity(config.window_size),
            batch_size: config.clamp_batch(batch_size),
            parallelism: config.clamp_parallelism(parallelism),
            consecutive_failures: 0,
            panic: None,
            best: None,
        }
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn parallelism(&self) -> usize {
        self.parallelism
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn in_panic(&self) -> bool {
        self.panic.is_some()
    }

    pub fn best(&self) -> Option<OptimalSettings> {
        self.best
    }

    pub fn window_len(&self) -> usize {
        self.window.len()
    }

    pub fn window_stats(&self) -> WindowStats {
        let samples = self.window.len();
        if samples == 0 {
            return WindowStats::default();
        }

        let mut successes = 0usize;
        let mut records = 0usize;
        let mut busy = Duration::ZERO;
        let mut tokens = 0u64;
        for perf in self.window.iter() {
            tokens += perf.tokens_estimate.unwrap_or(0);
            if perf.success {
                successes += 1;
                records += perf.records_processed;
                busy += perf.duration();
            }
        }

        let busy_secs = busy.as_secs_f64();
        WindowStats {
            samples,
            success_rate: successes as f64 / samples as f64,
            avg_duration: (successes > 0).then(|| busy / successes as u32),
            throughput: if busy_secs > 0.0 {
                records as f64 / busy_secs
            } else {
                0.0
            },
            tokens,
        }
    }

    fn recommendation(&self) -> Recommendation {
        Recommendation {
            batch_size: self.batch_size,
            parallelism: self.parallelism,
            panic: self.panic.is_some(),
        }
    }
}

// =============================================================================
// Controller
// =============================================================================

/// Stateless policy over a [`ControllerState`].
#[derive(Debug, Clone, Default)]
pub struct AdaptiveController {
    config: AdaptiveConfig,
}

impl AdaptiveController {
    pub fn new(config: AdaptiveConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &AdaptiveConfig {
        &self.config
    }

    /// Creates the initial state for a run.
    pub fn initial_state(&self, batch_size: usize, parallelism: usize) -> ControllerState {
        ControllerState::new(&self.config, batch_size, parallelism)
    }

    /// Folds one batch outcome into the state.
    pub fn record_outcome(&self, state: &mut ControllerState, perf: BatchPerformance) {
        if perf.success {
            state.consecutive_failures = 0;
            let rate = perf.rate() * state.parallelism as f64 * 60.0;
            if state.best.is_none_or(|best| rate > best.records_per_minute) {
                state.best = Some(OptimalSettings {
                    batch_size: perf.batch_size,
                    parallelism: state.parallelism,
                    records_per_minute: rate,
                });
            }
        } else {
            state.consecutive_failures += 1;
            self.on_failure(state, &perf);
        }

        state.window.push_back(perf);
        while state.window.len() > self.config.window_size {
            state.window.pop_front();
        }
    }

    fn on_failure(&self, state: &mut ControllerState, perf: &BatchPerformance) {
        if let Some(panic) = state.panic.as_mut() {
            panic.last_failure = perf.finished_at;
            return;
        }
        if !perf.timed_out && state.consecutive_failures < self.config.panic_threshold {
            return;
        }

        let restore_batch_size = state.batch_size;
        state.batch_size = self.config.clamp_batch(state.batch_size / 2);
        state.parallelism = self.config.min_parallelism;
        state.panic = Some(PanicState {
            restore_batch_size,
            last_failure: perf.finished_at,
        });
        warn!(
            consecutive_failures = state.consecutive_failures,
            timed_out = perf.timed_out,
            batch_size = state.batch_size,
            parallelism = state.parallelism,
            "Entering panic mode"
        );
    }

    /// Returns the settings for the next round, adapting the state first.
    ///
    /// `now` is compared against the last failure to decide whether panic
    /// mode has cooled off.
    pub fn recommend(&self, state: &mut ControllerState, now: Instant) -> Recommendation {
        if let Some(panic) = state.panic {
            if now.saturating_duration_since(panic.last_failure) < self.config.panic_cooloff {
                return state.recommendation();
            }
            state.batch_size = self.config.clamp_batch(panic.restore_batch_size);
            state.panic = None;
            // Failures that caused the panic no longer describe the downstream.
            state.window.clear();
            info!(batch_size = state.batch_size, "Panic mode cooled off, batch size restored");
            return state.recommendation();
        }

        if state.window.len() < self.config.min_samples {
            return state.recommendation();
        }

        let stats = state.window_stats();
        let fast = stats
            .avg_duration
            .is_some_and(|avg| avg <= self.config.fast_batch_threshold);

        if stats.success_rate > self.config.scale_up_success_rate && fast {
            state.batch_size = self
                .config
                .clamp_batch(state.batch_size.saturating_add(self.config.batch_step));
            state.parallelism = self
                .config
                .clamp_parallelism(state.parallelism.saturating_add(1));
        } else if stats.success_rate < self.config.scale_down_success_rate {
            state.batch_size = self
                .config
                .clamp_batch(state.batch_size.saturating_sub(self.config.batch_step));
            state.parallelism = self
                .config
                .clamp_parallelism(state.parallelism.saturating_sub(1));
        }

        state.recommendation()
    }
}
