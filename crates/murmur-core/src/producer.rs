//! Producer: turns detected content changes into queued jobs.
//!
//! For every content reference the producer
//! 1. derives the priority from the [`PriorityMap`]
//! 2. applies the cooldown window when the record was processed recently
//! 3. inserts the job unless the record already has a non-terminal job
//! 4. trims the queue back under its cap, dropping lowest-priority pending jobs

use std::time::Duration;

use chrono::{TimeDelta, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::{env_or, env_secs};
use crate::error::AppError;
use crate::job::{ContentRef, NewJob, PriorityMap};
use crate::job_queue::JobQueue;
use crate::retry::{RetryPolicy, with_retry};
use crate::traits::ContentSource;

/// Producer configuration.
#[derive(Debug, Clone)]
pub struct ProducerConfig {
    pub priorities: PriorityMap,
    /// Cap on `pending + processing` jobs.
    pub max_queue_size: u64,
    /// Minimum gap between two runs over the same record. Zero disables it.
    pub cooldown_window: Duration,
    /// Items requested per content page during `populate`.
    pub page_size: usize,
    pub fetch_retry: RetryPolicy,
    pub store_retry: RetryPolicy,
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self {
            priorities: PriorityMap::default(),
            max_queue_size: 10_000,
            cooldown_window: Duration::ZERO,
            page_size: 500,
            fetch_retry: RetryPolicy::default().with_max_attempts(5),
            store_retry: RetryPolicy::database(),
        }
    }
}

impl ProducerConfig {
    /// Defaults with `MURMUR_PRODUCER_*` and `MURMUR_PRIORITY_*` overrides.
    pub fn from_env() -> Self {
        let d = Self::default();
        let p = &d.priorities;
        Self {
            priorities: PriorityMap {
                new_post: env_or("MURMUR_PRIORITY_NEW_POST", p.new_post),
                new_comment: env_or("MURMUR_PRIORITY_NEW_COMMENT", p.new_comment),
                updated_post: env_or("MURMUR_PRIORITY_UPDATED_POST", p.updated_post),
                updated_comment: env_or("MURMUR_PRIORITY_UPDATED_COMMENT", p.updated_comment),
                fallback: env_or("MURMUR_PRIORITY_DEFAULT", p.fallback),
            },
            max_queue_size: env_or("MURMUR_PRODUCER_MAX_QUEUE", d.max_queue_size),
            cooldown_window: env_secs("MURMUR_PRODUCER_COOLDOWN_SECS", d.cooldown_window),
            page_size: env_or("MURMUR_PRODUCER_PAGE_SIZE", d.page_size),
            ..d
        }
    }

    pub fn with_priorities(mut self, priorities: PriorityMap) -> Self {
        self.priorities = priorities;
        self
    }

    pub fn with_max_queue_size(mut self, max: u64) -> Self {
        self.max_queue_size = max;
        self
    }

    pub fn with_cooldown_window(mut self, window: Duration) -> Self {
        self.cooldown_window = window;
        self
    }

    pub fn with_page_size(mut self, size: usize) -> Self {
        self.page_size = size.max(1);
        self
    }

    pub fn with_fetch_retry(mut self, policy: RetryPolicy) -> Self {
        self.fetch_retry = policy;
        self
    }
}

/// Totals of a [`Producer::populate`] run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PopulateSummary {
    pub pages: usize,
    pub scanned: usize,
    pub enqueued: usize,
    /// Items that already had a job in the queue.
    pub skipped: usize,
    /// Pending jobs dropped to respect the queue cap.
    pub trimmed: u64,
}

/// Enqueues jobs for new and changed content.
#[derive(Debug, Clone)]
pub struct Producer<Q: JobQueue> {
    queue: Q,
    config: ProducerConfig,
}

impl<Q: JobQueue> Producer<Q> {
    pub fn new(queue: Q, config: ProducerConfig) -> Self {
        Self { queue, config }
    }

    pub fn config(&self) -> &ProducerConfig {
        &self.config
    }

    /// Enqueues one item. Returns `false` when the record is already queued.
    pub async fn enqueue(&self, item: &ContentRef) -> Result<bool, AppError> {
        let inserted = self.insert(item).await?;
        if inserted {
            self.enforce_cap().await?;
        }
        Ok(inserted)
    }

    /// Enqueues every item and returns how many were actually inserted.
    ///
    /// The queue cap is enforced once, after the whole batch.
    pub async fn enqueue_batch(&self, items: &[ContentRef]) -> Result<usize, AppError> {
        Ok(self.enqueue_all(items).await?.0)
    }

    /// Walks the whole content source page by page and enqueues everything it yields.
    pub async fn populate<S>(&self, source: &S) -> Result<PopulateSummary, AppError>
    where
        S: ContentSource,
    {
        let mut summary = PopulateSummary::default();
        let mut cursor: Option<String> = None;

        loop {
            let page = with_retry(&self.config.fetch_retry, || {
                source.fetch_page(cursor.clone(), self.config.page_size)
            })
            .await?;

            summary.pages += 1;
            summary.scanned += page.items.len();

            let (enqueued, trimmed) = self.enqueue_all(&page.items).await?;
            summary.enqueued += enqueued;
            summary.skipped += page.items.len() - enqueued;
            summary.trimmed += trimmed;

            debug!(
                page = summary.pages,
                items = page.items.len(),
                enqueued,
                "Content page processed"
            );

            match page.next_cursor {
                Some(next) if !page.items.is_empty() => cursor = Some(next),
                _ => break,
            }
        }

        info!(
            pages = summary.pages,
            scanned = summary.scanned,
            enqueued = summary.enqueued,
            skipped = summary.skipped,
            trimmed = summary.trimmed,
            "Content scan complete"
        );
        Ok(summary)
    }

    async fn enqueue_all(&self, items: &[ContentRef]) -> Result<(usize, u64), AppError> {
        let mut enqueued = 0;
        for item in items {
            if self.insert(item).await? {
                enqueued += 1;
            }
        }
        let trimmed = if enqueued > 0 {
            self.enforce_cap().await?
        } else {
            0
        };
        Ok((enqueued, trimmed))
    }

    async fn insert(&self, item: &ContentRef) -> Result<bool, AppError> {
        let priority = self
            .config
            .priorities
            .priority_for(&item.record_kind, item.change);
        let mut job = NewJob::new(item, priority);

        if !self.config.cooldown_window.is_zero() {
            let last = with_retry(&self.config.store_retry, || {
                self.queue
                    .last_processed_at(&item.record_id, &item.record_kind)
            })
            .await?;
            if let Some(last) = last {
                let window = TimeDelta::from_std(self.config.cooldown_window)
                    .map_err(|e| AppError::ConfigError(format!("invalid cooldown: {}", e)))?;
                let until = last + window;
                if until > Utc::now() {
                    job = job.with_cooldown_until(until);
                }
            }
        }

        let inserted = with_retry(&self.config.store_retry, || {
            self.queue.insert_if_absent(job.clone())
        })
        .await?;

        match inserted {
            Some(job) => {
                debug!(
                    job_id = %job.id,
                    record_id = %job.record_id,
                    kind = %job.record_kind,
                    change = %item.change,
                    priority = job.priority,
                    "Job enqueued"
                );
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn enforce_cap(&self) -> Result<u64, AppError> {
        let max = self.config.max_queue_size;
        let trimmed =
            with_retry(&self.config.store_retry, || self.queue.trim_surplus(max)).await?;
        if trimmed > 0 {
            warn!(trimmed, max_queue_size = max, "Queue over capacity, dropped lowest-priority jobs");
        }
        Ok(trimmed)
    }
}
