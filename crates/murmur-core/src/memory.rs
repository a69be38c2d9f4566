//! In-memory [`JobQueue`] implementation.
//!
//! Every operation runs under one mutex, which gives `claim_batch` the same
//! atomicity the PostgreSQL store gets from `FOR UPDATE SKIP LOCKED`. Used by
//! tests and by dry runs that should not touch a database.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::AppError;
use crate::job::{Job, JobStatus, NewJob, QueueStats, RecordKind};
use crate::job_queue::JobQueue;

#[derive(Debug, Default)]
struct Inner {
    jobs: HashMap<Uuid, Job>,
}

impl Inner {
    fn has_open_job(&self, record_id: &str, record_kind: &RecordKind) -> bool {
        self.jobs.values().any(|job| {
            !job.status.is_terminal()
                && job.record_id == record_id
                && &job.record_kind == record_kind
        })
    }

    fn stats(&self) -> QueueStats {
        let mut stats = QueueStats::default();
        for job in self.jobs.values() {
            match job.status {
                JobStatus::Pending => stats.pending += 1,
                JobStatus::Processing => stats.processing += 1,
                JobStatus::Completed => stats.completed += 1,
                JobStatus::Failed => stats.failed += 1,
            }
        }
        stats
    }

    /// The job, provided it is still `processing`.
    fn claimed_mut(&mut self, id: Uuid) -> Result<&mut Job, AppError> {
        let job = self.jobs.get_mut(&id).ok_or(AppError::JobNotFound(id))?;
        if job.status != JobStatus::Processing {
            return Err(AppError::ClaimLost(id));
        }
        Ok(job)
    }

    fn delete_all(&mut self, ids: &[Uuid]) -> u64 {
        ids.iter()
            .filter(|id| self.jobs.remove(id).is_some())
            .count() as u64
    }
}

/// Process-local job store.
#[derive(Debug, Clone, Default)]
pub struct MemoryJobQueue {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryJobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a job verbatim, bypassing deduplication.
    ///
    /// Lets callers seed arbitrary states (stuck `processing` jobs, old
    /// `created_at` values) when reproducing a scenario.
    pub fn insert_raw(&self, job: Job) {
        self.lock().jobs.insert(job.id, job);
    }

    /// Snapshot of every stored job.
    pub fn snapshot(&self) -> Vec<Job> {
        self.lock().jobs.values().cloned().collect()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // A panic while holding the lock cannot leave a job half-updated,
        // every mutation is a single field assignment.
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Claim order: priority desc, then created_at asc, then id for stability.
fn claim_order(a: &Job, b: &Job) -> std::cmp::Ordering {
    b.priority
        .cmp(&a.priority)
        .then(a.created_at.cmp(&b.created_at))
        .then(a.id.cmp(&b.id))
}

impl JobQueue for MemoryJobQueue {
    async fn insert_if_absent(&self, new_job: NewJob) -> Result<Option<Job>, AppError> {
        let mut inner = self.lock();
        if inner.has_open_job(&new_job.record_id, &new_job.record_kind) {
            return Ok(None);
        }

        let job = Job {
            id: Uuid::new_v4(),
            record_id: new_job.record_id,
            record_kind: new_job.record_kind,
            source_table: new_job.source_table,
            priority: new_job.priority,
            status: JobStatus::Pending,
            attempts: 0,
            last_error: None,
            created_at: Utc::now(),
            processed_at: None,
            cooldown_until: new_job.cooldown_until,
        };
        inner.jobs.insert(job.id, job.clone());
        Ok(Some(job))
    }

    async fn last_processed_at(
        &self,
        record_id: &str,
        record_kind: &RecordKind,
    ) -> Result<Option<DateTime<Utc>>, AppError> {
        Ok(self
            .lock()
            .jobs
            .values()
            .filter(|job| {
                job.status == JobStatus::Completed
                    && job.record_id == record_id
                    && &job.record_kind == record_kind
            })
            .filter_map(|job| job.processed_at)
            .max())
    }

    async fn claim_batch(&self, limit: usize) -> Result<Vec<Job>, AppError> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        let now = Utc::now();
        let mut inner = self.lock();

        let mut eligible: Vec<&Job> = inner
            .jobs
            .values()
            .filter(|job| job.is_claimable(now))
            .collect();
        eligible.sort_by(|a, b| claim_order(a, b));
        let ids: Vec<Uuid> = eligible.iter().take(limit).map(|job| job.id).collect();

        let mut claimed = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(job) = inner.jobs.get_mut(&id) {
                job.status = JobStatus::Processing;
                job.processed_at = Some(now);
                claimed.push(job.clone());
            }
        }
        claimed.sort_by(claim_order);
        Ok(claimed)
    }

    async fn complete_job(&self, job_id: Uuid) -> Result<(), AppError> {
        let mut inner = self.lock();
        let job = inner.claimed_mut(job_id)?;
        job.status = JobStatus::Completed;
        job.processed_at = Some(Utc::now());
        Ok(())
    }

    async fn fail_job(&self, job_id: Uuid, error: &str) -> Result<(), AppError> {
        let mut inner = self.lock();
        let job = inner.claimed_mut(job_id)?;
        job.status = JobStatus::Failed;
        job.attempts += 1;
        job.last_error = Some(error.to_string());
        job.processed_at = Some(Utc::now());
        Ok(())
    }

    async fn release_job(&self, job_id: Uuid) -> Result<(), AppError> {
        let mut inner = self.lock();
        if let Some(job) = inner.jobs.get_mut(&job_id) {
            if job.status == JobStatus::Processing {
                job.status = JobStatus::Pending;
            }
        }
        Ok(())
    }

    async fn reclaim_stuck(&self, older_than: DateTime<Utc>) -> Result<u64, AppError> {
        let mut inner = self.lock();
        let mut reclaimed = 0;
        for job in inner.jobs.values_mut() {
            if job.status == JobStatus::Processing && job.processing_since() < older_than {
                job.status = JobStatus::Pending;
                reclaimed += 1;
            }
        }
        Ok(reclaimed)
    }

    async fn count_by_status(&self, status: JobStatus) -> Result<u64, AppError> {
        Ok(self
            .lock()
            .jobs
            .values()
            .filter(|job| job.status == status)
            .count() as u64)
    }

    async fn queue_stats(&self) -> Result<QueueStats, AppError> {
        Ok(self.lock().stats())
    }

    async fn trim_surplus(&self, max_non_terminal: u64) -> Result<u64, AppError> {
        let mut inner = self.lock();
        let open = inner.stats().non_terminal();
        if open <= max_non_terminal {
            return Ok(0);
        }
        let surplus = (open - max_non_terminal) as usize;

        let mut pending: Vec<&Job> = inner
            .jobs
            .values()
            .filter(|job| job.status == JobStatus::Pending)
            .collect();
        pending.sort_by(|a, b| {
            a.priority
                .cmp(&b.priority)
                .then(a.created_at.cmp(&b.created_at))
        });
        let victims: Vec<Uuid> = pending.iter().take(surplus).map(|job| job.id).collect();

        Ok(inner.delete_all(&victims))
    }

    async fn prune_terminal(&self, keep: u64) -> Result<u64, AppError> {
        let mut inner = self.lock();
        let mut terminal: Vec<&Job> = inner
            .jobs
            .values()
            .filter(|job| job.status.is_terminal())
            .collect();
        terminal.sort_by(|a, b| b.processing_since().cmp(&a.processing_since()));
        let victims: Vec<Uuid> = terminal
            .iter()
            .skip(keep as usize)
            .map(|job| job.id)
            .collect();

        Ok(inner.delete_all(&victims))
    }

    async fn clear_non_terminal(&self) -> Result<u64, AppError> {
        let mut inner = self.lock();
        let victims: Vec<Uuid> = inner
            .jobs
            .values()
            .filter(|job| !job.status.is_terminal())
            .map(|job| job.id)
            .collect();

        Ok(inner.delete_all(&victims))
    }

    async fn reset_terminal(&self) -> Result<u64, AppError> {
        let mut inner = self.lock();

        // Newest terminal job per record, skipping records that are already queued.
        let mut newest: HashMap<(String, RecordKind), &Job> = HashMap::new();
        for job in inner.jobs.values().filter(|job| job.status.is_terminal()) {
            if inner.has_open_job(&job.record_id, &job.record_kind) {
                continue;
            }
            let key = (job.record_id.clone(), job.record_kind.clone());
            match newest.get(&key) {
                Some(current) if current.created_at >= job.created_at => {}
                _ => {
                    newest.insert(key, job);
                }
            }
        }
        let ids: Vec<Uuid> = newest.values().map(|job| job.id).collect();

        for id in &ids {
            if let Some(job) = inner.jobs.get_mut(id) {
                job.status = JobStatus::Pending;
                job.last_error = None;
                job.cooldown_until = None;
            }
        }
        Ok(ids.len() as u64)
    }

    async fn requeue_failed(&self, max_attempts: u32) -> Result<u64, AppError> {
        let mut inner = self.lock();

        let mut newest: HashMap<(String, RecordKind), &Job> = HashMap::new();
        for job in inner.jobs.values() {
            if job.status != JobStatus::Failed
                || job.attempts >= max_attempts
                || inner.has_open_job(&job.record_id, &job.record_kind)
            {
                continue;
            }
            let key = (job.record_id.clone(), job.record_kind.clone());
            match newest.get(&key) {
                Some(current) if current.created_at >= job.created_at => {}
                _ => {
                    newest.insert(key, job);
                }
            }
        }
        let ids: Vec<Uuid> = newest.values().map(|job| job.id).collect();

        for id in &ids {
            if let Some(job) = inner.jobs.get_mut(id) {
                job.status = JobStatus::Pending;
                job.last_error = None;
            }
        }
        Ok(ids.len() as u64)
    }

    async fn get_job(&self, job_id: Uuid) -> Result<Option<Job>, AppError> {
        Ok(self.lock().jobs.get(&job_id).cloned())
    }

    async fn list_jobs(
        &self,
        status: Option<JobStatus>,
        limit: usize,
    ) -> Result<Vec<Job>, AppError> {
        let inner = self.lock();
        let mut jobs: Vec<Job> = inner
            .jobs
            .values()
            .filter(|job| status.is_none_or(|s| job.status == s))
            .cloned()
            .collect();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        jobs.truncate(limit);
        Ok(jobs)
    }
}
