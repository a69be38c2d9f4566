//! Job repository for PostgreSQL with SELECT FOR UPDATE SKIP LOCKED.
//!
//! Implements the [`JobQueue`] trait over the `embedding_jobs` table with safe
//! concurrent batch claiming using PostgreSQL's row-level locking.

use chrono::{DateTime, Utc};
use sqlx::{PgPool, Pool, Postgres};
use uuid::Uuid;

use murmur_core::error::AppError;
use murmur_core::job::{Job, JobStatus, NewJob, QueueStats, RecordKind};
use murmur_core::job_queue::JobQueue;

/// PostgreSQL implementation of the job queue.
///
/// Uses `SELECT FOR UPDATE SKIP LOCKED` inside a single `UPDATE` for batch
/// claiming, so multiple drivers (on one host or many) never claim the same job.
#[derive(Clone)]
pub struct JobRepository {
    pool: Pool<Postgres>,
}

impl JobRepository {
    /// Create a new job repository with the given connection pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// When any job last finished, successfully or not.
    pub async fn last_activity(&self) -> Result<Option<DateTime<Utc>>, AppError> {
        let last: Option<DateTime<Utc>> =
            sqlx::query_scalar("SELECT MAX(processed_at) FROM embedding_jobs")
                .fetch_one(&self.pool)
                .await?;
        Ok(last)
    }

    /// Error for a finalize that matched no `processing` row.
    async fn unclaimed(&self, job_id: Uuid) -> AppError {
        let exists = sqlx::query_scalar::<_, bool>(
            "SELECT EXISTS(SELECT 1 FROM embedding_jobs WHERE id = $1)",
        )
        .bind(job_id)
        .fetch_one(&self.pool)
        .await;

        match exists {
            Ok(false) => AppError::JobNotFound(job_id),
            Ok(true) => AppError::ClaimLost(job_id),
            Err(e) => e.into(),
        }
    }
}

// =============================================================================
// Helper Types for Database Mapping
// =============================================================================

/// Helper struct for deserializing job rows from the database.
#[derive(sqlx::FromRow)]
struct JobRow {
    id: Uuid,
    record_id: String,
    record_kind: String,
    source_table: String,
    priority: i16,
    status: String,
    attempts: i32,
    last_error: Option<String>,
    created_at: DateTime<Utc>,
    processed_at: Option<DateTime<Utc>>,
    cooldown_until: Option<DateTime<Utc>>,
}

impl From<JobRow> for Job {
    fn from(row: JobRow) -> Self {
        Self {
            id: row.id,
            record_id: row.record_id,
            record_kind: RecordKind::from(row.record_kind.as_str()),
            source_table: row.source_table,
            priority: row.priority,
            status: row.status.parse().unwrap_or(JobStatus::Pending),
            attempts: row.attempts.max(0) as u32,
            last_error: row.last_error,
            created_at: row.created_at,
            processed_at: row.processed_at,
            cooldown_until: row.cooldown_until,
        }
    }
}

/// Order rows the way the claim query selected them.
fn sort_claimed(jobs: &mut [Job]) {
    jobs.sort_by(|a, b| {
        b.priority
            .cmp(&a.priority)
            .then(a.created_at.cmp(&b.created_at))
            .then(a.id.cmp(&b.id))
    });
}

// =============================================================================
// JobQueue Trait Implementation
// =============================================================================

impl JobQueue for JobRepository {
    async fn insert_if_absent(&self, job: NewJob) -> Result<Option<Job>, AppError> {
        // The partial unique index turns a concurrent duplicate into a no-op.
        let row: Option<JobRow> = sqlx::query_as(
            r#"
            INSERT INTO embedding_jobs (record_id, record_kind, source_table, priority, cooldown_until)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (record_id, record_kind) WHERE status IN ('pending', 'processing')
            DO NOTHING
            RETURNING *
            "#,
        )
        .bind(&job.record_id)
        .bind(job.record_kind.as_str())
        .bind(&job.source_table)
        .bind(job.priority)
        .bind(job.cooldown_until)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(Into::into))
    }

    async fn last_processed_at(
        &self,
        record_id: &str,
        record_kind: &RecordKind,
    ) -> Result<Option<DateTime<Utc>>, AppError> {
        let (last,): (Option<DateTime<Utc>>,) = sqlx::query_as(
            r#"
            SELECT MAX(processed_at) FROM embedding_jobs
            WHERE record_id = $1 AND record_kind = $2 AND status = 'completed'
            "#,
        )
        .bind(record_id)
        .bind(record_kind.as_str())
        .fetch_one(&self.pool)
        .await?;

        Ok(last)
    }

    async fn claim_batch(&self, limit: usize) -> Result<Vec<Job>, AppError> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        // Select and mark in one statement. SKIP LOCKED lets concurrent
        // claimers take disjoint batches instead of blocking on each other.
        let rows: Vec<JobRow> = sqlx::query_as(
            r#"
            UPDATE embedding_jobs
            SET
                status = 'processing',
                processed_at = NOW()
            WHERE id IN (
                SELECT id FROM embedding_jobs
                WHERE status = 'pending'
                  AND (cooldown_until IS NULL OR cooldown_until <= NOW())
                ORDER BY priority DESC, created_at ASC
                LIMIT $1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING *
            "#,
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        // RETURNING does not preserve the subquery order.
        let mut jobs: Vec<Job> = rows.into_iter().map(Into::into).collect();
        sort_claimed(&mut jobs);
        Ok(jobs)
    }

    async fn complete_job(&self, job_id: Uuid) -> Result<(), AppError> {
        let result = sqlx::query(
            r#"
            UPDATE embedding_jobs
            SET
                status = 'completed',
                processed_at = NOW()
            WHERE id = $1 AND status = 'processing'
            "#,
        )
        .bind(job_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(self.unclaimed(job_id).await);
        }
        Ok(())
    }

    async fn fail_job(&self, job_id: Uuid, error: &str) -> Result<(), AppError> {
        let result = sqlx::query(
            r#"
            UPDATE embedding_jobs
            SET
                status = 'failed',
                attempts = attempts + 1,
                last_error = $2,
                processed_at = NOW()
            WHERE id = $1 AND status = 'processing'
            "#,
        )
        .bind(job_id)
        .bind(error)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(self.unclaimed(job_id).await);
        }
        Ok(())
    }

    async fn release_job(&self, job_id: Uuid) -> Result<(), AppError> {
        sqlx::query(
            r#"
            UPDATE embedding_jobs
            SET status = 'pending'
            WHERE id = $1 AND status = 'processing'
            "#,
        )
        .bind(job_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn reclaim_stuck(&self, older_than: DateTime<Utc>) -> Result<u64, AppError> {
        let result = sqlx::query(
            r#"
            UPDATE embedding_jobs
            SET status = 'pending'
            WHERE status = 'processing'
              AND COALESCE(processed_at, created_at) < $1
            "#,
        )
        .bind(older_than)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn count_by_status(&self, status: JobStatus) -> Result<u64, AppError> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM embedding_jobs WHERE status = $1")
                .bind(status.as_str())
                .fetch_one(&self.pool)
                .await?;

        Ok(count.max(0) as u64)
    }

    async fn queue_stats(&self) -> Result<QueueStats, AppError> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT status, COUNT(*) FROM embedding_jobs GROUP BY status")
                .fetch_all(&self.pool)
                .await?;

        let mut stats = QueueStats::default();
        for (status, count) in rows {
            let count = count.max(0) as u64;
            match status.parse::<JobStatus>() {
                Ok(JobStatus::Pending) => stats.pending = count,
                Ok(JobStatus::Processing) => stats.processing = count,
                Ok(JobStatus::Completed) => stats.completed = count,
                Ok(JobStatus::Failed) => stats.failed = count,
                Err(_) => {}
            }
        }
        Ok(stats)
    }

    async fn trim_surplus(&self, max_non_terminal: u64) -> Result<u64, AppError> {
        let (open,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM embedding_jobs WHERE status IN ('pending', 'processing')",
        )
        .fetch_one(&self.pool)
        .await?;

        let surplus = (open.max(0) as u64).saturating_sub(max_non_terminal);
        if surplus == 0 {
            return Ok(0);
        }

        // Only pending jobs are trimmed; in-flight work is never dropped.
        let result = sqlx::query(
            r#"
            DELETE FROM embedding_jobs
            WHERE id IN (
                SELECT id FROM embedding_jobs
                WHERE status = 'pending'
                ORDER BY priority ASC, created_at ASC
                LIMIT $1
                FOR UPDATE SKIP LOCKED
            )
            "#,
        )
        .bind(surplus as i64)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn prune_terminal(&self, keep: u64) -> Result<u64, AppError> {
        let result = sqlx::query(
            r#"
            DELETE FROM embedding_jobs
            WHERE id IN (
                SELECT id FROM embedding_jobs
                WHERE status IN ('completed', 'failed')
                ORDER BY COALESCE(processed_at, created_at) DESC
                OFFSET $1
            )
            "#,
        )
        .bind(keep as i64)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn clear_non_terminal(&self) -> Result<u64, AppError> {
        let result =
            sqlx::query("DELETE FROM embedding_jobs WHERE status IN ('pending', 'processing')")
                .execute(&self.pool)
                .await?;

        Ok(result.rows_affected())
    }

    async fn reset_terminal(&self) -> Result<u64, AppError> {
        let result = sqlx::query(
            r#"
            UPDATE embedding_jobs
            SET
                status = 'pending',
                last_error = NULL,
                cooldown_until = NULL
            WHERE id IN (
                SELECT DISTINCT ON (record_id, record_kind) id
                FROM embedding_jobs j
                WHERE status IN ('completed', 'failed')
                  AND NOT EXISTS (
                      SELECT 1 FROM embedding_jobs o
                      WHERE o.record_id = j.record_id
                        AND o.record_kind = j.record_kind
                        AND o.status IN ('pending', 'processing')
                  )
                ORDER BY record_id, record_kind, created_at DESC
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn requeue_failed(&self, max_attempts: u32) -> Result<u64, AppError> {
        let result = sqlx::query(
            r#"
            UPDATE embedding_jobs
            SET
                status = 'pending',
                last_error = NULL
            WHERE id IN (
                SELECT DISTINCT ON (record_id, record_kind) id
                FROM embedding_jobs j
                WHERE status = 'failed'
                  AND attempts < $1
                  AND NOT EXISTS (
                      SELECT 1 FROM embedding_jobs o
                      WHERE o.record_id = j.record_id
                        AND o.record_kind = j.record_kind
                        AND o.status IN ('pending', 'processing')
                  )
                ORDER BY record_id, record_kind, created_at DESC
            )
            "#,
        )
        .bind(max_attempts as i32)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn get_job(&self, job_id: Uuid) -> Result<Option<Job>, AppError> {
        let row: Option<JobRow> = sqlx::query_as("SELECT * FROM embedding_jobs WHERE id = $1")
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(Into::into))
    }

    async fn list_jobs(
        &self,
        status: Option<JobStatus>,
        limit: usize,
    ) -> Result<Vec<Job>, AppError> {
        let rows: Vec<JobRow> = if let Some(s) = status {
            sqlx::query_as(
                r#"
                SELECT * FROM embedding_jobs
                WHERE status = $1
                ORDER BY created_at DESC
                LIMIT $2
                "#,
            )
            .bind(s.as_str())
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?
        } else {
            sqlx::query_as(
                r#"
                SELECT * FROM embedding_jobs
                ORDER BY created_at DESC
                LIMIT $1
                "#,
            )
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?
        };

        Ok(rows.into_iter().map(Into::into).collect())
    }
}
