//! Database schema for the job queue and the content tables.
//!
//! Statements are idempotent (`IF NOT EXISTS`) and are executed one at a time
//! because sqlx does not run multi-statement strings with bind support.

use murmur_core::error::AppError;
use sqlx::PgPool;
use tracing::info;

/// Dimension of the `embedding` columns.
pub const EMBEDDING_DIMENSION: usize = 1536;

/// Schema statements, in execution order.
pub const MIGRATIONS: &[&str] = &[
    "CREATE EXTENSION IF NOT EXISTS vector",
    r#"CREATE TABLE IF NOT EXISTS posts (
        id TEXT PRIMARY KEY,
        title TEXT NOT NULL DEFAULT '',
        body TEXT,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        embedding vector(1536),
        embedded_at TIMESTAMPTZ,
        topics TEXT[] NOT NULL DEFAULT '{}',
        locations TEXT[] NOT NULL DEFAULT '{}',
        tags TEXT[] NOT NULL DEFAULT '{}'
    )"#,
    r#"CREATE TABLE IF NOT EXISTS comments (
        id TEXT PRIMARY KEY,
        post_id TEXT NOT NULL,
        body TEXT NOT NULL DEFAULT '',
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        embedding vector(1536),
        embedded_at TIMESTAMPTZ,
        topics TEXT[] NOT NULL DEFAULT '{}',
        locations TEXT[] NOT NULL DEFAULT '{}',
        tags TEXT[] NOT NULL DEFAULT '{}'
    )"#,
    "CREATE INDEX IF NOT EXISTS idx_comments_post ON comments(post_id)",
    "CREATE INDEX IF NOT EXISTS idx_posts_embedding ON posts USING hnsw (embedding vector_cosine_ops)",
    "CREATE INDEX IF NOT EXISTS idx_comments_embedding ON comments USING hnsw (embedding vector_cosine_ops)",
    r#"CREATE TABLE IF NOT EXISTS embedding_jobs (
        id UUID PRIMARY KEY DEFAULT gen_random_uuid(),
        record_id TEXT NOT NULL,
        record_kind TEXT NOT NULL,
        source_table TEXT NOT NULL,
        priority SMALLINT NOT NULL DEFAULT 5 CHECK (priority BETWEEN 1 AND 10),
        status TEXT NOT NULL DEFAULT 'pending'
            CHECK (status IN ('pending', 'processing', 'completed', 'failed')),
        attempts INTEGER NOT NULL DEFAULT 0,
        last_error TEXT,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        processed_at TIMESTAMPTZ,
        cooldown_until TIMESTAMPTZ
    )"#,
    // At most one open job per record; the dedup insert relies on it.
    r#"CREATE UNIQUE INDEX IF NOT EXISTS uq_embedding_jobs_open
        ON embedding_jobs(record_id, record_kind)
        WHERE status IN ('pending', 'processing')"#,
    r#"CREATE INDEX IF NOT EXISTS idx_embedding_jobs_claim
        ON embedding_jobs(priority DESC, created_at ASC)
        WHERE status = 'pending'"#,
    "CREATE INDEX IF NOT EXISTS idx_embedding_jobs_status ON embedding_jobs(status)",
];

/// Applies [`MIGRATIONS`] to the given pool.
pub async fn run_migrations(pool: &PgPool) -> Result<(), AppError> {
    for statement in MIGRATIONS {
        sqlx::query(statement).execute(pool).await?;
    }
    info!(statements = MIGRATIONS.len(), "Schema is up to date");
    Ok(())
}
