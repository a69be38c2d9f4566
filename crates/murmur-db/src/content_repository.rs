//! Content repository for posts and comments with pgvector support.
//!
//! Serves three roles for the queue engine:
//! - [`ContentSource`]: keyset scan over content that still needs an embedding
//! - [`ContentStore`]: text loading, enrichment persistence and vector search
//! - seeding helpers used by ingestion and tests

use chrono::{DateTime, Utc};
use pgvector::Vector;
use sqlx::{PgPool, Pool, Postgres};

use murmur_core::error::AppError;
use murmur_core::job::{ContentRef, RecordKind};
use murmur_core::models::{ContentPage, ContentText, Entities, SearchHit};
use murmur_core::traits::{ContentSource, ContentStore};

/// Characters of body text returned with each search hit.
const SNIPPET_CHARS: i32 = 280;

/// Repository for post and comment content in PostgreSQL with pgvector.
///
/// # Examples
///
/// ```no_run
/// use sqlx::postgres::PgPoolOptions;
/// use murmur_db::ContentRepository;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let pool = PgPoolOptions::new()
///     .max_connections(5)
///     .connect("postgresql://localhost/murmur")
///     .await?;
///
/// let repo = ContentRepository::new(pool);
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct ContentRepository {
    pool: Pool<Postgres>,
}

impl ContentRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Inserts or updates a post. An update bumps `updated_at`, which marks
    /// the post as changed for the next scan.
    pub async fn upsert_post(
        &self,
        id: &str,
        title: &str,
        body: Option<&str>,
    ) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO posts (id, title, body)
            VALUES ($1, $2, $3)
            ON CONFLICT (id)
            DO UPDATE SET
                title = EXCLUDED.title,
                body = EXCLUDED.body,
                updated_at = NOW()
            "#,
        )
        .bind(id)
        .bind(title)
        .bind(body)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Inserts or updates a comment.
    pub async fn upsert_comment(&self, id: &str, post_id: &str, body: &str) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO comments (id, post_id, body)
            VALUES ($1, $2, $3)
            ON CONFLICT (id)
            DO UPDATE SET
                post_id = EXCLUDED.post_id,
                body = EXCLUDED.body,
                updated_at = NOW()
            "#,
        )
        .bind(id)
        .bind(post_id)
        .bind(body)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Returns the stored enrichment of a record, if it has been embedded.
    pub async fn enrichment(
        &self,
        record_id: &str,
        record_kind: &RecordKind,
    ) -> Result<Option<(Vector, Entities)>, AppError> {
        let table = table_for(record_kind)?;
        let query = format!(
            "SELECT embedding, topics, locations, tags FROM {} WHERE id = $1 AND embedding IS NOT NULL",
            table
        );
        let row: Option<EnrichmentRow> = sqlx::query_as(&query)
            .bind(record_id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(|r| {
            (
                r.embedding,
                Entities {
                    topics: r.topics,
                    locations: r.locations,
                    tags: r.tags,
                },
            )
        }))
    }
}

// =============================================================================
// Helper Types for Database Mapping
// =============================================================================

#[derive(sqlx::FromRow)]
struct ScanRow {
    kind: String,
    ord: i32,
    id: String,
    embedded_at: Option<DateTime<Utc>>,
}

#[derive(sqlx::FromRow)]
struct CommentTextRow {
    body: String,
    post_id: String,
    parent_title: Option<String>,
    parent_found: bool,
}

#[derive(sqlx::FromRow)]
struct EnrichmentRow {
    embedding: Vector,
    topics: Vec<String>,
    locations: Vec<String>,
    tags: Vec<String>,
}

#[derive(sqlx::FromRow)]
struct SearchRow {
    record_id: String,
    record_kind: String,
    title: Option<String>,
    snippet: String,
    similarity: f32,
}

/// Table backing a record kind. Must only ever return a const literal since
/// the result is spliced into SQL.
fn table_for(kind: &RecordKind) -> Result<&'static str, AppError> {
    match kind {
        RecordKind::Post => Ok("posts"),
        RecordKind::Comment => Ok("comments"),
        RecordKind::Other(other) => Err(AppError::permanent(format!(
            "unsupported record kind '{}'",
            other
        ))),
    }
}

/// Cursor format is `<ord>:<id>`, where `ord` is 0 for posts and 1 for comments.
fn parse_cursor(cursor: Option<&str>) -> Result<(i32, String), AppError> {
    let Some(cursor) = cursor else {
        return Ok((-1, String::new()));
    };
    let (ord, id) = cursor
        .split_once(':')
        .ok_or_else(|| AppError::permanent(format!("malformed scan cursor '{}'", cursor)))?;
    let ord = ord
        .parse()
        .map_err(|_| AppError::permanent(format!("malformed scan cursor '{}'", cursor)))?;
    Ok((ord, id.to_string()))
}

fn format_cursor(ord: i32, id: &str) -> String {
    format!("{}:{}", ord, id)
}

impl From<ScanRow> for ContentRef {
    fn from(row: ScanRow) -> Self {
        let base = if row.kind == "comment" {
            ContentRef::new_comment(row.id)
        } else {
            ContentRef::new_post(row.id)
        };
        // Already embedded once, so this is an edit.
        if row.embedded_at.is_some() {
            base.updated()
        } else {
            base
        }
    }
}

// =============================================================================
// ContentSource Trait Implementation
// =============================================================================

impl ContentSource for ContentRepository {
    async fn fetch_page(
        &self,
        cursor: Option<String>,
        limit: usize,
    ) -> Result<ContentPage, AppError> {
        let (after_ord, after_id) = parse_cursor(cursor.as_deref())?;

        let rows: Vec<ScanRow> = sqlx::query_as(
            r#"
            SELECT kind, ord, id, embedded_at FROM (
                SELECT 'post' AS kind, 0 AS ord, id, embedded_at
                FROM posts
                WHERE embedding IS NULL OR embedded_at IS NULL OR updated_at > embedded_at
                UNION ALL
                SELECT 'comment' AS kind, 1 AS ord, id, embedded_at
                FROM comments
                WHERE embedding IS NULL OR embedded_at IS NULL OR updated_at > embedded_at
            ) scan
            WHERE (ord, id) > ($1, $2)
            ORDER BY ord, id
            LIMIT $3
            "#,
        )
        .bind(after_ord)
        .bind(&after_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        let next_cursor = if rows.len() == limit {
            rows.last().map(|row| format_cursor(row.ord, &row.id))
        } else {
            None
        };

        Ok(ContentPage {
            items: rows.into_iter().map(Into::into).collect(),
            next_cursor,
        })
    }
}

// =============================================================================
// ContentStore Trait Implementation
// =============================================================================

impl ContentStore for ContentRepository {
    async fn load_text(
        &self,
        record_id: &str,
        record_kind: &RecordKind,
    ) -> Result<ContentText, AppError> {
        match record_kind {
            RecordKind::Post => {
                let row: Option<(String, Option<String>)> =
                    sqlx::query_as("SELECT title, body FROM posts WHERE id = $1")
                        .bind(record_id)
                        .fetch_optional(&self.pool)
                        .await?;
                let (title, body) =
                    row.ok_or_else(|| AppError::permanent(format!("post {} not found", record_id)))?;

                let text = match body.as_deref().map(str::trim) {
                    Some(body) if !body.is_empty() => format!("{}\n\n{}", title.trim(), body),
                    _ => title.trim().to_string(),
                };
                Ok(ContentText {
                    record_id: record_id.to_string(),
                    record_kind: RecordKind::Post,
                    text,
                    context: None,
                })
            }
            RecordKind::Comment => {
                let row: Option<CommentTextRow> = sqlx::query_as(
                    r#"
                    SELECT
                        c.body,
                        c.post_id,
                        p.title AS parent_title,
                        p.id IS NOT NULL AS parent_found
                    FROM comments c
                    LEFT JOIN posts p ON p.id = c.post_id
                    WHERE c.id = $1
                    "#,
                )
                .bind(record_id)
                .fetch_optional(&self.pool)
                .await?;
                let row = row
                    .ok_or_else(|| AppError::permanent(format!("comment {} not found", record_id)))?;

                if !row.parent_found {
                    return Err(AppError::permanent(format!(
                        "parent post {} of comment {} is missing",
                        row.post_id, record_id
                    )));
                }
                Ok(ContentText {
                    record_id: record_id.to_string(),
                    record_kind: RecordKind::Comment,
                    text: row.body,
                    context: row.parent_title,
                })
            }
            RecordKind::Other(other) => Err(AppError::permanent(format!(
                "unsupported record kind '{}'",
                other
            ))),
        }
    }

    async fn save_enrichment(
        &self,
        record_id: &str,
        record_kind: &RecordKind,
        embedding: Vector,
        entities: &Entities,
    ) -> Result<(), AppError> {
        let table = table_for(record_kind)?;
        let query = format!(
            r#"
            UPDATE {}
            SET
                embedding = $2,
                embedded_at = NOW(),
                topics = $3,
                locations = $4,
                tags = $5
            WHERE id = $1
            "#,
            table
        );

        let result = sqlx::query(&query)
            .bind(record_id)
            .bind(embedding)
            .bind(&entities.topics)
            .bind(&entities.locations)
            .bind(&entities.tags)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(AppError::permanent(format!(
                "{} {} was deleted before it could be enriched",
                record_kind, record_id
            )));
        }
        Ok(())
    }

    async fn search(&self, query: Vector, limit: usize) -> Result<Vec<SearchHit>, AppError> {
        let rows: Vec<SearchRow> = sqlx::query_as(
            r#"
            SELECT record_id, record_kind, title, snippet, similarity FROM (
                SELECT
                    id AS record_id,
                    'post' AS record_kind,
                    title,
                    LEFT(COALESCE(body, title), $3) AS snippet,
                    (1 - (embedding <=> $1))::real AS similarity
                FROM posts
                WHERE embedding IS NOT NULL
                UNION ALL
                SELECT
                    c.id,
                    'comment',
                    p.title,
                    LEFT(c.body, $3),
                    (1 - (c.embedding <=> $1))::real
                FROM comments c
                LEFT JOIN posts p ON p.id = c.post_id
                WHERE c.embedding IS NOT NULL
            ) hits
            ORDER BY similarity DESC
            LIMIT $2
            "#,
        )
        .bind(query)
        .bind(limit as i64)
        .bind(SNIPPET_CHARS)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| SearchHit {
                record_id: row.record_id,
                record_kind: RecordKind::from(row.record_kind.as_str()),
                title: row.title,
                snippet: row.snippet,
                similarity: row.similarity,
            })
            .collect())
    }
}
