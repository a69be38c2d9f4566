//! Semantic search over enriched content.

use pgvector::Vector;

use crate::error::AppError;
use crate::models::SearchHit;
use crate::retry::{RetryPolicy, with_retry};
use crate::traits::{ContentStore, EmbeddingProvider};

/// Largest result set a single query may ask for.
pub const MAX_SEARCH_LIMIT: usize = 100;

/// Embeds a query and returns the nearest posts and comments.
#[derive(Clone)]
pub struct SearchService<S, E>
where
    S: ContentStore,
    E: EmbeddingProvider,
{
    store: S,
    embedding: E,
    retry: RetryPolicy,
}

impl<S, E> SearchService<S, E>
where
    S: ContentStore,
    E: EmbeddingProvider,
{
    pub fn new(store: S, embedding: E) -> Self {
        Self {
            store,
            embedding,
            retry: RetryPolicy::embedding(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Searches for content semantically similar to `query`.
    ///
    /// `limit` is clamped to `1..=MAX_SEARCH_LIMIT`. Results are ordered by
    /// descending similarity.
    pub async fn search(&self, query: &str, limit: usize) -> Result<Vec<SearchHit>, AppError> {
        let query = query.trim();
        if query.is_empty() {
            return Err(AppError::permanent("search query is empty"));
        }

        let values = with_retry(&self.retry, || self.embedding.generate(query)).await?;
        let mut hits = self
            .store
            .search(Vector::from(values), limit.clamp(1, MAX_SEARCH_LIMIT))
            .await?;
        hits.sort_by(|a, b| b.similarity.total_cmp(&a.similarity));
        Ok(hits)
    }
}
