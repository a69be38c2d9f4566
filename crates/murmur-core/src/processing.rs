//! Content-processing pipeline behind every job.
//!
//! ```text
//! load text ──→ embed (retried) ──→ extract entities (retried) ──→ save both
//! ```
//!
//! Re-running the pipeline overwrites the previous enrichment, so a job can be
//! replayed from scratch after a crash or a manual reset.

use pgvector::Vector;
use tracing::debug;

use crate::error::AppError;
use crate::job::RecordKind;
use crate::retry::{RetryPolicy, with_retry};
use crate::traits::{ContentProcessor, ContentStore, EmbeddingProvider, EntityExtractor};

/// Embeds content and extracts its entities.
#[derive(Clone)]
pub struct EmbeddingPipeline<S, E, X>
where
    S: ContentStore,
    E: EmbeddingProvider,
    X: EntityExtractor,
{
    store: S,
    embedding: E,
    extractor: X,
    api_retry: RetryPolicy,
    store_retry: RetryPolicy,
}

impl<S, E, X> EmbeddingPipeline<S, E, X>
where
    S: ContentStore,
    E: EmbeddingProvider,
    X: EntityExtractor,
{
    pub fn new(store: S, embedding: E, extractor: X) -> Self {
        Self {
            store,
            embedding,
            extractor,
            api_retry: RetryPolicy::embedding(),
            store_retry: RetryPolicy::database(),
        }
    }

    /// Overrides the retry policy around embedding and extraction calls.
    pub fn with_api_retry(mut self, policy: RetryPolicy) -> Self {
        self.api_retry = policy;
        self
    }

    pub fn with_store_retry(mut self, policy: RetryPolicy) -> Self {
        self.store_retry = policy;
        self
    }
}

impl<S, E, X> ContentProcessor for EmbeddingPipeline<S, E, X>
where
    S: ContentStore,
    E: EmbeddingProvider,
    X: EntityExtractor,
{
    async fn process_item(&self, record_id: &str, record_kind: &RecordKind) -> Result<(), AppError> {
        let content = with_retry(&self.store_retry, || {
            self.store.load_text(record_id, record_kind)
        })
        .await?;

        let input = content.embedding_input();
        if input.is_empty() {
            return Err(AppError::permanent(format!(
                "{} {} has no text to embed",
                record_kind, record_id
            )));
        }

        let values = with_retry(&self.api_retry, || self.embedding.generate(&input)).await?;
        if values.len() != self.embedding.dimension() {
            return Err(AppError::permanent(format!(
                "{} returned {} dimensions, expected {}",
                self.embedding.name(),
                values.len(),
                self.embedding.dimension()
            )));
        }

        let entities = with_retry(&self.api_retry, || self.extractor.extract(&input))
            .await?
            .normalized();

        let vector = Vector::from(values);
        with_retry(&self.store_retry, || {
            self.store
                .save_enrichment(record_id, record_kind, vector.clone(), &entities)
        })
        .await?;

        debug!(
            record_id,
            kind = %record_kind,
            topics = entities.topics.len(),
            locations = entities.locations.len(),
            tags = entities.tags.len(),
            "Content enriched"
        );
        Ok(())
    }
}
