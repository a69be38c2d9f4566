//! Trait definitions for external collaborators.
//!
//! The queue engine only knows these contracts; PostgreSQL and the HTTP
//! embedding API implement them in `murmur-db` and `murmur-client`, and tests
//! plug in mocks.
//!
//! # Example
//!
//! ```
//! use murmur_core::traits::{ContentStore, EmbeddingProvider};
//! use pgvector::Vector;
//!
//! async fn nearest<E, S>(
//!     embedding: &E,
//!     store: &S,
//!     query: &str,
//! ) -> Result<Vec<murmur_core::SearchHit>, murmur_core::AppError>
//! where
//!     E: EmbeddingProvider,
//!     S: ContentStore,
//! {
//!     let vector: Vector = embedding.generate(query).await?.into();
//!     store.search(vector, 10).await
//! }
//! ```

use std::future::Future;

use pgvector::Vector;

use crate::error::AppError;
use crate::job::RecordKind;
use crate::models::{ContentPage, ContentText, Entities, SearchHit};

/// Does the actual work behind a job.
///
/// Implementations must be safe to re-run from scratch: a job may be
/// processed again after a crash, a reclaim or a manual reset.
pub trait ContentProcessor: Send + Sync + Clone {
    /// Processes one record; fails with a descriptive, classified error.
    fn process_item(
        &self,
        record_id: &str,
        record_kind: &RecordKind,
    ) -> impl Future<Output = Result<(), AppError>> + Send;
}

/// Provider for generating text embeddings.
pub trait EmbeddingProvider: Send + Sync + Clone {
    /// Returns the provider name for logging and configuration.
    fn name(&self) -> &'static str;

    /// Returns the embedding dimension this provider generates.
    fn dimension(&self) -> usize;

    /// Generates an embedding vector for the given text.
    ///
    /// Fails with a transient error for rate limits and connection problems,
    /// which callers retry, or a fatal error for bad credentials.
    fn generate(&self, text: &str) -> impl Future<Output = Result<Vec<f32>, AppError>> + Send;
}

/// Extracts topics, locations and tags from text.
pub trait EntityExtractor: Send + Sync + Clone {
    fn extract(&self, text: &str) -> impl Future<Output = Result<Entities, AppError>> + Send;
}

/// Paginated feed of content that may need processing.
pub trait ContentSource: Send + Sync + Clone {
    /// Fetches the page after `cursor` (the first page when `None`).
    fn fetch_page(
        &self,
        cursor: Option<String>,
        limit: usize,
    ) -> impl Future<Output = Result<ContentPage, AppError>> + Send;
}

/// Store holding the content and its derived embeddings.
pub trait ContentStore: Send + Sync + Clone {
    /// Loads the text to embed for a record.
    ///
    /// A missing record, or a comment whose parent post is gone, is a
    /// permanent error.
    fn load_text(
        &self,
        record_id: &str,
        record_kind: &RecordKind,
    ) -> impl Future<Output = Result<ContentText, AppError>> + Send;

    /// Persists the embedding and entities, overwriting previous values.
    fn save_enrichment(
        &self,
        record_id: &str,
        record_kind: &RecordKind,
        embedding: Vector,
        entities: &Entities,
    ) -> impl Future<Output = Result<(), AppError>> + Send;

    /// Returns the records closest to `query` by cosine similarity.
    fn search(
        &self,
        query: Vector,
        limit: usize,
    ) -> impl Future<Output = Result<Vec<SearchHit>, AppError>> + Send;
}
