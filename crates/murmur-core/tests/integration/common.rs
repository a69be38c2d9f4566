//! Test utilities and mock implementations for integration tests.
//!
//! Provides mock implementations of the collaborator traits so the queue
//! engine can be exercised end to end against [`MemoryJobQueue`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use murmur_core::traits::{
    ContentProcessor, ContentSource, ContentStore, EmbeddingProvider, EntityExtractor,
};
use chrono::{DateTime, Utc};
use murmur_core::{
    AppError, ContentPage, ContentRef, ContentText, DriverConfig, Entities, Job, JobStatus,
    MemoryJobQueue, NewJob, QueueStats, RecordKind, RetryPolicy, SearchHit, TransientKind,
    WorkerConfig,
};
use murmur_core::job_queue::JobQueue;
use pgvector::Vector;
use uuid::Uuid;

/// Retry policy with millisecond delays and no jitter.
pub fn fast_retry(attempts: u32) -> RetryPolicy {
    RetryPolicy::default()
        .with_max_attempts(attempts)
        .with_initial_delay(Duration::from_millis(1))
        .with_max_delay(Duration::from_millis(5))
        .without_jitter()
}

/// Driver configuration without pauses, suitable for tests.
pub fn fast_driver(batch_size: usize, parallelism: usize) -> DriverConfig {
    DriverConfig::default()
        .with_batch_size(batch_size)
        .with_parallelism(parallelism)
        .with_round_pause(Duration::ZERO)
        .with_hard_pause(Duration::ZERO)
        .with_stagger(Duration::ZERO)
        .with_drain_poll(Duration::from_millis(5))
        .with_store_retry(fast_retry(3))
        .with_worker(
            WorkerConfig::default()
                .with_inter_item_delay(Duration::ZERO)
                .with_item_timeout(Duration::from_secs(5))
                .with_item_retry(fast_retry(2))
                .with_store_retry(fast_retry(3)),
        )
}

/// Enqueues `count` posts with priorities cycling through 1..=10.
pub async fn seed_posts(queue: &MemoryJobQueue, count: usize) -> Vec<uuid::Uuid> {
    let mut ids = Vec::with_capacity(count);
    for i in 0..count {
        let priority = (i % 10) as i16 + 1;
        let job = queue
            .insert_if_absent(NewJob::new(&ContentRef::new_post(format!("p{}", i)), priority))
            .await
            .expect("insert")
            .expect("not a duplicate");
        ids.push(job.id);
    }
    ids
}

// =============================================================================
// ScriptedProcessor
// =============================================================================

/// Content processor whose outcome depends on the record id.
///
/// - ids ending in `7` fail permanently
/// - ids starting with `fatal` fail with a fatal error
/// - everything else succeeds
#[derive(Clone, Default)]
pub struct ScriptedProcessor {
    pub calls: Arc<AtomicU32>,
    pub seen: Arc<Mutex<Vec<String>>>,
}

impl ContentProcessor for ScriptedProcessor {
    async fn process_item(&self, record_id: &str, _kind: &RecordKind) -> Result<(), AppError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.seen.lock().unwrap().push(record_id.to_string());
        if record_id.starts_with("fatal") {
            Err(AppError::fatal("invalid API key"))
        } else if record_id.ends_with('7') {
            Err(AppError::permanent("malformed content"))
        } else {
            Ok(())
        }
    }
}

// =============================================================================
// FlakyClaimQueue
// =============================================================================

/// [`MemoryJobQueue`] whose first `claim_failures` claims fail with a
/// connection reset. Status counts can be made to fail as well; every other
/// operation goes straight through.
#[derive(Clone, Default)]
pub struct FlakyClaimQueue {
    pub inner: MemoryJobQueue,
    pub claim_failures: Arc<AtomicU32>,
    pub failing_counts: Arc<AtomicBool>,
}

impl FlakyClaimQueue {
    pub fn new(inner: MemoryJobQueue, claim_failures: u32) -> Self {
        Self {
            inner,
            claim_failures: Arc::new(AtomicU32::new(claim_failures)),
            failing_counts: Arc::default(),
        }
    }

    pub fn with_failing_counts(self) -> Self {
        self.failing_counts.store(true, Ordering::SeqCst);
        self
    }
}

impl JobQueue for FlakyClaimQueue {
    async fn insert_if_absent(&self, job: NewJob) -> Result<Option<Job>, AppError> {
        self.inner.insert_if_absent(job).await
    }

    async fn last_processed_at(
        &self,
        record_id: &str,
        record_kind: &RecordKind,
    ) -> Result<Option<DateTime<Utc>>, AppError> {
        self.inner.last_processed_at(record_id, record_kind).await
    }

    async fn claim_batch(&self, limit: usize) -> Result<Vec<Job>, AppError> {
        let failing = self
            .claim_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(AppError::transient(
                TransientKind::ConnectionReset,
                "connection reset by peer",
            ));
        }
        self.inner.claim_batch(limit).await
    }

    async fn complete_job(&self, job_id: Uuid) -> Result<(), AppError> {
        self.inner.complete_job(job_id).await
    }

    async fn fail_job(&self, job_id: Uuid, error: &str) -> Result<(), AppError> {
        self.inner.fail_job(job_id, error).await
    }

    async fn release_job(&self, job_id: Uuid) -> Result<(), AppError> {
        self.inner.release_job(job_id).await
    }

    async fn reclaim_stuck(&self, older_than: DateTime<Utc>) -> Result<u64, AppError> {
        self.inner.reclaim_stuck(older_than).await
    }

    async fn count_by_status(&self, status: JobStatus) -> Result<u64, AppError> {
        if self.failing_counts.load(Ordering::SeqCst) {
            return Err(AppError::permanent("count query rejected"));
        }
        self.inner.count_by_status(status).await
    }

    async fn queue_stats(&self) -> Result<QueueStats, AppError> {
        self.inner.queue_stats().await
    }

    async fn trim_surplus(&self, max_non_terminal: u64) -> Result<u64, AppError> {
        self.inner.trim_surplus(max_non_terminal).await
    }

    async fn prune_terminal(&self, keep: u64) -> Result<u64, AppError> {
        self.inner.prune_terminal(keep).await
    }

    async fn clear_non_terminal(&self) -> Result<u64, AppError> {
        self.inner.clear_non_terminal().await
    }

    async fn reset_terminal(&self) -> Result<u64, AppError> {
        self.inner.reset_terminal().await
    }

    async fn requeue_failed(&self, max_attempts: u32) -> Result<u64, AppError> {
        self.inner.requeue_failed(max_attempts).await
    }

    async fn get_job(&self, job_id: Uuid) -> Result<Option<Job>, AppError> {
        self.inner.get_job(job_id).await
    }

    async fn list_jobs(
        &self,
        status: Option<JobStatus>,
        limit: usize,
    ) -> Result<Vec<Job>, AppError> {
        self.inner.list_jobs(status, limit).await
    }
}

// =============================================================================
// FailingProcessor
// =============================================================================

/// Content processor that rejects every record.
#[derive(Clone, Default)]
pub struct FailingProcessor;

impl ContentProcessor for FailingProcessor {
    async fn process_item(&self, record_id: &str, _kind: &RecordKind) -> Result<(), AppError> {
        Err(AppError::permanent(format!("downstream rejected {}", record_id)))
    }
}

// =============================================================================
// MockEmbeddingProvider
// =============================================================================

/// Mock embedding provider that returns deterministic vectors.
///
/// Can be told to fail the first `failures` calls with a rate limit.
#[derive(Clone)]
pub struct MockEmbeddingProvider {
    dimension: usize,
    failures: u32,
    calls: Arc<AtomicU32>,
}

impl MockEmbeddingProvider {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension,
            failures: 0,
            calls: Arc::new(AtomicU32::new(0)),
        }
    }

    pub fn rate_limited_first(mut self, failures: u32) -> Self {
        self.failures = failures;
        self
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

impl EmbeddingProvider for MockEmbeddingProvider {
    fn name(&self) -> &'static str {
        "mock"
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn generate(&self, text: &str) -> Result<Vec<f32>, AppError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call < self.failures {
            return Err(AppError::transient(TransientKind::RateLimited, "429"));
        }
        let seed = text.len() as f32;
        Ok((0..self.dimension)
            .map(|i| (seed + i as f32) / 1000.0)
            .collect())
    }
}

// =============================================================================
// MockEntityExtractor
// =============================================================================

/// Extracts every capitalised word as a topic.
#[derive(Clone, Default)]
pub struct MockEntityExtractor;

impl EntityExtractor for MockEntityExtractor {
    async fn extract(&self, text: &str) -> Result<Entities, AppError> {
        Ok(Entities {
            topics: text
                .split_whitespace()
                .filter(|w| w.chars().next().is_some_and(char::is_uppercase))
                .map(str::to_string)
                .collect(),
            locations: vec![],
            tags: vec!["mock".to_string()],
        })
    }
}

// =============================================================================
// MockContentStore
// =============================================================================

#[derive(Debug, Clone)]
pub struct StoredContent {
    pub text: String,
    pub parent: Option<String>,
    pub embedding: Option<Vector>,
    pub entities: Option<Entities>,
}

/// In-memory content store keyed by `(kind, id)`.
#[derive(Clone, Default)]
pub struct MockContentStore {
    items: Arc<Mutex<HashMap<(String, String), StoredContent>>>,
}

impl MockContentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_post(&self, id: &str, text: &str) {
        self.insert("post", id, text, None);
    }

    pub fn add_comment(&self, id: &str, parent: &str, text: &str) {
        self.insert("comment", id, text, Some(parent.to_string()));
    }

    fn insert(&self, kind: &str, id: &str, text: &str, parent: Option<String>) {
        self.items.lock().unwrap().insert(
            (kind.to_string(), id.to_string()),
            StoredContent {
                text: text.to_string(),
                parent,
                embedding: None,
                entities: None,
            },
        );
    }

    pub fn get(&self, kind: &str, id: &str) -> Option<StoredContent> {
        self.items
            .lock()
            .unwrap()
            .get(&(kind.to_string(), id.to_string()))
            .cloned()
    }
}

impl ContentStore for MockContentStore {
    async fn load_text(&self, record_id: &str, record_kind: &RecordKind) -> Result<ContentText, AppError> {
        let items = self.items.lock().unwrap();
        let item = items
            .get(&(record_kind.to_string(), record_id.to_string()))
            .ok_or_else(|| AppError::permanent(format!("{} {} not found", record_kind, record_id)))?;

        let context = match &item.parent {
            Some(parent) => {
                let post = items
                    .get(&("post".to_string(), parent.clone()))
                    .ok_or_else(|| {
                        AppError::permanent(format!("parent post {} is missing", parent))
                    })?;
                Some(post.text.clone())
            }
            None => None,
        };

        Ok(ContentText {
            record_id: record_id.to_string(),
            record_kind: record_kind.clone(),
            text: item.text.clone(),
            context,
        })
    }

    async fn save_enrichment(
        &self,
        record_id: &str,
        record_kind: &RecordKind,
        embedding: Vector,
        entities: &Entities,
    ) -> Result<(), AppError> {
        let mut items = self.items.lock().unwrap();
        let item = items
            .get_mut(&(record_kind.to_string(), record_id.to_string()))
            .ok_or_else(|| AppError::permanent("record vanished"))?;
        item.embedding = Some(embedding);
        item.entities = Some(entities.clone());
        Ok(())
    }

    async fn search(&self, query: Vector, limit: usize) -> Result<Vec<SearchHit>, AppError> {
        let query = query.to_vec();
        let items = self.items.lock().unwrap();
        let mut hits: Vec<SearchHit> = items
            .iter()
            .filter_map(|((kind, id), item)| {
                let embedding = item.embedding.as_ref()?.to_vec();
                Some(SearchHit {
                    record_id: id.clone(),
                    record_kind: RecordKind::from(kind.as_str()),
                    title: None,
                    snippet: item.text.clone(),
                    similarity: cosine(&query, &embedding),
                })
            })
            .collect();
        hits.sort_by(|a, b| b.similarity.total_cmp(&a.similarity));
        hits.truncate(limit);
        Ok(hits)
    }
}

fn cosine(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let na: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let nb: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if na == 0.0 || nb == 0.0 {
        0.0
    } else {
        dot / (na * nb)
    }
}

// =============================================================================
// MockContentSource
// =============================================================================

/// Serves a fixed list of content references in pages.
///
/// The cursor is the index of the next item. Fails the first `failures` fetches
/// with a connection reset.
#[derive(Clone)]
pub struct MockContentSource {
    items: Vec<ContentRef>,
    failures: u32,
    fetches: Arc<AtomicU32>,
}

impl MockContentSource {
    pub fn new(items: Vec<ContentRef>) -> Self {
        Self {
            items,
            failures: 0,
            fetches: Arc::new(AtomicU32::new(0)),
        }
    }

    pub fn failing_first(mut self, failures: u32) -> Self {
        self.failures = failures;
        self
    }

    pub fn fetches(&self) -> u32 {
        self.fetches.load(Ordering::SeqCst)
    }
}

impl ContentSource for MockContentSource {
    async fn fetch_page(&self, cursor: Option<String>, limit: usize) -> Result<ContentPage, AppError> {
        let fetch = self.fetches.fetch_add(1, Ordering::SeqCst);
        if fetch < self.failures {
            return Err(AppError::transient(TransientKind::ConnectionReset, "reset by peer"));
        }

        let start: usize = cursor
            .as_deref()
            .map(str::parse)
            .transpose()
            .map_err(|_| AppError::permanent("bad cursor"))?
            .unwrap_or(0);
        let end = (start + limit).min(self.items.len());
        Ok(ContentPage {
            items: self.items[start..end].to_vec(),
            next_cursor: (end < self.items.len()).then(|| end.to_string()),
        })
    }
}
