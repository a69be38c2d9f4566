//! Producer, embedding pipeline and search wired to mock collaborators.

use murmur_core::job_queue::JobQueue;
use murmur_core::{
    AppError, BatchWorker, ContentRef, EmbeddingPipeline, JobStatus, MemoryJobQueue,
    PriorityMap, Producer, ProducerConfig, QueueDriver, RecordKind, SearchService,
    SilentReporter, SilentWorkerReporter, WorkerConfig,
};
use murmur_core::traits::ContentProcessor;
use tokio_util::sync::CancellationToken;

use crate::integration::common::{
    MockContentSource, MockContentStore, MockEmbeddingProvider, MockEntityExtractor, fast_driver,
    fast_retry,
};

fn pipeline(
    store: MockContentStore,
    embedding: MockEmbeddingProvider,
) -> EmbeddingPipeline<MockContentStore, MockEmbeddingProvider, MockEntityExtractor> {
    EmbeddingPipeline::new(store, embedding, MockEntityExtractor)
        .with_api_retry(fast_retry(4))
        .with_store_retry(fast_retry(2))
}

#[tokio::test]
async fn test_populate_pages_through_source_and_skips_duplicates() {
    // Arrange: 7 items, one of them queued twice
    let mut items: Vec<ContentRef> = (0..6)
        .map(|i| ContentRef::new_post(format!("post-{}", i)))
        .collect();
    items.push(ContentRef::new_post("post-0").updated());
    let source = MockContentSource::new(items).failing_first(1);

    let queue = MemoryJobQueue::new();
    let producer = Producer::new(
        queue.clone(),
        ProducerConfig::default()
            .with_page_size(3)
            .with_fetch_retry(fast_retry(3)),
    );

    // Act
    let summary = producer.populate(&source).await.unwrap();

    // Assert
    assert_eq!(summary.pages, 3);
    assert_eq!(summary.scanned, 7);
    assert_eq!(summary.enqueued, 6);
    assert_eq!(summary.skipped, 1);
    assert_eq!(source.fetches(), 4);
    assert_eq!(queue.count_by_status(JobStatus::Pending).await.unwrap(), 6);
}

#[tokio::test]
async fn test_populate_respects_queue_cap() {
    let items: Vec<ContentRef> = (0..10)
        .map(|i| ContentRef::new_comment(format!("c{}", i)))
        .collect();
    let queue = MemoryJobQueue::new();
    let producer = Producer::new(
        queue.clone(),
        ProducerConfig::default()
            .with_page_size(4)
            .with_max_queue_size(5),
    );

    let summary = producer
        .populate(&MockContentSource::new(items))
        .await
        .unwrap();

    assert_eq!(summary.enqueued, 10);
    assert_eq!(summary.trimmed, 5);
    assert_eq!(queue.queue_stats().await.unwrap().non_terminal(), 5);
}

#[tokio::test]
async fn test_populated_priorities_follow_change_kind() {
    let queue = MemoryJobQueue::new();
    let producer = Producer::new(queue.clone(), ProducerConfig::default());
    producer
        .enqueue_batch(&[
            ContentRef::new_post("a"),
            ContentRef::new_comment("b").updated(),
        ])
        .await
        .unwrap();

    let priorities = PriorityMap::default();
    let claimed = queue.claim_batch(10).await.unwrap();
    assert_eq!(claimed[0].record_id, "a");
    assert_eq!(claimed[0].priority, priorities.new_post);
    assert_eq!(claimed[1].priority, priorities.updated_comment);
}

#[tokio::test]
async fn test_pipeline_enriches_comment_with_post_context() {
    let store = MockContentStore::new();
    store.add_post("p1", "Flooding in Valencia");
    store.add_comment("c1", "p1", "Roads closed near the Port");
    let embedding = MockEmbeddingProvider::new(8).rate_limited_first(2);

    pipeline(store.clone(), embedding.clone())
        .process_item("c1", &RecordKind::Comment)
        .await
        .unwrap();

    let saved = store.get("comment", "c1").unwrap();
    assert_eq!(saved.embedding.unwrap().to_vec().len(), 8);
    let entities = saved.entities.unwrap();
    assert!(entities.topics.contains(&"valencia".to_string()));
    assert!(entities.topics.contains(&"port".to_string()));
    assert_eq!(embedding.calls(), 3);
}

#[tokio::test]
async fn test_orphan_comment_is_a_permanent_failure() {
    let store = MockContentStore::new();
    store.add_comment("c9", "deleted-post", "still here");

    let err = pipeline(store, MockEmbeddingProvider::new(8))
        .process_item("c9", &RecordKind::Comment)
        .await
        .unwrap_err();

    assert!(matches!(err, AppError::Permanent { .. }));
}

#[tokio::test]
async fn test_worker_marks_orphan_comment_failed() {
    let store = MockContentStore::new();
    store.add_comment("c9", "deleted-post", "still here");
    let queue = MemoryJobQueue::new();
    Producer::new(queue.clone(), ProducerConfig::default())
        .enqueue(&ContentRef::new_comment("c9"))
        .await
        .unwrap();

    let worker = BatchWorker::new(
        queue.clone(),
        pipeline(store, MockEmbeddingProvider::new(8)),
        WorkerConfig::default().with_item_retry(fast_retry(2)),
    );
    let job = queue.claim_batch(1).await.unwrap().remove(0);
    assert!(worker.process(&job).await.is_err());

    let stored = queue.get_job(job.id).await.unwrap().unwrap();
    assert_eq!(stored.status, JobStatus::Failed);
    assert_eq!(stored.attempts, 1);
    assert!(stored.last_error.unwrap().contains("deleted-post"));
}

#[tokio::test]
async fn test_dimension_mismatch_is_rejected() {
    #[derive(Clone)]
    struct ShortVectors;

    impl murmur_core::EmbeddingProvider for ShortVectors {
        fn name(&self) -> &'static str {
            "short"
        }
        fn dimension(&self) -> usize {
            16
        }
        async fn generate(&self, _text: &str) -> Result<Vec<f32>, AppError> {
            Ok(vec![0.5; 4])
        }
    }

    let store = MockContentStore::new();
    store.add_post("p1", "hello");
    let err = EmbeddingPipeline::new(store, ShortVectors, MockEntityExtractor)
        .process_item("p1", &RecordKind::Post)
        .await
        .unwrap_err();

    assert!(matches!(err, AppError::Permanent { .. }));
}

#[tokio::test]
async fn test_queue_run_then_search_finds_enriched_content() {
    let store = MockContentStore::new();
    store.add_post("p1", "Harbour festival tonight");
    store.add_post("p2", "Traffic jam on the ring road this morning");
    store.add_comment("c1", "p1", "Fireworks at ten");

    let queue = MemoryJobQueue::new();
    let producer = Producer::new(queue.clone(), ProducerConfig::default());
    producer
        .enqueue_batch(&[
            ContentRef::new_post("p1"),
            ContentRef::new_post("p2"),
            ContentRef::new_comment("c1"),
        ])
        .await
        .unwrap();

    let embedding = MockEmbeddingProvider::new(8);
    let driver = QueueDriver::new(
        queue.clone(),
        pipeline(store.clone(), embedding.clone()),
        fast_driver(10, 1),
    );
    let summary = driver
        .run(CancellationToken::new(), &SilentReporter, &SilentWorkerReporter)
        .await
        .unwrap();
    assert_eq!(summary.completed, 3);

    let hits = SearchService::new(store, embedding)
        .with_retry(fast_retry(2))
        .search("festival", 2)
        .await
        .unwrap();
    assert_eq!(hits.len(), 2);
    assert!(hits[0].similarity >= hits[1].similarity);
}

#[tokio::test]
async fn test_empty_search_query_is_rejected() {
    let service = SearchService::new(MockContentStore::new(), MockEmbeddingProvider::new(8));
    let err = service.search("   ", 5).await.unwrap_err();
    assert!(matches!(err, AppError::Permanent { .. }));
}
