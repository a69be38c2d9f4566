//! Integration tests for ContentRepository.
//!
//! Covers the content scan used to populate the queue, text loading for the
//! embedding pipeline, enrichment persistence and vector search.

use murmur_core::job::{ChangeKind, RecordKind};
use murmur_core::job_queue::JobQueue;
use murmur_core::models::Entities;
use murmur_core::traits::{ContentSource, ContentStore};
use murmur_core::{AppError, Producer, ProducerConfig};
use murmur_db::{ContentRepository, EMBEDDING_DIMENSION, JobRepository};
use pgvector::Vector;

use crate::integration::common::{setup_test_db, vector_with_seed};

fn entities(topic: &str) -> Entities {
    Entities {
        topics: vec![topic.to_string()],
        locations: vec!["lisbon".to_string()],
        tags: vec![],
    }
}

#[tokio::test]
async fn test_scan_pages_through_posts_then_comments() {
    let (pool, _container) = setup_test_db().await;
    let repo = ContentRepository::new(pool);
    for i in 0..3 {
        repo.upsert_post(&format!("p{}", i), "title", Some("body"))
            .await
            .unwrap();
    }
    for i in 0..2 {
        repo.upsert_comment(&format!("c{}", i), "p0", "reply")
            .await
            .unwrap();
    }

    let first = repo.fetch_page(None, 2).await.unwrap();
    assert_eq!(first.items.len(), 2);
    assert!(first.next_cursor.is_some());

    let second = repo.fetch_page(first.next_cursor, 2).await.unwrap();
    assert_eq!(second.items[0].record_kind, RecordKind::Post);
    assert_eq!(second.items[1].record_kind, RecordKind::Comment);

    let third = repo.fetch_page(second.next_cursor, 2).await.unwrap();
    assert_eq!(third.items.len(), 1);
    assert!(third.next_cursor.is_none());

    let all_new = [first.items, second.items, third.items]
        .concat()
        .iter()
        .all(|item| item.change == ChangeKind::New);
    assert!(all_new);
}

#[tokio::test]
async fn test_scan_skips_fresh_embeddings_and_flags_edits() {
    let (pool, _container) = setup_test_db().await;
    let repo = ContentRepository::new(pool);
    repo.upsert_post("p1", "one", None).await.unwrap();
    repo.upsert_post("p2", "two", None).await.unwrap();

    let vector = Vector::from(vector_with_seed(EMBEDDING_DIMENSION, 1));
    for id in ["p1", "p2"] {
        repo.save_enrichment(id, &RecordKind::Post, vector.clone(), &entities("x"))
            .await
            .unwrap();
    }
    assert!(repo.fetch_page(None, 10).await.unwrap().items.is_empty());

    // Editing after the embedding makes the post stale again.
    tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    repo.upsert_post("p2", "two, edited", None).await.unwrap();

    let page = repo.fetch_page(None, 10).await.unwrap();
    assert_eq!(page.items.len(), 1);
    assert_eq!(page.items[0].record_id, "p2");
    assert_eq!(page.items[0].change, ChangeKind::Updated);
}

#[tokio::test]
async fn test_populate_from_scan_uses_change_priorities() {
    let (pool, _container) = setup_test_db().await;
    let content = ContentRepository::new(pool.clone());
    let jobs = JobRepository::new(pool);
    content.upsert_post("p1", "post", Some("body")).await.unwrap();
    content.upsert_comment("c1", "p1", "comment").await.unwrap();

    let producer = Producer::new(jobs.clone(), ProducerConfig::default().with_page_size(1));
    let summary = producer.populate(&content).await.unwrap();
    assert_eq!(summary.enqueued, 2);
    // Two full pages, then an empty one ends the scan.
    assert_eq!(summary.pages, 3);

    // A second scan finds the same content but the jobs are still open.
    let again = producer.populate(&content).await.unwrap();
    assert_eq!(again.enqueued, 0);
    assert_eq!(again.skipped, 2);

    let claimed = jobs.claim_batch(10).await.unwrap();
    assert_eq!(claimed[0].record_id, "p1");
    assert_eq!(claimed[0].priority, 8);
    assert_eq!(claimed[1].record_id, "c1");
    assert_eq!(claimed[1].priority, 5);
}

#[tokio::test]
async fn test_load_text_for_posts_and_comments() {
    let (pool, _container) = setup_test_db().await;
    let repo = ContentRepository::new(pool);
    repo.upsert_post("p1", "Tram strike", Some("No trams on Friday"))
        .await
        .unwrap();
    repo.upsert_comment("c1", "p1", "Buses too?").await.unwrap();

    let post = repo.load_text("p1", &RecordKind::Post).await.unwrap();
    assert_eq!(post.text, "Tram strike\n\nNo trams on Friday");
    assert!(post.context.is_none());

    let comment = repo.load_text("c1", &RecordKind::Comment).await.unwrap();
    assert_eq!(comment.text, "Buses too?");
    assert_eq!(comment.context.as_deref(), Some("Tram strike"));
}

#[tokio::test]
async fn test_load_text_failures_are_permanent() {
    let (pool, _container) = setup_test_db().await;
    let repo = ContentRepository::new(pool);
    repo.upsert_comment("orphan", "gone", "hello?").await.unwrap();

    let missing = repo.load_text("nope", &RecordKind::Post).await.unwrap_err();
    assert!(matches!(missing, AppError::Permanent { .. }));

    let orphan = repo
        .load_text("orphan", &RecordKind::Comment)
        .await
        .unwrap_err();
    assert!(matches!(orphan, AppError::Permanent { .. }));
    assert!(orphan.to_string().contains("gone"));

    let other = repo
        .load_text("x", &RecordKind::Other("story".into()))
        .await
        .unwrap_err();
    assert!(matches!(other, AppError::Permanent { .. }));
}

#[tokio::test]
async fn test_save_enrichment_overwrites_previous_run() {
    let (pool, _container) = setup_test_db().await;
    let repo = ContentRepository::new(pool);
    repo.upsert_comment("c1", "p1", "text").await.unwrap();

    let first = Vector::from(vector_with_seed(EMBEDDING_DIMENSION, 1));
    let second = Vector::from(vector_with_seed(EMBEDDING_DIMENSION, 2));
    repo.save_enrichment("c1", &RecordKind::Comment, first, &entities("old"))
        .await
        .unwrap();
    repo.save_enrichment("c1", &RecordKind::Comment, second.clone(), &entities("new"))
        .await
        .unwrap();

    let (stored, stored_entities) = repo
        .enrichment("c1", &RecordKind::Comment)
        .await
        .unwrap()
        .expect("comment is enriched");
    assert_eq!(stored.to_vec(), second.to_vec());
    assert_eq!(stored_entities.topics, vec!["new".to_string()]);

    let gone = repo
        .save_enrichment(
            "missing",
            &RecordKind::Post,
            Vector::from(vector_with_seed(EMBEDDING_DIMENSION, 3)),
            &entities("x"),
        )
        .await
        .unwrap_err();
    assert!(matches!(gone, AppError::Permanent { .. }));
}

#[tokio::test]
async fn test_search_ranks_posts_and_comments_by_similarity() {
    let (pool, _container) = setup_test_db().await;
    let repo = ContentRepository::new(pool);
    repo.upsert_post("p1", "Harbour", Some("festival")).await.unwrap();
    repo.upsert_post("p2", "Traffic", Some("jam")).await.unwrap();
    repo.upsert_comment("c1", "p1", "fireworks").await.unwrap();

    for (id, kind, seed) in [
        ("p1", RecordKind::Post, 1),
        ("p2", RecordKind::Post, 4),
        ("c1", RecordKind::Comment, 1),
    ] {
        repo.save_enrichment(
            id,
            &kind,
            Vector::from(vector_with_seed(EMBEDDING_DIMENSION, seed)),
            &entities("t"),
        )
        .await
        .unwrap();
    }

    let hits = repo
        .search(Vector::from(vector_with_seed(EMBEDDING_DIMENSION, 1)), 2)
        .await
        .unwrap();

    assert_eq!(hits.len(), 2);
    let ids: Vec<&str> = hits.iter().map(|h| h.record_id.as_str()).collect();
    assert!(ids.contains(&"p1"));
    assert!(ids.contains(&"c1"));
    assert!(hits[0].similarity > 0.99);
    let comment = hits.iter().find(|h| h.record_id == "c1").unwrap();
    assert_eq!(comment.record_kind, RecordKind::Comment);
    assert_eq!(comment.title.as_deref(), Some("Harbour"));
}
