//! Integration tests for JobRepository.
//!
//! These tests verify the queue semantics against a real PostgreSQL database
//! with pgvector extension. Each test runs in an isolated container.

use std::collections::HashSet;
use std::time::Duration;

use chrono::{TimeDelta, Utc};
use futures::future::join_all;
use murmur_core::job::{ContentRef, JobStatus, NewJob};
use murmur_core::job_queue::JobQueue;
use murmur_core::{
    AppError, ContentProcessor, DriverConfig, OrphanReaper, QueueDriver, RecordKind,
    SilentReporter, SilentWorkerReporter, WorkerConfig,
};
use murmur_db::JobRepository;
use tokio_util::sync::CancellationToken;

use crate::integration::common::{post_job, setup_test_db};

#[tokio::test]
async fn test_insert_deduplicates_open_jobs() {
    let (pool, _container) = setup_test_db().await;
    let repo = JobRepository::new(pool);

    let first = repo.insert_if_absent(post_job("p1", 8)).await.unwrap();
    let second = repo.insert_if_absent(post_job("p1", 9)).await.unwrap();

    let job = first.expect("first insert creates a job");
    assert!(second.is_none(), "duplicate open job must be skipped");
    assert_eq!(job.status, JobStatus::Pending);
    assert_eq!(job.attempts, 0);
    assert_eq!(job.source_table, "posts");

    // Same id but a different kind is a different record.
    let comment = repo
        .insert_if_absent(NewJob::new(&ContentRef::new_comment("p1"), 5))
        .await
        .unwrap();
    assert!(comment.is_some());

    // Once terminal, the record may be queued again.
    let claimed = repo.claim_batch(10).await.unwrap();
    for job in &claimed {
        repo.complete_job(job.id).await.unwrap();
    }
    assert!(repo.insert_if_absent(post_job("p1", 9)).await.unwrap().is_some());
}

#[tokio::test]
async fn test_claim_orders_by_priority_then_age() {
    let (pool, _container) = setup_test_db().await;
    let repo = JobRepository::new(pool);

    let mut ids = Vec::new();
    for (i, priority) in [3, 9, 5, 9, 1].into_iter().enumerate() {
        let job = repo
            .insert_if_absent(post_job(&format!("r{}", i), priority))
            .await
            .unwrap()
            .unwrap();
        ids.push(job.id);
        // Distinct created_at values for the tie on priority 9.
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let first = repo.claim_batch(2).await.unwrap();
    assert_eq!(
        first.iter().map(|j| j.id).collect::<Vec<_>>(),
        vec![ids[1], ids[3]]
    );
    assert!(first.iter().all(|j| j.status == JobStatus::Processing));
    assert!(first.iter().all(|j| j.processed_at.is_some()));

    let rest = repo.claim_batch(10).await.unwrap();
    assert_eq!(
        rest.iter().map(|j| j.priority).collect::<Vec<_>>(),
        vec![5, 3, 1]
    );
    assert!(repo.claim_batch(10).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_concurrent_claims_are_disjoint() {
    let (pool, _container) = setup_test_db().await;
    let repo = JobRepository::new(pool);
    for i in 0..60 {
        repo.insert_if_absent(post_job(&format!("c{}", i), (i % 10 + 1) as i16))
            .await
            .unwrap();
    }

    let claims = join_all((0..6).map(|_| {
        let repo = repo.clone();
        async move { repo.claim_batch(15).await.unwrap() }
    }))
    .await;

    let mut seen = HashSet::new();
    for batch in claims {
        for job in batch {
            assert!(seen.insert(job.id), "job {} claimed twice", job.id);
        }
    }
    assert!(seen.len() <= 60);

    // A claimer can come back short when rows it skipped were taken by a
    // concurrent claim; whatever is left is still claimable exactly once.
    loop {
        let batch = repo.claim_batch(15).await.unwrap();
        if batch.is_empty() {
            break;
        }
        for job in batch {
            assert!(seen.insert(job.id), "job {} claimed twice", job.id);
        }
    }
    assert_eq!(seen.len(), 60);
}

#[tokio::test]
async fn test_cooldown_blocks_claim() {
    let (pool, _container) = setup_test_db().await;
    let repo = JobRepository::new(pool);

    repo.insert_if_absent(
        post_job("hot", 10).with_cooldown_until(Utc::now() + TimeDelta::minutes(30)),
    )
    .await
    .unwrap();
    repo.insert_if_absent(post_job("cool", 1)).await.unwrap();

    let claimed = repo.claim_batch(10).await.unwrap();
    assert_eq!(claimed.len(), 1);
    assert_eq!(claimed[0].record_id, "cool");
    assert_eq!(repo.count_by_status(JobStatus::Pending).await.unwrap(), 1);
}

#[tokio::test]
async fn test_fail_increments_attempts_and_requeue_keeps_them() {
    let (pool, _container) = setup_test_db().await;
    let repo = JobRepository::new(pool);
    let job = repo
        .insert_if_absent(post_job("flaky", 5))
        .await
        .unwrap()
        .unwrap();

    for n in 1..=3u32 {
        let claimed = repo.claim_batch(1).await.unwrap();
        assert_eq!(claimed[0].id, job.id);
        repo.fail_job(job.id, "upstream said no").await.unwrap();

        let stored = repo.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Failed);
        assert_eq!(stored.attempts, n);
        assert_eq!(stored.last_error.as_deref(), Some("upstream said no"));

        assert_eq!(repo.requeue_failed(3).await.unwrap(), u64::from(n < 3));
    }

    let stored = repo.get_job(job.id).await.unwrap().unwrap();
    assert_eq!(stored.status, JobStatus::Failed);
    assert_eq!(stored.attempts, 3);
}

#[tokio::test]
async fn test_complete_unknown_job_is_not_found() {
    let (pool, _container) = setup_test_db().await;
    let repo = JobRepository::new(pool);

    let err = repo.complete_job(uuid::Uuid::new_v4()).await.unwrap_err();
    assert!(matches!(err, AppError::JobNotFound(_)));
}

#[tokio::test]
async fn test_late_finalize_does_not_overwrite_new_owner() {
    let (pool, _container) = setup_test_db().await;
    let repo = JobRepository::new(pool);
    let job = repo.insert_if_absent(post_job("slow", 5)).await.unwrap().unwrap();

    // Not claimed yet.
    let err = repo.complete_job(job.id).await.unwrap_err();
    assert!(matches!(err, AppError::ClaimLost(id) if id == job.id));

    // First worker claims, the reaper takes the job back, a second worker
    // claims and completes it.
    repo.claim_batch(1).await.unwrap();
    assert_eq!(
        repo.reclaim_stuck(Utc::now() + TimeDelta::seconds(5))
            .await
            .unwrap(),
        1
    );
    repo.claim_batch(1).await.unwrap();
    repo.complete_job(job.id).await.unwrap();

    // The first worker's late outcome is rejected.
    let err = repo.fail_job(job.id, "timed out").await.unwrap_err();
    assert!(matches!(err, AppError::ClaimLost(_)));

    let stored = repo.get_job(job.id).await.unwrap().unwrap();
    assert_eq!(stored.status, JobStatus::Completed);
    assert_eq!(stored.attempts, 0);
    assert!(stored.last_error.is_none());
}

#[tokio::test]
async fn test_release_only_touches_processing_jobs() {
    let (pool, _container) = setup_test_db().await;
    let repo = JobRepository::new(pool);
    let job = repo.insert_if_absent(post_job("r", 5)).await.unwrap().unwrap();

    repo.claim_batch(1).await.unwrap();
    repo.release_job(job.id).await.unwrap();
    assert_eq!(
        repo.get_job(job.id).await.unwrap().unwrap().status,
        JobStatus::Pending
    );

    repo.claim_batch(1).await.unwrap();
    repo.complete_job(job.id).await.unwrap();
    repo.release_job(job.id).await.unwrap();
    assert_eq!(
        repo.get_job(job.id).await.unwrap().unwrap().status,
        JobStatus::Completed
    );
}

#[tokio::test]
async fn test_reaper_reclaims_once() {
    let (pool, _container) = setup_test_db().await;
    let repo = JobRepository::new(pool.clone());
    for i in 0..3 {
        repo.insert_if_absent(post_job(&format!("s{}", i), 5))
            .await
            .unwrap();
    }
    repo.claim_batch(3).await.unwrap();
    sqlx::query("UPDATE embedding_jobs SET processed_at = NOW() - INTERVAL '2 hours'")
        .execute(&pool)
        .await
        .unwrap();

    let reaper = OrphanReaper::new(repo.clone(), Duration::from_secs(30 * 60));
    assert_eq!(reaper.reap().await.unwrap(), 3);
    assert_eq!(reaper.reap().await.unwrap(), 0);

    let stats = repo.queue_stats().await.unwrap();
    assert_eq!(stats.pending, 3);
    assert_eq!(stats.processing, 0);
}

#[tokio::test]
async fn test_trim_surplus_drops_lowest_priority_pending() {
    let (pool, _container) = setup_test_db().await;
    let repo = JobRepository::new(pool);
    for (id, priority) in [("a", 2), ("b", 9), ("c", 1), ("d", 7), ("e", 2)] {
        repo.insert_if_absent(post_job(id, priority)).await.unwrap();
    }
    // One in-flight job counts toward the cap but is never trimmed.
    let in_flight = repo.claim_batch(1).await.unwrap();
    assert_eq!(in_flight[0].record_id, "b");

    assert_eq!(repo.trim_surplus(3).await.unwrap(), 2);

    let remaining: HashSet<String> = repo
        .list_jobs(None, 10)
        .await
        .unwrap()
        .into_iter()
        .map(|j| j.record_id)
        .collect();
    assert_eq!(
        remaining,
        ["b", "d", "e"].into_iter().map(String::from).collect()
    );
    assert_eq!(repo.trim_surplus(3).await.unwrap(), 0);
}

#[tokio::test]
async fn test_prune_keeps_most_recent_terminal_jobs() {
    let (pool, _container) = setup_test_db().await;
    let repo = JobRepository::new(pool);
    for i in 0..6 {
        repo.insert_if_absent(post_job(&format!("t{}", i), 5))
            .await
            .unwrap();
    }
    repo.insert_if_absent(post_job("open", 5)).await.unwrap();

    for job in repo.claim_batch(6).await.unwrap() {
        repo.complete_job(job.id).await.unwrap();
        tokio::time::sleep(Duration::from_millis(2)).await;
    }

    assert_eq!(repo.prune_terminal(2).await.unwrap(), 4);
    let stats = repo.queue_stats().await.unwrap();
    assert_eq!(stats.terminal(), 2);
    assert_eq!(stats.non_terminal(), 1);
}

#[tokio::test]
async fn test_clear_and_reset() {
    let (pool, _container) = setup_test_db().await;
    let repo = JobRepository::new(pool);
    for id in ["x", "y", "z"] {
        repo.insert_if_absent(post_job(id, 5)).await.unwrap();
    }
    let claimed = repo.claim_batch(2).await.unwrap();
    repo.complete_job(claimed[0].id).await.unwrap();
    repo.fail_job(claimed[1].id, "boom").await.unwrap();

    // "z" is still pending and gets cleared.
    assert_eq!(repo.clear_non_terminal().await.unwrap(), 1);
    assert_eq!(repo.reset_terminal().await.unwrap(), 2);

    let stats = repo.queue_stats().await.unwrap();
    assert_eq!(stats.pending, 2);
    assert_eq!(stats.terminal(), 0);

    let failed = repo.get_job(claimed[1].id).await.unwrap().unwrap();
    assert_eq!(failed.attempts, 1);
    assert!(failed.last_error.is_none());

    // Nothing terminal left without an open sibling.
    assert_eq!(repo.reset_terminal().await.unwrap(), 0);
}

#[tokio::test]
async fn test_last_processed_at_tracks_completed_jobs() {
    let (pool, _container) = setup_test_db().await;
    let repo = JobRepository::new(pool);
    assert!(repo.last_activity().await.unwrap().is_none());

    assert!(
        repo.last_processed_at("p", &RecordKind::Post)
            .await
            .unwrap()
            .is_none()
    );

    let job = repo.insert_if_absent(post_job("p", 5)).await.unwrap().unwrap();
    repo.claim_batch(1).await.unwrap();
    repo.complete_job(job.id).await.unwrap();

    let last = repo
        .last_processed_at("p", &RecordKind::Post)
        .await
        .unwrap()
        .expect("completed job has a processed_at");
    assert!(last <= Utc::now());
    assert_eq!(repo.last_activity().await.unwrap(), Some(last));
}

#[derive(Clone)]
struct EvenSucceeds;

impl ContentProcessor for EvenSucceeds {
    async fn process_item(&self, record_id: &str, _kind: &RecordKind) -> Result<(), AppError> {
        let n: u32 = record_id.trim_start_matches('j').parse().unwrap_or(1);
        if n % 2 == 0 {
            Ok(())
        } else {
            Err(AppError::permanent("odd record"))
        }
    }
}

#[tokio::test]
async fn test_driver_run_against_postgres() {
    let (pool, _container) = setup_test_db().await;
    let repo = JobRepository::new(pool);
    for i in 0..25 {
        repo.insert_if_absent(post_job(&format!("j{}", i), (i % 10 + 1) as i16))
            .await
            .unwrap();
    }

    let config = DriverConfig::default()
        .with_batch_size(10)
        .with_parallelism(2)
        .with_round_pause(Duration::ZERO)
        .with_hard_pause(Duration::ZERO)
        .with_stagger(Duration::ZERO)
        .with_drain_poll(Duration::from_millis(10))
        .with_worker(WorkerConfig::default().with_inter_item_delay(Duration::ZERO));
    let driver = QueueDriver::new(repo.clone(), EvenSucceeds, config);

    let summary = driver
        .run(CancellationToken::new(), &SilentReporter, &SilentWorkerReporter)
        .await
        .unwrap();

    assert_eq!(summary.completed + summary.failed, 25);
    assert_eq!(summary.completed, 13);
    let stats = repo.queue_stats().await.unwrap();
    assert_eq!(stats.non_terminal(), 0);
    assert_eq!(stats.completed, 13);
    assert_eq!(stats.failed, 12);
}
