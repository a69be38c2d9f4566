//! Murmur Core - job queue engine, domain types and services.
//!
//! This crate provides the resilient work queue that keeps embeddings for
//! social content up to date:
//!
//! - **Domain models**: [`Job`], [`JobStatus`], [`ContentRef`], [`PriorityMap`]
//! - **Queue engine**: [`Producer`], [`BatchWorker`], [`OrphanReaper`], [`QueueDriver`]
//! - **Tuning**: [`AdaptiveController`] over an explicit [`ControllerState`]
//! - **Resilience**: typed [`AppError`] taxonomy and [`retry`] with backoff
//! - **Services**: [`EmbeddingPipeline`] processes jobs, [`SearchService`] queries results
//! - **Traits**: [`JobQueue`], [`ContentProcessor`], [`EmbeddingProvider`],
//!   [`EntityExtractor`], [`ContentSource`], [`ContentStore`] for dependency injection
//!
//! # Architecture
//!
//! Storage and remote APIs sit behind traits, so the same engine runs against
//! PostgreSQL (`murmur-db`), the OpenAI-compatible client (`murmur-client`) or
//! the in-memory [`MemoryJobQueue`] in tests.
//!
//! # Example
//!
//! ```ignore
//! use murmur_core::{DriverConfig, EmbeddingPipeline, QueueDriver, TracingReporter, TracingWorkerReporter};
//! use tokio_util::sync::CancellationToken;
//!
//! let pipeline = EmbeddingPipeline::new(content_store, embedding_client, extractor);
//! let driver = QueueDriver::new(job_repo, pipeline, DriverConfig::default().with_batch_size(10));
//! let summary = driver
//!     .run(CancellationToken::new(), &TracingReporter, &TracingWorkerReporter)
//!     .await?;
//! println!("{} completed, {} failed", summary.completed, summary.failed);
//! ```

pub mod adaptive;
pub mod config;
pub mod driver;
pub mod error;
pub mod job;
pub mod job_queue;
pub mod memory;
pub mod models;
pub mod processing;
pub mod producer;
pub mod progress;
pub mod reaper;
pub mod retry;
pub mod search;
pub mod traits;
pub mod worker;

// Configuration
pub use config::{DbConfig, HttpConfig, ModelConfig};

// Error handling
pub use error::{AppError, ErrorClass, TransientKind};

// Domain models
pub use job::{ChangeKind, ContentRef, Job, JobStatus, NewJob, PriorityMap, QueueStats, RecordKind};
pub use models::{ContentPage, ContentText, Entities, SearchHit};

// Traits for dependency injection
pub use job_queue::JobQueue;
pub use traits::{ContentProcessor, ContentSource, ContentStore, EmbeddingProvider, EntityExtractor};

// Queue engine
pub use adaptive::{
    AdaptiveConfig, AdaptiveController, BatchPerformance, ControllerState, OptimalSettings,
    Recommendation, WindowStats,
};
pub use driver::{DriverConfig, QueueDriver, RunAborted, RunSummary};
pub use memory::MemoryJobQueue;
pub use producer::{PopulateSummary, Producer, ProducerConfig};
pub use reaper::{OrphanReaper, ReapSchedule};
pub use retry::{RetryPolicy, with_retry, with_retry_if, with_retry_notify};
pub use worker::{
    BatchReport, BatchWorker, SilentWorkerReporter, TracingWorkerReporter, WorkerConfig,
    WorkerEvent, WorkerReporter,
};

// Progress reporting
pub use progress::{DriverEvent, Progress, ProgressReporter, SilentReporter, TracingReporter};

// Services (generic over trait implementations)
pub use processing::EmbeddingPipeline;
pub use search::SearchService;
