use std::process::ExitCode;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use dotenvy::dotenv;
use sqlx::postgres::PgPoolOptions;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use murmur_cli::{Command, Config};
use murmur_client::OpenAIClient;
use murmur_core::progress::format_duration;
use murmur_core::traits::EmbeddingProvider;
use murmur_core::{
    AppError, DbConfig, DriverConfig, EmbeddingPipeline, HttpConfig, JobQueue, OrphanReaper,
    PopulateSummary, Producer, ProducerConfig, QueueDriver, QueueStats, RunSummary, SearchHit,
    SearchService, TracingReporter, TracingWorkerReporter,
};
use murmur_db::{ContentRepository, EMBEDDING_DIMENSION, JobRepository, run_migrations};

#[tokio::main]
async fn main() -> ExitCode {
    dotenv().ok();

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .finish();
    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("setting default subscriber failed: {}", e);
    }

    let config = Config::parse();

    match run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            let message = match e.downcast_ref::<AppError>() {
                Some(app_error) => app_error.user_message(),
                None => format!("{:#}", e),
            };
            error!("{}", message);
            ExitCode::FAILURE
        }
    }
}

async fn run(config: Config) -> anyhow::Result<()> {
    // Credentials are checked before touching the database.
    let client = if config.command.needs_api() {
        Some(api_client(&config)?)
    } else {
        None
    };

    info!("Connecting to database...");
    let db_config = DbConfig::from_env();
    let pool = PgPoolOptions::new()
        .max_connections(db_config.max_connections)
        .connect(&config.database_url)
        .await
        .context("Failed to connect to database")?;
    run_migrations(&pool).await?;

    let jobs = JobRepository::new(pool.clone());
    let content = ContentRepository::new(pool);

    match &config.command {
        Command::ProcessQueue {
            batch_size,
            parallelism,
            prune_keep,
        } => {
            let client = client.context("process-queue needs the API client")?;
            let mut driver_config = DriverConfig::from_env();
            if let Some(size) = batch_size {
                driver_config = driver_config.with_batch_size(*size);
            }
            if let Some(parallelism) = parallelism {
                driver_config = driver_config.with_parallelism(*parallelism);
            }
            if prune_keep.is_some() {
                driver_config = driver_config.with_prune_keep(*prune_keep);
            }
            process_queue(jobs, content, client, driver_config).await?;
        }
        Command::Populate => {
            let producer = Producer::new(jobs.clone(), ProducerConfig::from_env());
            info!("Scanning content for missing or stale embeddings...");
            let summary = producer.populate(&content).await?;
            print_populate_summary(&summary);
            print_queue_stats(&jobs.queue_stats().await?);
        }
        Command::Clear => {
            let removed = jobs.clear_non_terminal().await?;
            println!("Cleared {} pending/processing jobs", removed);
        }
        Command::Reset => {
            let reset = jobs.reset_terminal().await?;
            println!("Reset {} completed/failed jobs to pending", reset);
        }
        Command::RetryFailed { max_attempts } => {
            let requeued = jobs.requeue_failed(*max_attempts).await?;
            println!(
                "Requeued {} failed jobs with fewer than {} attempts",
                requeued, max_attempts
            );
        }
        Command::Prune { keep } => {
            let pruned = jobs.prune_terminal(*keep).await?;
            println!("Pruned {} finished jobs (kept the latest {})", pruned, keep);
        }
        Command::Reap { minutes } => {
            let reaper = OrphanReaper::new(jobs.clone(), reap_threshold(*minutes));
            let reclaimed = reaper.reap().await?;
            println!(
                "Reclaimed {} jobs stuck in processing for over {} minutes",
                reclaimed, minutes
            );
        }
        Command::Stats => {
            print_queue_stats(&jobs.queue_stats().await?);
            print_last_processed(&jobs).await?;
        }
        Command::Search { query, limit } => {
            let client = client.context("search needs the API client")?;
            let search_service = SearchService::new(content, client);
            search(&search_service, query, *limit).await?;
        }
    }

    Ok(())
}

/// Builds the API client and checks it matches the stored vector width.
fn api_client(config: &Config) -> Result<OpenAIClient, AppError> {
    let api_key = config
        .openai_api_key
        .as_deref()
        .ok_or_else(|| AppError::ConfigError("OPENAI_API_KEY is required".to_string()))?;

    let client = OpenAIClient::with_config(
        api_key,
        &config.models(),
        config.openai_base_url.as_deref(),
        &HttpConfig::from_env(),
    )?;

    if client.dimension() != EMBEDDING_DIMENSION {
        return Err(AppError::ConfigError(format!(
            "model {} produces {} dimensions but the database stores {}",
            client.model(),
            client.dimension(),
            EMBEDDING_DIMENSION
        )));
    }

    info!(
        "Using {} models {} / {} ({} dimensions)",
        client.name(),
        client.model(),
        client.extraction_model(),
        client.dimension()
    );
    Ok(client)
}

async fn process_queue(
    jobs: JobRepository,
    content: ContentRepository,
    client: OpenAIClient,
    driver_config: DriverConfig,
) -> anyhow::Result<()> {
    let pipeline = EmbeddingPipeline::new(content, client.clone(), client);
    let driver = QueueDriver::new(jobs, pipeline, driver_config);

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    let signal = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, releasing in-flight jobs...");
            on_signal.cancel();
        }
    });

    let result = driver
        .run(cancel, &TracingReporter, &TracingWorkerReporter)
        .await;
    signal.abort();

    match result {
        Ok(summary) => {
            print_run_summary(&summary, false);
            Ok(())
        }
        Err(aborted) => {
            print_run_summary(&aborted.summary, true);
            Err(aborted.error.into())
        }
    }
}

fn run_title(summary: &RunSummary, aborted: bool) -> &'static str {
    if aborted {
        "QUEUE RUN ABORTED"
    } else if summary.interrupted {
        "QUEUE RUN INTERRUPTED"
    } else {
        "QUEUE RUN COMPLETE"
    }
}

/// Processing age after which `reap` treats a job as orphaned.
fn reap_threshold(minutes: u64) -> Duration {
    Duration::from_secs(minutes.saturating_mul(60))
}

fn print_run_summary(summary: &RunSummary, aborted: bool) {
    println!();
    println!("═══════════════════════════════════════════════════════");
    println!("{}", run_title(summary, aborted));
    println!("═══════════════════════════════════════════════════════");
    println!("  ✓ Completed:         {}", summary.completed);
    println!("  ✗ Failed:            {}", summary.failed);
    println!("  ↺ Released:          {}", summary.released);
    println!("  ↺ Reclaimed:         {}", summary.reclaimed);
    if summary.pruned > 0 {
        println!("  - Pruned:            {}", summary.pruned);
    }
    println!("───────────────────────────────────────────────────────");
    println!("  Success rate:        {:.1}%", summary.success_rate() * 100.0);
    println!("  Elapsed:             {}", format_duration(summary.elapsed));
    println!("  Rounds / batches:    {} / {}", summary.rounds, summary.batches);
    println!(
        "  Final settings:      batch {} x {} parallel",
        summary.final_batch_size, summary.final_parallelism
    );
    if let Some(optimal) = &summary.optimal {
        println!(
            "  Best observed:       batch {} x {} parallel ({:.1} records/min)",
            optimal.batch_size, optimal.parallelism, optimal.records_per_minute
        );
    }
    println!("───────────────────────────────────────────────────────");
    println!(
        "  Queue now:           {} pending, {} processing",
        summary.final_stats.pending, summary.final_stats.processing
    );
    println!("═══════════════════════════════════════════════════════");
}

fn print_populate_summary(summary: &PopulateSummary) {
    println!();
    println!("Populate complete");
    println!("  Pages scanned:       {}", summary.pages);
    println!("  Records found:       {}", summary.scanned);
    println!("  + Enqueued:          {}", summary.enqueued);
    println!("  = Already queued:    {}", summary.skipped);
    if summary.trimmed > 0 {
        println!("  - Trimmed (cap):     {}", summary.trimmed);
    }
}

fn print_queue_stats(stats: &QueueStats) {
    println!("\n📊 Queue Statistics\n");
    println!("  Pending:               {}", stats.pending);
    println!("  Processing:            {}", stats.processing);
    println!("  Completed:             {}", stats.completed);
    println!("  Failed:                {}", stats.failed);
    println!("  Total:                 {}", stats.total());
    println!();
}

async fn print_last_processed(jobs: &JobRepository) -> anyhow::Result<()> {
    if let Some(last) = jobs.last_activity().await? {
        println!("  Last processed:        {}", last);
        println!();
    }
    Ok(())
}

async fn search(
    search_service: &SearchService<ContentRepository, OpenAIClient>,
    query: &str,
    limit: usize,
) -> anyhow::Result<()> {
    info!("Searching for: '{}' (limit: {})", query, limit);

    let results = search_service.search(query, limit).await?;

    if results.is_empty() {
        println!("\n🔍 No results found for: \"{}\"\n", query);
        println!("Try:");
        println!("  • Using different keywords");
        println!("  • Running: murmur populate && murmur process-queue");
        return Ok(());
    }

    println!("\n🔍 Search Results for: \"{}\"\n", query);
    println!("Found {} matching records:\n", results.len());
    for (i, hit) in results.iter().enumerate() {
        print_hit(i + 1, hit);
    }

    Ok(())
}

fn print_hit(rank: usize, hit: &SearchHit) {
    println!(
        "{}. {} [{:.0}%] {} {}",
        rank,
        create_similarity_bar(hit.similarity),
        hit.similarity * 100.0,
        hit.record_kind,
        hit.record_id
    );
    if let Some(title) = &hit.title {
        println!("   📌 {}", title);
    }
    println!("   📝 {}", truncate_text(&hit.snippet, 120));
    println!();
}

// Use floor() instead of round() so very low similarity scores (e.g. 5%)
// do not display a filled bar.
fn create_similarity_bar(score: f32) -> String {
    let filled = ((score * 10.0).floor() as isize).clamp(0, 10) as usize;
    let empty = 10 - filled;
    format!("[{}{}]", "█".repeat(filled), "░".repeat(empty))
}

fn truncate_text(text: &str, max_len: usize) -> String {
    let cleaned = text.split_whitespace().collect::<Vec<_>>().join(" ");

    if cleaned.chars().count() <= max_len {
        cleaned
    } else {
        let truncated: String = cleaned.chars().take(max_len).collect();
        format!("{}...", truncated)
    }
}
