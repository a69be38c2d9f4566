use clap::{Parser, Subcommand};
use murmur_core::ModelConfig;
use std::sync::LazyLock;

static VERSION_INFO: LazyLock<String> = LazyLock::new(|| {
    let version = env!("CARGO_PKG_VERSION");

    // Use VERGEN_GIT_SHA for the commit hash (with safe slicing)
    let commit = option_env!("VERGEN_GIT_SHA")
        .map(|s| s.chars().take(7).collect::<String>())
        .unwrap_or_else(|| "unknown".to_string());

    let built = option_env!("VERGEN_BUILD_DATE").unwrap_or("unknown"); // YYYY-MM-DD
    let target = option_env!("VERGEN_CARGO_TARGET_TRIPLE").unwrap_or("unknown");
    let rustc = option_env!("VERGEN_RUSTC_SEMVER").unwrap_or("unknown");

    format!("{version}\ncommit: {commit}\nbuilt: {built}\ntarget: {target}\nrustc: {rustc}")
});

pub fn version_info() -> &'static str {
    &VERSION_INFO
}

/// CLI configuration parsed from command line arguments and environment variables
#[derive(Parser, Debug)]
#[command(name = "murmur")]
#[command(
    author,
    version = version_info(),
    about = "Keeps embeddings and entities for social content up to date"
)]
#[command(after_help = "Examples:
  murmur populate
  murmur process-queue 50 --parallelism 3
  murmur retry-failed --max-attempts 3
  murmur search \"flooded metro stations\" --limit 5
  murmur stats

Tuning:
  MURMUR_* environment variables override the queue defaults
  (e.g. MURMUR_PRODUCER_MAX_QUEUE, MURMUR_ADAPTIVE_MAX_BATCH, MURMUR_PRODUCER_COOLDOWN_SECS).")]
pub struct Config {
    /// PostgreSQL database connection URL
    #[arg(long, env = "DATABASE_URL")]
    pub database_url: String,

    /// API key for the embedding and extraction API
    #[arg(long, env = "OPENAI_API_KEY", hide_env_values = true)]
    pub openai_api_key: Option<String>,

    /// Embedding model name (uses text-embedding-3-small if not set)
    #[arg(long, env = "EMBEDDING_MODEL")]
    pub embedding_model: Option<String>,

    /// Chat model used for entity extraction (uses gpt-4o-mini if not set)
    #[arg(long, env = "EXTRACTION_MODEL")]
    pub extraction_model: Option<String>,

    /// Base URL of an OpenAI-compatible API
    #[arg(long, env = "OPENAI_BASE_URL")]
    pub openai_base_url: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

impl Config {
    /// Model names with defaults filled in.
    pub fn models(&self) -> ModelConfig {
        let defaults = ModelConfig::default();
        ModelConfig {
            embedding_model: self
                .embedding_model
                .clone()
                .unwrap_or(defaults.embedding_model),
            extraction_model: self
                .extraction_model
                .clone()
                .unwrap_or(defaults.extraction_model),
        }
    }
}

/// Available CLI commands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Process queued jobs until the queue is empty
    #[command(after_help = "Examples:
  murmur process-queue              # Start with the configured batch size
  murmur process-queue 50           # Start with 50 jobs per batch
  murmur process-queue --parallelism 3")]
    ProcessQueue {
        /// Initial number of jobs per batch
        #[arg(value_name = "BATCH_SIZE")]
        batch_size: Option<usize>,

        /// Initial number of batches processed concurrently
        #[arg(short, long)]
        parallelism: Option<usize>,

        /// Keep only this many finished jobs once the run is done
        #[arg(long, value_name = "N")]
        prune_keep: Option<u64>,
    },
    /// Enqueue jobs for every post and comment missing a fresh embedding
    Populate,
    /// Delete all pending and processing jobs
    Clear,
    /// Put every completed and failed job back to pending
    Reset,
    /// Requeue failed jobs that have attempts left
    RetryFailed {
        /// Only requeue jobs with fewer attempts than this
        #[arg(long, default_value = "3")]
        max_attempts: u32,
    },
    /// Delete old finished jobs
    Prune {
        /// Number of most recent finished jobs to keep
        #[arg(long, default_value = "1000")]
        keep: u64,
    },
    /// Reclaim jobs stuck in processing
    Reap {
        /// Age in minutes after which a processing job counts as orphaned
        #[arg(long, default_value = "10")]
        minutes: u64,
    },
    /// Show queue statistics
    Stats,
    /// Search enriched content using semantic similarity
    #[command(after_help = "Example: murmur search \"tram strike\" --limit 10")]
    Search {
        /// Search query text
        query: String,
        /// Maximum number of results to return
        #[arg(short, long, default_value = "10")]
        limit: usize,
    },
}

impl Command {
    /// Whether the command calls the embedding API.
    pub fn needs_api(&self) -> bool {
        matches!(self, Command::ProcessQueue { .. } | Command::Search { .. })
    }
}
