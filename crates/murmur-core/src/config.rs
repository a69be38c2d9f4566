//! Configuration types shared by murmur components.
//!
//! Component-specific settings (`RetryPolicy`, `AdaptiveConfig`, `ProducerConfig`,
//! `WorkerConfig`, `DriverConfig`) live next to the component and read their
//! overrides from `MURMUR_*` environment variables through the helpers here.

use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

// =============================================================================
// Environment helpers
// =============================================================================

/// Reads and parses an environment variable, falling back to `default` when it
/// is unset or does not parse.
pub fn env_or<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

/// Reads a duration expressed in whole seconds.
pub fn env_secs(key: &str, default: Duration) -> Duration {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
        .unwrap_or(default)
}

/// Reads a duration expressed in milliseconds.
pub fn env_millis(key: &str, default: Duration) -> Duration {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_millis)
        .unwrap_or(default)
}

// =============================================================================
// Embedding configuration
// =============================================================================

/// Default OpenAI embedding model.
pub const DEFAULT_EMBEDDING_MODEL: &str = "text-embedding-3-small";

/// Default chat model used for entity extraction.
pub const DEFAULT_EXTRACTION_MODEL: &str = "gpt-4o-mini";

/// Returns the vector dimension produced by a given embedding model.
///
/// Unknown models are assumed to produce 1536-dimensional vectors.
pub fn embedding_dimension(model: &str) -> usize {
    match model {
        "text-embedding-3-large" => 3072,
        "text-embedding-3-small" | "text-embedding-ada-002" => 1536,
        _ => 1536,
    }
}

/// Models used by the OpenAI-compatible collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelConfig {
    #[serde(default = "default_embedding_model")]
    pub embedding_model: String,
    #[serde(default = "default_extraction_model")]
    pub extraction_model: String,
}

fn default_embedding_model() -> String {
    DEFAULT_EMBEDDING_MODEL.to_string()
}

fn default_extraction_model() -> String {
    DEFAULT_EXTRACTION_MODEL.to_string()
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            embedding_model: default_embedding_model(),
            extraction_model: default_extraction_model(),
        }
    }
}

// =============================================================================
// Infrastructure
// =============================================================================

/// Database pool settings.
#[derive(Debug, Clone)]
pub struct DbConfig {
    pub max_connections: u32,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self { max_connections: 10 }
    }
}

impl DbConfig {
    /// Reads `MURMUR_DB_MAX_CONNECTIONS`.
    pub fn from_env() -> Self {
        Self {
            max_connections: env_or("MURMUR_DB_MAX_CONNECTIONS", 10),
        }
    }
}

/// HTTP client configuration for external API calls.
#[derive(Debug, Clone)]
pub struct HttpConfig {
    /// Hard timeout of a single request to the collaborator API.
    pub timeout: Duration,
    pub connect_timeout: Duration,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(240),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

impl HttpConfig {
    /// Reads `MURMUR_HTTP_TIMEOUT_SECS` and `MURMUR_HTTP_CONNECT_TIMEOUT_SECS`.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            timeout: env_secs("MURMUR_HTTP_TIMEOUT_SECS", defaults.timeout),
            connect_timeout: env_secs(
                "MURMUR_HTTP_CONNECT_TIMEOUT_SECS",
                defaults.connect_timeout,
            ),
        }
    }
}
