//! OpenAI-compatible client for embeddings and entity extraction.
//!
//! Supports OpenAI's text embedding models:
//! - `text-embedding-3-small` (1536 dimensions, recommended)
//! - `text-embedding-3-large` (3072 dimensions, higher quality)
//! - `text-embedding-ada-002` (1536 dimensions, legacy)
//!
//! Entities are extracted with a chat model in JSON mode. Any server that
//! speaks the same API (Azure OpenAI, local proxies) can be targeted through
//! a custom base URL.
//!
//! Every failure is classified here, at the API boundary, into the typed
//! [`AppError`] taxonomy so callers never inspect messages.
//!
//! # Examples
//!
//! ```no_run
//! use murmur_client::OpenAIClient;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let client = OpenAIClient::new("sk-your-api-key")?;
//! let embedding = client.get_embeddings("Hello, world!").await?;
//! println!("Embedding dimension: {}", embedding.len()); // 1536
//! # Ok(())
//! # }
//! ```

use murmur_core::config::embedding_dimension;
use murmur_core::error::{AppError, TransientKind};
use murmur_core::models::Entities;
use murmur_core::{HttpConfig, ModelConfig};
use reqwest::{Client, RequestBuilder};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

/// Longest input sent to either endpoint, in characters.
const MAX_INPUT_CHARS: usize = 24_000;

const EXTRACTION_PROMPT: &str = "Extract entities from the user's social media text. \
Reply with a JSON object with exactly three arrays of short lowercase strings: \
\"topics\" (subjects discussed), \"locations\" (places mentioned) and \"tags\" \
(hashtag-style keywords). Use empty arrays when nothing applies.";

/// HTTP client for the embeddings and chat completions endpoints.
#[derive(Clone)]
pub struct OpenAIClient {
    client: Client,
    api_key: String,
    embedding_model: String,
    extraction_model: String,
    base_url: String,
    dim: usize,
    timeout_secs: u64,
}

// =============================================================================
// Wire Types
// =============================================================================

/// Request body for OpenAI embedding API
#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: Vec<&'a str>,
}

/// Response from OpenAI embedding API
#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
    index: usize,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    response_format: ResponseFormat,
    temperature: f32,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    kind: &'static str,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatReply,
}

#[derive(Deserialize)]
struct ChatReply {
    content: Option<String>,
}

/// Error response from OpenAI API
#[derive(Deserialize)]
struct OpenAIError {
    error: OpenAIErrorDetail,
}

#[derive(Deserialize)]
struct OpenAIErrorDetail {
    message: String,
}

// =============================================================================
// Client
// =============================================================================

impl OpenAIClient {
    /// Creates a new client with the default models.
    pub fn new(api_key: &str) -> Result<Self, AppError> {
        Self::with_models(api_key, &ModelConfig::default())
    }

    /// Creates a new client with specific embedding and extraction models.
    pub fn with_models(api_key: &str, models: &ModelConfig) -> Result<Self, AppError> {
        Self::with_config(api_key, models, None, &HttpConfig::default())
    }

    /// Creates a new client with full configuration.
    ///
    /// # Arguments
    ///
    /// * `api_key` - API key, must not be empty
    /// * `models` - Embedding and extraction model names
    /// * `base_url` - Custom API base (for Azure OpenAI or proxies), without trailing slash
    /// * `http` - Request and connect timeouts
    pub fn with_config(
        api_key: &str,
        models: &ModelConfig,
        base_url: Option<&str>,
        http: &HttpConfig,
    ) -> Result<Self, AppError> {
        if api_key.trim().is_empty() {
            return Err(AppError::ConfigError(
                "OPENAI_API_KEY is required".to_string(),
            ));
        }

        let client = Client::builder()
            .timeout(http.timeout)
            .connect_timeout(http.connect_timeout)
            .build()
            .map_err(|e| AppError::ConfigError(format!("cannot build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            api_key: api_key.to_string(),
            embedding_model: models.embedding_model.clone(),
            extraction_model: models.extraction_model.clone(),
            base_url: base_url
                .unwrap_or(DEFAULT_BASE_URL)
                .trim_end_matches('/')
                .to_string(),
            dim: embedding_dimension(&models.embedding_model),
            timeout_secs: http.timeout.as_secs(),
        })
    }

    /// Returns the embedding model being used.
    pub fn model(&self) -> &str {
        &self.embedding_model
    }

    pub fn extraction_model(&self) -> &str {
        &self.extraction_model
    }

    /// Generates the embedding for a single text.
    pub async fn get_embeddings(&self, text: &str) -> Result<Vec<f32>, AppError> {
        let embeddings = self.get_embeddings_batch(&[text]).await?;
        embeddings
            .into_iter()
            .next()
            .ok_or_else(|| AppError::permanent("embedding response contained no vectors"))
    }

    /// Generates embeddings for multiple texts in a single API call.
    ///
    /// Returns one vector per input text, in the same order.
    pub async fn get_embeddings_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>, AppError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let request_body = EmbeddingRequest {
            model: &self.embedding_model,
            input: texts.iter().map(|t| truncate(t)).collect(),
        };
        let request = self
            .client
            .post(format!("{}/embeddings", self.base_url))
            .json(&request_body);
        let response: EmbeddingResponse = self.send(request).await?;

        // Sort by index to ensure correct order
        let mut data = response.data;
        data.sort_by_key(|d| d.index);
        Ok(data.into_iter().map(|d| d.embedding).collect())
    }

    /// Extracts topics, locations and tags from a text.
    pub async fn extract_entities(&self, text: &str) -> Result<Entities, AppError> {
        let request_body = ChatRequest {
            model: &self.extraction_model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: EXTRACTION_PROMPT,
                },
                ChatMessage {
                    role: "user",
                    content: truncate(text),
                },
            ],
            response_format: ResponseFormat {
                kind: "json_object",
            },
            temperature: 0.0,
        };
        let request = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .json(&request_body);
        let response: ChatResponse = self.send(request).await?;

        let content = response
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .unwrap_or_default();
        parse_entities(&content)
    }

    /// Sends a request and decodes the JSON body, classifying every failure.
    async fn send<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T, AppError> {
        let response = request
            .bearer_auth(&self.api_key)
            .send()
            .await
            .map_err(|e| self.classify_transport(e))?;

        let status = response.status();
        if !status.is_success() {
            let status_code = status.as_u16();
            let error_text = response.text().await.unwrap_or_default();

            // Try to parse as structured OpenAI error
            let message = match serde_json::from_str::<OpenAIError>(&error_text) {
                Ok(openai_error) => openai_error.error.message,
                Err(_) => error_text,
            };
            debug!(status = status_code, %message, "OpenAI request rejected");
            return Err(AppError::from_status(status_code, message));
        }

        response
            .json::<T>()
            .await
            .map_err(|e| self.classify_transport(e))
    }

    fn classify_transport(&self, e: reqwest::Error) -> AppError {
        if e.is_timeout() {
            AppError::timeout(self.timeout_secs)
        } else if e.is_connect() || e.is_request() || e.is_body() {
            AppError::transient(
                TransientKind::ConnectionReset,
                format!("cannot reach OpenAI: {}", e),
            )
        } else if e.is_decode() {
            AppError::permanent(format!("failed to parse OpenAI response: {}", e))
        } else {
            AppError::Generic(e.to_string())
        }
    }
}

/// Cuts a text to the input limit on a character boundary.
fn truncate(text: &str) -> &str {
    match text.char_indices().nth(MAX_INPUT_CHARS) {
        Some((byte, _)) => &text[..byte],
        None => text,
    }
}

/// Parses the JSON object produced by the extraction prompt.
fn parse_entities(content: &str) -> Result<Entities, AppError> {
    if content.trim().is_empty() {
        return Ok(Entities::default());
    }
    serde_json::from_str::<Entities>(content)
        .map_err(|e| AppError::permanent(format!("model returned malformed entities: {}", e)))
}

// =============================================================================
// Trait Implementations
// =============================================================================

impl murmur_core::traits::EmbeddingProvider for OpenAIClient {
    fn name(&self) -> &'static str {
        "openai"
    }

    fn dimension(&self) -> usize {
        self.dim
    }

    async fn generate(&self, text: &str) -> Result<Vec<f32>, AppError> {
        self.get_embeddings(text).await
    }
}

impl murmur_core::traits::EntityExtractor for OpenAIClient {
    async fn extract(&self, text: &str) -> Result<Entities, AppError> {
        self.extract_entities(text).await
    }
}
