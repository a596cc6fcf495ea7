//! Google Gemini embedding backend.
//!
//! Talks to the Generative Language REST API directly:
//! `POST {base_url}/v1beta/models/{model}:embedContent?key={api_key}`.
//! Each text is embedded with its own request, in input order.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tracing::{debug, info, instrument, warn};

use sncloud_core::{EmbeddingBackend, Error, Result};

/// Default Gemini API endpoint.
pub const DEFAULT_GEMINI_URL: &str = sncloud_core::defaults::GEMINI_BASE_URL;

/// Default embedding model.
pub const DEFAULT_EMBED_MODEL: &str = sncloud_core::defaults::GEMINI_EMBEDDING_MODEL;

/// Default embedding dimension for text-embedding-004.
pub const DEFAULT_DIMENSION: usize = sncloud_core::defaults::GEMINI_EMBED_DIMENSION;

/// Timeout for embedding requests (seconds).
pub const EMBED_TIMEOUT_SECS: u64 = sncloud_core::defaults::EMBED_TIMEOUT_SECS;

/// Configuration for [`GeminiBackend`].
#[derive(Debug, Clone)]
pub struct GeminiConfig {
    /// API root, without a trailing slash.
    pub base_url: String,
    /// API key. `None` leaves the backend unconfigured.
    pub api_key: Option<String>,
    pub embed_model: String,
    pub dimension: usize,
    pub timeout_seconds: u64,
}

impl Default for GeminiConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_GEMINI_URL.to_string(),
            api_key: None,
            embed_model: DEFAULT_EMBED_MODEL.to_string(),
            dimension: DEFAULT_DIMENSION,
            timeout_seconds: EMBED_TIMEOUT_SECS,
        }
    }
}

impl GeminiConfig {
    /// Read `GEMINI_API_KEY`, `GEMINI_EMBEDDING_MODEL`, `GEMINI_BASE_URL`,
    /// `GEMINI_EMBED_DIM` and `GEMINI_TIMEOUT_SECS`.
    ///
    /// An empty `GEMINI_API_KEY` counts as absent.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let api_key = std::env::var("GEMINI_API_KEY")
            .ok()
            .map(|k| k.trim().to_string())
            .filter(|k| !k.is_empty());
        let embed_model =
            std::env::var("GEMINI_EMBEDDING_MODEL").unwrap_or(defaults.embed_model);
        let base_url = std::env::var("GEMINI_BASE_URL").unwrap_or(defaults.base_url);
        let dimension = std::env::var("GEMINI_EMBED_DIM")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.dimension);
        let timeout_seconds = std::env::var("GEMINI_TIMEOUT_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.timeout_seconds);

        Self {
            base_url,
            api_key,
            embed_model,
            dimension,
            timeout_seconds,
        }
    }
}

/// Gemini embedding backend.
pub struct GeminiBackend {
    client: Client,
    base_url: String,
    api_key: Option<String>,
    embed_model: String,
    dimension: usize,
}

#[derive(Debug, Serialize)]
struct EmbedContentRequest<'a> {
    content: RequestContent<'a>,
}

#[derive(Debug, Serialize)]
struct RequestContent<'a> {
    parts: Vec<RequestPart<'a>>,
}

#[derive(Debug, Serialize)]
struct RequestPart<'a> {
    text: &'a str,
}

#[derive(Debug, Deserialize)]
struct EmbedContentResponse {
    embedding: Option<ContentEmbedding>,
}

#[derive(Debug, Deserialize)]
struct ContentEmbedding {
    #[serde(default)]
    values: Vec<f32>,
}

impl GeminiBackend {
    /// Create a backend from an explicit configuration.
    pub fn new(config: GeminiConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()
            .map_err(|e| Error::Config(format!("Failed to create HTTP client: {}", e)))?;

        let base_url = config.base_url.trim_end_matches('/').to_string();
        info!(
            subsystem = "inference",
            component = "gemini",
            configured = config.api_key.is_some(),
            "Initializing Gemini backend: url={}, embed={}",
            base_url,
            config.embed_model
        );

        Ok(Self {
            client,
            base_url,
            api_key: config.api_key,
            embed_model: config.embed_model,
            dimension: config.dimension,
        })
    }

    /// Create from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::new(GeminiConfig::from_env())
    }

    fn embed_url(&self) -> String {
        format!(
            "{}/v1beta/models/{}:embedContent",
            self.base_url, self.embed_model
        )
    }

    async fn embed_one(&self, api_key: &str, text: &str) -> Result<Vec<f32>> {
        let request = EmbedContentRequest {
            content: RequestContent {
                parts: vec![RequestPart { text }],
            },
        };

        let response = self
            .client
            .post(self.embed_url())
            .query(&[("key", api_key)])
            .json(&request)
            .send()
            .await
            .map_err(|e| Error::Embedding(format!("Request failed: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Embedding(format!(
                "Gemini returned {}: {}",
                status, body
            )));
        }

        let result: EmbedContentResponse = response
            .json()
            .await
            .map_err(|e| Error::Embedding(format!("Failed to parse response: {}", e)))?;

        Ok(result.embedding.map(|e| e.values).unwrap_or_default())
    }
}

#[async_trait]
impl EmbeddingBackend for GeminiBackend {
    #[instrument(skip(self, texts), fields(subsystem = "inference", component = "gemini", op = "embed_texts", model = %self.embed_model, input_count = texts.len()))]
    async fn embed_texts(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let Some(api_key) = self.api_key.as_deref() else {
            return Err(Error::Config("Gemini API key not configured".to_string()));
        };
        if texts.is_empty() {
            return Ok(vec![]);
        }

        let start = Instant::now();
        let mut vectors = Vec::with_capacity(texts.len());
        for text in texts {
            let values = self.embed_one(api_key, text).await?;
            if values.is_empty() {
                // A missing embedding shortens the batch; callers treat
                // fewer vectors than inputs as an empty response.
                warn!("Gemini returned no embedding values");
                break;
            }
            vectors.push(values);
        }

        let elapsed = start.elapsed().as_millis() as u64;
        debug!(
            result_count = vectors.len(),
            duration_ms = elapsed,
            "Embedding complete"
        );
        if elapsed > 5000 {
            warn!(
                duration_ms = elapsed,
                input_count = texts.len(),
                slow = true,
                "Slow embedding operation"
            );
        }
        Ok(vectors)
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn model_name(&self) -> &str {
        &self.embed_model
    }

    fn is_configured(&self) -> bool {
        self.api_key.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = GeminiConfig::default();
        assert_eq!(config.embed_model, "text-embedding-004");
        assert_eq!(config.dimension, 768);
        assert!(config.api_key.is_none());
    }

    #[test]
    fn test_embed_url_trims_trailing_slash() {
        let backend = GeminiBackend::new(GeminiConfig {
            base_url: "http://localhost:9999/".to_string(),
            api_key: Some("k".to_string()),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(
            backend.embed_url(),
            "http://localhost:9999/v1beta/models/text-embedding-004:embedContent"
        );
    }

    #[test]
    fn test_request_serialization() {
        let request = EmbedContentRequest {
            content: RequestContent {
                parts: vec![RequestPart { text: "hello" }],
            },
        };
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"content": {"parts": [{"text": "hello"}]}})
        );
    }

    #[tokio::test]
    async fn test_unconfigured_backend_errors() {
        let backend = GeminiBackend::new(GeminiConfig::default()).unwrap();
        assert!(!backend.is_configured());
        let err = backend
            .embed_texts(&["text".to_string()])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
