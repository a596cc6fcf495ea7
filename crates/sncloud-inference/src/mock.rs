//! Mock embedding backend for deterministic testing.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use sncloud_inference::mock::MockEmbeddingBackend;
//!
//! let backend = MockEmbeddingBackend::new().with_dimension(8);
//! let vectors = backend.embed_texts(&["page text".to_string()]).await?;
//! assert_eq!(vectors[0].len(), 8);
//! assert_eq!(backend.call_count(), 1);
//! ```

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use sncloud_core::{EmbeddingBackend, Error, Result};

/// Mock embedding backend for testing.
#[derive(Clone)]
pub struct MockEmbeddingBackend {
    config: Arc<MockConfig>,
    call_log: Arc<Mutex<Vec<MockCall>>>,
}

#[derive(Debug, Clone)]
struct MockConfig {
    dimension: usize,
    latency_ms: u64,
    fail_with: Option<String>,
    empty_response: bool,
    configured: bool,
}

/// One recorded `embed_texts` invocation.
#[derive(Debug, Clone)]
pub struct MockCall {
    pub texts: Vec<String>,
    pub timestamp: std::time::Instant,
}

impl Default for MockConfig {
    fn default() -> Self {
        Self {
            dimension: 16,
            latency_ms: 0,
            fail_with: None,
            empty_response: false,
            configured: true,
        }
    }
}

impl MockEmbeddingBackend {
    pub fn new() -> Self {
        Self {
            config: Arc::new(MockConfig::default()),
            call_log: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Set the embedding dimension.
    pub fn with_dimension(mut self, dimension: usize) -> Self {
        Arc::make_mut(&mut self.config).dimension = dimension;
        self
    }

    /// Sleep this long before answering.
    pub fn with_latency(mut self, latency_ms: u64) -> Self {
        Arc::make_mut(&mut self.config).latency_ms = latency_ms;
        self
    }

    /// Fail every call with `Error::Embedding(message)`.
    pub fn with_failure(mut self, message: impl Into<String>) -> Self {
        Arc::make_mut(&mut self.config).fail_with = Some(message.into());
        self
    }

    /// Answer every call with no vectors.
    pub fn with_empty_response(mut self) -> Self {
        Arc::make_mut(&mut self.config).empty_response = true;
        self
    }

    /// Report as unconfigured and reject calls like a backend without an API key.
    pub fn unconfigured(mut self) -> Self {
        Arc::make_mut(&mut self.config).configured = false;
        self
    }

    /// Deterministic vector for `text`.
    ///
    /// Values are derived from an FNV-1a hash of the text, so equal texts
    /// always map to equal vectors.
    pub fn vector_for(&self, text: &str) -> Vec<f32> {
        let mut state = text.bytes().fold(0xcbf2_9ce4_8422_2325u64, |h, b| {
            (h ^ b as u64).wrapping_mul(0x0100_0000_01b3)
        });
        (0..self.config.dimension)
            .map(|_| {
                state ^= state << 13;
                state ^= state >> 7;
                state ^= state << 17;
                ((state >> 40) as f32 / (1u64 << 24) as f32) * 2.0 - 1.0
            })
            .collect()
    }

    /// All calls made so far.
    pub fn calls(&self) -> Vec<MockCall> {
        self.call_log
            .lock()
            .map(|log| log.clone())
            .unwrap_or_default()
    }

    pub fn call_count(&self) -> usize {
        self.call_log.lock().map(|log| log.len()).unwrap_or(0)
    }

    pub fn clear_calls(&self) {
        if let Ok(mut log) = self.call_log.lock() {
            log.clear();
        }
    }
}

impl Default for MockEmbeddingBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EmbeddingBackend for MockEmbeddingBackend {
    async fn embed_texts(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if let Ok(mut log) = self.call_log.lock() {
            log.push(MockCall {
                texts: texts.to_vec(),
                timestamp: std::time::Instant::now(),
            });
        }

        if self.config.latency_ms > 0 {
            tokio::time::sleep(Duration::from_millis(self.config.latency_ms)).await;
        }
        if !self.config.configured {
            return Err(Error::Config("Mock backend not configured".to_string()));
        }
        if let Some(message) = &self.config.fail_with {
            return Err(Error::Embedding(message.clone()));
        }
        if self.config.empty_response {
            return Ok(vec![]);
        }

        Ok(texts.iter().map(|t| self.vector_for(t)).collect())
    }

    fn dimension(&self) -> usize {
        self.config.dimension
    }

    fn model_name(&self) -> &str {
        "mock-embedding"
    }

    fn is_configured(&self) -> bool {
        self.config.configured
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_deterministic_vectors() {
        let backend = MockEmbeddingBackend::new().with_dimension(8);
        let a = backend.embed_texts(&["same".to_string()]).await.unwrap();
        let b = backend.embed_texts(&["same".to_string()]).await.unwrap();
        let c = backend.embed_texts(&["other".to_string()]).await.unwrap();

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a[0].len(), 8);
        assert!(a[0].iter().all(|v| (-1.0..=1.0).contains(v)));
        assert_eq!(backend.call_count(), 3);
    }

    #[tokio::test]
    async fn test_failure_mode_records_call() {
        let backend = MockEmbeddingBackend::new().with_failure("quota exceeded");
        let err = backend.embed_texts(&["x".to_string()]).await.unwrap_err();

        assert!(err.to_string().contains("quota exceeded"));
        assert_eq!(backend.calls()[0].texts, vec!["x".to_string()]);
    }

    #[tokio::test]
    async fn test_empty_response_mode() {
        let backend = MockEmbeddingBackend::new().with_empty_response();
        assert!(backend.embed_texts(&["x".to_string()]).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unconfigured_mode() {
        let backend = MockEmbeddingBackend::new().unconfigured();
        assert!(!backend.is_configured());
        assert!(matches!(
            backend.embed_texts(&["x".to_string()]).await,
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_clones_share_call_log() {
        let backend = MockEmbeddingBackend::new();
        let clone = backend.clone();
        let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
        rt.block_on(clone.embed_texts(&["x".to_string()])).unwrap();
        assert_eq!(backend.call_count(), 1);
        backend.clear_calls();
        assert_eq!(clone.call_count(), 0);
    }
}
