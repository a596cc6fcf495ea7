//! # sncloud-inference
//!
//! Embedding backends for sncloud.
//!
//! This crate provides implementations of the [`EmbeddingBackend`] trait
//! consumed by the page pipeline:
//!
//! - [`gemini::GeminiBackend`]: Google Gemini `embedContent` over HTTP
//! - [`mock::MockEmbeddingBackend`]: deterministic vectors for tests
//!   (enabled with the `mock` feature)
//!
//! ## Example
//!
//! ```rust,ignore
//! use sncloud_inference::GeminiBackend;
//! use sncloud_core::EmbeddingBackend;
//!
//! let backend = GeminiBackend::from_env()?;
//! if backend.is_configured() {
//!     let vectors = backend.embed_texts(&["page text".to_string()]).await?;
//! }
//! ```

#[cfg(feature = "gemini")]
pub mod gemini;

#[cfg(any(test, feature = "mock"))]
pub mod mock;

// Re-export core types
pub use sncloud_core::{EmbeddingBackend, Error, Result};

#[cfg(feature = "gemini")]
pub use gemini::{GeminiBackend, GeminiConfig};

#[cfg(any(test, feature = "mock"))]
pub use mock::MockEmbeddingBackend;
