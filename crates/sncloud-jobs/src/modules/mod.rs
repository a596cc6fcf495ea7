//! Concrete pipeline stages.

pub mod embedding;
pub mod page_hashing;

pub use embedding::GeminiEmbeddingModule;
pub use page_hashing::PageHashingModule;
