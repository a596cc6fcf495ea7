//! # sncloud-jobs
//!
//! Incremental, page-level processing pipeline for uploaded notebooks.
//!
//! This crate provides:
//! - The [`ProcessorModule`] stage contract and the [`run_module`] runner
//!   that keeps the task ledger current
//! - [`ProcessorService`]: event intake, de-duplicating work queue and worker pool
//! - [`PageHashingModule`]: page-level change detection
//! - [`GeminiEmbeddingModule`]: per-page embeddings
//! - The `.note` metadata parser
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use sncloud_jobs::{
//!     GeminiEmbeddingModule, PageHashingModule, ProcessingContext, ProcessorConfig,
//!     ProcessorService,
//! };
//!
//! let ctx = ProcessingContext::new(files, pages, tasks, blobs);
//! let processor = ProcessorService::new(ctx, ProcessorConfig::from_env());
//! processor.register_module(Arc::new(PageHashingModule::new()));
//! processor.register_module(Arc::new(GeminiEmbeddingModule::new(backend)));
//!
//! processor.start(&event_bus)?;
//! // ...
//! processor.stop().await;
//! ```

pub mod module;
pub mod modules;
pub mod notebook;
pub mod processor;

// Re-export core types
pub use sncloud_core::*;

pub use module::{run_module, ModuleOutcome, ProcessingContext, ProcessorModule};
pub use modules::{GeminiEmbeddingModule, PageHashingModule};
pub use notebook::{
    NoteFileBuilder, NotebookMetadata, NotebookParser, PageMetadata, SupernoteParser,
};
pub use processor::{ProcessorConfig, ProcessorService};
