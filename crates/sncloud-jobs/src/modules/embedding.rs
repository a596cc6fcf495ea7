//! Per-page embedding generation.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use sncloud_core::{
    task_types::EMBEDDING_GENERATION, EmbeddingBackend, Result, TaskKey, TaskStatus,
};

use crate::module::{ModuleOutcome, ProcessingContext, ProcessorModule};

/// Page module that embeds a page's extracted text.
///
/// Gated on `text_content`: it stays idle until an earlier stage has filled
/// the text in, and becomes due again whenever hashing clears it.
pub struct GeminiEmbeddingModule {
    backend: Arc<dyn EmbeddingBackend>,
}

impl GeminiEmbeddingModule {
    pub fn new(backend: Arc<dyn EmbeddingBackend>) -> Self {
        Self { backend }
    }

    async fn record_failure(
        &self,
        ctx: &ProcessingContext,
        file_id: i64,
        key: &TaskKey,
        message: &str,
    ) -> Result<ModuleOutcome> {
        warn!(
            subsystem = "processor",
            component = "embedding",
            file_id,
            key = %key,
            model = self.backend.model_name(),
            error = message,
            "Embedding generation failed"
        );
        ctx.tasks
            .upsert_status(file_id, EMBEDDING_GENERATION, key, TaskStatus::Failed, Some(message))
            .await?;
        Ok(ModuleOutcome::Recorded(TaskStatus::Failed))
    }
}

#[async_trait]
impl ProcessorModule for GeminiEmbeddingModule {
    fn name(&self) -> &str {
        "GeminiEmbeddingModule"
    }

    fn task_type(&self) -> &str {
        EMBEDDING_GENERATION
    }

    async fn run_if_needed(
        &self,
        ctx: &ProcessingContext,
        file_id: i64,
        page_index: Option<i32>,
    ) -> Result<bool> {
        let Some(page_index) = page_index else {
            return Ok(false);
        };
        if ctx
            .is_completed(file_id, EMBEDDING_GENERATION, &TaskKey::page(page_index))
            .await?
        {
            return Ok(false);
        }
        let ready = ctx
            .pages
            .get(file_id, page_index)
            .await?
            .is_some_and(|page| page.has_text());
        if !ready {
            debug!(file_id, page_index, "No text content yet, embedding not due");
        }
        Ok(ready)
    }

    async fn process(
        &self,
        ctx: &ProcessingContext,
        file_id: i64,
        page_index: Option<i32>,
    ) -> Result<ModuleOutcome> {
        let Some(page_index) = page_index else {
            return Ok(ModuleOutcome::Skipped);
        };
        let key = TaskKey::page(page_index);

        let text = match ctx.pages.get(file_id, page_index).await? {
            Some(page) if page.has_text() => page.text_content.unwrap_or_default(),
            _ => {
                warn!(file_id, page_index, "No text content found for embedding");
                return Ok(ModuleOutcome::Skipped);
            }
        };

        let start = Instant::now();
        let vector = match self.backend.embed_texts(&[text]).await {
            Ok(vectors) => match vectors.into_iter().next() {
                Some(vector) if !vector.is_empty() => vector,
                _ => {
                    return self
                        .record_failure(ctx, file_id, &key, "No embeddings returned")
                        .await
                }
            },
            Err(e) => return self.record_failure(ctx, file_id, &key, &e.to_string()).await,
        };

        let encoded = serde_json::to_string(&vector)?;
        if !ctx.pages.set_embedding(file_id, page_index, &encoded).await? {
            debug!(file_id, page_index, "Page removed while embedding, dropping result");
            return Ok(ModuleOutcome::Skipped);
        }

        info!(
            subsystem = "processor",
            component = "embedding",
            file_id,
            page_index,
            dimension = vector.len(),
            duration_ms = start.elapsed().as_millis() as u64,
            "Page embedded"
        );
        Ok(ModuleOutcome::Completed)
    }
}
