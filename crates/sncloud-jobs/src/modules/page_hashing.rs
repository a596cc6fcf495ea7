//! Page-level change detection.
//!
//! Parses the notebook, fingerprints every page and reconciles the
//! fingerprints with stored page rows. Pages whose fingerprint changed lose
//! their derived text, embedding and downstream task rows, which is what makes
//! later stages rerun for exactly those pages.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use tracing::{info, warn};

use sncloud_core::{
    defaults::USER_DATA_BUCKET,
    task_types::{DOWNSTREAM_PAGE_TASKS, HASHING},
    Error, Result, TaskCompletion, TaskStatus,
};

use crate::module::{ModuleOutcome, ProcessingContext, ProcessorModule};
use crate::notebook::{NotebookMetadata, NotebookParser, SupernoteParser};

/// Hex MD5 of each page's canonical metadata string, in page order.
pub fn page_hashes(metadata: &NotebookMetadata) -> Vec<String> {
    metadata
        .pages
        .iter()
        .map(|page| format!("{:x}", md5::compute(page.canonical_string())))
        .collect()
}

/// Global module that keeps `PageContent` rows in step with the notebook.
///
/// Runs on every pass over a file: it is the change detector, and parsing
/// metadata is cheap next to OCR or embedding calls.
pub struct PageHashingModule {
    parser: Arc<dyn NotebookParser>,
    bucket: String,
}

impl PageHashingModule {
    pub fn new() -> Self {
        Self::with_parser(Arc::new(SupernoteParser::new()))
    }

    pub fn with_parser(parser: Arc<dyn NotebookParser>) -> Self {
        Self {
            parser,
            bucket: USER_DATA_BUCKET.to_string(),
        }
    }

    /// Read notebooks from `bucket` instead of the user-data bucket.
    pub fn with_bucket(mut self, bucket: impl Into<String>) -> Self {
        self.bucket = bucket.into();
        self
    }

    async fn load_notebook(&self, ctx: &ProcessingContext, file_id: i64) -> Result<Option<Vec<u8>>> {
        let Some(file) = ctx.files.get(file_id).await? else {
            warn!(file_id, "File not found, skipping hashing");
            return Ok(None);
        };
        let Some(key) = file.storage_key.as_deref() else {
            warn!(file_id, "File has no storage key, skipping hashing");
            return Ok(None);
        };
        if !ctx.blobs.exists(&self.bucket, key).await? {
            warn!(file_id, storage_key = key, "Notebook blob missing, skipping hashing");
            return Ok(None);
        }
        match ctx.blobs.get_bytes(&self.bucket, key).await {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.is_not_found() => {
                warn!(file_id, storage_key = key, "Notebook blob vanished, skipping hashing");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }
}

impl Default for PageHashingModule {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProcessorModule for PageHashingModule {
    fn name(&self) -> &str {
        "PageHashingModule"
    }

    fn task_type(&self) -> &str {
        HASHING
    }

    async fn run_if_needed(
        &self,
        _ctx: &ProcessingContext,
        _file_id: i64,
        page_index: Option<i32>,
    ) -> Result<bool> {
        Ok(page_index.is_none())
    }

    async fn process(
        &self,
        ctx: &ProcessingContext,
        file_id: i64,
        _page_index: Option<i32>,
    ) -> Result<ModuleOutcome> {
        let start = Instant::now();
        let Some(data) = self.load_notebook(ctx, file_id).await? else {
            return Ok(ModuleOutcome::Skipped);
        };

        let parser = self.parser.clone();
        let parsed = tokio::task::spawn_blocking(move || parser.parse(&data))
            .await
            .map_err(|e| Error::Internal(format!("Parser task failed: {}", e)))?;
        let metadata = match parsed {
            Ok(metadata) => metadata,
            Err(e) => {
                warn!(file_id, error = %e, "Failed to parse notebook, skipping hashing");
                return Ok(ModuleOutcome::Skipped);
            }
        };

        let hashes = page_hashes(&metadata);
        let report = ctx
            .pages
            .sync_page_hashes(
                file_id,
                &hashes,
                &DOWNSTREAM_PAGE_TASKS,
                TaskCompletion::global(HASHING),
            )
            .await?;

        info!(
            subsystem = "processor",
            component = "page_hashing",
            file_id,
            page_count = report.total_pages,
            added = report.added,
            changed = report.changed,
            unchanged = report.unchanged,
            removed = report.removed,
            duration_ms = start.elapsed().as_millis() as u64,
            "Page hashes synced"
        );
        Ok(ModuleOutcome::Recorded(TaskStatus::Completed))
    }
}
