//! Pipeline stage contract and the shared runner.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use tracing::{debug, error, warn};

use sncloud_core::{
    NotebookFileRepository, PageContentRepository, Result, TaskKey, TaskRepository, TaskStatus,
};
use sncloud_db::BlobStore;

/// Repositories and storage handed to every module invocation.
#[derive(Clone)]
pub struct ProcessingContext {
    pub files: Arc<dyn NotebookFileRepository>,
    pub pages: Arc<dyn PageContentRepository>,
    pub tasks: Arc<dyn TaskRepository>,
    pub blobs: Arc<dyn BlobStore>,
}

impl ProcessingContext {
    pub fn new(
        files: Arc<dyn NotebookFileRepository>,
        pages: Arc<dyn PageContentRepository>,
        tasks: Arc<dyn TaskRepository>,
        blobs: Arc<dyn BlobStore>,
    ) -> Self {
        Self {
            files,
            pages,
            tasks,
            blobs,
        }
    }

    /// Whether a COMPLETED row exists for `(file_id, task_type, key)`.
    pub async fn is_completed(&self, file_id: i64, task_type: &str, key: &TaskKey) -> Result<bool> {
        Ok(self
            .tasks
            .get(file_id, task_type, key)
            .await?
            .is_some_and(|task| task.is_completed()))
    }
}

/// How a module's `process` step ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleOutcome {
    /// Work done; the runner records COMPLETED.
    Completed,
    /// The module already wrote this status itself.
    Recorded(TaskStatus),
    /// A prerequisite was missing. Nothing was recorded, so the next run retries.
    Skipped,
}

/// One stage of the notebook pipeline.
///
/// Modules are invoked once per file with `page_index = None` (global scope)
/// and then once per page. `process` may run more than once for the same
/// inputs and must stay idempotent.
#[async_trait]
pub trait ProcessorModule: Send + Sync {
    fn name(&self) -> &str;

    /// Task type recorded in the task ledger.
    fn task_type(&self) -> &str;

    /// Default: needed unless a COMPLETED row exists for this scope.
    async fn run_if_needed(
        &self,
        ctx: &ProcessingContext,
        file_id: i64,
        page_index: Option<i32>,
    ) -> Result<bool> {
        let key = TaskKey::for_page(page_index);
        Ok(!ctx.is_completed(file_id, self.task_type(), &key).await?)
    }

    async fn process(
        &self,
        ctx: &ProcessingContext,
        file_id: i64,
        page_index: Option<i32>,
    ) -> Result<ModuleOutcome>;
}

/// Run one module for one scope and keep the task ledger up to date.
///
/// Returns true when the scope ends up completed (including when no work was
/// needed). Errors from `process` are recorded as FAILED with the error text;
/// nothing escapes to the caller.
pub async fn run_module(
    module: &dyn ProcessorModule,
    ctx: &ProcessingContext,
    file_id: i64,
    page_index: Option<i32>,
) -> bool {
    let name = module.name();
    let task_type = module.task_type();

    match module.run_if_needed(ctx, file_id, page_index).await {
        Ok(true) => {}
        Ok(false) => {
            debug!(module = name, file_id, ?page_index, "Module not needed");
            return true;
        }
        Err(e) => {
            error!(module = name, file_id, ?page_index, error = %e, "Module readiness check failed");
            return false;
        }
    }

    let start = Instant::now();
    debug!(module = name, file_id, ?page_index, "Running module");
    let key = TaskKey::for_page(page_index);

    let outcome = module.process(ctx, file_id, page_index).await;
    let duration_ms = start.elapsed().as_millis() as u64;

    match outcome {
        Ok(ModuleOutcome::Completed) => {
            match ctx
                .tasks
                .upsert_status(file_id, task_type, &key, TaskStatus::Completed, None)
                .await
            {
                Ok(()) => {
                    debug!(module = name, file_id, ?page_index, duration_ms, "Module completed");
                    true
                }
                Err(e) => {
                    error!(module = name, file_id, ?page_index, error = %e, "Failed to record completion");
                    false
                }
            }
        }
        Ok(ModuleOutcome::Recorded(status)) => {
            debug!(module = name, file_id, ?page_index, %status, duration_ms, "Module recorded its own status");
            status == TaskStatus::Completed
        }
        Ok(ModuleOutcome::Skipped) => {
            debug!(module = name, file_id, ?page_index, duration_ms, "Module skipped");
            false
        }
        Err(e) => {
            let message = e.to_string();
            warn!(module = name, file_id, ?page_index, error = %message, duration_ms, "Module failed");
            if let Err(record_err) = ctx
                .tasks
                .upsert_status(file_id, task_type, &key, TaskStatus::Failed, Some(&message))
                .await
            {
                error!(module = name, file_id, ?page_index, error = %record_err, "Failed to record failure");
            }
            false
        }
    }
}
