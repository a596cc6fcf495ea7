//! Notebook processing service: event intake, work queue and worker pool.

use std::collections::{BTreeSet, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Instant;

use futures::future::join_all;
use tokio::sync::{broadcast, mpsc, watch, Mutex as AsyncMutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use sncloud_core::{
    task_types::HASHING, Error, EventBus, NoteEvent, Result, TaskKey, TaskStatus,
};

use crate::module::{run_module, ProcessingContext, ProcessorModule};

/// Configuration for the processor.
#[derive(Debug, Clone)]
pub struct ProcessorConfig {
    /// Number of files processed in parallel.
    pub concurrency: usize,
    /// Whether `start` launches any workers.
    pub enabled: bool,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            concurrency: sncloud_core::defaults::PROCESSOR_CONCURRENCY,
            enabled: true,
        }
    }
}

impl ProcessorConfig {
    /// Create config from environment variables (with defaults).
    ///
    /// | Variable | Default | Description |
    /// |----------|---------|-------------|
    /// | `PROCESSOR_ENABLED` | `true` | Enable/disable the pipeline |
    /// | `PROCESSOR_CONCURRENCY` | `2` | Files processed in parallel |
    pub fn from_env() -> Self {
        let enabled = std::env::var("PROCESSOR_ENABLED")
            .map(|v| v != "false" && v != "0")
            .unwrap_or(true);

        let concurrency = std::env::var("PROCESSOR_CONCURRENCY")
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
            .unwrap_or(sncloud_core::defaults::PROCESSOR_CONCURRENCY)
            .max(1);

        Self {
            concurrency,
            enabled,
        }
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }
}

/// State shared between the service handle and its spawned tasks.
struct Shared {
    ctx: ProcessingContext,
    modules: RwLock<Vec<Arc<dyn ProcessorModule>>>,
    queue_tx: mpsc::UnboundedSender<i64>,
    queue_rx: AsyncMutex<mpsc::UnboundedReceiver<i64>>,
    /// File ids queued or being processed.
    processing_files: Mutex<HashSet<i64>>,
    /// Enqueued items not yet finished.
    in_flight: AtomicUsize,
    idle: Notify,
}

/// Marks a dequeued file finished when dropped, including when the worker
/// is aborted mid-file.
struct InFlightGuard<'a> {
    shared: &'a Shared,
    file_id: i64,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        if let Ok(mut files) = self.shared.processing_files.lock() {
            files.remove(&self.file_id);
        }
        if self.shared.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.shared.idle.notify_waiters();
        }
    }
}

impl Shared {
    fn modules(&self) -> Vec<Arc<dyn ProcessorModule>> {
        self.modules
            .read()
            .map(|modules| modules.clone())
            .unwrap_or_default()
    }

    /// Queue `file_id` unless it is already queued or being processed.
    fn enqueue(&self, file_id: i64) -> bool {
        let Ok(mut files) = self.processing_files.lock() else {
            error!(file_id, "processing_files lock poisoned, dropping enqueue");
            return false;
        };
        if !files.insert(file_id) {
            debug!(file_id, "File already pending, coalescing update");
            return false;
        }
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        if self.queue_tx.send(file_id).is_err() {
            files.remove(&file_id);
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            return false;
        }
        true
    }

    fn handle_note_updated(&self, file_id: i64, file_path: &str) -> bool {
        info!(file_id, file_path, "Received note update");
        self.enqueue(file_id)
    }

    fn handle_note_deleted(&self, file_id: i64) {
        // TODO: purge page rows and task rows for the file once deleted-note
        // retention (trash restore window) is decided.
        info!(file_id, "Received note delete");
    }

    async fn recover_tasks(&self) -> Result<usize> {
        let start = Instant::now();
        let active: BTreeSet<i64> = self
            .ctx
            .files
            .list_active_notebook_ids()
            .await?
            .into_iter()
            .collect();

        let mut candidates: BTreeSet<i64> = self
            .ctx
            .tasks
            .list_file_ids_with_status(TaskStatus::Failed)
            .await?
            .into_iter()
            .filter(|id| active.contains(id))
            .collect();

        let global = TaskKey::global();
        for &file_id in &active {
            if !self.ctx.is_completed(file_id, HASHING, &global).await? {
                candidates.insert(file_id);
            }
        }

        let enqueued = candidates
            .into_iter()
            .filter(|&file_id| self.enqueue(file_id))
            .count();
        info!(
            subsystem = "processor",
            op = "recover_tasks",
            enqueued,
            duration_ms = start.elapsed().as_millis() as u64,
            "Recovered pending processing work"
        );
        Ok(enqueued)
    }

    /// Any notebook may be behind missed events, so all of them go back on
    /// the queue. Unchanged files cost one hash pass.
    async fn requeue_active_notebooks(&self) -> Result<usize> {
        let enqueued = self
            .ctx
            .files
            .list_active_notebook_ids()
            .await?
            .into_iter()
            .filter(|&file_id| self.enqueue(file_id))
            .count();
        info!(
            subsystem = "processor",
            op = "requeue_active_notebooks",
            enqueued,
            "Re-queued active notebooks"
        );
        Ok(enqueued)
    }

    #[instrument(skip(self), fields(subsystem = "processor", op = "process_file"))]
    async fn process_file(&self, file_id: i64) -> Result<()> {
        let start = Instant::now();
        let modules = self.modules();
        info!("Processing file");

        for module in &modules {
            run_module(module.as_ref(), &self.ctx, file_id, None).await;
        }

        let pages = self.ctx.pages.list_page_indices(file_id).await?;
        if pages.is_empty() {
            info!("No pages found, skipping page modules");
            return Ok(());
        }

        let page_runs = pages.iter().map(|&page_index| {
            let modules = &modules;
            async move {
                for module in modules {
                    run_module(module.as_ref(), &self.ctx, file_id, Some(page_index)).await;
                }
            }
        });
        join_all(page_runs).await;

        info!(
            page_count = pages.len(),
            duration_ms = start.elapsed().as_millis() as u64,
            "File processed"
        );
        Ok(())
    }

    async fn worker_loop(self: Arc<Self>, worker_id: usize, mut shutdown: watch::Receiver<bool>) {
        debug!(worker_id, "Worker started");
        loop {
            if *shutdown.borrow() {
                break;
            }
            let next = tokio::select! {
                _ = shutdown.changed() => break,
                next = async { self.queue_rx.lock().await.recv().await } => next,
            };
            let Some(file_id) = next else {
                break;
            };

            let _guard = InFlightGuard {
                shared: &self,
                file_id,
            };
            if let Err(e) = self.process_file(file_id).await {
                error!(worker_id, file_id, error = %e, "Error processing file");
            }
        }
        debug!(worker_id, "Worker stopped");
    }

    async fn dispatch_events(
        self: Arc<Self>,
        mut events: broadcast::Receiver<sncloud_core::EventEnvelope>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            let received = tokio::select! {
                _ = shutdown.changed() => break,
                received = events.recv() => received,
            };
            match received {
                Ok(envelope) => match envelope.payload {
                    NoteEvent::NoteUpdated { file_id, file_path } => {
                        self.handle_note_updated(file_id, &file_path);
                    }
                    NoteEvent::NoteDeleted { file_id } => self.handle_note_deleted(file_id),
                },
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Processor lagged behind the event bus, re-queueing notebooks");
                    if let Err(e) = self.requeue_active_notebooks().await {
                        error!(error = %e, "Re-queue after lag failed");
                    }
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }
}

/// Incremental processing pipeline for notebooks.
///
/// File ids arrive through [`NoteEvent`]s (or [`handle_note_updated`]) and sit
/// in an unbounded FIFO until one of `concurrency` workers picks them up. A
/// file id is queued at most once at a time; updates arriving while it is
/// pending are coalesced, and the eventual run sees the latest content.
///
/// [`handle_note_updated`]: ProcessorService::handle_note_updated
pub struct ProcessorService {
    shared: Arc<Shared>,
    config: ProcessorConfig,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ProcessorService {
    pub fn new(ctx: ProcessingContext, config: ProcessorConfig) -> Self {
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            shared: Arc::new(Shared {
                ctx,
                modules: RwLock::new(Vec::new()),
                queue_tx,
                queue_rx: AsyncMutex::new(queue_rx),
                processing_files: Mutex::new(HashSet::new()),
                in_flight: AtomicUsize::new(0),
                idle: Notify::new(),
            }),
            config,
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn config(&self) -> &ProcessorConfig {
        &self.config
    }

    /// Append a module. Modules run in registration order.
    pub fn register_module(&self, module: Arc<dyn ProcessorModule>) {
        info!(module = module.name(), "Registered processor module");
        if let Ok(mut modules) = self.shared.modules.write() {
            modules.push(module);
        }
    }

    pub fn module_names(&self) -> Vec<String> {
        self.shared
            .modules()
            .iter()
            .map(|m| m.name().to_string())
            .collect()
    }

    /// Subscribe to `bus`, spawn the workers and kick off recovery.
    ///
    /// Must be called from within a Tokio runtime. Calling it again while
    /// running is a no-op.
    pub fn start(&self, bus: &EventBus) -> Result<()> {
        if !self.config.enabled {
            info!("Processor is disabled, not starting");
            return Ok(());
        }
        let mut tasks = self
            .tasks
            .lock()
            .map_err(|_| Error::Internal("processor task list poisoned".to_string()))?;
        if !tasks.is_empty() {
            warn!("Processor already started");
            return Ok(());
        }
        self.shutdown_tx.send_replace(false);

        info!(
            subsystem = "processor",
            concurrency = self.config.concurrency,
            modules = ?self.module_names(),
            "Starting processor"
        );

        tasks.push(tokio::spawn(
            self.shared
                .clone()
                .dispatch_events(bus.subscribe(), self.shutdown_tx.subscribe()),
        ));
        for worker_id in 0..self.config.concurrency {
            tasks.push(tokio::spawn(
                self.shared
                    .clone()
                    .worker_loop(worker_id, self.shutdown_tx.subscribe()),
            ));
        }

        let shared = self.shared.clone();
        tasks.push(tokio::spawn(async move {
            if let Err(e) = shared.recover_tasks().await {
                error!(error = %e, "Failed to recover pending processing work");
            }
        }));
        Ok(())
    }

    /// Signal shutdown, abort every spawned task and wait for them to end.
    pub async fn stop(&self) {
        info!(subsystem = "processor", "Stopping processor");
        self.shutdown_tx.send_replace(true);

        let tasks: Vec<JoinHandle<()>> = match self.tasks.lock() {
            Ok(mut tasks) => tasks.drain(..).collect(),
            Err(_) => return,
        };
        for task in &tasks {
            task.abort();
        }
        for task in tasks {
            if let Err(e) = task.await {
                if !e.is_cancelled() {
                    error!(error = %e, "Processor task panicked");
                }
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.tasks.lock().map(|t| !t.is_empty()).unwrap_or(false)
    }

    /// Queue `file_id` for processing. Returns false when it was already
    /// pending and the update was coalesced.
    pub fn handle_note_updated(&self, file_id: i64, file_path: &str) -> bool {
        self.shared.handle_note_updated(file_id, file_path)
    }

    pub fn handle_note_deleted(&self, file_id: i64) {
        self.shared.handle_note_deleted(file_id)
    }

    /// Re-queue files with FAILED tasks and active notebooks never hashed to
    /// completion. Returns how many files were queued.
    pub async fn recover_tasks(&self) -> Result<usize> {
        self.shared.recover_tasks().await
    }

    /// Run every module for `file_id`: global scope first, then all pages
    /// concurrently with modules in registration order within each page.
    ///
    /// Module failures are recorded in the task ledger and do not stop other
    /// modules; only failing to list pages is returned as an error.
    pub async fn process_file(&self, file_id: i64) -> Result<()> {
        self.shared.process_file(file_id).await
    }

    /// Files queued or being processed.
    pub fn pending(&self) -> usize {
        self.shared.in_flight.load(Ordering::SeqCst)
    }

    /// Wait until every queued file has been processed.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.shared.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.pending() == 0 {
                return;
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = ProcessorConfig::default();
        assert_eq!(config.concurrency, 2);
        assert!(config.enabled);
    }

    #[test]
    fn test_concurrency_floor() {
        let config = ProcessorConfig::default().with_concurrency(0);
        assert_eq!(config.concurrency, 1);
    }
}
