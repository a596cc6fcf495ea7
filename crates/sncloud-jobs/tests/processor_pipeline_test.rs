//! End-to-end pipeline tests against the in-memory repositories.
//!
//! Covers:
//! - Re-running a file without content changes does no repeated work
//! - Changed pages lose derived data and downstream task rows
//! - Shrinking a notebook removes trailing page rows and their task rows
//! - Embedding waits for text content
//! - Repeated updates for one file never overlap
//! - Pages of one file are processed concurrently
//! - Startup recovery re-queues unfinished files
//! - Missed bus events re-queue every active notebook

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use tempfile::TempDir;

use sncloud_db::{
    BlobStore, InMemoryLedger, InMemoryNotebookFileRepository, InMemoryPageContentRepository,
    InMemoryTaskRepository, LocalBlobStore,
};
use sncloud_inference::MockEmbeddingBackend;
use sncloud_jobs::{
    defaults::USER_DATA_BUCKET,
    run_module,
    task_types::{EMBEDDING_GENERATION, HASHING, OCR_EXTRACTION},
    EventBus, GeminiEmbeddingModule, ModuleOutcome, NewNotebookFile, NoteEvent, NoteFileBuilder,
    NotebookFileRepository, PageContentRepository, PageHashingModule, ProcessingContext,
    ProcessorConfig, ProcessorModule, ProcessorService, Result, TaskCompletion, TaskKey,
    TaskRepository, TaskStatus,
};

// ============================================================================
// HELPERS
// ============================================================================

struct Pipeline {
    _dir: TempDir,
    files: Arc<InMemoryNotebookFileRepository>,
    pages: Arc<InMemoryPageContentRepository>,
    tasks: Arc<InMemoryTaskRepository>,
    blobs: Arc<LocalBlobStore>,
    backend: MockEmbeddingBackend,
    processor: ProcessorService,
}

impl Pipeline {
    fn ctx(
        files: &Arc<InMemoryNotebookFileRepository>,
        pages: &Arc<InMemoryPageContentRepository>,
        tasks: &Arc<InMemoryTaskRepository>,
        blobs: &Arc<LocalBlobStore>,
    ) -> ProcessingContext {
        ProcessingContext::new(files.clone(), pages.clone(), tasks.clone(), blobs.clone())
    }

    /// Pipeline with no modules registered.
    fn bare(config: ProcessorConfig) -> Self {
        let dir = TempDir::new().unwrap();
        let ledger = InMemoryLedger::new();
        let files = Arc::new(InMemoryNotebookFileRepository::new());
        let pages = Arc::new(ledger.pages());
        let tasks = Arc::new(ledger.tasks());
        let blobs = Arc::new(LocalBlobStore::new(dir.path()));
        let processor = ProcessorService::new(Self::ctx(&files, &pages, &tasks, &blobs), config);
        Self {
            _dir: dir,
            files,
            pages,
            tasks,
            blobs,
            backend: MockEmbeddingBackend::new().with_dimension(8),
            processor,
        }
    }

    /// Pipeline with hashing then embedding registered.
    fn standard() -> Self {
        let pipeline = Self::bare(ProcessorConfig::default());
        pipeline
            .processor
            .register_module(Arc::new(PageHashingModule::new()));
        pipeline
            .processor
            .register_module(Arc::new(GeminiEmbeddingModule::new(Arc::new(
                pipeline.backend.clone(),
            ))));
        pipeline
    }

    fn context(&self) -> ProcessingContext {
        Self::ctx(&self.files, &self.pages, &self.tasks, &self.blobs)
    }

    async fn upload(&self, name: &str, key: &str, data: Vec<u8>) -> i64 {
        let meta = self
            .blobs
            .put_bytes(USER_DATA_BUCKET, key, Bytes::from(data))
            .await
            .unwrap();
        self.files
            .insert(NewNotebookFile::file(
                1,
                0,
                name,
                key,
                meta.size as i64,
                meta.content_md5,
            ))
            .await
            .unwrap()
            .id
    }

    async fn overwrite(&self, key: &str, data: Vec<u8>) {
        self.blobs
            .put_bytes(USER_DATA_BUCKET, key, Bytes::from(data))
            .await
            .unwrap();
    }

    /// Stand-in for the OCR stage.
    async fn fill_text(&self, file_id: i64) {
        for page_index in self.pages.list_page_indices(file_id).await.unwrap() {
            let text = format!("text of page {}", page_index);
            self.pages
                .set_text_content(file_id, page_index, Some(&text))
                .await
                .unwrap();
            self.tasks
                .upsert_status(
                    file_id,
                    OCR_EXTRACTION,
                    &TaskKey::page(page_index),
                    TaskStatus::Completed,
                    None,
                )
                .await
                .unwrap();
        }
    }
}

fn notebook(bitmaps: &[&str]) -> Vec<u8> {
    bitmaps
        .iter()
        .fold(NoteFileBuilder::new(), |b, bitmap| b.page(bitmap.as_bytes().to_vec()))
        .build()
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Scope {
    Global,
    Page,
}

/// Sleeps, then reports completion. Tracks how many runs overlap.
struct TimedModule {
    name: &'static str,
    scope: Scope,
    delay: Duration,
    runs: AtomicUsize,
    active: AtomicUsize,
    max_active: AtomicUsize,
}

impl TimedModule {
    fn new(name: &'static str, scope: Scope, delay_ms: u64) -> Arc<Self> {
        Arc::new(Self {
            name,
            scope,
            delay: Duration::from_millis(delay_ms),
            runs: AtomicUsize::new(0),
            active: AtomicUsize::new(0),
            max_active: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl ProcessorModule for TimedModule {
    fn name(&self) -> &str {
        self.name
    }

    fn task_type(&self) -> &str {
        self.name
    }

    async fn run_if_needed(
        &self,
        _ctx: &ProcessingContext,
        _file_id: i64,
        page_index: Option<i32>,
    ) -> Result<bool> {
        Ok(match self.scope {
            Scope::Global => page_index.is_none(),
            Scope::Page => page_index.is_some(),
        })
    }

    async fn process(
        &self,
        _ctx: &ProcessingContext,
        _file_id: i64,
        _page_index: Option<i32>,
    ) -> Result<ModuleOutcome> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        self.active.fetch_sub(1, Ordering::SeqCst);
        Ok(ModuleOutcome::Completed)
    }
}

// ============================================================================
// PIPELINE PROPERTIES
// ============================================================================

#[tokio::test]
async fn test_reprocessing_unchanged_file_is_idempotent() {
    let p = Pipeline::standard();
    let file_id = p.upload("a.note", "key-a", notebook(&["p0", "p1", "p2"])).await;

    p.processor.process_file(file_id).await.unwrap();
    assert_eq!(p.pages.list_page_indices(file_id).await.unwrap(), vec![0, 1, 2]);
    // No text yet, so nothing to embed.
    assert_eq!(p.backend.call_count(), 0);

    p.fill_text(file_id).await;
    p.processor.process_file(file_id).await.unwrap();
    assert_eq!(p.backend.call_count(), 3);

    let mut before = Vec::new();
    for i in 0..3 {
        before.push(p.pages.get(file_id, i).await.unwrap().unwrap());
    }
    let embedding_rows_before: Vec<_> = p
        .tasks
        .list_for_file(file_id)
        .await
        .unwrap()
        .into_iter()
        .filter(|t| t.task_type == EMBEDDING_GENERATION)
        .collect();

    p.processor.process_file(file_id).await.unwrap();

    assert_eq!(p.backend.call_count(), 3, "second pass must not re-embed");
    for (i, page) in before.iter().enumerate() {
        assert_eq!(&p.pages.get(file_id, i as i32).await.unwrap().unwrap(), page);
        assert!(page.embedding.is_some());
    }
    let embedding_rows_after: Vec<_> = p
        .tasks
        .list_for_file(file_id)
        .await
        .unwrap()
        .into_iter()
        .filter(|t| t.task_type == EMBEDDING_GENERATION)
        .collect();
    assert_eq!(embedding_rows_before, embedding_rows_after);

    let ctx = p.context();
    let embedding = GeminiEmbeddingModule::new(Arc::new(p.backend.clone()));
    for i in 0..3 {
        assert!(!embedding.run_if_needed(&ctx, file_id, Some(i)).await.unwrap());
    }
}

#[tokio::test]
async fn test_changed_page_invalidates_downstream_data() {
    let p = Pipeline::standard();
    let file_id = p.upload("a.note", "key-a", notebook(&["p0", "p1", "p2"])).await;

    p.processor.process_file(file_id).await.unwrap();
    p.fill_text(file_id).await;
    p.processor.process_file(file_id).await.unwrap();
    let old_hash = p.pages.get(file_id, 1).await.unwrap().unwrap().content_hash;

    p.overwrite("key-a", notebook(&["p0", "p1 with new strokes", "p2"])).await;
    // Hashing alone, so the cascade is observable before re-embedding.
    let ctx = p.context();
    assert!(run_module(&PageHashingModule::new(), &ctx, file_id, None).await);

    let changed = p.pages.get(file_id, 1).await.unwrap().unwrap();
    assert_ne!(changed.content_hash, old_hash);
    assert!(changed.text_content.is_none());
    assert!(changed.embedding.is_none());
    for task_type in [OCR_EXTRACTION, EMBEDDING_GENERATION] {
        assert!(p
            .tasks
            .get(file_id, task_type, &TaskKey::page(1))
            .await
            .unwrap()
            .is_none());
    }

    for untouched in [0, 2] {
        let page = p.pages.get(file_id, untouched).await.unwrap().unwrap();
        assert!(page.text_content.is_some());
        assert!(page.embedding.is_some());
        assert!(p
            .tasks
            .get(file_id, EMBEDDING_GENERATION, &TaskKey::page(untouched))
            .await
            .unwrap()
            .unwrap()
            .is_completed());
    }

    // Once text is back, only the changed page is embedded again.
    p.fill_text(file_id).await;
    p.processor.process_file(file_id).await.unwrap();
    assert_eq!(p.backend.call_count(), 4);
    assert!(p.pages.get(file_id, 1).await.unwrap().unwrap().embedding.is_some());
}

#[tokio::test]
async fn test_shrinking_notebook_removes_trailing_pages() {
    let p = Pipeline::standard();
    let file_id = p
        .upload("a.note", "key-a", notebook(&["p0", "p1", "p2", "p3", "p4"]))
        .await;

    p.processor.process_file(file_id).await.unwrap();
    assert_eq!(p.pages.list_page_indices(file_id).await.unwrap(), vec![0, 1, 2, 3, 4]);

    p.overwrite("key-a", notebook(&["p0", "p1", "p2"])).await;
    p.processor.process_file(file_id).await.unwrap();

    assert_eq!(p.pages.list_page_indices(file_id).await.unwrap(), vec![0, 1, 2]);
    assert!(p.pages.get(file_id, 3).await.unwrap().is_none());
    assert!(p.pages.get(file_id, 4).await.unwrap().is_none());
}

#[tokio::test]
async fn test_regrown_pages_are_processed_again() {
    let p = Pipeline::standard();
    let file_id = p
        .upload("a.note", "key-a", notebook(&["p0", "p1", "p2", "p3", "p4"]))
        .await;
    p.processor.process_file(file_id).await.unwrap();
    p.fill_text(file_id).await;
    p.processor.process_file(file_id).await.unwrap();
    assert_eq!(p.backend.call_count(), 5);

    p.overwrite("key-a", notebook(&["p0", "p1", "p2"])).await;
    p.processor.process_file(file_id).await.unwrap();
    for task_type in [OCR_EXTRACTION, EMBEDDING_GENERATION] {
        for page in [3, 4] {
            assert!(p
                .tasks
                .get(file_id, task_type, &TaskKey::page(page))
                .await
                .unwrap()
                .is_none());
        }
    }

    p.overwrite("key-a", notebook(&["p0", "p1", "p2", "new p3", "new p4"]))
        .await;
    p.processor.process_file(file_id).await.unwrap();
    let regrown = p.pages.get(file_id, 3).await.unwrap().unwrap();
    assert!(regrown.text_content.is_none());
    assert!(regrown.embedding.is_none());

    p.fill_text(file_id).await;
    p.processor.process_file(file_id).await.unwrap();
    assert_eq!(p.backend.call_count(), 7);
    for page in [3, 4] {
        assert!(p.pages.get(file_id, page).await.unwrap().unwrap().embedding.is_some());
    }
}

#[tokio::test]
async fn test_embedding_waits_for_text_then_runs_once() {
    let p = Pipeline::standard();
    let file_id = p.upload("a.note", "key-a", notebook(&["p0"])).await;
    p.processor.process_file(file_id).await.unwrap();

    let ctx = p.context();
    let module = GeminiEmbeddingModule::new(Arc::new(p.backend.clone()));

    assert!(!module.run_if_needed(&ctx, file_id, Some(0)).await.unwrap());

    p.pages
        .set_text_content(file_id, 0, Some("handwriting"))
        .await
        .unwrap();
    assert!(module.run_if_needed(&ctx, file_id, Some(0)).await.unwrap());

    assert!(run_module(&module, &ctx, file_id, Some(0)).await);
    assert!(run_module(&module, &ctx, file_id, Some(0)).await);
    assert_eq!(p.backend.call_count(), 1);
    assert!(!module.run_if_needed(&ctx, file_id, Some(0)).await.unwrap());
}

#[tokio::test]
async fn test_failed_embedding_is_retried_on_next_pass() {
    let p = Pipeline::bare(ProcessorConfig::default());
    let failing = MockEmbeddingBackend::new().with_failure("quota exceeded");
    p.processor
        .register_module(Arc::new(PageHashingModule::new()));
    p.processor
        .register_module(Arc::new(GeminiEmbeddingModule::new(Arc::new(failing.clone()))));

    let file_id = p.upload("a.note", "key-a", notebook(&["p0"])).await;
    p.processor.process_file(file_id).await.unwrap();
    p.fill_text(file_id).await;
    p.processor.process_file(file_id).await.unwrap();

    let task = p
        .tasks
        .get(file_id, EMBEDDING_GENERATION, &TaskKey::page(0))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(task.status, TaskStatus::Failed);

    p.processor.process_file(file_id).await.unwrap();
    assert_eq!(failing.call_count(), 2);
}

// ============================================================================
// SCHEDULING
// ============================================================================

#[tokio::test]
async fn test_duplicate_updates_are_coalesced() {
    let p = Pipeline::bare(ProcessorConfig::default());

    assert!(p.processor.handle_note_updated(7, "/Note/a.note"));
    assert!(!p.processor.handle_note_updated(7, "/Note/a.note"));
    assert!(p.processor.handle_note_updated(8, "/Note/b.note"));
    assert_eq!(p.processor.pending(), 2);
}

#[tokio::test]
async fn test_same_file_never_processed_concurrently() {
    let p = Pipeline::bare(ProcessorConfig::default().with_concurrency(4));
    let timed = TimedModule::new("TIMED", Scope::Global, 100);
    p.processor.register_module(timed.clone());
    let bus = EventBus::default();
    p.processor.start(&bus).unwrap();

    p.processor.handle_note_updated(42, "/Note/a.note");
    tokio::time::sleep(Duration::from_millis(20)).await;
    for _ in 0..5 {
        p.processor.handle_note_updated(42, "/Note/a.note");
    }
    p.processor.wait_idle().await;
    p.processor.stop().await;

    assert_eq!(timed.max_active.load(Ordering::SeqCst), 1);
    assert_eq!(timed.runs.load(Ordering::SeqCst), 1);
    assert_eq!(p.processor.pending(), 0);
}

#[tokio::test]
async fn test_events_drive_processing() {
    let p = Pipeline::standard();
    let file_id = p.upload("a.note", "key-a", notebook(&["p0", "p1"])).await;
    let bus = EventBus::default();
    p.processor.start(&bus).unwrap();

    bus.emit(NoteEvent::NoteUpdated {
        file_id,
        file_path: "/Note/a.note".to_string(),
    });

    let deadline = Instant::now() + Duration::from_secs(5);
    while p.pages.list_page_indices(file_id).await.unwrap().len() < 2 {
        assert!(Instant::now() < deadline, "file was never processed");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    p.processor.wait_idle().await;
    p.processor.stop().await;

    assert!(p
        .tasks
        .get(file_id, HASHING, &TaskKey::global())
        .await
        .unwrap()
        .unwrap()
        .is_completed());
    assert!(!p.processor.is_running());
}

#[tokio::test]
async fn test_missed_events_requeue_hashed_notebooks() {
    let p = Pipeline::standard();
    let file_id = p.upload("a.note", "key-a", notebook(&["p0", "p1"])).await;
    p.processor.process_file(file_id).await.unwrap();
    let old_hash = p.pages.get(file_id, 0).await.unwrap().unwrap().content_hash;

    p.overwrite("key-a", notebook(&["p0 edited", "p1", "p2"])).await;

    let bus = EventBus::new(2);
    p.processor.start(&bus).unwrap();
    // The dispatcher has not run yet, so the first event is overwritten.
    bus.emit(NoteEvent::NoteUpdated {
        file_id,
        file_path: "/Note/a.note".to_string(),
    });
    for other in 1000..1004 {
        bus.emit(NoteEvent::NoteUpdated {
            file_id: other,
            file_path: format!("/Note/{}.note", other),
        });
    }

    let deadline = Instant::now() + Duration::from_secs(5);
    while p.pages.list_page_indices(file_id).await.unwrap().len() < 3 {
        assert!(Instant::now() < deadline, "lagged update was never processed");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    p.processor.wait_idle().await;
    p.processor.stop().await;

    let page = p.pages.get(file_id, 0).await.unwrap().unwrap();
    assert_ne!(page.content_hash, old_hash);
}

#[tokio::test]
async fn test_pages_run_in_parallel() {
    let p = Pipeline::bare(ProcessorConfig::default());
    p.processor
        .register_module(TimedModule::new("GLOBAL_BEFORE", Scope::Global, 10));
    p.processor
        .register_module(TimedModule::new("PAGE_STAGE", Scope::Page, 500));
    p.processor
        .register_module(TimedModule::new("GLOBAL_AFTER", Scope::Global, 10));

    let hashes: Vec<String> = (0..4).map(|i| format!("hash-{}", i)).collect();
    p.pages
        .sync_page_hashes(123, &hashes, &[], TaskCompletion::global(HASHING))
        .await
        .unwrap();

    let start = Instant::now();
    p.processor.process_file(123).await.unwrap();
    let elapsed = start.elapsed();

    assert!(
        elapsed < Duration::from_secs(1),
        "processing took {:?}, pages did not overlap",
        elapsed
    );
    assert!(elapsed >= Duration::from_millis(500), "processing took {:?}", elapsed);
}

#[tokio::test]
async fn test_failing_module_does_not_block_others() {
    struct Broken;

    #[async_trait]
    impl ProcessorModule for Broken {
        fn name(&self) -> &str {
            "Broken"
        }
        fn task_type(&self) -> &str {
            "BROKEN"
        }
        async fn process(
            &self,
            _ctx: &ProcessingContext,
            _file_id: i64,
            _page_index: Option<i32>,
        ) -> Result<ModuleOutcome> {
            Err(sncloud_jobs::Error::Internal("boom".to_string()))
        }
    }

    let p = Pipeline::bare(ProcessorConfig::default());
    p.processor.register_module(Arc::new(Broken));
    p.processor
        .register_module(Arc::new(PageHashingModule::new()));
    let file_id = p.upload("a.note", "key-a", notebook(&["p0", "p1"])).await;

    p.processor.process_file(file_id).await.unwrap();

    assert_eq!(p.pages.list_page_indices(file_id).await.unwrap(), vec![0, 1]);
    let global = p
        .tasks
        .get(file_id, "BROKEN", &TaskKey::global())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(global.status, TaskStatus::Failed);
    assert_eq!(global.last_error.as_deref(), Some("Internal error: boom"));
    for page in 0..2 {
        assert_eq!(
            p.tasks
                .get(file_id, "BROKEN", &TaskKey::page(page))
                .await
                .unwrap()
                .unwrap()
                .status,
            TaskStatus::Failed
        );
    }
}

#[tokio::test]
async fn test_recover_tasks_requeues_unfinished_files() {
    let p = Pipeline::standard();
    let never_hashed = p.upload("a.note", "key-a", notebook(&["p0"])).await;
    let done = p.upload("b.note", "key-b", notebook(&["p0"])).await;
    let failed = p.upload("c.note", "key-c", notebook(&["p0"])).await;
    let deleted = p.upload("d.note", "key-d", notebook(&["p0"])).await;
    let not_a_notebook = p.upload("e.pdf", "key-e", b"%PDF".to_vec()).await;

    for id in [done, failed, deleted] {
        p.processor.process_file(id).await.unwrap();
    }
    for id in [failed, deleted] {
        p.tasks
            .upsert_status(id, EMBEDDING_GENERATION, &TaskKey::page(0), TaskStatus::Failed, Some("x"))
            .await
            .unwrap();
    }
    p.files.deactivate(deleted).unwrap();

    let enqueued = p.processor.recover_tasks().await.unwrap();

    assert_eq!(enqueued, 2);
    assert_eq!(p.processor.pending(), 2);
    // Both already queued, so explicit updates coalesce.
    assert!(!p.processor.handle_note_updated(never_hashed, "/a.note"));
    assert!(!p.processor.handle_note_updated(failed, "/c.note"));
    assert!(p.processor.handle_note_updated(not_a_notebook, "/e.pdf"));
}

#[tokio::test]
async fn test_disabled_processor_does_not_start() {
    let p = Pipeline::bare(ProcessorConfig::default().with_enabled(false));
    p.processor.start(&EventBus::default()).unwrap();
    assert!(!p.processor.is_running());
    p.processor.stop().await;
}
