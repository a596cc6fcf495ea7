//! In-memory implementations of the repository and coordination traits.
//!
//! Used by pipeline tests and by single-process deployments that do not need
//! durability. Page content and the task ledger share one lock so that
//! [`PageContentRepository::sync_page_hashes`] is atomic exactly like the
//! PostgreSQL transaction.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use sncloud_core::{
    defaults::KV_DEFAULT_TTL_SECS, now_millis, CoordinationStore, Error, NewNotebookFile,
    NotebookFile, NotebookFileRepository, PageContent, PageContentRepository, PageSyncReport,
    Result, SystemTask, TaskCompletion, TaskKey, TaskRepository, TaskStatus,
};

use crate::coordination::lock_key;

fn guard<'a, T>(mutex: &'a Mutex<T>, what: &str) -> Result<MutexGuard<'a, T>> {
    mutex
        .lock()
        .map_err(|_| Error::Internal(format!("{what} lock poisoned")))
}

// =============================================================================
// VFS
// =============================================================================

#[derive(Default)]
struct FileState {
    next_id: i64,
    files: BTreeMap<i64, NotebookFile>,
}

/// In-memory NotebookFileRepository. Ids start at 1.
#[derive(Default)]
pub struct InMemoryNotebookFileRepository {
    state: Mutex<FileState>,
}

impl InMemoryNotebookFileRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark a record inactive, as a VFS delete would.
    pub fn deactivate(&self, file_id: i64) -> Result<()> {
        let mut state = guard(&self.state, "file")?;
        let file = state
            .files
            .get_mut(&file_id)
            .ok_or(Error::FileNotFound(file_id))?;
        file.is_active = false;
        Ok(())
    }
}

#[async_trait]
impl NotebookFileRepository for InMemoryNotebookFileRepository {
    async fn get(&self, file_id: i64) -> Result<Option<NotebookFile>> {
        Ok(guard(&self.state, "file")?.files.get(&file_id).cloned())
    }

    async fn insert(&self, req: NewNotebookFile) -> Result<NotebookFile> {
        let mut state = guard(&self.state, "file")?;
        state.next_id += 1;
        let now = now_millis();
        let file = NotebookFile {
            id: state.next_id,
            user_id: req.user_id,
            directory_id: req.directory_id,
            file_name: req.file_name,
            is_folder: req.is_folder,
            storage_key: req.storage_key,
            size: req.size,
            md5: req.md5,
            is_active: true,
            create_time: now,
            update_time: now,
        };
        state.files.insert(file.id, file.clone());
        Ok(file)
    }

    async fn list_for_user(&self, user_id: i64) -> Result<Vec<NotebookFile>> {
        Ok(guard(&self.state, "file")?
            .files
            .values()
            .filter(|f| f.user_id == user_id && f.is_active)
            .cloned()
            .collect())
    }

    async fn list_active_notebook_ids(&self) -> Result<Vec<i64>> {
        Ok(guard(&self.state, "file")?
            .files
            .values()
            .filter(|f| f.is_active && f.is_notebook())
            .map(|f| f.id)
            .collect())
    }

    async fn update_content(
        &self,
        file_id: i64,
        storage_key: &str,
        size: i64,
        md5: Option<&str>,
    ) -> Result<()> {
        let mut state = guard(&self.state, "file")?;
        let file = state
            .files
            .get_mut(&file_id)
            .ok_or(Error::FileNotFound(file_id))?;
        file.storage_key = Some(storage_key.to_string());
        file.size = size;
        file.md5 = md5.map(str::to_string);
        file.update_time = now_millis();
        Ok(())
    }
}

// =============================================================================
// PAGE CONTENT + TASK LEDGER
// =============================================================================

type TaskId = (i64, String, TaskKey);

#[derive(Default)]
struct LedgerState {
    pages: BTreeMap<(i64, i32), PageContent>,
    tasks: BTreeMap<TaskId, SystemTask>,
}

impl LedgerState {
    fn upsert_task(
        &mut self,
        file_id: i64,
        task_type: &str,
        key: &TaskKey,
        status: TaskStatus,
        last_error: Option<&str>,
    ) {
        let row = SystemTask {
            file_id,
            task_type: task_type.to_string(),
            key: key.clone(),
            status,
            last_error: last_error.map(str::to_string),
            update_time: now_millis(),
        };
        self.tasks
            .insert((file_id, task_type.to_string(), key.clone()), row);
    }

    fn delete_tasks(&mut self, file_id: i64, task_types: &[&str], key: &TaskKey) -> u64 {
        let before = self.tasks.len();
        self.tasks.retain(|(f, t, k), _| {
            !(*f == file_id && k == key && task_types.contains(&t.as_str()))
        });
        (before - self.tasks.len()) as u64
    }
}

/// Shared state behind the in-memory page and task repositories.
#[derive(Clone, Default)]
pub struct InMemoryLedger {
    state: Arc<Mutex<LedgerState>>,
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pages(&self) -> InMemoryPageContentRepository {
        InMemoryPageContentRepository {
            ledger: self.clone(),
        }
    }

    pub fn tasks(&self) -> InMemoryTaskRepository {
        InMemoryTaskRepository {
            ledger: self.clone(),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, LedgerState>> {
        guard(&self.state, "ledger")
    }
}

/// In-memory PageContentRepository.
#[derive(Clone)]
pub struct InMemoryPageContentRepository {
    ledger: InMemoryLedger,
}

#[async_trait]
impl PageContentRepository for InMemoryPageContentRepository {
    async fn get(&self, file_id: i64, page_index: i32) -> Result<Option<PageContent>> {
        Ok(self.ledger.lock()?.pages.get(&(file_id, page_index)).cloned())
    }

    async fn list_page_indices(&self, file_id: i64) -> Result<Vec<i32>> {
        Ok(self
            .ledger
            .lock()?
            .pages
            .range((file_id, i32::MIN)..=(file_id, i32::MAX))
            .map(|((_, index), _)| *index)
            .collect())
    }

    async fn sync_page_hashes(
        &self,
        file_id: i64,
        hashes: &[String],
        invalidate_task_types: &[&str],
        completion: TaskCompletion,
    ) -> Result<PageSyncReport> {
        let mut locked = self.ledger.lock()?;
        let state = &mut *locked;
        let mut report = PageSyncReport {
            total_pages: hashes.len(),
            ..Default::default()
        };

        for (index, hash) in hashes.iter().enumerate() {
            let page_index = index as i32;
            let invalidate = match state.pages.get_mut(&(file_id, page_index)) {
                None => {
                    state.pages.insert(
                        (file_id, page_index),
                        PageContent::new(file_id, page_index, hash.clone()),
                    );
                    report.added += 1;
                    true
                }
                Some(page) if page.content_hash == *hash => {
                    report.unchanged += 1;
                    false
                }
                Some(page) => {
                    page.content_hash = hash.clone();
                    page.text_content = None;
                    page.embedding = None;
                    report.changed += 1;
                    true
                }
            };
            if invalidate {
                state.delete_tasks(file_id, invalidate_task_types, &TaskKey::page(page_index));
            }
        }

        let total = hashes.len() as i32;
        let before = state.pages.len();
        state
            .pages
            .retain(|(f, index), _| *f != file_id || *index < total);
        report.removed = before - state.pages.len();
        state.tasks.retain(|(f, task_type, key), _| {
            !(*f == file_id
                && invalidate_task_types.contains(&task_type.as_str())
                && key.page_index().is_some_and(|index| index >= total))
        });

        state.upsert_task(
            file_id,
            &completion.task_type,
            &completion.key,
            TaskStatus::Completed,
            None,
        );
        Ok(report)
    }

    async fn set_text_content(
        &self,
        file_id: i64,
        page_index: i32,
        text: Option<&str>,
    ) -> Result<()> {
        if let Some(page) = self.ledger.lock()?.pages.get_mut(&(file_id, page_index)) {
            page.text_content = text.map(str::to_string);
        }
        Ok(())
    }

    async fn set_embedding(
        &self,
        file_id: i64,
        page_index: i32,
        embedding: &str,
    ) -> Result<bool> {
        match self.ledger.lock()?.pages.get_mut(&(file_id, page_index)) {
            Some(page) => {
                page.embedding = Some(embedding.to_string());
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn delete_for_file(&self, file_id: i64) -> Result<u64> {
        let mut state = self.ledger.lock()?;
        let before = state.pages.len();
        state.pages.retain(|(f, _), _| *f != file_id);
        Ok((before - state.pages.len()) as u64)
    }
}

/// In-memory TaskRepository.
#[derive(Clone)]
pub struct InMemoryTaskRepository {
    ledger: InMemoryLedger,
}

#[async_trait]
impl TaskRepository for InMemoryTaskRepository {
    async fn get(
        &self,
        file_id: i64,
        task_type: &str,
        key: &TaskKey,
    ) -> Result<Option<SystemTask>> {
        Ok(self
            .ledger
            .lock()?
            .tasks
            .get(&(file_id, task_type.to_string(), key.clone()))
            .cloned())
    }

    async fn upsert_status(
        &self,
        file_id: i64,
        task_type: &str,
        key: &TaskKey,
        status: TaskStatus,
        last_error: Option<&str>,
    ) -> Result<()> {
        let mut state = self.ledger.lock()?;
        if status == TaskStatus::Pending {
            state.delete_tasks(file_id, &[task_type], key);
        } else {
            state.upsert_task(file_id, task_type, key, status, last_error);
        }
        Ok(())
    }

    async fn delete(&self, file_id: i64, task_types: &[&str], key: &TaskKey) -> Result<u64> {
        Ok(self.ledger.lock()?.delete_tasks(file_id, task_types, key))
    }

    async fn list_file_ids_with_status(&self, status: TaskStatus) -> Result<Vec<i64>> {
        let mut ids: Vec<i64> = self
            .ledger
            .lock()?
            .tasks
            .values()
            .filter(|t| t.status == status)
            .map(|t| t.file_id)
            .collect();
        ids.dedup();
        Ok(ids)
    }

    async fn list_for_file(&self, file_id: i64) -> Result<Vec<SystemTask>> {
        Ok(self
            .ledger
            .lock()?
            .tasks
            .values()
            .filter(|t| t.file_id == file_id)
            .cloned()
            .collect())
    }

    async fn delete_for_file(&self, file_id: i64) -> Result<u64> {
        let mut state = self.ledger.lock()?;
        let before = state.tasks.len();
        state.tasks.retain(|(f, _, _), _| *f != file_id);
        Ok((before - state.tasks.len()) as u64)
    }
}

// =============================================================================
// COORDINATION
// =============================================================================

/// In-memory CoordinationStore.
///
/// Expiry uses `tokio::time::Instant`, so tests running with a paused clock
/// can advance past a TTL deterministically.
#[derive(Default)]
pub struct InMemoryCoordinationStore {
    entries: Mutex<HashMap<String, (String, Instant)>>,
}

impl InMemoryCoordinationStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CoordinationStore for InMemoryCoordinationStore {
    async fn set_value(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        let ttl = ttl.unwrap_or(Duration::from_secs(KV_DEFAULT_TTL_SECS));
        guard(&self.entries, "coordination")?
            .insert(key.to_string(), (value.to_string(), Instant::now() + ttl));
        Ok(())
    }

    async fn get_value(&self, key: &str) -> Result<Option<String>> {
        let mut entries = guard(&self.entries, "coordination")?;
        match entries.get(key) {
            Some((_, expires_at)) if *expires_at <= Instant::now() => {
                entries.remove(key);
                Ok(None)
            }
            Some((value, _)) => Ok(Some(value.clone())),
            None => Ok(None),
        }
    }

    async fn delete_value(&self, key: &str) -> Result<()> {
        guard(&self.entries, "coordination")?.remove(key);
        Ok(())
    }

    async fn acquire_lock(&self, key: &str, owner: &str, ttl: Duration) -> Result<bool> {
        let mut entries = guard(&self.entries, "coordination")?;
        let key = lock_key(key);
        let now = Instant::now();
        let free = match entries.get(&key) {
            None => true,
            Some((holder, expires_at)) => *expires_at <= now || holder == owner,
        };
        if free {
            entries.insert(key, (owner.to_string(), now + ttl));
        }
        Ok(free)
    }

    async fn release_lock(&self, key: &str, owner: &str) -> Result<bool> {
        let mut entries = guard(&self.entries, "coordination")?;
        let key = lock_key(key);
        let held = matches!(entries.get(&key), Some((holder, _)) if holder == owner);
        if held {
            entries.remove(&key);
        }
        Ok(held)
    }
}
