//! Core traits for sncloud abstractions.
//!
//! These traits define the interfaces that concrete implementations
//! must satisfy, enabling pluggable backends and testability.

use std::time::Duration;

use async_trait::async_trait;

use crate::error::Result;
use crate::models::*;

// =============================================================================
// VFS REPOSITORY
// =============================================================================

/// Repository for the user VFS records.
#[async_trait]
pub trait NotebookFileRepository: Send + Sync {
    /// Fetch a record by id, `None` when absent.
    async fn get(&self, file_id: i64) -> Result<Option<NotebookFile>>;

    /// Create a record and return it with its assigned id.
    async fn insert(&self, req: NewNotebookFile) -> Result<NotebookFile>;

    /// Every active entry of one user, folders included.
    async fn list_for_user(&self, user_id: i64) -> Result<Vec<NotebookFile>>;

    /// Ids of active non-folder `.note` entries across all users.
    async fn list_active_notebook_ids(&self) -> Result<Vec<i64>>;

    /// Point a file at new content after an upload replaced it.
    async fn update_content(
        &self,
        file_id: i64,
        storage_key: &str,
        size: i64,
        md5: Option<&str>,
    ) -> Result<()>;
}

// =============================================================================
// PAGE CONTENT REPOSITORY
// =============================================================================

/// Repository for derived per-page data.
#[async_trait]
pub trait PageContentRepository: Send + Sync {
    async fn get(&self, file_id: i64, page_index: i32) -> Result<Option<PageContent>>;

    /// Stored page indices of a file, ascending.
    async fn list_page_indices(&self, file_id: i64) -> Result<Vec<i32>>;

    /// Reconcile stored pages with freshly computed hashes in one unit of work.
    ///
    /// `hashes[i]` is the hash of page `i`. New pages are inserted; pages whose
    /// hash changed get their text and embedding cleared and the
    /// `invalidate_task_types` rows for `page_{i}` deleted; rows with an index
    /// `>= hashes.len()` are removed; `completion` is upserted as COMPLETED.
    /// Nothing is persisted if any step fails.
    async fn sync_page_hashes(
        &self,
        file_id: i64,
        hashes: &[String],
        invalidate_task_types: &[&str],
        completion: TaskCompletion,
    ) -> Result<PageSyncReport>;

    /// Set or clear the extracted text of a page.
    async fn set_text_content(
        &self,
        file_id: i64,
        page_index: i32,
        text: Option<&str>,
    ) -> Result<()>;

    /// Store an embedding. Returns `false` when the page no longer exists.
    async fn set_embedding(&self, file_id: i64, page_index: i32, embedding: &str)
        -> Result<bool>;

    /// Remove every page row of a file.
    async fn delete_for_file(&self, file_id: i64) -> Result<u64>;
}

// =============================================================================
// TASK LEDGER REPOSITORY
// =============================================================================

/// Repository for the `(file_id, task_type, key)` status ledger.
#[async_trait]
pub trait TaskRepository: Send + Sync {
    async fn get(&self, file_id: i64, task_type: &str, key: &TaskKey)
        -> Result<Option<SystemTask>>;

    /// Create or overwrite a row, stamping a fresh `update_time`.
    async fn upsert_status(
        &self,
        file_id: i64,
        task_type: &str,
        key: &TaskKey,
        status: TaskStatus,
        last_error: Option<&str>,
    ) -> Result<()>;

    /// Delete the rows of the given types under one key.
    async fn delete(&self, file_id: i64, task_types: &[&str], key: &TaskKey) -> Result<u64>;

    /// Distinct file ids having at least one row in `status`.
    async fn list_file_ids_with_status(&self, status: TaskStatus) -> Result<Vec<i64>>;

    async fn list_for_file(&self, file_id: i64) -> Result<Vec<SystemTask>>;

    async fn delete_for_file(&self, file_id: i64) -> Result<u64>;
}

// =============================================================================
// COORDINATION
// =============================================================================

/// Shared key/value store with expiry, also used for sync locks.
#[async_trait]
pub trait CoordinationStore: Send + Sync {
    /// Store a value. `None` applies the default one-year TTL.
    async fn set_value(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()>;

    /// Read a value. Expired entries read as absent and are removed.
    async fn get_value(&self, key: &str) -> Result<Option<String>>;

    async fn delete_value(&self, key: &str) -> Result<()>;

    /// Take the lock `key` for `owner`. Returns `false` while someone else
    /// holds an unexpired lock; re-acquiring one's own lock refreshes it.
    async fn acquire_lock(&self, key: &str, owner: &str, ttl: Duration) -> Result<bool>;

    /// Release the lock if `owner` holds it. Returns whether it was released.
    async fn release_lock(&self, key: &str, owner: &str) -> Result<bool>;
}

// =============================================================================
// INFERENCE TRAITS
// =============================================================================

/// Backend for generating text embeddings.
#[async_trait]
pub trait EmbeddingBackend: Send + Sync {
    /// Generate embeddings for the given texts, one vector per input.
    async fn embed_texts(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    /// Expected dimension of embedding vectors.
    fn dimension(&self) -> usize;

    fn model_name(&self) -> &str;

    /// Whether credentials are present. Unconfigured backends fail every call.
    fn is_configured(&self) -> bool {
        true
    }
}
