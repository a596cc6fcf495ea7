//! Domain models for sncloud.

use std::fmt;
use std::str::FromStr;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::defaults::NOTEBOOK_EXTENSION;
use crate::error::{Error, Result};

/// Milliseconds since the Unix epoch, the time unit of every persisted timestamp.
pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

// =============================================================================
// VFS
// =============================================================================

/// Identity record of an uploaded file or folder in a user's virtual filesystem.
///
/// The bytes live in the blob store under `storage_key`; moving or renaming
/// only touches this record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotebookFile {
    pub id: i64,
    pub user_id: i64,
    /// Parent folder id, `0` for the root.
    pub directory_id: i64,
    pub file_name: String,
    pub is_folder: bool,
    pub storage_key: Option<String>,
    pub size: i64,
    /// Hex MD5 reported at upload time.
    pub md5: Option<String>,
    pub is_active: bool,
    pub create_time: i64,
    pub update_time: i64,
}

impl NotebookFile {
    /// Whether this entry is a notebook handled by the page pipeline.
    pub fn is_notebook(&self) -> bool {
        !self.is_folder
            && self
                .file_name
                .to_ascii_lowercase()
                .ends_with(NOTEBOOK_EXTENSION)
    }
}

/// Request for creating a VFS entry.
#[derive(Debug, Clone, Default)]
pub struct NewNotebookFile {
    pub user_id: i64,
    pub directory_id: i64,
    pub file_name: String,
    pub is_folder: bool,
    pub storage_key: Option<String>,
    pub size: i64,
    pub md5: Option<String>,
}

impl NewNotebookFile {
    /// A file entry backed by a blob.
    pub fn file(
        user_id: i64,
        directory_id: i64,
        file_name: impl Into<String>,
        storage_key: impl Into<String>,
        size: i64,
        md5: Option<String>,
    ) -> Self {
        Self {
            user_id,
            directory_id,
            file_name: file_name.into(),
            is_folder: false,
            storage_key: Some(storage_key.into()),
            size,
            md5,
        }
    }

    /// A folder entry.
    pub fn folder(user_id: i64, directory_id: i64, file_name: impl Into<String>) -> Self {
        Self {
            user_id,
            directory_id,
            file_name: file_name.into(),
            is_folder: true,
            ..Default::default()
        }
    }
}

// =============================================================================
// PAGE CONTENT
// =============================================================================

/// Derived per-page state of a notebook.
///
/// `content_hash` identifies what the page currently contains. Whenever it
/// changes, `text_content` and `embedding` are cleared in the same transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageContent {
    pub file_id: i64,
    pub page_index: i32,
    pub content_hash: String,
    pub text_content: Option<String>,
    /// JSON-encoded embedding vector.
    pub embedding: Option<String>,
}

impl PageContent {
    /// A freshly detected page with no derived data yet.
    pub fn new(file_id: i64, page_index: i32, content_hash: impl Into<String>) -> Self {
        Self {
            file_id,
            page_index,
            content_hash: content_hash.into(),
            text_content: None,
            embedding: None,
        }
    }

    /// Whether OCR-like text is available for downstream stages.
    pub fn has_text(&self) -> bool {
        self.text_content.as_deref().is_some_and(|t| !t.is_empty())
    }

    /// Decode the stored embedding.
    pub fn embedding_vector(&self) -> Result<Option<Vec<f32>>> {
        self.embedding
            .as_deref()
            .map(|raw| serde_json::from_str::<Vec<f32>>(raw).map_err(Error::from))
            .transpose()
    }
}

/// Ledger row written as COMPLETED in the same transaction as a page-hash sync.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskCompletion {
    pub task_type: String,
    pub key: TaskKey,
}

impl TaskCompletion {
    pub fn global(task_type: impl Into<String>) -> Self {
        Self {
            task_type: task_type.into(),
            key: TaskKey::global(),
        }
    }
}

/// Counts produced by one hashing pass over a notebook.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PageSyncReport {
    pub total_pages: usize,
    pub added: usize,
    pub changed: usize,
    pub unchanged: usize,
    pub removed: usize,
}

// =============================================================================
// TASK LEDGER
// =============================================================================

/// Task types recorded in the ledger.
pub mod task_types {
    pub const HASHING: &str = "HASHING";
    pub const PNG_CONVERSION: &str = "PNG_CONVERSION";
    pub const OCR_EXTRACTION: &str = "OCR_EXTRACTION";
    pub const EMBEDDING_GENERATION: &str = "EMBEDDING_GENERATION";

    /// Page-level task types invalidated when a page's hash changes.
    pub const DOWNSTREAM_PAGE_TASKS: [&str; 3] =
        [PNG_CONVERSION, OCR_EXTRACTION, EMBEDDING_GENERATION];
}

/// Status of a ledger row. `Pending` is never stored: it is the absence of a row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TaskStatus {
    Pending,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "PENDING",
            TaskStatus::Completed => "COMPLETED",
            TaskStatus::Failed => "FAILED",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "PENDING" => Ok(TaskStatus::Pending),
            "COMPLETED" => Ok(TaskStatus::Completed),
            "FAILED" => Ok(TaskStatus::Failed),
            other => Err(Error::InvalidInput(format!("unknown task status: {other}"))),
        }
    }
}

/// Key distinguishing file-wide from per-page instances of one task type.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskKey(String);

impl TaskKey {
    pub const GLOBAL: &'static str = "global";

    /// The file-wide key.
    pub fn global() -> Self {
        TaskKey(Self::GLOBAL.to_string())
    }

    /// The key for one page.
    pub fn page(page_index: i32) -> Self {
        TaskKey(format!("page_{page_index}"))
    }

    /// `"global"` when `page_index` is `None`, else `"page_{n}"`.
    pub fn for_page(page_index: Option<i32>) -> Self {
        match page_index {
            Some(index) => Self::page(index),
            None => Self::global(),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Page index encoded in this key, if it is a page key.
    pub fn page_index(&self) -> Option<i32> {
        self.0.strip_prefix("page_")?.parse().ok()
    }
}

impl fmt::Display for TaskKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TaskKey {
    fn from(s: &str) -> Self {
        TaskKey(s.to_string())
    }
}

/// One row of the task ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemTask {
    pub file_id: i64,
    pub task_type: String,
    pub key: TaskKey,
    pub status: TaskStatus,
    pub last_error: Option<String>,
    pub update_time: i64,
}

impl SystemTask {
    pub fn is_completed(&self) -> bool {
        self.status == TaskStatus::Completed
    }
}

// =============================================================================
// BLOBS AND INTEGRITY
// =============================================================================

/// Size and optional MD5 of a stored blob.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobMetadata {
    pub size: u64,
    pub content_md5: Option<String>,
}

/// Outcome of a consistency scan over a user's VFS and blobs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntegrityReport {
    pub scanned: usize,
    pub ok: usize,
    pub orphans: usize,
    pub missing_blob: usize,
    pub size_mismatch: usize,
    pub hash_mismatch: usize,
}

impl IntegrityReport {
    pub fn is_clean(&self) -> bool {
        self.scanned == self.ok
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_key_construction() {
        assert_eq!(TaskKey::for_page(None).as_str(), "global");
        assert_eq!(TaskKey::for_page(Some(0)).as_str(), "page_0");
        assert_eq!(TaskKey::page(12).to_string(), "page_12");
    }

    #[test]
    fn test_task_key_page_index() {
        assert_eq!(TaskKey::page(7).page_index(), Some(7));
        assert_eq!(TaskKey::global().page_index(), None);
        assert_eq!(TaskKey::from("page_x").page_index(), None);
    }

    #[test]
    fn test_task_status_round_trip() {
        for status in [TaskStatus::Pending, TaskStatus::Completed, TaskStatus::Failed] {
            assert_eq!(status.as_str().parse::<TaskStatus>().unwrap(), status);
        }
        assert!("completed".parse::<TaskStatus>().is_err());
    }

    #[test]
    fn test_task_status_serde_uppercase() {
        let json = serde_json::to_string(&TaskStatus::Completed).unwrap();
        assert_eq!(json, "\"COMPLETED\"");
    }

    #[test]
    fn test_is_notebook() {
        let mut file = NotebookFile {
            id: 1,
            user_id: 1,
            directory_id: 0,
            file_name: "Meeting.NOTE".to_string(),
            is_folder: false,
            storage_key: Some("k".into()),
            size: 10,
            md5: None,
            is_active: true,
            create_time: 0,
            update_time: 0,
        };
        assert!(file.is_notebook());
        file.file_name = "report.pdf".into();
        assert!(!file.is_notebook());
        file.file_name = "Folder.note".into();
        file.is_folder = true;
        assert!(!file.is_notebook());
    }

    #[test]
    fn test_page_content_has_text() {
        let mut page = PageContent::new(1, 0, "abc");
        assert!(!page.has_text());
        page.text_content = Some(String::new());
        assert!(!page.has_text());
        page.text_content = Some("   ".into());
        assert!(page.has_text());
        page.text_content = Some("hello".into());
        assert!(page.has_text());
    }

    #[test]
    fn test_embedding_vector_decode() {
        let mut page = PageContent::new(1, 0, "abc");
        assert_eq!(page.embedding_vector().unwrap(), None);
        page.embedding = Some("[0.5,1.0]".into());
        assert_eq!(page.embedding_vector().unwrap(), Some(vec![0.5, 1.0]));
        page.embedding = Some("not json".into());
        assert!(page.embedding_vector().is_err());
    }

    #[test]
    fn test_integrity_report_clean() {
        let report = IntegrityReport {
            scanned: 3,
            ok: 3,
            ..Default::default()
        };
        assert!(report.is_clean());
    }
}
