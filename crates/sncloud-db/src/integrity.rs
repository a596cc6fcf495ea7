//! Consistency scan between a user's VFS records and the blob store.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use tracing::{info, warn};

use sncloud_core::{
    defaults::USER_DATA_BUCKET, Error, IntegrityReport, NotebookFile, NotebookFileRepository,
    Result,
};

use crate::blob_store::BlobStore;

/// Verdict for a single VFS entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EntryCheck {
    Ok,
    Orphan,
    MissingBlob,
    SizeMismatch,
    HashMismatch,
}

/// Cross-checks VFS records against stored blobs.
pub struct IntegrityService {
    files: Arc<dyn NotebookFileRepository>,
    blobs: Arc<dyn BlobStore>,
    bucket: String,
}

impl IntegrityService {
    pub fn new(files: Arc<dyn NotebookFileRepository>, blobs: Arc<dyn BlobStore>) -> Self {
        Self {
            files,
            blobs,
            bucket: USER_DATA_BUCKET.to_string(),
        }
    }

    /// Scan every active entry of `user_id` and tally the findings.
    pub async fn verify_user_storage(&self, user_id: i64) -> Result<IntegrityReport> {
        let start = Instant::now();
        let entries = self.files.list_for_user(user_id).await?;
        let folders: HashSet<i64> = entries
            .iter()
            .filter(|e| e.is_folder)
            .map(|e| e.id)
            .collect();

        let mut report = IntegrityReport::default();
        for entry in &entries {
            report.scanned += 1;
            match self.check_entry(entry, &folders).await? {
                EntryCheck::Ok => report.ok += 1,
                EntryCheck::Orphan => report.orphans += 1,
                EntryCheck::MissingBlob => report.missing_blob += 1,
                EntryCheck::SizeMismatch => report.size_mismatch += 1,
                EntryCheck::HashMismatch => report.hash_mismatch += 1,
            }
        }

        info!(
            subsystem = "storage",
            component = "integrity",
            op = "verify_user_storage",
            user_id,
            scanned = report.scanned,
            ok = report.ok,
            orphans = report.orphans,
            missing_blob = report.missing_blob,
            size_mismatch = report.size_mismatch,
            hash_mismatch = report.hash_mismatch,
            duration_ms = start.elapsed().as_millis() as u64,
            "Integrity scan finished"
        );
        Ok(report)
    }

    async fn check_entry(&self, entry: &NotebookFile, folders: &HashSet<i64>) -> Result<EntryCheck> {
        if entry.directory_id != 0 && !folders.contains(&entry.directory_id) {
            warn!(file_id = entry.id, directory_id = entry.directory_id, "Orphaned VFS entry");
            return Ok(EntryCheck::Orphan);
        }
        if entry.is_folder {
            return Ok(EntryCheck::Ok);
        }

        let Some(key) = entry.storage_key.as_deref() else {
            warn!(file_id = entry.id, "File has no storage key");
            return Ok(EntryCheck::MissingBlob);
        };

        let meta = match self
            .blobs
            .get_metadata(&self.bucket, key, entry.md5.is_some())
            .await
        {
            Ok(meta) => meta,
            Err(Error::BlobNotFound { .. }) => {
                warn!(file_id = entry.id, storage_key = key, "Blob missing");
                return Ok(EntryCheck::MissingBlob);
            }
            Err(Error::InvalidInput(reason)) => {
                warn!(file_id = entry.id, storage_key = key, %reason, "Unusable storage key");
                return Ok(EntryCheck::MissingBlob);
            }
            Err(e) => return Err(e),
        };

        if meta.size != entry.size as u64 {
            warn!(
                file_id = entry.id,
                expected = entry.size,
                actual = meta.size,
                "Blob size mismatch"
            );
            return Ok(EntryCheck::SizeMismatch);
        }

        if let (Some(expected), Some(actual)) = (entry.md5.as_deref(), meta.content_md5.as_deref()) {
            if !expected.eq_ignore_ascii_case(actual) {
                warn!(file_id = entry.id, expected, actual, "Blob hash mismatch");
                return Ok(EntryCheck::HashMismatch);
            }
        }

        Ok(EntryCheck::Ok)
    }
}
