//! Path-addressed storage used by the device sync surface.
//!
//! Unlike the [`BlobStore`](crate::blob_store::BlobStore), files here live at
//! their user-visible relative path under a storage root. Uploads land in a
//! temp directory first and are moved into place once complete.
//!
//! External file ids are derived from the relative path
//! ([`StorageService::get_id_from_path`]), so no path-to-id table is kept. The
//! reverse lookup scans the tree breadth-first.

use std::collections::VecDeque;
use std::path::{Component, Path, PathBuf};

use futures::StreamExt;
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, warn};

use sncloud_core::{defaults::BLOB_READ_CHUNK_SIZE, Error, Result};

use crate::blob_store::ByteStream;

/// Name of the temp directory when it lives under the storage root.
pub const TEMP_DIR_NAME: &str = "temp";

/// One entry of a directory listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntryInfo {
    pub name: String,
    pub is_dir: bool,
    pub size: u64,
}

/// Stable non-negative id of a relative storage path.
///
/// The first 8 bytes of `MD5(path)` read big-endian, with the sign bit cleared.
/// Leading and trailing slashes are ignored.
pub fn path_id(rel_path: &str) -> i64 {
    let normalized = rel_path.trim_matches('/');
    let digest = md5::compute(normalized.as_bytes());
    let mut head = [0u8; 8];
    head.copy_from_slice(&digest.0[..8]);
    (u64::from_be_bytes(head) & i64::MAX as u64) as i64
}

/// Collapse `.` and `..` components without touching the filesystem.
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

fn validate_file_name(name: &str) -> Result<()> {
    if name.is_empty() || name == "." || name == ".." || name.contains(['/', '\\', '\0']) {
        return Err(Error::InvalidInput(format!("invalid file name: {name:?}")));
    }
    Ok(())
}

/// Filesystem storage rooted at one directory.
#[derive(Debug, Clone)]
pub struct StorageService {
    storage_root: PathBuf,
    temp_root: PathBuf,
}

impl StorageService {
    /// Open storage at `storage_root` with uploads staged in `{storage_root}/temp`.
    pub async fn new(storage_root: impl Into<PathBuf>) -> Result<Self> {
        let storage_root = storage_root.into();
        let temp_root = storage_root.join(TEMP_DIR_NAME);
        Self::with_temp_root(storage_root, temp_root).await
    }

    /// Open storage with an explicit temp directory. Both are created if missing.
    pub async fn with_temp_root(
        storage_root: impl Into<PathBuf>,
        temp_root: impl Into<PathBuf>,
    ) -> Result<Self> {
        let service = Self {
            storage_root: storage_root.into(),
            temp_root: temp_root.into(),
        };
        fs::create_dir_all(&service.storage_root).await?;
        fs::create_dir_all(&service.temp_root).await?;
        Ok(service)
    }

    pub fn storage_root(&self) -> &Path {
        &self.storage_root
    }

    /// Absolute path of a storage-relative path. Leading slashes are ignored.
    pub fn resolve_path(&self, rel_path: &str) -> PathBuf {
        self.storage_root.join(rel_path.trim_start_matches('/'))
    }

    pub fn resolve_temp_path(&self, file_name: &str) -> PathBuf {
        self.temp_root.join(file_name)
    }

    /// Whether `path` stays inside the storage root once `..` is collapsed.
    pub fn is_safe_path(&self, path: &Path) -> bool {
        normalize(path).starts_with(normalize(&self.storage_root))
    }

    fn resolve_checked(&self, rel_path: &str) -> Result<PathBuf> {
        let path = self.resolve_path(rel_path);
        if !self.is_safe_path(&path) {
            warn!(
                subsystem = "storage",
                component = "storage_service",
                path = rel_path,
                "Rejected path outside storage root"
            );
            return Err(Error::InvalidInput(format!(
                "path escapes storage root: {rel_path}"
            )));
        }
        Ok(path)
    }

    /// List a directory, skipping dot-files and the temp directory at the root.
    /// A missing directory lists as empty.
    pub async fn list_directory(&self, rel_path: &str) -> Result<Vec<DirEntryInfo>> {
        let target = self.resolve_checked(rel_path)?;
        let is_root = normalize(&target) == normalize(&self.storage_root);

        let mut reader = match fs::read_dir(&target).await {
            Ok(reader) => reader,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut entries = Vec::new();
        while let Some(entry) = reader.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with('.') || (is_root && name == TEMP_DIR_NAME) {
                continue;
            }
            let meta = entry.metadata().await?;
            entries.push(DirEntryInfo {
                name,
                is_dir: meta.is_dir(),
                size: if meta.is_dir() { 0 } else { meta.len() },
            });
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    /// Stream an upload into the temp directory. Returns bytes written.
    pub async fn save_temp_file(&self, file_name: &str, mut data: ByteStream) -> Result<u64> {
        validate_file_name(file_name)?;
        let temp_path = self.resolve_temp_path(file_name);
        let mut file = fs::File::create(&temp_path).await?;
        let mut total: u64 = 0;

        while let Some(chunk) = data.next().await {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(e) => {
                    drop(file);
                    let _ = fs::remove_file(&temp_path).await;
                    return Err(e);
                }
            };
            file.write_all(&chunk).await?;
            total += chunk.len() as u64;
        }
        file.flush().await?;

        debug!(
            subsystem = "storage",
            component = "storage_service",
            op = "save_temp_file",
            file = file_name,
            bytes = total,
            "Temp upload saved"
        );
        Ok(total)
    }

    /// Move a completed temp upload into `rel_dest_dir`, creating it as needed.
    pub async fn move_temp_to_storage(&self, file_name: &str, rel_dest_dir: &str) -> Result<PathBuf> {
        validate_file_name(file_name)?;
        let temp_path = self.resolve_temp_path(file_name);
        if !fs::try_exists(&temp_path).await? {
            return Err(Error::NotFound(format!("temp file {file_name}")));
        }

        let dest_dir = self.resolve_checked(rel_dest_dir)?;
        fs::create_dir_all(&dest_dir).await?;
        let dest_path = dest_dir.join(file_name);

        if fs::rename(&temp_path, &dest_path).await.is_err() {
            // Cross-device temp root: copy then remove.
            fs::copy(&temp_path, &dest_path).await?;
            fs::remove_file(&temp_path).await?;
        }
        Ok(dest_path)
    }

    /// Hex MD5 of a file, read in chunks.
    pub async fn get_file_md5(&self, path: &Path) -> Result<String> {
        let mut file = fs::File::open(path).await?;
        let mut hasher = md5::Context::new();
        let mut buf = vec![0u8; BLOB_READ_CHUNK_SIZE];
        loop {
            let n = file.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            hasher.consume(&buf[..n]);
        }
        Ok(format!("{:x}", hasher.compute()))
    }

    /// Total size of every file below `path`.
    pub async fn get_dir_size(&self, path: &Path) -> Result<u64> {
        let mut total = 0;
        let mut pending = vec![path.to_path_buf()];
        while let Some(dir) = pending.pop() {
            let mut reader = fs::read_dir(&dir).await?;
            while let Some(entry) = reader.next_entry().await? {
                let meta = entry.metadata().await?;
                if meta.is_dir() {
                    pending.push(entry.path());
                } else if meta.is_file() {
                    total += meta.len();
                }
            }
        }
        Ok(total)
    }

    pub async fn get_storage_usage(&self) -> Result<u64> {
        self.get_dir_size(&self.storage_root).await
    }

    /// See [`path_id`].
    pub fn get_id_from_path(&self, rel_path: &str) -> i64 {
        path_id(rel_path)
    }

    /// Find the existing relative path whose derived id is `id`.
    pub async fn get_path_from_id(&self, id: i64) -> Result<Option<String>> {
        let mut queue: VecDeque<String> = VecDeque::from([String::new()]);
        while let Some(dir) = queue.pop_front() {
            for entry in self.list_directory(&dir).await? {
                let rel = if dir.is_empty() {
                    entry.name.clone()
                } else {
                    format!("{dir}/{}", entry.name)
                };
                if path_id(&rel) == id {
                    return Ok(Some(rel));
                }
                if entry.is_dir {
                    queue.push_back(rel);
                }
            }
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob_store::bytes_stream;
    use tempfile::TempDir;

    async fn service() -> (TempDir, StorageService) {
        let dir = TempDir::new().unwrap();
        let service = StorageService::new(dir.path()).await.unwrap();
        (dir, service)
    }

    #[test]
    fn test_path_id_is_stable_and_distinct() {
        let a = path_id("Note/Meeting.note");
        assert_eq!(a, path_id("Note/Meeting.note"));
        assert_eq!(a, path_id("/Note/Meeting.note"));
        assert_ne!(a, path_id("Note/Other.note"));
        assert!(a >= 0);
    }

    #[test]
    fn test_path_id_matches_md5_prefix() {
        // md5("abc") = 900150983cd24fb0...
        assert_eq!(path_id("abc"), 0x1001_5098_3cd2_4fb0);
    }

    #[tokio::test]
    async fn test_get_path_from_id_round_trip() {
        let (_dir, service) = service().await;
        service
            .save_temp_file("a.note", bytes_stream(&b"data"[..]))
            .await
            .unwrap();
        service.move_temp_to_storage("a.note", "Note/Work").await.unwrap();

        let id = service.get_id_from_path("Note/Work/a.note");
        assert_eq!(
            service.get_path_from_id(id).await.unwrap().as_deref(),
            Some("Note/Work/a.note")
        );
        let dir_id = service.get_id_from_path("Note/Work");
        assert_eq!(
            service.get_path_from_id(dir_id).await.unwrap().as_deref(),
            Some("Note/Work")
        );
    }

    #[tokio::test]
    async fn test_get_path_from_id_requires_existing_file() {
        let (_dir, service) = service().await;
        let id = service.get_id_from_path("Note/missing.note");
        assert_eq!(service.get_path_from_id(id).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_list_directory_skips_hidden_and_temp() {
        let (dir, service) = service().await;
        std::fs::write(dir.path().join(".hidden"), b"x").unwrap();
        std::fs::write(dir.path().join("visible.txt"), b"abc").unwrap();
        std::fs::create_dir(dir.path().join("Note")).unwrap();

        let entries = service.list_directory("/").await.unwrap();
        let names: Vec<&str> = entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["Note", "visible.txt"]);
        assert!(entries[0].is_dir);
        assert_eq!(entries[1].size, 3);
    }

    #[tokio::test]
    async fn test_list_missing_directory_is_empty() {
        let (_dir, service) = service().await;
        assert!(service.list_directory("nope").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_traversal_rejected() {
        let (_dir, service) = service().await;
        assert!(!service.is_safe_path(&service.resolve_path("../outside")));
        assert!(service.is_safe_path(&service.resolve_path("Note/../Note/a")));
        assert!(service.list_directory("../../etc").await.is_err());
        assert!(service
            .save_temp_file("../evil", bytes_stream(&b"x"[..]))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_move_missing_temp_file() {
        let (_dir, service) = service().await;
        let err = service.move_temp_to_storage("ghost.note", "Note").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_md5_and_usage() {
        let (_dir, service) = service().await;
        let written = service
            .save_temp_file("b.note", bytes_stream(&b"hello world"[..]))
            .await
            .unwrap();
        assert_eq!(written, 11);
        let path = service.move_temp_to_storage("b.note", "Note").await.unwrap();

        assert_eq!(
            service.get_file_md5(&path).await.unwrap(),
            "5eb63bbbe01eeed093cb22bb8f5acdc3"
        );
        assert_eq!(service.get_storage_usage().await.unwrap(), 11);
    }
}
