//! Opaque-key blob storage with a local filesystem backend.
//!
//! Blobs are addressed by `(bucket, key)` where the key is an identifier
//! assigned at upload time, never derived from content. Two uploads of the
//! same bytes under different keys are two independent files.
//!
//! Layout: `{root}/{bucket}/{key[0..2]}/{key}`.
//!
//! ## Example
//!
//! ```rust,ignore
//! use sncloud_db::blob_store::{BlobStore, LocalBlobStore};
//!
//! let store = LocalBlobStore::new("/var/lib/sncloud/storage");
//! let meta = store.put_bytes("supernote-user-data", "a1b2c3", data.into()).await?;
//! let head = store.get("supernote-user-data", "a1b2c3", Some(0), Some(15)).await?;
//! ```

use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, Stream, StreamExt};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, warn};

use sncloud_core::{defaults::BLOB_READ_CHUNK_SIZE, BlobMetadata, Error, Result};

/// Boxed asynchronous byte stream accepted and returned by blob stores.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes>> + Send>>;

/// Wrap an in-memory buffer as a single-chunk [`ByteStream`].
pub fn bytes_stream(data: impl Into<Bytes>) -> ByteStream {
    let data = data.into();
    Box::pin(stream::once(futures::future::ready(Ok(data))))
}

/// Drain a [`ByteStream`] into one buffer.
pub async fn collect_bytes(mut stream: ByteStream) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    while let Some(chunk) = stream.next().await {
        out.extend_from_slice(&chunk?);
    }
    Ok(out)
}

/// Storage for opaque, key-addressed blobs.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Stream `data` into `(bucket, key)`, replacing any previous content.
    async fn put(&self, bucket: &str, key: &str, data: ByteStream) -> Result<BlobMetadata>;

    async fn put_bytes(&self, bucket: &str, key: &str, data: Bytes) -> Result<BlobMetadata> {
        self.put(bucket, key, bytes_stream(data)).await
    }

    /// Stream the blob, optionally restricted to the inclusive byte range
    /// `start..=end`. Fails with [`Error::BlobNotFound`] when absent.
    async fn get(
        &self,
        bucket: &str,
        key: &str,
        start: Option<u64>,
        end: Option<u64>,
    ) -> Result<ByteStream>;

    /// Read a whole blob into memory.
    async fn get_bytes(&self, bucket: &str, key: &str) -> Result<Vec<u8>> {
        collect_bytes(self.get(bucket, key, None, None).await?).await
    }

    async fn exists(&self, bucket: &str, key: &str) -> Result<bool>;

    /// Remove a blob. Deleting an absent blob is not an error.
    async fn delete(&self, bucket: &str, key: &str) -> Result<()>;

    /// Size and, when `include_md5` is set, the hex MD5 of the content.
    async fn get_metadata(&self, bucket: &str, key: &str, include_md5: bool)
        -> Result<BlobMetadata>;

    /// Filesystem location of the blob.
    fn blob_path(&self, bucket: &str, key: &str) -> Result<PathBuf>;
}

static TEMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Reject empty names, separators, parent references and hidden names.
fn validate_component(kind: &str, value: &str) -> Result<()> {
    let invalid = value.is_empty()
        || value.starts_with('.')
        || value.contains(['/', '\\', '\0'])
        || value.contains("..");
    if invalid {
        return Err(Error::InvalidInput(format!("invalid blob {kind}: {value:?}")));
    }
    Ok(())
}

/// Filesystem blob store.
///
/// Writes stream into a temp file next to the destination while hashing, then
/// rename into place, so readers never observe a partial blob.
#[derive(Debug, Clone)]
pub struct LocalBlobStore {
    root: PathBuf,
    chunk_size: usize,
}

impl LocalBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            chunk_size: BLOB_READ_CHUNK_SIZE,
        }
    }

    /// Override the read chunk size.
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn not_found(bucket: &str, key: &str) -> Error {
        Error::BlobNotFound {
            bucket: bucket.to_string(),
            key: key.to_string(),
        }
    }

    async fn open(&self, bucket: &str, key: &str) -> Result<fs::File> {
        let path = self.blob_path(bucket, key)?;
        fs::File::open(&path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                Self::not_found(bucket, key)
            } else {
                Error::Io(e)
            }
        })
    }

    async fn write_temp(&self, temp_path: &Path, mut data: ByteStream) -> Result<(u64, String)> {
        let mut file = fs::File::create(temp_path).await?;
        let mut hasher = md5::Context::new();
        let mut total: u64 = 0;

        while let Some(chunk) = data.next().await {
            let chunk = chunk?;
            hasher.consume(&chunk);
            file.write_all(&chunk).await?;
            total += chunk.len() as u64;
        }
        file.sync_all().await?;

        Ok((total, format!("{:x}", hasher.compute())))
    }

    async fn compute_md5(&self, bucket: &str, key: &str) -> Result<String> {
        let mut file = self.open(bucket, key).await?;
        let mut hasher = md5::Context::new();
        let mut buf = vec![0u8; self.chunk_size];
        loop {
            let n = file.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            hasher.consume(&buf[..n]);
        }
        Ok(format!("{:x}", hasher.compute()))
    }
}

#[async_trait]
impl BlobStore for LocalBlobStore {
    async fn put(&self, bucket: &str, key: &str, data: ByteStream) -> Result<BlobMetadata> {
        let final_path = self.blob_path(bucket, key)?;
        let parent = final_path
            .parent()
            .ok_or_else(|| Error::Internal(format!("blob path has no parent: {final_path:?}")))?;
        fs::create_dir_all(parent).await?;

        let temp_path = parent.join(format!(
            ".{key}.{}-{}.tmp",
            std::process::id(),
            TEMP_COUNTER.fetch_add(1, Ordering::Relaxed)
        ));

        let (size, md5) = match self.write_temp(&temp_path, data).await {
            Ok(written) => written,
            Err(e) => {
                let _ = fs::remove_file(&temp_path).await;
                warn!(
                    subsystem = "storage",
                    component = "blob_store",
                    op = "put",
                    bucket,
                    storage_key = key,
                    error = %e,
                    "Blob write failed"
                );
                return Err(e);
            }
        };

        if let Err(e) = fs::rename(&temp_path, &final_path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(e.into());
        }

        debug!(
            subsystem = "storage",
            component = "blob_store",
            op = "put",
            bucket,
            storage_key = key,
            bytes = size,
            "Blob stored"
        );

        Ok(BlobMetadata {
            size,
            content_md5: Some(md5),
        })
    }

    async fn get(
        &self,
        bucket: &str,
        key: &str,
        start: Option<u64>,
        end: Option<u64>,
    ) -> Result<ByteStream> {
        let mut file = self.open(bucket, key).await?;
        let len = file.metadata().await?.len();

        let start = start.unwrap_or(0);
        let last = len.saturating_sub(1);
        let end = end.map_or(last, |e| e.min(last));
        if len == 0 || start > end {
            return Ok(Box::pin(stream::empty::<Result<Bytes>>()));
        }

        if start > 0 {
            file.seek(std::io::SeekFrom::Start(start)).await?;
        }

        let chunk_size = self.chunk_size as u64;
        let remaining = end - start + 1;
        let stream = stream::try_unfold((file, remaining), move |(mut file, remaining)| async move {
            if remaining == 0 {
                return Ok::<_, Error>(None);
            }
            let mut buf = vec![0u8; chunk_size.min(remaining) as usize];
            let n = file.read(&mut buf).await?;
            if n == 0 {
                return Ok(None);
            }
            buf.truncate(n);
            Ok(Some((Bytes::from(buf), (file, remaining - n as u64))))
        });

        Ok(Box::pin(stream))
    }

    async fn exists(&self, bucket: &str, key: &str) -> Result<bool> {
        let path = self.blob_path(bucket, key)?;
        Ok(fs::try_exists(path).await?)
    }

    async fn delete(&self, bucket: &str, key: &str) -> Result<()> {
        let path = self.blob_path(bucket, key)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn get_metadata(
        &self,
        bucket: &str,
        key: &str,
        include_md5: bool,
    ) -> Result<BlobMetadata> {
        let path = self.blob_path(bucket, key)?;
        let meta = match fs::metadata(&path).await {
            Ok(meta) => meta,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Self::not_found(bucket, key))
            }
            Err(e) => return Err(e.into()),
        };

        let content_md5 = if include_md5 {
            Some(self.compute_md5(bucket, key).await?)
        } else {
            None
        };

        Ok(BlobMetadata {
            size: meta.len(),
            content_md5,
        })
    }

    fn blob_path(&self, bucket: &str, key: &str) -> Result<PathBuf> {
        validate_component("bucket", bucket)?;
        validate_component("key", key)?;
        let prefix: String = key.chars().take(2).collect();
        Ok(self.root.join(bucket).join(prefix).join(key))
    }
}
