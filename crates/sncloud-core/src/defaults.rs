//! Centralized default constants for sncloud.
//!
//! Shared default values live here so the server binary, the pipeline and the
//! storage layer agree on them.

// =============================================================================
// STORAGE
// =============================================================================

/// Bucket holding user-uploaded notebook and document bytes.
pub const USER_DATA_BUCKET: &str = "supernote-user-data";

/// Chunk size used when streaming blobs from disk.
pub const BLOB_READ_CHUNK_SIZE: usize = 8192;

/// Default blob/storage root.
pub const STORAGE_DIR: &str = "/var/lib/sncloud/storage";

/// File extension of notebooks handled by the page pipeline.
pub const NOTEBOOK_EXTENSION: &str = ".note";

// =============================================================================
// COORDINATION
// =============================================================================

/// TTL applied to coordination values stored without one (one year).
pub const KV_DEFAULT_TTL_SECS: u64 = 31_536_000;

/// Default TTL for sync locks held on a VFS entry.
pub const LOCK_TTL_SECS: u64 = 60;

// =============================================================================
// PROCESSOR
// =============================================================================

/// Number of files processed in parallel.
pub const PROCESSOR_CONCURRENCY: usize = 2;

/// Broadcast buffer of the event bus.
pub const EVENT_BUS_CAPACITY: usize = 256;

// =============================================================================
// INFERENCE
// =============================================================================

/// Default Gemini embedding model.
pub const GEMINI_EMBEDDING_MODEL: &str = "text-embedding-004";

/// Default Gemini API endpoint.
pub const GEMINI_BASE_URL: &str = "https://generativelanguage.googleapis.com";

/// Output dimension of `text-embedding-004`.
pub const GEMINI_EMBED_DIMENSION: usize = 768;

/// Timeout for embedding requests (seconds).
pub const EMBED_TIMEOUT_SECS: u64 = 30;
