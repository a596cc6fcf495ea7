//! Structured logging schema and field name constants for sncloud.
//!
//! All crates use these names for structured `tracing` fields so that log
//! aggregation can query the pipeline, storage and database layers uniformly.
//!
//! ## Log Level Contract
//!
//! | Level | Usage |
//! |-------|-------|
//! | ERROR | Degraded service, requires operator attention |
//! | WARN  | Recoverable issue, automatic fallback applied |
//! | INFO  | Lifecycle events (startup, shutdown), operation completions |
//! | DEBUG | Decision points, intermediate values, config choices |
//! | TRACE | Per-item iteration, high-volume data (chunks, pages) |

// ─── Identity fields ───────────────────────────────────────────────────────

/// Subsystem originating the log event.
/// Values: "db", "storage", "inference", "processor", "server"
pub const SUBSYSTEM: &str = "subsystem";

/// Component within a subsystem.
/// Examples: "pool", "blob_store", "worker", "page_hashing"
pub const COMPONENT: &str = "component";

/// Logical operation name.
/// Examples: "put", "get_range", "process_file", "recover"
pub const OPERATION: &str = "op";

// ─── Entity fields ─────────────────────────────────────────────────────────

/// VFS file id being operated on.
pub const FILE_ID: &str = "file_id";

/// Zero-based page index within a notebook.
pub const PAGE_INDEX: &str = "page_index";

/// Processor module name.
pub const MODULE: &str = "module";

/// Task type recorded in the task ledger.
pub const TASK_TYPE: &str = "task_type";

/// Worker index inside the processor pool.
pub const WORKER_ID: &str = "worker_id";

/// Blob bucket.
pub const BUCKET: &str = "bucket";

/// Blob storage key.
pub const STORAGE_KEY: &str = "storage_key";

// ─── Measurement fields ────────────────────────────────────────────────────

/// Wall-clock duration in milliseconds.
pub const DURATION_MS: &str = "duration_ms";

/// Number of pages in a notebook.
pub const PAGE_COUNT: &str = "page_count";

/// Number of bytes read or written.
pub const BYTES: &str = "bytes";

// ─── Database fields ───────────────────────────────────────────────────────

/// Number of active connections in the pool.
pub const POOL_SIZE: &str = "pool_size";

/// Number of idle connections in the pool.
pub const POOL_IDLE: &str = "pool_idle";

// ─── Inference fields ──────────────────────────────────────────────────────

/// Model name used for inference.
pub const MODEL: &str = "model";

// ─── Outcome fields ────────────────────────────────────────────────────────

/// Boolean success/failure indicator.
pub const SUCCESS: &str = "success";

/// Error message when an operation fails.
pub const ERROR_MSG: &str = "error";
