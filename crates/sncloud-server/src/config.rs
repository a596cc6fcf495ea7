//! Server configuration read from the environment.

use std::path::PathBuf;
use std::time::Duration;

use sncloud_db::PoolConfig;
use sncloud_inference::GeminiConfig;
use sncloud_jobs::ProcessorConfig;

/// Default database URL when `DATABASE_URL` is unset.
pub const DEFAULT_DATABASE_URL: &str = "postgres://localhost/sncloud";

/// Default interval between sweeps of expired coordination entries.
pub const DEFAULT_KV_PURGE_INTERVAL_SECS: u64 = 600;

/// Log output settings.
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// `json` or `text`.
    pub format: String,
    /// Log file path; stdout when unset.
    pub file: Option<PathBuf>,
    /// ANSI color override (auto-detected when unset).
    pub ansi: Option<bool>,
}

impl LogConfig {
    pub fn from_env() -> Self {
        Self {
            format: std::env::var("LOG_FORMAT").unwrap_or_else(|_| "text".to_string()),
            file: std::env::var("LOG_FILE").ok().map(PathBuf::from),
            ansi: std::env::var("LOG_ANSI")
                .ok()
                .map(|v| v == "true" || v == "1"),
        }
    }

    pub fn is_json(&self) -> bool {
        self.format.eq_ignore_ascii_case("json")
    }
}

/// Everything the binary needs to wire up the pipeline.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub database_url: String,
    /// Root for blobs (`{storage_dir}/blobs`) and path-addressed files
    /// (`{storage_dir}/files`).
    pub storage_dir: PathBuf,
    pub kv_purge_interval: Duration,
    pub pool: PoolConfig,
    pub processor: ProcessorConfig,
    pub gemini: GeminiConfig,
    pub log: LogConfig,
}

impl ServerConfig {
    /// Read configuration from environment variables (with defaults).
    ///
    /// | Variable | Default |
    /// |----------|---------|
    /// | `DATABASE_URL` | `postgres://localhost/sncloud` |
    /// | `STORAGE_DIR` | `/var/lib/sncloud/storage` |
    /// | `KV_PURGE_INTERVAL_SECS` | `600` |
    /// | `DB_*`, `PROCESSOR_*`, `GEMINI_*`, `LOG_*` | see the owning config types |
    pub fn from_env() -> Self {
        let database_url =
            std::env::var("DATABASE_URL").unwrap_or_else(|_| DEFAULT_DATABASE_URL.to_string());
        let storage_dir = std::env::var("STORAGE_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(sncloud_core::defaults::STORAGE_DIR));
        let kv_purge_interval = std::env::var("KV_PURGE_INTERVAL_SECS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .filter(|secs| *secs > 0)
            .unwrap_or(DEFAULT_KV_PURGE_INTERVAL_SECS);

        Self {
            database_url,
            storage_dir,
            kv_purge_interval: Duration::from_secs(kv_purge_interval),
            pool: PoolConfig::from_env(),
            processor: ProcessorConfig::from_env(),
            gemini: GeminiConfig::from_env(),
            log: LogConfig::from_env(),
        }
    }

    pub fn blob_root(&self) -> PathBuf {
        self.storage_dir.join("blobs")
    }

    pub fn file_root(&self) -> PathBuf {
        self.storage_dir.join("files")
    }
}
