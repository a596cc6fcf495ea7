//! # sncloud-db
//!
//! Persistence layer for sncloud.
//!
//! This crate provides:
//! - Connection pool management
//! - PostgreSQL repositories for the VFS, page content and the task ledger
//! - The coordination key/value store and sync locks
//! - Opaque-key blob storage and the path-addressed storage service
//! - The VFS/blob integrity scan
//! - In-memory repositories for tests and single-process use
//!
//! ## Example
//!
//! ```rust,ignore
//! use sncloud_db::{Database, NotebookFileRepository};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let db = Database::connect("postgres://localhost/sncloud").await?;
//!     db.migrate().await?;
//!
//!     let ids = db.files.list_active_notebook_ids().await?;
//!     println!("{} notebooks", ids.len());
//!     Ok(())
//! }
//! ```

pub mod blob_store;
pub mod coordination;
pub mod files;
pub mod integrity;
pub mod memory;
pub mod page_content;
pub mod pool;
pub mod storage;
pub mod tasks;

// Test fixtures for integration tests
// Always compiled so integration tests (in tests/) can use DEFAULT_TEST_DATABASE_URL
pub mod test_fixtures;

// Re-export core types
pub use sncloud_core::*;

pub use blob_store::{bytes_stream, collect_bytes, BlobStore, ByteStream, LocalBlobStore};
pub use coordination::PgCoordinationStore;
pub use files::PgNotebookFileRepository;
pub use integrity::IntegrityService;
pub use memory::{
    InMemoryCoordinationStore, InMemoryLedger, InMemoryNotebookFileRepository,
    InMemoryPageContentRepository, InMemoryTaskRepository,
};
pub use page_content::PgPageContentRepository;
pub use pool::{create_pool, create_pool_with_config, PoolConfig};
pub use storage::{path_id, DirEntryInfo, StorageService};
pub use tasks::PgTaskRepository;

use std::sync::Arc;

/// Combined database context with all repositories.
#[derive(Clone)]
pub struct Database {
    /// The underlying connection pool.
    pub pool: sqlx::Pool<sqlx::Postgres>,
    /// VFS records.
    pub files: Arc<PgNotebookFileRepository>,
    /// Derived per-page data.
    pub pages: Arc<PgPageContentRepository>,
    /// Task status ledger.
    pub tasks: Arc<PgTaskRepository>,
    /// Key/value store and sync locks.
    pub coordination: Arc<PgCoordinationStore>,
}

impl Database {
    /// Create a new Database instance from a connection pool.
    pub fn new(pool: sqlx::Pool<sqlx::Postgres>) -> Self {
        Self {
            files: Arc::new(PgNotebookFileRepository::new(pool.clone())),
            pages: Arc::new(PgPageContentRepository::new(pool.clone())),
            tasks: Arc::new(PgTaskRepository::new(pool.clone())),
            coordination: Arc::new(PgCoordinationStore::new(pool.clone())),
            pool,
        }
    }

    /// Create a new Database instance by connecting to the given URL.
    pub async fn connect(url: &str) -> Result<Self> {
        let pool = create_pool(url).await?;
        Ok(Self::new(pool))
    }

    /// Create with custom pool configuration.
    pub async fn connect_with_config(url: &str, config: PoolConfig) -> Result<Self> {
        let pool = create_pool_with_config(url, config).await?;
        Ok(Self::new(pool))
    }

    /// Run pending migrations.
    #[cfg(feature = "migrations")]
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .map_err(|e| Error::Database(sqlx::Error::Migrate(Box::new(e))))?;
        Ok(())
    }

    /// Get the underlying connection pool.
    pub fn pool(&self) -> &sqlx::Pool<sqlx::Postgres> {
        &self.pool
    }
}
