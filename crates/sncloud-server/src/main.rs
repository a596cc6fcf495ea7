//! sncloud-server: runs the notebook processing pipeline and storage tools.

mod config;
mod logging;

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use sncloud_core::{defaults::LOCK_TTL_SECS, EventBus, IntegrityReport};
use sncloud_db::{
    CoordinationStore, Database, IntegrityService, LocalBlobStore, NotebookFileRepository,
    PgCoordinationStore, StorageService, TaskRepository,
};
use sncloud_inference::{EmbeddingBackend, GeminiBackend};
use sncloud_jobs::{GeminiEmbeddingModule, PageHashingModule, ProcessingContext, ProcessorService};

use crate::config::ServerConfig;

#[derive(Parser, Debug)]
#[command(name = "sncloud-server")]
#[command(author, version, about = "Self-hosted notebook cloud: processing pipeline and storage tools")]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug, PartialEq, Eq)]
enum Commands {
    /// Run the processing pipeline until interrupted (default)
    Serve,

    /// Run every pipeline stage for one file and print its task ledger
    Reprocess {
        /// VFS file id
        #[arg(long)]
        file_id: i64,
    },

    /// Check a user's VFS records against stored blobs
    Verify {
        /// Owner of the files to check
        #[arg(long)]
        user_id: i64,
    },
}

#[derive(Debug, Serialize)]
struct VerifyOutput {
    user_id: i64,
    clean: bool,
    report: IntegrityReport,
    storage_usage_bytes: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let config = ServerConfig::from_env();

    let _log_guard = logging::init(&config.log);
    info!(
        log_format = %config.log.format,
        log_file = config
            .log
            .file
            .as_deref()
            .and_then(|p| p.to_str())
            .unwrap_or("(stdout)"),
        "Logging initialized"
    );

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => serve(&config).await.map(|()| ExitCode::SUCCESS),
        Commands::Reprocess { file_id } => reprocess(&config, file_id)
            .await
            .map(|()| ExitCode::SUCCESS),
        Commands::Verify { user_id } => verify(&config, user_id).await,
    }
}

async fn connect(config: &ServerConfig) -> anyhow::Result<Database> {
    info!("Connecting to database...");
    let db = Database::connect_with_config(&config.database_url, config.pool.clone())
        .await
        .context("failed to connect to database")?;
    info!("Running database migrations...");
    db.migrate().await.context("failed to run migrations")?;
    info!("Database ready");
    Ok(db)
}

fn build_processor(
    config: &ServerConfig,
    db: &Database,
    blobs: Arc<LocalBlobStore>,
) -> anyhow::Result<ProcessorService> {
    let ctx = ProcessingContext::new(db.files.clone(), db.pages.clone(), db.tasks.clone(), blobs);

    let backend = Arc::new(GeminiBackend::new(config.gemini.clone())?);
    if !backend.is_configured() {
        warn!("GEMINI_API_KEY not set, embedding tasks will be recorded as FAILED");
    }

    let processor = ProcessorService::new(ctx, config.processor.clone());
    processor.register_module(Arc::new(PageHashingModule::new()));
    processor.register_module(Arc::new(GeminiEmbeddingModule::new(backend)));
    Ok(processor)
}

fn spawn_kv_purge(store: Arc<PgCoordinationStore>, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        // The first tick completes immediately.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            match store.purge_expired().await {
                Ok(0) => {}
                Ok(purged) => debug!(purged, "Purged expired coordination entries"),
                Err(e) => warn!(error = %e, "Failed to purge coordination entries"),
            }
        }
    })
}

async fn serve(config: &ServerConfig) -> anyhow::Result<()> {
    let db = connect(config).await?;
    let blobs = Arc::new(LocalBlobStore::new(config.blob_root()));
    let processor = build_processor(config, &db, blobs)?;

    let bus = EventBus::default();
    processor.start(&bus)?;
    let purge = spawn_kv_purge(db.coordination.clone(), config.kv_purge_interval);

    info!(
        storage_dir = %config.storage_dir.display(),
        modules = ?processor.module_names(),
        "sncloud server ready"
    );

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("Shutdown signal received");

    purge.abort();
    processor.stop().await;
    db.pool.close().await;
    info!("sncloud server stopped");
    Ok(())
}

async fn reprocess(config: &ServerConfig, file_id: i64) -> anyhow::Result<()> {
    let db = connect(config).await?;
    if db.files.get(file_id).await?.is_none() {
        anyhow::bail!("file {} not found", file_id);
    }

    let lock = format!("reprocess:{}", file_id);
    let owner = format!("sncloud-server-{}", std::process::id());
    let ttl = Duration::from_secs(LOCK_TTL_SECS);
    if !db.coordination.acquire_lock(&lock, &owner, ttl).await? {
        anyhow::bail!("file {} is already being reprocessed", file_id);
    }

    let blobs = Arc::new(LocalBlobStore::new(config.blob_root()));
    let processor = build_processor(config, &db, blobs)?;
    let result = processor.process_file(file_id).await;
    if let Err(e) = db.coordination.release_lock(&lock, &owner).await {
        warn!(error = %e, lock, "Failed to release reprocess lock");
    }
    result?;

    let tasks = db.tasks.list_for_file(file_id).await?;
    println!("{}", serde_json::to_string_pretty(&tasks)?);
    Ok(())
}

async fn verify(config: &ServerConfig, user_id: i64) -> anyhow::Result<ExitCode> {
    let db = connect(config).await?;
    let blobs = Arc::new(LocalBlobStore::new(config.blob_root()));

    let report = IntegrityService::new(db.files.clone(), blobs)
        .verify_user_storage(user_id)
        .await?;
    let storage = StorageService::new(config.file_root()).await?;
    let storage_usage_bytes = storage.get_storage_usage().await?;

    let output = VerifyOutput {
        user_id,
        clean: report.is_clean(),
        report,
        storage_usage_bytes,
    };
    println!("{}", serde_json::to_string_pretty(&output)?);

    Ok(if output.clean {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_subcommand_means_serve() {
        let cli = Cli::try_parse_from(["sncloud-server"]).unwrap();
        assert!(cli.command.is_none());
    }

    #[test]
    fn test_parse_reprocess() {
        let cli = Cli::try_parse_from(["sncloud-server", "reprocess", "--file-id", "42"]).unwrap();
        assert_eq!(cli.command, Some(Commands::Reprocess { file_id: 42 }));
    }

    #[test]
    fn test_parse_verify() {
        let cli = Cli::try_parse_from(["sncloud-server", "verify", "--user-id", "7"]).unwrap();
        assert_eq!(cli.command, Some(Commands::Verify { user_id: 7 }));
    }

    #[test]
    fn test_reprocess_requires_file_id() {
        assert!(Cli::try_parse_from(["sncloud-server", "reprocess"]).is_err());
    }

    #[test]
    fn test_verify_output_shape() {
        let output = VerifyOutput {
            user_id: 1,
            clean: true,
            report: IntegrityReport::default(),
            storage_usage_bytes: 0,
        };
        let json = serde_json::to_value(&output).unwrap();
        assert_eq!(json["report"]["missing_blob"], 0);
        assert_eq!(json["clean"], true);
    }
}
