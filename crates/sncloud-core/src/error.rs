//! Error types for sncloud.

use thiserror::Error;

/// Result type alias using sncloud's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for sncloud operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Database operation failed (wraps sqlx::Error)
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Resource not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// VFS file record not found
    #[error("File not found: {0}")]
    FileNotFound(i64),

    /// Blob missing from the blob store
    #[error("Blob not found: {bucket}/{key}")]
    BlobNotFound { bucket: String, key: String },

    /// Notebook could not be parsed
    #[error("Parse error: {0}")]
    Parse(String),

    /// Embedding generation failed
    #[error("Embedding error: {0}")]
    Embedding(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// HTTP/network request failed
    #[error("Request error: {0}")]
    Request(String),

    /// Lock could not be acquired or released
    #[error("Lock error: {0}")]
    Lock(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),

    /// File I/O operation failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether this error means the requested entity does not exist.
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::NotFound(_) | Error::FileNotFound(_) | Error::BlobNotFound { .. } => true,
            Error::Io(e) => e.kind() == std::io::ErrorKind::NotFound,
            _ => false,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Error::Request(e.to_string())
    }
}
