//! Error types for Filerelay

use thiserror::Error;

/// Result type alias for Filerelay operations
pub type Result<T> = std::result::Result<T, RelayError>;

/// Main error type for Filerelay
#[derive(Error, Debug)]
pub enum RelayError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Record not found: {0}")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Filesystem access error at {path}: {message}")]
    FilesystemAccess { path: String, message: String },

    #[error("Watch error: {0}")]
    Watch(#[from] notify::Error),

    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Remote rejected upload ({status}): {message}")]
    RemoteRejection { status: u16, message: String },

    #[error("Content changed between lease and upload: {0}")]
    StaleContent(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Queue error: {0}")]
    Queue(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl RelayError {
    /// Check if error is retryable (transient: the same attempt may later succeed)
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RelayError::Http(_)
                | RelayError::Io(_)
                | RelayError::FilesystemAccess { .. }
                | RelayError::Storage(_)
                | RelayError::Queue(_)
        )
    }
}
