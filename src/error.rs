//! Error types for MedSync.
//!
//! This module defines all error types used throughout the library.

use thiserror::Error;

use crate::remote::RemoteError;

/// Result type alias for MedSync operations
pub type MedSyncResult<T> = Result<T, MedSyncError>;

/// Main error type for MedSync operations
#[derive(Error, Debug)]
pub enum MedSyncError {
    #[error("Validation error in {field}: {message}")]
    Validation { field: String, message: String },

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Database operation failed: {0}")]
    DatabaseOperation(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Remote error: {0}")]
    Remote(#[from] RemoteError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("UUID error: {0}")]
    Uuid(#[from] uuid::Error),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Sync engine is not running")]
    EngineStopped,

    #[error("{0}")]
    Other(String),
}

impl MedSyncError {
    /// Create a new validation error
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        MedSyncError::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Create a new database operation error
    pub fn database_op(message: impl Into<String>) -> Self {
        MedSyncError::DatabaseOperation(message.into())
    }

    /// Create a new network error
    pub fn network(message: impl Into<String>) -> Self {
        MedSyncError::Network(message.into())
    }
}
