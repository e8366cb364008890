//! Error types for dlsync core

use crate::scheduler::CancelReason;
use dlsync_types::TaskId;
use thiserror::Error;

/// Errors that can occur in dlsync core
#[derive(Debug, Error)]
pub enum DlsyncError {
    /// Network or protocol failure mid-fetch
    #[error("Transfer error: {0}")]
    Transfer(#[from] reqwest::Error),

    #[error("Server error: {status} - {message}")]
    ServerError { status: u16, message: String },

    /// Unusable declared length or a failed atomic rename
    #[error("Integrity error: {0}")]
    Integrity(String),

    #[error("Job scheduler unavailable: {0}")]
    SchedulerUnavailable(String),

    #[error("Applier error: {0}")]
    Applier(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Task not found: {0}")]
    NotFound(TaskId),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    /// Fatal error reported by the delegated engine
    #[error("Engine error: {0}")]
    Engine(String),

    #[error("Transfer was cancelled ({0})")]
    Cancelled(CancelReason),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl DlsyncError {
    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            DlsyncError::Transfer(_) => true,
            DlsyncError::ServerError { status, .. } => *status >= 500,
            _ => false,
        }
    }
}

impl From<serde_json::Error> for DlsyncError {
    fn from(error: serde_json::Error) -> Self {
        DlsyncError::Serialization(error.to_string())
    }
}
