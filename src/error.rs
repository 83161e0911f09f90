//! Error types for the report sync core

use thiserror::Error;

/// Crate-wide result type
pub type Result<T> = std::result::Result<T, SyncError>;

/// Sync error type
///
/// Every variant carries owned strings so errors can be cloned into the
/// per-update error map and re-reported without holding on to transport state.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SyncError {
    #[error("Report not found: {0}")]
    NotFound(String),

    #[error("Request failed: {0}")]
    Network(String),

    #[error("Server returned {status}: {message}")]
    Api { status: u16, message: String },

    #[error("Failed to decode response: {0}")]
    Decode(String),

    #[error("Update timed out")]
    Timeout,

    #[error("Update failed after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: Box<SyncError> },

    #[error("Conflict not found: {0}")]
    ConflictNotFound(String),

    #[error("Update not found: {0}")]
    UpdateNotFound(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl SyncError {
    /// Whether the error means the target report was never in the local cache
    pub fn is_not_found(&self) -> bool {
        matches!(self, SyncError::NotFound(_))
    }
}

impl From<reqwest::Error> for SyncError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            SyncError::Decode(e.to_string())
        } else if let Some(status) = e.status() {
            SyncError::Api {
                status: status.as_u16(),
                message: e.to_string(),
            }
        } else {
            SyncError::Network(e.to_string())
        }
    }
}

impl From<tokio::task::JoinError> for SyncError {
    fn from(e: tokio::task::JoinError) -> Self {
        SyncError::Internal(e.to_string())
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(e: serde_json::Error) -> Self {
        SyncError::Decode(e.to_string())
    }
}
