//! Wire types for the storage HTTP API
//!
//! Every structured response is JSON. Successful bodies carry `success: true`,
//! failures are rendered from [`StorageError`] as `{success: false, error}`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Response to a successful upload batch
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreResponse {
    pub success: bool,
    pub message: String,
    pub files_stored: usize,
    pub total_bytes: u64,
    /// Files in the batch that were skipped (bad path, write failure)
    pub files_failed: usize,
}

/// Response for the inline content endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileContentResponse {
    pub success: bool,
    /// Normalized, forward-slash relative path of the file
    pub file_path: String,
    pub size: u64,
    pub is_text: bool,
    pub modified: DateTime<Utc>,
    /// File text, or a placeholder message for binary files
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub download_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub success: bool,
    pub error: String,
}

/// Errors surfaced by the storage core.
///
/// Partial batch failures are not represented here: they are absorbed into
/// [`crate::storage::upload::UploadSummary`] and reported as success.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StorageError {
    #[error("Invalid codebase ID: {id}")]
    InvalidIdentifier { id: String },

    #[error("Invalid file path: {path}")]
    InvalidPath { path: String },

    #[error("Not found: {path}")]
    NotFound { path: String },

    #[error("Path is a directory: {path}")]
    IsDirectory { path: String },

    #[error("Missing required parameter: {name}")]
    MissingParameter { name: String },

    #[error("Invalid request: {message}")]
    InvalidRequest { message: String },

    #[error("File too large or invalid form data: {message}")]
    UploadParse { message: String },

    #[error("No valid files were stored")]
    AllUploadsFailed,

    #[error("I/O error: {message}")]
    Io { message: String },
}

impl StorageError {
    pub fn io(err: impl std::fmt::Display) -> Self {
        StorageError::Io {
            message: err.to_string(),
        }
    }
}
