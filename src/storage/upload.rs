use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use axum::body::Bytes;
use tokio::fs;
use tokio::io::AsyncWriteExt;

use crate::protocol::StorageError;

use super::config::StorageConfig;
use super::path_utils;
use super::security::{CodebaseId, PathResolver, ResolvedPath};

/// Prefix of the form field naming a file's destination: `path_<filename>`
pub const PATH_FIELD_PREFIX: &str = "path_";

/// One uploaded file as received from the client
#[derive(Debug, Clone)]
pub struct UploadPart {
    /// Filename the client attached to the part
    pub file_name: String,
    pub data: Bytes,
}

/// A parsed upload request
#[derive(Debug, Clone, Default)]
pub struct UploadBatch {
    pub parts: Vec<UploadPart>,
    /// Explicit destinations keyed by the part's filename
    pub paths: HashMap<String, String>,
}

impl UploadBatch {
    /// Record a form field; returns true if it was a `path_<filename>` field
    pub fn record_field(&mut self, name: &str, value: String) -> bool {
        match name.strip_prefix(PATH_FIELD_PREFIX) {
            Some(file_name) if !file_name.is_empty() => {
                self.paths.insert(file_name.to_string(), value);
                true
            }
            _ => false,
        }
    }

    /// Destination for `part`: its explicit path field if non-empty, else its base name
    fn destination_for(&self, part: &UploadPart) -> Result<String, StorageError> {
        let base = base_name(&part.file_name);
        if base.is_empty() || base == "." || base == ".." {
            return Err(StorageError::InvalidPath {
                path: part.file_name.clone(),
            });
        }

        Ok(self
            .paths
            .get(&part.file_name)
            .filter(|p| !p.trim().is_empty())
            .cloned()
            .unwrap_or_else(|| base.to_string()))
    }
}

#[derive(Debug, Clone)]
pub struct StoredFile {
    /// Forward-slash path relative to the codebase root
    pub path: String,
    pub size: u64,
}

#[derive(Debug, Clone)]
pub struct UploadFailure {
    pub file_name: String,
    pub error: StorageError,
}

/// Outcome of a batch where at least one file was stored
#[derive(Debug, Clone, Default)]
pub struct UploadSummary {
    pub stored: Vec<StoredFile>,
    pub failures: Vec<UploadFailure>,
}

impl UploadSummary {
    pub fn files_stored(&self) -> usize {
        self.stored.len()
    }

    pub fn total_bytes(&self) -> u64 {
        self.stored.iter().map(|f| f.size).sum()
    }

    pub fn message(&self) -> String {
        format!(
            "Successfully stored {} files ({} bytes total)",
            self.files_stored(),
            self.total_bytes()
        )
    }
}

/// Writes upload batches into codebase directories
#[derive(Clone)]
pub struct UploadIngester {
    resolver: Arc<PathResolver>,
    config: Arc<StorageConfig>,
}

impl UploadIngester {
    pub fn new(resolver: Arc<PathResolver>, config: Arc<StorageConfig>) -> Self {
        Self { resolver, config }
    }

    /// Store every file in `batch` under the codebase.
    ///
    /// A file that cannot be stored is skipped and recorded in the summary;
    /// it never stops its siblings. If nothing was stored the call fails with
    /// `AllUploadsFailed` and a codebase directory created by this call is
    /// removed again.
    pub async fn ingest(
        &self,
        id: &CodebaseId,
        batch: &UploadBatch,
    ) -> Result<UploadSummary, StorageError> {
        if batch.parts.is_empty() {
            return Err(StorageError::MissingParameter {
                name: "files".to_string(),
            });
        }

        let codebase_dir = self.resolver.codebase_dir(id);
        let existed = fs::try_exists(&codebase_dir).await.unwrap_or(false);
        fs::create_dir_all(&codebase_dir)
            .await
            .map_err(StorageError::io)?;

        let mut summary = UploadSummary::default();
        for part in &batch.parts {
            match self.store_part(id, batch, part).await {
                Ok(stored) => {
                    tracing::debug!("Stored file: {} ({} bytes)", stored.path, stored.size);
                    summary.stored.push(stored);
                }
                Err(error) => {
                    let failure = UploadFailure {
                        file_name: part.file_name.clone(),
                        error,
                    };
                    tracing::warn!("Skipping upload {}: {}", failure.file_name, failure.error);
                    summary.failures.push(failure);
                }
            }
        }

        if summary.stored.is_empty() {
            if !existed {
                if let Err(e) = fs::remove_dir_all(&codebase_dir).await {
                    tracing::warn!(
                        "Failed to roll back codebase directory {}: {}",
                        codebase_dir.display(),
                        e
                    );
                }
            }
            return Err(StorageError::AllUploadsFailed);
        }

        tracing::info!(
            "Files stored for codebase {}: {} files, {} bytes, {} skipped",
            id,
            summary.files_stored(),
            summary.total_bytes(),
            summary.failures.len()
        );

        Ok(summary)
    }

    async fn store_part(
        &self,
        id: &CodebaseId,
        batch: &UploadBatch,
        part: &UploadPart,
    ) -> Result<StoredFile, StorageError> {
        let destination = batch.destination_for(part)?;
        let resolved = self.resolver.resolve(id, &destination)?;

        self.resolver.ensure_contained(&resolved)?;
        let created = path_utils::create_parent_dirs_safe(&resolved.full).await?;

        let result = self.write_part(&resolved, part).await;
        if result.is_err() {
            if let Some(top) = created {
                path_utils::remove_created_dirs(&resolved.full, &top).await;
            }
        }
        result
    }

    async fn write_part(
        &self,
        resolved: &ResolvedPath,
        part: &UploadPart,
    ) -> Result<StoredFile, StorageError> {
        if resolved.full.is_dir() {
            return Err(StorageError::IsDirectory {
                path: resolved.display_relative(),
            });
        }

        match write_stored_file(&resolved.full, &part.data, self.config.stream_chunk_size).await {
            Ok(size) => Ok(StoredFile {
                path: resolved.display_relative(),
                size,
            }),
            Err(e) => {
                // Never leave a truncated file behind.
                let _ = fs::remove_file(&resolved.full).await;
                Err(StorageError::io(e))
            }
        }
    }
}

async fn write_stored_file(path: &Path, data: &[u8], chunk_size: usize) -> std::io::Result<u64> {
    let mut file = fs::File::create(path).await?;
    for chunk in data.chunks(chunk_size.max(1)) {
        file.write_all(chunk).await?;
    }
    file.flush().await?;
    Ok(data.len() as u64)
}

/// Last segment of a client filename, treating both separators alike
fn base_name(file_name: &str) -> &str {
    file_name
        .rsplit(|c: char| c == '/' || c == '\\')
        .next()
        .unwrap_or("")
}
