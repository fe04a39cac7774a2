use std::sync::Arc;

use axum::body::Bytes;
use chrono::{DateTime, Utc};
use futures_util::stream::{self, Stream};
use tokio::fs;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::protocol::StorageError;

use super::mime::{self, ContentKind};
use super::security::{CodebaseId, PathResolver, ResolvedPath};

/// Placeholder returned instead of the bytes of a binary file
pub const BINARY_PLACEHOLDER: &str = "Binary file - use download endpoint to get the file";

/// A stored file read fully into memory and classified
#[derive(Debug, Clone)]
pub struct FileContent {
    /// Forward-slash path relative to the codebase root
    pub path: String,
    pub size: u64,
    pub modified: DateTime<Utc>,
    pub kind: ContentKind,
    /// Decoded text; `None` for binary files
    pub text: Option<String>,
}

/// An opened stored file, ready to be streamed verbatim
pub struct FileDownload {
    pub path: String,
    pub file_name: String,
    pub size: u64,
    file: fs::File,
}

impl FileDownload {
    /// Stream the file in `chunk_size` pieces.
    ///
    /// At most `size` bytes are yielded, matching the advertised
    /// content length. A read error ends the stream with that error, which
    /// aborts the response; it is logged here because the client only sees
    /// a truncated body.
    pub fn into_stream(self, chunk_size: usize) -> impl Stream<Item = std::io::Result<Bytes>> + Send {
        let FileDownload { path, size, file, .. } = self;
        let reader = file.take(size);
        let chunk_size = chunk_size.max(1);

        stream::unfold(Some((reader, 0u64)), move |state| {
            let path = path.clone();
            async move {
                let (mut reader, sent) = state?;
                match read_chunk(&mut reader, chunk_size).await {
                    Ok(chunk) if chunk.is_empty() => {
                        tracing::info!("Downloaded file: {} ({} bytes)", path, sent);
                        None
                    }
                    Ok(chunk) => {
                        let sent = sent + chunk.len() as u64;
                        Some((Ok(chunk), Some((reader, sent))))
                    }
                    Err(e) => {
                        tracing::error!("Error streaming file {}: {}", path, e);
                        Some((Err(e), None))
                    }
                }
            }
        })
    }
}

async fn read_chunk<R: AsyncRead + Unpin>(reader: &mut R, chunk_size: usize) -> std::io::Result<Bytes> {
    let mut buffer = vec![0u8; chunk_size];
    let n = reader.read(&mut buffer).await?;
    buffer.truncate(n);
    Ok(Bytes::from(buffer))
}

/// Read access to single stored files
#[derive(Clone)]
pub struct FileOperations {
    resolver: Arc<PathResolver>,
}

impl FileOperations {
    pub fn new(resolver: Arc<PathResolver>) -> Self {
        Self { resolver }
    }

    /// Resolve a stored file, requiring it to exist and not be a directory
    async fn locate_file(
        &self,
        id: &CodebaseId,
        path: &str,
    ) -> Result<(ResolvedPath, std::fs::Metadata), StorageError> {
        let resolved = self.resolver.resolve(id, path)?;
        self.resolver.ensure_contained(&resolved)?;

        let metadata = fs::metadata(&resolved.full).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                StorageError::NotFound {
                    path: resolved.display_relative(),
                }
            } else {
                StorageError::io(e)
            }
        })?;

        if metadata.is_dir() {
            return Err(StorageError::IsDirectory {
                path: resolved.display_relative(),
            });
        }

        Ok((resolved, metadata))
    }

    /// Read a stored file and classify it as text or binary
    pub async fn read_content(&self, id: &CodebaseId, path: &str) -> Result<FileContent, StorageError> {
        let (resolved, metadata) = self.locate_file(id, path).await?;

        let buffer = fs::read(&resolved.full).await.map_err(StorageError::io)?;
        let text = match mime::classify(&buffer) {
            ContentKind::Text => String::from_utf8(buffer).ok(),
            ContentKind::Binary => None,
        };
        let kind = if text.is_some() {
            ContentKind::Text
        } else {
            ContentKind::Binary
        };

        Ok(FileContent {
            path: resolved.display_relative(),
            size: metadata.len(),
            modified: metadata
                .modified()
                .map(DateTime::<Utc>::from)
                .unwrap_or_default(),
            kind,
            text,
        })
    }

    /// Open a stored file for a raw download
    pub async fn open_download(&self, id: &CodebaseId, path: &str) -> Result<FileDownload, StorageError> {
        let (resolved, metadata) = self.locate_file(id, path).await?;

        let file = fs::File::open(&resolved.full)
            .await
            .map_err(StorageError::io)?;

        Ok(FileDownload {
            path: resolved.display_relative(),
            file_name: resolved.file_name(),
            size: metadata.len(),
            file,
        })
    }
}

/// Link to the raw download of a stored file
pub fn download_url(id: &CodebaseId, path: &str) -> String {
    format!("/download/{}?file={}", id, urlencoding::encode(path))
}
