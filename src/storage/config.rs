use std::path::PathBuf;

/// Default cap on a whole upload request body (100 MiB)
pub const DEFAULT_MAX_UPLOAD_SIZE: usize = 100 * 1024 * 1024;

/// Configuration for the storage service
#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Directory holding one sub-directory per codebase
    pub root: PathBuf,

    /// Maximum request body size for uploads (bytes)
    pub max_upload_size: usize,

    /// Read size for raw downloads and archive flushes (bytes)
    pub stream_chunk_size: usize,
}

impl StorageConfig {
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            ..Default::default()
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("./storage"),
            max_upload_size: DEFAULT_MAX_UPLOAD_SIZE,
            stream_chunk_size: 64 * 1024,
        }
    }
}
