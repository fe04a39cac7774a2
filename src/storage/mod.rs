//! Codebase storage service
//!
//! Everything here operates on the storage root from [`config::StorageConfig`];
//! the filesystem is the only state, so the service itself is freely shared
//! between concurrent requests.

pub mod archive;
pub mod config;
pub mod mime;
pub mod operations;
pub mod path_utils;
pub mod security;
pub mod upload;
pub mod zip_writer;

#[cfg(test)]
mod tests;

use std::sync::Arc;

use archive::ArchiveBuilder;
use config::StorageConfig;
use operations::FileOperations;
use security::PathResolver;
use upload::UploadIngester;

pub struct StorageService {
    config: Arc<StorageConfig>,
    ingester: UploadIngester,
    ops: FileOperations,
    archiver: ArchiveBuilder,
}

impl StorageService {
    pub fn new(config: StorageConfig) -> Self {
        let config = Arc::new(config);
        let resolver = Arc::new(PathResolver::new(config.clone()));
        let ingester = UploadIngester::new(resolver.clone(), config.clone());
        let ops = FileOperations::new(resolver.clone());
        let archiver = ArchiveBuilder::new(resolver.clone(), config.clone());
        Self {
            config,
            ingester,
            ops,
            archiver,
        }
    }

    pub fn config(&self) -> &StorageConfig {
        self.config.as_ref()
    }

    pub fn ingester(&self) -> &UploadIngester {
        &self.ingester
    }

    pub fn ops(&self) -> &FileOperations {
        &self.ops
    }

    pub fn archiver(&self) -> &ArchiveBuilder {
        &self.archiver
    }
}
