//! Zip archives of stored codebases
//!
//! The archive is written on a blocking thread into a bounded channel and
//! handed to the caller as a byte stream, so neither the tree nor the archive
//! is ever held in memory. Once the first chunk has been consumed the HTTP
//! status is committed: a later walk or copy failure is logged and then
//! yielded as a stream error, which aborts the transfer and leaves the client
//! with a truncated archive that has no central directory. Validation that
//! must produce a proper error response (unknown codebase, bad path) happens
//! in [`ArchiveBuilder::prepare`] before streaming starts.

use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use axum::body::Bytes;
use futures_util::stream::{self, Stream};
use tokio::fs;
use tokio::sync::mpsc;
use walkdir::WalkDir;

use crate::protocol::StorageError;

use super::config::StorageConfig;
use super::path_utils;
use super::security::{CodebaseId, PathResolver};
use super::zip_writer::ZipStreamWriter;

/// Chunks buffered between the archive writer and the response
const ARCHIVE_CHANNEL_DEPTH: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    Directory,
    File,
}

/// One record of the archive, produced lazily by the directory walk
#[derive(Debug, Clone)]
pub struct ArchiveEntry {
    /// Name relative to the codebase root, `/`-separated; directories end in `/`
    pub name: String,
    pub kind: EntryKind,
    pub source: PathBuf,
    pub size: u64,
    pub modified: Option<SystemTime>,
}

/// A validated archive request
#[derive(Debug, Clone)]
pub struct ArchivePlan {
    pub codebase_id: CodebaseId,
    pub codebase_dir: PathBuf,
    /// Directory or file the walk starts from
    pub start: PathBuf,
}

impl ArchivePlan {
    /// Download name for the archive
    pub fn file_name(&self) -> String {
        format!("{}.zip", self.codebase_id)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ArchiveStats {
    pub files: usize,
    pub directories: usize,
    pub bytes: u64,
}

#[derive(Clone)]
pub struct ArchiveBuilder {
    resolver: Arc<PathResolver>,
    config: Arc<StorageConfig>,
}

impl ArchiveBuilder {
    pub fn new(resolver: Arc<PathResolver>, config: Arc<StorageConfig>) -> Self {
        Self { resolver, config }
    }

    /// Check everything that can still fail with a proper error response.
    ///
    /// `subpath` narrows the archive to one stored file or directory; entry
    /// names stay relative to the codebase root.
    pub async fn prepare(
        &self,
        id: &CodebaseId,
        subpath: Option<&str>,
    ) -> Result<ArchivePlan, StorageError> {
        let codebase_dir = self.resolver.codebase_dir(id);
        match fs::metadata(&codebase_dir).await {
            Ok(meta) if meta.is_dir() => {}
            Ok(_) => {
                return Err(StorageError::NotFound {
                    path: id.to_string(),
                })
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(StorageError::NotFound {
                    path: id.to_string(),
                })
            }
            Err(e) => return Err(StorageError::io(e)),
        }

        let start = match subpath {
            None => codebase_dir.clone(),
            Some(path) => {
                let resolved = self.resolver.resolve(id, path)?;
                self.resolver.ensure_contained(&resolved)?;
                if !fs::try_exists(&resolved.full).await.unwrap_or(false) {
                    return Err(StorageError::NotFound {
                        path: resolved.display_relative(),
                    });
                }
                resolved.full
            }
        };

        Ok(ArchivePlan {
            codebase_id: id.clone(),
            codebase_dir,
            start,
        })
    }

    /// Start producing the archive for `plan`.
    ///
    /// Dropping the returned stream (client disconnect) makes the writer's
    /// next send fail, which stops the walk.
    pub fn stream(&self, plan: ArchivePlan) -> impl Stream<Item = io::Result<Bytes>> + Send {
        let (tx, rx) = mpsc::channel(ARCHIVE_CHANNEL_DEPTH);
        let flush_at = self.config.stream_chunk_size.max(1);

        tokio::task::spawn_blocking(move || {
            let writer = ChannelWriter::new(tx.clone(), flush_at);
            match write_archive(&plan, writer) {
                Ok(stats) => tracing::info!(
                    "Downloaded ZIP archive for codebase {}: {} files, {} directories, {} bytes",
                    plan.codebase_id,
                    stats.files,
                    stats.directories,
                    stats.bytes
                ),
                Err(e) if tx.is_closed() => {
                    tracing::debug!(
                        "Archive download for codebase {} abandoned by client: {}",
                        plan.codebase_id,
                        e
                    );
                }
                Err(e) => {
                    tracing::error!(
                        "Error creating ZIP for codebase {} after streaming began: {}",
                        plan.codebase_id,
                        e
                    );
                    let _ = tx.blocking_send(Err(e));
                }
            }
        });

        stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|item| (item, rx)) })
    }
}

/// Depth-first walk of the tree below `start`, yielding archive entries.
///
/// Entries are sorted by file name within each directory. Symlinks are
/// skipped. The codebase directory itself never appears as an entry.
pub fn archive_entries(
    codebase_dir: &Path,
    start: &Path,
) -> impl Iterator<Item = io::Result<ArchiveEntry>> {
    let min_depth = if start == codebase_dir { 1 } else { 0 };
    let codebase_dir = codebase_dir.to_path_buf();

    WalkDir::new(start)
        .follow_links(false)
        .min_depth(min_depth)
        .sort_by_file_name()
        .into_iter()
        .filter_map(move |entry| {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => return Some(Err(io::Error::from(e))),
            };

            let file_type = entry.file_type();
            if file_type.is_symlink() {
                tracing::warn!("Skipping symlink in archive: {}", entry.path().display());
                return None;
            }

            let relative = match entry.path().strip_prefix(&codebase_dir) {
                Ok(relative) => relative,
                Err(_) => {
                    return Some(Err(io::Error::other(format!(
                        "walked outside codebase: {}",
                        entry.path().display()
                    ))))
                }
            };
            let name = path_utils::to_slash(relative);

            let metadata = match entry.metadata() {
                Ok(metadata) => metadata,
                Err(e) => return Some(Err(io::Error::from(e))),
            };

            let (name, kind, size) = if file_type.is_dir() {
                (format!("{}/", name), EntryKind::Directory, 0)
            } else {
                (name, EntryKind::File, metadata.len())
            };

            Some(Ok(ArchiveEntry {
                name,
                kind,
                source: entry.into_path(),
                size,
                modified: metadata.modified().ok(),
            }))
        })
}

/// Write the zip for `plan` into `writer`, returning what was archived
pub fn write_archive<W: Write>(plan: &ArchivePlan, writer: W) -> io::Result<ArchiveStats> {
    write_entries(archive_entries(&plan.codebase_dir, &plan.start), writer)
}

/// Deflate every file entry into a zip on `writer`.
///
/// On error the zip writer is dropped unfinished, so whatever already
/// reached `writer` has no central directory.
pub fn write_entries<I, W>(entries: I, writer: W) -> io::Result<ArchiveStats>
where
    I: IntoIterator<Item = io::Result<ArchiveEntry>>,
    W: Write,
{
    let mut zip = ZipStreamWriter::new(writer);
    let mut stats = ArchiveStats::default();

    for entry in entries {
        let entry = entry?;

        // Directories are implied by the names of the files inside them.
        if entry.kind == EntryKind::Directory {
            stats.directories += 1;
            continue;
        }

        let mut source = std::fs::File::open(&entry.source)?;
        stats.bytes += zip.add_file(&entry.name, entry.modified, entry.size, &mut source)?;
        stats.files += 1;
    }

    zip.finish()?;
    Ok(stats)
}

/// Blocking `Write` adapter that forwards archive bytes to the response stream.
///
/// Bytes still buffered when the writer is dropped are discarded: only
/// `flush` sends them. Once a send fails (the receiver is gone) every later
/// write fails too.
struct ChannelWriter {
    tx: mpsc::Sender<io::Result<Bytes>>,
    buffer: Vec<u8>,
    flush_at: usize,
    closed: bool,
}

impl ChannelWriter {
    fn new(tx: mpsc::Sender<io::Result<Bytes>>, flush_at: usize) -> Self {
        Self {
            tx,
            buffer: Vec::with_capacity(flush_at),
            flush_at,
            closed: false,
        }
    }

    fn send_buffered(&mut self) -> io::Result<()> {
        if self.closed {
            return Err(closed_error());
        }
        if self.buffer.is_empty() {
            return Ok(());
        }
        let chunk = std::mem::replace(&mut self.buffer, Vec::with_capacity(self.flush_at));
        if self.tx.blocking_send(Ok(Bytes::from(chunk))).is_err() {
            self.closed = true;
            return Err(closed_error());
        }
        Ok(())
    }
}

fn closed_error() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "archive stream closed")
}

impl Write for ChannelWriter {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        if self.closed {
            return Err(closed_error());
        }
        self.buffer.extend_from_slice(data);
        if self.buffer.len() >= self.flush_at {
            self.send_buffered()?;
        }
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.send_buffered()
    }
}
