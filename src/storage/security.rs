use std::fmt;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use path_jail::Jail;
use uuid::Uuid;

use crate::protocol::StorageError;

use super::config::StorageConfig;
use super::path_utils;

/// A codebase identifier that has passed format validation.
///
/// Identifiers are UUIDs; the on-disk directory name is the lowercase
/// hyphenated form regardless of how the caller spelled it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CodebaseId(String);

impl CodebaseId {
    pub fn parse(raw: &str) -> Result<Self, StorageError> {
        Uuid::parse_str(raw)
            .map(|id| Self(id.hyphenated().to_string()))
            .map_err(|_| StorageError::InvalidIdentifier {
                id: raw.to_string(),
            })
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CodebaseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A caller path resolved to a location inside a codebase directory
#[derive(Debug, Clone)]
pub struct ResolvedPath {
    pub codebase_dir: PathBuf,
    /// Normalized path relative to `codebase_dir`
    pub relative: PathBuf,
    pub full: PathBuf,
}

impl ResolvedPath {
    /// Forward-slash form of the relative path, as reported to clients
    pub fn display_relative(&self) -> String {
        path_utils::to_slash(&self.relative)
    }

    pub fn file_name(&self) -> String {
        self.relative
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default()
    }
}

/// Maps (codebase, relative path) pairs onto the storage root.
///
/// Every location handed out is a strict descendant of `root/<codebase>`.
pub struct PathResolver {
    config: Arc<StorageConfig>,
}

impl PathResolver {
    pub fn new(config: Arc<StorageConfig>) -> Self {
        Self { config }
    }

    pub fn codebase_dir(&self, id: &CodebaseId) -> PathBuf {
        self.config.root.join(id.as_str())
    }

    /// Lexically resolve `relative` under the codebase directory.
    ///
    /// Pure: touches nothing on disk.
    pub fn resolve(&self, id: &CodebaseId, relative: &str) -> Result<ResolvedPath, StorageError> {
        let normalized = normalize_relative(relative)?;
        let codebase_dir = self.codebase_dir(id);
        let full = codebase_dir.join(&normalized);

        if !is_strict_descendant(&full, &codebase_dir) {
            return Err(StorageError::InvalidPath {
                path: relative.to_string(),
            });
        }

        Ok(ResolvedPath {
            codebase_dir,
            relative: normalized,
            full,
        })
    }

    /// Check that the deepest existing ancestor of `resolved.full` does not
    /// leave the codebase directory once symlinks are followed.
    ///
    /// Fails with `NotFound` when the codebase directory itself is missing.
    pub fn ensure_contained(&self, resolved: &ResolvedPath) -> Result<(), StorageError> {
        let base = resolved.codebase_dir.canonicalize().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                StorageError::NotFound {
                    path: resolved.display_relative(),
                }
            } else {
                StorageError::io(e)
            }
        })?;

        let ancestor = find_existing_ancestor(&resolved.full).ok_or_else(|| StorageError::NotFound {
            path: resolved.display_relative(),
        })?;
        let canonical = ancestor.canonicalize().map_err(StorageError::io)?;

        if canonical == base {
            return Ok(());
        }

        let jail = Jail::new(&base).map_err(|e| StorageError::io(format!("{:?}", e)))?;
        if jail.contains(&canonical).is_err() {
            tracing::warn!(
                "Rejected path escaping codebase via symlink: {} -> {}",
                resolved.display_relative(),
                canonical.display()
            );
            return Err(StorageError::InvalidPath {
                path: resolved.display_relative(),
            });
        }

        Ok(())
    }
}

/// Collapse `.` and `..` segments of a caller-supplied relative path.
///
/// Backslashes count as separators. Leading slashes are ignored, so `/a/b`
/// names `a/b` inside the codebase. A `..` that would climb above the
/// codebase root, a drive prefix, or an empty result is rejected.
pub fn normalize_relative(raw: &str) -> Result<PathBuf, StorageError> {
    let invalid = || StorageError::InvalidPath {
        path: raw.to_string(),
    };

    if raw.contains('\0') {
        return Err(invalid());
    }

    let unified = raw.replace('\\', "/");
    let mut parts: Vec<&std::ffi::OsStr> = Vec::new();
    for component in Path::new(&unified).components() {
        match component {
            Component::Prefix(_) => return Err(invalid()),
            Component::RootDir | Component::CurDir => {}
            Component::ParentDir => {
                if parts.pop().is_none() {
                    return Err(invalid());
                }
            }
            Component::Normal(part) => parts.push(part),
        }
    }

    if parts.is_empty() {
        return Err(invalid());
    }

    Ok(parts.into_iter().collect())
}

fn is_strict_descendant(path: &Path, base: &Path) -> bool {
    path != base
        && path.starts_with(base)
        && !path
            .components()
            .any(|c| matches!(c, Component::ParentDir))
}

fn find_existing_ancestor(path: &Path) -> Option<PathBuf> {
    path.ancestors().find(|p| p.exists()).map(|p| p.to_path_buf())
}
