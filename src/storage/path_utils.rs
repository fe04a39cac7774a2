use std::path::{Component, Path, PathBuf};

use crate::protocol::StorageError;

/// Render a relative path with `/` separators whatever the host separator is.
///
/// Zip entry names and client-facing paths always use forward slashes.
pub fn to_slash(path: &Path) -> String {
    path.components()
        .filter_map(|c| match c {
            Component::Normal(part) => Some(part.to_string_lossy().replace('\\', "/")),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("/")
}

/// Check that no ancestor of `path` exists as a regular file.
/// A path like `root/file.txt/newdir` can never be created.
pub fn validate_parent_components(path: &Path) -> Result<(), StorageError> {
    let mut current = PathBuf::new();

    for component in path.components() {
        current.push(component);

        if current.is_file() {
            return Err(StorageError::io(format!(
                "not a directory: {}",
                current.display()
            )));
        }
    }

    Ok(())
}

/// Create the parent directories of `path`, refusing to descend through files.
///
/// Returns the shallowest directory this call created, if any, so a failed
/// write can undo it with [`remove_created_dirs`].
pub async fn create_parent_dirs_safe(path: &Path) -> Result<Option<PathBuf>, StorageError> {
    let Some(parent) = path.parent() else {
        return Ok(None);
    };
    validate_parent_components(parent)?;

    let created = parent
        .ancestors()
        .take_while(|dir| !dir.exists())
        .last()
        .map(Path::to_path_buf);

    if let Err(e) = tokio::fs::create_dir_all(parent).await {
        if let Some(top) = &created {
            remove_created_dirs(path, top).await;
        }
        return Err(StorageError::io(e));
    }

    Ok(created)
}

/// Remove the now-empty parents of `path` up to and including `top`.
///
/// Stops at the first directory that is not empty, so anything a concurrent
/// request stored meanwhile survives.
pub async fn remove_created_dirs(path: &Path, top: &Path) {
    let Some(parent) = path.parent() else {
        return;
    };

    for dir in parent.ancestors() {
        if !dir.starts_with(top) {
            break;
        }
        match tokio::fs::remove_dir(dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                tracing::debug!("Keeping directory {}: {}", dir.display(), e);
                break;
            }
        }
    }
}
