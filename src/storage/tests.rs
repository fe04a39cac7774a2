use std::collections::HashSet;
use std::io::Read;

use axum::body::Bytes;
use futures_util::StreamExt;
use tempfile::TempDir;

use crate::protocol::StorageError;

use super::archive::{archive_entries, write_archive, EntryKind};
use super::config::StorageConfig;
use super::mime::ContentKind;
use super::security::CodebaseId;
use super::upload::{UploadBatch, UploadPart};
use super::StorageService;

const ID: &str = "0b5f3c52-6a8e-4f0c-9a41-2d7e8b9c1f30";

fn service(temp: &TempDir) -> StorageService {
    StorageService::new(StorageConfig::with_root(temp.path()))
}

fn codebase() -> CodebaseId {
    CodebaseId::parse(ID).unwrap()
}

fn part(file_name: &str, data: &'static [u8]) -> UploadPart {
    UploadPart {
        file_name: file_name.to_string(),
        data: Bytes::from_static(data),
    }
}

fn batch_with_paths(files: &[(&str, &str, &'static [u8])]) -> UploadBatch {
    let mut batch = UploadBatch::default();
    for (file_name, path, data) in files {
        batch.parts.push(part(file_name, *data));
        batch.record_field(&format!("path_{}", file_name), path.to_string());
    }
    batch
}

async fn download_bytes(service: &StorageService, path: &str) -> Result<Vec<u8>, StorageError> {
    let download = service.ops().open_download(&codebase(), path).await?;
    let mut stream = Box::pin(download.into_stream(7));
    let mut bytes = Vec::new();
    while let Some(chunk) = stream.next().await {
        bytes.extend_from_slice(&chunk.unwrap());
    }
    Ok(bytes)
}

#[tokio::test]
async fn test_upload_then_download_round_trip() {
    let temp = TempDir::new().unwrap();
    let service = service(&temp);
    let batch = batch_with_paths(&[("c.txt", "a/b/c.txt", b"hello nested world\n")]);

    let summary = service.ingester().ingest(&codebase(), &batch).await.unwrap();
    assert_eq!(summary.files_stored(), 1);
    assert_eq!(summary.total_bytes(), 19);
    assert_eq!(summary.stored[0].path, "a/b/c.txt");

    let bytes = download_bytes(&service, "a/b/c.txt").await.unwrap();
    assert_eq!(bytes, b"hello nested world\n");
}

#[tokio::test]
async fn test_upload_without_path_field_uses_base_name() {
    let temp = TempDir::new().unwrap();
    let service = service(&temp);
    let mut batch = UploadBatch::default();
    batch.parts.push(part("nested/readme.md", b"# readme"));

    service.ingester().ingest(&codebase(), &batch).await.unwrap();

    let stored = temp.path().join(ID).join("readme.md");
    assert_eq!(std::fs::read(stored).unwrap(), b"# readme");
}

#[tokio::test]
async fn test_reupload_overwrites() {
    let temp = TempDir::new().unwrap();
    let service = service(&temp);

    let first = batch_with_paths(&[("f.txt", "f.txt", b"first version")]);
    let second = batch_with_paths(&[("f.txt", "f.txt", b"second")]);
    service.ingester().ingest(&codebase(), &first).await.unwrap();
    service.ingester().ingest(&codebase(), &second).await.unwrap();

    assert_eq!(download_bytes(&service, "f.txt").await.unwrap(), b"second");
}

#[tokio::test]
async fn test_partial_failure_keeps_siblings() {
    let temp = TempDir::new().unwrap();
    let service = service(&temp);
    // "blocker" becomes a regular file, so "blocker/inner.txt" cannot be created.
    let batch = batch_with_paths(&[
        ("one.txt", "blocker", b"1"),
        ("two.txt", "blocker/inner.txt", b"2"),
        ("three.txt", "ok/three.txt", b"3"),
    ]);

    let summary = service.ingester().ingest(&codebase(), &batch).await.unwrap();

    assert_eq!(summary.files_stored(), 2);
    assert_eq!(summary.failures.len(), 1);
    assert_eq!(summary.failures[0].file_name, "two.txt");
    assert_eq!(download_bytes(&service, "ok/three.txt").await.unwrap(), b"3");
    assert!(!temp.path().join(ID).join("blocker").is_dir());
}

#[tokio::test]
async fn test_traversal_upload_is_skipped() {
    let temp = TempDir::new().unwrap();
    let service = service(&temp);
    let batch = batch_with_paths(&[
        ("passwd", "../../etc/passwd", b"root"),
        ("b", "a/../../b", b"b"),
        ("good.txt", "good.txt", b"good"),
    ]);

    let summary = service.ingester().ingest(&codebase(), &batch).await.unwrap();

    assert_eq!(summary.files_stored(), 1);
    assert_eq!(summary.failures.len(), 2);
    for failure in &summary.failures {
        assert!(matches!(failure.error, StorageError::InvalidPath { .. }));
    }
    assert!(!temp.path().join("etc").exists());
    assert!(!temp.path().join("b").exists());
}

#[tokio::test]
async fn test_all_failed_removes_new_codebase_dir() {
    let temp = TempDir::new().unwrap();
    let service = service(&temp);
    let batch = batch_with_paths(&[("x", "../x", b"x"), ("y", "../../y", b"y")]);

    let err = service.ingester().ingest(&codebase(), &batch).await.unwrap_err();

    assert_eq!(err, StorageError::AllUploadsFailed);
    assert!(!temp.path().join(ID).exists());
}

#[tokio::test]
async fn test_all_failed_keeps_existing_codebase() {
    let temp = TempDir::new().unwrap();
    let service = service(&temp);
    let good = batch_with_paths(&[("keep.txt", "keep.txt", b"keep")]);
    service.ingester().ingest(&codebase(), &good).await.unwrap();

    let bad = batch_with_paths(&[("x", "../x", b"x")]);
    let err = service.ingester().ingest(&codebase(), &bad).await.unwrap_err();

    assert_eq!(err, StorageError::AllUploadsFailed);
    assert_eq!(download_bytes(&service, "keep.txt").await.unwrap(), b"keep");
}

#[tokio::test]
async fn test_failed_write_removes_directories_it_created() {
    let temp = TempDir::new().unwrap();
    let service = service(&temp);
    let good = batch_with_paths(&[("keep.txt", "docs/keep.txt", b"keep")]);
    service.ingester().ingest(&codebase(), &good).await.unwrap();

    // The parents are creatable, the file name is not.
    let unwritable = format!("fresh/nested/{}.txt", "n".repeat(300));
    let beside_existing = format!("docs/new/{}.txt", "n".repeat(300));
    let bad = batch_with_paths(&[
        ("a.txt", unwritable.as_str(), b"a"),
        ("b.txt", beside_existing.as_str(), b"b"),
    ]);
    let err = service.ingester().ingest(&codebase(), &bad).await.unwrap_err();

    assert_eq!(err, StorageError::AllUploadsFailed);
    let codebase_dir = temp.path().join(ID);
    assert!(!codebase_dir.join("fresh").exists());
    assert!(!codebase_dir.join("docs").join("new").exists());
    assert_eq!(download_bytes(&service, "docs/keep.txt").await.unwrap(), b"keep");
}

#[tokio::test]
async fn test_empty_batch_is_rejected() {
    let temp = TempDir::new().unwrap();
    let service = service(&temp);

    let err = service
        .ingester()
        .ingest(&codebase(), &UploadBatch::default())
        .await
        .unwrap_err();

    assert!(matches!(err, StorageError::MissingParameter { .. }));
    assert!(!temp.path().join(ID).exists());
}

#[tokio::test]
async fn test_download_rejects_traversal() {
    let temp = TempDir::new().unwrap();
    let service = service(&temp);
    std::fs::create_dir_all(temp.path().join(ID)).unwrap();
    std::fs::write(temp.path().join("secret.txt"), "secret").unwrap();

    for path in ["../secret.txt", "a/../../secret.txt", "../../etc/passwd"] {
        match download_bytes(&service, path).await {
            Err(StorageError::InvalidPath { .. }) => {}
            other => panic!("expected InvalidPath for {}, got {:?}", path, other.map(|b| b.len())),
        }
    }
}

#[tokio::test]
async fn test_missing_file_and_directory_errors() {
    let temp = TempDir::new().unwrap();
    let service = service(&temp);

    // Codebase never stored
    let err = service.ops().read_content(&codebase(), "x.txt").await.unwrap_err();
    assert!(matches!(err, StorageError::NotFound { .. }));

    let batch = batch_with_paths(&[("y.txt", "sub/y.txt", b"y")]);
    service.ingester().ingest(&codebase(), &batch).await.unwrap();

    let err = service.ops().read_content(&codebase(), "nope.txt").await.unwrap_err();
    assert!(matches!(err, StorageError::NotFound { .. }));

    let err = service.ops().read_content(&codebase(), "sub").await.unwrap_err();
    assert!(matches!(err, StorageError::IsDirectory { .. }));

    let err = service.ops().open_download(&codebase(), "sub").await.err().unwrap();
    assert!(matches!(err, StorageError::IsDirectory { .. }));
}

#[tokio::test]
async fn test_read_content_classifies() {
    let temp = TempDir::new().unwrap();
    let service = service(&temp);
    let batch = batch_with_paths(&[
        ("main.rs", "src/main.rs", b"fn main() {}\n"),
        ("logo.bin", "assets/logo.bin", &[0xff, 0xd8, 0xff, 0xe0, 0x00, 0x10]),
    ]);
    service.ingester().ingest(&codebase(), &batch).await.unwrap();

    let text = service.ops().read_content(&codebase(), "./src//main.rs").await.unwrap();
    assert_eq!(text.kind, ContentKind::Text);
    assert_eq!(text.path, "src/main.rs");
    assert_eq!(text.size, 13);
    assert_eq!(text.text.as_deref(), Some("fn main() {}\n"));

    let binary = service.ops().read_content(&codebase(), "assets/logo.bin").await.unwrap();
    assert_eq!(binary.kind, ContentKind::Binary);
    assert!(binary.text.is_none());
    assert_eq!(binary.size, 6);
}

#[tokio::test]
async fn test_archive_contains_exactly_the_stored_files() {
    let temp = TempDir::new().unwrap();
    let service = service(&temp);
    let batch = batch_with_paths(&[
        ("x.txt", "x.txt", b"plain text"),
        ("y.bin", "sub/y.bin", &[0u8, 1, 2, 3, 255]),
    ]);
    service.ingester().ingest(&codebase(), &batch).await.unwrap();

    let plan = service.archiver().prepare(&codebase(), None).await.unwrap();
    assert_eq!(plan.file_name(), format!("{}.zip", ID));

    let mut stream = Box::pin(service.archiver().stream(plan));
    let mut bytes = Vec::new();
    while let Some(chunk) = stream.next().await {
        bytes.extend_from_slice(&chunk.unwrap());
    }

    let mut archive = zip::ZipArchive::new(std::io::Cursor::new(bytes)).unwrap();
    assert_eq!(archive.len(), 2);

    let names: HashSet<String> = archive.file_names().map(|n| n.to_string()).collect();
    assert_eq!(
        names,
        HashSet::from(["x.txt".to_string(), "sub/y.bin".to_string()])
    );

    let mut content = Vec::new();
    archive.by_name("sub/y.bin").unwrap().read_to_end(&mut content).unwrap();
    assert_eq!(content, vec![0u8, 1, 2, 3, 255]);

    let mut content = String::new();
    archive.by_name("x.txt").unwrap().read_to_string(&mut content).unwrap();
    assert_eq!(content, "plain text");
}

#[tokio::test]
async fn test_archive_of_subdirectory_keeps_codebase_relative_names() {
    let temp = TempDir::new().unwrap();
    let service = service(&temp);
    let batch = batch_with_paths(&[
        ("a.txt", "docs/a.txt", b"a"),
        ("b.txt", "src/b.txt", b"b"),
    ]);
    service.ingester().ingest(&codebase(), &batch).await.unwrap();

    let plan = service.archiver().prepare(&codebase(), Some("docs")).await.unwrap();
    let mut bytes = Vec::new();
    write_archive(&plan, &mut bytes).unwrap();

    let archive = zip::ZipArchive::new(std::io::Cursor::new(bytes)).unwrap();
    let names: Vec<&str> = archive.file_names().collect();
    assert_eq!(names, vec!["docs/a.txt"]);
}

#[tokio::test]
async fn test_archive_of_unknown_codebase_is_not_found() {
    let temp = TempDir::new().unwrap();
    let service = service(&temp);

    let err = service.archiver().prepare(&codebase(), None).await.unwrap_err();
    assert!(matches!(err, StorageError::NotFound { .. }));
}

#[test]
fn test_archive_entries_walk_depth_first_with_slash_names() {
    let temp = TempDir::new().unwrap();
    let root = temp.path().join(ID);
    std::fs::create_dir_all(root.join("sub").join("deeper")).unwrap();
    std::fs::write(root.join("x.txt"), "x").unwrap();
    std::fs::write(root.join("sub").join("deeper").join("z.txt"), "zz").unwrap();

    let entries: Vec<_> = archive_entries(&root, &root)
        .map(|e| e.unwrap())
        .map(|e| (e.name, e.kind, e.size))
        .collect();

    assert_eq!(
        entries,
        vec![
            ("sub/".to_string(), EntryKind::Directory, 0),
            ("sub/deeper/".to_string(), EntryKind::Directory, 0),
            ("sub/deeper/z.txt".to_string(), EntryKind::File, 2),
            ("x.txt".to_string(), EntryKind::File, 1),
        ]
    );
}

#[cfg(unix)]
#[tokio::test]
async fn test_symlink_escape_is_rejected() {
    use std::os::unix::fs::symlink;

    let temp = TempDir::new().unwrap();
    let service = service(&temp);
    let outside = temp.path().join("outside");
    std::fs::create_dir_all(&outside).unwrap();
    std::fs::write(outside.join("secret.txt"), "secret").unwrap();

    let codebase_dir = temp.path().join(ID);
    std::fs::create_dir_all(&codebase_dir).unwrap();
    symlink(&outside, codebase_dir.join("link")).unwrap();

    let err = service.ops().read_content(&codebase(), "link/secret.txt").await.unwrap_err();
    assert!(matches!(err, StorageError::InvalidPath { .. }));

    let batch = batch_with_paths(&[("evil.txt", "link/evil.txt", b"evil")]);
    let err = service.ingester().ingest(&codebase(), &batch).await.unwrap_err();
    assert_eq!(err, StorageError::AllUploadsFailed);
    assert!(!outside.join("evil.txt").exists());
    // The codebase existed before the failed batch, so it survives.
    assert!(codebase_dir.exists());
}
