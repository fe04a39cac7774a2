use std::sync::Arc;

use axum::body::Body;
use axum::extract::multipart::{MultipartError, MultipartRejection};
use axum::extract::rejection::{PathRejection, QueryRejection};
use axum::extract::{Multipart, Path, Query, State};
use axum::http::header::{CONTENT_DISPOSITION, CONTENT_LENGTH, CONTENT_TYPE};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;

use crate::protocol::{FileContentResponse, HealthResponse, StorageError, StoreResponse};
use crate::storage::operations::{download_url, BINARY_PLACEHOLDER};
use crate::storage::security::CodebaseId;
use crate::storage::upload::{UploadBatch, UploadPart};
use crate::storage::StorageService;

/// Multipart field carrying uploaded files
const FILES_FIELD: &str = "files";
/// Multipart field carrying the codebase ID on `/store`
const CODEBASE_ID_FIELD: &str = "codebase_id";

#[derive(Debug, Default, Deserialize)]
pub struct FileQuery {
    pub file: Option<String>,
}

impl FileQuery {
    fn required(self) -> Result<String, StorageError> {
        self.file
            .filter(|f| !f.is_empty())
            .ok_or_else(|| StorageError::MissingParameter {
                name: "file".to_string(),
            })
    }

    fn optional(&self) -> Option<&str> {
        self.file.as_deref().filter(|f| !f.is_empty())
    }
}

/// POST /store
pub async fn store_files(
    State(service): State<Arc<StorageService>>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Json<StoreResponse>, StorageError> {
    let (codebase_id, batch) = read_upload_form(multipart?).await?;

    let raw_id = codebase_id
        .filter(|id| !id.is_empty())
        .ok_or_else(|| StorageError::MissingParameter {
            name: CODEBASE_ID_FIELD.to_string(),
        })?;
    let id = CodebaseId::parse(&raw_id)?;

    ingest(&service, &id, batch).await
}

/// POST /upload/:id
pub async fn upload_files(
    State(service): State<Arc<StorageService>>,
    path: Result<Path<String>, PathRejection>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Json<StoreResponse>, StorageError> {
    let Path(id) = path?;
    let id = CodebaseId::parse(&id)?;
    let (_, batch) = read_upload_form(multipart?).await?;

    ingest(&service, &id, batch).await
}

async fn ingest(
    service: &StorageService,
    id: &CodebaseId,
    batch: UploadBatch,
) -> Result<Json<StoreResponse>, StorageError> {
    let summary = service.ingester().ingest(id, &batch).await?;

    Ok(Json(StoreResponse {
        success: true,
        message: summary.message(),
        files_stored: summary.files_stored(),
        total_bytes: summary.total_bytes(),
        files_failed: summary.failures.len(),
    }))
}

/// Drain the multipart body into an upload batch.
///
/// Path fields may come before or after the file they describe, so the
/// whole form is read before anything touches the disk.
async fn read_upload_form(
    mut multipart: Multipart,
) -> Result<(Option<String>, UploadBatch), StorageError> {
    let mut codebase_id = None;
    let mut batch = UploadBatch::default();

    while let Some(field) = multipart.next_field().await.map_err(parse_error)? {
        let name = field.name().unwrap_or_default().to_string();
        let file_name = field.file_name().map(|n| n.to_string());

        match (name.as_str(), file_name) {
            (FILES_FIELD, Some(file_name)) => {
                let data = field.bytes().await.map_err(parse_error)?;
                batch.parts.push(UploadPart { file_name, data });
            }
            (CODEBASE_ID_FIELD, _) => {
                codebase_id = Some(field.text().await.map_err(parse_error)?.trim().to_string());
            }
            _ => {
                let value = field.bytes().await.map_err(parse_error)?;
                if !batch.record_field(&name, String::from_utf8_lossy(&value).into_owned()) {
                    tracing::debug!("Ignoring form field: {}", name);
                }
            }
        }
    }

    Ok((codebase_id, batch))
}

fn parse_error(err: MultipartError) -> StorageError {
    StorageError::UploadParse {
        message: err.body_text(),
    }
}

/// GET /content/:id?file=<path>
pub async fn file_content(
    State(service): State<Arc<StorageService>>,
    path: Result<Path<String>, PathRejection>,
    query: Result<Query<FileQuery>, QueryRejection>,
) -> Result<Json<FileContentResponse>, StorageError> {
    let (Path(id), Query(query)) = (path?, query?);
    let id = CodebaseId::parse(&id)?;
    let path = query.required()?;
    tracing::debug!("Requesting content for file: {} in codebase: {}", path, id);

    let content = service.ops().read_content(&id, &path).await?;
    let is_text = content.kind.is_text();
    let (body, link) = match content.text {
        Some(text) => (text, None),
        None => (
            BINARY_PLACEHOLDER.to_string(),
            Some(download_url(&id, &content.path)),
        ),
    };

    Ok(Json(FileContentResponse {
        success: true,
        file_path: content.path,
        size: content.size,
        is_text,
        modified: content.modified,
        content: body,
        download_url: link,
    }))
}

/// GET /download/:id?file=<path>
pub async fn download_file(
    State(service): State<Arc<StorageService>>,
    path: Result<Path<String>, PathRejection>,
    query: Result<Query<FileQuery>, QueryRejection>,
) -> Result<Response, StorageError> {
    let (Path(id), Query(query)) = (path?, query?);
    let id = CodebaseId::parse(&id)?;
    let path = query.required()?;
    stream_file(&service, &id, &path).await
}

/// GET /download/:id/*path
pub async fn download_file_by_path(
    State(service): State<Arc<StorageService>>,
    path: Result<Path<(String, String)>, PathRejection>,
) -> Result<Response, StorageError> {
    let Path((id, path)) = path?;
    let id = CodebaseId::parse(&id)?;
    stream_file(&service, &id, &path).await
}

async fn stream_file(
    service: &StorageService,
    id: &CodebaseId,
    path: &str,
) -> Result<Response, StorageError> {
    let download = service.ops().open_download(id, path).await?;

    let headers = [
        (CONTENT_TYPE, "application/octet-stream".to_string()),
        (CONTENT_DISPOSITION, content_disposition(&download.file_name)),
        (CONTENT_LENGTH, download.size.to_string()),
    ];
    let body = Body::from_stream(download.into_stream(service.config().stream_chunk_size));

    Ok((headers, body).into_response())
}

/// GET /zip/:id and /download-zip/:id, optionally `?file=<path>`
pub async fn download_zip(
    State(service): State<Arc<StorageService>>,
    path: Result<Path<String>, PathRejection>,
    query: Result<Query<FileQuery>, QueryRejection>,
) -> Result<Response, StorageError> {
    let (Path(id), Query(query)) = (path?, query?);
    let id = CodebaseId::parse(&id)?;
    let plan = service.archiver().prepare(&id, query.optional()).await?;

    let headers = [
        (CONTENT_TYPE, "application/zip".to_string()),
        (CONTENT_DISPOSITION, content_disposition(&plan.file_name())),
    ];
    let body = Body::from_stream(service.archiver().stream(plan));

    Ok((headers, body).into_response())
}

/// GET /health
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
    })
}

/// `attachment` disposition with an ASCII-safe `filename` and, when the
/// name is not plain ASCII, an RFC 5987 `filename*`.
fn content_disposition(file_name: &str) -> String {
    let ascii: String = file_name
        .chars()
        .map(|c| match c {
            '"' | '\\' => '_',
            c if c.is_ascii_graphic() || c == ' ' => c,
            _ => '_',
        })
        .collect();

    if ascii == file_name {
        format!("attachment; filename=\"{}\"", ascii)
    } else {
        format!(
            "attachment; filename=\"{}\"; filename*=UTF-8''{}",
            ascii,
            urlencoding::encode(file_name)
        )
    }
}
