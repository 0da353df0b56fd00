//! Byte-transfer endpoints of the local store. They accept the same headers a
//! B2 upload URL does, so clients use one uploader for either backend.
//! Bodies are streamed to disk rather than buffered.

use crate::{
    errors::{AppError, ErrorKind, UploadError},
    handlers::upload_handlers::percent_decoded,
    models::upload::ContentHash,
    services::{
        local_backend::LocalBackend,
        part_uploader::{HEADER_CONTENT_SHA1, HEADER_FILE_NAME, HEADER_PART_NUMBER},
    },
    state::AppState,
};
use axum::{
    Json,
    body::Body,
    extract::{Path, State},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::Response,
};
use futures::StreamExt;
use serde::Serialize;
use std::io;
use tokio_util::io::ReaderStream;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredFileResponse {
    pub file_name: String,
    pub content_sha1: String,
    pub content_length: i64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredPartResponse {
    pub part_number: u32,
    pub content_sha1: String,
}

/// POST `/storage/upload` — receive a whole file.
pub async fn upload_file(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Body,
) -> Result<Json<StoredFileResponse>, AppError> {
    let store = local_store(&state)?;
    let token = credential(&headers)?;
    let file_name = required_header(&headers, HEADER_FILE_NAME).map(percent_decoded)?;
    let expected = required_header(&headers, HEADER_CONTENT_SHA1)
        .and_then(|v| ContentHash::parse(&v).map_err(storage_error))?;

    let stream = body
        .into_data_stream()
        .map(|chunk| chunk.map_err(io::Error::other));

    let stored = store
        .receive_file(&token, &file_name, expected, stream)
        .await
        .map_err(storage_error)?;

    Ok(Json(StoredFileResponse {
        file_name: stored.path,
        content_sha1: stored.content_hash,
        content_length: stored.size_bytes,
    }))
}

/// POST `/storage/upload-part` — receive one part of a multipart session.
pub async fn upload_part(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Body,
) -> Result<Json<StoredPartResponse>, AppError> {
    let store = local_store(&state)?;
    let token = credential(&headers)?;
    let part_number: u32 = required_header(&headers, HEADER_PART_NUMBER)?
        .parse()
        .map_err(|_| AppError::new(StatusCode::BAD_REQUEST, "invalid part number"))?;
    let expected = required_header(&headers, HEADER_CONTENT_SHA1)
        .and_then(|v| ContentHash::parse(&v).map_err(storage_error))?;

    let stream = body
        .into_data_stream()
        .map(|chunk| chunk.map_err(io::Error::other));

    let part = store
        .receive_part(&token, part_number, expected, stream)
        .await
        .map_err(storage_error)?;

    Ok(Json(StoredPartResponse {
        part_number: part.part_number,
        content_sha1: part.sha1,
    }))
}

/// GET `/storage/file/{*path}` — stream a stored object back.
pub async fn download_file(
    State(state): State<AppState>,
    Path(path): Path<String>,
) -> Result<Response, AppError> {
    let store = local_store(&state)?;
    let (file, len) = store
        .open_object(&path)
        .await
        .map_err(storage_error)?
        .ok_or_else(|| AppError::not_found(format!("object `{path}` not found")))?;

    let mut response = Response::new(Body::from_stream(ReaderStream::new(file)));
    *response.status_mut() = StatusCode::OK;
    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/octet-stream"),
    );
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(len));
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    Ok(response)
}

fn local_store(state: &AppState) -> Result<&LocalBackend, AppError> {
    state
        .local
        .as_ref()
        .ok_or_else(|| AppError::not_found("this server does not store objects"))
}

fn credential(headers: &HeaderMap) -> Result<String, AppError> {
    let raw = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| AppError::unauthorized("missing upload credential"))?;
    Ok(raw.strip_prefix("Bearer ").unwrap_or(raw).to_string())
}

fn required_header(headers: &HeaderMap, name: &str) -> Result<String, AppError> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_string())
        .ok_or_else(|| AppError::new(StatusCode::BAD_REQUEST, format!("missing {name} header")))
}

/// Storage endpoints answer like an object store: credential problems are
/// 401, anything wrong with the payload is 400.
fn storage_error(err: UploadError) -> AppError {
    let status = match err.kind() {
        ErrorKind::AuthFailure => StatusCode::UNAUTHORIZED,
        ErrorKind::Validation | ErrorKind::Transfer | ErrorKind::Upstream => {
            StatusCode::BAD_REQUEST
        }
        _ => err.status(),
    };
    let mut app_err = AppError::from(err);
    app_err.status = status;
    app_err
}
