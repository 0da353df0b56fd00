//! HTTP handlers for target issuance, multipart finalization, the proxied
//! relay and file records. Storage work is delegated to the services held in
//! `AppState`.

use crate::{
    errors::{AppError, UploadError},
    models::{
        file_record::{FileRecord, NewFileRecord},
        multipart::PartRecord,
        upload::{MultipartTarget, ObjectLocation, UploadRequest, UploadTarget},
    },
    state::AppState,
};
use axum::{
    Json,
    extract::State,
    http::{HeaderMap, StatusCode, header},
};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::info;

pub const HEADER_USER_ID: &str = "x-user-id";
pub const HEADER_FILE_NAME: &str = "x-file-name";
pub const HEADER_FILE_TYPE: &str = "x-file-type";
pub const HEADER_FILE_SIZE: &str = "x-file-size";
pub const HEADER_FOLDER_ID: &str = "x-folder-id";

/// Body of `POST /api/uploads/target`.
#[derive(Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SimpleTargetReq {
    #[serde(default)]
    pub user_id: String,
    #[serde(default)]
    pub file_name: String,
    #[serde(default)]
    pub mime_type: String,
    pub folder_id: Option<String>,
}

/// Body of `POST /api/uploads/large/start`.
#[derive(Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StartLargeReq {
    #[serde(default)]
    pub user_id: String,
    #[serde(default)]
    pub file_name: String,
    #[serde(default)]
    pub file_size: u64,
    #[serde(default)]
    pub mime_type: String,
    pub folder_id: Option<String>,
}

/// Body of `POST /api/uploads/large/part-url`.
#[derive(Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PartUrlReq {
    #[serde(default)]
    pub file_id: String,
    pub part_number: Option<u32>,
}

/// Body of `POST /api/uploads/large/finish`.
#[derive(Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FinishLargeReq {
    #[serde(default)]
    pub file_id: String,
    #[serde(default)]
    pub parts: Vec<PartRecord>,
}

/// Response of `POST /api/uploads/proxy`.
#[derive(Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxyReceipt {
    pub path: String,
    pub content_sha1: String,
    pub content_length: u64,
}

/// `POST /api/uploads/target`
pub async fn issue_simple_target(
    State(state): State<AppState>,
    Json(req): Json<SimpleTargetReq>,
) -> Result<Json<UploadTarget>, AppError> {
    let target = state
        .issuer
        .issue_simple_target(
            &req.user_id,
            &req.file_name,
            &req.mime_type,
            req.folder_id.as_deref().filter(|f| !f.is_empty()),
        )
        .await?;
    Ok(Json(target))
}

/// `POST /api/uploads/large/start`
pub async fn start_large_upload(
    State(state): State<AppState>,
    Json(req): Json<StartLargeReq>,
) -> Result<Json<MultipartTarget>, AppError> {
    let target = state
        .issuer
        .issue_multipart_target(
            &req.user_id,
            &req.file_name,
            &req.mime_type,
            req.file_size,
            req.folder_id.as_deref().filter(|f| !f.is_empty()),
        )
        .await?;
    Ok(Json(target))
}

/// `POST /api/uploads/large/part-url`
pub async fn get_part_upload_url(
    State(state): State<AppState>,
    Json(req): Json<PartUrlReq>,
) -> Result<Json<UploadTarget>, AppError> {
    if req.part_number == Some(0) {
        return Err(UploadError::Validation("part numbers start at 1".into()).into());
    }
    let target = state.issuer.issue_part_target(&req.file_id).await?;
    Ok(Json(target))
}

/// `POST /api/uploads/large/finish`
pub async fn finish_large_upload(
    State(state): State<AppState>,
    Json(req): Json<FinishLargeReq>,
) -> Result<Json<ObjectLocation>, AppError> {
    let location = state.finalizer.finish(&req.file_id, &req.parts).await?;
    Ok(Json(location))
}

/// `POST /api/uploads/proxy` — relay a small file through this server.
///
/// The body size is capped by the route's body limit; anything larger is
/// answered with 413 before this handler runs.
pub async fn proxy_upload(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<ProxyReceipt>, AppError> {
    let user_id = header_str(&headers, HEADER_USER_ID).unwrap_or_default();
    let file_name = header_str(&headers, HEADER_FILE_NAME)
        .map(percent_decoded)
        .unwrap_or_default();
    let file_type = header_str(&headers, HEADER_FILE_TYPE).unwrap_or_default();
    let folder_id = header_str(&headers, HEADER_FOLDER_ID).filter(|f| !f.is_empty());

    let size = body.len() as u64;
    if size > state.policy.proxy_ceiling {
        return Err(UploadError::PayloadTooLarge {
            size,
            limit: state.policy.proxy_ceiling,
        }
        .into());
    }
    if let Some(declared) = header_str(&headers, HEADER_FILE_SIZE) {
        let declared: u64 = declared
            .parse()
            .map_err(|_| UploadError::Validation(format!("bad {HEADER_FILE_SIZE} `{declared}`")))?;
        if declared != size {
            return Err(UploadError::Validation(format!(
                "declared {declared} bytes but received {size}"
            ))
            .into());
        }
    }

    let request = UploadRequest::new(user_id, file_name, file_type, size, folder_id);
    request.validate()?;

    let target = state
        .issuer
        .issue_simple_target(
            &request.owner_id,
            &request.file_name,
            &request.mime_type,
            request.folder_id.as_deref(),
        )
        .await?;
    let hash = state
        .relay
        .upload_part(&target, None, body, &request.mime_type)
        .await?;

    info!(path = %target.upload_path, size, "relayed upload");
    Ok(Json(ProxyReceipt {
        path: target.upload_path,
        content_sha1: hash.header_value().to_string(),
        content_length: size,
    }))
}

/// `POST /api/files` — record a completed upload.
///
/// The caller's bearer token is required but opaque to this service.
pub async fn record_file(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(record): Json<NewFileRecord>,
) -> Result<(StatusCode, Json<FileRecord>), AppError> {
    let bearer = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .filter(|token| !token.trim().is_empty());
    if bearer.is_none() {
        return Err(AppError::unauthorized("Unauthorized"));
    }

    let row = state.recorder.insert(record).await?;
    Ok((StatusCode::CREATED, Json(row)))
}

fn header_str(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_string())
}

/// File names travel percent-encoded so that non-ASCII names fit in a header.
pub fn percent_decoded(raw: String) -> String {
    let decoded = urlencoding::decode(&raw).map(|d| d.into_owned()).ok();
    decoded.unwrap_or(raw)
}
