//! Client side of the relay's HTTP API.

use crate::errors::{ErrorKind, UploadError, UploadResult};
use crate::handlers::upload_handlers::{
    FinishLargeReq, HEADER_FILE_NAME, HEADER_FILE_SIZE, HEADER_FILE_TYPE, HEADER_FOLDER_ID,
    HEADER_USER_ID, PartUrlReq, ProxyReceipt, SimpleTargetReq, StartLargeReq,
};
use crate::models::{
    file_record::{FileRecord, NewFileRecord},
    multipart::PartRecord,
    upload::{MultipartTarget, ObjectLocation, UploadRequest, UploadTarget},
};
use crate::services::metadata::MetadataRecorder;
use async_trait::async_trait;
use bytes::Bytes;
use reqwest::{StatusCode, Url, header};
use serde::{Deserialize, de::DeserializeOwned};
use tracing::debug;

/// Backend operations the upload orchestrator depends on.
#[async_trait]
pub trait UploadApi: Send + Sync {
    async fn issue_simple_target(&self, request: &UploadRequest) -> UploadResult<UploadTarget>;

    async fn issue_multipart_target(&self, request: &UploadRequest)
    -> UploadResult<MultipartTarget>;

    async fn issue_part_target(&self, file_id: &str, part_number: u32)
    -> UploadResult<UploadTarget>;

    async fn finish(&self, file_id: &str, parts: &[PartRecord]) -> UploadResult<ObjectLocation>;

    /// Send the whole file through the server's relay endpoint.
    async fn proxy_upload(&self, request: &UploadRequest, bytes: Bytes)
    -> UploadResult<ProxyReceipt>;
}

/// Error body written by the server's `AppError`.
#[derive(Debug, Deserialize)]
struct WireError {
    #[serde(default)]
    error: String,
    kind: Option<ErrorKind>,
}

/// `UploadApi` and `MetadataRecorder` over HTTP, forwarding the caller's
/// bearer token on every call.
#[derive(Clone)]
pub struct HttpUploadApi {
    http: reqwest::Client,
    base_url: Url,
    token: String,
    proxy_ceiling: u64,
}

impl std::fmt::Debug for HttpUploadApi {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpUploadApi")
            .field("base_url", &self.base_url.as_str())
            .field("token", &"<redacted>")
            .finish()
    }
}

impl HttpUploadApi {
    pub fn new(base_url: &str, token: &str, proxy_ceiling: u64) -> UploadResult<Self> {
        let base_url = Url::parse(base_url)
            .map_err(|e| UploadError::Validation(format!("invalid server URL `{base_url}`: {e}")))?;
        Ok(Self {
            http: reqwest::Client::new(),
            base_url,
            token: token.to_string(),
            proxy_ceiling,
        })
    }

    fn url(&self, path: &str) -> UploadResult<Url> {
        self.base_url
            .join(path)
            .map_err(|e| UploadError::Validation(format!("failed to build API URL: {e}")))
    }

    /// Send `req` and decode a JSON answer, rebuilding structured errors.
    /// `size` is the payload size reported by size-carrying errors.
    async fn send_json<T: DeserializeOwned>(
        &self,
        req: reqwest::RequestBuilder,
        size: u64,
    ) -> UploadResult<T> {
        let response = req
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(|e| UploadError::Upstream(format!("request failed: {e}")))?;
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(self.decode_error(status, &body, size));
        }
        serde_json::from_str(&body)
            .map_err(|e| UploadError::Upstream(format!("unexpected response body: {e}")))
    }

    fn decode_error(&self, status: StatusCode, body: &str, size: u64) -> UploadError {
        let wire = serde_json::from_str::<WireError>(body).ok();
        match wire {
            Some(WireError {
                error,
                kind: Some(kind),
            }) => UploadError::from_wire(kind, error, size, self.proxy_ceiling),
            // Body-limit rejections come back as plain text.
            _ if status == StatusCode::PAYLOAD_TOO_LARGE => UploadError::PayloadTooLarge {
                size,
                limit: self.proxy_ceiling,
            },
            Some(WireError { error, kind: None }) if status == StatusCode::UNAUTHORIZED => {
                UploadError::AuthFailure(error)
            }
            Some(WireError { error, kind: None }) => {
                UploadError::Upstream(format!("API error ({status}): {error}"))
            }
            None => UploadError::Upstream(format!("API error ({status}): {body}")),
        }
    }
}

#[async_trait]
impl UploadApi for HttpUploadApi {
    async fn issue_simple_target(&self, request: &UploadRequest) -> UploadResult<UploadTarget> {
        let url = self.url("/api/uploads/target")?;
        let body = SimpleTargetReq {
            user_id: request.owner_id.clone(),
            file_name: request.file_name.clone(),
            mime_type: request.mime_type.clone(),
            folder_id: request.folder_id.clone(),
        };
        self.send_json(self.http.post(url).json(&body), request.size)
            .await
    }

    async fn issue_multipart_target(
        &self,
        request: &UploadRequest,
    ) -> UploadResult<MultipartTarget> {
        let url = self.url("/api/uploads/large/start")?;
        let body = StartLargeReq {
            user_id: request.owner_id.clone(),
            file_name: request.file_name.clone(),
            file_size: request.size,
            mime_type: request.mime_type.clone(),
            folder_id: request.folder_id.clone(),
        };
        self.send_json(self.http.post(url).json(&body), request.size)
            .await
    }

    async fn issue_part_target(
        &self,
        file_id: &str,
        part_number: u32,
    ) -> UploadResult<UploadTarget> {
        let url = self.url("/api/uploads/large/part-url")?;
        let body = PartUrlReq {
            file_id: file_id.to_string(),
            part_number: Some(part_number),
        };
        self.send_json(self.http.post(url).json(&body), 0).await
    }

    async fn finish(&self, file_id: &str, parts: &[PartRecord]) -> UploadResult<ObjectLocation> {
        let url = self.url("/api/uploads/large/finish")?;
        let body = FinishLargeReq {
            file_id: file_id.to_string(),
            parts: parts.to_vec(),
        };
        self.send_json(self.http.post(url).json(&body), 0).await
    }

    async fn proxy_upload(
        &self,
        request: &UploadRequest,
        bytes: Bytes,
    ) -> UploadResult<ProxyReceipt> {
        let url = self.url("/api/uploads/proxy")?;
        let mut req = self
            .http
            .post(url)
            .header(HEADER_USER_ID, &request.owner_id)
            .header(
                HEADER_FILE_NAME,
                urlencoding::encode(&request.file_name).into_owned(),
            )
            .header(HEADER_FILE_TYPE, &request.mime_type)
            .header(HEADER_FILE_SIZE, request.size.to_string())
            .header(header::CONTENT_TYPE, "application/octet-stream");
        if let Some(folder) = &request.folder_id {
            req = req.header(HEADER_FOLDER_ID, folder);
        }
        debug!(size = request.size, "relaying upload through server");
        self.send_json(req.body(bytes), request.size).await
    }
}

#[async_trait]
impl MetadataRecorder for HttpUploadApi {
    async fn insert(&self, record: NewFileRecord) -> UploadResult<FileRecord> {
        let path = record.file_path.clone();
        let url = self.url("/api/files")?;
        self.send_json(self.http.post(url).json(&record), record.file_size)
            .await
            .map_err(|err| match err {
                UploadError::Metadata { reason, .. } => UploadError::Metadata { path, reason },
                other => UploadError::Metadata {
                    path,
                    reason: other.to_string(),
                },
            })
    }
}
