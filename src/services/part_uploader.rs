//! Transfer of one byte range to a storage-assigned endpoint.

use crate::errors::{UploadError, UploadResult};
use crate::models::upload::{ContentHash, UploadTarget, sha1_hex};
use async_trait::async_trait;
use bytes::Bytes;
use reqwest::{StatusCode, header};
use tracing::{debug, warn};

pub const HEADER_FILE_NAME: &str = "X-Bz-File-Name";
pub const HEADER_PART_NUMBER: &str = "X-Bz-Part-Number";
pub const HEADER_CONTENT_SHA1: &str = "X-Bz-Content-Sha1";

#[async_trait]
pub trait PartUploader: Send + Sync {
    /// Send `bytes` to `target`. `part_number` is `None` for a whole-file
    /// upload and `Some(1..)` for a multipart part. Returns the hash that was
    /// declared to the store.
    async fn upload_part(
        &self,
        target: &UploadTarget,
        part_number: Option<u32>,
        bytes: Bytes,
        content_type: &str,
    ) -> UploadResult<ContentHash>;
}

/// Pick the hash to declare for a transfer. Only whole-file uploads may skip
/// verification; every part carries a real digest.
pub fn declared_hash(part_number: Option<u32>, bytes: &[u8], verify_whole_file: bool) -> ContentHash {
    match part_number {
        None if !verify_whole_file => ContentHash::Unverified,
        _ => ContentHash::Sha1(sha1_hex(bytes)),
    }
}

/// Uploads over HTTP using the B2 upload headers.
#[derive(Clone, Debug)]
pub struct HttpPartUploader {
    http: reqwest::Client,
    /// Payload ceiling of the transport, if it has one.
    max_payload: Option<u64>,
    verify_whole_file: bool,
}

impl HttpPartUploader {
    pub fn new(verify_whole_file: bool) -> Self {
        Self {
            http: reqwest::Client::new(),
            max_payload: None,
            verify_whole_file,
        }
    }

    pub fn with_max_payload(mut self, limit: u64) -> Self {
        self.max_payload = Some(limit);
        self
    }
}

#[async_trait]
impl PartUploader for HttpPartUploader {
    async fn upload_part(
        &self,
        target: &UploadTarget,
        part_number: Option<u32>,
        bytes: Bytes,
        content_type: &str,
    ) -> UploadResult<ContentHash> {
        let size = bytes.len() as u64;
        if let Some(limit) = self.max_payload {
            if size > limit {
                return Err(UploadError::PayloadTooLarge { size, limit });
            }
        }

        let hash = declared_hash(part_number, &bytes, self.verify_whole_file);
        let mut request = self
            .http
            .post(&target.upload_url)
            .header(header::AUTHORIZATION, &target.authorization_token)
            .header(header::CONTENT_LENGTH, size)
            .header(HEADER_CONTENT_SHA1, hash.header_value());

        request = match part_number {
            Some(n) => request.header(HEADER_PART_NUMBER, n),
            None => request
                .header(HEADER_FILE_NAME, urlencoding::encode(&target.upload_path).as_ref())
                .header(header::CONTENT_TYPE, content_type),
        };

        debug!(part = ?part_number, size, url = %target.upload_url, "sending bytes");
        let response = request
            .body(bytes)
            .send()
            .await
            .map_err(|err| UploadError::Transfer(format!("network failure: {err}")))?;

        let status = response.status();
        if status == StatusCode::PAYLOAD_TOO_LARGE {
            warn!(part = ?part_number, size, "store refused payload size");
            return Err(match self.max_payload {
                Some(limit) => UploadError::PayloadTooLarge { size, limit },
                // the store's own limit is unknown here
                None => UploadError::Transfer(format!(
                    "store responded {status} for a {size} byte payload"
                )),
            });
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(part = ?part_number, %status, "store rejected bytes");
            return Err(UploadError::Transfer(format!(
                "store responded {status}: {body}"
            )));
        }

        Ok(hash)
    }
}
