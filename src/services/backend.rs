//! Object store abstraction shared by the issuer, finalizer and relay.

use crate::errors::UploadResult;
use crate::models::multipart::PartRecord;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// A short-lived account credential.
#[derive(Clone)]
pub struct Authorization {
    pub api_url: String,
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

impl std::fmt::Debug for Authorization {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Authorization")
            .field("api_url", &self.api_url)
            .field("token", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// An endpoint that accepts raw bytes, with the credential it expects.
#[derive(Debug, Clone)]
pub struct UploadEndpoint {
    pub upload_url: String,
    pub authorization_token: String,
}

/// What the store reports after assembling a large file.
#[derive(Debug, Clone)]
pub struct AssembledObject {
    pub file_id: String,
    pub file_name: String,
    pub content_length: Option<u64>,
}

#[async_trait]
pub trait ObjectBackend: Send + Sync + 'static {
    /// Obtain a fresh account credential. Never cached by callers.
    async fn authorize(&self) -> UploadResult<Authorization>;

    /// Endpoint for a single-shot whole-file upload.
    async fn get_upload_url(&self, auth: &Authorization) -> UploadResult<UploadEndpoint>;

    /// Open a large-file session and return its id.
    async fn start_large_file(
        &self,
        auth: &Authorization,
        file_name: &str,
        content_type: &str,
    ) -> UploadResult<String>;

    /// Endpoint for uploading parts of an open session.
    async fn get_upload_part_url(
        &self,
        auth: &Authorization,
        file_id: &str,
    ) -> UploadResult<UploadEndpoint>;

    /// Assemble the uploaded parts in the given order.
    async fn finish_large_file(
        &self,
        auth: &Authorization,
        file_id: &str,
        parts: &[PartRecord],
    ) -> UploadResult<AssembledObject>;

    /// Record that a session can no longer be finished. Stores that enforce
    /// this themselves leave the default in place.
    async fn mark_session_unusable(&self, _file_id: &str) -> UploadResult<()> {
        Ok(())
    }

    /// Public read URL for a canonical path.
    fn public_url(&self, path: &str) -> String;

    fn backend_name(&self) -> &'static str;
}
