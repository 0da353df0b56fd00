//! Shared state handed to every HTTP handler.

use crate::policy::UploadPolicy;
use crate::services::{
    backend::ObjectBackend, finalizer::MultipartFinalizer, local_backend::LocalBackend,
    metadata::MetadataRecorder, part_uploader::PartUploader, target_issuer::TargetIssuer,
};
use sqlx::SqlitePool;
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub db: SqlitePool,
    pub policy: UploadPolicy,
    pub backend: Arc<dyn ObjectBackend>,
    pub issuer: TargetIssuer,
    pub finalizer: MultipartFinalizer,
    pub recorder: Arc<dyn MetadataRecorder>,
    /// Uploader the relay endpoint uses to push bytes into the store.
    pub relay: Arc<dyn PartUploader>,
    /// Present when this server is also the object store.
    pub local: Option<LocalBackend>,
}

impl AppState {
    /// State backed by the on-disk store served by this process.
    pub fn with_local_backend(
        db: SqlitePool,
        local: LocalBackend,
        recorder: Arc<dyn MetadataRecorder>,
        policy: UploadPolicy,
    ) -> Self {
        let backend: Arc<dyn ObjectBackend> = Arc::new(local.clone());
        Self {
            db,
            policy,
            issuer: TargetIssuer::new(backend.clone(), policy.credential_ttl()),
            finalizer: MultipartFinalizer::new(backend.clone()),
            backend,
            recorder,
            relay: Arc::new(local.clone()),
            local: Some(local),
        }
    }

    /// State backed by a remote store reached over HTTP.
    pub fn with_remote_backend(
        db: SqlitePool,
        backend: Arc<dyn ObjectBackend>,
        relay: Arc<dyn PartUploader>,
        recorder: Arc<dyn MetadataRecorder>,
        policy: UploadPolicy,
    ) -> Self {
        Self {
            db,
            policy,
            issuer: TargetIssuer::new(backend.clone(), policy.credential_ttl()),
            finalizer: MultipartFinalizer::new(backend.clone()),
            backend,
            recorder,
            relay,
            local: None,
        }
    }
}
