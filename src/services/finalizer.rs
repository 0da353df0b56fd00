use crate::errors::{UploadError, UploadResult};
use crate::models::multipart::{PartRecord, validate_part_sequence};
use crate::models::upload::ObjectLocation;
use crate::services::authorizer::StorageAuthorizer;
use crate::services::backend::ObjectBackend;
use std::sync::Arc;
use tracing::{info, warn};

/// Assembles a multipart session from its ordered part hashes.
///
/// A rejected part list leaves the session unusable; there is no second
/// attempt at finishing it.
#[derive(Clone)]
pub struct MultipartFinalizer {
    backend: Arc<dyn ObjectBackend>,
    authorizer: StorageAuthorizer,
}

impl MultipartFinalizer {
    pub fn new(backend: Arc<dyn ObjectBackend>) -> Self {
        Self {
            authorizer: StorageAuthorizer::new(backend.clone()),
            backend,
        }
    }

    pub async fn finish(&self, file_id: &str, parts: &[PartRecord]) -> UploadResult<ObjectLocation> {
        if file_id.trim().is_empty() {
            return Err(UploadError::Validation("file id is required".into()));
        }
        if let Err(err) = validate_part_sequence(parts) {
            warn!(file_id, error = %err, "rejecting part list");
            if let Err(mark_err) = self.backend.mark_session_unusable(file_id).await {
                warn!(file_id, error = %mark_err, "could not mark session unusable");
            }
            return Err(err);
        }

        let auth = self.authorizer.authorize().await?;
        let assembled = self
            .backend
            .finish_large_file(&auth, file_id, parts)
            .await?;

        info!(
            file_id,
            path = %assembled.file_name,
            parts = parts.len(),
            "finished multipart upload"
        );
        Ok(ObjectLocation {
            public_url: self.backend.public_url(&assembled.file_name),
            file_id: assembled.file_id,
            path: assembled.file_name,
            content_length: assembled.content_length,
        })
    }
}
