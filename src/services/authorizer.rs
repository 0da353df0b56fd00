use crate::errors::UploadResult;
use crate::services::backend::{Authorization, ObjectBackend};
use std::sync::Arc;
use tracing::{debug, warn};

/// Obtains a fresh store credential for every logical operation.
///
/// Nothing is cached and nothing is retried: a failure goes straight back to
/// the caller, which decides whether the whole upload is lost.
#[derive(Clone)]
pub struct StorageAuthorizer {
    backend: Arc<dyn ObjectBackend>,
}

impl StorageAuthorizer {
    pub fn new(backend: Arc<dyn ObjectBackend>) -> Self {
        Self { backend }
    }

    pub async fn authorize(&self) -> UploadResult<Authorization> {
        match self.backend.authorize().await {
            Ok(auth) => {
                debug!(backend = self.backend.backend_name(), api_url = %auth.api_url, "authorized");
                Ok(auth)
            }
            Err(err) => {
                warn!(backend = self.backend.backend_name(), error = %err, "authorization failed");
                Err(err)
            }
        }
    }
}
