//! Issues write targets with fresh, collision-resistant canonical paths.

use crate::errors::{UploadError, UploadResult};
use crate::models::upload::{
    DEFAULT_CONTENT_TYPE, MultipartTarget, UploadTarget, ensure_file_name, ensure_folder_id,
    ensure_owner_id,
};
use crate::services::authorizer::StorageAuthorizer;
use crate::services::backend::ObjectBackend;
use chrono::{Duration, Utc};
use std::sync::{
    Arc,
    atomic::{AtomicI64, Ordering},
};
use tracing::info;

/// Millisecond stamp that never repeats within the process, even when two
/// targets are issued in the same millisecond.
#[derive(Debug, Default)]
pub struct Disambiguator {
    last: AtomicI64,
}

impl Disambiguator {
    pub fn next(&self) -> i64 {
        let now = Utc::now().timestamp_millis();
        let mut current = self.last.load(Ordering::Relaxed);
        loop {
            let candidate = now.max(current + 1);
            match self.last.compare_exchange_weak(
                current,
                candidate,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return candidate,
                Err(observed) => current = observed,
            }
        }
    }
}

/// `{owner}/{folder or "root"}/{stamp}-{file name}`
pub fn canonical_path(owner_id: &str, folder_id: Option<&str>, stamp: i64, file_name: &str) -> String {
    let folder = folder_id.filter(|f| !f.is_empty()).unwrap_or("root");
    format!("{owner_id}/{folder}/{stamp}-{file_name}")
}

#[derive(Clone)]
pub struct TargetIssuer {
    backend: Arc<dyn ObjectBackend>,
    authorizer: StorageAuthorizer,
    disambiguator: Arc<Disambiguator>,
    credential_ttl: Duration,
}

impl TargetIssuer {
    pub fn new(backend: Arc<dyn ObjectBackend>, credential_ttl: Duration) -> Self {
        Self {
            authorizer: StorageAuthorizer::new(backend.clone()),
            backend,
            disambiguator: Arc::new(Disambiguator::default()),
            credential_ttl,
        }
    }

    fn mint_path(
        &self,
        owner_id: &str,
        file_name: &str,
        folder_id: Option<&str>,
    ) -> UploadResult<String> {
        ensure_owner_id(owner_id)?;
        ensure_file_name(file_name)?;
        ensure_folder_id(folder_id)?;
        Ok(canonical_path(
            owner_id,
            folder_id,
            self.disambiguator.next(),
            file_name,
        ))
    }

    /// Single-shot target for a whole file.
    pub async fn issue_simple_target(
        &self,
        owner_id: &str,
        file_name: &str,
        mime_type: &str,
        folder_id: Option<&str>,
    ) -> UploadResult<UploadTarget> {
        let upload_path = self.mint_path(owner_id, file_name, folder_id)?;
        let auth = self.authorizer.authorize().await?;
        let endpoint = self.backend.get_upload_url(&auth).await?;

        info!(path = %upload_path, mime_type, "issued simple upload target");
        Ok(UploadTarget {
            upload_url: endpoint.upload_url,
            authorization_token: endpoint.authorization_token,
            upload_path,
            expires_at: (Utc::now() + self.credential_ttl).min(auth.expires_at),
        })
    }

    /// Open a multipart session for a large file.
    pub async fn issue_multipart_target(
        &self,
        owner_id: &str,
        file_name: &str,
        mime_type: &str,
        file_size: u64,
        folder_id: Option<&str>,
    ) -> UploadResult<MultipartTarget> {
        let upload_path = self.mint_path(owner_id, file_name, folder_id)?;
        let auth = self.authorizer.authorize().await?;
        let content_type = if mime_type.is_empty() {
            DEFAULT_CONTENT_TYPE
        } else {
            mime_type
        };
        let file_id = self
            .backend
            .start_large_file(&auth, &upload_path, content_type)
            .await
            .map_err(|err| match err {
                UploadError::AuthFailure(_) | UploadError::Validation(_) => err,
                other => UploadError::Upstream(other.to_string()),
            })?;

        info!(path = %upload_path, file_id = %file_id, file_size, "opened multipart target");
        Ok(MultipartTarget {
            file_id,
            upload_path,
        })
    }

    /// Fresh endpoint for the next part of an open session.
    pub async fn issue_part_target(&self, file_id: &str) -> UploadResult<UploadTarget> {
        if file_id.trim().is_empty() {
            return Err(UploadError::Validation("file id is required".into()));
        }
        let auth = self.authorizer.authorize().await?;
        let endpoint = self.backend.get_upload_part_url(&auth, file_id).await?;
        Ok(UploadTarget {
            upload_url: endpoint.upload_url,
            authorization_token: endpoint.authorization_token,
            upload_path: String::new(),
            expires_at: (Utc::now() + self.credential_ttl).min(auth.expires_at),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_defaults_to_root_folder() {
        assert_eq!(canonical_path("u1", None, 42, "a.txt"), "u1/root/42-a.txt");
        assert_eq!(canonical_path("u1", Some(""), 42, "a.txt"), "u1/root/42-a.txt");
        assert_eq!(canonical_path("u1", Some("f9"), 42, "a.txt"), "u1/f9/42-a.txt");
    }

    #[test]
    fn disambiguator_never_repeats() {
        let d = Disambiguator::default();
        let mut previous = d.next();
        for _ in 0..1000 {
            let next = d.next();
            assert!(next > previous);
            previous = next;
        }
    }
}
