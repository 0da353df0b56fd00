//! Inputs and write targets of a single upload.

use crate::errors::{UploadError, UploadResult};
use crate::policy::HASH_SKIP_SENTINEL;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

pub const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";
const MAX_FILE_NAME_LEN: usize = 255;

/// Immutable description of one file the caller wants stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadRequest {
    pub owner_id: String,
    pub file_name: String,
    pub mime_type: String,
    pub size: u64,
    /// `None` places the file at the owner's root.
    pub folder_id: Option<String>,
}

impl UploadRequest {
    pub fn new(
        owner_id: impl Into<String>,
        file_name: impl Into<String>,
        mime_type: impl Into<String>,
        size: u64,
        folder_id: Option<String>,
    ) -> Self {
        let mime_type = mime_type.into();
        Self {
            owner_id: owner_id.into(),
            file_name: file_name.into(),
            mime_type: if mime_type.trim().is_empty() {
                DEFAULT_CONTENT_TYPE.to_string()
            } else {
                mime_type
            },
            size,
            folder_id: folder_id.filter(|f| !f.is_empty()),
        }
    }

    pub fn validate(&self) -> UploadResult<()> {
        ensure_owner_id(&self.owner_id)?;
        ensure_folder_id(self.folder_id.as_deref())?;
        ensure_file_name(&self.file_name)
    }
}

pub fn ensure_owner_id(owner_id: &str) -> UploadResult<()> {
    if owner_id.trim().is_empty() {
        return Err(UploadError::Validation("owner id is required".into()));
    }
    ensure_segment("owner id", owner_id)
}

pub fn ensure_folder_id(folder_id: Option<&str>) -> UploadResult<()> {
    match folder_id {
        Some(folder) => ensure_segment("folder id", folder),
        None => Ok(()),
    }
}

fn ensure_segment(label: &str, value: &str) -> UploadResult<()> {
    if value.contains('/') || value.contains('\\') || value == "." || value == ".." {
        return Err(UploadError::Validation(format!(
            "{label} must be a single path segment"
        )));
    }
    Ok(())
}

/// File names become the last segment of the canonical path, so they must not
/// be able to climb out of the owner/folder prefix.
pub fn ensure_file_name(file_name: &str) -> UploadResult<()> {
    if file_name.trim().is_empty() {
        return Err(UploadError::Validation("file name is required".into()));
    }
    if file_name.len() > MAX_FILE_NAME_LEN {
        return Err(UploadError::Validation(format!(
            "file name longer than {MAX_FILE_NAME_LEN} bytes"
        )));
    }
    if file_name == "." || file_name == ".." {
        return Err(UploadError::Validation(
            "file name must not be `.` or `..`".into(),
        ));
    }
    if file_name
        .bytes()
        .any(|b| b.is_ascii_control() || b == b'/' || b == b'\\')
    {
        return Err(UploadError::Validation(
            "file name must not contain separators or control characters".into(),
        ));
    }
    Ok(())
}

/// A storage-scoped write target: where to send bytes and with which credential.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadTarget {
    pub upload_url: String,
    pub authorization_token: String,
    /// Canonical storage path; empty for part targets, which address a session.
    #[serde(default)]
    pub upload_path: String,
    pub expires_at: DateTime<Utc>,
}

/// Result of opening a multipart session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MultipartTarget {
    pub file_id: String,
    pub upload_path: String,
}

/// Where a finished object can be read from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectLocation {
    pub file_id: String,
    pub path: String,
    pub content_length: Option<u64>,
    pub public_url: String,
}

/// Digest sent alongside a byte range.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ContentHash {
    Sha1(String),
    Unverified,
}

impl ContentHash {
    /// Header value for `X-Bz-Content-Sha1`.
    pub fn header_value(&self) -> &str {
        match self {
            ContentHash::Sha1(hex) => hex,
            ContentHash::Unverified => HASH_SKIP_SENTINEL,
        }
    }

    pub fn parse(value: &str) -> UploadResult<Self> {
        if value == HASH_SKIP_SENTINEL {
            return Ok(ContentHash::Unverified);
        }
        if value.len() == 40 && value.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Ok(ContentHash::Sha1(value.to_ascii_lowercase()));
        }
        Err(UploadError::Validation(format!(
            "`{value}` is not a SHA-1 hex digest"
        )))
    }

    pub fn as_sha1(&self) -> Option<&str> {
        match self {
            ContentHash::Sha1(hex) => Some(hex),
            ContentHash::Unverified => None,
        }
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.header_value())
    }
}

/// SHA-1 of `bytes` as lowercase hex.
pub fn sha1_hex(bytes: &[u8]) -> String {
    use sha1::{Digest, Sha1};
    hex::encode(Sha1::digest(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_mime_type_defaults_to_octet_stream() {
        let req = UploadRequest::new("u1", "a.bin", "", 3, Some(String::new()));
        assert_eq!(req.mime_type, DEFAULT_CONTENT_TYPE);
        assert_eq!(req.folder_id, None);
    }

    #[test]
    fn rejects_missing_owner_and_name() {
        assert!(UploadRequest::new("", "a", "text/plain", 1, None).validate().is_err());
        assert!(UploadRequest::new("u", " ", "text/plain", 1, None).validate().is_err());
    }

    #[test]
    fn rejects_names_that_escape_the_prefix() {
        for name in ["../x", "a/b", "a\\b", "..", "bad\nname"] {
            assert!(ensure_file_name(name).is_err(), "{name} accepted");
        }
        assert!(ensure_file_name("holiday photo (1).jpg").is_ok());
    }

    #[test]
    fn repeated_dots_inside_a_name_are_fine() {
        for name in ["a..b.txt", "Wait...png", "v1..2.tar.gz", "..hidden"] {
            assert!(ensure_file_name(name).is_ok(), "{name} rejected");
        }
        assert!(ensure_file_name(".").is_err());
        assert!(ensure_folder_id(Some("q1..q2")).is_ok());
        assert!(ensure_folder_id(Some("..")).is_err());
        assert!(ensure_owner_id("..").is_err());
    }

    #[test]
    fn parses_sentinel_and_digest() {
        assert_eq!(
            ContentHash::parse("do_not_verify").unwrap(),
            ContentHash::Unverified
        );
        let digest = sha1_hex(b"abc");
        assert_eq!(digest, "a9993e364706816aba3e25717850c26c9cd0d89d");
        assert_eq!(
            ContentHash::parse(&digest.to_uppercase()).unwrap(),
            ContentHash::Sha1(digest)
        );
        assert!(ContentHash::parse("abc").is_err());
    }
}
