//! Represents multipart upload sessions and parts.

use crate::errors::{UploadError, UploadResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

pub const SESSION_OPEN: &str = "open";
/// Claimed by a single `finish` call while its parts are concatenated.
pub const SESSION_FINISHING: &str = "finishing";
pub const SESSION_FINISHED: &str = "finished";
pub const SESSION_FAILED: &str = "failed";

/// A multipart session row kept by the local backend.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct MultipartSessionRow {
    /// Session id handed back to the client as `fileId`.
    pub id: String,

    /// Canonical storage path the assembled object will live at.
    pub canonical_path: String,

    /// Content type declared when the session was opened.
    pub content_type: String,

    /// One of `open`, `finishing`, `finished`, `failed`.
    pub state: String,

    /// Timestamp when the session was opened.
    pub created_at: DateTime<Utc>,
}

impl MultipartSessionRow {
    pub fn is_open(&self) -> bool {
        self.state == SESSION_OPEN
    }
}

/// A single part received by the local backend.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct MultipartPartRow {
    pub session_id: String,

    /// Part number (1-based).
    pub part_number: i64,

    /// SHA-1 the part was verified against on arrival.
    pub content_hash: String,

    pub size_bytes: i64,

    pub uploaded_at: DateTime<Utc>,
}

/// Index and hash of one uploaded part, as submitted to `finish`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PartRecord {
    pub part_number: u32,
    pub sha1: String,
}

/// Check that `parts` is exactly `1..=N` in ascending order with a real hash each.
pub fn validate_part_sequence(parts: &[PartRecord]) -> UploadResult<()> {
    if parts.is_empty() {
        return Err(UploadError::Assembly("no parts to assemble".into()));
    }
    for (position, part) in parts.iter().enumerate() {
        let expected = position as u32 + 1;
        if part.part_number != expected {
            return Err(UploadError::Assembly(format!(
                "part {} found at position {}, expected part {}",
                part.part_number, expected, expected
            )));
        }
        if part.sha1.len() != 40 || !part.sha1.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(UploadError::Assembly(format!(
                "part {} has no verifiable SHA-1",
                part.part_number
            )));
        }
    }
    Ok(())
}

/// Client-side view of an open session: an append-only, strictly ordered list
/// of part hashes that is consumed once by finalization.
#[derive(Debug)]
pub struct MultipartSession {
    file_id: String,
    upload_path: String,
    parts: Vec<PartRecord>,
}

impl MultipartSession {
    pub fn new(file_id: impl Into<String>, upload_path: impl Into<String>) -> Self {
        Self {
            file_id: file_id.into(),
            upload_path: upload_path.into(),
            parts: Vec::new(),
        }
    }

    pub fn file_id(&self) -> &str {
        &self.file_id
    }

    pub fn upload_path(&self) -> &str {
        &self.upload_path
    }

    /// Index the next appended part must carry.
    pub fn next_part_number(&self) -> u32 {
        self.parts.len() as u32 + 1
    }

    pub fn parts(&self) -> &[PartRecord] {
        &self.parts
    }

    pub fn push(&mut self, part_number: u32, sha1: String) -> UploadResult<()> {
        if part_number != self.next_part_number() {
            return Err(UploadError::Assembly(format!(
                "part {part_number} appended out of order, expected {}",
                self.next_part_number()
            )));
        }
        self.parts.push(PartRecord { part_number, sha1 });
        Ok(())
    }

    /// Consume the session, yielding its id and ordered part list.
    pub fn into_parts(self) -> (String, Vec<PartRecord>) {
        (self.file_id, self.parts)
    }
}
