//! The durable record of a completed upload.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// A file that is fully present in storage.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct FileRecord {
    /// Internal UUID for DB indexing.
    pub id: Uuid,

    /// Identity of the user the upload is attributed to.
    pub uploaded_by: String,

    /// Original display name of the file.
    pub file_name: String,

    /// Canonical storage path.
    pub file_path: String,

    pub file_type: String,

    /// Size in bytes.
    pub file_size: i64,

    /// Destination folder, `None` for the owner's root.
    pub folder_id: Option<String>,

    pub created_at: DateTime<Utc>,
}

/// Fields supplied by the orchestrator when recording a finished upload.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct NewFileRecord {
    pub user_id: String,
    pub file_name: String,
    pub file_path: String,
    pub file_type: String,
    pub file_size: u64,
    pub folder_id: Option<String>,
}
