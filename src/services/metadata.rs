//! Metadata Recorder: persists one FileRecord per completed upload.

use crate::errors::{UploadError, UploadResult};
use crate::models::file_record::{FileRecord, NewFileRecord};
use async_trait::async_trait;
use chrono::Utc;
use sqlx::SqlitePool;
use tracing::{debug, error};
use uuid::Uuid;

#[async_trait]
pub trait MetadataRecorder: Send + Sync {
    /// Insert the record of an object already confirmed present in storage.
    async fn insert(&self, record: NewFileRecord) -> UploadResult<FileRecord>;
}

pub fn validate_new_record(record: &NewFileRecord) -> UploadResult<()> {
    if record.user_id.trim().is_empty()
        || record.file_name.trim().is_empty()
        || record.file_path.trim().is_empty()
    {
        return Err(UploadError::Validation(
            "userId, fileName and filePath are required".into(),
        ));
    }
    Ok(())
}

/// Records files in the `files` table.
#[derive(Clone, Debug)]
pub struct SqliteMetadataRecorder {
    db: SqlitePool,
}

impl SqliteMetadataRecorder {
    pub fn new(db: SqlitePool) -> Self {
        Self { db }
    }

    /// Look up the record for a storage path.
    pub async fn find_by_path(&self, file_path: &str) -> UploadResult<Option<FileRecord>> {
        let row = sqlx::query_as::<_, FileRecord>(
            "SELECT id, uploaded_by, file_name, file_path, file_type, file_size, folder_id, created_at
             FROM files WHERE file_path = ?",
        )
        .bind(file_path)
        .fetch_optional(&self.db)
        .await?;
        Ok(row)
    }

    pub async fn count(&self) -> UploadResult<i64> {
        let count = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM files")
            .fetch_one(&self.db)
            .await?;
        Ok(count)
    }
}

#[async_trait]
impl MetadataRecorder for SqliteMetadataRecorder {
    async fn insert(&self, record: NewFileRecord) -> UploadResult<FileRecord> {
        validate_new_record(&record)?;
        let file_size = i64::try_from(record.file_size).map_err(|_| {
            UploadError::Validation(format!("file size {} out of range", record.file_size))
        })?;

        let inserted = sqlx::query_as::<_, FileRecord>(
            r#"
            INSERT INTO files (
                id, uploaded_by, file_name, file_path, file_type, file_size, folder_id, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            RETURNING id, uploaded_by, file_name, file_path, file_type, file_size, folder_id, created_at
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&record.user_id)
        .bind(&record.file_name)
        .bind(&record.file_path)
        .bind(&record.file_type)
        .bind(file_size)
        .bind(record.folder_id.as_deref())
        .bind(Utc::now())
        .fetch_one(&self.db)
        .await;

        match inserted {
            Ok(row) => {
                debug!(path = %row.file_path, "recorded file");
                Ok(row)
            }
            Err(err) => {
                error!(path = %record.file_path, error = %err, "failed to record file");
                Err(UploadError::Metadata {
                    path: record.file_path,
                    reason: if is_unique_violation(&err) {
                        "a record for this path already exists".into()
                    } else {
                        err.to_string()
                    },
                })
            }
        }
    }
}

/// Return true if SQLx error indicates a unique constraint violation.
fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Database(db_err) if db_err.message().to_ascii_lowercase().contains("unique")
    )
}
