//! Objects that reached storage but could not be recorded.

use crate::models::file_record::NewFileRecord;
use crate::services::metadata::MetadataRecorder;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};

/// A stored object with no FileRecord.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrphanedUpload {
    pub record: NewFileRecord,
    pub reason: String,
    pub detected_at: DateTime<Utc>,
}

/// Receives every orphan the orchestrator produces.
#[async_trait]
pub trait ReconciliationHook: Send + Sync {
    async fn orphaned(&self, orphan: OrphanedUpload);
}

/// Outcome of [`OrphanQueue::retry_pending`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RetryReport {
    pub recorded: usize,
    pub still_pending: usize,
}

/// Default hook: warns and keeps orphans in memory until they can be recorded.
#[derive(Debug, Clone, Default)]
pub struct OrphanQueue {
    pending: Arc<Mutex<Vec<OrphanedUpload>>>,
}

impl OrphanQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn pending(&self) -> Vec<OrphanedUpload> {
        self.pending.lock().await.clone()
    }

    pub async fn len(&self) -> usize {
        self.pending.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.pending.lock().await.is_empty()
    }

    /// Re-attempt every queued insert; failures go back on the queue.
    pub async fn retry_pending(&self, recorder: &dyn MetadataRecorder) -> RetryReport {
        let queued = std::mem::take(&mut *self.pending.lock().await);
        let mut report = RetryReport::default();
        let mut failed = Vec::new();

        for mut orphan in queued {
            match recorder.insert(orphan.record.clone()).await {
                Ok(row) => {
                    info!(path = %row.file_path, "recorded orphaned upload");
                    report.recorded += 1;
                }
                Err(err) => {
                    orphan.reason = err.to_string();
                    failed.push(orphan);
                }
            }
        }

        report.still_pending = failed.len();
        self.pending.lock().await.extend(failed);
        report
    }
}

#[async_trait]
impl ReconciliationHook for OrphanQueue {
    async fn orphaned(&self, orphan: OrphanedUpload) {
        warn!(
            path = %orphan.record.file_path,
            owner = %orphan.record.user_id,
            reason = %orphan.reason,
            "object stored without a file record"
        );
        self.pending.lock().await.push(orphan);
    }
}
