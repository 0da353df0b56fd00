//! Client-side orchestration: picks a strategy per file and drives the
//! relay's endpoints and the storage endpoints it hands out.

pub mod api;
pub mod reconcile;
pub mod selector;
pub mod source;

pub use api::{HttpUploadApi, UploadApi};
pub use reconcile::{OrphanQueue, OrphanedUpload, ReconciliationHook};
pub use selector::{Progress, Strategy, UploadOrchestrator, UploadOutcome, UploadSession, UploadState};
pub use source::{ByteSource, FileSource};
