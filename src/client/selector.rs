//! Upload Strategy Selector.
//!
//! One [`UploadSession`] drives one file from `Idle` to `Complete` (or
//! `Failed`). The strategy for each attempt comes from [`STRATEGY_TABLE`],
//! evaluated top-down against the file size and the attempts made so far:
//!
//! | order | strategy  | guard                                                        |
//! |-------|-----------|--------------------------------------------------------------|
//! | 1     | Multipart | first attempt, size >= multipart threshold                   |
//! | 2     | Direct    | first attempt, size < multipart threshold                    |
//! | 3     | Proxied   | Direct failed in transfer, size < relay ceiling, not yet tried |
//!
//! A failed attempt falls back only if the table yields another strategy.

use crate::client::{
    api::UploadApi,
    reconcile::{OrphanedUpload, ReconciliationHook},
    source::ByteSource,
};
use crate::errors::{ErrorKind, UploadError, UploadResult};
use crate::models::{
    file_record::{FileRecord, NewFileRecord},
    multipart::MultipartSession,
    upload::UploadRequest,
};
use crate::policy::UploadPolicy;
use crate::services::{metadata::MetadataRecorder, part_uploader::PartUploader};
use bytes::Bytes;
use chrono::Utc;
use serde::Serialize;
use std::{fmt, sync::Arc};
use tokio::sync::watch;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    /// Client sends the bytes straight to the storage endpoint.
    Direct,
    /// Bytes go through the relay endpoint of the server.
    Proxied,
    /// Client splits the file into parts and assembles them in storage.
    Multipart,
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Strategy::Direct => "direct",
            Strategy::Proxied => "proxied",
            Strategy::Multipart => "multipart",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "state", content = "detail")]
pub enum UploadState {
    Idle,
    Preparing,
    Transferring(Strategy),
    Finalizing(Strategy),
    Complete,
    FallingBack,
    Failed(ErrorKind),
}

impl UploadState {
    /// Whether `self -> next` is an edge of the state machine.
    pub fn can_transition_to(&self, next: &UploadState) -> bool {
        use UploadState::*;
        match (self, next) {
            (Complete, _) => false,
            (_, Failed(_)) => true,
            (Idle, Preparing) => true,
            (Preparing, Transferring(_)) => true,
            (Transferring(a), Finalizing(b)) => a == b,
            (Finalizing(_), Complete) => true,
            (Failed(_), FallingBack) => true,
            (FallingBack, Preparing) => true,
            _ => false,
        }
    }
}

/// One finished attempt and how it failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Attempt {
    pub strategy: Strategy,
    pub failure: ErrorKind,
}

/// What a rule guard gets to look at.
#[derive(Debug, Clone, Copy)]
pub struct RuleInput<'a> {
    pub size: u64,
    pub policy: &'a UploadPolicy,
    pub attempts: &'a [Attempt],
}

pub struct StrategyRule {
    pub strategy: Strategy,
    pub guard: fn(&RuleInput<'_>) -> bool,
}

fn multipart_guard(input: &RuleInput<'_>) -> bool {
    input.attempts.is_empty() && input.size >= input.policy.multipart_threshold
}

fn direct_guard(input: &RuleInput<'_>) -> bool {
    input.attempts.is_empty() && input.size < input.policy.multipart_threshold
}

fn proxied_guard(input: &RuleInput<'_>) -> bool {
    let direct_failed_in_transfer = matches!(
        input.attempts.last(),
        Some(Attempt {
            strategy: Strategy::Direct,
            failure: ErrorKind::Transfer,
        })
    );
    direct_failed_in_transfer
        && input.size < input.policy.proxy_ceiling
        && !input
            .attempts
            .iter()
            .any(|a| a.strategy == Strategy::Proxied)
}

pub const STRATEGY_TABLE: [StrategyRule; 3] = [
    StrategyRule {
        strategy: Strategy::Multipart,
        guard: multipart_guard,
    },
    StrategyRule {
        strategy: Strategy::Direct,
        guard: direct_guard,
    },
    StrategyRule {
        strategy: Strategy::Proxied,
        guard: proxied_guard,
    },
];

/// First strategy whose guard holds, if any.
pub fn choose_strategy(size: u64, policy: &UploadPolicy, attempts: &[Attempt]) -> Option<Strategy> {
    let input = RuleInput {
        size,
        policy,
        attempts,
    };
    STRATEGY_TABLE
        .iter()
        .find(|rule| (rule.guard)(&input))
        .map(|rule| rule.strategy)
}

/// Only a transfer failure of a direct upload may move on to another strategy.
fn fallback_eligible(attempt: &Attempt) -> bool {
    attempt.strategy == Strategy::Direct && attempt.failure == ErrorKind::Transfer
}

/// Advisory progress snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Progress {
    pub state: UploadState,
    pub bytes_sent: u64,
    pub total: u64,
}

/// Result of a completed session.
#[derive(Debug, Clone)]
pub struct UploadOutcome {
    pub strategy: Strategy,
    pub record: FileRecord,
}

/// Collaborators shared by every session. Cheap to clone.
#[derive(Clone)]
pub struct UploadOrchestrator {
    api: Arc<dyn UploadApi>,
    uploader: Arc<dyn PartUploader>,
    recorder: Arc<dyn MetadataRecorder>,
    hook: Arc<dyn ReconciliationHook>,
    policy: UploadPolicy,
}

impl UploadOrchestrator {
    pub fn new(
        api: Arc<dyn UploadApi>,
        uploader: Arc<dyn PartUploader>,
        recorder: Arc<dyn MetadataRecorder>,
        hook: Arc<dyn ReconciliationHook>,
        policy: UploadPolicy,
    ) -> Self {
        Self {
            api,
            uploader,
            recorder,
            hook,
            policy,
        }
    }

    pub fn policy(&self) -> &UploadPolicy {
        &self.policy
    }

    /// Start a session for `request`. Nothing is sent until [`UploadSession::run`].
    pub fn session(&self, request: UploadRequest) -> UploadSession {
        let (progress, _) = watch::channel(Progress {
            state: UploadState::Idle,
            bytes_sent: 0,
            total: request.size,
        });
        UploadSession {
            orchestrator: self.clone(),
            request,
            state: UploadState::Idle,
            history: vec![UploadState::Idle],
            attempts: Vec::new(),
            bytes_sent: 0,
            progress,
        }
    }

    /// Convenience for a single upload without watching progress.
    pub async fn upload(
        &self,
        request: UploadRequest,
        source: &dyn ByteSource,
    ) -> UploadResult<UploadOutcome> {
        self.session(request).run(source).await
    }
}

/// Per-upload state owned by the caller.
pub struct UploadSession {
    orchestrator: UploadOrchestrator,
    request: UploadRequest,
    state: UploadState,
    history: Vec<UploadState>,
    attempts: Vec<Attempt>,
    bytes_sent: u64,
    progress: watch::Sender<Progress>,
}

impl UploadSession {
    pub fn state(&self) -> UploadState {
        self.state
    }

    /// Every state entered so far, starting with `Idle`.
    pub fn history(&self) -> &[UploadState] {
        &self.history
    }

    pub fn attempts(&self) -> &[Attempt] {
        &self.attempts
    }

    pub fn request(&self) -> &UploadRequest {
        &self.request
    }

    pub fn subscribe(&self) -> watch::Receiver<Progress> {
        self.progress.subscribe()
    }

    fn transition(&mut self, next: UploadState) {
        if !self.state.can_transition_to(&next) {
            warn!(from = ?self.state, to = ?next, "unexpected upload state transition");
        }
        debug!(from = ?self.state, to = ?next, file = %self.request.file_name, "upload state");
        self.state = next;
        self.history.push(next);
        self.publish();
    }

    fn publish(&self) {
        self.progress.send_replace(Progress {
            state: self.state,
            bytes_sent: self.bytes_sent,
            total: self.request.size,
        });
    }

    fn add_sent(&mut self, n: u64) {
        self.bytes_sent = self.bytes_sent.saturating_add(n);
        self.publish();
    }

    fn fail(&mut self, err: UploadError) -> UploadError {
        self.transition(UploadState::Failed(err.kind()));
        err
    }

    /// Drive the session to a terminal state.
    pub async fn run(&mut self, source: &dyn ByteSource) -> UploadResult<UploadOutcome> {
        if self.state != UploadState::Idle {
            return Err(UploadError::Validation(
                "upload session has already run".into(),
            ));
        }
        self.transition(UploadState::Preparing);

        if let Err(err) = self.request.validate() {
            return Err(self.fail(err));
        }
        if source.len() != self.request.size {
            let err = UploadError::Validation(format!(
                "declared size {} does not match the {} byte source",
                self.request.size,
                source.len()
            ));
            return Err(self.fail(err));
        }

        let policy = *self.orchestrator.policy();
        let size = self.request.size;
        let mut strategy = match choose_strategy(size, &policy, &self.attempts) {
            Some(strategy) => strategy,
            None => {
                let err = UploadError::StrategyExhausted {
                    size,
                    ceiling: policy.proxy_ceiling,
                };
                return Err(self.fail(err));
            }
        };

        let path = loop {
            info!(file = %self.request.file_name, size, %strategy, "starting upload attempt");
            self.bytes_sent = 0;
            match self.attempt(strategy, source).await {
                Ok(path) => break path,
                Err(err) => {
                    let attempt = Attempt {
                        strategy,
                        failure: err.kind(),
                    };
                    self.attempts.push(attempt);
                    warn!(%strategy, error = %err, "upload attempt failed");
                    let err = self.fail(err);

                    match choose_strategy(size, &policy, &self.attempts) {
                        Some(next) => {
                            self.transition(UploadState::FallingBack);
                            self.transition(UploadState::Preparing);
                            strategy = next;
                        }
                        None if fallback_eligible(&attempt) => {
                            let exhausted = UploadError::StrategyExhausted {
                                size,
                                ceiling: policy.proxy_ceiling,
                            };
                            return Err(self.fail(exhausted));
                        }
                        None => return Err(err),
                    }
                }
            }
        };

        let record = self.record(path).await?;
        self.transition(UploadState::Complete);
        info!(path = %record.file_path, %strategy, "upload complete");
        Ok(UploadOutcome { strategy, record })
    }

    /// One strategy attempt, ending in `Finalizing`. Returns the stored path.
    async fn attempt(&mut self, strategy: Strategy, source: &dyn ByteSource) -> UploadResult<String> {
        match strategy {
            Strategy::Direct => self.direct(source).await,
            Strategy::Proxied => self.proxied(source).await,
            Strategy::Multipart => self.multipart(source).await,
        }
    }

    async fn direct(&mut self, source: &dyn ByteSource) -> UploadResult<String> {
        let api = self.orchestrator.api.clone();
        let uploader = self.orchestrator.uploader.clone();

        let target = api.issue_simple_target(&self.request).await?;
        self.transition(UploadState::Transferring(Strategy::Direct));
        let bytes = read_source(source, 0, self.request.size).await?;
        uploader
            .upload_part(&target, None, bytes, &self.request.mime_type)
            .await?;
        self.add_sent(self.request.size);

        self.transition(UploadState::Finalizing(Strategy::Direct));
        Ok(target.upload_path)
    }

    async fn proxied(&mut self, source: &dyn ByteSource) -> UploadResult<String> {
        let api = self.orchestrator.api.clone();

        self.transition(UploadState::Transferring(Strategy::Proxied));
        let bytes = read_source(source, 0, self.request.size).await?;
        let receipt = api.proxy_upload(&self.request, bytes).await?;
        self.add_sent(receipt.content_length);

        self.transition(UploadState::Finalizing(Strategy::Proxied));
        Ok(receipt.path)
    }

    async fn multipart(&mut self, source: &dyn ByteSource) -> UploadResult<String> {
        let api = self.orchestrator.api.clone();
        let uploader = self.orchestrator.uploader.clone();
        let policy = *self.orchestrator.policy();
        let size = self.request.size;

        let target = api.issue_multipart_target(&self.request).await?;
        let mut session = MultipartSession::new(&target.file_id, &target.upload_path);
        self.transition(UploadState::Transferring(Strategy::Multipart));

        let part_count = policy.part_count(size);
        for index in 1..=part_count {
            let part_number = u32::try_from(index).map_err(|_| {
                UploadError::Validation(format!("{part_count} parts exceed the part number range"))
            })?;
            let (offset, len) = policy.part_range(size, index);
            let bytes = read_source(source, offset, len).await?;
            let part_target = api.issue_part_target(session.file_id(), part_number).await?;
            let hash = uploader
                .upload_part(&part_target, Some(part_number), bytes, &self.request.mime_type)
                .await?;
            let sha1 = hash.as_sha1().map(str::to_string).ok_or_else(|| {
                UploadError::Transfer(format!("part {part_number} was sent without a digest"))
            })?;
            session.push(part_number, sha1)?;
            self.add_sent(len);
            debug!(part_number, part_count, "part uploaded");
        }

        self.transition(UploadState::Finalizing(Strategy::Multipart));
        let issued = session.upload_path().to_string();
        debug!(file_id = %session.file_id(), parts = session.parts().len(), "finishing multipart upload");
        let (file_id, parts) = session.into_parts();
        let location = api.finish(&file_id, &parts).await?;
        if location.path.is_empty() {
            return Ok(issued);
        }
        if location.path != issued {
            warn!(assembled = %location.path, %issued, "store assembled the object under another name");
        }
        Ok(location.path)
    }

    /// Record the finished object, handing it to the reconciliation hook when
    /// the record cannot be written.
    async fn record(&mut self, path: String) -> UploadResult<FileRecord> {
        let record = NewFileRecord {
            user_id: self.request.owner_id.clone(),
            file_name: self.request.file_name.clone(),
            file_path: path.clone(),
            file_type: self.request.mime_type.clone(),
            file_size: self.request.size,
            folder_id: self.request.folder_id.clone(),
        };

        let recorder = self.orchestrator.recorder.clone();
        match recorder.insert(record.clone()).await {
            Ok(row) => Ok(row),
            Err(err) => {
                let reason = match err {
                    UploadError::Metadata { reason, .. } => reason,
                    other => other.to_string(),
                };
                self.orchestrator
                    .hook
                    .orphaned(OrphanedUpload {
                        record,
                        reason: reason.clone(),
                        detected_at: Utc::now(),
                    })
                    .await;
                Err(self.fail(UploadError::Metadata { path, reason }))
            }
        }
    }
}

/// Source read failures are local, so they surface as `Validation` and are
/// never eligible for fallback.
async fn read_source(source: &dyn ByteSource, offset: u64, len: u64) -> UploadResult<Bytes> {
    source
        .read_range(offset, len)
        .await
        .map_err(|err| match err {
            UploadError::Validation(_) => err,
            other => UploadError::Validation(format!("could not read upload source: {other}")),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::MIB;

    fn attempt(strategy: Strategy, failure: ErrorKind) -> Attempt {
        Attempt { strategy, failure }
    }

    #[test]
    fn first_attempt_splits_on_threshold() {
        let policy = UploadPolicy::default();
        assert_eq!(
            choose_strategy(2 * MIB, &policy, &[]),
            Some(Strategy::Direct)
        );
        assert_eq!(
            choose_strategy(100 * MIB, &policy, &[]),
            Some(Strategy::Multipart)
        );
        assert_eq!(choose_strategy(0, &policy, &[]), Some(Strategy::Direct));
    }

    #[test]
    fn proxied_only_after_direct_transfer_failure_below_ceiling() {
        let policy = UploadPolicy::default();
        let failed = [attempt(Strategy::Direct, ErrorKind::Transfer)];
        assert_eq!(
            choose_strategy(2 * MIB, &policy, &failed),
            Some(Strategy::Proxied)
        );
        assert_eq!(choose_strategy(6 * MIB, &policy, &failed), None);

        let upstream = [attempt(Strategy::Direct, ErrorKind::Upstream)];
        assert_eq!(choose_strategy(2 * MIB, &policy, &upstream), None);
    }

    #[test]
    fn proxied_is_tried_once() {
        let policy = UploadPolicy::default();
        let attempts = [
            attempt(Strategy::Direct, ErrorKind::Transfer),
            attempt(Strategy::Proxied, ErrorKind::Transfer),
        ];
        assert_eq!(choose_strategy(MIB, &policy, &attempts), None);
    }

    #[test]
    fn multipart_failures_never_fall_back() {
        let policy = UploadPolicy::default();
        let attempts = [attempt(Strategy::Multipart, ErrorKind::Transfer)];
        assert_eq!(choose_strategy(200 * MIB, &policy, &attempts), None);
        assert!(!fallback_eligible(&attempts[0]));
    }

    #[test]
    fn state_machine_edges() {
        use UploadState::*;
        assert!(Idle.can_transition_to(&Preparing));
        assert!(Preparing.can_transition_to(&Transferring(Strategy::Direct)));
        assert!(Transferring(Strategy::Direct).can_transition_to(&Finalizing(Strategy::Direct)));
        assert!(!Transferring(Strategy::Direct).can_transition_to(&Finalizing(Strategy::Proxied)));
        assert!(Failed(ErrorKind::Transfer).can_transition_to(&FallingBack));
        assert!(FallingBack.can_transition_to(&Preparing));
        assert!(!Complete.can_transition_to(&Failed(ErrorKind::Metadata)));
        assert!(!Idle.can_transition_to(&Complete));
    }
}
