//! Shared fixtures: an in-process relay backed by a temp directory and an
//! in-memory database, plus scripted collaborators for the orchestrator.
#![allow(dead_code)]

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use bytes::Bytes;
use chrono::{Duration, Utc};
use serde_json::Value;
use std::sync::{Arc, Mutex};
use tempfile::TempDir;
use tower::ServiceExt;
use upload_relay::{
    client::{OrphanQueue, UploadApi, UploadOrchestrator},
    db,
    errors::{UploadError, UploadResult},
    handlers::upload_handlers::ProxyReceipt,
    models::{
        file_record::{FileRecord, NewFileRecord},
        multipart::PartRecord,
        upload::{ContentHash, MultipartTarget, ObjectLocation, UploadRequest, UploadTarget, sha1_hex},
    },
    policy::UploadPolicy,
    routes::routes::app,
    services::{
        local_backend::LocalBackend, metadata::MetadataRecorder,
        metadata::SqliteMetadataRecorder, part_uploader::PartUploader,
    },
    state::AppState,
};
use uuid::Uuid;

pub const PUBLIC_URL: &str = "http://relay.test";

/// Router over a local store in a temp directory.
pub struct TestServer {
    pub router: axum::Router,
    pub state: AppState,
    pub recorder: SqliteMetadataRecorder,
    _dir: TempDir,
}

impl TestServer {
    pub async fn new() -> Self {
        Self::with_policy(UploadPolicy::default()).await
    }

    pub async fn with_policy(policy: UploadPolicy) -> Self {
        Self::build(policy, PUBLIC_URL).await
    }

    pub async fn build(policy: UploadPolicy, public_url: &str) -> Self {
        let dir = TempDir::new().expect("temp dir");
        let pool = db::connect_in_memory().await.expect("in-memory db");
        let local = LocalBackend::new(
            pool.clone(),
            dir.path().join("objects"),
            public_url,
            policy.credential_ttl(),
        );
        let recorder = SqliteMetadataRecorder::new(pool.clone());
        let state =
            AppState::with_local_backend(pool, local, Arc::new(recorder.clone()), policy);
        Self {
            router: app(state.clone()),
            state,
            recorder,
            _dir: dir,
        }
    }
}

/// Send one request through the router and decode a JSON answer if any.
pub async fn send(
    router: &axum::Router,
    method: &str,
    uri: &str,
    headers: &[(&str, &str)],
    body: Body,
) -> (StatusCode, Bytes) {
    let mut builder = Request::builder().method(method).uri(uri);
    for (name, value) in headers {
        builder = builder.header(*name, *value);
    }
    let response = router
        .clone()
        .oneshot(builder.body(body).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, bytes)
}

pub async fn json_request(
    router: &axum::Router,
    uri: &str,
    body: Value,
    bearer: Option<&str>,
) -> (StatusCode, Value) {
    let auth = bearer.map(|t| format!("Bearer {t}"));
    let mut headers = vec![("content-type", "application/json")];
    if let Some(auth) = auth.as_deref() {
        headers.push(("authorization", auth));
    }
    let (status, bytes) = send(
        router,
        "POST",
        uri,
        &headers,
        Body::from(serde_json::to_vec(&body).unwrap()),
    )
    .await;
    let json = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, json)
}

/// Deterministic payload of `len` bytes.
pub fn payload(len: usize) -> Bytes {
    Bytes::from((0..len).map(|i| (i % 251) as u8).collect::<Vec<u8>>())
}

// ---------------------------------------------------------------------------
// Scripted collaborators for the orchestrator
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApiCall {
    SimpleTarget,
    MultipartTarget,
    PartTarget(u32),
    Finish(Vec<u32>),
    Proxy(usize),
}

#[derive(Default)]
pub struct MockApi {
    pub calls: Mutex<Vec<ApiCall>>,
    pub finished_parts: Mutex<Vec<PartRecord>>,
    /// Error returned by `issue_simple_target`.
    pub simple_target_error: Mutex<Option<UploadError>>,
    /// Error returned by `proxy_upload`.
    pub proxy_error: Mutex<Option<UploadError>>,
    /// Name `finish` reports instead of the issued multipart path.
    pub assembled_as: Mutex<Option<String>>,
    multipart_path: Mutex<String>,
    counter: Mutex<i64>,
}

impl MockApi {
    pub fn calls(&self) -> Vec<ApiCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, pred: impl Fn(&ApiCall) -> bool) -> usize {
        self.calls.lock().unwrap().iter().filter(|c| pred(c)).count()
    }

    fn next_path(&self, request: &UploadRequest) -> String {
        let mut counter = self.counter.lock().unwrap();
        *counter += 1;
        let folder = request.folder_id.as_deref().unwrap_or("root");
        format!(
            "{}/{}/{}-{}",
            request.owner_id, folder, *counter, request.file_name
        )
    }

    fn target(url: &str, path: String) -> UploadTarget {
        UploadTarget {
            upload_url: url.to_string(),
            authorization_token: "token".into(),
            upload_path: path,
            expires_at: Utc::now() + Duration::hours(24),
        }
    }
}

#[async_trait]
impl UploadApi for MockApi {
    async fn issue_simple_target(&self, request: &UploadRequest) -> UploadResult<UploadTarget> {
        self.calls.lock().unwrap().push(ApiCall::SimpleTarget);
        if let Some(err) = self.simple_target_error.lock().unwrap().take() {
            return Err(err);
        }
        Ok(Self::target("mock://upload", self.next_path(request)))
    }

    async fn issue_multipart_target(
        &self,
        request: &UploadRequest,
    ) -> UploadResult<MultipartTarget> {
        self.calls.lock().unwrap().push(ApiCall::MultipartTarget);
        let upload_path = self.next_path(request);
        *self.multipart_path.lock().unwrap() = upload_path.clone();
        Ok(MultipartTarget {
            file_id: "session-1".into(),
            upload_path,
        })
    }

    async fn issue_part_target(
        &self,
        _file_id: &str,
        part_number: u32,
    ) -> UploadResult<UploadTarget> {
        self.calls
            .lock()
            .unwrap()
            .push(ApiCall::PartTarget(part_number));
        Ok(Self::target("mock://part", String::new()))
    }

    async fn finish(&self, file_id: &str, parts: &[PartRecord]) -> UploadResult<ObjectLocation> {
        self.calls.lock().unwrap().push(ApiCall::Finish(
            parts.iter().map(|p| p.part_number).collect(),
        ));
        *self.finished_parts.lock().unwrap() = parts.to_vec();
        let path = self
            .assembled_as
            .lock()
            .unwrap()
            .clone()
            .unwrap_or_else(|| self.multipart_path.lock().unwrap().clone());
        Ok(ObjectLocation {
            file_id: file_id.to_string(),
            public_url: format!("mock://file/{path}"),
            path,
            content_length: None,
        })
    }

    async fn proxy_upload(
        &self,
        request: &UploadRequest,
        bytes: Bytes,
    ) -> UploadResult<ProxyReceipt> {
        self.calls.lock().unwrap().push(ApiCall::Proxy(bytes.len()));
        if let Some(err) = self.proxy_error.lock().unwrap().take() {
            return Err(err);
        }
        Ok(ProxyReceipt {
            path: self.next_path(request),
            content_sha1: sha1_hex(&bytes),
            content_length: bytes.len() as u64,
        })
    }
}

/// One call made to the uploader.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadCall {
    pub part_number: Option<u32>,
    pub len: usize,
    pub sha1: String,
}

#[derive(Default)]
pub struct MockUploader {
    pub calls: Mutex<Vec<UploadCall>>,
    /// Every whole-file upload fails with this error.
    pub whole_file_error: Mutex<Option<fn() -> UploadError>>,
    /// This part number fails with a transfer error.
    pub failing_part: Mutex<Option<u32>>,
}

impl MockUploader {
    pub fn failing_whole_file(make: fn() -> UploadError) -> Self {
        let uploader = Self::default();
        *uploader.whole_file_error.lock().unwrap() = Some(make);
        uploader
    }

    pub fn failing_part(part_number: u32) -> Self {
        let uploader = Self::default();
        *uploader.failing_part.lock().unwrap() = Some(part_number);
        uploader
    }

    pub fn calls(&self) -> Vec<UploadCall> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl PartUploader for MockUploader {
    async fn upload_part(
        &self,
        _target: &UploadTarget,
        part_number: Option<u32>,
        bytes: Bytes,
        _content_type: &str,
    ) -> UploadResult<ContentHash> {
        let sha1 = sha1_hex(&bytes);
        self.calls.lock().unwrap().push(UploadCall {
            part_number,
            len: bytes.len(),
            sha1: sha1.clone(),
        });
        if part_number.is_none() {
            if let Some(make) = *self.whole_file_error.lock().unwrap() {
                return Err(make());
            }
            return Ok(ContentHash::Unverified);
        }
        if *self.failing_part.lock().unwrap() == part_number {
            return Err(UploadError::Transfer("connection reset".into()));
        }
        Ok(ContentHash::Sha1(sha1))
    }
}

#[derive(Default)]
pub struct MockRecorder {
    pub inserted: Mutex<Vec<NewFileRecord>>,
    pub fail: bool,
}

impl MockRecorder {
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub fn inserted(&self) -> Vec<NewFileRecord> {
        self.inserted.lock().unwrap().clone()
    }
}

#[async_trait]
impl MetadataRecorder for MockRecorder {
    async fn insert(&self, record: NewFileRecord) -> UploadResult<FileRecord> {
        if self.fail {
            return Err(UploadError::Metadata {
                path: record.file_path,
                reason: "database unavailable".into(),
            });
        }
        self.inserted.lock().unwrap().push(record.clone());
        Ok(FileRecord {
            id: Uuid::new_v4(),
            uploaded_by: record.user_id,
            file_name: record.file_name,
            file_path: record.file_path,
            file_type: record.file_type,
            file_size: record.file_size as i64,
            folder_id: record.folder_id,
            created_at: Utc::now(),
        })
    }
}

/// Orchestrator wired to the given mocks and a fresh orphan queue.
pub struct Harness {
    pub api: Arc<MockApi>,
    pub uploader: Arc<MockUploader>,
    pub recorder: Arc<MockRecorder>,
    pub orphans: OrphanQueue,
    pub orchestrator: UploadOrchestrator,
}

impl Harness {
    pub fn new(uploader: MockUploader, recorder: MockRecorder, policy: UploadPolicy) -> Self {
        let api = Arc::new(MockApi::default());
        let uploader = Arc::new(uploader);
        let recorder = Arc::new(recorder);
        let orphans = OrphanQueue::new();
        let orchestrator = UploadOrchestrator::new(
            api.clone(),
            uploader.clone(),
            recorder.clone(),
            Arc::new(orphans.clone()),
            policy,
        );
        Self {
            api,
            uploader,
            recorder,
            orphans,
            orchestrator,
        }
    }
}
