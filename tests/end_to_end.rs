//! The HTTP client and uploader against a relay listening on a real socket.

mod common;

use async_trait::async_trait;
use bytes::Bytes;
use common::{TestServer, payload};
use std::sync::Arc;
use tokio::net::TcpListener;
use upload_relay::{
    client::{HttpUploadApi, OrphanQueue, Strategy, UploadOrchestrator},
    errors::{ErrorKind, UploadError, UploadResult},
    models::upload::{ContentHash, UploadRequest, UploadTarget},
    policy::UploadPolicy,
    services::part_uploader::{HttpPartUploader, PartUploader},
};

fn policy() -> UploadPolicy {
    UploadPolicy {
        multipart_threshold: 64 * 1024,
        chunk_size: 32 * 1024,
        proxy_ceiling: 16 * 1024,
        ..UploadPolicy::default()
    }
}

struct Relay {
    server: TestServer,
    base_url: String,
}

async fn start_relay() -> Relay {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let base_url = format!("http://{}", listener.local_addr().unwrap());
    let server = TestServer::build(policy(), &base_url).await;
    let router = server.router.clone();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    Relay { server, base_url }
}

/// Whole-file uploads fail the way a browser fetch blocked by CORS does;
/// parts go through.
struct BlockedDirect(HttpPartUploader);

#[async_trait]
impl PartUploader for BlockedDirect {
    async fn upload_part(
        &self,
        target: &UploadTarget,
        part_number: Option<u32>,
        bytes: Bytes,
        content_type: &str,
    ) -> UploadResult<ContentHash> {
        if part_number.is_none() {
            return Err(UploadError::Transfer("TypeError: Failed to fetch".into()));
        }
        self.0
            .upload_part(target, part_number, bytes, content_type)
            .await
    }
}

fn orchestrator(
    relay: &Relay,
    token: &str,
    uploader: Arc<dyn PartUploader>,
    orphans: &OrphanQueue,
) -> UploadOrchestrator {
    let api = Arc::new(HttpUploadApi::new(&relay.base_url, token, policy().proxy_ceiling).unwrap());
    UploadOrchestrator::new(
        api.clone(),
        uploader,
        api,
        Arc::new(orphans.clone()),
        policy(),
    )
}

async fn download(url: &str) -> Bytes {
    let response = reqwest::get(url).await.unwrap();
    assert!(response.status().is_success(), "GET {url}: {}", response.status());
    response.bytes().await.unwrap()
}

#[tokio::test]
async fn small_file_goes_direct_and_is_recorded() {
    let relay = start_relay().await;
    let orphans = OrphanQueue::new();
    let uploads = orchestrator(
        &relay,
        "jwt",
        Arc::new(HttpPartUploader::new(false)),
        &orphans,
    );
    let data = payload(8 * 1024);

    let outcome = uploads
        .upload(
            UploadRequest::new("u1", "small.bin", "", data.len() as u64, None),
            &data,
        )
        .await
        .unwrap();

    assert_eq!(outcome.strategy, Strategy::Direct);
    assert_eq!(outcome.record.file_type, "application/octet-stream");
    let stored = relay
        .server
        .recorder
        .find_by_path(&outcome.record.file_path)
        .await
        .unwrap()
        .expect("record");
    assert_eq!(stored.file_size, 8 * 1024);

    let url = format!("{}/storage/file/{}", relay.base_url, outcome.record.file_path);
    assert_eq!(download(&url).await, data);
}

#[tokio::test]
async fn large_file_is_assembled_from_parts() {
    let relay = start_relay().await;
    let orphans = OrphanQueue::new();
    let uploads = orchestrator(
        &relay,
        "jwt",
        Arc::new(HttpPartUploader::new(false)),
        &orphans,
    );
    let data = payload(100 * 1024);

    let outcome = uploads
        .upload(
            UploadRequest::new("u1", "movie.mp4", "video/mp4", data.len() as u64, Some("f1".into())),
            &data,
        )
        .await
        .unwrap();

    assert_eq!(outcome.strategy, Strategy::Multipart);
    assert!(outcome.record.file_path.starts_with("u1/f1/"));
    let url = format!("{}/storage/file/{}", relay.base_url, outcome.record.file_path);
    assert_eq!(download(&url).await, data);
    assert_eq!(relay.server.recorder.count().await.unwrap(), 1);
}

#[tokio::test]
async fn blocked_direct_upload_is_relayed() {
    let relay = start_relay().await;
    let orphans = OrphanQueue::new();
    let uploads = orchestrator(
        &relay,
        "jwt",
        Arc::new(BlockedDirect(HttpPartUploader::new(false))),
        &orphans,
    );
    let data = payload(4 * 1024);

    let outcome = uploads
        .upload(
            UploadRequest::new("u1", "notes.txt", "text/plain", data.len() as u64, None),
            &data,
        )
        .await
        .unwrap();

    assert_eq!(outcome.strategy, Strategy::Proxied);
    let url = format!("{}/storage/file/{}", relay.base_url, outcome.record.file_path);
    assert_eq!(download(&url).await, data);
    assert_eq!(relay.server.recorder.count().await.unwrap(), 1);
}

#[tokio::test]
async fn blocked_direct_upload_over_the_ceiling_is_exhausted() {
    let relay = start_relay().await;
    let orphans = OrphanQueue::new();
    let uploads = orchestrator(
        &relay,
        "jwt",
        Arc::new(BlockedDirect(HttpPartUploader::new(false))),
        &orphans,
    );
    let data = payload(20 * 1024);

    let err = uploads
        .upload(
            UploadRequest::new("u1", "notes.txt", "text/plain", data.len() as u64, None),
            &data,
        )
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::StrategyExhausted);
    assert_eq!(relay.server.recorder.count().await.unwrap(), 0);
}

#[tokio::test]
async fn rejected_record_leaves_an_orphan_that_can_be_retried() {
    let relay = start_relay().await;
    let orphans = OrphanQueue::new();
    // no bearer token: the record endpoint answers 401
    let uploads = orchestrator(
        &relay,
        "",
        Arc::new(HttpPartUploader::new(true)),
        &orphans,
    );
    let data = payload(1024);

    let err = uploads
        .upload(
            UploadRequest::new("u1", "a.bin", "", data.len() as u64, None),
            &data,
        )
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Metadata);
    assert_eq!(orphans.len().await, 1);
    assert_eq!(relay.server.recorder.count().await.unwrap(), 0);

    let authorized = HttpUploadApi::new(&relay.base_url, "jwt", policy().proxy_ceiling).unwrap();
    let report = orphans.retry_pending(&authorized).await;
    assert_eq!(report.recorded, 1);
    assert_eq!(relay.server.recorder.count().await.unwrap(), 1);
}
