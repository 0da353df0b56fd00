//! B2 native API backend against an in-process fake of the B2 endpoints.

use axum::{
    Json, Router,
    extract::State,
    http::{HeaderMap, StatusCode},
    routing::{get, post},
};
use bytes::Bytes;
use chrono::{Duration, Utc};
use serde_json::{Value, json};
use std::sync::{Arc, Mutex};
use tokio::net::TcpListener;
use upload_relay::{
    errors::{ErrorKind, UploadError},
    models::multipart::PartRecord,
    models::upload::{UploadTarget, sha1_hex},
    services::{
        b2_backend::{B2Backend, B2Config},
        backend::ObjectBackend,
        finalizer::MultipartFinalizer,
        part_uploader::{HttpPartUploader, PartUploader},
        target_issuer::TargetIssuer,
    },
};

#[derive(Clone, Default)]
struct FakeB2 {
    base_url: String,
    /// (file name header, sha1 header, body length) of every upload.
    uploads: Arc<Mutex<Vec<(String, String, usize)>>>,
}

async fn authorize_account(
    State(fake): State<FakeB2>,
    headers: HeaderMap,
) -> (StatusCode, Json<Value>) {
    let basic = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    // base64("key:secret")
    if basic != "Basic a2V5OnNlY3JldA==" {
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({ "status": 401, "code": "unauthorized", "message": "bad key" })),
        );
    }
    (
        StatusCode::OK,
        Json(json!({ "authorizationToken": "acct-token", "apiUrl": fake.base_url })),
    )
}

async fn get_upload_url(State(fake): State<FakeB2>) -> Json<Value> {
    Json(json!({
        "bucketId": "bucket",
        "uploadUrl": format!("{}/upload", fake.base_url),
        "authorizationToken": "upload-token"
    }))
}

async fn start_large_file(Json(body): Json<Value>) -> Json<Value> {
    Json(json!({ "fileId": "4_z_large", "fileName": body["fileName"] }))
}

async fn finish_large_file(Json(body): Json<Value>) -> (StatusCode, Json<Value>) {
    let parts = body["partSha1Array"].as_array().map(Vec::len).unwrap_or(0);
    if parts < 2 {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "status": 400, "code": "bad_request", "message": "Part number 2 has not been uploaded" })),
        );
    }
    (
        StatusCode::OK,
        Json(json!({ "fileId": body["fileId"], "fileName": "u1/root/1-big.bin", "contentLength": 42 })),
    )
}

async fn upload(State(fake): State<FakeB2>, headers: HeaderMap, body: Bytes) -> StatusCode {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string()
    };
    if header("authorization") != "upload-token" {
        return StatusCode::UNAUTHORIZED;
    }
    fake.uploads.lock().unwrap().push((
        header("x-bz-file-name"),
        header("x-bz-content-sha1"),
        body.len(),
    ));
    StatusCode::OK
}

async fn start_fake() -> FakeB2 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let fake = FakeB2 {
        base_url: format!("http://{}", listener.local_addr().unwrap()),
        ..FakeB2::default()
    };
    let router = Router::new()
        .route("/b2api/v2/b2_authorize_account", get(authorize_account))
        .route("/b2api/v2/b2_get_upload_url", post(get_upload_url))
        .route("/b2api/v2/b2_start_large_file", post(start_large_file))
        .route("/b2api/v2/b2_finish_large_file", post(finish_large_file))
        .route("/upload", post(upload))
        .route("/too-large", post(|| async { StatusCode::PAYLOAD_TOO_LARGE }))
        .with_state(fake.clone());
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    fake
}

fn backend(fake: &FakeB2, app_key: &str) -> Arc<dyn ObjectBackend> {
    Arc::new(B2Backend::new(B2Config {
        key_id: "key".into(),
        app_key: app_key.into(),
        bucket_id: "bucket".into(),
        auth_url: fake.base_url.clone(),
        public_url: "https://f000.example.com/file/bucket".into(),
    }))
}

#[tokio::test]
async fn simple_target_and_upload_use_b2_headers() {
    let fake = start_fake().await;
    let issuer = TargetIssuer::new(backend(&fake, "secret"), Duration::hours(24));

    let target = issuer
        .issue_simple_target("u1", "my file.txt", "text/plain", None)
        .await
        .unwrap();
    assert_eq!(target.upload_url, format!("{}/upload", fake.base_url));
    assert_eq!(target.authorization_token, "upload-token");

    let uploader = HttpPartUploader::new(false);
    let hash = uploader
        .upload_part(&target, None, Bytes::from_static(b"hello"), "text/plain")
        .await
        .unwrap();
    assert_eq!(hash.header_value(), "do_not_verify");

    let uploads = fake.uploads.lock().unwrap().clone();
    assert_eq!(uploads.len(), 1);
    assert_eq!(
        urlencoding::decode(&uploads[0].0).unwrap(),
        target.upload_path
    );
    assert_eq!(uploads[0].1, "do_not_verify");
    assert_eq!(uploads[0].2, 5);
}

#[tokio::test]
async fn bad_key_is_an_auth_failure() {
    let fake = start_fake().await;
    let issuer = TargetIssuer::new(backend(&fake, "wrong"), Duration::hours(24));

    let err = issuer
        .issue_simple_target("u1", "a.txt", "", None)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::AuthFailure);
}

#[tokio::test]
async fn multipart_start_and_finish() {
    let fake = start_fake().await;
    let backend = backend(&fake, "secret");
    let issuer = TargetIssuer::new(backend.clone(), Duration::hours(24));
    let finalizer = MultipartFinalizer::new(backend);

    let target = issuer
        .issue_multipart_target("u1", "big.bin", "", 300, None)
        .await
        .unwrap();
    assert_eq!(target.file_id, "4_z_large");

    let parts = vec![
        PartRecord {
            part_number: 1,
            sha1: sha1_hex(b"one"),
        },
        PartRecord {
            part_number: 2,
            sha1: sha1_hex(b"two"),
        },
    ];
    let location = finalizer.finish(&target.file_id, &parts).await.unwrap();
    assert_eq!(location.content_length, Some(42));
    assert_eq!(
        location.public_url,
        "https://f000.example.com/file/bucket/u1/root/1-big.bin"
    );
}

#[tokio::test]
async fn store_rejection_of_finish_is_an_assembly_error() {
    let fake = start_fake().await;
    let finalizer = MultipartFinalizer::new(backend(&fake, "secret"));
    let parts = vec![PartRecord {
        part_number: 1,
        sha1: sha1_hex(b"one"),
    }];

    let err = finalizer.finish("4_z_large", &parts).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Assembly);
}

#[tokio::test]
async fn out_of_order_parts_never_reach_the_store() {
    let fake = start_fake().await;
    let finalizer = MultipartFinalizer::new(backend(&fake, "secret"));
    let parts = vec![
        PartRecord {
            part_number: 2,
            sha1: sha1_hex(b"two"),
        },
        PartRecord {
            part_number: 1,
            sha1: sha1_hex(b"one"),
        },
    ];

    let err = finalizer.finish("4_z_large", &parts).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Assembly);
}

fn too_large_target(fake: &FakeB2) -> UploadTarget {
    UploadTarget {
        upload_url: format!("{}/too-large", fake.base_url),
        authorization_token: "upload-token".into(),
        upload_path: "u1/root/1-a.bin".into(),
        expires_at: Utc::now() + Duration::hours(1),
    }
}

#[tokio::test]
async fn store_413_without_a_known_limit_is_a_transfer_error() {
    let fake = start_fake().await;

    let err = HttpPartUploader::new(true)
        .upload_part(&too_large_target(&fake), None, Bytes::from_static(b"hello"), "")
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Transfer);
    assert!(err.to_string().contains("413"), "{err}");
}

#[tokio::test]
async fn store_413_reports_the_configured_ceiling() {
    let fake = start_fake().await;

    let err = HttpPartUploader::new(true)
        .with_max_payload(1024)
        .upload_part(&too_large_target(&fake), None, Bytes::from_static(b"hello"), "")
        .await
        .unwrap_err();

    match err {
        UploadError::PayloadTooLarge { size, limit } => {
            assert_eq!(size, 5);
            assert_eq!(limit, 1024);
        }
        other => panic!("expected PayloadTooLarge, got {other:?}"),
    }
}
