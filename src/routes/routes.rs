//! Defines the HTTP surface of the relay.
//!
//! ## Structure
//! - **Health**
//!   - `GET  /healthz`, `GET /readyz`
//!
//! - **Upload API** (called by the browser-side orchestrator)
//!   - `POST /api/uploads/target` — single-shot write target
//!   - `POST /api/uploads/large/start` — open a multipart session
//!   - `POST /api/uploads/large/part-url` — endpoint for the next part
//!   - `POST /api/uploads/large/finish` — assemble the parts
//!   - `POST /api/uploads/proxy` — relay a small file through this server
//!   - `POST /api/files` — record a completed upload
//!
//! - **Local store** (only answers when this process is the object store)
//!   - `POST /storage/upload`, `POST /storage/upload-part`
//!   - `GET  /storage/file/{*path}`
//!
//! The wildcard `*path` allows canonical paths like `u1/root/1700000000000-a.txt`.

use crate::{
    handlers::{
        health_handlers::{healthz, readyz},
        storage_handlers::{download_file, upload_file, upload_part},
        upload_handlers::{
            finish_large_upload, get_part_upload_url, issue_simple_target, proxy_upload,
            record_file, start_large_upload,
        },
    },
    policy::UploadPolicy,
    state::AppState,
};
use axum::{
    Router,
    extract::DefaultBodyLimit,
    routing::{get, post},
};
use tower_http::{cors::CorsLayer, trace::TraceLayer};

/// Build the router for every endpoint.
///
/// The relay route caps request bodies at the policy's proxy ceiling so an
/// oversized relay is refused with 413 before it is buffered. Storage routes
/// stream their bodies and carry no limit.
pub fn routes(policy: &UploadPolicy) -> Router<AppState> {
    let relay_limit = usize::try_from(policy.proxy_ceiling).unwrap_or(usize::MAX);

    let api = Router::new()
        .route("/api/uploads/target", post(issue_simple_target))
        .route("/api/uploads/large/start", post(start_large_upload))
        .route("/api/uploads/large/part-url", post(get_part_upload_url))
        .route("/api/uploads/large/finish", post(finish_large_upload))
        .route(
            "/api/uploads/proxy",
            post(proxy_upload).layer(DefaultBodyLimit::max(relay_limit)),
        )
        .route("/api/files", post(record_file));

    let storage = Router::new()
        .route("/storage/upload", post(upload_file))
        .route("/storage/upload-part", post(upload_part))
        .route("/storage/file/{*path}", get(download_file))
        .layer(DefaultBodyLimit::disable());

    Router::new()
        // health endpoints (mounted at root)
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .merge(api)
        .merge(storage)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

/// Router with state attached, ready to serve.
pub fn app(state: AppState) -> Router {
    routes(&state.policy).with_state(state)
}
