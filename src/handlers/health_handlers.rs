//! Health & readiness handlers.
//!
//! - GET /healthz  -> simple liveness ("ok")
//! - GET /readyz   -> readiness that checks DB connectivity, store
//!   authorization and (for the local store) disk I/O

use crate::state::AppState;
use axum::{Json, extract::State, http::StatusCode, response::IntoResponse};
use serde::Serialize;
use std::collections::HashMap;
use tokio::fs;
use uuid::Uuid;

/// `GET /healthz`
///
/// Very small liveness probe — always returns 200 OK with a plain JSON body.
/// This endpoint should be cheap and never perform I/O.
pub async fn healthz() -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(HealthResponse {
            status: "ok".into(),
        }),
    )
}

/// `GET /readyz`
///
/// Readiness probe that:
/// 1. Runs a lightweight query against SQLite (`SELECT 1`).
/// 2. Obtains a store credential, proving the storage account is reachable.
/// 3. For the local store, performs a write/read/delete under its base path.
///
/// HTTP 200 when all checks pass, HTTP 503 when any check fails.
pub async fn readyz(State(state): State<AppState>) -> impl IntoResponse {
    let mut checks = HashMap::new();

    let sqlite_check = match sqlx::query_scalar::<_, i64>("SELECT 1")
        .fetch_one(&state.db)
        .await
    {
        Ok(1) => CheckStatus::ok(),
        Ok(v) => CheckStatus::failed(format!("unexpected result: {}", v)),
        Err(e) => CheckStatus::failed(format!("error: {}", e)),
    };
    checks.insert("sqlite", sqlite_check);

    let storage_check = match state.backend.authorize().await {
        Ok(_) => CheckStatus::ok(),
        Err(e) => CheckStatus::failed(e.to_string()),
    };
    checks.insert("storage", storage_check);

    if let Some(local) = &state.local {
        let tmp_path = local.base_path.join(format!(".readyz-{}", Uuid::new_v4()));
        let disk_check = match fs::create_dir_all(&local.base_path).await {
            Err(e) => CheckStatus::failed(format!("could not create base path: {}", e)),
            Ok(_) => match fs::write(&tmp_path, b"readyz").await {
                Err(e) => CheckStatus::failed(format!("could not write tmp file: {}", e)),
                Ok(_) => {
                    let read_back = fs::read(&tmp_path).await;
                    let _ = fs::remove_file(&tmp_path).await; // best-effort cleanup
                    match read_back {
                        Ok(bytes) if bytes == b"readyz" => CheckStatus::ok(),
                        Ok(_) => CheckStatus::failed("file content mismatch".into()),
                        Err(e) => CheckStatus::failed(format!("could not read tmp file: {}", e)),
                    }
                }
            },
        };
        checks.insert("disk", disk_check);
    }

    let overall_ok = checks.values().all(|c| c.ok);
    let body = ReadyResponse {
        status: if overall_ok {
            "ok".into()
        } else {
            "error".into()
        },
        backend: state.backend.backend_name(),
        checks,
    };

    let status = if overall_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(body))
}

#[derive(Serialize)]
struct HealthResponse {
    status: String,
}

#[derive(Serialize)]
struct ReadyResponse {
    status: String,
    backend: &'static str,
    checks: HashMap<&'static str, CheckStatus>,
}

#[derive(Serialize)]
struct CheckStatus {
    ok: bool,
    error: Option<String>,
}

impl CheckStatus {
    fn ok() -> Self {
        Self {
            ok: true,
            error: None,
        }
    }

    fn failed(error: String) -> Self {
        Self {
            ok: false,
            error: Some(error),
        }
    }
}
