use anyhow::{Context, Result};
use axum::Router;
use std::{io::ErrorKind, path::Path, sync::Arc};
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;
use upload_relay::{
    config::{AppConfig, BackendKind},
    db,
    routes,
    services::{
        b2_backend::B2Backend, local_backend::LocalBackend, metadata::SqliteMetadataRecorder,
        part_uploader::HttpPartUploader,
    },
    state::AppState,
};

#[tokio::main]
async fn main() -> Result<()> {
    // --- Logging setup ---
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // --- Parse config + migrate flag ---
    let (cfg, migrate) = AppConfig::from_env_and_args()?;

    tracing::info!("Starting upload-relay with config: {:?}", cfg);

    // --- Initialize SQLite connection ---
    let db = db::connect(&cfg.database_url)
        .await
        .with_context(|| format!("connecting to {}", cfg.database_url))?;

    // --- Handle migration mode ---
    // Statements are `IF NOT EXISTS`, so they also run on every start.
    db::run_migrations(&db).await?;
    if migrate {
        tracing::info!("Database migration complete.");
        return Ok(()); // exit after migration
    }

    let recorder = Arc::new(SqliteMetadataRecorder::new(db.clone()));

    // --- Initialize core services ---
    let state = match (cfg.backend, cfg.b2.clone()) {
        (BackendKind::B2, Some(b2)) => {
            tracing::info!("Using B2 bucket {}", b2.bucket_id);
            let relay = HttpPartUploader::new(cfg.policy.verify_whole_file)
                .with_max_payload(cfg.policy.proxy_ceiling);
            AppState::with_remote_backend(
                db,
                Arc::new(B2Backend::new(b2)),
                Arc::new(relay),
                recorder,
                cfg.policy,
            )
        }
        _ => {
            // --- Ensure storage directory exists ---
            if !Path::new(&cfg.storage_dir).exists() {
                std::fs::create_dir_all(&cfg.storage_dir)?;
                tracing::info!("Created storage directory at {}", cfg.storage_dir);
            }
            let local = LocalBackend::new(
                db.clone(),
                cfg.storage_dir.clone(),
                cfg.public_base_url.clone(),
                cfg.policy.credential_ttl(),
            );
            AppState::with_local_backend(db, local, recorder, cfg.policy)
        }
    };

    // --- Build router ---
    let app: Router = routes::routes::app(state);

    // --- Start server ---
    let addr = cfg.addr();
    let listener = match TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(err)
            if err.kind() == ErrorKind::PermissionDenied
                && matches!(cfg.host.as_str(), "0.0.0.0" | "::") =>
        {
            let fallback_addr = format!("127.0.0.1:{}", cfg.port);
            tracing::warn!(
                "Permission denied binding to {} ({}). Falling back to {}",
                addr,
                err,
                fallback_addr
            );
            TcpListener::bind(&fallback_addr).await?
        }
        Err(err) => return Err(err.into()),
    };

    tracing::info!("Server listening on http://{}", listener.local_addr()?);
    axum::serve(listener, app).await?;

    Ok(())
}
