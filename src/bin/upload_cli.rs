//! Command-line client for the upload relay.

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use std::{path::PathBuf, sync::Arc};
use tracing_subscriber::EnvFilter;
use upload_relay::{
    client::{ByteSource, FileSource, HttpUploadApi, OrphanQueue, UploadOrchestrator},
    models::upload::UploadRequest,
    policy::{DEFAULT_CHUNK_SIZE, DEFAULT_MULTIPART_THRESHOLD, DEFAULT_PROXY_CEILING, UploadPolicy},
    services::part_uploader::HttpPartUploader,
};

#[derive(Parser)]
#[command(name = "upload-relay-cli")]
#[command(about = "Upload files through an upload-relay server")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Clone)]
struct ApiArgs {
    /// Server base URL
    #[arg(long, env = "UPLOAD_RELAY_URL", default_value = "http://127.0.0.1:3000")]
    server: String,

    /// Bearer token forwarded to the server
    #[arg(long, env = "UPLOAD_RELAY_TOKEN", hide_env_values = true)]
    token: String,
}

#[derive(Args, Clone)]
struct PolicyArgs {
    #[arg(long, default_value_t = DEFAULT_MULTIPART_THRESHOLD)]
    multipart_threshold: u64,

    #[arg(long, default_value_t = DEFAULT_CHUNK_SIZE)]
    chunk_size: u64,

    #[arg(long, default_value_t = DEFAULT_PROXY_CEILING)]
    proxy_ceiling: u64,

    /// Hash whole files instead of sending `do_not_verify`
    #[arg(long)]
    verify_whole_file: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Upload one file
    Upload {
        /// File to upload
        path: PathBuf,

        /// Owner the file is recorded under
        #[arg(long, env = "UPLOAD_RELAY_USER_ID")]
        owner: String,

        /// Destination folder (owner's root when omitted)
        #[arg(long)]
        folder: Option<String>,

        /// MIME type (application/octet-stream when omitted)
        #[arg(long)]
        mime_type: Option<String>,

        /// Name to store the file under (defaults to the file name of PATH)
        #[arg(long)]
        name: Option<String>,

        #[command(flatten)]
        api: ApiArgs,

        #[command(flatten)]
        policy: PolicyArgs,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Upload {
            path,
            owner,
            folder,
            mime_type,
            name,
            api,
            policy,
        } => upload(path, owner, folder, mime_type, name, api, policy).await,
    }
}

async fn upload(
    path: PathBuf,
    owner: String,
    folder: Option<String>,
    mime_type: Option<String>,
    name: Option<String>,
    api_args: ApiArgs,
    policy_args: PolicyArgs,
) -> Result<()> {
    let policy = UploadPolicy {
        multipart_threshold: policy_args.multipart_threshold,
        chunk_size: policy_args.chunk_size,
        proxy_ceiling: policy_args.proxy_ceiling,
        verify_whole_file: policy_args.verify_whole_file,
        ..UploadPolicy::default()
    };
    policy
        .validate()
        .map_err(|reason| anyhow::anyhow!("invalid upload policy: {reason}"))?;

    let source = FileSource::open(&path)
        .await
        .with_context(|| format!("opening {}", path.display()))?;
    let file_name = match name {
        Some(name) => name,
        None => path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .context("path has no file name")?,
    };
    let request = UploadRequest::new(
        owner,
        file_name,
        mime_type.unwrap_or_default(),
        source.len(),
        folder,
    );

    let api = Arc::new(HttpUploadApi::new(
        &api_args.server,
        &api_args.token,
        policy.proxy_ceiling,
    )?);
    let orphans = OrphanQueue::new();
    let orchestrator = UploadOrchestrator::new(
        api.clone(),
        Arc::new(HttpPartUploader::new(policy.verify_whole_file)),
        api.clone(),
        Arc::new(orphans.clone()),
        policy,
    );

    let mut session = orchestrator.session(request);
    let mut progress = session.subscribe();
    let watcher = tokio::spawn(async move {
        while progress.changed().await.is_ok() {
            let p = *progress.borrow_and_update();
            tracing::info!(state = ?p.state, sent = p.bytes_sent, total = p.total, "progress");
        }
    });

    let result = session.run(&source).await;
    drop(session);
    let _ = watcher.await;

    match result {
        Ok(outcome) => {
            println!("{}", serde_json::to_string_pretty(&outcome.record)?);
            eprintln!("uploaded via {}", outcome.strategy);
            Ok(())
        }
        Err(err) => {
            if !orphans.is_empty().await {
                let report = orphans.retry_pending(api.as_ref()).await;
                if report.recorded > 0 {
                    eprintln!("file record written on retry");
                    return Ok(());
                }
                for orphan in orphans.pending().await {
                    eprintln!(
                        "stored but not recorded: {} ({})",
                        orphan.record.file_path, orphan.reason
                    );
                }
            }
            let kind = err.kind();
            Err(anyhow::Error::new(err).context(format!("upload failed ({kind})")))
        }
    }
}
