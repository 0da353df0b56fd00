use crate::policy::{
    DEFAULT_CHUNK_SIZE, DEFAULT_CREDENTIAL_TTL_SECS, DEFAULT_MULTIPART_THRESHOLD,
    DEFAULT_PROXY_CEILING, UploadPolicy,
};
use crate::services::b2_backend::{B2Config, DEFAULT_B2_AUTH_URL};
use anyhow::{Context, Result, anyhow};
use clap::{Parser, ValueEnum};
use std::{env, str::FromStr};

/// Which object store the server talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum BackendKind {
    /// Objects live on this server's disk and are served by it.
    Local,
    /// Backblaze B2 native API.
    B2,
}

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub storage_dir: String,
    pub database_url: String,
    /// Base URL clients use to reach this server's `/storage` routes.
    pub public_base_url: String,
    pub backend: BackendKind,
    pub b2: Option<B2Config>,
    pub policy: UploadPolicy,
}

/// Command-line + environment configuration.
#[derive(Parser, Debug)]
#[command(author, version, about = "Upload relay for browser-to-object-store transfers")]
pub struct Args {
    /// Host to bind to (overrides UPLOAD_RELAY_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides UPLOAD_RELAY_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Directory where the local backend stores objects (overrides UPLOAD_RELAY_STORAGE_DIR)
    #[arg(long)]
    pub storage_dir: Option<String>,

    /// Database URL (overrides UPLOAD_RELAY_DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,

    /// Public base URL of this server (overrides UPLOAD_RELAY_PUBLIC_URL)
    #[arg(long)]
    pub public_url: Option<String>,

    /// Object store backend (overrides UPLOAD_RELAY_BACKEND)
    #[arg(long, value_enum)]
    pub backend: Option<BackendKind>,

    #[arg(long, env = "B2_KEY_ID")]
    pub b2_key_id: Option<String>,

    #[arg(long, env = "B2_APP_KEY", hide_env_values = true)]
    pub b2_app_key: Option<String>,

    #[arg(long, env = "B2_BUCKET_ID")]
    pub b2_bucket_id: Option<String>,

    /// Base of public read URLs for the bucket
    #[arg(long, env = "B2_BUCKET_PUBLIC_URL")]
    pub b2_public_url: Option<String>,

    #[arg(long, env = "B2_AUTH_URL", default_value = DEFAULT_B2_AUTH_URL)]
    pub b2_auth_url: String,

    /// Files at or above this many bytes use multipart (overrides UPLOAD_RELAY_MULTIPART_THRESHOLD)
    #[arg(long)]
    pub multipart_threshold: Option<u64>,

    /// Multipart part size in bytes (overrides UPLOAD_RELAY_CHUNK_SIZE)
    #[arg(long)]
    pub chunk_size: Option<u64>,

    /// Largest body the relay accepts (overrides UPLOAD_RELAY_PROXY_CEILING)
    #[arg(long)]
    pub proxy_ceiling: Option<u64>,

    /// Upload credential lifetime in seconds (overrides UPLOAD_RELAY_CREDENTIAL_TTL_SECS)
    #[arg(long)]
    pub credential_ttl_secs: Option<i64>,

    /// Send a real SHA-1 for whole-file uploads instead of skipping verification
    #[arg(long)]
    pub verify_whole_file: bool,

    /// Run migrations and exit
    #[arg(long)]
    pub migrate: bool,
}

/// Read `name` and parse it, falling back to `default` when unset.
fn env_or<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(name) {
        Ok(value) => value
            .parse::<T>()
            .with_context(|| format!("parsing {} value `{}`", name, value)),
        Err(env::VarError::NotPresent) => Ok(default),
        Err(err) => Err(err).with_context(|| format!("reading {}", name)),
    }
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig and migrate flag.
    pub fn from_env_and_args() -> Result<(Self, bool)> {
        // Parse CLI once
        let args = Args::parse();
        let migrate = args.migrate;
        Ok((Self::from_args(args)?, migrate))
    }

    /// Merge parsed args with the environment.
    pub fn from_args(args: Args) -> Result<Self> {
        // --- Environment fallback ---
        let env_host = env::var("UPLOAD_RELAY_HOST").unwrap_or_else(|_| "0.0.0.0".into());
        let env_port = env_or("UPLOAD_RELAY_PORT", 3000u16)?;
        let env_storage =
            env::var("UPLOAD_RELAY_STORAGE_DIR").unwrap_or_else(|_| "./data/objects".into());
        let env_db = env::var("UPLOAD_RELAY_DATABASE_URL")
            .unwrap_or_else(|_| "sqlite://./data/meta/upload_relay.db".into());
        let env_backend = match env::var("UPLOAD_RELAY_BACKEND") {
            Ok(value) => <BackendKind as ValueEnum>::from_str(&value, true)
                .map_err(|e| anyhow!("parsing UPLOAD_RELAY_BACKEND value `{}`: {}", value, e))?,
            Err(_) => BackendKind::Local,
        };

        let host = args.host.unwrap_or(env_host);
        let port = args.port.unwrap_or(env_port);
        let env_public = env::var("UPLOAD_RELAY_PUBLIC_URL")
            .unwrap_or_else(|_| format!("http://127.0.0.1:{}", port));

        let policy = UploadPolicy {
            multipart_threshold: match args.multipart_threshold {
                Some(v) => v,
                None => env_or("UPLOAD_RELAY_MULTIPART_THRESHOLD", DEFAULT_MULTIPART_THRESHOLD)?,
            },
            chunk_size: match args.chunk_size {
                Some(v) => v,
                None => env_or("UPLOAD_RELAY_CHUNK_SIZE", DEFAULT_CHUNK_SIZE)?,
            },
            proxy_ceiling: match args.proxy_ceiling {
                Some(v) => v,
                None => env_or("UPLOAD_RELAY_PROXY_CEILING", DEFAULT_PROXY_CEILING)?,
            },
            credential_ttl_secs: match args.credential_ttl_secs {
                Some(v) => v,
                None => env_or(
                    "UPLOAD_RELAY_CREDENTIAL_TTL_SECS",
                    DEFAULT_CREDENTIAL_TTL_SECS,
                )?,
            },
            verify_whole_file: args.verify_whole_file
                || env_or("UPLOAD_RELAY_VERIFY_WHOLE_FILE", false)?,
        };
        policy
            .validate()
            .map_err(|reason| anyhow!("invalid upload policy: {}", reason))?;

        let backend = args.backend.unwrap_or(env_backend);
        let b2 = match backend {
            BackendKind::Local => None,
            BackendKind::B2 => Some(B2Config {
                key_id: args.b2_key_id.context("B2_KEY_ID is required for the b2 backend")?,
                app_key: args
                    .b2_app_key
                    .context("B2_APP_KEY is required for the b2 backend")?,
                bucket_id: args
                    .b2_bucket_id
                    .context("B2_BUCKET_ID is required for the b2 backend")?,
                auth_url: args.b2_auth_url,
                public_url: args
                    .b2_public_url
                    .context("B2_BUCKET_PUBLIC_URL is required for the b2 backend")?,
            }),
        };

        // --- Merge ---
        Ok(Self {
            host,
            port,
            storage_dir: args.storage_dir.unwrap_or(env_storage),
            database_url: args.database_url.unwrap_or(env_db),
            public_base_url: args.public_url.unwrap_or(env_public),
            backend,
            b2,
            policy,
        })
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
