//! src/services/local_backend.rs
//!
//! LocalBackend: a self-hosted object store that speaks the same upload
//! protocol as B2. Object payloads live on local disk sharded beneath
//! `base_path/{shard}/{shard}/{path}`, multipart parts are staged beneath
//! `base_path/.parts/{session}/{part}`, and session bookkeeping is kept in
//! SQLite. Credentials are random bearer tokens held in memory.

use crate::errors::{UploadError, UploadResult};
use crate::models::multipart::{
    MultipartPartRow, MultipartSessionRow, PartRecord, SESSION_FAILED, SESSION_FINISHED,
    SESSION_FINISHING, SESSION_OPEN,
};
use crate::models::upload::{ContentHash, UploadTarget, sha1_hex};
use crate::services::backend::{AssembledObject, Authorization, ObjectBackend, UploadEndpoint};
use crate::services::part_uploader::PartUploader;
use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose};
use bytes::Bytes;
use chrono::{DateTime, Duration, Utc};
use futures::{Stream, StreamExt, pin_mut};
use sha1::{Digest, Sha1};
use sqlx::SqlitePool;
use std::{
    collections::HashMap,
    io::{self, ErrorKind},
    path::{Path, PathBuf},
    sync::Arc,
};
use tokio::{
    fs::{self, File, OpenOptions},
    io::AsyncWriteExt,
    sync::RwLock,
};
use tracing::{debug, info, warn};
use uuid::Uuid;

const MAX_OBJECT_KEY_LEN: usize = 1024;
const PARTS_DIR: &str = ".parts";

/// What a bearer token issued by this backend is allowed to do.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Grant {
    Account,
    Upload,
    Part { session_id: String },
}

#[derive(Debug, Clone)]
struct IssuedToken {
    grant: Grant,
    expires_at: DateTime<Utc>,
}

/// Outcome of a whole-file upload received by the local store.
#[derive(Debug, Clone)]
pub struct StoredObject {
    pub path: String,
    pub content_hash: String,
    pub size_bytes: i64,
}

#[derive(Clone)]
pub struct LocalBackend {
    /// SQLite pool holding multipart session state.
    pub db: SqlitePool,

    /// Base directory on disk where object payloads are stored.
    pub base_path: PathBuf,

    /// Externally reachable base URL of this server, used in upload URLs.
    pub public_base_url: String,

    credential_ttl: Duration,
    tokens: Arc<RwLock<HashMap<String, IssuedToken>>>,
}

impl std::fmt::Debug for LocalBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalBackend")
            .field("base_path", &self.base_path)
            .field("public_base_url", &self.public_base_url)
            .finish()
    }
}

impl LocalBackend {
    pub fn new(
        db: SqlitePool,
        base_path: impl Into<PathBuf>,
        public_base_url: impl Into<String>,
        credential_ttl: Duration,
    ) -> Self {
        Self {
            db,
            base_path: base_path.into(),
            public_base_url: public_base_url.into().trim_end_matches('/').to_string(),
            credential_ttl,
            tokens: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Reject storage paths that could escape `base_path`.
    fn ensure_key_safe(key: &str) -> UploadResult<()> {
        let invalid = |reason: &str| Err(UploadError::Validation(format!("invalid key: {reason}")));
        if key.is_empty() {
            return invalid("empty");
        }
        if key.len() > MAX_OBJECT_KEY_LEN {
            return invalid("too long");
        }
        if key.starts_with(PARTS_DIR)
            || key
                .split('/')
                .any(|segment| segment.is_empty() || segment == "." || segment == "..")
        {
            return invalid("path traversal");
        }
        if key
            .bytes()
            .any(|b| b.is_ascii_control() || b == b'\\' || b == b'\0')
        {
            return invalid("control characters");
        }
        Ok(())
    }

    /// Generate two-level shard identifiers for an object path.
    ///
    /// Uses MD5(path) and returns the first two bytes as lowercase
    /// hexadecimal strings (00–ff). Reduces file count per directory.
    fn object_shards(key: &str) -> (String, String) {
        let digest = md5::compute(key);
        (format!("{:02x}", digest[0]), format!("{:02x}", digest[1]))
    }

    fn object_path(&self, key: &str) -> PathBuf {
        let (shard_a, shard_b) = Self::object_shards(key);
        let mut path = self.base_path.clone();
        path.push(shard_a);
        path.push(shard_b);
        path.push(key);
        path
    }

    fn session_dir(&self, session_id: &str) -> PathBuf {
        self.base_path.join(PARTS_DIR).join(session_id)
    }

    fn part_path(&self, session_id: &str, part_number: u32) -> PathBuf {
        self.session_dir(session_id).join(part_number.to_string())
    }

    async fn mint_token(&self, grant: Grant) -> (String, DateTime<Utc>) {
        let mut raw = Vec::with_capacity(32);
        raw.extend_from_slice(Uuid::new_v4().as_bytes());
        raw.extend_from_slice(Uuid::new_v4().as_bytes());
        let token = general_purpose::URL_SAFE_NO_PAD.encode(raw);
        let now = Utc::now();
        let expires_at = now + self.credential_ttl;

        let mut tokens = self.tokens.write().await;
        tokens.retain(|_, issued| issued.expires_at > now);
        tokens.insert(token.clone(), IssuedToken { grant, expires_at });
        (token, expires_at)
    }

    async fn check_token(&self, token: &str) -> UploadResult<Grant> {
        let tokens = self.tokens.read().await;
        match tokens.get(token) {
            Some(issued) if issued.expires_at > Utc::now() => Ok(issued.grant.clone()),
            Some(_) => Err(UploadError::AuthFailure("credential expired".into())),
            None => Err(UploadError::AuthFailure("unknown credential".into())),
        }
    }

    async fn check_account(&self, auth: &Authorization) -> UploadResult<()> {
        match self.check_token(&auth.token).await? {
            Grant::Account => Ok(()),
            _ => Err(UploadError::AuthFailure(
                "credential is not an account credential".into(),
            )),
        }
    }

    async fn fetch_session(&self, session_id: &str) -> UploadResult<Option<MultipartSessionRow>> {
        let row = sqlx::query_as::<_, MultipartSessionRow>(
            "SELECT id, canonical_path, content_type, state, created_at
             FROM multipart_sessions WHERE id = ?",
        )
        .bind(session_id)
        .fetch_optional(&self.db)
        .await?;
        Ok(row)
    }

    async fn fetch_parts(&self, session_id: &str) -> UploadResult<Vec<MultipartPartRow>> {
        let rows = sqlx::query_as::<_, MultipartPartRow>(
            "SELECT session_id, part_number, content_hash, size_bytes, uploaded_at
             FROM multipart_parts WHERE session_id = ? ORDER BY part_number ASC",
        )
        .bind(session_id)
        .fetch_all(&self.db)
        .await?;
        Ok(rows)
    }

    /// Move a session that is not yet finished or failed into `state`.
    async fn set_session_state(&self, session_id: &str, state: &str) -> UploadResult<()> {
        sqlx::query("UPDATE multipart_sessions SET state = ? WHERE id = ? AND state IN (?, ?)")
            .bind(state)
            .bind(session_id)
            .bind(SESSION_OPEN)
            .bind(SESSION_FINISHING)
            .execute(&self.db)
            .await?;
        Ok(())
    }

    /// Take exclusive ownership of an open session for assembly. Only one
    /// caller can win; everyone else gets an `Assembly` error.
    async fn claim_session(&self, session_id: &str) -> UploadResult<()> {
        let claimed = sqlx::query("UPDATE multipart_sessions SET state = ? WHERE id = ? AND state = ?")
            .bind(SESSION_FINISHING)
            .bind(session_id)
            .bind(SESSION_OPEN)
            .execute(&self.db)
            .await?
            .rows_affected();
        if claimed == 0 {
            return Err(UploadError::Assembly(format!(
                "session `{session_id}` is no longer open"
            )));
        }
        Ok(())
    }

    /// Stream bytes into `final_path`, hashing as they arrive.
    ///
    /// - Writes to a temporary sibling file, fsyncs, then renames into place.
    /// - Rejects the payload if `expected` is a digest that does not match.
    /// - Cleans up the temporary file on every error path.
    async fn write_verified<S>(
        &self,
        final_path: &Path,
        expected: &ContentHash,
        stream: S,
    ) -> UploadResult<(String, i64)>
    where
        S: Stream<Item = io::Result<Bytes>> + Send,
    {
        let parent = final_path.parent().map(Path::to_path_buf).ok_or_else(|| {
            UploadError::Transfer("object path missing parent directory".into())
        })?;
        fs::create_dir_all(&parent).await?;
        let tmp_path = parent.join(format!(".tmp-{}", Uuid::new_v4()));
        let mut file = File::create(&tmp_path).await?;

        let mut size_bytes: i64 = 0;
        let mut digest = Sha1::new();
        pin_mut!(stream);
        while let Some(chunk_res) = stream.next().await {
            let chunk = match chunk_res {
                Ok(chunk) => chunk,
                Err(err) => {
                    let _ = fs::remove_file(&tmp_path).await;
                    return Err(UploadError::Transfer(format!("body stream failed: {err}")));
                }
            };
            size_bytes += chunk.len() as i64;
            digest.update(&chunk);
            if let Err(err) = file.write_all(&chunk).await {
                let _ = fs::remove_file(&tmp_path).await;
                return Err(err.into());
            }
        }
        if let Err(err) = file.flush().await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(err.into());
        }
        if let Err(err) = file.sync_all().await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(err.into());
        }

        let actual = hex::encode(digest.finalize());
        if let ContentHash::Sha1(declared) = expected {
            if *declared != actual {
                let _ = fs::remove_file(&tmp_path).await;
                return Err(UploadError::Transfer(format!(
                    "sha1 mismatch: declared {declared}, received {actual}"
                )));
            }
        }

        if let Err(err) = fs::rename(&tmp_path, final_path).await {
            if err.kind() == ErrorKind::AlreadyExists {
                fs::remove_file(final_path).await?;
                fs::rename(&tmp_path, final_path).await?;
            } else {
                let _ = fs::remove_file(&tmp_path).await;
                return Err(err.into());
            }
        }

        Ok((actual, size_bytes))
    }

    /// Receive a whole file sent to an upload URL minted by `get_upload_url`.
    pub async fn receive_file<S>(
        &self,
        token: &str,
        file_name: &str,
        expected: ContentHash,
        stream: S,
    ) -> UploadResult<StoredObject>
    where
        S: Stream<Item = io::Result<Bytes>> + Send,
    {
        if self.check_token(token).await? != Grant::Upload {
            return Err(UploadError::AuthFailure(
                "credential does not allow whole-file uploads".into(),
            ));
        }
        Self::ensure_key_safe(file_name)?;

        let file_path = self.object_path(file_name);
        let (content_hash, size_bytes) = self.write_verified(&file_path, &expected, stream).await?;
        debug!(path = file_name, size_bytes, "stored object");

        Ok(StoredObject {
            path: file_name.to_string(),
            content_hash,
            size_bytes,
        })
    }

    /// Receive one part sent to an upload URL minted by `get_upload_part_url`.
    pub async fn receive_part<S>(
        &self,
        token: &str,
        part_number: u32,
        expected: ContentHash,
        stream: S,
    ) -> UploadResult<PartRecord>
    where
        S: Stream<Item = io::Result<Bytes>> + Send,
    {
        let session_id = match self.check_token(token).await? {
            Grant::Part { session_id } => session_id,
            _ => {
                return Err(UploadError::AuthFailure(
                    "credential does not allow part uploads".into(),
                ));
            }
        };
        if part_number == 0 {
            return Err(UploadError::Validation("part numbers start at 1".into()));
        }
        if expected == ContentHash::Unverified {
            return Err(UploadError::Validation(
                "part uploads require a SHA-1 digest".into(),
            ));
        }
        match self.fetch_session(&session_id).await? {
            Some(session) if session.is_open() => {}
            _ => {
                return Err(UploadError::Upstream(format!(
                    "session `{session_id}` is not open"
                )));
            }
        }

        let part_path = self.part_path(&session_id, part_number);
        let (content_hash, size_bytes) = self.write_verified(&part_path, &expected, stream).await?;

        sqlx::query(
            "INSERT INTO multipart_parts (session_id, part_number, content_hash, size_bytes, uploaded_at)
             VALUES (?, ?, ?, ?, ?)
             ON CONFLICT(session_id, part_number) DO UPDATE SET
                content_hash = excluded.content_hash,
                size_bytes = excluded.size_bytes,
                uploaded_at = excluded.uploaded_at",
        )
        .bind(&session_id)
        .bind(part_number as i64)
        .bind(&content_hash)
        .bind(size_bytes)
        .bind(Utc::now())
        .execute(&self.db)
        .await?;

        debug!(session_id = %session_id, part_number, size_bytes, "stored part");
        Ok(PartRecord {
            part_number,
            sha1: content_hash,
        })
    }

    /// Open a stored object for reading. `None` if nothing is stored at `key`.
    pub async fn open_object(&self, key: &str) -> UploadResult<Option<(File, u64)>> {
        Self::ensure_key_safe(key)?;
        let path = self.object_path(key);
        let file = match File::open(&path).await {
            Ok(file) => file,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        let len = file.metadata().await?.len();
        Ok(Some((file, len)))
    }

    /// Concatenate staged parts in order into the final object.
    async fn assemble(&self, session: &MultipartSessionRow, parts: &[PartRecord]) -> UploadResult<u64> {
        let final_path = self.object_path(&session.canonical_path);
        let parent = final_path.parent().map(Path::to_path_buf).ok_or_else(|| {
            UploadError::Assembly("object path missing parent directory".into())
        })?;
        fs::create_dir_all(&parent).await?;
        let tmp_path = parent.join(format!(".tmp-{}", Uuid::new_v4()));
        let mut out = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp_path)
            .await?;

        let mut total: u64 = 0;
        for part in parts {
            let part_path = self.part_path(&session.id, part.part_number);
            let mut input = match File::open(&part_path).await {
                Ok(f) => f,
                Err(err) => {
                    let _ = fs::remove_file(&tmp_path).await;
                    return Err(UploadError::Assembly(format!(
                        "part {} missing on disk: {err}",
                        part.part_number
                    )));
                }
            };
            match tokio::io::copy(&mut input, &mut out).await {
                Ok(copied) => total += copied,
                Err(err) => {
                    let _ = fs::remove_file(&tmp_path).await;
                    return Err(err.into());
                }
            }
        }
        out.sync_all().await?;
        drop(out);
        fs::rename(&tmp_path, &final_path).await?;
        Ok(total)
    }
}

#[async_trait]
impl ObjectBackend for LocalBackend {
    async fn authorize(&self) -> UploadResult<Authorization> {
        let (token, expires_at) = self.mint_token(Grant::Account).await;
        Ok(Authorization {
            api_url: self.public_base_url.clone(),
            token,
            expires_at,
        })
    }

    async fn get_upload_url(&self, auth: &Authorization) -> UploadResult<UploadEndpoint> {
        self.check_account(auth).await?;
        let (token, _) = self.mint_token(Grant::Upload).await;
        Ok(UploadEndpoint {
            upload_url: format!("{}/storage/upload", self.public_base_url),
            authorization_token: token,
        })
    }

    async fn start_large_file(
        &self,
        auth: &Authorization,
        file_name: &str,
        content_type: &str,
    ) -> UploadResult<String> {
        self.check_account(auth).await?;
        Self::ensure_key_safe(file_name)?;

        let session_id = Uuid::new_v4().to_string();
        sqlx::query(
            "INSERT INTO multipart_sessions (id, canonical_path, content_type, state, created_at)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&session_id)
        .bind(file_name)
        .bind(content_type)
        .bind(SESSION_OPEN)
        .bind(Utc::now())
        .execute(&self.db)
        .await?;

        info!(session_id = %session_id, path = file_name, "opened multipart session");
        Ok(session_id)
    }

    async fn get_upload_part_url(
        &self,
        auth: &Authorization,
        file_id: &str,
    ) -> UploadResult<UploadEndpoint> {
        self.check_account(auth).await?;
        match self.fetch_session(file_id).await? {
            Some(session) if session.is_open() => {}
            Some(session) => {
                return Err(UploadError::Upstream(format!(
                    "session `{file_id}` is {}",
                    session.state
                )));
            }
            None => {
                return Err(UploadError::Upstream(format!(
                    "session `{file_id}` does not exist"
                )));
            }
        }
        let (token, _) = self
            .mint_token(Grant::Part {
                session_id: file_id.to_string(),
            })
            .await;
        Ok(UploadEndpoint {
            upload_url: format!("{}/storage/upload-part", self.public_base_url),
            authorization_token: token,
        })
    }

    async fn finish_large_file(
        &self,
        auth: &Authorization,
        file_id: &str,
        parts: &[PartRecord],
    ) -> UploadResult<AssembledObject> {
        self.check_account(auth).await?;
        let session = match self.fetch_session(file_id).await? {
            Some(session) if session.is_open() => session,
            Some(session) => {
                return Err(UploadError::Assembly(format!(
                    "session `{file_id}` is {}",
                    session.state
                )));
            }
            None => {
                return Err(UploadError::Assembly(format!(
                    "session `{file_id}` does not exist"
                )));
            }
        };
        self.claim_session(file_id).await?;

        let stored = self.fetch_parts(file_id).await?;
        if stored.len() != parts.len() {
            self.set_session_state(file_id, SESSION_FAILED).await?;
            return Err(UploadError::Assembly(format!(
                "{} parts submitted but {} were uploaded",
                parts.len(),
                stored.len()
            )));
        }
        for (submitted, received) in parts.iter().zip(&stored) {
            if submitted.part_number as i64 != received.part_number
                || !submitted.sha1.eq_ignore_ascii_case(&received.content_hash)
            {
                self.set_session_state(file_id, SESSION_FAILED).await?;
                return Err(UploadError::Assembly(format!(
                    "part {} does not match the uploaded part",
                    submitted.part_number
                )));
            }
        }

        let total = match self.assemble(&session, parts).await {
            Ok(total) => total,
            Err(err) => {
                self.set_session_state(file_id, SESSION_FAILED).await?;
                return Err(err);
            }
        };
        self.set_session_state(file_id, SESSION_FINISHED).await?;

        let session_dir = self.session_dir(file_id);
        if let Err(err) = fs::remove_dir_all(&session_dir).await {
            if err.kind() != ErrorKind::NotFound {
                warn!(
                    "failed to remove part directory {}: {}",
                    session_dir.display(),
                    err
                );
            }
        }

        info!(session_id = file_id, path = %session.canonical_path, bytes = total, "assembled large file");
        Ok(AssembledObject {
            file_id: file_id.to_string(),
            file_name: session.canonical_path,
            content_length: Some(total),
        })
    }

    async fn mark_session_unusable(&self, file_id: &str) -> UploadResult<()> {
        self.set_session_state(file_id, SESSION_FAILED).await
    }

    fn public_url(&self, path: &str) -> String {
        format!("{}/storage/file/{}", self.public_base_url, path)
    }

    fn backend_name(&self) -> &'static str {
        "local"
    }
}

/// Relay path: the server hands bytes straight to its own store instead of
/// going back out over HTTP.
#[async_trait]
impl PartUploader for LocalBackend {
    async fn upload_part(
        &self,
        target: &UploadTarget,
        part_number: Option<u32>,
        bytes: Bytes,
        _content_type: &str,
    ) -> UploadResult<ContentHash> {
        let hash = ContentHash::Sha1(sha1_hex(&bytes));
        let stream = futures::stream::once(async move { Ok::<_, io::Error>(bytes) });
        match part_number {
            None => {
                self.receive_file(
                    &target.authorization_token,
                    &target.upload_path,
                    hash.clone(),
                    stream,
                )
                .await?;
            }
            Some(n) => {
                self.receive_part(&target.authorization_token, n, hash.clone(), stream)
                    .await?;
            }
        }
        Ok(hash)
    }
}
