//! Backblaze B2 native API backend.
//!
//! Every call goes over `reqwest`; nothing is cached between calls, so each
//! logical operation starts with its own `b2_authorize_account`.

use crate::errors::{UploadError, UploadResult};
use crate::models::multipart::PartRecord;
use crate::services::backend::{AssembledObject, Authorization, ObjectBackend, UploadEndpoint};
use async_trait::async_trait;
use chrono::{Duration, Utc};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use tracing::{debug, warn};

pub const DEFAULT_B2_AUTH_URL: &str = "https://api.backblazeb2.com";

/// B2 account tokens are valid for 24 hours.
const B2_TOKEN_LIFETIME_HOURS: i64 = 24;

#[derive(Clone)]
pub struct B2Config {
    pub key_id: String,
    pub app_key: String,
    pub bucket_id: String,
    pub auth_url: String,
    /// Base of public read URLs, e.g. `https://f004.backblazeb2.com/file/bucket`.
    pub public_url: String,
}

impl std::fmt::Debug for B2Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("B2Config")
            .field("key_id", &self.key_id)
            .field("app_key", &"<redacted>")
            .field("bucket_id", &self.bucket_id)
            .field("auth_url", &self.auth_url)
            .field("public_url", &self.public_url)
            .finish()
    }
}

#[derive(Clone, Debug)]
pub struct B2Backend {
    http: reqwest::Client,
    config: B2Config,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct AuthorizeAccountResponse {
    authorization_token: String,
    api_url: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct UploadUrlResponse {
    upload_url: String,
    authorization_token: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct StartLargeFileResponse {
    file_id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct FinishLargeFileResponse {
    file_id: String,
    file_name: String,
    content_length: Option<u64>,
}

#[derive(Deserialize, Default)]
struct B2ErrorBody {
    #[serde(default)]
    code: String,
    #[serde(default)]
    message: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct BucketRequest<'a> {
    bucket_id: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct StartLargeFileRequest<'a> {
    bucket_id: &'a str,
    file_name: &'a str,
    content_type: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct FileIdRequest<'a> {
    file_id: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct FinishLargeFileRequest<'a> {
    file_id: &'a str,
    part_sha1_array: Vec<&'a str>,
}

impl B2Backend {
    pub fn new(config: B2Config) -> Self {
        Self {
            http: reqwest::Client::new(),
            config,
        }
    }

    /// POST a JSON body to `{apiUrl}/b2api/v2/{operation}`.
    async fn call<B, T>(&self, auth: &Authorization, operation: &str, body: &B) -> UploadResult<T>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let url = format!("{}/b2api/v2/{}", auth.api_url, operation);
        debug!(operation, "calling B2");
        let response = self
            .http
            .post(&url)
            .header(reqwest::header::AUTHORIZATION, &auth.token)
            .json(body)
            .send()
            .await
            .map_err(|err| UploadError::Upstream(format!("{operation}: {err}")))?;

        let status = response.status();
        if !status.is_success() {
            let err: B2ErrorBody = response.json().await.unwrap_or_default();
            warn!(operation, %status, code = %err.code, "B2 call rejected");
            return Err(match status {
                StatusCode::UNAUTHORIZED => {
                    UploadError::AuthFailure(format!("{operation}: {}", err.message))
                }
                _ => UploadError::Upstream(format!(
                    "{operation} ({status}, {}): {}",
                    err.code, err.message
                )),
            });
        }

        response
            .json()
            .await
            .map_err(|err| UploadError::Upstream(format!("{operation}: malformed response: {err}")))
    }
}

#[async_trait]
impl ObjectBackend for B2Backend {
    async fn authorize(&self) -> UploadResult<Authorization> {
        let url = format!(
            "{}/b2api/v2/b2_authorize_account",
            self.config.auth_url.trim_end_matches('/')
        );
        let response = self
            .http
            .get(&url)
            .basic_auth(&self.config.key_id, Some(&self.config.app_key))
            .send()
            .await
            .map_err(|err| UploadError::AuthFailure(format!("storage unreachable: {err}")))?;

        let status = response.status();
        if !status.is_success() {
            let err: B2ErrorBody = response.json().await.unwrap_or_default();
            return Err(UploadError::AuthFailure(format!(
                "b2_authorize_account ({status}): {}",
                err.message
            )));
        }

        let body: AuthorizeAccountResponse = response
            .json()
            .await
            .map_err(|err| UploadError::AuthFailure(format!("malformed authorization: {err}")))?;

        Ok(Authorization {
            api_url: body.api_url,
            token: body.authorization_token,
            expires_at: Utc::now() + Duration::hours(B2_TOKEN_LIFETIME_HOURS),
        })
    }

    async fn get_upload_url(&self, auth: &Authorization) -> UploadResult<UploadEndpoint> {
        let body: UploadUrlResponse = self
            .call(
                auth,
                "b2_get_upload_url",
                &BucketRequest {
                    bucket_id: &self.config.bucket_id,
                },
            )
            .await?;
        Ok(UploadEndpoint {
            upload_url: body.upload_url,
            authorization_token: body.authorization_token,
        })
    }

    async fn start_large_file(
        &self,
        auth: &Authorization,
        file_name: &str,
        content_type: &str,
    ) -> UploadResult<String> {
        let body: StartLargeFileResponse = self
            .call(
                auth,
                "b2_start_large_file",
                &StartLargeFileRequest {
                    bucket_id: &self.config.bucket_id,
                    file_name,
                    content_type,
                },
            )
            .await?;
        Ok(body.file_id)
    }

    async fn get_upload_part_url(
        &self,
        auth: &Authorization,
        file_id: &str,
    ) -> UploadResult<UploadEndpoint> {
        let body: UploadUrlResponse = self
            .call(auth, "b2_get_upload_part_url", &FileIdRequest { file_id })
            .await?;
        Ok(UploadEndpoint {
            upload_url: body.upload_url,
            authorization_token: body.authorization_token,
        })
    }

    async fn finish_large_file(
        &self,
        auth: &Authorization,
        file_id: &str,
        parts: &[PartRecord],
    ) -> UploadResult<AssembledObject> {
        let request = FinishLargeFileRequest {
            file_id,
            part_sha1_array: parts.iter().map(|p| p.sha1.as_str()).collect(),
        };
        let body: FinishLargeFileResponse = self
            .call(auth, "b2_finish_large_file", &request)
            .await
            .map_err(|err| match err {
                UploadError::Upstream(msg) => UploadError::Assembly(msg),
                other => other,
            })?;
        Ok(AssembledObject {
            file_id: body.file_id,
            file_name: body.file_name,
            content_length: body.content_length,
        })
    }

    fn public_url(&self, path: &str) -> String {
        format!("{}/{}", self.config.public_url.trim_end_matches('/'), path)
    }

    fn backend_name(&self) -> &'static str {
        "b2"
    }
}
