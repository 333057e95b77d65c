//! HTTP side of the Official Account platform: credential issuance and the
//! authenticated API calls that consume it.

use crate::config::{Config, UpstreamConfig};
use crate::credential::{Credential, CredentialCache, CredentialSource};
use crate::error::{RelayError, RelayResult};
use crate::multipart::{default_filename, AuxiliaryPart, MultipartComposer};
use crate::observability::RelayMetrics;
use anyhow::Context;
use async_trait::async_trait;
use axum::body::Bytes;
use reqwest::header::{CONTENT_LENGTH, CONTENT_TYPE};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Upstream codes meaning the presented credential is no longer accepted.
pub const STALE_CREDENTIAL_CODES: [i64; 3] = [40001, 40014, 42001];
/// Returned by the platform for an app id it does not know.
pub const INVALID_APP_ID: i64 = 40013;

const MEDIA_FIELD: &str = "media";
const DESCRIPTION_FIELD: &str = "description";

pub fn is_stale_credential(code: i64) -> bool {
    STALE_CREDENTIAL_CODES.contains(&code)
}

pub fn build_http_client(cfg: &UpstreamConfig) -> anyhow::Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(cfg.timeout_secs.max(1)))
        .build()
        .context("failed to initialize upstream HTTP client")
}

fn normalize_base(api_base: &str) -> String {
    api_base.trim().trim_end_matches('/').to_string()
}

#[derive(Debug, Default, Deserialize)]
struct ApiStatus {
    #[serde(default)]
    errcode: i64,
    #[serde(default)]
    errmsg: String,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    #[serde(default)]
    access_token: String,
    #[serde(default)]
    expires_in: u64,
}

/// Reads a platform response body. Every endpoint reports failures as a
/// JSON object with a non-zero `errcode`, usually with HTTP 200.
fn parse_response<T: DeserializeOwned>(
    status: reqwest::StatusCode,
    body: &str,
) -> Result<T, ResponseError> {
    if !status.is_success() {
        return Err(ResponseError::Transport(format!(
            "status={status} body={}",
            truncate(body, 200)
        )));
    }
    let api: ApiStatus = serde_json::from_str(body)
        .map_err(|err| ResponseError::Transport(format!("invalid response json: {err}")))?;
    if api.errcode != 0 {
        return Err(ResponseError::Api(RelayError::Upstream {
            code: api.errcode,
            message: api.errmsg,
        }));
    }
    serde_json::from_str(body)
        .map_err(|err| ResponseError::Transport(format!("unexpected response shape: {err}")))
}

enum ResponseError {
    Transport(String),
    Api(RelayError),
}

fn truncate(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

/// Fetches credentials from `GET /cgi-bin/token`.
pub struct HttpCredentialSource {
    http: reqwest::Client,
    api_base: String,
    secrets: HashMap<String, String>,
}

impl HttpCredentialSource {
    pub fn new(http: reqwest::Client, api_base: &str, secrets: HashMap<String, String>) -> Self {
        Self {
            http,
            api_base: normalize_base(api_base),
            secrets,
        }
    }

    pub fn from_config(http: reqwest::Client, cfg: &Config) -> Self {
        let secrets = cfg
            .tenants
            .iter()
            .map(|tenant| (tenant.app_id.clone(), tenant.app_secret.clone()))
            .collect();
        Self::new(http, &cfg.upstream.api_base, secrets)
    }
}

#[async_trait]
impl CredentialSource for HttpCredentialSource {
    async fn fetch(&self, tenant: &str) -> RelayResult<Credential> {
        let Some(secret) = self.secrets.get(tenant) else {
            return Err(RelayError::Upstream {
                code: INVALID_APP_ID,
                message: format!("tenant {} is not configured", crate::config::id_hint(tenant)),
            });
        };

        let response = self
            .http
            .get(format!("{}/cgi-bin/token", self.api_base))
            .query(&[
                ("grant_type", "client_credential"),
                ("appid", tenant),
                ("secret", secret.as_str()),
            ])
            .send()
            .await
            .map_err(|err| RelayError::Retryable(format!("token request failed: {err}")))?;
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|err| RelayError::Retryable(format!("token response unreadable: {err}")))?;

        let token: TokenResponse = match parse_response(status, &body) {
            Ok(token) => token,
            Err(ResponseError::Api(err)) => return Err(err),
            Err(ResponseError::Transport(reason)) => {
                return Err(RelayError::Retryable(format!("token endpoint: {reason}")))
            }
        };
        if token.access_token.is_empty() || token.expires_in == 0 {
            return Err(RelayError::Retryable(
                "token endpoint returned no credential".into(),
            ));
        }
        Ok(Credential::new(token.access_token, token.expires_in))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum MediaType {
    Image,
    Voice,
    Video,
    Thumb,
}

impl MediaType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Image => "image",
            Self::Voice => "voice",
            Self::Video => "video",
            Self::Thumb => "thumb",
        }
    }
}

impl std::fmt::Display for MediaType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Title and introduction required when adding a permanent video.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoDescription {
    pub title: String,
    pub introduction: String,
}

/// Upload result. Temporary uploads report `type` and `created_at`,
/// permanent image material reports `url`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadedMedia {
    #[serde(alias = "thumb_media_id")]
    pub media_id: String,
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

/// A binary payload plus an optional filename.
#[derive(Debug, Clone)]
pub struct MediaUpload {
    pub media_type: MediaType,
    pub payload: Vec<u8>,
    pub filename: Option<String>,
}

impl MediaUpload {
    pub fn new(media_type: MediaType, payload: Vec<u8>) -> Self {
        Self {
            media_type,
            payload,
            filename: None,
        }
    }

    pub fn with_filename(mut self, filename: impl Into<String>) -> Self {
        self.filename = Some(filename.into());
        self
    }

    fn filename(&self) -> String {
        self.filename
            .as_deref()
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .map_or_else(|| default_filename(&self.payload), ToOwned::to_owned)
    }
}

/// Authenticated calls against the platform API. Each call borrows the
/// tenant's cached credential and, when the platform reports it stale,
/// invalidates it and retries once with a fresh one.
pub struct OfficialAccountClient {
    http: reqwest::Client,
    api_base: String,
    credentials: Arc<CredentialCache>,
    composer: MultipartComposer,
    metrics: Option<Arc<RelayMetrics>>,
}

impl OfficialAccountClient {
    pub fn new(http: reqwest::Client, api_base: &str, credentials: Arc<CredentialCache>) -> Self {
        Self {
            http,
            api_base: normalize_base(api_base),
            credentials,
            composer: MultipartComposer::new(),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<RelayMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn credentials(&self) -> &Arc<CredentialCache> {
        &self.credentials
    }

    /// `POST /cgi-bin/media/upload`: temporary media, kept by the platform
    /// for three days.
    pub async fn upload_temporary(
        &self,
        tenant: &str,
        upload: &MediaUpload,
    ) -> RelayResult<UploadedMedia> {
        self.upload(tenant, "/cgi-bin/media/upload", upload, None)
            .await
    }

    /// `POST /cgi-bin/material/add_material`: permanent material. Videos
    /// carry a description part; one is derived from the filename when
    /// none is given.
    pub async fn add_material(
        &self,
        tenant: &str,
        upload: &MediaUpload,
        description: Option<&VideoDescription>,
    ) -> RelayResult<UploadedMedia> {
        let auxiliary = match (upload.media_type, description) {
            (MediaType::Video, Some(description)) => Some(description_part(description)),
            (MediaType::Video, None) => {
                let filename = upload.filename();
                let title = filename
                    .rsplit_once('.')
                    .map_or(filename.as_str(), |(stem, _)| stem)
                    .to_string();
                Some(description_part(&VideoDescription {
                    title,
                    introduction: String::new(),
                }))
            }
            (_, _) => None,
        };
        self.upload(tenant, "/cgi-bin/material/add_material", upload, auxiliary.as_ref())
            .await
    }

    /// Posts a JSON body to an authenticated endpoint such as
    /// `/cgi-bin/message/custom/send`.
    pub async fn post_json(
        &self,
        tenant: &str,
        path: &str,
        payload: &serde_json::Value,
    ) -> RelayResult<serde_json::Value> {
        let url = self.endpoint(path);
        self.call_with_credential(tenant, |token| {
            let request = self
                .http
                .post(&url)
                .query(&[("access_token", token.as_str())])
                .json(payload);
            async move { self.execute(tenant, request).await }
        })
        .await
    }

    async fn upload(
        &self,
        tenant: &str,
        path: &str,
        upload: &MediaUpload,
        auxiliary: Option<&AuxiliaryPart>,
    ) -> RelayResult<UploadedMedia> {
        let filename = upload.filename();
        let composed = self
            .composer
            .compose(&upload.payload, MEDIA_FIELD, &filename, auxiliary);
        // One materialized copy, shared by every attempt.
        let body = Bytes::from(composed.to_bytes());
        let url = self.endpoint(path);
        tracing::info!(
            "uploading {} `{filename}` ({} bytes) for {}",
            upload.media_type,
            composed.content_length(),
            crate::config::id_hint(tenant)
        );

        let uploaded: UploadedMedia = self
            .call_with_credential(tenant, |token| {
                let request = self
                    .http
                    .post(&url)
                    .query(&[
                        ("access_token", token.as_str()),
                        ("type", upload.media_type.as_str()),
                    ])
                    .header(CONTENT_TYPE, composed.content_type())
                    .header(CONTENT_LENGTH, composed.content_length().to_string())
                    .body(body.clone());
                async move { self.execute(tenant, request).await }
            })
            .await?;

        if let Some(metrics) = &self.metrics {
            metrics
                .uploads
                .with_label_values(&[upload.media_type.as_str()])
                .inc();
        }
        Ok(uploaded)
    }

    async fn call_with_credential<T, F, Fut>(&self, tenant: &str, call: F) -> RelayResult<T>
    where
        F: Fn(String) -> Fut,
        Fut: Future<Output = RelayResult<T>>,
    {
        let credential = self.credentials.get_or_refresh(tenant).await?;
        match call(credential.token.clone()).await {
            Err(RelayError::Upstream { code, message }) if is_stale_credential(code) => {
                tracing::info!(
                    "upstream rejected credential for {} ({code}: {message}), refreshing once",
                    crate::config::id_hint(tenant)
                );
                self.invalidate_if_current(tenant, &credential).await;
                let fresh = self.credentials.get_or_refresh(tenant).await?;
                call(fresh.token).await
            }
            other => other,
        }
    }

    /// Drops the cached credential unless another caller already replaced it.
    async fn invalidate_if_current(&self, tenant: &str, rejected: &Credential) {
        let current = match self.credentials.peek(tenant).await {
            Ok(current) => current,
            Err(err) => {
                tracing::warn!("credential lookup before invalidation failed: {err}");
                None
            }
        };
        if current.is_some_and(|current| current.token != rejected.token) {
            return;
        }
        if let Err(err) = self.credentials.invalidate(tenant).await {
            tracing::warn!("credential invalidation failed: {err}");
        }
    }

    async fn execute<T: DeserializeOwned>(
        &self,
        tenant: &str,
        request: reqwest::RequestBuilder,
    ) -> RelayResult<T> {
        let response = request
            .send()
            .await
            .map_err(|err| RelayError::unavailable(tenant, format!("request failed: {err}")))?;
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|err| RelayError::unavailable(tenant, format!("response unreadable: {err}")))?;

        match parse_response(status, &body) {
            Ok(parsed) => Ok(parsed),
            Err(ResponseError::Api(err)) => Err(err),
            Err(ResponseError::Transport(reason)) => Err(RelayError::unavailable(tenant, reason)),
        }
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.api_base, path.trim_start_matches('/'))
    }
}

fn description_part(description: &VideoDescription) -> AuxiliaryPart {
    // Two string fields; encoding cannot fail.
    let json = serde_json::to_string(description).unwrap_or_default();
    AuxiliaryPart::new(DESCRIPTION_FIELD, json)
}
