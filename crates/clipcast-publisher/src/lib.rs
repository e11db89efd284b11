//! Target platform contract + the Twitter v1.1 client (OAuth 1.0a, chunked media upload).

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use chrono::Utc;
use hmac::{Hmac, Mac};
use reqwest::multipart::{Form, Part};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha1::Sha1;
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tracing::{debug, info};
use uuid::Uuid;

pub const CRATE_NAME: &str = "clipcast-publisher";

/// Time the platform needs after acknowledging an upload before the media handle is usable.
pub const MEDIA_SETTLE_DELAY: Duration = Duration::from_secs(5);

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

const UPLOAD_ENDPOINT: &str = "https://upload.twitter.com/1.1/media/upload.json";
const STATUS_UPDATE_ENDPOINT: &str = "https://api.twitter.com/1.1/statuses/update.json";

/// Segment size for APPEND commands.
pub const UPLOAD_CHUNK_BYTES: usize = 5 * 1024 * 1024;

const MAX_PROCESSING_POLLS: usize = 60;
const MAX_PROCESSING_WAIT: Duration = Duration::from_secs(30);

type HmacSha1 = Hmac<Sha1>;

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("network error calling {endpoint}: {source}")]
    Network {
        endpoint: &'static str,
        #[source]
        source: reqwest::Error,
    },
    #[error("platform rejected {endpoint} (status {status}): {message}")]
    Api {
        endpoint: &'static str,
        status: u16,
        message: String,
    },
    #[error("io error reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("media {media_id} processing failed: {reason}")]
    Processing { media_id: String, reason: String },
    #[error("request signing failed: {0}")]
    Signing(String),
}

/// Opaque media identifier returned by the platform after an upload.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MediaHandle(pub String);

impl MediaHandle {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MediaHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostedStatus {
    pub id: String,
}

/// Where published activities end up.
#[async_trait]
pub trait PublishTarget: Send + Sync {
    /// Uploads a local media file and returns the handle once the platform has accepted it.
    async fn upload_media(&self, path: &Path) -> Result<MediaHandle, PublishError>;

    async fn post_status(
        &self,
        status: &str,
        media: &[MediaHandle],
    ) -> Result<PostedStatus, PublishError>;
}

#[derive(Clone)]
pub struct OAuthCredentials {
    pub consumer_key: String,
    pub consumer_secret: String,
    pub access_token: String,
    pub access_token_secret: String,
}

impl fmt::Debug for OAuthCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OAuthCredentials")
            .field("consumer_key", &self.consumer_key)
            .field("access_token", &self.access_token)
            .finish_non_exhaustive()
    }
}

fn percent_encode(input: &str) -> String {
    urlencoding::encode(input).into_owned()
}

impl OAuthCredentials {
    fn oauth_params(&self, nonce: &str, timestamp: i64) -> Vec<(String, String)> {
        vec![
            ("oauth_consumer_key".into(), self.consumer_key.clone()),
            ("oauth_nonce".into(), nonce.to_string()),
            ("oauth_signature_method".into(), "HMAC-SHA1".into()),
            ("oauth_timestamp".into(), timestamp.to_string()),
            ("oauth_token".into(), self.access_token.clone()),
            ("oauth_version".into(), "1.0".into()),
        ]
    }

    /// HMAC-SHA1 request signature. `params` holds query and form parameters; multipart
    /// bodies are not signed.
    pub fn signature(
        &self,
        method: &str,
        url: &str,
        params: &[(&str, &str)],
        nonce: &str,
        timestamp: i64,
    ) -> Result<String, PublishError> {
        let mut pairs = params
            .iter()
            .map(|(k, v)| (percent_encode(k), percent_encode(v)))
            .chain(
                self.oauth_params(nonce, timestamp)
                    .iter()
                    .map(|(k, v)| (percent_encode(k), percent_encode(v))),
            )
            .collect::<Vec<_>>();
        pairs.sort();

        let param_string = pairs
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join("&");
        let base = format!(
            "{}&{}&{}",
            method.to_ascii_uppercase(),
            percent_encode(url),
            percent_encode(&param_string)
        );
        let key = format!(
            "{}&{}",
            percent_encode(&self.consumer_secret),
            percent_encode(&self.access_token_secret)
        );

        let mut mac = HmacSha1::new_from_slice(key.as_bytes())
            .map_err(|e| PublishError::Signing(e.to_string()))?;
        mac.update(base.as_bytes());
        Ok(base64::engine::general_purpose::STANDARD.encode(mac.finalize().into_bytes()))
    }

    pub fn authorization_header(
        &self,
        method: &str,
        url: &str,
        params: &[(&str, &str)],
        nonce: &str,
        timestamp: i64,
    ) -> Result<String, PublishError> {
        let signature = self.signature(method, url, params, nonce, timestamp)?;
        let mut oauth = self.oauth_params(nonce, timestamp);
        oauth.push(("oauth_signature".into(), signature));
        let fields = oauth
            .iter()
            .map(|(k, v)| format!("{}=\"{}\"", percent_encode(k), percent_encode(v)))
            .collect::<Vec<_>>()
            .join(", ");
        Ok(format!("OAuth {fields}"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaKind {
    pub media_type: &'static str,
    pub category: &'static str,
}

pub fn media_kind_for(path: &Path) -> MediaKind {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "gif" => MediaKind {
            media_type: "image/gif",
            category: "tweet_gif",
        },
        "jpg" | "jpeg" => MediaKind {
            media_type: "image/jpeg",
            category: "tweet_image",
        },
        "png" => MediaKind {
            media_type: "image/png",
            category: "tweet_image",
        },
        _ => MediaKind {
            media_type: "video/mp4",
            category: "tweet_video",
        },
    }
}

#[derive(Debug, Deserialize)]
struct UploadResponse {
    media_id_string: String,
    #[serde(default)]
    processing_info: Option<ProcessingInfo>,
}

#[derive(Debug, Clone, Deserialize)]
struct ProcessingInfo {
    state: String,
    #[serde(default)]
    check_after_secs: Option<u64>,
    #[serde(default)]
    error: Option<ProcessingFailure>,
}

#[derive(Debug, Clone, Deserialize)]
struct ProcessingFailure {
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StatusResponse {
    id_str: String,
}

#[derive(Debug, Clone)]
pub struct TwitterClient {
    client: reqwest::Client,
    credentials: OAuthCredentials,
}

impl TwitterClient {
    pub fn new(credentials: OAuthCredentials, timeout: Duration) -> Result<Self, PublishError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|source| PublishError::Network {
                endpoint: "client",
                source,
            })?;
        Ok(Self {
            client,
            credentials,
        })
    }

    fn authorize(
        &self,
        method: &str,
        url: &str,
        params: &[(&str, &str)],
    ) -> Result<String, PublishError> {
        let nonce = Uuid::new_v4().simple().to_string();
        self.credentials
            .authorization_header(method, url, params, &nonce, Utc::now().timestamp())
    }

    async fn post_form<T: DeserializeOwned>(
        &self,
        endpoint: &'static str,
        params: &[(&str, &str)],
    ) -> Result<T, PublishError> {
        let auth = self.authorize("POST", endpoint, params)?;
        let resp = self
            .client
            .post(endpoint)
            .header(reqwest::header::AUTHORIZATION, auth)
            .form(params)
            .send()
            .await
            .map_err(|source| PublishError::Network { endpoint, source })?;
        read_json(endpoint, resp).await
    }

    async fn init_upload(&self, total_bytes: u64, kind: MediaKind) -> Result<String, PublishError> {
        let total = total_bytes.to_string();
        let init: UploadResponse = self
            .post_form(
                UPLOAD_ENDPOINT,
                &[
                    ("command", "INIT"),
                    ("total_bytes", total.as_str()),
                    ("media_type", kind.media_type),
                    ("media_category", kind.category),
                ],
            )
            .await?;
        Ok(init.media_id_string)
    }

    async fn append_segment(
        &self,
        media_id: &str,
        segment_index: usize,
        chunk: Vec<u8>,
    ) -> Result<(), PublishError> {
        let auth = self.authorize("POST", UPLOAD_ENDPOINT, &[])?;
        let form = Form::new()
            .text("command", "APPEND")
            .text("media_id", media_id.to_string())
            .text("segment_index", segment_index.to_string())
            .part("media", Part::bytes(chunk).file_name("media"));
        let resp = self
            .client
            .post(UPLOAD_ENDPOINT)
            .header(reqwest::header::AUTHORIZATION, auth)
            .multipart(form)
            .send()
            .await
            .map_err(|source| PublishError::Network {
                endpoint: UPLOAD_ENDPOINT,
                source,
            })?;
        ensure_success(UPLOAD_ENDPOINT, resp).await.map(|_| ())
    }

    async fn upload_status(&self, media_id: &str) -> Result<UploadResponse, PublishError> {
        let params = [("command", "STATUS"), ("media_id", media_id)];
        let auth = self.authorize("GET", UPLOAD_ENDPOINT, &params)?;
        let resp = self
            .client
            .get(UPLOAD_ENDPOINT)
            .header(reqwest::header::AUTHORIZATION, auth)
            .query(&params)
            .send()
            .await
            .map_err(|source| PublishError::Network {
                endpoint: UPLOAD_ENDPOINT,
                source,
            })?;
        read_json(UPLOAD_ENDPOINT, resp).await
    }

    async fn await_processing(
        &self,
        media_id: &str,
        mut info: Option<ProcessingInfo>,
    ) -> Result<(), PublishError> {
        for _ in 0..MAX_PROCESSING_POLLS {
            let Some(current) = info.take() else {
                return Ok(());
            };
            match current.state.as_str() {
                "succeeded" => return Ok(()),
                "failed" => {
                    return Err(PublishError::Processing {
                        media_id: media_id.to_string(),
                        reason: current
                            .error
                            .and_then(|e| e.message)
                            .unwrap_or_else(|| "unknown".to_string()),
                    })
                }
                state => {
                    let wait = Duration::from_secs(current.check_after_secs.unwrap_or(1))
                        .min(MAX_PROCESSING_WAIT);
                    debug!(media_id, state, wait_secs = wait.as_secs(), "media processing");
                    tokio::time::sleep(wait).await;
                    info = self.upload_status(media_id).await?.processing_info;
                }
            }
        }
        Err(PublishError::Processing {
            media_id: media_id.to_string(),
            reason: "processing did not finish".to_string(),
        })
    }
}

#[async_trait]
impl PublishTarget for TwitterClient {
    async fn upload_media(&self, path: &Path) -> Result<MediaHandle, PublishError> {
        let io = |source| PublishError::Io {
            path: path.to_path_buf(),
            source,
        };
        let mut file = tokio::fs::File::open(path).await.map_err(io)?;
        let total_bytes = file.metadata().await.map_err(io)?.len();
        let kind = media_kind_for(path);

        let media_id = self.init_upload(total_bytes, kind).await?;
        debug!(media_id = %media_id, total_bytes, "upload initialised");

        let mut segment_index = 0usize;
        loop {
            let mut chunk = Vec::with_capacity(UPLOAD_CHUNK_BYTES);
            let read = (&mut file)
                .take(UPLOAD_CHUNK_BYTES as u64)
                .read_to_end(&mut chunk)
                .await
                .map_err(io)?;
            if read == 0 {
                break;
            }
            self.append_segment(&media_id, segment_index, chunk).await?;
            segment_index += 1;
        }

        let finalized: UploadResponse = self
            .post_form(
                UPLOAD_ENDPOINT,
                &[("command", "FINALIZE"), ("media_id", media_id.as_str())],
            )
            .await?;
        self.await_processing(&finalized.media_id_string, finalized.processing_info)
            .await?;

        info!(media_id = %media_id, segments = segment_index, "media uploaded");
        Ok(MediaHandle(media_id))
    }

    async fn post_status(
        &self,
        status: &str,
        media: &[MediaHandle],
    ) -> Result<PostedStatus, PublishError> {
        let media_ids = media
            .iter()
            .map(MediaHandle::as_str)
            .collect::<Vec<_>>()
            .join(",");
        let mut params = vec![("status", status)];
        if !media_ids.is_empty() {
            params.push(("media_ids", media_ids.as_str()));
        }
        let posted: StatusResponse = self.post_form(STATUS_UPDATE_ENDPOINT, &params).await?;
        Ok(PostedStatus { id: posted.id_str })
    }
}

async fn ensure_success(
    endpoint: &'static str,
    resp: reqwest::Response,
) -> Result<reqwest::Response, PublishError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let message = resp.text().await.unwrap_or_default();
    Err(PublishError::Api {
        endpoint,
        status: status.as_u16(),
        message,
    })
}

async fn read_json<T: DeserializeOwned>(
    endpoint: &'static str,
    resp: reqwest::Response,
) -> Result<T, PublishError> {
    ensure_success(endpoint, resp)
        .await?
        .json()
        .await
        .map_err(|source| PublishError::Network { endpoint, source })
}
