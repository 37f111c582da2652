use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};

use super::decode_document;
use super::remote::{DocumentStore, VersionedDocument};
use crate::error::StoreError;
use crate::settings::RemoteLogSettings;

pub const GITHUB_API_BASE: &str = "https://api.github.com";
pub const STORE_TIMEOUT: Duration = Duration::from_secs(10);

const JSON_MEDIA_TYPE: &str = "application/vnd.github.v3+json";
const RAW_MEDIA_TYPE: &str = "application/vnd.github.raw";

/// One file in a repository, read and written through the contents API.
/// The blob `sha` is the version token.
#[derive(Clone)]
pub struct GitHubContentsStore {
    api_base: String,
    settings: RemoteLogSettings,
    timeout: Duration,
    client: reqwest::Client,
}

impl GitHubContentsStore {
    pub fn new(settings: RemoteLogSettings) -> Self {
        Self::with_api_base(GITHUB_API_BASE, settings)
    }

    pub fn with_api_base(api_base: impl Into<String>, settings: RemoteLogSettings) -> Self {
        Self { api_base: api_base.into(), settings, timeout: STORE_TIMEOUT, client: reqwest::Client::new() }
    }

    fn url(&self) -> String {
        format!(
            "{}/repos/{}/contents/{}",
            self.api_base.trim_end_matches('/'),
            self.settings.repo,
            self.settings.path.trim_start_matches('/')
        )
    }

    fn request(&self, method: reqwest::Method, accept: &str) -> reqwest::RequestBuilder {
        self.client
            .request(method, self.url())
            .timeout(self.timeout)
            .header("Authorization", format!("token {}", self.settings.token))
            .header("Accept", accept)
            .header("User-Agent", concat!("tonekit/", env!("CARGO_PKG_VERSION")))
    }

    /// Files over 1 MB come back from the JSON endpoint without inline content.
    async fn get_raw(&self, expected_size: u64) -> Result<String, StoreError> {
        let resp = self
            .request(reqwest::Method::GET, RAW_MEDIA_TYPE)
            .query(&[("ref", self.settings.branch.as_str())])
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(status_error(resp).await);
        }
        let bytes = resp.bytes().await?;
        if (bytes.len() as u64) < expected_size {
            return Err(StoreError::Decode(format!(
                "raw document has {} bytes, expected at least {expected_size}",
                bytes.len()
            )));
        }
        Ok(decode_document(bytes.to_vec(), "github"))
    }
}

#[derive(Debug, Deserialize)]
struct ContentsResponse {
    #[serde(default)]
    content: String,
    #[serde(default)]
    encoding: Option<String>,
    #[serde(default)]
    size: u64,
    sha: String,
}

#[derive(Debug, Serialize)]
struct PutContents<'a> {
    message: &'a str,
    content: String,
    branch: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    sha: Option<&'a str>,
}

async fn status_error(resp: reqwest::Response) -> StoreError {
    let status = resp.status();
    if matches!(status, StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) {
        return StoreError::Unauthorized(status.as_u16());
    }
    let body = resp.text().await.unwrap_or_default();
    StoreError::Status { status: status.as_u16(), body }
}

#[async_trait]
impl DocumentStore for GitHubContentsStore {
    async fn get(&self) -> Result<Option<VersionedDocument>, StoreError> {
        let resp = self
            .request(reqwest::Method::GET, JSON_MEDIA_TYPE)
            .query(&[("ref", self.settings.branch.as_str())])
            .send()
            .await?;
        match resp.status() {
            StatusCode::OK => {
                let body: ContentsResponse = resp.json().await?;
                let inline = body.content.trim();
                let content = match body.encoding.as_deref() {
                    Some("base64") | None if !inline.is_empty() || body.size == 0 => {
                        // The API wraps base64 at 60 columns.
                        let packed: String = inline.split_whitespace().collect();
                        let bytes = STANDARD.decode(packed).map_err(|e| StoreError::Decode(e.to_string()))?;
                        if (bytes.len() as u64) < body.size {
                            return Err(StoreError::Decode(format!(
                                "inline content has {} bytes, file has {}",
                                bytes.len(),
                                body.size
                            )));
                        }
                        decode_document(bytes, "github")
                    }
                    Some("base64") | Some("none") | None => self.get_raw(body.size).await?,
                    Some(other) => return Err(StoreError::Decode(format!("unsupported content encoding {other}"))),
                };
                Ok(Some(VersionedDocument { content, version: body.sha }))
            }
            StatusCode::NOT_FOUND => Ok(None),
            _ => Err(status_error(resp).await),
        }
    }

    async fn put(&self, content: &str, version: Option<&str>, message: &str) -> Result<(), StoreError> {
        let body = PutContents {
            message,
            content: STANDARD.encode(content.as_bytes()),
            branch: &self.settings.branch,
            sha: version,
        };
        let resp = self.request(reqwest::Method::PUT, JSON_MEDIA_TYPE).json(&body).send().await?;
        match resp.status() {
            StatusCode::OK | StatusCode::CREATED => Ok(()),
            StatusCode::CONFLICT => Err(StoreError::Conflict),
            // Creating without a sha while another writer already created the file.
            StatusCode::UNPROCESSABLE_ENTITY if version.is_none() => Err(StoreError::Conflict),
            _ => Err(status_error(resp).await),
        }
    }
}
