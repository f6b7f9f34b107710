use std::sync::atomic::AtomicBool;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use log::{debug, info, warn};
use reqwest::Client;
use reqwest::header::{ACCEPT, HeaderMap, HeaderValue};

use crate::error::{BunkitError, Result};
use crate::platform::{GITHUB_OWNER, GITHUB_REPO};
use crate::util::{cancel_requested, preallocation, progress_percent, wait_for_cancel};

const GITHUB_API_URL: &str = "https://api.github.com";
const GITHUB_API_VERSION: &str = "2022-11-28";
const USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Bytes received so far and the advertised size, if the server sent one.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DownloadProgress {
    pub read: u64,
    pub total: Option<u64>,
}

impl DownloadProgress {
    /// `None` while the total is unknown; callers render that as indeterminate.
    pub fn percent(&self) -> Option<f32> {
        progress_percent(self.read, self.total)
    }
}

pub type ProgressCallback<'a> = Option<&'a mut (dyn FnMut(DownloadProgress) + Send)>;

fn emit_progress(cb: &mut ProgressCallback<'_>, update: DownloadProgress) {
    if let Some(callback) = cb.as_deref_mut() {
        callback(update);
    }
}

/// Where releases come from: the latest tag and the archive bytes for a URL.
#[async_trait]
pub trait ReleaseSource: Send + Sync {
    /// Tag of the most recent published release, e.g. `bun-v1.3.6`.
    async fn latest_release_tag(&self) -> Result<String>;

    /// Fetch a release archive into memory, reporting progress after every chunk.
    async fn download_archive(
        &self,
        url: &str,
        progress: ProgressCallback<'_>,
        cancel: Option<&AtomicBool>,
    ) -> Result<Vec<u8>>;
}

/// GitHub-backed release source.
#[derive(Clone, Debug)]
pub struct NetworkClient {
    client: Client,
    api_base: String,
}

impl NetworkClient {
    pub fn new() -> Self {
        Self::with_api_base(GITHUB_API_URL)
    }

    pub fn with_api_base(api_base: impl Into<String>) -> Self {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .unwrap_or_else(|err| {
                warn!("network client: falling back to default HTTP client configuration ({err})");
                Client::new()
            });
        Self {
            client,
            api_base: api_base.into().trim_end_matches('/').to_owned(),
        }
    }

    fn api_headers() -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            ACCEPT,
            HeaderValue::from_static("application/vnd.github+json"),
        );
        headers.insert(
            "x-github-api-version",
            HeaderValue::from_static(GITHUB_API_VERSION),
        );
        headers
    }
}

impl Default for NetworkClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ReleaseSource for NetworkClient {
    async fn latest_release_tag(&self) -> Result<String> {
        let url = format!(
            "{}/repos/{GITHUB_OWNER}/{GITHUB_REPO}/releases/latest",
            self.api_base
        );
        debug!("releases: GET {url}");
        let body = self
            .client
            .get(&url)
            .headers(Self::api_headers())
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;
        let tag = parse_release_tag(&body)?;
        info!("releases: latest tag is {tag}");
        Ok(tag)
    }

    async fn download_archive(
        &self,
        url: &str,
        mut progress: ProgressCallback<'_>,
        cancel: Option<&AtomicBool>,
    ) -> Result<Vec<u8>> {
        let cancelled = || BunkitError::Cancelled(format!("download of {url} cancelled"));
        if cancel_requested(cancel) {
            return Err(cancelled());
        }
        info!("download: fetching {url}");
        let response = tokio::select! {
            response = self.client.get(url).send() => response?.error_for_status()?,
            _ = wait_for_cancel(cancel) => return Err(cancelled()),
        };

        let total = response.content_length();
        let mut buffer = Vec::with_capacity(preallocation(total.unwrap_or(0)));
        let mut read: u64 = 0;
        emit_progress(&mut progress, DownloadProgress { read, total });

        let mut stream = response.bytes_stream();
        loop {
            let next = tokio::select! {
                next = stream.next() => next,
                _ = wait_for_cancel(cancel) => {
                    warn!("download: cancelled after {read} bytes");
                    return Err(cancelled());
                }
            };
            let Some(chunk) = next else {
                break;
            };
            let chunk = chunk?;
            buffer.extend_from_slice(&chunk);
            read += chunk.len() as u64;
            emit_progress(&mut progress, DownloadProgress { read, total });
        }

        ensure_complete(read, total)?;
        debug!("download: received {read} bytes from {url}");
        Ok(buffer)
    }
}

fn ensure_complete(read: u64, total: Option<u64>) -> Result<()> {
    match total {
        Some(total) if read < total => Err(BunkitError::Network(format!(
            "download incomplete: received {read} of {total} bytes"
        ))),
        _ => Ok(()),
    }
}

/// Pull `tag_name` out of a release listing response.
fn parse_release_tag(body: &str) -> Result<String> {
    let json: serde_json::Value = serde_json::from_str(body)
        .map_err(|err| BunkitError::Protocol(format!("release response is not JSON: {err}")))?;
    match json.get("tag_name") {
        None => Err(BunkitError::Protocol("tag_name not found in release response".into())),
        Some(serde_json::Value::String(tag)) => Ok(tag.clone()),
        Some(serde_json::Value::Null) => Err(BunkitError::Protocol("tag_name is null".into())),
        Some(other) => Err(BunkitError::Protocol(format!(
            "tag_name has unexpected type: {other}"
        ))),
    }
}
