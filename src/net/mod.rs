//! HTTP plumbing shared by the backends and the metadata workers.
//!
//! - [`HttpClient`]: one reqwest client with the ServeStream user agent
//! - [`ContentTypeProbe`]: out-of-band content-type lookup before opening
//! - [`Downloader`]: download-then-play into the cache directory

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use crate::error::{Error, Result, ResultExt};
use crate::task::CancelToken;

/// User agent sent on every request. Some SHOUTcast servers only answer
/// known agents.
pub const USER_AGENT: &str = "ServeStream";

/// Looks up the content type a server announces for a URI.
#[async_trait]
pub trait ContentTypeProbe: Send + Sync {
    /// `Ok(None)` when the server sent no `Content-Type`.
    async fn content_type(&self, uri: &str) -> Result<Option<String>>;
}

#[derive(Debug, Clone)]
pub struct HttpClient {
    client: reqwest::Client,
}

impl HttpClient {
    /// Build a client whose connect and read timeouts are `timeout`.
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .connect_timeout(timeout)
            .read_timeout(timeout)
            .build()?;
        Ok(Self { client })
    }

    pub fn inner(&self) -> &reqwest::Client {
        &self.client
    }

    /// Fetch at most `max_bytes` from the start of a resource.
    ///
    /// Asks for a byte range, but servers that ignore it are read until the
    /// limit and then dropped.
    pub async fn fetch_prefix(&self, uri: &str, max_bytes: usize) -> Result<Vec<u8>> {
        let mut response = self
            .client
            .get(uri)
            .header(reqwest::header::RANGE, format!("bytes=0-{}", max_bytes.saturating_sub(1)))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::network(format!("HTTP {} for {}", status, uri)));
        }

        let mut bytes = Vec::new();
        while bytes.len() < max_bytes {
            let Some(chunk) = response.chunk().await? else {
                break;
            };
            bytes.extend_from_slice(&chunk);
        }
        bytes.truncate(max_bytes);
        Ok(bytes)
    }
}

#[async_trait]
impl ContentTypeProbe for HttpClient {
    async fn content_type(&self, uri: &str) -> Result<Option<String>> {
        let response = self.client.get(uri).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(Error::network(format!("HTTP {} for {}", status, uri)));
        }
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty());
        debug!(target: "net", uri, ?content_type, "Content type");
        Ok(content_type)
    }
}

/// Cache file name for a URI: hex SHA-256 of the URI text.
pub fn cache_file_name(uri: &str) -> String {
    Sha256::digest(uri.as_bytes())
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}

/// Downloads remote tracks into a cache directory before playback.
#[derive(Debug, Clone)]
pub struct Downloader {
    client: HttpClient,
    dir: PathBuf,
}

impl Downloader {
    pub fn new(client: HttpClient, dir: impl Into<PathBuf>) -> Self {
        Self {
            client,
            dir: dir.into(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn cache_path(&self, uri: &str) -> PathBuf {
        self.dir.join(cache_file_name(uri))
    }

    /// Download `uri` unless a complete copy is already cached.
    ///
    /// Data goes to a `.part` file that is renamed on completion, so a
    /// cancelled or failed download never leaves a file that looks complete.
    pub async fn download(&self, uri: &str, token: &CancelToken) -> Result<PathBuf> {
        let path = self.cache_path(uri);
        if tokio::fs::metadata(&path).await.is_ok_and(|m| m.len() > 0) {
            debug!(target: "net", uri, path = %path.display(), "Using cached download");
            return Ok(path);
        }

        tokio::fs::create_dir_all(&self.dir)
            .await
            .with_context(format!("Failed to create {}", self.dir.display()))?;

        let partial = path.with_extension("part");
        let result = self.fetch_to(uri, &partial, token).await;
        if let Err(e) = result {
            let _ = tokio::fs::remove_file(&partial).await;
            return Err(e);
        }

        tokio::fs::rename(&partial, &path).await?;
        info!(target: "net", uri, path = %path.display(), "Download complete");
        Ok(path)
    }

    async fn fetch_to(&self, uri: &str, partial: &Path, token: &CancelToken) -> Result<()> {
        let mut response = self.client.inner().get(uri).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(Error::network(format!("HTTP {} for {}", status, uri)));
        }

        let mut file = tokio::fs::File::create(partial).await?;
        while let Some(chunk) = response.chunk().await? {
            if token.is_cancelled() {
                return Err(Error::network(format!("Download of {} cancelled", uri)));
            }
            file.write_all(&chunk).await?;
        }
        file.flush().await?;
        Ok(())
    }
}
