//! reqwest-backed transfer client.
//!
//! [`HttpClient`] is the production implementation of both network seams:
//! [`FileDownloader`] (stream a resource to disk) and
//! [`PageFetcher`](crate::crawl::PageFetcher) (fetch a page and extract its links).
//! It is cheap to clone and shares one connection pool between clones.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::Client;
use reqwest::header::{CONTENT_TYPE, RETRY_AFTER};
use tokio::fs::File;
use tokio::io::{AsyncWriteExt, BufWriter};
use tracing::{debug, info, instrument};
use url::Url;

use super::constants::{CONNECT_TIMEOUT, MAX_PAGE_BYTES, READ_TIMEOUT, USER_AGENT};
use super::error::DownloadError;
use crate::crawl::{FetchedPage, PageFetcher, extract_links};

/// Result of a successful file transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadOutcome {
    pub bytes_written: u64,
    pub content_type: Option<String>,
}

/// Writes the resource at `url` to `target_path`.
///
/// Implementations must not leave a partial file at `target_path` on error.
#[async_trait]
pub trait FileDownloader: Send + Sync {
    async fn download(&self, url: &str, target_path: &Path)
    -> Result<DownloadOutcome, DownloadError>;
}

/// HTTP client for page fetches and streaming downloads.
#[derive(Debug, Clone)]
pub struct HttpClient {
    client: Client,
}

impl HttpClient {
    /// Builds a client with the default connect/read timeouts.
    ///
    /// # Errors
    ///
    /// Returns the underlying reqwest error if the TLS backend cannot be
    /// initialized.
    pub fn new() -> Result<Self, reqwest::Error> {
        Self::with_timeouts(CONNECT_TIMEOUT, READ_TIMEOUT)
    }

    /// Builds a client with explicit timeouts.
    ///
    /// # Errors
    ///
    /// Same as [`new`](Self::new).
    #[instrument(level = "debug")]
    pub fn with_timeouts(connect: Duration, read: Duration) -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .connect_timeout(connect)
            .timeout(read)
            .gzip(true)
            .cookie_store(true)
            .user_agent(USER_AGENT)
            .build()?;
        Ok(Self { client })
    }

    /// GET `url`, mapping transport failures and non-2xx answers to [`DownloadError`].
    async fn get(&self, url: &str) -> Result<reqwest::Response, DownloadError> {
        let parsed = Url::parse(url).map_err(|_| DownloadError::invalid_url(url))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(DownloadError::invalid_url(url));
        }

        let response = self
            .client
            .get(parsed)
            .send()
            .await
            .map_err(|e| map_transport_error(url, e))?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = response
                .headers()
                .get(RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .map(ToString::to_string);
            return Err(DownloadError::http_status_with_retry_after(
                url,
                status.as_u16(),
                retry_after,
            ));
        }
        Ok(response)
    }
}

fn map_transport_error(url: &str, error: reqwest::Error) -> DownloadError {
    if error.is_timeout() {
        DownloadError::timeout(url)
    } else {
        DownloadError::network(url, error)
    }
}

fn content_type_of(response: &reqwest::Response) -> Option<String> {
    response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim().to_ascii_lowercase())
}

/// `true` for content types whose body is worth reading as text.
fn is_textual(content_type: Option<&str>) -> bool {
    content_type.is_none_or(|ct| {
        ct.starts_with("text/") || ct.contains("html") || ct.contains("xml")
    })
}

fn is_html(content_type: Option<&str>) -> bool {
    content_type.is_none_or(|ct| ct.contains("html"))
}

/// Removes the partial file unless the transfer was committed.
struct PartialFile {
    path: PathBuf,
    committed: bool,
}

impl PartialFile {
    fn new(target: &Path) -> Self {
        let mut name = target.file_name().unwrap_or_default().to_os_string();
        name.push(".part");
        Self {
            path: target.with_file_name(name),
            committed: false,
        }
    }
}

impl Drop for PartialFile {
    fn drop(&mut self) {
        if !self.committed {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

async fn stream_to_file(
    response: reqwest::Response,
    url: &str,
    file_path: &Path,
) -> Result<u64, DownloadError> {
    let file = File::create(file_path)
        .await
        .map_err(|e| DownloadError::io(file_path, e))?;
    let mut writer = BufWriter::new(file);
    let mut stream = response.bytes_stream();
    let mut bytes_written: u64 = 0;

    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| map_transport_error(url, e))?;
        writer
            .write_all(&chunk)
            .await
            .map_err(|e| DownloadError::io(file_path, e))?;
        bytes_written += chunk.len() as u64;
    }

    writer
        .flush()
        .await
        .map_err(|e| DownloadError::io(file_path, e))?;
    Ok(bytes_written)
}

#[async_trait]
impl FileDownloader for HttpClient {
    #[instrument(skip(self), fields(path = %target_path.display()))]
    async fn download(
        &self,
        url: &str,
        target_path: &Path,
    ) -> Result<DownloadOutcome, DownloadError> {
        let response = self.get(url).await?;
        let content_type = content_type_of(&response);

        if let Some(parent) = target_path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| DownloadError::io(parent, e))?;
        }

        // Written beside the target and renamed on success; dropped (and
        // removed) on error or when the future is cancelled mid-stream.
        let mut partial = PartialFile::new(target_path);
        let bytes_written = stream_to_file(response, url, &partial.path).await?;
        tokio::fs::rename(&partial.path, target_path)
            .await
            .map_err(|e| DownloadError::io(target_path, e))?;
        partial.committed = true;

        info!(bytes = bytes_written, "download complete");
        Ok(DownloadOutcome {
            bytes_written,
            content_type,
        })
    }
}

#[async_trait]
impl PageFetcher for HttpClient {
    #[instrument(skip(self))]
    async fn fetch(&self, url: &str) -> Result<FetchedPage, DownloadError> {
        let response = self.get(url).await?;
        let final_url = response.url().to_string();
        let status = response.status().as_u16();
        let content_type = content_type_of(&response);

        if !is_textual(content_type.as_deref()) {
            debug!(content_type = ?content_type, "non-text page, body not read");
            return Ok(FetchedPage {
                final_url,
                status,
                content_type,
                body: String::new(),
                links: Vec::new(),
            });
        }

        let mut body = Vec::new();
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| map_transport_error(url, e))?;
            let room = MAX_PAGE_BYTES.saturating_sub(body.len());
            body.extend_from_slice(&chunk[..chunk.len().min(room)]);
            if body.len() >= MAX_PAGE_BYTES {
                debug!(limit = MAX_PAGE_BYTES, "page truncated");
                break;
            }
        }
        let body = String::from_utf8_lossy(&body).into_owned();

        let links = if is_html(content_type.as_deref()) {
            extract_links(&body, &final_url)
        } else {
            Vec::new()
        };
        debug!(links = links.len(), final_url = %final_url, "page fetched");

        Ok(FetchedPage {
            final_url,
            status,
            content_type,
            body,
            links,
        })
    }
}
