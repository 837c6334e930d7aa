//! Error types for the download module.
//!
//! [`DownloadError`] describes a single failed HTTP transfer (file download or
//! page fetch). It carries enough context for [`classify_error`](super::classify_error)
//! to decide between retrying and giving up. [`QueueError`] covers misuse of the
//! [`DownloadQueue`](super::DownloadQueue) itself.

use std::path::PathBuf;

use thiserror::Error;

/// Errors that can occur during a single HTTP transfer.
#[derive(Debug, Error)]
pub enum DownloadError {
    /// Network-level error (DNS resolution, connection refused/reset, TLS errors, etc.)
    #[error("network error fetching {url}: {source}")]
    Network {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    /// Request timed out before completion.
    #[error("timeout fetching {url}")]
    Timeout { url: String },

    /// HTTP error response (4xx client errors, 5xx server errors).
    #[error("HTTP {status} fetching {url}")]
    HttpStatus {
        url: String,
        status: u16,
        /// The Retry-After header value, if present (for 429/503 responses).
        retry_after: Option<String>,
    },

    /// File system error while writing the target file.
    #[error("IO error writing to {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The provided URL is malformed or not http(s).
    #[error("invalid URL: {url}")]
    InvalidUrl { url: String },

    /// The server answered with a content type this transfer cannot use.
    #[error("unsupported content type {content_type} for {url}")]
    UnsupportedContentType { url: String, content_type: String },
}

impl DownloadError {
    /// Creates a network error from a reqwest error.
    pub fn network(url: impl Into<String>, source: reqwest::Error) -> Self {
        Self::Network {
            url: url.into(),
            source,
        }
    }

    /// Creates an HTTP status error.
    pub fn http_status(url: impl Into<String>, status: u16) -> Self {
        Self::HttpStatus {
            url: url.into(),
            status,
            retry_after: None,
        }
    }

    /// Creates an HTTP status error with a Retry-After header value.
    pub fn http_status_with_retry_after(
        url: impl Into<String>,
        status: u16,
        retry_after: Option<String>,
    ) -> Self {
        Self::HttpStatus {
            url: url.into(),
            status,
            retry_after,
        }
    }

    /// Creates a timeout error.
    pub fn timeout(url: impl Into<String>) -> Self {
        Self::Timeout { url: url.into() }
    }

    /// Creates an IO error.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Creates an invalid URL error.
    pub fn invalid_url(url: impl Into<String>) -> Self {
        Self::InvalidUrl { url: url.into() }
    }

    /// Creates an unsupported content type error.
    pub fn unsupported_content_type(
        url: impl Into<String>,
        content_type: impl Into<String>,
    ) -> Self {
        Self::UnsupportedContentType {
            url: url.into(),
            content_type: content_type.into(),
        }
    }

    /// Returns the Retry-After header value carried by an HTTP status error.
    #[must_use]
    pub fn retry_after(&self) -> Option<&str> {
        match self {
            Self::HttpStatus { retry_after, .. } => retry_after.as_deref(),
            _ => None,
        }
    }
}

/// Errors from driving a [`DownloadQueue`](super::DownloadQueue).
#[derive(Debug, Error)]
pub enum QueueError {
    /// Concurrency outside the supported range.
    #[error("invalid concurrency value {value}: must be between {min} and {max}")]
    InvalidConcurrency { value: usize, min: usize, max: usize },

    /// `start` called twice on the same queue.
    #[error("download queue already started")]
    AlreadyStarted,

    /// `finish` called before `start`.
    #[error("download queue was never started")]
    NotStarted,

    /// Enqueue after the queue was closed or cancelled.
    #[error("download queue is closed")]
    Closed,

    /// The concurrency semaphore was closed unexpectedly.
    #[error("semaphore closed unexpectedly")]
    SemaphoreClosed,

    /// The dispatcher task panicked or was aborted.
    #[error("download dispatcher stopped abnormally: {0}")]
    Dispatcher(String),
}
