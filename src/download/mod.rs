//! Bounded-concurrency file acquisition.
//!
//! [`DownloadQueue`] runs [`DownloadItem`]s through a [`FileDownloader`] with
//! at most N transfers in flight, retrying transient failures with
//! exponential backoff and spacing requests per domain via [`RateLimiter`].
//! [`HttpClient`] is the network-backed downloader; it also implements
//! [`PageFetcher`](crate::crawl::PageFetcher) for the crawler.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use harvester_core::download::{Concurrency, DownloadQueue, HttpClient};
//! use harvester_core::stats::StatsAggregator;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let stats = Arc::new(StatsAggregator::new());
//! let queue = DownloadQueue::builder(Arc::new(HttpClient::new()?), Arc::clone(&stats)).build();
//! queue.enqueue("https://example.com/paper.pdf", "./downloads/paper.pdf")?;
//! queue.start(Concurrency::Limited(4))?;
//! let summary = queue.finish().await?;
//! println!("{} done, {} failed", summary.done, summary.failed);
//! # Ok(())
//! # }
//! ```

mod client;
mod constants;
mod error;
mod filename;
mod item;
mod queue;
pub mod rate_limiter;
mod retry;

pub use client::{DownloadOutcome, FileDownloader, HttpClient};
pub use constants::{
    CONNECT_TIMEOUT, DEFAULT_CONCURRENCY, MAX_CONCURRENCY, MAX_PAGE_BYTES, MAX_SERVER_DELAY,
    MIN_CONCURRENCY, READ_TIMEOUT, USER_AGENT,
};
pub use error::{DownloadError, QueueError};
pub use filename::{
    disambiguated_target_path, filename_from_url, resolve_unique_path, sanitize_filename,
    target_path_for, url_extension,
};
pub use item::{Concurrency, DownloadItem, DownloadStatus, ExistingFilePolicy};
pub use queue::{DownloadQueue, DownloadQueueBuilder, ItemObserver, QueueSummary};
pub use rate_limiter::{RateLimiter, extract_domain, parse_retry_after};
pub use retry::{
    DEFAULT_MAX_RETRIES, FailureType, RetryDecision, RetryPolicy, classify_error,
    classify_http_status,
};
