//! Harvester Core Library
//!
//! Background task execution for document acquisition: directory processing,
//! recursive crawling with document discovery, and batched downloads, each
//! reporting live progress until it completes, fails or is cancelled.
//!
//! # Architecture
//!
//! The library is organized into the following modules:
//! - [`stats`] - Lock-free per-task counters and immutable snapshots
//! - [`cancel`] - Cooperative cancellation tokens and the force-cancel registry
//! - [`events`] - Progress event schema, transports and the deduplicating event bus
//! - [`download`] - Bounded-concurrency download queue with retry and rate limiting
//! - [`crawl`] - Crawl frontier, robots.txt handling and link extraction
//! - [`task`] - Task state machine, registry and per-type task logic
//! - [`config`] - TOML engine configuration

// Clippy lints - strict for library code
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod cancel;
pub mod config;
pub mod crawl;
pub mod download;
pub mod events;
pub mod stats;
pub mod task;
#[cfg(test)]
pub(crate) mod test_support;

// Re-export commonly used types
pub use cancel::{CancellationController, CancellationToken};
pub use config::{ConfigError, EngineConfig};
pub use crawl::{
    CrawlFrontier, CrawlOptions, CrawlSession, CrawlStatus, CrawlUrl, CrawledPage, FetchError,
    FetchedPage, PageFetcher,
};
pub use download::{
    Concurrency, DownloadError, DownloadItem, DownloadQueue, DownloadStatus, ExistingFilePolicy,
    FailureType, FileDownloader, HttpClient, QueueError, RateLimiter, RetryDecision, RetryPolicy,
    classify_error,
};
pub use events::{BroadcastSink, EventSink, EventType, ProgressEvent, ProgressEventBus, TerminalKind};
pub use stats::{Counter, StatsAggregator, StatsSnapshot};
pub use task::{
    Task, TaskContext, TaskError, TaskId, TaskParams, TaskRegistry, TaskStatus, TaskType,
};
