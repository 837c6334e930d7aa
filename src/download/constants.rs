//! Shared transfer constants (timeouts, politeness, concurrency bounds).

use std::time::Duration;

/// HTTP connect timeout.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// HTTP read timeout for a whole transfer (large files included).
pub const READ_TIMEOUT: Duration = Duration::from_secs(300);

/// Cap applied to Retry-After and Crawl-delay values.
pub const MAX_SERVER_DELAY: Duration = Duration::from_secs(3600);

/// Default number of concurrent downloads per queue.
pub const DEFAULT_CONCURRENCY: usize = 10;

/// Smallest accepted bounded concurrency.
pub const MIN_CONCURRENCY: usize = 1;

/// Largest accepted bounded concurrency.
pub const MAX_CONCURRENCY: usize = 100;

/// Largest HTML body read for link extraction.
pub const MAX_PAGE_BYTES: usize = 10 * 1024 * 1024;

/// User-Agent sent with every request.
pub const USER_AGENT: &str = concat!("harvester/", env!("CARGO_PKG_VERSION"));
