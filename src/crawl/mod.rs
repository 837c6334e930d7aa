//! Recursive URL discovery with traversal limits.
//!
//! [`CrawlFrontier::start`] turns a seed URL into a [`CrawlSession`], a lazy
//! sequence of [`CrawledPage`] records. The session owns its visited set, so two
//! crawls never share dedup state. Pages are fetched through the [`PageFetcher`]
//! seam; [`HttpClient`](crate::download::HttpClient) is the network-backed
//! implementation and tests use in-memory fakes.

mod frontier;
mod links;
mod normalize;
mod robots;

pub use frontier::{CrawlFrontier, CrawlSession};
pub use links::extract_links;
pub use normalize::{host_matches, host_of, normalize_url, resolve_and_normalize};
pub use robots::{RobotsCache, RobotsDecision, RobotsError, RobotsRules, origin_for_robots};

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::download::DownloadError;

/// Default crawl depth below the seed.
pub const DEFAULT_MAX_DEPTH: u32 = 2;

/// Default cap on fetched pages per host.
pub const DEFAULT_MAX_PAGES_PER_DOMAIN: usize = 500;

/// Default politeness gap between requests to one host, in milliseconds.
pub const DEFAULT_CRAWL_DELAY_MS: u64 = 1000;

/// What a [`PageFetcher`] returns for one URL.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FetchedPage {
    /// URL after following redirects.
    pub final_url: String,
    pub status: u16,
    pub content_type: Option<String>,
    /// Text body; empty for non-text content.
    pub body: String,
    /// Absolute outbound links; empty for non-HTML content.
    pub links: Vec<String>,
}

/// Fetches one page. Non-2xx answers are errors.
#[async_trait]
pub trait PageFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<FetchedPage, DownloadError>;
}

/// Why a crawl URL ended up `failed`.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error(transparent)]
    Transfer(#[from] DownloadError),

    #[error("disallowed by robots.txt: {url}")]
    RobotsDisallowed { url: String },

    #[error("invalid crawl URL: {url}")]
    InvalidUrl { url: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CrawlStatus {
    Queued,
    Fetching,
    Fetched,
    Failed,
}

impl fmt::Display for CrawlStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Queued => "queued",
            Self::Fetching => "fetching",
            Self::Fetched => "fetched",
            Self::Failed => "failed",
        })
    }
}

/// A discovered URL and where it came from.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CrawlUrl {
    /// Normalized URL (the dedup key).
    pub url: String,
    pub depth: u32,
    pub parent_url: Option<String>,
    pub status: CrawlStatus,
    pub discovered_at: DateTime<Utc>,
}

impl CrawlUrl {
    pub(crate) fn queued(url: String, depth: u32, parent_url: Option<String>) -> Self {
        Self {
            url,
            depth,
            parent_url,
            status: CrawlStatus::Queued,
            discovered_at: Utc::now(),
        }
    }
}

/// One step of a crawl session.
#[derive(Debug)]
pub struct CrawledPage {
    pub url: CrawlUrl,
    /// Normalized URL after redirects, when the fetch succeeded.
    pub final_url: Option<String>,
    pub content_type: Option<String>,
    /// Downloadable documents found on (or being) this page, first sighting only.
    pub targets: Vec<String>,
    /// The fetch redirected to an already-visited URL; no links were followed.
    pub deduped: bool,
    pub error: Option<FetchError>,
}

impl CrawledPage {
    #[must_use]
    pub fn is_failed(&self) -> bool {
        self.url.status == CrawlStatus::Failed
    }
}

/// Traversal order of the frontier.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TraversalOrder {
    #[default]
    BreadthFirst,
    DepthFirst,
}

/// Limits and politeness settings of one crawl.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CrawlOptions {
    /// Links deeper than this below the seed are not followed.
    pub max_depth: u32,
    pub max_pages_per_domain: usize,
    /// Hosts (and their subdomains) the crawl may enter. `None` keeps the
    /// crawl on the seed's host.
    pub domain_allowlist: Option<Vec<String>>,
    pub respect_robots: bool,
    /// Minimum gap between requests to one host, in milliseconds.
    pub crawl_delay_ms: u64,
    pub order: TraversalOrder,
    /// Pages fetched at once.
    pub fetch_concurrency: usize,
    /// Lower-case extensions (no dot) that mark a link as a downloadable document.
    pub target_extensions: Vec<String>,
}

impl Default for CrawlOptions {
    fn default() -> Self {
        Self {
            max_depth: DEFAULT_MAX_DEPTH,
            max_pages_per_domain: DEFAULT_MAX_PAGES_PER_DOMAIN,
            domain_allowlist: None,
            respect_robots: true,
            crawl_delay_ms: DEFAULT_CRAWL_DELAY_MS,
            order: TraversalOrder::BreadthFirst,
            fetch_concurrency: 1,
            target_extensions: vec!["pdf".to_string()],
        }
    }
}

impl CrawlOptions {
    #[must_use]
    pub fn crawl_delay(&self) -> Duration {
        Duration::from_millis(self.crawl_delay_ms)
    }
}
