//! Download queue item model and queue policies.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::constants::{MAX_CONCURRENCY, MIN_CONCURRENCY};
use super::error::QueueError;

/// Lifecycle of a single queued download.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DownloadStatus {
    Queued,
    Downloading,
    Retrying,
    Done,
    Failed,
    /// Target already existed under [`ExistingFilePolicy::Skip`].
    Skipped,
    Cancelled,
}

impl DownloadStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Downloading => "downloading",
            Self::Retrying => "retrying",
            Self::Done => "done",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
            Self::Cancelled => "cancelled",
        }
    }

    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Done | Self::Failed | Self::Skipped | Self::Cancelled
        )
    }
}

impl fmt::Display for DownloadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One (url, target path) pair owned by a [`DownloadQueue`](super::DownloadQueue).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DownloadItem {
    pub id: u64,
    pub url: String,
    /// Path actually written. Differs from the requested path under
    /// [`ExistingFilePolicy::Rename`].
    pub target_path: PathBuf,
    pub priority: i32,
    pub attempts: u32,
    pub max_retries: u32,
    pub status: DownloadStatus,
    pub bytes_written: u64,
    pub content_type: Option<String>,
    pub error: Option<String>,
}

impl DownloadItem {
    pub(crate) fn new(
        id: u64,
        url: String,
        target_path: PathBuf,
        priority: i32,
        max_retries: u32,
    ) -> Self {
        Self {
            id,
            url,
            target_path,
            priority,
            attempts: 0,
            max_retries,
            status: DownloadStatus::Queued,
            bytes_written: 0,
            content_type: None,
            error: None,
        }
    }
}

/// What to do when the target file already exists.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExistingFilePolicy {
    /// Leave the existing file alone and count the item as skipped.
    #[default]
    Skip,
    Overwrite,
    /// Write next to it as `name_1.ext`, `name_2.ext`, ...
    Rename,
}

impl FromStr for ExistingFilePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "skip" => Ok(Self::Skip),
            "overwrite" => Ok(Self::Overwrite),
            "rename" => Ok(Self::Rename),
            other => Err(format!(
                "unknown existing-file policy '{other}' (expected skip, overwrite or rename)"
            )),
        }
    }
}

/// Worker pool size. `Unlimited` must be asked for explicitly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(try_from = "ConcurrencyRepr")]
pub enum Concurrency {
    Limited(usize),
    Unlimited,
}

impl Default for Concurrency {
    fn default() -> Self {
        Self::Limited(super::constants::DEFAULT_CONCURRENCY)
    }
}

impl Concurrency {
    /// Number of semaphore permits backing this setting.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::InvalidConcurrency`] for a bounded value outside
    /// `1..=100`.
    pub fn permits(self) -> Result<usize, QueueError> {
        match self {
            Self::Unlimited => Ok(tokio::sync::Semaphore::MAX_PERMITS),
            Self::Limited(n) if (MIN_CONCURRENCY..=MAX_CONCURRENCY).contains(&n) => Ok(n),
            Self::Limited(value) => Err(QueueError::InvalidConcurrency {
                value,
                min: MIN_CONCURRENCY,
                max: MAX_CONCURRENCY,
            }),
        }
    }
}

impl fmt::Display for Concurrency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Limited(n) => write!(f, "{n}"),
            Self::Unlimited => f.write_str("unlimited"),
        }
    }
}

impl FromStr for Concurrency {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.eq_ignore_ascii_case("unlimited") {
            return Ok(Self::Unlimited);
        }
        s.parse::<usize>()
            .map(Self::Limited)
            .map_err(|_| format!("invalid concurrency '{s}' (expected a number or 'unlimited')"))
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ConcurrencyRepr {
    Count(usize),
    Name(String),
}

impl TryFrom<ConcurrencyRepr> for Concurrency {
    type Error = String;

    fn try_from(repr: ConcurrencyRepr) -> Result<Self, Self::Error> {
        match repr {
            ConcurrencyRepr::Count(n) => Ok(Self::Limited(n)),
            ConcurrencyRepr::Name(name) => name.parse(),
        }
    }
}
