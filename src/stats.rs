//! Thread-safe per-task counters.
//!
//! [`StatsAggregator`] is shared (via `Arc`) between a task's logic, its crawl
//! frontier and its download workers. Counters are plain atomics; the open
//! `extra` map sits behind a `DashMap`. [`StatsAggregator::snapshot`] returns an
//! owned [`StatsSnapshot`] suitable for embedding in a progress event.
//!
//! Once an aggregator is frozen (force-cancel), every mutation becomes a no-op so
//! straggling workers cannot change the numbers reported in the terminal event.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Named counters tracked for every task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Counter {
    /// Items (files, downloads) handled successfully.
    Processed,
    /// Items deliberately not handled (unsupported, already present).
    Skipped,
    /// Items that failed permanently.
    Errors,
    /// Bytes written to disk by downloads.
    BytesDownloaded,
    /// Pages fetched by a crawl.
    PagesCrawled,
    /// Files accepted into a download queue.
    FilesQueued,
    /// Retry attempts made after transient failures.
    Retries,
}

impl Counter {
    /// All counters, in snapshot order.
    pub const ALL: [Counter; 7] = [
        Counter::Processed,
        Counter::Skipped,
        Counter::Errors,
        Counter::BytesDownloaded,
        Counter::PagesCrawled,
        Counter::FilesQueued,
        Counter::Retries,
    ];

    /// Returns the stable snake_case name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Processed => "processed",
            Self::Skipped => "skipped",
            Self::Errors => "errors",
            Self::BytesDownloaded => "bytes_downloaded",
            Self::PagesCrawled => "pages_crawled",
            Self::FilesQueued => "files_queued",
            Self::Retries => "retries",
        }
    }

    fn index(self) -> usize {
        match self {
            Self::Processed => 0,
            Self::Skipped => 1,
            Self::Errors => 2,
            Self::BytesDownloaded => 3,
            Self::PagesCrawled => 4,
            Self::FilesQueued => 5,
            Self::Retries => 6,
        }
    }
}

impl fmt::Display for Counter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Immutable copy of a task's counters.
///
/// Serialized identically for every task type; source-specific metrics live in
/// `extra`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub processed: u64,
    pub skipped: u64,
    pub errors: u64,
    pub bytes_downloaded: u64,
    pub pages_crawled: u64,
    pub files_queued: u64,
    pub retries: u64,
    #[serde(default)]
    pub extra: BTreeMap<String, f64>,
}

impl StatsSnapshot {
    /// Returns the value of a named counter.
    #[must_use]
    pub fn get(&self, counter: Counter) -> u64 {
        match counter {
            Counter::Processed => self.processed,
            Counter::Skipped => self.skipped,
            Counter::Errors => self.errors,
            Counter::BytesDownloaded => self.bytes_downloaded,
            Counter::PagesCrawled => self.pages_crawled,
            Counter::FilesQueued => self.files_queued,
            Counter::Retries => self.retries,
        }
    }
}

/// Concurrent counter set for a single task.
#[derive(Debug, Default)]
pub struct StatsAggregator {
    counters: [AtomicU64; 7],
    extra: DashMap<String, f64>,
    frozen: AtomicBool,
}

impl StatsAggregator {
    /// Creates an aggregator with every counter at zero.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `n` to a counter. Returns `false` when the aggregator is frozen.
    pub fn increment(&self, counter: Counter, n: u64) -> bool {
        if self.is_frozen() {
            debug!(%counter, n, "ignoring increment on frozen stats");
            return false;
        }
        self.counters[counter.index()].fetch_add(n, Ordering::SeqCst);
        true
    }

    /// Adds one to a counter.
    pub fn incr(&self, counter: Counter) -> bool {
        self.increment(counter, 1)
    }

    /// Sets a source-specific metric. Returns `false` when frozen.
    pub fn set_extra(&self, key: impl Into<String>, value: f64) -> bool {
        if self.is_frozen() {
            return false;
        }
        self.extra.insert(key.into(), value);
        true
    }

    /// Reads a single counter.
    #[must_use]
    pub fn get(&self, counter: Counter) -> u64 {
        self.counters[counter.index()].load(Ordering::SeqCst)
    }

    /// Stops accepting mutations. Idempotent.
    pub fn freeze(&self) {
        self.frozen.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_frozen(&self) -> bool {
        self.frozen.load(Ordering::SeqCst)
    }

    /// Returns an owned copy of all counters and extras.
    #[must_use]
    pub fn snapshot(&self) -> StatsSnapshot {
        let extra = self
            .extra
            .iter()
            .map(|entry| (entry.key().clone(), *entry.value()))
            .collect();
        StatsSnapshot {
            processed: self.get(Counter::Processed),
            skipped: self.get(Counter::Skipped),
            errors: self.get(Counter::Errors),
            bytes_downloaded: self.get(Counter::BytesDownloaded),
            pages_crawled: self.get(Counter::PagesCrawled),
            files_queued: self.get(Counter::FilesQueued),
            retries: self.get(Counter::Retries),
            extra,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[test]
    fn test_stats_default_is_zero() {
        let stats = StatsAggregator::new();
        let snapshot = stats.snapshot();
        for counter in Counter::ALL {
            assert_eq!(snapshot.get(counter), 0, "{counter} should start at zero");
        }
        assert!(snapshot.extra.is_empty());
    }

    #[test]
    fn test_stats_increment_and_extra() {
        let stats = StatsAggregator::new();
        stats.incr(Counter::Processed);
        stats.increment(Counter::BytesDownloaded, 2048);
        stats.set_extra("entries_total", 12.0);

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.processed, 1);
        assert_eq!(snapshot.bytes_downloaded, 2048);
        assert_eq!(snapshot.extra.get("entries_total"), Some(&12.0));
    }

    #[test]
    fn test_stats_frozen_rejects_mutation() {
        let stats = StatsAggregator::new();
        stats.incr(Counter::Errors);
        stats.freeze();

        assert!(!stats.incr(Counter::Errors));
        assert!(!stats.set_extra("late", 1.0));
        let snapshot = stats.snapshot();
        assert_eq!(snapshot.errors, 1);
        assert!(!snapshot.extra.contains_key("late"));
    }

    #[test]
    fn test_stats_snapshot_is_detached_copy() {
        let stats = StatsAggregator::new();
        stats.incr(Counter::PagesCrawled);
        let before = stats.snapshot();
        stats.incr(Counter::PagesCrawled);
        assert_eq!(before.pages_crawled, 1);
        assert_eq!(stats.snapshot().pages_crawled, 2);
    }

    #[test]
    fn test_stats_thread_safe() {
        use std::thread;

        let stats = Arc::new(StatsAggregator::new());
        let mut handles = Vec::new();

        for _ in 0..10 {
            let stats = Arc::clone(&stats);
            handles.push(thread::spawn(move || {
                for _ in 0..100 {
                    stats.incr(Counter::Processed);
                    stats.incr(Counter::Retries);
                }
            }));
        }

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(stats.get(Counter::Processed), 1000);
        assert_eq!(stats.get(Counter::Retries), 1000);
    }

    #[test]
    fn test_snapshot_serializes_snake_case_fields() {
        let stats = StatsAggregator::new();
        stats.incr(Counter::FilesQueued);
        let json = serde_json::to_value(stats.snapshot()).unwrap();
        assert_eq!(json["files_queued"], 1);
        assert!(json.get("extra").is_some());
    }
}
