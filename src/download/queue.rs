//! Bounded-concurrency download pool with retry and politeness.
//!
//! A [`DownloadQueue`] owns a priority-ordered set of pending
//! [`DownloadItem`]s and, once [`start`](DownloadQueue::start)ed, a dispatcher
//! that hands them to spawned workers:
//!
//! - a semaphore permit is acquired before each worker is spawned and released
//!   when it finishes, so `active_downloads <= concurrency` always holds
//! - each worker waits for its domain's politeness slot, calls the
//!   [`FileDownloader`], and retries transient failures with backoff
//! - an item that exhausts its retries is marked failed and counted; the
//!   queue keeps going
//!
//! Items are keyed by `(url, target_path)`; the same pair is accepted once per
//! queue. Distinct items never write the same file: a worker claims its target
//! before downloading, and a path already claimed by another item gets a
//! numeric suffix. Every item reaches exactly one terminal status and each counter is
//! bumped exactly once for it.

use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use dashmap::DashMap;
use futures_util::FutureExt;
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken as Signal;
use tracing::{debug, info, instrument, warn};

use super::client::{DownloadOutcome, FileDownloader};
use super::error::{DownloadError, QueueError};
use super::filename::unique_path_by;
use super::item::{Concurrency, DownloadItem, DownloadStatus, ExistingFilePolicy};
use super::rate_limiter::{RateLimiter, parse_retry_after};
use super::retry::{FailureType, RetryDecision, RetryPolicy, classify_error};
use crate::stats::{Counter, StatsAggregator};

/// Callback invoked once per item when it reaches a terminal status.
pub type ItemObserver = Arc<dyn Fn(&DownloadItem) + Send + Sync>;

/// Terminal tallies returned by [`DownloadQueue::finish`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueSummary {
    pub done: usize,
    pub failed: usize,
    pub skipped: usize,
    pub cancelled: usize,
}

impl QueueSummary {
    #[must_use]
    pub fn total(&self) -> usize {
        self.done + self.failed + self.skipped + self.cancelled
    }
}

/// Builder for [`DownloadQueue`].
pub struct DownloadQueueBuilder {
    downloader: Arc<dyn FileDownloader>,
    stats: Arc<StatsAggregator>,
    retry_policy: RetryPolicy,
    rate_limiter: Arc<RateLimiter>,
    existing_files: ExistingFilePolicy,
    signal: Signal,
    observer: Option<ItemObserver>,
}

impl DownloadQueueBuilder {
    #[must_use]
    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    #[must_use]
    pub fn rate_limiter(mut self, limiter: Arc<RateLimiter>) -> Self {
        self.rate_limiter = limiter;
        self
    }

    #[must_use]
    pub fn existing_files(mut self, policy: ExistingFilePolicy) -> Self {
        self.existing_files = policy;
        self
    }

    /// Ties the queue to an outer cancellation signal (usually the task's).
    ///
    /// The queue listens on a child of `parent`, so [`DownloadQueue::cancel_all`]
    /// never cancels the parent.
    #[must_use]
    pub fn cancel_signal(mut self, parent: &Signal) -> Self {
        self.signal = parent.child_token();
        self
    }

    #[must_use]
    pub fn on_item_finished(mut self, observer: ItemObserver) -> Self {
        self.observer = Some(observer);
        self
    }

    #[must_use]
    pub fn build(self) -> DownloadQueue {
        DownloadQueue {
            inner: Arc::new(QueueInner {
                downloader: self.downloader,
                stats: self.stats,
                retry_policy: self.retry_policy,
                rate_limiter: self.rate_limiter,
                existing_files: self.existing_files,
                signal: self.signal,
                observer: self.observer,
                pending: Mutex::new(PendingState::default()),
                items: DashMap::new(),
                next_id: AtomicU64::new(1),
                wake: Notify::new(),
                paused: AtomicBool::new(false),
                closed: AtomicBool::new(false),
                active: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
                dispatcher: Mutex::new(None),
            }),
        }
    }
}

/// Cloneable handle to a download pool. All clones share one queue.
#[derive(Clone)]
pub struct DownloadQueue {
    inner: Arc<QueueInner>,
}

impl std::fmt::Debug for DownloadQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DownloadQueue")
            .field("items", &self.inner.items.len())
            .field("active", &self.active_downloads())
            .field("paused", &self.is_paused())
            .finish_non_exhaustive()
    }
}

struct QueueInner {
    downloader: Arc<dyn FileDownloader>,
    stats: Arc<StatsAggregator>,
    retry_policy: RetryPolicy,
    rate_limiter: Arc<RateLimiter>,
    existing_files: ExistingFilePolicy,
    signal: Signal,
    observer: Option<ItemObserver>,
    pending: Mutex<PendingState>,
    items: DashMap<u64, DownloadItem>,
    next_id: AtomicU64,
    /// Wakes the dispatcher: new item, resume, close or cancel.
    wake: Notify,
    paused: AtomicBool,
    closed: AtomicBool,
    active: AtomicUsize,
    peak: AtomicUsize,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

#[derive(Default)]
struct PendingState {
    heap: BinaryHeap<PendingEntry>,
    seen: HashSet<(String, PathBuf)>,
    /// Target path -> id of the item writing it.
    claimed: HashMap<PathBuf, u64>,
}

#[derive(Debug, PartialEq, Eq)]
struct PendingEntry {
    priority: i32,
    id: u64,
}

impl Ord for PendingEntry {
    /// Higher priority first, then FIFO by id.
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.id.cmp(&self.id))
    }
}

impl PartialOrd for PendingEntry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl DownloadQueue {
    /// Starts building a queue around a downloader and the owning task's stats.
    ///
    /// Defaults: [`RetryPolicy::default`], no rate limiting, skip existing files,
    /// a standalone cancellation signal.
    pub fn builder(
        downloader: Arc<dyn FileDownloader>,
        stats: Arc<StatsAggregator>,
    ) -> DownloadQueueBuilder {
        DownloadQueueBuilder {
            downloader,
            stats,
            retry_policy: RetryPolicy::default(),
            rate_limiter: Arc::new(RateLimiter::disabled()),
            existing_files: ExistingFilePolicy::default(),
            signal: Signal::new(),
            observer: None,
        }
    }

    /// Enqueues `url -> target_path` at priority 0.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Closed`] after [`finish`](Self::finish) or
    /// [`cancel_all`](Self::cancel_all).
    pub fn enqueue(
        &self,
        url: impl Into<String>,
        target_path: impl Into<PathBuf>,
    ) -> Result<Option<u64>, QueueError> {
        self.enqueue_with_priority(url, target_path, 0)
    }

    /// Enqueues with an explicit priority (higher runs first).
    ///
    /// Returns `Ok(None)` when the `(url, target_path)` pair was already queued.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Closed`] once the queue no longer accepts work.
    pub fn enqueue_with_priority(
        &self,
        url: impl Into<String>,
        target_path: impl Into<PathBuf>,
        priority: i32,
    ) -> Result<Option<u64>, QueueError> {
        let inner = &self.inner;
        if inner.closed.load(Ordering::SeqCst) || inner.signal.is_cancelled() {
            return Err(QueueError::Closed);
        }

        let url = url.into();
        let target_path = target_path.into();
        let id = {
            let mut pending = inner.lock_pending();
            if !pending.seen.insert((url.clone(), target_path.clone())) {
                debug!(url = %url, path = %target_path.display(), "duplicate download ignored");
                return Ok(None);
            }
            let id = inner.next_id.fetch_add(1, Ordering::SeqCst);
            inner.items.insert(
                id,
                DownloadItem::new(
                    id,
                    url,
                    target_path,
                    priority,
                    inner.retry_policy.max_retries(),
                ),
            );
            pending.heap.push(PendingEntry { priority, id });
            id
        };

        inner.stats.incr(Counter::FilesQueued);
        inner.wake.notify_one();
        Ok(Some(id))
    }

    /// Spawns the dispatcher with the given pool size.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::InvalidConcurrency`] for an out-of-range bound and
    /// [`QueueError::AlreadyStarted`] on a second call.
    #[instrument(skip(self), fields(concurrency = %concurrency))]
    pub fn start(&self, concurrency: Concurrency) -> Result<(), QueueError> {
        let permits = concurrency.permits()?;
        let mut slot = self
            .inner
            .dispatcher
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if slot.is_some() {
            return Err(QueueError::AlreadyStarted);
        }

        info!(
            max_retries = self.inner.retry_policy.max_retries(),
            rate_limit_ms = self.inner.rate_limiter.default_delay().as_millis(),
            "starting download queue"
        );
        let semaphore = Arc::new(Semaphore::new(permits));
        *slot = Some(tokio::spawn(dispatch(Arc::clone(&self.inner), semaphore)));
        Ok(())
    }

    /// Stops handing out new items. In-flight downloads run to completion.
    pub fn pause(&self) {
        if !self.inner.paused.swap(true, Ordering::SeqCst) {
            info!("download queue paused");
        }
    }

    pub fn resume(&self) {
        if self.inner.paused.swap(false, Ordering::SeqCst) {
            info!("download queue resumed");
        }
        self.inner.wake.notify_one();
    }

    /// Aborts in-flight downloads best-effort and cancels everything queued.
    pub fn cancel_all(&self) {
        let inner = &self.inner;
        inner.closed.store(true, Ordering::SeqCst);
        inner.signal.cancel();
        let drained: Vec<u64> = {
            let mut pending = inner.lock_pending();
            pending.heap.drain().map(|entry| entry.id).collect()
        };
        for id in &drained {
            inner.finalize(*id, DownloadStatus::Cancelled, |_| {});
        }
        info!(cancelled = drained.len(), "download queue cancelled");
        inner.wake.notify_one();
    }

    /// Closes the queue to new items and waits until every item is terminal.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::NotStarted`] if [`start`](Self::start) was never
    /// called and [`QueueError::Dispatcher`] if the dispatcher died.
    pub async fn finish(&self) -> Result<QueueSummary, QueueError> {
        self.inner.closed.store(true, Ordering::SeqCst);
        self.inner.wake.notify_one();

        let handle = self
            .inner
            .dispatcher
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or(QueueError::NotStarted)?;
        handle
            .await
            .map_err(|e| QueueError::Dispatcher(e.to_string()))?;

        // Anything still pending was never dispatched (cancelled mid-flight).
        let leftovers: Vec<u64> = self
            .inner
            .lock_pending()
            .heap
            .drain()
            .map(|entry| entry.id)
            .collect();
        for id in leftovers {
            self.inner.finalize(id, DownloadStatus::Cancelled, |_| {});
        }

        Ok(self.summary())
    }

    /// Cancels the queue and waits for its dispatcher and workers to stop.
    ///
    /// Used when the owner is going away without calling
    /// [`finish`](Self::finish). Without a dispatcher to join, this only
    /// closes the queue and cancels its signal.
    pub async fn shutdown(&self) {
        let handle = self
            .inner
            .dispatcher
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(handle) = handle else {
            // Never started, finished, or a `finish` is already waiting.
            self.inner.closed.store(true, Ordering::SeqCst);
            self.inner.signal.cancel();
            return;
        };
        self.cancel_all();
        if let Err(error) = handle.await {
            warn!(error = %error, "download dispatcher aborted during shutdown");
        }
        let leftovers: Vec<u64> = self
            .inner
            .lock_pending()
            .heap
            .drain()
            .map(|entry| entry.id)
            .collect();
        for id in leftovers {
            self.inner.cancel(id);
        }
    }

    /// Terminal tallies so far.
    #[must_use]
    pub fn summary(&self) -> QueueSummary {
        let mut summary = QueueSummary::default();
        for item in &self.inner.items {
            match item.status {
                DownloadStatus::Done => summary.done += 1,
                DownloadStatus::Failed => summary.failed += 1,
                DownloadStatus::Skipped => summary.skipped += 1,
                DownloadStatus::Cancelled => summary.cancelled += 1,
                _ => {}
            }
        }
        summary
    }

    #[must_use]
    pub fn active_downloads(&self) -> usize {
        self.inner.active.load(Ordering::SeqCst)
    }

    /// Highest number of simultaneously active downloads observed.
    #[must_use]
    pub fn peak_active_downloads(&self) -> usize {
        self.inner.peak.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn is_paused(&self) -> bool {
        self.inner.paused.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.inner.lock_pending().heap.len()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.items.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.items.is_empty()
    }

    #[must_use]
    pub fn item(&self, id: u64) -> Option<DownloadItem> {
        self.inner.items.get(&id).map(|item| item.clone())
    }

    /// All items ordered by enqueue id.
    #[must_use]
    pub fn items(&self) -> Vec<DownloadItem> {
        let mut items: Vec<DownloadItem> =
            self.inner.items.iter().map(|item| item.clone()).collect();
        items.sort_by_key(|item| item.id);
        items
    }
}

impl QueueInner {
    fn lock_pending(&self) -> MutexGuard<'_, PendingState> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn pop_next(&self) -> Option<u64> {
        self.lock_pending().heap.pop().map(|entry| entry.id)
    }

    fn set_status(&self, id: u64, status: DownloadStatus) {
        if let Some(mut item) = self.items.get_mut(&id)
            && !item.status.is_terminal()
        {
            item.status = status;
        }
    }

    /// Moves an item to a terminal status exactly once.
    ///
    /// Returns `false` if the item was already terminal; callers only count
    /// an item when this returns `true`.
    fn finalize(
        &self,
        id: u64,
        status: DownloadStatus,
        update: impl FnOnce(&mut DownloadItem),
    ) -> bool {
        let snapshot = {
            let Some(mut item) = self.items.get_mut(&id) else {
                return false;
            };
            if item.status.is_terminal() {
                return false;
            }
            item.status = status;
            update(&mut item);
            item.clone()
        };
        if let Some(observer) = &self.observer {
            observer(&snapshot);
        }
        true
    }

    fn complete(&self, id: u64, outcome: DownloadOutcome) {
        let bytes = outcome.bytes_written;
        if self.finalize(id, DownloadStatus::Done, |item| {
            item.bytes_written = outcome.bytes_written;
            item.content_type = outcome.content_type;
            item.error = None;
        }) {
            self.stats.incr(Counter::Processed);
            self.stats.increment(Counter::BytesDownloaded, bytes);
        }
    }

    fn fail(&self, id: u64, error: &DownloadError) {
        self.fail_with_message(id, error.to_string());
    }

    fn fail_with_message(&self, id: u64, message: String) {
        if self.finalize(id, DownloadStatus::Failed, |item| {
            item.error = Some(message);
        }) {
            self.stats.incr(Counter::Errors);
        }
    }

    fn skip(&self, id: u64) {
        if self.finalize(id, DownloadStatus::Skipped, |_| {}) {
            self.stats.incr(Counter::Skipped);
        }
    }

    fn cancel(&self, id: u64) {
        self.finalize(id, DownloadStatus::Cancelled, |_| {});
    }

    /// Waits for the next runnable item, or `None` when the dispatcher should stop.
    async fn next_runnable(&self) -> Option<u64> {
        loop {
            if self.signal.is_cancelled() {
                return None;
            }
            if !self.paused.load(Ordering::SeqCst) {
                if let Some(id) = self.pop_next() {
                    return Some(id);
                }
                if self.closed.load(Ordering::SeqCst) {
                    return None;
                }
            }
            tokio::select! {
                () = self.signal.cancelled() => return None,
                () = self.wake.notified() => {}
            }
        }
    }

    /// Claims the path item `id` will write. Returns `None` to skip.
    ///
    /// A path claimed by another item always gets a fresh suffix. A file that
    /// exists on disk and nobody in this queue claimed follows the
    /// existing-file policy.
    fn claim_target(&self, id: u64, requested: &Path) -> Option<PathBuf> {
        let mut pending = self.lock_pending();
        let claimed = &pending.claimed;
        let claimed_by_other =
            |path: &Path| claimed.get(path).is_some_and(|owner| *owner != id);

        let target = if claimed_by_other(requested) {
            unique_path_by(requested, |path| path.exists() || claimed_by_other(path))
        } else if !requested.exists() {
            requested.to_path_buf()
        } else {
            match self.existing_files {
                ExistingFilePolicy::Skip => return None,
                ExistingFilePolicy::Overwrite => requested.to_path_buf(),
                ExistingFilePolicy::Rename => {
                    unique_path_by(requested, |path| path.exists() || claimed_by_other(path))
                }
            }
        };
        pending.claimed.insert(target.clone(), id);
        Some(target)
    }

    #[instrument(skip(self), fields(url))]
    async fn process(&self, id: u64) {
        let Some((url, requested)) = self
            .items
            .get(&id)
            .map(|item| (item.url.clone(), item.target_path.clone()))
        else {
            return;
        };
        tracing::Span::current().record("url", url.as_str());

        let Some(target) = self.claim_target(id, &requested) else {
            debug!(path = %requested.display(), "target exists, skipping");
            self.skip(id);
            return;
        };
        if target != requested
            && let Some(mut item) = self.items.get_mut(&id)
        {
            item.target_path.clone_from(&target);
        }

        let mut attempt: u32 = 0;
        loop {
            if self.signal.is_cancelled() {
                self.cancel(id);
                return;
            }

            attempt += 1;
            if let Some(mut item) = self.items.get_mut(&id) {
                item.attempts = attempt;
            }
            self.set_status(id, DownloadStatus::Downloading);

            if !self
                .rate_limiter
                .acquire_until_cancelled(&url, &self.signal)
                .await
            {
                self.cancel(id);
                return;
            }

            let result = tokio::select! {
                () = self.signal.cancelled() => {
                    debug!(attempt, "download aborted by cancellation");
                    self.cancel(id);
                    return;
                }
                result = self.downloader.download(&url, &target) => result,
            };

            let error = match result {
                Ok(outcome) => {
                    debug!(attempt, bytes = outcome.bytes_written, "download completed");
                    self.complete(id, outcome);
                    return;
                }
                Err(error) => error,
            };

            let failure_type = classify_error(&error);
            let server_delay = self.server_delay(&url, failure_type, &error).await;

            match self.retry_policy.should_retry(failure_type, attempt) {
                RetryDecision::Retry { delay, attempt: next } => {
                    let delay = server_delay.map_or(delay, |server| server.max(delay));
                    warn!(
                        attempt,
                        next_attempt = next,
                        delay_ms = delay.as_millis(),
                        error = %error,
                        "download failed, retrying"
                    );
                    self.stats.incr(Counter::Retries);
                    self.set_status(id, DownloadStatus::Retrying);
                    tokio::select! {
                        () = self.signal.cancelled() => {
                            self.cancel(id);
                            return;
                        }
                        () = tokio::time::sleep(delay) => {}
                    }
                }
                RetryDecision::DoNotRetry { reason } => {
                    warn!(attempt, error = %error, reason = %reason, "download failed");
                    self.fail(id, &error);
                    return;
                }
            }
        }
    }

    /// Honors Retry-After on 429 responses and tells the rate limiter about it.
    async fn server_delay(
        &self,
        url: &str,
        failure_type: FailureType,
        error: &DownloadError,
    ) -> Option<Duration> {
        if failure_type != FailureType::RateLimited {
            return None;
        }
        let delay = error.retry_after().and_then(parse_retry_after)?;
        self.rate_limiter.record_rate_limit(url, delay).await;
        Some(delay)
    }
}

/// Decrements the active counter when a worker ends, even on panic.
struct ActiveGuard(Arc<QueueInner>);

impl ActiveGuard {
    fn enter(inner: Arc<QueueInner>) -> Self {
        let now = inner.active.fetch_add(1, Ordering::SeqCst) + 1;
        inner.peak.fetch_max(now, Ordering::SeqCst);
        Self(inner)
    }
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.active.fetch_sub(1, Ordering::SeqCst);
    }
}

async fn acquire_permit(
    inner: &QueueInner,
    semaphore: &Arc<Semaphore>,
) -> Option<OwnedSemaphorePermit> {
    tokio::select! {
        () = inner.signal.cancelled() => None,
        permit = Arc::clone(semaphore).acquire_owned() => permit.ok(),
    }
}

async fn dispatch(inner: Arc<QueueInner>, semaphore: Arc<Semaphore>) {
    let mut workers = JoinSet::new();

    loop {
        // Permit first: an item is only popped once a worker can take it.
        let Some(permit) = acquire_permit(&inner, &semaphore).await else {
            break;
        };
        let Some(id) = inner.next_runnable().await else {
            break;
        };

        let worker_inner = Arc::clone(&inner);
        workers.spawn(async move {
            let _permit = permit;
            let _active = ActiveGuard::enter(Arc::clone(&worker_inner));
            if AssertUnwindSafe(worker_inner.process(id))
                .catch_unwind()
                .await
                .is_err()
            {
                warn!(item_id = id, "download worker panicked");
                worker_inner.fail_with_message(id, "download worker panicked".to_string());
            }
            id
        });

        while let Some(joined) = workers.try_join_next() {
            reap(joined);
        }
    }

    while let Some(joined) = workers.join_next().await {
        reap(joined);
    }
    debug!("download dispatcher stopped");
}

fn reap(joined: Result<u64, tokio::task::JoinError>) {
    if let Err(error) = joined {
        warn!(error = %error, "download worker aborted");
    }
}
