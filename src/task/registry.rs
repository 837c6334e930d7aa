//! In-memory task registry and the per-task worker.

use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use super::error::TaskError;
use super::model::{Task, TaskId, TaskStatus, TaskType};
use super::playlist::{PlaylistSource, StaticPlaylist};
use super::processing::{DigestProcessor, DocumentProcessor};
use super::{crawl, playlist, processing};
use crate::cancel::{CancellationController, CancellationToken};
use crate::config::EngineConfig;
use crate::crawl::{CrawlOptions, PageFetcher};
use crate::download::{DownloadQueue, FileDownloader, HttpClient};
use crate::events::{EventSink, ProgressEventBus, TerminalKind};
use crate::stats::{StatsAggregator, StatsSnapshot};

/// Directory-processing parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessingParams {
    pub root: PathBuf,
    /// Lower-case extensions to process; empty means every file the
    /// processor supports.
    #[serde(default)]
    pub extensions: Vec<String>,
}

/// Crawl parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrawlParams {
    pub seed_url: String,
    /// Crawl limits; the registry's configured defaults when unset.
    #[serde(default)]
    pub options: Option<CrawlOptions>,
    /// Where discovered documents are downloaded. `None` only discovers them.
    #[serde(default)]
    pub output_dir: Option<PathBuf>,
}

/// Playlist parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlaylistParams {
    /// Reference understood by the registry's [`PlaylistSource`].
    pub playlist: String,
    /// Download directory; the configured output directory when unset.
    #[serde(default)]
    pub output_dir: Option<PathBuf>,
}

/// What to run. The task type is derived from the variant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskParams {
    Processing(ProcessingParams),
    Crawl(CrawlParams),
    Playlist(PlaylistParams),
}

impl TaskParams {
    #[must_use]
    pub fn task_type(&self) -> TaskType {
        match self {
            Self::Processing(_) => TaskType::Processing,
            Self::Crawl(_) => TaskType::Crawl,
            Self::Playlist(_) => TaskType::Playlist,
        }
    }

    fn validate(&self) -> Result<(), TaskError> {
        match self {
            Self::Processing(params) if params.root.as_os_str().is_empty() => {
                Err(TaskError::InvalidParams("processing root is empty".to_string()))
            }
            Self::Crawl(params) if crate::crawl::normalize_url(&params.seed_url).is_none() => {
                Err(TaskError::InvalidParams(format!(
                    "seed URL is not an http(s) URL: {}",
                    params.seed_url
                )))
            }
            Self::Playlist(params) if params.playlist.trim().is_empty() => {
                Err(TaskError::InvalidParams("playlist reference is empty".to_string()))
            }
            _ => Ok(()),
        }
    }
}

/// External collaborators the task logic runs against.
#[derive(Clone)]
pub(crate) struct Collaborators {
    pub(crate) fetcher: Arc<dyn PageFetcher>,
    pub(crate) downloader: Arc<dyn FileDownloader>,
    pub(crate) processor: Arc<dyn DocumentProcessor>,
    pub(crate) playlist_source: Arc<dyn PlaylistSource>,
}

/// Registry-owned record of one task.
struct TaskEntry {
    task: Mutex<Task>,
    stats: Arc<StatsAggregator>,
    done: watch::Sender<bool>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl TaskEntry {
    fn lock(&self) -> MutexGuard<'_, Task> {
        self.task.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Copy for callers; live stats until the task is terminal.
    fn snapshot(&self) -> Task {
        let mut task = self.lock().clone();
        if !task.status.is_terminal() {
            task.stats = self.stats.snapshot();
        }
        task
    }
}

/// Handle given to task logic: its identity, cancellation and reporting.
#[derive(Clone)]
pub struct TaskContext {
    id: TaskId,
    token: CancellationToken,
    stats: Arc<StatsAggregator>,
    bus: ProgressEventBus,
    entry: Arc<TaskEntry>,
    config: Arc<EngineConfig>,
    collaborators: Collaborators,
    /// Queues started by the task logic; stopped before the task goes terminal.
    queues: Arc<Mutex<Vec<DownloadQueue>>>,
}

impl std::fmt::Debug for TaskContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskContext")
            .field("id", &self.id)
            .field("cancelled", &self.token.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl TaskContext {
    #[must_use]
    pub fn id(&self) -> TaskId {
        self.id
    }

    #[must_use]
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    #[must_use]
    pub fn stats(&self) -> &Arc<StatsAggregator> {
        &self.stats
    }

    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub(crate) fn collaborators(&self) -> &Collaborators {
        &self.collaborators
    }

    pub(crate) fn track_queue(&self, queue: &DownloadQueue) {
        self.queues
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(queue.clone());
    }

    /// Stops every queue the logic left running (early return or panic).
    async fn shutdown_queues(&self) {
        let queues =
            std::mem::take(&mut *self.queues.lock().unwrap_or_else(PoisonError::into_inner));
        for queue in queues {
            queue.shutdown().await;
        }
    }

    /// Returns `Err(TaskError::Cancelled)` once cancellation was requested.
    ///
    /// # Errors
    ///
    /// [`TaskError::Cancelled`] when the token is triggered.
    pub fn check_cancelled(&self) -> Result<(), TaskError> {
        if self.token.is_cancelled() {
            Err(TaskError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Raises the task's progress and emits a (coalesced) progress event.
    ///
    /// Values are clamped to `[0, 100]` and never lower the current progress.
    pub fn report_progress(&self, progress: f64, message: impl Into<String>) {
        let progress = {
            let mut task = self.entry.lock();
            if task.status.is_terminal() {
                return;
            }
            task.advance_progress(progress)
        };
        self.bus
            .emit_progress(self.id, progress, message, self.stats.snapshot());
    }
}

/// Builder for [`TaskRegistry`].
pub struct TaskRegistryBuilder {
    sink: Arc<dyn EventSink>,
    config: EngineConfig,
    fetcher: Option<Arc<dyn PageFetcher>>,
    downloader: Option<Arc<dyn FileDownloader>>,
    processor: Option<Arc<dyn DocumentProcessor>>,
    playlist_source: Option<Arc<dyn PlaylistSource>>,
}

impl TaskRegistryBuilder {
    #[must_use]
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    #[must_use]
    pub fn page_fetcher(mut self, fetcher: Arc<dyn PageFetcher>) -> Self {
        self.fetcher = Some(fetcher);
        self
    }

    #[must_use]
    pub fn downloader(mut self, downloader: Arc<dyn FileDownloader>) -> Self {
        self.downloader = Some(downloader);
        self
    }

    #[must_use]
    pub fn processor(mut self, processor: Arc<dyn DocumentProcessor>) -> Self {
        self.processor = Some(processor);
        self
    }

    #[must_use]
    pub fn playlist_source(mut self, source: Arc<dyn PlaylistSource>) -> Self {
        self.playlist_source = Some(source);
        self
    }

    /// Builds the registry. A shared [`HttpClient`] backs whichever of the
    /// page fetcher and downloader were not supplied.
    ///
    /// # Errors
    ///
    /// Returns [`TaskError::InvalidParams`] for an invalid config and
    /// [`TaskError::Collaborator`] if the HTTP client cannot be built.
    pub fn build(self) -> Result<TaskRegistry, TaskError> {
        self.config
            .validate()
            .map_err(|e| TaskError::InvalidParams(e.to_string()))?;

        let (fetcher, downloader) = match (self.fetcher, self.downloader) {
            (Some(fetcher), Some(downloader)) => (fetcher, downloader),
            (fetcher, downloader) => {
                let http = Arc::new(
                    HttpClient::with_timeouts(
                        self.config.connect_timeout(),
                        self.config.read_timeout(),
                    )
                    .map_err(|e| TaskError::collaborator("http client", e.to_string()))?,
                );
                (
                    fetcher.unwrap_or_else(|| Arc::clone(&http) as Arc<dyn PageFetcher>),
                    downloader.unwrap_or_else(|| http as Arc<dyn FileDownloader>),
                )
            }
        };

        let bus = ProgressEventBus::with_window(self.sink, self.config.progress_window());
        Ok(TaskRegistry {
            inner: Arc::new(RegistryInner {
                tasks: DashMap::new(),
                cancellation: CancellationController::new(),
                bus,
                retention: self.config.retention(),
                config: Arc::new(self.config),
                collaborators: Collaborators {
                    fetcher,
                    downloader,
                    processor: self
                        .processor
                        .unwrap_or_else(|| Arc::new(DigestProcessor::new())),
                    playlist_source: self
                        .playlist_source
                        .unwrap_or_else(|| Arc::new(StaticPlaylist)),
                },
            }),
        })
    }
}

struct RegistryInner {
    tasks: DashMap<TaskId, Arc<TaskEntry>>,
    cancellation: CancellationController,
    bus: ProgressEventBus,
    config: Arc<EngineConfig>,
    retention: Option<Duration>,
    collaborators: Collaborators,
}

/// Owns every task of one engine instance.
///
/// Cloning is cheap; clones share the same tasks. Workers are tokio tasks, so
/// [`create`](Self::create) must be called from within a tokio runtime.
#[derive(Clone)]
pub struct TaskRegistry {
    inner: Arc<RegistryInner>,
}

impl std::fmt::Debug for TaskRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskRegistry")
            .field("tasks", &self.inner.tasks.len())
            .field("retention", &self.inner.retention)
            .finish_non_exhaustive()
    }
}

impl TaskRegistry {
    pub fn builder(sink: Arc<dyn EventSink>) -> TaskRegistryBuilder {
        TaskRegistryBuilder {
            sink,
            config: EngineConfig::default(),
            fetcher: None,
            downloader: None,
            processor: None,
            playlist_source: None,
        }
    }

    /// The event bus tasks publish through.
    #[must_use]
    pub fn bus(&self) -> &ProgressEventBus {
        &self.inner.bus
    }

    /// Registers a task in `pending` and starts its worker.
    ///
    /// # Errors
    ///
    /// Returns [`TaskError::InvalidParams`] when the parameters are unusable.
    ///
    /// # Panics
    ///
    /// Panics if called outside a tokio runtime.
    #[instrument(skip(self, params), fields(task_type = %params.task_type()))]
    pub fn create(&self, params: TaskParams) -> Result<TaskId, TaskError> {
        params.validate()?;

        let id = TaskId::new();
        let (done, _) = watch::channel(false);
        let entry = Arc::new(TaskEntry {
            task: Mutex::new(Task::new(id, params.task_type())),
            stats: Arc::new(StatsAggregator::new()),
            done,
            worker: Mutex::new(None),
        });
        let token = self.inner.cancellation.register(id);
        self.inner.tasks.insert(id, Arc::clone(&entry));

        let ctx = TaskContext {
            id,
            token,
            stats: Arc::clone(&entry.stats),
            bus: self.inner.bus.clone(),
            entry: Arc::clone(&entry),
            config: Arc::clone(&self.inner.config),
            collaborators: self.inner.collaborators.clone(),
            queues: Arc::new(Mutex::new(Vec::new())),
        };
        let handle = tokio::spawn(run_worker(Arc::downgrade(&self.inner), ctx, params));
        *entry.worker.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);

        info!(task_id = %id, "task created");
        Ok(id)
    }

    /// Current snapshot of a task.
    ///
    /// # Errors
    ///
    /// Returns [`TaskError::NotFound`] for unknown or evicted ids.
    pub fn get(&self, id: TaskId) -> Result<Task, TaskError> {
        self.inner
            .tasks
            .get(&id)
            .map(|entry| entry.snapshot())
            .ok_or(TaskError::NotFound(id))
    }

    /// Requests cooperative cancellation. See [`cancel_with`](Self::cancel_with).
    pub fn cancel(&self, id: TaskId) -> bool {
        self.cancel_with(id, false)
    }

    /// Requests cancellation, optionally forced.
    ///
    /// Returns true if the request was accepted: the task was pending or
    /// running (or cancelling, for a forced request). Terminal and unknown
    /// tasks return false.
    ///
    /// A forced request on a known task always freezes its stats and marks it
    /// forced, even when the task already went terminal after a normal
    /// cancel, so straggling workers can no longer move its counters.
    #[instrument(skip(self), fields(task_id = %id))]
    pub fn cancel_with(&self, id: TaskId, force: bool) -> bool {
        let Some(entry) = self.inner.tasks.get(&id).map(|e| Arc::clone(e.value())) else {
            debug!("cancel for unknown task");
            return false;
        };

        let accepted = {
            let mut task = entry.lock();
            match task.status {
                TaskStatus::Pending => true,
                TaskStatus::Running => task.transition(TaskStatus::Cancelling).is_ok(),
                TaskStatus::Cancelling => force,
                _ => false,
            }
        };
        if force {
            entry.stats.freeze();
        }
        if accepted || force {
            self.inner.cancellation.request_cancel(id, force);
        }
        if !accepted {
            debug!("cancel not accepted");
        }
        accepted
    }

    /// Evicts a task. A task that is still running is cancelled first.
    ///
    /// Returns false for unknown ids.
    pub fn remove(&self, id: TaskId) -> bool {
        let Some((_, entry)) = self.inner.tasks.remove(&id) else {
            return false;
        };
        if entry.lock().status.is_terminal() {
            self.inner.bus.release(id);
            self.inner.cancellation.forget(id);
        } else {
            // The worker releases the bus once its terminal event is out.
            self.inner.cancellation.request_cancel(id, false);
            self.inner.bus.forget(id);
        }
        debug!(task_id = %id, "task removed");
        true
    }

    /// Snapshots of all registered tasks, oldest first.
    #[must_use]
    pub fn list(&self) -> Vec<Task> {
        let mut tasks: Vec<Task> = self
            .inner
            .tasks
            .iter()
            .map(|entry| entry.snapshot())
            .collect();
        tasks.sort_by_key(|task| task.created_at);
        tasks
    }

    /// Waits until the task is terminal and returns its final snapshot.
    ///
    /// # Errors
    ///
    /// Returns [`TaskError::NotFound`] for unknown or evicted ids.
    pub async fn wait(&self, id: TaskId) -> Result<Task, TaskError> {
        let entry = self
            .inner
            .tasks
            .get(&id)
            .map(|e| Arc::clone(e.value()))
            .ok_or(TaskError::NotFound(id))?;
        let mut done = entry.done.subscribe();
        // The sender lives in the entry we hold, so this only ends on `true`.
        let _ = done.wait_for(|finished| *finished).await;
        Ok(entry.snapshot())
    }

    /// Cancels every unfinished task and joins all workers.
    #[instrument(skip(self))]
    pub async fn shutdown(&self) {
        let entries: Vec<(TaskId, Arc<TaskEntry>)> = self
            .inner
            .tasks
            .iter()
            .map(|e| (*e.key(), Arc::clone(e.value())))
            .collect();

        for (id, entry) in &entries {
            if !entry.lock().status.is_terminal() {
                self.cancel(*id);
            }
        }
        for (id, entry) in entries {
            let handle = entry
                .worker
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take();
            if let Some(handle) = handle
                && let Err(error) = handle.await
            {
                warn!(task_id = %id, error = %error, "task worker did not exit cleanly");
            }
        }
        info!("task registry shut down");
    }

    /// Alias of [`create`](Self::create) for transport layers.
    ///
    /// # Errors
    ///
    /// Same as [`create`](Self::create).
    pub fn create_task(&self, params: TaskParams) -> Result<TaskId, TaskError> {
        self.create(params)
    }

    /// Alias of [`get`](Self::get) for transport layers.
    ///
    /// # Errors
    ///
    /// Same as [`get`](Self::get).
    pub fn get_task_status(&self, id: TaskId) -> Result<Task, TaskError> {
        self.get(id)
    }

    /// Alias of [`cancel`](Self::cancel) for transport layers.
    pub fn cancel_task(&self, id: TaskId) -> bool {
        self.cancel(id)
    }
}

/// Final outcome of a worker, after reconciling with cancellation.
enum Outcome {
    Completed,
    Cancelled,
    Failed(String),
}

#[instrument(skip_all, fields(task_id = %ctx.id))]
async fn run_worker(registry: Weak<RegistryInner>, ctx: TaskContext, params: TaskParams) {
    let started = ctx.entry.lock().transition(TaskStatus::Running);
    if let Err(error) = started {
        error!(error = %error, "task could not start");
    }

    let result = if ctx.token.is_cancelled() {
        Err(TaskError::Cancelled)
    } else {
        // Nested spawn: a panic in task logic surfaces here as a JoinError.
        let logic_ctx = ctx.clone();
        match tokio::spawn(async move { run_logic(&logic_ctx, params).await }).await {
            Ok(result) => result,
            Err(join_error) if join_error.is_panic() => {
                Err(TaskError::Panicked(panic_message(join_error.into_panic())))
            }
            Err(join_error) => Err(TaskError::Panicked(join_error.to_string())),
        }
    };

    // No download may start or count once the terminal event is out.
    ctx.shutdown_queues().await;
    if registry
        .upgrade()
        .is_some_and(|registry| registry.cancellation.is_forced(ctx.id))
    {
        ctx.stats.freeze();
    }

    finish(&ctx, result);

    if let Some(registry) = registry.upgrade() {
        registry.cancellation.clear(ctx.id);
        if !registry.tasks.contains_key(&ctx.id) {
            registry.bus.release(ctx.id);
            registry.cancellation.forget(ctx.id);
            return;
        }
        if let Some(grace) = registry.retention {
            schedule_eviction(Arc::downgrade(&registry), ctx.id, grace);
        }
    }
}

async fn run_logic(ctx: &TaskContext, params: TaskParams) -> Result<(), TaskError> {
    match params {
        TaskParams::Processing(params) => processing::run(ctx, params).await,
        TaskParams::Crawl(params) => crawl::run(ctx, params).await,
        TaskParams::Playlist(params) => playlist::run(ctx, params).await,
    }
}

/// Moves the task to its terminal state and emits the terminal event once.
fn finish(ctx: &TaskContext, result: Result<(), TaskError>) {
    let snapshot: StatsSnapshot = ctx.stats.snapshot();
    let (outcome, progress) = {
        let mut task = ctx.entry.lock();
        let outcome = if task.status == TaskStatus::Cancelling || ctx.token.is_cancelled() {
            Outcome::Cancelled
        } else {
            match result {
                Ok(()) => Outcome::Completed,
                Err(TaskError::Cancelled) => Outcome::Cancelled,
                Err(error) => Outcome::Failed(error.to_string()),
            }
        };
        let next = match &outcome {
            Outcome::Completed => TaskStatus::Completed,
            Outcome::Cancelled => TaskStatus::Cancelled,
            Outcome::Failed(_) => TaskStatus::Failed,
        };
        if let Err(error) = task.transition(next) {
            warn!(error = %error, "terminal transition rejected");
            return;
        }
        match &outcome {
            Outcome::Completed => {
                task.advance_progress(100.0);
            }
            Outcome::Failed(message) => task.error = Some(message.clone()),
            Outcome::Cancelled => {}
        }
        task.stats = snapshot.clone();
        (outcome, task.progress)
    };

    let (kind, message) = match outcome {
        Outcome::Completed => {
            info!(progress, "task completed");
            (TerminalKind::Completed, "completed".to_string())
        }
        Outcome::Cancelled => {
            info!(progress, forced = ctx.token.is_forced(), "task cancelled");
            (TerminalKind::Cancelled, "cancelled".to_string())
        }
        Outcome::Failed(message) => {
            warn!(error = %message, "task failed");
            (TerminalKind::Failed, message)
        }
    };
    ctx.bus.emit_terminal(ctx.id, kind, message, snapshot);
    ctx.entry.done.send_replace(true);
}

fn schedule_eviction(registry: Weak<RegistryInner>, id: TaskId, grace: Duration) {
    tokio::spawn(async move {
        tokio::time::sleep(grace).await;
        let Some(registry) = registry.upgrade() else {
            return;
        };
        let evicted = registry
            .tasks
            .remove_if(&id, |_, entry| entry.lock().status.is_terminal())
            .is_some();
        if evicted {
            registry.bus.release(id);
            registry.cancellation.forget(id);
            debug!(task_id = %id, "terminal task evicted after retention period");
        }
    });
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "task logic panicked".to_string()
    }
}
