//! Integration tests for the task registry running real task logic against
//! in-memory collaborators.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use harvester_core::download::{DownloadOutcome, FileDownloader};
use harvester_core::task::{
    CrawlParams, DocumentProcessor, PlaylistParams, ProcessError, ProcessedDocument,
    ProcessingParams,
};
use harvester_core::{
    BroadcastSink, Concurrency, CrawlOptions, DownloadError, EngineConfig, EventSink, EventType,
    FetchedPage, PageFetcher, ProgressEvent, TaskError, TaskId, TaskParams, TaskRegistry,
    TaskStatus,
};
use tempfile::TempDir;
use tokio::sync::Notify;

/// Sink that keeps every published event.
#[derive(Default)]
struct RecordingSink {
    events: Mutex<Vec<ProgressEvent>>,
}

impl RecordingSink {
    fn events_for(&self, id: TaskId) -> Vec<ProgressEvent> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|event| event.task_id == id)
            .cloned()
            .collect()
    }
}

impl EventSink for RecordingSink {
    fn publish(&self, event: &ProgressEvent) -> bool {
        self.events.lock().unwrap().push(event.clone());
        true
    }
}

/// Processor that processes the first `fast` files immediately and then
/// blocks until cancelled.
struct GatedProcessor {
    fast: usize,
    seen: AtomicUsize,
    blocked: Notify,
}

impl GatedProcessor {
    fn new(fast: usize) -> Self {
        Self {
            fast,
            seen: AtomicUsize::new(0),
            blocked: Notify::new(),
        }
    }
}

#[async_trait]
impl DocumentProcessor for GatedProcessor {
    fn supports(&self, _path: &Path) -> bool {
        true
    }

    async fn process(&self, path: &Path) -> Result<ProcessedDocument, ProcessError> {
        if self.seen.fetch_add(1, Ordering::SeqCst) >= self.fast {
            self.blocked.notify_one();
            std::future::pending::<()>().await;
        }
        Ok(ProcessedDocument {
            path: path.to_path_buf(),
            bytes: 1,
            digest: None,
        })
    }
}

struct PanickingProcessor;

#[async_trait]
impl DocumentProcessor for PanickingProcessor {
    fn supports(&self, _path: &Path) -> bool {
        true
    }

    async fn process(&self, _path: &Path) -> Result<ProcessedDocument, ProcessError> {
        panic!("parser exploded");
    }
}

/// Downloader that fails URLs listed in `failures` with the given status.
#[derive(Default)]
struct FakeDownloader {
    failures: HashMap<String, u16>,
}

#[async_trait]
impl FileDownloader for FakeDownloader {
    async fn download(&self, url: &str, target: &Path) -> Result<DownloadOutcome, DownloadError> {
        if let Some(status) = self.failures.get(url) {
            return Err(DownloadError::http_status(url, *status));
        }
        tokio::fs::write(target, b"%PDF-1.7")
            .await
            .map_err(|e| DownloadError::io(target, e))?;
        Ok(DownloadOutcome {
            bytes_written: 8,
            content_type: Some("application/pdf".to_string()),
        })
    }
}

/// Two-page site whose pages link to documents.
struct FakeSite;

#[async_trait]
impl PageFetcher for FakeSite {
    async fn fetch(&self, url: &str) -> Result<FetchedPage, DownloadError> {
        let links = match url {
            "https://site.test/" => vec![
                "https://site.test/about".to_string(),
                "https://site.test/a.pdf".to_string(),
            ],
            "https://site.test/about" => vec![
                "https://site.test/a.pdf".to_string(),
                "https://site.test/b.pdf".to_string(),
            ],
            "https://site.test/reports" => vec![
                "https://site.test/2023/report.pdf".to_string(),
                "https://site.test/2024/report.pdf".to_string(),
            ],
            _ => return Err(DownloadError::http_status(url, 404)),
        };
        Ok(FetchedPage {
            final_url: url.to_string(),
            status: 200,
            content_type: Some("text/html".to_string()),
            body: String::new(),
            links,
        })
    }
}

/// Site whose seed lists six documents and a page that panics when fetched.
struct PanickingSite;

#[async_trait]
impl PageFetcher for PanickingSite {
    async fn fetch(&self, url: &str) -> Result<FetchedPage, DownloadError> {
        if url != "https://boom.test/" {
            panic!("fetcher exploded on {url}");
        }
        let mut links: Vec<String> = (0..6)
            .map(|i| format!("https://boom.test/{i}.pdf"))
            .collect();
        links.push("https://boom.test/next".to_string());
        Ok(FetchedPage {
            final_url: url.to_string(),
            status: 200,
            content_type: Some("text/html".to_string()),
            body: String::new(),
            links,
        })
    }
}

/// Downloader that counts calls and takes a while per file.
struct SlowDownloader {
    calls: AtomicUsize,
    delay: Duration,
}

#[async_trait]
impl FileDownloader for SlowDownloader {
    async fn download(&self, _url: &str, _target: &Path) -> Result<DownloadOutcome, DownloadError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        Ok(DownloadOutcome {
            bytes_written: 8,
            content_type: Some("application/pdf".to_string()),
        })
    }
}

fn fast_config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.max_retries = 1;
    config.retry_base_delay_ms = 1;
    config.retry_max_delay_ms = 2;
    config.retry_jitter = false;
    config.rate_limit_ms = 0;
    config.progress_window_ms = 0;
    config.crawl = CrawlOptions {
        respect_robots: false,
        crawl_delay_ms: 0,
        ..CrawlOptions::default()
    };
    config
}

fn registry_with(
    sink: Arc<dyn EventSink>,
    config: EngineConfig,
    processor: Option<Arc<dyn DocumentProcessor>>,
) -> TaskRegistry {
    let mut builder = TaskRegistry::builder(sink)
        .config(config)
        .page_fetcher(Arc::new(FakeSite))
        .downloader(Arc::new(FakeDownloader::default()));
    if let Some(processor) = processor {
        builder = builder.processor(processor);
    }
    builder.build().unwrap()
}

fn docs_dir(count: usize) -> TempDir {
    let dir = TempDir::new().unwrap();
    for i in 0..count {
        std::fs::write(dir.path().join(format!("doc{i}.txt")), b"content").unwrap();
    }
    dir
}

fn processing(dir: &TempDir) -> TaskParams {
    TaskParams::Processing(ProcessingParams {
        root: dir.path().to_path_buf(),
        extensions: Vec::new(),
    })
}

fn assert_single_terminal(events: &[ProgressEvent], expected: EventType) {
    let terminals: Vec<_> = events.iter().filter(|e| e.is_terminal()).collect();
    assert_eq!(terminals.len(), 1, "expected exactly one terminal event");
    assert_eq!(terminals[0].event_type, expected);
    assert!(events.last().unwrap().is_terminal(), "terminal event must be last");
    for pair in events.windows(2) {
        assert!(pair[0].sequence_number < pair[1].sequence_number);
        assert!(pair[0].progress <= pair[1].progress);
    }
}

#[tokio::test]
async fn test_processing_task_completes_with_one_terminal_event() {
    let sink = Arc::new(RecordingSink::default());
    let registry = registry_with(sink.clone(), fast_config(), None);
    let dir = docs_dir(3);

    let id = registry.create(processing(&dir)).unwrap();
    let task = registry.wait(id).await.unwrap();

    assert_eq!(task.status, TaskStatus::Completed);
    assert!((task.progress - 100.0).abs() < f64::EPSILON);
    assert_eq!(task.stats.processed, 3);
    assert!(task.started_at.is_some());
    assert!(task.finished_at.is_some());

    let events = sink.events_for(id);
    assert_single_terminal(&events, EventType::Completed);
    assert_eq!(events.last().unwrap().stats_snapshot.processed, 3);
}

#[tokio::test]
async fn test_cancel_running_task() {
    let sink = Arc::new(RecordingSink::default());
    let processor = Arc::new(GatedProcessor::new(1));
    let registry = registry_with(sink.clone(), fast_config(), Some(processor.clone()));
    let dir = docs_dir(4);

    let id = registry.create(processing(&dir)).unwrap();
    processor.blocked.notified().await;

    assert!(registry.cancel(id));
    let task = registry.wait(id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Cancelled);
    assert_eq!(task.stats.processed, 1);
    assert!(task.progress < 100.0);
    assert!(!registry.cancel(id), "terminal tasks reject cancellation");

    assert_single_terminal(&sink.events_for(id), EventType::Cancelled);
}

#[tokio::test]
async fn test_force_cancel_freezes_stats() {
    let sink = Arc::new(RecordingSink::default());
    let processor = Arc::new(GatedProcessor::new(2));
    let registry = registry_with(sink.clone(), fast_config(), Some(processor.clone()));
    let dir = docs_dir(5);

    let id = registry.create(processing(&dir)).unwrap();
    processor.blocked.notified().await;

    assert!(registry.cancel_with(id, true));
    let task = registry.wait(id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Cancelled);
    assert_eq!(task.stats.processed, 2);
    assert_single_terminal(&sink.events_for(id), EventType::Cancelled);
}

#[tokio::test]
async fn test_panicking_logic_fails_task() {
    let sink = Arc::new(RecordingSink::default());
    let registry = registry_with(
        sink.clone(),
        fast_config(),
        Some(Arc::new(PanickingProcessor)),
    );
    let dir = docs_dir(1);

    let id = registry.create(processing(&dir)).unwrap();
    let task = registry.wait(id).await.unwrap();

    assert_eq!(task.status, TaskStatus::Failed);
    assert!(task.error.as_deref().unwrap().contains("parser exploded"));

    let events = sink.events_for(id);
    assert_single_terminal(&events, EventType::Failed);
    assert!(events.last().unwrap().message.contains("parser exploded"));
}

#[tokio::test]
async fn test_missing_root_fails_task() {
    let sink = Arc::new(RecordingSink::default());
    let registry = registry_with(sink.clone(), fast_config(), None);
    let dir = TempDir::new().unwrap();

    let id = registry
        .create(TaskParams::Processing(ProcessingParams {
            root: dir.path().join("missing"),
            extensions: Vec::new(),
        }))
        .unwrap();
    let task = registry.wait(id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Failed);
    assert!(task.error.is_some());
}

#[tokio::test]
async fn test_invalid_params_rejected_at_create() {
    let registry = registry_with(Arc::new(RecordingSink::default()), fast_config(), None);

    let error = registry
        .create(TaskParams::Playlist(PlaylistParams {
            playlist: "  ".to_string(),
            output_dir: None,
        }))
        .unwrap_err();
    assert!(matches!(error, TaskError::InvalidParams(_)));

    let error = registry
        .create(TaskParams::Crawl(CrawlParams {
            seed_url: "ftp://site.test/".to_string(),
            options: None,
            output_dir: None,
        }))
        .unwrap_err();
    assert!(matches!(error, TaskError::InvalidParams(_)));
    assert!(registry.list().is_empty());
}

#[tokio::test]
async fn test_playlist_counts_failed_entry_and_completes() {
    let sink = Arc::new(RecordingSink::default());
    let mut downloader = FakeDownloader::default();
    downloader
        .failures
        .insert("https://cdn.test/3.pdf".to_string(), 500);
    let registry = TaskRegistry::builder(sink.clone())
        .config(fast_config())
        .page_fetcher(Arc::new(FakeSite))
        .downloader(Arc::new(downloader))
        .build()
        .unwrap();
    let out = TempDir::new().unwrap();
    let playlist = (1..=5)
        .map(|i| format!("https://cdn.test/{i}.pdf"))
        .collect::<Vec<_>>()
        .join("\n");

    let id = registry
        .create(TaskParams::Playlist(PlaylistParams {
            playlist,
            output_dir: Some(out.path().to_path_buf()),
        }))
        .unwrap();
    let task = registry.wait(id).await.unwrap();

    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(task.stats.processed, 4);
    assert_eq!(task.stats.errors, 1);
    assert_eq!(task.stats.retries, 1);
    assert_eq!(task.stats.extra.get("entries_total"), Some(&5.0));
    assert!(out.path().join("1.pdf").exists());
    assert!(!out.path().join("3.pdf").exists());
    assert_single_terminal(&sink.events_for(id), EventType::Completed);
}

#[tokio::test]
async fn test_crawl_task_downloads_each_target_once() {
    let sink = Arc::new(RecordingSink::default());
    let registry = registry_with(sink.clone(), fast_config(), None);
    let out = TempDir::new().unwrap();

    let id = registry
        .create(TaskParams::Crawl(CrawlParams {
            seed_url: "https://site.test/".to_string(),
            options: None,
            output_dir: Some(out.path().to_path_buf()),
        }))
        .unwrap();
    let task = registry.wait(id).await.unwrap();

    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(task.stats.pages_crawled, 2);
    assert_eq!(task.stats.files_queued, 2);
    assert_eq!(task.stats.processed, 2);
    assert_eq!(task.stats.extra.get("targets_found"), Some(&2.0));
    assert!(out.path().join("a.pdf").exists());
    assert!(out.path().join("b.pdf").exists());
}

#[tokio::test]
async fn test_crawl_keeps_documents_sharing_a_file_name() {
    let registry = registry_with(Arc::new(RecordingSink::default()), fast_config(), None);
    let out = TempDir::new().unwrap();

    let id = registry
        .create(TaskParams::Crawl(CrawlParams {
            seed_url: "https://site.test/reports".to_string(),
            options: None,
            output_dir: Some(out.path().to_path_buf()),
        }))
        .unwrap();
    let task = registry.wait(id).await.unwrap();

    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(task.stats.files_queued, 2);
    assert_eq!(task.stats.processed, 2);
    assert_eq!(task.stats.skipped, 0);
    let files: Vec<_> = std::fs::read_dir(out.path())
        .unwrap()
        .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    assert_eq!(files.len(), 2, "{files:?}");
    assert!(files.iter().all(|name| name.starts_with("report") && name.ends_with(".pdf")));
}

#[tokio::test]
async fn test_failed_crawl_stops_its_downloads() {
    let mut config = fast_config();
    config.concurrency = Concurrency::Limited(1);
    let downloader = Arc::new(SlowDownloader {
        calls: AtomicUsize::new(0),
        delay: Duration::from_millis(50),
    });
    let registry = TaskRegistry::builder(Arc::new(RecordingSink::default()))
        .config(config)
        .page_fetcher(Arc::new(PanickingSite))
        .downloader(downloader.clone())
        .build()
        .unwrap();
    let out = TempDir::new().unwrap();

    let id = registry
        .create(TaskParams::Crawl(CrawlParams {
            seed_url: "https://boom.test/".to_string(),
            options: None,
            output_dir: Some(out.path().to_path_buf()),
        }))
        .unwrap();
    let task = tokio::time::timeout(Duration::from_secs(5), registry.wait(id))
        .await
        .unwrap()
        .unwrap();

    assert_eq!(task.status, TaskStatus::Failed);
    assert!(task.error.as_deref().unwrap().contains("exploded"));
    let calls_at_terminal = downloader.calls.load(Ordering::SeqCst);
    assert!(calls_at_terminal < 6);

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(downloader.calls.load(Ordering::SeqCst), calls_at_terminal);
    assert_eq!(registry.get(id).unwrap().stats, task.stats);
}

#[tokio::test]
async fn test_discovery_only_crawl_downloads_nothing() {
    let registry = registry_with(Arc::new(RecordingSink::default()), fast_config(), None);

    let id = registry
        .create(TaskParams::Crawl(CrawlParams {
            seed_url: "https://site.test/".to_string(),
            options: Some(CrawlOptions {
                max_depth: 0,
                respect_robots: false,
                crawl_delay_ms: 0,
                ..CrawlOptions::default()
            }),
            output_dir: None,
        }))
        .unwrap();
    let task = registry.wait(id).await.unwrap();

    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(task.stats.pages_crawled, 1);
    assert_eq!(task.stats.files_queued, 0);
    assert_eq!(task.stats.extra.get("targets_found"), Some(&1.0));
}

#[tokio::test]
async fn test_list_get_and_remove() {
    let registry = registry_with(Arc::new(RecordingSink::default()), fast_config(), None);
    let first_dir = docs_dir(1);
    let second_dir = docs_dir(1);

    let first = registry.create(processing(&first_dir)).unwrap();
    let second = registry.create(processing(&second_dir)).unwrap();
    registry.wait(first).await.unwrap();
    registry.wait(second).await.unwrap();

    let ids: Vec<TaskId> = registry.list().iter().map(|task| task.id).collect();
    assert_eq!(ids.len(), 2);
    assert!(ids.contains(&first) && ids.contains(&second));

    assert!(registry.remove(first));
    assert!(matches!(registry.get(first), Err(TaskError::NotFound(_))));
    assert!(!registry.remove(first));
    assert!(!registry.cancel(first));
    assert!(matches!(
        registry.wait(first).await,
        Err(TaskError::NotFound(_))
    ));
    assert_eq!(registry.get_task_status(second).unwrap().status, TaskStatus::Completed);
}

#[tokio::test]
async fn test_terminal_tasks_evicted_after_retention() {
    let mut config = fast_config();
    config.retention_secs = Some(0);
    let registry = registry_with(Arc::new(RecordingSink::default()), config, None);
    let dir = docs_dir(1);

    let id = registry.create(processing(&dir)).unwrap();
    let task = registry.wait(id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Completed);

    tokio::time::timeout(Duration::from_secs(5), async {
        while registry.get(id).is_ok() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
    assert!(registry.list().is_empty());
}

#[tokio::test]
async fn test_broadcast_subscriber_sees_ordered_stream() {
    let sink = Arc::new(BroadcastSink::new(256));
    let mut rx = sink.subscribe();
    let registry = registry_with(sink.clone(), fast_config(), None);
    let dir = docs_dir(2);

    let id = registry.create(processing(&dir)).unwrap();
    registry.wait(id).await.unwrap();

    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    assert!(events.iter().all(|event| event.task_id == id));
    assert_single_terminal(&events, EventType::Completed);
}

#[tokio::test]
async fn test_shutdown_cancels_unfinished_tasks() {
    let processor = Arc::new(GatedProcessor::new(0));
    let registry = registry_with(
        Arc::new(RecordingSink::default()),
        fast_config(),
        Some(processor.clone()),
    );
    let dir = docs_dir(2);

    let id = registry.create(processing(&dir)).unwrap();
    processor.blocked.notified().await;

    registry.shutdown().await;
    assert_eq!(registry.get(id).unwrap().status, TaskStatus::Cancelled);
}

#[test]
fn test_wait_blocks_until_terminal_in_current_thread_runtime() {
    let dir = docs_dir(2);
    let task = tokio_test::block_on(async {
        let registry = registry_with(Arc::new(RecordingSink::default()), fast_config(), None);
        let id = registry.create(processing(&dir)).unwrap();
        registry.wait(id).await.unwrap()
    });
    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(task.stats.processed, 2);
}
