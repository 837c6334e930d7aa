//! Integration tests for the download queue and crawl frontier over real HTTP.
//!
//! These tests run the reqwest-backed client against wiremock servers.

mod support;

use std::sync::Arc;
use std::time::Duration;

use harvester_core::crawl::{CrawlFrontier, CrawlOptions};
use harvester_core::download::{
    Concurrency, DownloadQueue, DownloadStatus, HttpClient, RateLimiter, RetryPolicy,
};
use harvester_core::{Counter, StatsAggregator};
use support::socket_guard::start_mock_server_or_skip;
use tempfile::TempDir;
use wiremock::matchers::{method, path};
use wiremock::{Mock, ResponseTemplate};

fn fast_retry(max_retries: u32) -> RetryPolicy {
    RetryPolicy::new(
        max_retries,
        Duration::from_millis(1),
        Duration::from_millis(5),
        2.0,
    )
    .without_jitter()
}

fn html(body: &str) -> ResponseTemplate {
    ResponseTemplate::new(200)
        .insert_header("Content-Type", "text/html; charset=utf-8")
        .set_body_string(body)
}

#[tokio::test]
async fn test_queue_downloads_batch_with_one_server_error() {
    let Some(server) = start_mock_server_or_skip().await else {
        return;
    };
    for i in [1, 2, 4, 5] {
        Mock::given(method("GET"))
            .and(path(format!("/files/{i}.pdf")))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(format!("pdf {i}")))
            .mount(&server)
            .await;
    }
    Mock::given(method("GET"))
        .and(path("/files/3.pdf"))
        .respond_with(ResponseTemplate::new(500))
        .expect(3)
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let stats = Arc::new(StatsAggregator::new());
    let queue = DownloadQueue::builder(Arc::new(HttpClient::new().unwrap()), Arc::clone(&stats))
        .retry_policy(fast_retry(2))
        .build();
    for i in 1..=5 {
        queue
            .enqueue(
                format!("{}/files/{i}.pdf", server.uri()),
                dir.path().join(format!("{i}.pdf")),
            )
            .unwrap();
    }
    queue.start(Concurrency::Limited(2)).unwrap();
    let summary = queue.finish().await.unwrap();

    assert_eq!(summary.done, 4);
    assert_eq!(summary.failed, 1);
    assert_eq!(stats.get(Counter::Processed), 4);
    assert_eq!(stats.get(Counter::Errors), 1);
    assert_eq!(stats.get(Counter::BytesDownloaded), 4 * 5);
    assert_eq!(std::fs::read(dir.path().join("2.pdf")).unwrap(), b"pdf 2");
    assert!(!dir.path().join("3.pdf").exists());
    assert!(queue.peak_active_downloads() <= 2);
}

#[tokio::test]
async fn test_queue_honours_retry_after_then_succeeds() {
    let Some(server) = start_mock_server_or_skip().await else {
        return;
    };
    Mock::given(method("GET"))
        .and(path("/busy.pdf"))
        .respond_with(ResponseTemplate::new(429).insert_header("Retry-After", "0"))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/busy.pdf"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"ok".to_vec()))
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let stats = Arc::new(StatsAggregator::new());
    let queue = DownloadQueue::builder(Arc::new(HttpClient::new().unwrap()), Arc::clone(&stats))
        .retry_policy(fast_retry(3))
        .rate_limiter(Arc::new(RateLimiter::disabled()))
        .build();
    let id = queue
        .enqueue(format!("{}/busy.pdf", server.uri()), dir.path().join("busy.pdf"))
        .unwrap()
        .unwrap();
    queue.start(Concurrency::Limited(1)).unwrap();
    queue.finish().await.unwrap();

    let item = queue.item(id).unwrap();
    assert_eq!(item.status, DownloadStatus::Done);
    assert_eq!(item.attempts, 2);
    assert_eq!(stats.get(Counter::Retries), 1);
    assert_eq!(std::fs::read(dir.path().join("busy.pdf")).unwrap(), b"ok");
}

#[tokio::test]
async fn test_queue_not_found_is_permanent() {
    let Some(server) = start_mock_server_or_skip().await else {
        return;
    };
    Mock::given(method("GET"))
        .and(path("/gone.pdf"))
        .respond_with(ResponseTemplate::new(404))
        .expect(1)
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let stats = Arc::new(StatsAggregator::new());
    let queue = DownloadQueue::builder(Arc::new(HttpClient::new().unwrap()), Arc::clone(&stats))
        .retry_policy(fast_retry(3))
        .build();
    queue
        .enqueue(format!("{}/gone.pdf", server.uri()), dir.path().join("gone.pdf"))
        .unwrap();
    queue.start(Concurrency::default()).unwrap();
    let summary = queue.finish().await.unwrap();

    assert_eq!(summary.failed, 1);
    assert_eq!(stats.get(Counter::Retries), 0);
    let item = &queue.items()[0];
    assert!(item.error.as_deref().unwrap().contains("404"));
}

#[tokio::test]
async fn test_crawl_over_http_respects_robots_and_finds_documents() {
    let Some(server) = start_mock_server_or_skip().await else {
        return;
    };
    Mock::given(method("GET"))
        .and(path("/robots.txt"))
        .respond_with(
            ResponseTemplate::new(200).set_body_string("User-agent: *\nDisallow: /private/\n"),
        )
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/"))
        .respond_with(html(
            r#"<a href="/docs">docs</a> <a href="/private/x">secret</a> <a href="/a.pdf">A</a>"#,
        ))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/docs"))
        .respond_with(html(r#"<a href="b.pdf">B</a> <a href="/">home</a>"#))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/private/x"))
        .respond_with(html("secret"))
        .expect(0)
        .mount(&server)
        .await;

    let stats = Arc::new(StatsAggregator::new());
    let options = CrawlOptions {
        max_depth: 2,
        crawl_delay_ms: 0,
        ..CrawlOptions::default()
    };
    let frontier = CrawlFrontier::new(Arc::new(HttpClient::new().unwrap()), options)
        .with_stats(Arc::clone(&stats))
        .with_retry_policy(fast_retry(0));
    let mut session = frontier.start(&format!("{}/", server.uri())).unwrap();

    let mut targets = Vec::new();
    let mut failed = Vec::new();
    while let Some(page) = session.next().await {
        if page.is_failed() {
            failed.push(page.url.url.clone());
        }
        targets.extend(page.targets);
    }

    assert_eq!(stats.get(Counter::PagesCrawled), 2);
    assert_eq!(failed.len(), 1);
    assert!(failed[0].ends_with("/private/x"));
    targets.sort();
    assert_eq!(
        targets,
        vec![format!("{}/a.pdf", server.uri()), format!("{}/b.pdf", server.uri())]
    );
}
