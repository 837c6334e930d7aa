//! Crawl task: walk the frontier and download the documents it discovers.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tracing::{info, instrument};

use super::error::TaskError;
use super::registry::{CrawlParams, TaskContext};
use super::{metric, percent};
use crate::crawl::CrawlFrontier;
use crate::download::{QueueError, RateLimiter, disambiguated_target_path, target_path_for};

/// Share of the progress bar covered by crawling when downloads follow.
const CRAWL_SHARE_WITH_DOWNLOADS: f64 = 90.0;
const CRAWL_SHARE_DISCOVERY_ONLY: f64 = 99.0;

/// How often download progress is reported while waiting for the queue.
const DOWNLOAD_PROGRESS_TICK: Duration = Duration::from_millis(250);

#[instrument(skip(ctx, params), fields(task_id = %ctx.id(), seed = %params.seed_url))]
pub(super) async fn run(ctx: &TaskContext, params: CrawlParams) -> Result<(), TaskError> {
    let config = ctx.config();
    let options = params.options.unwrap_or_else(|| config.crawl.clone());
    // Pages and downloads from one host share a single politeness schedule.
    let limiter = Arc::new(RateLimiter::new(options.crawl_delay()));

    let frontier = CrawlFrontier::new(Arc::clone(&ctx.collaborators().fetcher), options)
        .with_stats(Arc::clone(ctx.stats()))
        .with_retry_policy(config.retry_policy())
        .with_rate_limiter(Arc::clone(&limiter))
        .with_cancel_signal(ctx.token().child_signal());
    let mut session = frontier
        .start(&params.seed_url)
        .map_err(|e| TaskError::InvalidParams(e.to_string()))?;

    let downloads = match &params.output_dir {
        Some(dir) => {
            let queue = super::download_queue(ctx, Arc::clone(&limiter), None);
            queue.start(config.concurrency)?;
            Some((queue, dir.clone()))
        }
        None => None,
    };
    let crawl_share = if downloads.is_some() {
        CRAWL_SHARE_WITH_DOWNLOADS
    } else {
        CRAWL_SHARE_DISCOVERY_ONLY
    };

    // Target path -> URL it was assigned to in this crawl.
    let mut assigned: HashMap<PathBuf, String> = HashMap::new();
    let mut targets_found: usize = 0;
    while let Some(page) = session.next().await {
        for target in &page.targets {
            targets_found += 1;
            if let Some((queue, dir)) = &downloads {
                let mut path = target_path_for(dir, target);
                if assigned.get(&path).is_some_and(|owner| owner != target) {
                    path = disambiguated_target_path(dir, target);
                }
                assigned.insert(path.clone(), target.clone());
                match queue.enqueue(target, path) {
                    Ok(_) | Err(QueueError::Closed) => {}
                    Err(error) => return Err(error.into()),
                }
            }
        }

        let visited = session.visited_count();
        let pending = session.pending_len();
        ctx.stats().set_extra("targets_found", metric(targets_found));
        let progress = crawl_share * percent(visited, visited + pending) / 100.0;
        ctx.report_progress(progress, format!("crawled {}", page.url.url));
    }
    info!(
        pages = session.visited_count(),
        targets = targets_found,
        "crawl phase finished"
    );

    if let Some((queue, _)) = downloads {
        if ctx.token().is_cancelled() {
            queue.cancel_all();
        }

        let finish = queue.finish();
        tokio::pin!(finish);
        let mut ticker = tokio::time::interval(DOWNLOAD_PROGRESS_TICK);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let summary = loop {
            tokio::select! {
                result = &mut finish => break result?,
                _ = ticker.tick() => {
                    let total = queue.len();
                    let done = queue.summary().total();
                    let progress =
                        crawl_share + (100.0 - crawl_share) * percent(done, total) / 100.0;
                    ctx.report_progress(progress, format!("downloaded {done}/{total}"));
                }
            }
        };
        info!(
            done = summary.done,
            failed = summary.failed,
            skipped = summary.skipped,
            "crawl downloads finished"
        );
    }

    ctx.check_cancelled()
}
