//! Task lifecycle, registry and per-type task logic.
//!
//! A task is created through [`TaskRegistry::create`], runs on its own tokio
//! task and ends in exactly one terminal state with exactly one terminal
//! event. Item-level failures are counted in the task's stats; only
//! cancellation and control-flow failures end a task early.

mod crawl;
mod error;
mod model;
mod playlist;
mod processing;
mod registry;

use std::sync::Arc;

pub use error::TaskError;
pub use model::{Task, TaskId, TaskStatus, TaskType, clamp_progress};
pub use playlist::{PlaylistEntry, PlaylistError, PlaylistSource, StaticPlaylist};
pub use processing::{DigestProcessor, DocumentProcessor, ProcessError, ProcessedDocument};
pub use registry::{
    CrawlParams, PlaylistParams, ProcessingParams, TaskContext, TaskParams, TaskRegistry,
    TaskRegistryBuilder,
};

use crate::download::{DownloadQueue, ItemObserver, RateLimiter};

/// Download queue wired to the task's stats, cancellation and config.
fn download_queue(
    ctx: &TaskContext,
    limiter: Arc<RateLimiter>,
    observer: Option<ItemObserver>,
) -> DownloadQueue {
    let config = ctx.config();
    let builder = DownloadQueue::builder(
        Arc::clone(&ctx.collaborators().downloader),
        Arc::clone(ctx.stats()),
    )
    .retry_policy(config.retry_policy())
    .rate_limiter(limiter)
    .existing_files(config.existing_files)
    .cancel_signal(&ctx.token().child_signal());
    let queue = match observer {
        Some(observer) => builder.on_item_finished(observer),
        None => builder,
    }
    .build();
    ctx.track_queue(&queue);
    queue
}

/// `done` out of `total` as a percentage; an empty total counts as complete.
#[allow(clippy::cast_precision_loss)]
fn percent(done: usize, total: usize) -> f64 {
    if total == 0 {
        100.0
    } else {
        done as f64 / total as f64 * 100.0
    }
}

#[allow(clippy::cast_precision_loss)]
fn metric(count: usize) -> f64 {
    count as f64
}
