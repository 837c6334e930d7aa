//! Playlist ingestion: resolve entries, then download each one.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, instrument};

use super::error::TaskError;
use super::registry::{PlaylistParams, TaskContext};
use super::{metric, percent};
use crate::download::{
    DownloadError, DownloadItem, ItemObserver, QueueError, filename_from_url, sanitize_filename,
    url_extension,
};
use crate::stats::Counter;

/// One downloadable entry of a playlist.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlaylistEntry {
    pub url: String,
    /// Human title; used for the file name when present.
    #[serde(default)]
    pub title: Option<String>,
}

impl PlaylistEntry {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            title: None,
        }
    }

    /// File name for this entry: the sanitized title (keeping the URL's
    /// extension) or the URL's own file name.
    #[must_use]
    pub fn file_name(&self) -> String {
        let Some(title) = self.title.as_deref().map(str::trim).filter(|t| !t.is_empty()) else {
            return filename_from_url(&self.url);
        };
        let stem = sanitize_filename(title);
        match url_extension(&self.url) {
            Some(ext) if !stem.to_ascii_lowercase().ends_with(&format!(".{ext}")) => {
                format!("{stem}.{ext}")
            }
            _ => stem,
        }
    }

    fn target_in(&self, dir: &Path) -> PathBuf {
        dir.join(self.file_name())
    }
}

#[derive(Debug, Error)]
pub enum PlaylistError {
    #[error("playlist not found: {0}")]
    NotFound(String),

    #[error("playlist metadata unavailable: {0}")]
    Unavailable(String),

    #[error(transparent)]
    Transfer(#[from] DownloadError),
}

/// Resolves a playlist reference into its entries.
#[async_trait]
pub trait PlaylistSource: Send + Sync {
    async fn entries(&self, playlist: &str) -> Result<Vec<PlaylistEntry>, PlaylistError>;
}

/// Source whose reference is the list itself: whitespace-separated URLs.
///
/// Backs batched downloads of an explicit URL list.
#[derive(Debug, Default, Clone, Copy)]
pub struct StaticPlaylist;

#[async_trait]
impl PlaylistSource for StaticPlaylist {
    async fn entries(&self, playlist: &str) -> Result<Vec<PlaylistEntry>, PlaylistError> {
        Ok(playlist.split_whitespace().map(PlaylistEntry::new).collect())
    }
}

#[instrument(skip(ctx, params), fields(task_id = %ctx.id()))]
pub(super) async fn run(ctx: &TaskContext, params: PlaylistParams) -> Result<(), TaskError> {
    let source = Arc::clone(&ctx.collaborators().playlist_source);
    let entries = tokio::select! {
        () = ctx.token().cancelled() => return Err(TaskError::Cancelled),
        result = source.entries(&params.playlist) => result
            .map_err(|e| TaskError::collaborator("playlist source", e.to_string()))?,
    };

    let total = entries.len();
    ctx.stats().set_extra("entries_total", metric(total));
    info!(entries = total, "playlist resolved");
    if total == 0 {
        return Ok(());
    }

    let output_dir = params
        .output_dir
        .unwrap_or_else(|| ctx.config().output_dir.clone());
    let finished = Arc::new(AtomicUsize::new(0));
    let report = {
        let ctx = ctx.clone();
        let finished = Arc::clone(&finished);
        move |message: String| {
            let done = finished.fetch_add(1, Ordering::SeqCst) + 1;
            ctx.report_progress(percent(done, total), message);
        }
    };
    let observer: ItemObserver = {
        let report = report.clone();
        Arc::new(move |item: &DownloadItem| report(format!("{} {}", item.status, item.url)))
    };

    let limiter = Arc::new(ctx.config().download_rate_limiter());
    let queue = super::download_queue(ctx, limiter, Some(observer));
    queue.start(ctx.config().concurrency)?;

    for entry in &entries {
        match queue.enqueue(&entry.url, entry.target_in(&output_dir)) {
            Ok(Some(_)) => {}
            Ok(None) => {
                debug!(url = %entry.url, "duplicate playlist entry");
                ctx.stats().incr(Counter::Skipped);
                report(format!("duplicate {}", entry.url));
            }
            Err(QueueError::Closed) => break,
            Err(error) => return Err(error.into()),
        }
    }

    let summary = queue.finish().await?;
    info!(
        done = summary.done,
        failed = summary.failed,
        skipped = summary.skipped,
        cancelled = summary.cancelled,
        "playlist downloads finished"
    );
    ctx.check_cancelled()
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_static_playlist_splits_on_whitespace() {
        let entries = StaticPlaylist
            .entries("https://a.test/1.pdf\n  https://a.test/2.pdf https://a.test/1.pdf")
            .await
            .unwrap();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[1].url, "https://a.test/2.pdf");
    }

    #[test]
    fn test_file_name_prefers_title_and_keeps_extension() {
        let mut entry = PlaylistEntry::new("https://a.test/v/123.mp4?x=1");
        assert_eq!(entry.file_name(), "123.mp4");

        entry.title = Some("Episode 1: Intro".to_string());
        assert_eq!(entry.file_name(), "Episode 1_ Intro.mp4");

        entry.title = Some("clip.MP4".to_string());
        assert_eq!(entry.file_name(), "clip.MP4");

        entry.title = Some("   ".to_string());
        assert_eq!(entry.file_name(), "123.mp4");
    }
}
