//! Directory processing: walk a tree and hand each file to a processor.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tracing::{debug, info, instrument, warn};
use walkdir::WalkDir;

use super::error::TaskError;
use super::registry::{ProcessingParams, TaskContext};
use super::{metric, percent};
use crate::stats::Counter;

/// Structured result of processing one document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessedDocument {
    pub path: PathBuf,
    pub bytes: u64,
    /// Hex SHA-256 of the content, when the processor computes one.
    pub digest: Option<String>,
}

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("unsupported document: {}", .0.display())]
    Unsupported(PathBuf),

    #[error("failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("processing {} failed: {message}", path.display())]
    Failed { path: PathBuf, message: String },
}

/// Extracts something useful from one document (text, tables, metadata).
#[async_trait]
pub trait DocumentProcessor: Send + Sync {
    /// Whether this processor handles `path` at all. Unsupported files are skipped.
    fn supports(&self, path: &Path) -> bool;

    async fn process(&self, path: &Path) -> Result<ProcessedDocument, ProcessError>;
}

/// Default processor: size and SHA-256 digest of any file.
#[derive(Debug, Default, Clone, Copy)]
pub struct DigestProcessor;

impl DigestProcessor {
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl DocumentProcessor for DigestProcessor {
    fn supports(&self, _path: &Path) -> bool {
        true
    }

    async fn process(&self, path: &Path) -> Result<ProcessedDocument, ProcessError> {
        let io = |source| ProcessError::Io {
            path: path.to_path_buf(),
            source,
        };
        let mut file = tokio::fs::File::open(path).await.map_err(io)?;
        let mut hasher = Sha256::new();
        let mut buffer = vec![0_u8; 64 * 1024];
        let mut bytes: u64 = 0;
        loop {
            let read = file.read(&mut buffer).await.map_err(io)?;
            if read == 0 {
                break;
            }
            hasher.update(&buffer[..read]);
            bytes += read as u64;
        }
        Ok(ProcessedDocument {
            path: path.to_path_buf(),
            bytes,
            digest: Some(format!("{:x}", hasher.finalize())),
        })
    }
}

fn extension_of(path: &Path) -> Option<String> {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(str::to_ascii_lowercase)
}

/// Regular files under `root`, sorted for a stable processing order.
fn collect_files(root: &Path) -> (Vec<PathBuf>, u64) {
    let mut files = Vec::new();
    let mut walk_errors = 0;
    for entry in WalkDir::new(root).follow_links(false) {
        match entry {
            Ok(entry) if entry.file_type().is_file() => files.push(entry.into_path()),
            Ok(_) => {}
            Err(error) => {
                warn!(error = %error, "unreadable directory entry");
                walk_errors += 1;
            }
        }
    }
    files.sort();
    (files, walk_errors)
}

#[instrument(skip(ctx, params), fields(task_id = %ctx.id(), root = %params.root.display()))]
pub(super) async fn run(ctx: &TaskContext, params: ProcessingParams) -> Result<(), TaskError> {
    let root = params.root.clone();
    if !tokio::fs::metadata(&root).await?.is_dir() {
        return Err(TaskError::InvalidParams(format!(
            "not a directory: {}",
            root.display()
        )));
    }

    let (files, walk_errors) = tokio::task::spawn_blocking(move || collect_files(&root))
        .await
        .map_err(|e| TaskError::Panicked(e.to_string()))?;
    let stats = ctx.stats();
    stats.increment(Counter::Errors, walk_errors);

    let total = files.len();
    stats.set_extra("files_total", metric(total));
    info!(files = total, "processing started");

    let extensions: Vec<String> = params
        .extensions
        .iter()
        .map(|ext| ext.trim_start_matches('.').to_ascii_lowercase())
        .collect();
    let processor = &ctx.collaborators().processor;

    for (index, path) in files.iter().enumerate() {
        ctx.check_cancelled()?;

        let wanted = extensions.is_empty()
            || extension_of(path).is_some_and(|ext| extensions.contains(&ext));
        let name = path
            .file_name()
            .map_or_else(String::new, |n| n.to_string_lossy().into_owned());

        if !wanted || !processor.supports(path) {
            debug!(path = %path.display(), "skipping unsupported file");
            stats.incr(Counter::Skipped);
        } else {
            let result = tokio::select! {
                () = ctx.token().cancelled() => return Err(TaskError::Cancelled),
                result = processor.process(path) => result,
            };
            match result {
                Ok(document) => {
                    debug!(path = %path.display(), bytes = document.bytes, "document processed");
                    stats.incr(Counter::Processed);
                }
                Err(ProcessError::Unsupported(_)) => {
                    stats.incr(Counter::Skipped);
                }
                Err(error) => {
                    warn!(error = %error, "document processing failed");
                    stats.incr(Counter::Errors);
                }
            }
        }

        ctx.report_progress(percent(index + 1, total), format!("processed {name}"));
    }
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    #[tokio::test]
    async fn test_digest_processor_hashes_content() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.txt");
        std::fs::write(&path, b"abc").unwrap();

        let document = DigestProcessor::new().process(&path).await.unwrap();
        assert_eq!(document.bytes, 3);
        assert_eq!(
            document.digest.as_deref(),
            Some("ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad")
        );
    }

    #[tokio::test]
    async fn test_digest_processor_missing_file_is_io_error() {
        let dir = TempDir::new().unwrap();
        let error = DigestProcessor::new()
            .process(&dir.path().join("missing"))
            .await
            .unwrap_err();
        assert!(matches!(error, ProcessError::Io { .. }));
    }

    #[test]
    fn test_collect_files_recurses_and_sorts() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("b.pdf"), b"b").unwrap();
        std::fs::write(dir.path().join("sub").join("a.pdf"), b"a").unwrap();

        let (files, errors) = collect_files(dir.path());
        assert_eq!(errors, 0);
        assert_eq!(files.len(), 2);
        assert!(files[0].ends_with("b.pdf"));
        assert!(files[1].ends_with("sub/a.pdf"));
    }

    #[test]
    fn test_extension_of_is_lowercase() {
        assert_eq!(extension_of(Path::new("x/Report.PDF")).as_deref(), Some("pdf"));
        assert_eq!(extension_of(Path::new("x/README")), None);
    }
}
