//! Target path derivation and collision handling for downloaded files.

use std::path::{Component, Path, PathBuf};

use sha2::{Digest, Sha256};
use url::Url;

/// Name used when a URL has no usable last path segment.
const FALLBACK_STEM: &str = "download";

/// Upper bound on `_N` suffixes tried before falling back to a timestamp.
const MAX_NUMERIC_SUFFIX: usize = 1000;

/// Bytes of the URL digest appended by [`disambiguated_target_path`].
const URL_DIGEST_BYTES: usize = 4;

/// Replaces characters that are invalid on common filesystems.
///
/// `/ \ : * ? " < > |` and control characters become `_`. Names that would
/// resolve to `.` or `..` have their dots replaced too.
#[must_use]
pub fn sanitize_filename(name: &str) -> String {
    let sanitized: String = name
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();

    if sanitized.is_empty() {
        return "_".to_string();
    }

    if is_safe_filename_segment(&sanitized) {
        sanitized
    } else {
        sanitized.replace('.', "_")
    }
}

fn is_safe_filename_segment(name: &str) -> bool {
    !Path::new(name).components().any(|component| {
        matches!(
            component,
            Component::CurDir | Component::ParentDir | Component::RootDir | Component::Prefix(_)
        )
    })
}

/// Filename for a URL: its decoded last path segment, sanitized.
///
/// ```
/// use harvester_core::download::filename_from_url;
///
/// assert_eq!(filename_from_url("https://a.test/docs/My%20Paper.pdf"), "My Paper.pdf");
/// assert_eq!(filename_from_url("https://a.test/"), "download.bin");
/// ```
#[must_use]
pub fn filename_from_url(url: &str) -> String {
    let Ok(parsed) = Url::parse(url) else {
        return format!("{FALLBACK_STEM}.bin");
    };
    parsed
        .path_segments()
        .and_then(|mut segments| segments.next_back())
        .filter(|last| !last.is_empty())
        .map(|last| {
            let decoded = urlencoding::decode(last)
                .map_or_else(|_| last.to_string(), std::borrow::Cow::into_owned);
            sanitize_filename(&decoded)
        })
        .filter(|name| !name.trim_matches('_').is_empty())
        .unwrap_or_else(|| format!("{FALLBACK_STEM}.bin"))
}

/// Target path for a URL inside `dir`. Does not touch the filesystem.
#[must_use]
pub fn target_path_for(dir: &Path, url: &str) -> PathBuf {
    dir.join(filename_from_url(url))
}

/// Lower-cased extension of the URL path, without the dot.
#[must_use]
pub fn url_extension(url: &str) -> Option<String> {
    let parsed = Url::parse(url).ok()?;
    let last = parsed.path_segments()?.next_back()?;
    let (_, ext) = last.rsplit_once('.')?;
    (!ext.is_empty()).then(|| ext.to_ascii_lowercase())
}

/// First path in `file`, `file_1`, `file_2`, ... that does not exist yet.
#[must_use]
pub fn resolve_unique_path(path: &Path) -> PathBuf {
    unique_path_by(path, Path::exists)
}

/// First path in `file`, `file_1`, `file_2`, ... for which `taken` is false.
pub(crate) fn unique_path_by(path: &Path, taken: impl Fn(&Path) -> bool) -> PathBuf {
    if !taken(path) {
        return path.to_path_buf();
    }

    let dir = path.parent().unwrap_or_else(|| Path::new(""));
    let filename = path
        .file_name()
        .map_or_else(|| FALLBACK_STEM.to_string(), |n| n.to_string_lossy().into_owned());
    let (stem, ext) = split_extension(&filename);

    for i in 1..MAX_NUMERIC_SUFFIX {
        let candidate = dir.join(format!("{stem}_{i}{ext}"));
        if !taken(&candidate) {
            return candidate;
        }
    }

    let timestamp = chrono::Utc::now().timestamp();
    dir.join(format!("{stem}_{timestamp}{ext}"))
}

/// Target path for a URL whose plain name is already used by another URL:
/// the name gets a short digest of the full URL, so it is stable per URL.
///
/// ```
/// use std::path::Path;
/// use harvester_core::download::disambiguated_target_path;
///
/// let a = disambiguated_target_path(Path::new("out"), "https://s.test/a/report.pdf");
/// let b = disambiguated_target_path(Path::new("out"), "https://s.test/b/report.pdf");
/// assert_ne!(a, b);
/// assert!(a.to_string_lossy().ends_with(".pdf"));
/// ```
#[must_use]
pub fn disambiguated_target_path(dir: &Path, url: &str) -> PathBuf {
    let filename = filename_from_url(url);
    let (stem, ext) = split_extension(&filename);
    let digest = Sha256::digest(url.as_bytes());
    let suffix: String = digest[..URL_DIGEST_BYTES]
        .iter()
        .map(|byte| format!("{byte:02x}"))
        .collect();
    dir.join(format!("{stem}_{suffix}{ext}"))
}

fn split_extension(filename: &str) -> (&str, &str) {
    match filename.rfind('.') {
        Some(pos) if pos > 0 => (&filename[..pos], &filename[pos..]),
        _ => (filename, ""),
    }
}
