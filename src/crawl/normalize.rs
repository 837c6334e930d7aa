//! URL normalization used as the crawl dedup key.

use url::Url;

/// Canonical form of an http(s) URL.
///
/// Scheme and host are lower-cased and default ports dropped (by `url`
/// parsing), the fragment is removed, and a trailing slash is stripped from
/// every path except the root. Returns `None` for unparseable or
/// non-http(s) URLs.
///
/// ```
/// use harvester_core::crawl::normalize_url;
///
/// assert_eq!(
///     normalize_url("HTTPS://Example.COM:443/docs/#intro").as_deref(),
///     Some("https://example.com/docs")
/// );
/// assert_eq!(normalize_url("mailto:a@b.c"), None);
/// ```
#[must_use]
pub fn normalize_url(raw: &str) -> Option<String> {
    let mut url = Url::parse(raw.trim()).ok()?;
    if !matches!(url.scheme(), "http" | "https") || url.host_str().is_none() {
        return None;
    }
    url.set_fragment(None);
    if url.query() == Some("") {
        url.set_query(None);
    }

    let path = url.path();
    if path.len() > 1 && path.ends_with('/') {
        let trimmed = path.trim_end_matches('/').to_string();
        url.set_path(if trimmed.is_empty() { "/" } else { &trimmed });
    }
    Some(url.into())
}

/// Resolves `href` against `base` and normalizes the result.
#[must_use]
pub fn resolve_and_normalize(base: &Url, href: &str) -> Option<String> {
    let joined = base.join(href.trim()).ok()?;
    normalize_url(joined.as_str())
}

/// Lower-cased host of a normalized URL.
#[must_use]
pub fn host_of(url: &str) -> Option<String> {
    Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(str::to_ascii_lowercase))
}

/// `true` if `host` is `domain` or one of its subdomains.
#[must_use]
pub fn host_matches(host: &str, domain: &str) -> bool {
    let domain = domain.trim().trim_start_matches("*.").to_ascii_lowercase();
    host == domain
        || host
            .strip_suffix(domain.as_str())
            .is_some_and(|prefix| prefix.ends_with('.'))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_lowercases_and_drops_default_port() {
        assert_eq!(
            normalize_url("HTTP://WWW.Example.com:80/A/b").as_deref(),
            Some("http://www.example.com/A/b")
        );
    }

    #[test]
    fn test_normalize_strips_fragment_and_trailing_slash() {
        assert_eq!(
            normalize_url("https://a.test/docs/?x=1#top").as_deref(),
            Some("https://a.test/docs?x=1")
        );
        assert_eq!(
            normalize_url("https://a.test/docs///").as_deref(),
            Some("https://a.test/docs")
        );
        assert_eq!(normalize_url("https://a.test/").as_deref(), Some("https://a.test/"));
        assert_eq!(normalize_url("https://a.test").as_deref(), Some("https://a.test/"));
    }

    #[test]
    fn test_normalize_rejects_non_http() {
        assert_eq!(normalize_url("ftp://a.test/file"), None);
        assert_eq!(normalize_url("javascript:void(0)"), None);
        assert_eq!(normalize_url("not a url"), None);
    }

    #[test]
    fn test_normalize_keeps_port_when_not_default() {
        assert_eq!(
            normalize_url("http://127.0.0.1:8080/a/").as_deref(),
            Some("http://127.0.0.1:8080/a")
        );
    }

    #[test]
    fn test_resolve_relative_href() {
        let base = Url::parse("https://a.test/dir/page.html").unwrap();
        assert_eq!(
            resolve_and_normalize(&base, "../x.pdf#p2").as_deref(),
            Some("https://a.test/x.pdf")
        );
        assert_eq!(
            resolve_and_normalize(&base, "sub/").as_deref(),
            Some("https://a.test/dir/sub")
        );
    }

    #[test]
    fn test_host_matches_subdomains_only_on_label_boundary() {
        assert!(host_matches("example.com", "example.com"));
        assert!(host_matches("docs.example.com", "example.com"));
        assert!(host_matches("docs.example.com", "*.example.com"));
        assert!(!host_matches("badexample.com", "example.com"));
        assert!(!host_matches("example.org", "example.com"));
    }
}
