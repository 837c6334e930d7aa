//! Outbound link extraction from HTML pages.

use std::collections::HashSet;
use std::sync::OnceLock;

use scraper::{Html, Selector};
use url::Url;

use super::normalize::resolve_and_normalize;

const LINK_SELECTOR: &str = "a[href], area[href], iframe[src], embed[src]";

static SELECTOR: OnceLock<Option<Selector>> = OnceLock::new();

fn link_selector() -> Option<&'static Selector> {
    SELECTOR
        .get_or_init(|| Selector::parse(LINK_SELECTOR).ok())
        .as_ref()
}

/// Absolute, normalized http(s) links found in `html`, in document order
/// and without duplicates.
///
/// A `<base href>` element overrides `page_url` as the resolution base.
#[must_use]
pub fn extract_links(html: &str, page_url: &str) -> Vec<String> {
    let Ok(page) = Url::parse(page_url) else {
        return Vec::new();
    };
    let Some(selector) = link_selector() else {
        return Vec::new();
    };

    let document = Html::parse_document(html);
    let base = base_href(&document)
        .and_then(|href| page.join(&href).ok())
        .unwrap_or(page);

    let mut seen = HashSet::new();
    document
        .select(selector)
        .filter_map(|element| {
            let value = element.value();
            value.attr("href").or_else(|| value.attr("src"))
        })
        .filter_map(|href| resolve_and_normalize(&base, href))
        .filter(|link| seen.insert(link.clone()))
        .collect()
}

fn base_href(document: &Html) -> Option<String> {
    let selector = Selector::parse("base[href]").ok()?;
    document
        .select(&selector)
        .next()
        .and_then(|element| element.value().attr("href"))
        .map(ToString::to_string)
}
