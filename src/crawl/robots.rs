//! robots.txt fetching and evaluation for polite crawling.
//!
//! Only the `User-agent: *` group is honored. `Allow` and `Disallow` are
//! prefix rules; the longest matching rule wins and `Allow` wins ties.
//! `Crawl-delay` (seconds, fractional allowed) is surfaced so the frontier can
//! widen the per-domain politeness gap.
//!
//! Each origin is fetched at most once per cache, even when several fetches
//! for that origin race: the first caller fetches, the rest wait for it.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::OnceCell;
use tracing::{debug, instrument, warn};
use url::Url;

use super::PageFetcher;
use crate::download::{DownloadError, MAX_SERVER_DELAY};

/// Errors from robots.txt evaluation.
#[derive(Debug, Error)]
pub enum RobotsError {
    #[error("invalid URL for robots.txt lookup: {0}")]
    InvalidUrl(String),
}

/// Result of checking a URL against robots.txt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RobotsDecision {
    Allowed,
    Disallowed,
}

/// Parsed rules of one origin's robots.txt.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RobotsRules {
    allow: Vec<String>,
    disallow: Vec<String>,
    crawl_delay: Option<Duration>,
}

impl RobotsRules {
    /// Rules that allow everything (missing or unreadable robots.txt).
    #[must_use]
    pub fn allow_all() -> Self {
        Self::default()
    }

    /// Parses a robots.txt body.
    #[must_use]
    pub fn parse(body: &str) -> Self {
        let mut rules = Self::default();
        let mut in_star = false;
        // Consecutive User-agent lines form one group.
        let mut previous_was_agent = false;

        for raw in body.lines() {
            let line = raw.split('#').next().unwrap_or_default().trim();
            let Some((key, value)) = line.split_once(':') else {
                continue;
            };
            let key = key.trim().to_ascii_lowercase();
            let value = value.trim();

            if key == "user-agent" {
                let star = value == "*";
                in_star = if previous_was_agent { in_star || star } else { star };
                previous_was_agent = true;
                continue;
            }
            previous_was_agent = false;
            if !in_star {
                continue;
            }

            match key.as_str() {
                "disallow" if !value.is_empty() => push_unique(&mut rules.disallow, value),
                "allow" if !value.is_empty() => push_unique(&mut rules.allow, value),
                "crawl-delay" => {
                    if let Ok(seconds) = value.parse::<f64>()
                        && seconds.is_finite()
                        && seconds >= 0.0
                    {
                        rules.crawl_delay =
                            Some(Duration::from_secs_f64(seconds).min(MAX_SERVER_DELAY));
                    }
                }
                _ => {}
            }
        }
        rules
    }

    #[must_use]
    pub fn crawl_delay(&self) -> Option<Duration> {
        self.crawl_delay
    }

    /// Evaluates a URL path (with query) against the rules.
    #[must_use]
    pub fn decide(&self, path: &str) -> RobotsDecision {
        let longest = |prefixes: &[String]| {
            prefixes
                .iter()
                .filter(|prefix| path.starts_with(prefix.as_str()))
                .map(String::len)
                .max()
        };
        match (longest(&self.allow), longest(&self.disallow)) {
            (_, None) => RobotsDecision::Allowed,
            (Some(allow), Some(disallow)) if allow >= disallow => RobotsDecision::Allowed,
            _ => RobotsDecision::Disallowed,
        }
    }
}

fn push_unique(target: &mut Vec<String>, path: &str) {
    let mut prefix = path.to_string();
    if !prefix.starts_with('/') {
        prefix.insert(0, '/');
    }
    if !target.contains(&prefix) {
        target.push(prefix);
    }
}

/// Per-origin robots.txt cache, scoped to one crawl session.
#[derive(Debug, Default)]
pub struct RobotsCache {
    origins: DashMap<String, Arc<OnceCell<Arc<RobotsRules>>>>,
}

impl RobotsCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of origins whose robots.txt has been resolved.
    #[must_use]
    pub fn len(&self) -> usize {
        self.origins
            .iter()
            .filter(|entry| entry.value().initialized())
            .count()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Rules for the origin of `url`, fetching robots.txt on first use.
    ///
    /// A robots.txt that cannot be fetched (404, server error, network
    /// failure) allows everything.
    ///
    /// # Errors
    ///
    /// Returns [`RobotsError::InvalidUrl`] if `url` has no http(s) origin.
    #[instrument(skip(self, fetcher))]
    pub async fn rules_for(
        &self,
        url: &str,
        fetcher: &dyn PageFetcher,
    ) -> Result<Arc<RobotsRules>, RobotsError> {
        let origin =
            origin_for_robots(url).ok_or_else(|| RobotsError::InvalidUrl(url.to_string()))?;
        let cell = self
            .origins
            .entry(origin.clone())
            .or_insert_with(|| Arc::new(OnceCell::new()))
            .clone();

        let rules = cell
            .get_or_init(|| async {
                let robots_url = format!("{origin}/robots.txt");
                Arc::new(fetch_rules(&robots_url, fetcher).await)
            })
            .await;
        Ok(Arc::clone(rules))
    }

    /// Checks `url` against its origin's robots.txt.
    ///
    /// # Errors
    ///
    /// Same as [`rules_for`](Self::rules_for).
    pub async fn check_allowed(
        &self,
        url: &str,
        fetcher: &dyn PageFetcher,
    ) -> Result<RobotsDecision, RobotsError> {
        let rules = self.rules_for(url, fetcher).await?;
        let parsed = Url::parse(url).map_err(|_| RobotsError::InvalidUrl(url.to_string()))?;
        let mut path = parsed.path().to_string();
        if let Some(query) = parsed.query() {
            path.push('?');
            path.push_str(query);
        }
        let decision = rules.decide(&path);
        if decision == RobotsDecision::Disallowed {
            debug!(path = %path, "robots.txt disallows path");
        }
        Ok(decision)
    }
}

async fn fetch_rules(robots_url: &str, fetcher: &dyn PageFetcher) -> RobotsRules {
    match fetcher.fetch(robots_url).await {
        Ok(page) => {
            let rules = RobotsRules::parse(&page.body);
            debug!(
                robots_url,
                disallow = rules.disallow.len(),
                crawl_delay_ms = rules.crawl_delay.map(|d| d.as_millis()),
                "robots.txt loaded"
            );
            rules
        }
        Err(DownloadError::HttpStatus { status, .. }) if (400..500).contains(&status) => {
            debug!(robots_url, status, "no robots.txt, allowing all");
            RobotsRules::allow_all()
        }
        Err(error) => {
            warn!(robots_url, error = %error, "robots.txt unavailable, allowing all");
            RobotsRules::allow_all()
        }
    }
}

/// Scheme, host and explicit port of `url`, e.g. `https://example.com:8443`.
#[must_use]
pub fn origin_for_robots(url: &str) -> Option<String> {
    let parsed = Url::parse(url).ok()?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return None;
    }
    let host = parsed.host_str()?;
    Some(match parsed.port() {
        Some(port) => format!("{}://{host}:{port}", parsed.scheme()),
        None => format!("{}://{host}", parsed.scheme()),
    })
}
