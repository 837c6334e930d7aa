//! Crawl frontier: traversal order, dedup, limits and politeness.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use dashmap::DashSet;
use futures_util::{StreamExt, stream};
use tokio_util::sync::CancellationToken as Signal;
use tracing::{debug, info, instrument, warn};
use url::Url;

use super::{
    CrawlOptions, CrawlStatus, CrawlUrl, CrawledPage, FetchError, FetchedPage, PageFetcher,
    RobotsCache, RobotsDecision, TraversalOrder, host_matches, host_of, normalize_url,
};
use crate::download::{
    FailureType, RateLimiter, RetryDecision, RetryPolicy, classify_error, parse_retry_after,
    url_extension,
};
use crate::stats::{Counter, StatsAggregator};

/// Configured crawler. Each [`start`](Self::start) opens an independent session.
pub struct CrawlFrontier {
    fetcher: Arc<dyn PageFetcher>,
    options: CrawlOptions,
    stats: Arc<StatsAggregator>,
    retry_policy: RetryPolicy,
    rate_limiter: Option<Arc<RateLimiter>>,
    signal: Signal,
}

impl std::fmt::Debug for CrawlFrontier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CrawlFrontier")
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl CrawlFrontier {
    pub fn new(fetcher: Arc<dyn PageFetcher>, options: CrawlOptions) -> Self {
        Self {
            fetcher,
            options,
            stats: Arc::new(StatsAggregator::new()),
            retry_policy: RetryPolicy::default(),
            rate_limiter: None,
            signal: Signal::new(),
        }
    }

    /// Counts pages, retries and errors into `stats`.
    #[must_use]
    pub fn with_stats(mut self, stats: Arc<StatsAggregator>) -> Self {
        self.stats = stats;
        self
    }

    #[must_use]
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    /// Shares a politeness limiter (e.g. with the task's download queue).
    ///
    /// Without one, each session gets its own limiter spaced by
    /// `crawl_delay_ms`.
    #[must_use]
    pub fn with_rate_limiter(mut self, limiter: Arc<RateLimiter>) -> Self {
        self.rate_limiter = Some(limiter);
        self
    }

    /// Stops sessions when `signal` fires. The in-flight fetch is abandoned.
    #[must_use]
    pub fn with_cancel_signal(mut self, signal: Signal) -> Self {
        self.signal = signal;
        self
    }

    #[must_use]
    pub fn options(&self) -> &CrawlOptions {
        &self.options
    }

    /// Opens a session rooted at `seed`.
    ///
    /// # Errors
    ///
    /// Returns [`FetchError::InvalidUrl`] if `seed` is not an http(s) URL.
    #[instrument(skip(self), fields(max_depth = self.options.max_depth))]
    pub fn start(&self, seed: &str) -> Result<CrawlSession, FetchError> {
        let invalid = || FetchError::InvalidUrl {
            url: seed.to_string(),
        };
        let seed_url = normalize_url(seed).ok_or_else(invalid)?;
        let seed_host = host_of(&seed_url).ok_or_else(invalid)?;

        let limiter = self
            .rate_limiter
            .clone()
            .unwrap_or_else(|| Arc::new(RateLimiter::new(self.options.crawl_delay())));

        info!(seed = %seed_url, "crawl session started");
        let mut session = CrawlSession {
            shared: Arc::new(Shared {
                fetcher: Arc::clone(&self.fetcher),
                options: self.options.clone(),
                stats: Arc::clone(&self.stats),
                retry_policy: self.retry_policy.clone(),
                limiter,
                robots: RobotsCache::new(),
                delay_applied: DashSet::new(),
                signal: self.signal.clone(),
                seed_host,
            }),
            frontier: VecDeque::new(),
            seen: HashSet::new(),
            visited: HashSet::new(),
            targets_seen: HashSet::new(),
            pages_per_domain: HashMap::new(),
            ready: VecDeque::new(),
        };
        session.seen.insert(seed_url.clone());
        session
            .frontier
            .push_back(CrawlUrl::queued(seed_url, 0, None));
        Ok(session)
    }
}

/// State shared by the concurrent fetches of one session.
struct Shared {
    fetcher: Arc<dyn PageFetcher>,
    options: CrawlOptions,
    stats: Arc<StatsAggregator>,
    retry_policy: RetryPolicy,
    limiter: Arc<RateLimiter>,
    robots: RobotsCache,
    /// Hosts whose robots `Crawl-delay` was already installed.
    delay_applied: DashSet<String>,
    signal: Signal,
    seed_host: String,
}

enum Fetched {
    Page(CrawlUrl, FetchedPage),
    Failed(CrawlUrl, FetchError),
    Cancelled(CrawlUrl),
}

impl Shared {
    fn in_scope(&self, url: &str) -> bool {
        let Some(host) = host_of(url) else {
            return false;
        };
        match &self.options.domain_allowlist {
            Some(allowed) => allowed.iter().any(|domain| host_matches(&host, domain)),
            None => host == self.seed_host,
        }
    }

    /// A downloadable document, judged by URL extension or content type.
    fn is_target(&self, url: &str, content_type: Option<&str>) -> bool {
        let extensions = &self.options.target_extensions;
        if url_extension(url).is_some_and(|ext| extensions.contains(&ext)) {
            return true;
        }
        content_type
            .and_then(|ct| ct.split(';').next())
            .and_then(|mime| mime.trim().rsplit('/').next())
            .is_some_and(|subtype| {
                let subtype = subtype.to_ascii_lowercase();
                subtype != "html" && extensions.contains(&subtype)
            })
    }

    /// Robots gate for one URL. Installs the origin's `Crawl-delay` on first sight.
    async fn robots_allows(&self, url: &str) -> Result<bool, FetchError> {
        let invalid = |_| FetchError::InvalidUrl {
            url: url.to_string(),
        };
        let rules = self
            .robots
            .rules_for(url, self.fetcher.as_ref())
            .await
            .map_err(invalid)?;

        if let Some(delay) = rules.crawl_delay()
            && let Some(host) = host_of(url)
            && self.delay_applied.insert(host.clone())
        {
            let effective = delay.max(self.options.crawl_delay());
            debug!(host = %host, delay_ms = effective.as_millis(), "applying robots crawl-delay");
            self.limiter.set_domain_delay(&host, effective).await;
        }

        let decision = self
            .robots
            .check_allowed(url, self.fetcher.as_ref())
            .await
            .map_err(invalid)?;
        Ok(decision == RobotsDecision::Allowed)
    }

    #[instrument(skip(self, entry), fields(url = %entry.url, depth = entry.depth))]
    async fn fetch_one(&self, mut entry: CrawlUrl) -> Fetched {
        if self.signal.is_cancelled() {
            return Fetched::Cancelled(entry);
        }
        entry.status = CrawlStatus::Fetching;

        if self.options.respect_robots {
            match self.robots_allows(&entry.url).await {
                Ok(true) => {}
                Ok(false) => {
                    let url = entry.url.clone();
                    return Fetched::Failed(entry, FetchError::RobotsDisallowed { url });
                }
                Err(error) => return Fetched::Failed(entry, error),
            }
        }

        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            if !self
                .limiter
                .acquire_until_cancelled(&entry.url, &self.signal)
                .await
            {
                return Fetched::Cancelled(entry);
            }

            let result = tokio::select! {
                () = self.signal.cancelled() => None,
                result = self.fetcher.fetch(&entry.url) => Some(result),
            };
            let Some(result) = result else {
                debug!("fetch abandoned by cancellation");
                return Fetched::Cancelled(entry);
            };

            let error = match result {
                Ok(page) => return Fetched::Page(entry, page),
                Err(error) => error,
            };

            let failure_type = classify_error(&error);
            match self.retry_policy.should_retry(failure_type, attempt) {
                RetryDecision::Retry { delay, .. } => {
                    let mut delay = delay;
                    if failure_type == FailureType::RateLimited
                        && let Some(server) = error.retry_after().and_then(parse_retry_after)
                    {
                        self.limiter.record_rate_limit(&entry.url, server).await;
                        delay = delay.max(server);
                    }
                    debug!(attempt, delay_ms = delay.as_millis(), error = %error, "retrying fetch");
                    self.stats.incr(Counter::Retries);
                    tokio::select! {
                        () = self.signal.cancelled() => return Fetched::Cancelled(entry),
                        () = tokio::time::sleep(delay) => {}
                    }
                }
                RetryDecision::DoNotRetry { .. } => {
                    return Fetched::Failed(entry, FetchError::Transfer(error));
                }
            }
        }
    }
}

/// One crawl: a lazy, session-scoped sequence of [`CrawledPage`]s.
///
/// Pages are fetched in batches of up to `fetch_concurrency` when the
/// previous batch has been handed out, so nothing is fetched ahead of demand
/// beyond one batch.
pub struct CrawlSession {
    shared: Arc<Shared>,
    frontier: VecDeque<CrawlUrl>,
    /// Queued or visited; a URL enters the frontier at most once.
    seen: HashSet<String>,
    /// Fetched (or being fetched), including redirect targets.
    visited: HashSet<String>,
    targets_seen: HashSet<String>,
    pages_per_domain: HashMap<String, usize>,
    ready: VecDeque<CrawledPage>,
}

impl std::fmt::Debug for CrawlSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CrawlSession")
            .field("pending", &self.frontier.len())
            .field("visited", &self.visited.len())
            .finish_non_exhaustive()
    }
}

impl CrawlSession {
    /// Next crawl step, or `None` when the frontier is exhausted or the
    /// session was cancelled.
    pub async fn next(&mut self) -> Option<CrawledPage> {
        loop {
            if let Some(page) = self.ready.pop_front() {
                return Some(page);
            }
            if self.shared.signal.is_cancelled() {
                debug!(pending = self.frontier.len(), "crawl session cancelled");
                return None;
            }

            let batch = self.take_batch();
            if batch.is_empty() {
                info!(visited = self.visited.len(), "crawl frontier exhausted");
                return None;
            }

            let width = batch.len();
            let shared = Arc::clone(&self.shared);
            let results: Vec<Fetched> = stream::iter(batch)
                .map(|entry| {
                    let shared = Arc::clone(&shared);
                    async move { shared.fetch_one(entry).await }
                })
                .buffer_unordered(width)
                .collect()
                .await;

            for fetched in results {
                self.absorb(fetched);
            }
        }
    }

    #[must_use]
    pub fn visited_count(&self) -> usize {
        self.visited.len()
    }

    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.frontier.len()
    }

    /// Whether `url` (normalized) was fetched or is being fetched.
    #[must_use]
    pub fn has_visited(&self, url: &str) -> bool {
        normalize_url(url).is_some_and(|url| self.visited.contains(&url))
    }

    fn take_batch(&mut self) -> Vec<CrawlUrl> {
        let options = &self.shared.options;
        let width = options.fetch_concurrency.max(1);
        let mut batch = Vec::with_capacity(width);

        while batch.len() < width {
            let next = match options.order {
                TraversalOrder::BreadthFirst => self.frontier.pop_front(),
                TraversalOrder::DepthFirst => self.frontier.pop_back(),
            };
            let Some(entry) = next else {
                break;
            };
            if self.visited.contains(&entry.url) {
                continue;
            }

            let host = host_of(&entry.url).unwrap_or_default();
            let fetched_here = self.pages_per_domain.entry(host).or_insert(0);
            if *fetched_here >= options.max_pages_per_domain {
                debug!(url = %entry.url, "per-domain page limit reached");
                continue;
            }
            *fetched_here += 1;

            self.visited.insert(entry.url.clone());
            batch.push(entry);
        }
        batch
    }

    fn absorb(&mut self, fetched: Fetched) {
        match fetched {
            Fetched::Cancelled(entry) => {
                self.visited.remove(&entry.url);
            }
            Fetched::Failed(mut entry, error) => {
                warn!(url = %entry.url, error = %error, "crawl fetch failed");
                entry.status = CrawlStatus::Failed;
                self.shared.stats.incr(Counter::Errors);
                self.ready.push_back(CrawledPage {
                    url: entry,
                    final_url: None,
                    content_type: None,
                    targets: Vec::new(),
                    deduped: false,
                    error: Some(error),
                });
            }
            Fetched::Page(entry, page) => self.absorb_page(entry, page),
        }
    }

    fn absorb_page(&mut self, mut entry: CrawlUrl, page: FetchedPage) {
        entry.status = CrawlStatus::Fetched;
        let final_url = normalize_url(&page.final_url).unwrap_or_else(|| entry.url.clone());

        if final_url != entry.url {
            if !self.visited.insert(final_url.clone()) {
                debug!(url = %entry.url, final_url = %final_url, "redirected to visited URL");
                self.ready.push_back(CrawledPage {
                    url: entry,
                    final_url: Some(final_url),
                    content_type: page.content_type,
                    targets: Vec::new(),
                    deduped: true,
                    error: None,
                });
                return;
            }
            self.seen.insert(final_url.clone());
        }
        self.shared.stats.incr(Counter::PagesCrawled);

        let mut targets = Vec::new();
        if self
            .shared
            .is_target(&final_url, page.content_type.as_deref())
            && self.targets_seen.insert(final_url.clone())
        {
            targets.push(final_url.clone());
        }

        let child_depth = entry.depth + 1;
        let base = Url::parse(&final_url).ok();
        let mut children = Vec::new();
        for link in &page.links {
            let normalized = match &base {
                Some(base) => super::resolve_and_normalize(base, link),
                None => normalize_url(link),
            };
            let Some(link) = normalized else {
                continue;
            };
            if self.shared.is_target(&link, None) {
                if self.targets_seen.insert(link.clone()) {
                    targets.push(link);
                }
                continue;
            }
            if child_depth > self.shared.options.max_depth
                || !self.shared.in_scope(&link)
                || self.seen.contains(&link)
            {
                continue;
            }
            self.seen.insert(link.clone());
            children.push(CrawlUrl::queued(link, child_depth, Some(final_url.clone())));
        }

        debug!(
            url = %final_url,
            children = children.len(),
            targets = targets.len(),
            "page absorbed"
        );
        match self.shared.options.order {
            TraversalOrder::BreadthFirst => self.frontier.extend(children),
            // Reversed so the first link on the page is explored first.
            TraversalOrder::DepthFirst => self.frontier.extend(children.into_iter().rev()),
        }

        self.ready.push_back(CrawledPage {
            url: entry,
            final_url: Some(final_url),
            content_type: page.content_type,
            targets,
            deduped: false,
            error: None,
        });
    }
}
