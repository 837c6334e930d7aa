//! Per-host politeness schedule shared by a task's page fetches and downloads.
//!
//! Requests to one host are spaced by at least the default delay, widened by
//! a robots.txt `Crawl-delay` and pushed back by a server Retry-After.
//! Different hosts never wait on each other.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken as Signal;
use tracing::{debug, instrument};

use super::constants::MAX_SERVER_DELAY;

#[derive(Debug)]
pub struct RateLimiter {
    default_delay: Duration,
    disabled: bool,
    /// `Arc` values so the shard lock is released before awaiting a schedule.
    hosts: DashMap<String, Arc<Mutex<Schedule>>>,
}

#[derive(Debug, Default)]
struct Schedule {
    last_request: Option<Instant>,
    /// Crawl-delay for this host.
    delay_override: Option<Duration>,
    /// Retry-After deadline.
    blocked_until: Option<Instant>,
}

impl Schedule {
    fn next_slot(&self, default_delay: Duration) -> Option<Instant> {
        let gap = self.delay_override.unwrap_or(default_delay).max(default_delay);
        let by_gap = self.last_request.map(|last| last + gap);
        match (by_gap, self.blocked_until) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        }
    }
}

impl RateLimiter {
    #[must_use]
    pub fn new(default_delay: Duration) -> Self {
        Self {
            default_delay,
            disabled: false,
            hosts: DashMap::new(),
        }
    }

    /// Never waits; Retry-After and Crawl-delay are ignored too.
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            disabled: true,
            ..Self::new(Duration::ZERO)
        }
    }

    #[must_use]
    pub fn is_disabled(&self) -> bool {
        self.disabled
    }

    #[must_use]
    pub fn default_delay(&self) -> Duration {
        self.default_delay
    }

    fn schedule(&self, host: &str) -> Arc<Mutex<Schedule>> {
        Arc::clone(self.hosts.entry(host.to_string()).or_default().value())
    }

    /// Waits for the host's next slot and claims it.
    ///
    /// Returns `false` if `signal` fired first; the slot is then left unclaimed.
    #[instrument(skip(self, signal), fields(domain))]
    pub async fn acquire_until_cancelled(&self, url: &str, signal: &Signal) -> bool {
        if self.disabled {
            return !signal.is_cancelled();
        }

        let host = extract_domain(url);
        tracing::Span::current().record("domain", &host);
        let schedule = self.schedule(&host);

        // Held across the sleep so callers for one host go in order.
        let mut schedule = schedule.lock().await;
        if let Some(slot) = schedule.next_slot(self.default_delay)
            && slot > Instant::now()
        {
            debug!(delay_ms = (slot - Instant::now()).as_millis(), "politeness delay");
            tokio::select! {
                () = signal.cancelled() => return false,
                () = tokio::time::sleep_until(slot) => {}
            }
        }

        if signal.is_cancelled() {
            return false;
        }
        schedule.last_request = Some(Instant::now());
        true
    }

    /// Installs a robots.txt `Crawl-delay`. Never shorter than the default.
    pub async fn set_domain_delay(&self, domain: &str, delay: Duration) {
        if self.disabled {
            return;
        }
        let delay = delay.min(MAX_SERVER_DELAY);
        self.schedule(&domain.to_lowercase()).lock().await.delay_override = Some(delay);
        debug!(domain, delay_ms = delay.as_millis(), "crawl delay installed");
    }

    /// Blocks the URL's host for `delay` (Retry-After).
    pub async fn record_rate_limit(&self, url: &str, delay: Duration) {
        if self.disabled {
            return;
        }
        let host = extract_domain(url);
        let until = Instant::now() + delay.min(MAX_SERVER_DELAY);
        let schedule = self.schedule(&host);
        let mut schedule = schedule.lock().await;
        schedule.blocked_until = Some(schedule.blocked_until.map_or(until, |b| b.max(until)));
        debug!(domain = %host, delay_ms = delay.as_millis(), "server rate limit recorded");
    }
}

/// Lower-cased host of `url`, or `"unknown"`.
///
/// ```
/// use harvester_core::download::extract_domain;
///
/// assert_eq!(extract_domain("http://Example.COM/Path"), "example.com");
/// assert_eq!(extract_domain("not a url"), "unknown");
/// ```
#[must_use]
pub fn extract_domain(url: &str) -> String {
    url::Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(str::to_lowercase))
        .unwrap_or_else(|| "unknown".to_string())
}

/// Parses a Retry-After value: delta-seconds or an HTTP-date, capped at one
/// hour. Past dates give zero; negative or garbage values give `None`.
#[must_use]
pub fn parse_retry_after(header_value: &str) -> Option<Duration> {
    let header_value = header_value.trim();

    if let Ok(seconds) = header_value.parse::<i64>() {
        let seconds = u64::try_from(seconds).ok()?;
        return Some(Duration::from_secs(seconds).min(MAX_SERVER_DELAY));
    }

    let datetime = httpdate::parse_http_date(header_value).ok()?;
    Some(
        datetime
            .duration_since(std::time::SystemTime::now())
            .map_or(Duration::ZERO, |d| d.min(MAX_SERVER_DELAY)),
    )
}
