//! Engine configuration loaded from TOML.
//!
//! Every field has a default, so a partial (or missing) file is valid. Values
//! are range-checked by [`EngineConfig::validate`] before use.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

use crate::crawl::CrawlOptions;
use crate::download::{
    CONNECT_TIMEOUT, Concurrency, DEFAULT_MAX_RETRIES, ExistingFilePolicy, READ_TIMEOUT,
    RateLimiter, RetryPolicy,
};
use crate::events::DEFAULT_COALESCE_WINDOW;

const MAX_RATE_LIMIT_MS: u64 = 60_000;
const MAX_RETRIES_LIMIT: u32 = 10;
const TIMEOUT_RANGE_SECS: std::ops::RangeInclusive<u64> = 1..=3600;

/// Errors from loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid config value for `{field}`: {value}. Expected {expected}")]
    Invalid {
        field: &'static str,
        value: String,
        expected: &'static str,
    },
}

impl ConfigError {
    fn invalid(field: &'static str, value: impl ToString, expected: &'static str) -> Self {
        Self::Invalid {
            field,
            value: value.to_string(),
            expected,
        }
    }
}

/// Engine-wide settings shared by every task a registry runs.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    /// Download pool width: a number in `1..=100` or `"unlimited"`.
    pub concurrency: Concurrency,
    pub max_retries: u32,
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    /// Adds up to 500 ms of random delay to each backoff.
    pub retry_jitter: bool,
    /// Minimum gap between downloads from one domain; 0 disables spacing.
    pub rate_limit_ms: u64,
    pub crawl: CrawlOptions,
    /// Progress events closer together than this are coalesced.
    pub progress_window_ms: u64,
    /// Terminal tasks are evicted after this many seconds; unset keeps them.
    pub retention_secs: Option<u64>,
    pub existing_files: ExistingFilePolicy,
    pub connect_timeout_secs: u64,
    pub read_timeout_secs: u64,
    pub output_dir: PathBuf,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            concurrency: Concurrency::default(),
            max_retries: DEFAULT_MAX_RETRIES,
            retry_base_delay_ms: 1000,
            retry_max_delay_ms: 32_000,
            retry_jitter: true,
            rate_limit_ms: 1000,
            crawl: CrawlOptions::default(),
            progress_window_ms: duration_ms(DEFAULT_COALESCE_WINDOW),
            retention_secs: None,
            existing_files: ExistingFilePolicy::default(),
            connect_timeout_secs: CONNECT_TIMEOUT.as_secs(),
            read_timeout_secs: READ_TIMEOUT.as_secs(),
            output_dir: PathBuf::from("downloads"),
        }
    }
}

#[allow(clippy::cast_possible_truncation)]
fn duration_ms(duration: Duration) -> u64 {
    duration.as_millis() as u64
}

impl EngineConfig {
    /// Reads and validates a TOML config file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the file cannot be read, parsed or validated.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_toml_str(&raw).map_err(|error| match error {
            ConfigError::Parse { source, .. } => ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            },
            other => other,
        })?;
        debug!(path = %path.display(), "config loaded");
        Ok(config)
    }

    /// Parses and validates TOML text.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] or [`ConfigError::Invalid`].
    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(raw).map_err(|source| ConfigError::Parse {
            path: PathBuf::new(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Loads the config at [`default_config_path`], or defaults when there is none.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if a file exists but is unreadable or invalid.
    pub fn load_default() -> Result<Self, ConfigError> {
        match default_config_path() {
            Some(path) if path.exists() => Self::from_file(&path),
            _ => Ok(Self::default()),
        }
    }

    /// Checks every value against its allowed range.
    ///
    /// # Errors
    ///
    /// Returns the first [`ConfigError::Invalid`] found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.concurrency
            .permits()
            .map_err(|_| ConfigError::invalid("concurrency", self.concurrency, "1..=100 or \"unlimited\""))?;
        if self.max_retries > MAX_RETRIES_LIMIT {
            return Err(ConfigError::invalid("max_retries", self.max_retries, "0..=10"));
        }
        if self.rate_limit_ms > MAX_RATE_LIMIT_MS {
            return Err(ConfigError::invalid("rate_limit_ms", self.rate_limit_ms, "0..=60000"));
        }
        if self.crawl.crawl_delay_ms > MAX_RATE_LIMIT_MS {
            return Err(ConfigError::invalid(
                "crawl.crawl_delay_ms",
                self.crawl.crawl_delay_ms,
                "0..=60000",
            ));
        }
        if self.retry_max_delay_ms < self.retry_base_delay_ms {
            return Err(ConfigError::invalid(
                "retry_max_delay_ms",
                self.retry_max_delay_ms,
                "a value >= retry_base_delay_ms",
            ));
        }
        if self.crawl.fetch_concurrency == 0 {
            return Err(ConfigError::invalid("crawl.fetch_concurrency", 0, "1 or more"));
        }
        for (field, value) in [
            ("connect_timeout_secs", self.connect_timeout_secs),
            ("read_timeout_secs", self.read_timeout_secs),
        ] {
            if !TIMEOUT_RANGE_SECS.contains(&value) {
                return Err(ConfigError::invalid(field, value, "1..=3600"));
            }
        }
        Ok(())
    }

    #[must_use]
    pub fn retry_policy(&self) -> RetryPolicy {
        let policy = RetryPolicy::new(
            self.max_retries,
            Duration::from_millis(self.retry_base_delay_ms),
            Duration::from_millis(self.retry_max_delay_ms),
            2.0,
        );
        if self.retry_jitter {
            policy
        } else {
            policy.without_jitter()
        }
    }

    /// Per-domain limiter for downloads.
    #[must_use]
    pub fn download_rate_limiter(&self) -> RateLimiter {
        if self.rate_limit_ms == 0 {
            RateLimiter::disabled()
        } else {
            RateLimiter::new(Duration::from_millis(self.rate_limit_ms))
        }
    }

    #[must_use]
    pub fn progress_window(&self) -> Duration {
        Duration::from_millis(self.progress_window_ms)
    }

    #[must_use]
    pub fn retention(&self) -> Option<Duration> {
        self.retention_secs.map(Duration::from_secs)
    }

    #[must_use]
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    #[must_use]
    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }
}

/// Default config location.
///
/// Priority:
/// 1. `$XDG_CONFIG_HOME/harvester/config.toml`
/// 2. `$HOME/.config/harvester/config.toml`
#[must_use]
pub fn default_config_path() -> Option<PathBuf> {
    if let Some(xdg_config_home) = env_var_non_empty_os("XDG_CONFIG_HOME") {
        return Some(
            PathBuf::from(xdg_config_home)
                .join("harvester")
                .join("config.toml"),
        );
    }

    let home = env_var_non_empty_os("HOME")?;
    Some(
        PathBuf::from(home)
            .join(".config")
            .join("harvester")
            .join("config.toml"),
    )
}

fn env_var_non_empty_os(name: &str) -> Option<std::ffi::OsString> {
    let value = env::var_os(name)?;
    if value.is_empty() { None } else { Some(value) }
}
