/// Configuration management for Timeline Service
///
/// Loads configuration from environment variables.
use anyhow::{Context, Result};
use resilience::RetryConfig;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;

use crate::error::TimelineError;

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Application settings
    pub app: AppConfig,
    /// Feed generation policy
    pub timeline: TimelineConfig,
}

/// Application settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Application environment (dev, staging, prod)
    pub env: String,
    /// Default tracing filter when RUST_LOG is unset
    pub log_level: String,
    /// Emit JSON logs instead of human-readable lines
    pub log_json: bool,
}

/// Feed generation policy parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimelineConfig {
    /// Max entries kept in one user's feed cache (N)
    #[serde(default = "default_feed_capacity")]
    pub feed_capacity: usize,
    /// Follower count at which an author switches to pull mode (T)
    #[serde(default = "default_fanout_threshold")]
    pub fanout_threshold: usize,
    /// Posts copied into a follower's cache on follow (M)
    #[serde(default = "default_backfill_limit")]
    pub backfill_limit: usize,
    #[serde(default = "default_page_size")]
    pub default_page_size: usize,
    #[serde(default = "default_max_page_size")]
    pub max_page_size: usize,
    /// Per-author recency index depth in the content store
    #[serde(default = "default_author_index_capacity")]
    pub author_index_capacity: usize,
    /// Max concurrent per-follower inserts across all fan-out batches
    #[serde(default = "default_fanout_workers")]
    pub fanout_workers: usize,
    #[serde(default = "default_fanout_max_retries")]
    pub fanout_max_retries: u32,
    #[serde(default = "default_fanout_initial_backoff_ms")]
    pub fanout_initial_backoff_ms: u64,
    /// Deadline for one pull-mode author fetch during a read
    #[serde(default = "default_pull_timeout_ms")]
    pub pull_timeout_ms: u64,
}

// Default values
fn default_feed_capacity() -> usize {
    500
}

fn default_fanout_threshold() -> usize {
    10_000
}

fn default_backfill_limit() -> usize {
    20
}

fn default_page_size() -> usize {
    20
}

fn default_max_page_size() -> usize {
    100
}

fn default_author_index_capacity() -> usize {
    1_000
}

fn default_fanout_workers() -> usize {
    64
}

fn default_fanout_max_retries() -> u32 {
    3
}

fn default_fanout_initial_backoff_ms() -> u64 {
    50
}

fn default_pull_timeout_ms() -> u64 {
    500
}

impl Default for TimelineConfig {
    fn default() -> Self {
        Self {
            feed_capacity: default_feed_capacity(),
            fanout_threshold: default_fanout_threshold(),
            backfill_limit: default_backfill_limit(),
            default_page_size: default_page_size(),
            max_page_size: default_max_page_size(),
            author_index_capacity: default_author_index_capacity(),
            fanout_workers: default_fanout_workers(),
            fanout_max_retries: default_fanout_max_retries(),
            fanout_initial_backoff_ms: default_fanout_initial_backoff_ms(),
            pull_timeout_ms: default_pull_timeout_ms(),
        }
    }
}

impl TimelineConfig {
    /// Retry policy applied to per-follower inserts, backfills and purges.
    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_retries: self.fanout_max_retries,
            initial_backoff: Duration::from_millis(self.fanout_initial_backoff_ms),
            ..Default::default()
        }
    }

    pub fn pull_timeout(&self) -> Duration {
        Duration::from_millis(self.pull_timeout_ms)
    }

    pub fn validate(&self) -> std::result::Result<(), TimelineError> {
        let non_zero = [
            ("feed_capacity", self.feed_capacity),
            ("default_page_size", self.default_page_size),
            ("max_page_size", self.max_page_size),
            ("author_index_capacity", self.author_index_capacity),
            ("fanout_workers", self.fanout_workers),
        ];
        for (field, value) in non_zero {
            if value == 0 {
                return Err(TimelineError::Config(format!("{} must be > 0", field)));
            }
        }

        if self.default_page_size > self.max_page_size {
            return Err(TimelineError::Config(format!(
                "default_page_size ({}) exceeds max_page_size ({})",
                self.default_page_size, self.max_page_size
            )));
        }

        // Backfill and pull reads are served from the per-author index.
        // A page read asks it for one extra post to detect `has_more`.
        if self.backfill_limit > self.author_index_capacity {
            return Err(TimelineError::Config(format!(
                "backfill_limit ({}) exceeds author_index_capacity ({})",
                self.backfill_limit, self.author_index_capacity
            )));
        }
        if self.max_page_size >= self.author_index_capacity {
            return Err(TimelineError::Config(format!(
                "max_page_size ({}) must be below author_index_capacity ({})",
                self.max_page_size, self.author_index_capacity
            )));
        }

        Ok(())
    }
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build configuration from an arbitrary key lookup (env, test maps, ...)
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let app = AppConfig {
            env: lookup("APP_ENV").unwrap_or_else(|| "development".to_string()),
            log_level: lookup("LOG_LEVEL").unwrap_or_else(|| "info".to_string()),
            log_json: parse_or(&lookup, "LOG_FORMAT_JSON", false)?,
        };

        let timeline = TimelineConfig {
            feed_capacity: parse_or(&lookup, "FEED_CAPACITY", default_feed_capacity())?,
            fanout_threshold: parse_or(&lookup, "FANOUT_THRESHOLD", default_fanout_threshold())?,
            backfill_limit: parse_or(&lookup, "BACKFILL_LIMIT", default_backfill_limit())?,
            default_page_size: parse_or(&lookup, "DEFAULT_PAGE_SIZE", default_page_size())?,
            max_page_size: parse_or(&lookup, "MAX_PAGE_SIZE", default_max_page_size())?,
            author_index_capacity: parse_or(
                &lookup,
                "AUTHOR_INDEX_CAPACITY",
                default_author_index_capacity(),
            )?,
            fanout_workers: parse_or(&lookup, "FANOUT_WORKERS", default_fanout_workers())?,
            fanout_max_retries: parse_or(
                &lookup,
                "FANOUT_MAX_RETRIES",
                default_fanout_max_retries(),
            )?,
            fanout_initial_backoff_ms: parse_or(
                &lookup,
                "FANOUT_INITIAL_BACKOFF_MS",
                default_fanout_initial_backoff_ms(),
            )?,
            pull_timeout_ms: parse_or(&lookup, "PULL_TIMEOUT_MS", default_pull_timeout_ms())?,
        };

        timeline
            .validate()
            .context("Invalid timeline configuration")?;

        Ok(Config { app, timeline })
    }
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> Result<T>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("{} has an invalid value: {:?}", key, raw)),
        None => Ok(default),
    }
}
