//! Configuration management for the report sync core

use std::env;
use std::time::Duration;

use serde::Deserialize;

use crate::optimistic::ConflictStrategy;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub api: ApiConfig,
    pub polling: PollingConfig,
    pub updates: UpdateConfig,
    pub cache: CacheConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    pub base_url: String,
    pub token: Option<String>,
    pub request_timeout: Duration,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PollingConfig {
    /// Time between scheduled polls
    pub interval: Duration,
    /// Poll when the host window regains focus
    pub refetch_on_focus: bool,
    /// Poll when the network comes back
    pub refetch_on_reconnect: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UpdateConfig {
    /// Retries after the first attempt of a single mutation
    pub max_retries: u32,
    /// Base delay for exponential backoff (`retry_delay * 2^attempt`)
    pub retry_delay: Duration,
    /// Ceiling on queue items in `processing` at once
    pub max_concurrent_updates: usize,
    /// Deadline for one queue item, engine retries included
    pub update_timeout: Duration,
    /// Times a failed queue item is put back to `pending` before it is terminal
    pub queue_retry_limit: u32,
    pub conflict_resolution: ConflictStrategy,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    /// Maximum number of report list pages to keep
    pub max_list_pages: usize,
}

impl Default for ApiConfig {
    fn default() -> Self {
        ApiConfig {
            base_url: "http://localhost:8000/api/v1".to_string(),
            token: None,
            request_timeout: Duration::from_secs(30),
        }
    }
}

impl Default for PollingConfig {
    fn default() -> Self {
        PollingConfig {
            interval: Duration::from_secs(30),
            refetch_on_focus: true,
            refetch_on_reconnect: true,
        }
    }
}

impl Default for UpdateConfig {
    fn default() -> Self {
        UpdateConfig {
            max_retries: 3,
            retry_delay: Duration::from_millis(1000),
            max_concurrent_updates: 3,
            update_timeout: Duration::from_secs(10),
            queue_retry_limit: 0,
            conflict_resolution: ConflictStrategy::UseServer,
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig { max_list_pages: 50 }
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            api: ApiConfig::default(),
            polling: PollingConfig::default(),
            updates: UpdateConfig::default(),
            cache: CacheConfig::default(),
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, env::VarError> {
        let defaults = Config::default();

        Ok(Config {
            api: ApiConfig {
                base_url: env::var("REPORTS_API_URL")?,
                token: env::var("REPORTS_API_TOKEN").ok(),
                request_timeout: Duration::from_secs(env_parse(
                    "REPORTS_API_TIMEOUT_SECS",
                    defaults.api.request_timeout.as_secs(),
                )),
            },
            polling: PollingConfig {
                interval: Duration::from_millis(env_parse(
                    "REPORTS_POLL_INTERVAL_MS",
                    defaults.polling.interval.as_millis() as u64,
                )),
                refetch_on_focus: env_parse(
                    "REPORTS_REFETCH_ON_FOCUS",
                    defaults.polling.refetch_on_focus,
                ),
                refetch_on_reconnect: env_parse(
                    "REPORTS_REFETCH_ON_RECONNECT",
                    defaults.polling.refetch_on_reconnect,
                ),
            },
            updates: UpdateConfig {
                max_retries: env_parse("REPORTS_MAX_RETRIES", defaults.updates.max_retries),
                retry_delay: Duration::from_millis(env_parse(
                    "REPORTS_RETRY_DELAY_MS",
                    defaults.updates.retry_delay.as_millis() as u64,
                )),
                max_concurrent_updates: env_parse(
                    "REPORTS_MAX_CONCURRENT_UPDATES",
                    defaults.updates.max_concurrent_updates,
                )
                .max(1),
                update_timeout: Duration::from_millis(env_parse(
                    "REPORTS_UPDATE_TIMEOUT_MS",
                    defaults.updates.update_timeout.as_millis() as u64,
                )),
                queue_retry_limit: env_parse(
                    "REPORTS_QUEUE_RETRY_LIMIT",
                    defaults.updates.queue_retry_limit,
                ),
                conflict_resolution: env_parse(
                    "REPORTS_CONFLICT_RESOLUTION",
                    defaults.updates.conflict_resolution,
                ),
            },
            cache: CacheConfig {
                max_list_pages: env_parse("REPORTS_CACHE_MAX_PAGES", defaults.cache.max_list_pages),
            },
        })
    }
}

/// Read and parse an environment variable, falling back to `default`
fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    match env::var(key) {
        Ok(raw) => raw.trim().parse().unwrap_or_else(|_| {
            tracing::warn!("Ignoring unparseable value for {}: {:?}", key, raw);
            default
        }),
        Err(_) => default,
    }
}
