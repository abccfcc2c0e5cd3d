use std::env;
use std::time::Duration;

use crate::backoff::Backoff;
use crate::error::{ApiError, Result};
use crate::ratelimit::RateLimitHeaders;

pub const DEFAULT_API_URL: &str = "https://api.twitch.tv/kraken";

/// Runtime configuration for the Twitch client.
/// Values are sourced from environment variables with sensible defaults.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub client_id: String,
    pub token: Option<String>,
    pub api_url: String,
    pub user_agent: String,
    pub timeout_secs: u64,
    pub max_concurrency: usize,
    pub max_retries: u32,
    pub backoff_base_ms: u64,
    pub backoff_cap_ms: u64,
    pub backoff_jitter: bool,
    pub permit_timeout_ms: Option<u64>,
    pub worker_threads: usize,
    pub rate_limit_headers: RateLimitHeaders,
}

impl Config {
    /// Defaults for everything but the client id.
    pub fn new(client_id: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            token: None,
            api_url: DEFAULT_API_URL.to_string(),
            user_agent: format!("twitch-bridge/{}", env!("CARGO_PKG_VERSION")),
            timeout_secs: 30,
            max_concurrency: 1,
            max_retries: 3,
            backoff_base_ms: 250,
            backoff_cap_ms: 8_000,
            backoff_jitter: false,
            permit_timeout_ms: None,
            worker_threads: 2,
            rate_limit_headers: RateLimitHeaders::default(),
        }
    }

    /// Load configuration from environment.
    ///
    /// Env vars:
    /// - TWITCH_CLIENT_ID [required]
    /// - TWITCH_OAUTH_TOKEN (or TWITCH_TOKEN)
    /// - TWITCH_API_URL (default: https://api.twitch.tv/kraken)
    /// - TWITCH_HTTP_TIMEOUT_SECS (default: 30)
    /// - TWITCH_USER_AGENT (default: twitch-bridge/<version>)
    /// - TWITCH_MAX_CONCURRENCY (default: 1)
    /// - TWITCH_MAX_RETRIES (default: 3)
    /// - TWITCH_BACKOFF_BASE_MS / TWITCH_BACKOFF_CAP_MS (default: 250 / 8000)
    /// - TWITCH_BACKOFF_JITTER (default: false)
    /// - TWITCH_PERMIT_TIMEOUT_MS (default: wait indefinitely)
    /// - TWITCH_WORKER_THREADS (default: 2)
    /// - TWITCH_RATELIMIT_{LIMIT,REMAINING,RESET}_HEADER (default: Ratelimit-*)
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let client_id = lookup("TWITCH_CLIENT_ID")
            .filter(|s| !s.trim().is_empty())
            .ok_or_else(|| ApiError::Config("Missing TWITCH_CLIENT_ID".to_string()))?;
        let mut cfg = Self::new(client_id);

        cfg.token = lookup("TWITCH_OAUTH_TOKEN")
            .or_else(|| lookup("TWITCH_TOKEN"))
            .map(|t| t.trim_start_matches("oauth:").to_string())
            .filter(|t| !t.is_empty());
        if let Some(url) = lookup("TWITCH_API_URL") {
            cfg.api_url = url;
        }
        if let Some(ua) = lookup("TWITCH_USER_AGENT") {
            cfg.user_agent = ua;
        }
        cfg.timeout_secs = parse_or(&lookup, "TWITCH_HTTP_TIMEOUT_SECS", cfg.timeout_secs)?;
        cfg.max_concurrency = parse_or(&lookup, "TWITCH_MAX_CONCURRENCY", cfg.max_concurrency)?;
        cfg.max_retries = parse_or(&lookup, "TWITCH_MAX_RETRIES", cfg.max_retries)?;
        cfg.backoff_base_ms = parse_or(&lookup, "TWITCH_BACKOFF_BASE_MS", cfg.backoff_base_ms)?;
        cfg.backoff_cap_ms = parse_or(&lookup, "TWITCH_BACKOFF_CAP_MS", cfg.backoff_cap_ms)?;
        cfg.backoff_jitter = parse_or(&lookup, "TWITCH_BACKOFF_JITTER", cfg.backoff_jitter)?;
        cfg.worker_threads = parse_or(&lookup, "TWITCH_WORKER_THREADS", cfg.worker_threads)?;
        cfg.permit_timeout_ms = match lookup("TWITCH_PERMIT_TIMEOUT_MS") {
            Some(v) => Some(parse_value("TWITCH_PERMIT_TIMEOUT_MS", &v)?),
            None => None,
        };
        if let Some(h) = lookup("TWITCH_RATELIMIT_LIMIT_HEADER") {
            cfg.rate_limit_headers.limit = h;
        }
        if let Some(h) = lookup("TWITCH_RATELIMIT_REMAINING_HEADER") {
            cfg.rate_limit_headers.remaining = h;
        }
        if let Some(h) = lookup("TWITCH_RATELIMIT_RESET_HEADER") {
            cfg.rate_limit_headers.reset = h;
        }

        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_concurrency == 0 {
            return Err(ApiError::Config("max_concurrency must be at least 1".into()));
        }
        if self.worker_threads == 0 {
            return Err(ApiError::Config("worker_threads must be at least 1".into()));
        }
        if self.backoff_base_ms == 0 {
            return Err(ApiError::Config("backoff_base_ms must be positive".into()));
        }
        if self.backoff_cap_ms < self.backoff_base_ms {
            return Err(ApiError::Config(
                "backoff_cap_ms must not be below backoff_base_ms".into(),
            ));
        }
        Ok(())
    }

    pub fn backoff(&self) -> Backoff {
        Backoff::new(
            Duration::from_millis(self.backoff_base_ms),
            Duration::from_millis(self.backoff_cap_ms),
        )
        .with_jitter(self.backoff_jitter)
    }

    pub fn permit_timeout(&self) -> Option<Duration> {
        self.permit_timeout_ms.map(Duration::from_millis)
    }
}

fn parse_value<T: std::str::FromStr>(key: &str, raw: &str) -> Result<T> {
    raw.trim()
        .parse::<T>()
        .map_err(|_| ApiError::Config(format!("{} has an invalid value: {:?}", key, raw)))
}

fn parse_or<T, F>(lookup: &F, key: &str, default: T) -> Result<T>
where
    T: std::str::FromStr,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(raw) => parse_value(key, &raw),
        None => Ok(default),
    }
}
