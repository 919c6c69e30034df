//! Configuration management for synchronizer sessions.

use livesync_engine::StreamScope;
use std::env;
use std::time::Duration;
use url::Url;

/// Exponential backoff for resubscribing after a feed drops.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    /// Delay before the first attempt
    pub initial: Duration,
    /// Upper bound for any single delay
    pub max: Duration,
    /// Growth factor between attempts
    pub multiplier: f64,
    /// Attempts before giving up (`None` retries forever)
    pub max_attempts: Option<u32>,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(250),
            max: Duration::from_secs(30),
            multiplier: 2.0,
            max_attempts: Some(10),
        }
    }
}

impl BackoffPolicy {
    /// Delay before the given attempt (0-based), or `None` once exhausted.
    pub fn delay(&self, attempt: u32) -> Option<Duration> {
        if let Some(max_attempts) = self.max_attempts {
            if attempt >= max_attempts {
                return None;
            }
        }
        let factor = self.multiplier.max(1.0).powi(attempt.min(64) as i32);
        let millis = (self.initial.as_millis() as f64 * factor).min(self.max.as_millis() as f64);
        Some(Duration::from_millis(millis as u64))
    }
}

/// Synchronizer configuration.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Base URL of the backend (used by `HttpSource`)
    pub url: Option<Url>,
    /// Abort the initial load after this long
    pub load_timeout: Option<Duration>,
    /// Ping interval for the realtime socket
    pub heartbeat_interval: Option<Duration>,
    /// Resubscription policy
    pub reconnect: BackoffPolicy,
    /// Whether sessions check events against their filter
    pub scope: StreamScope,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            url: None,
            load_timeout: Some(Duration::from_secs(30)),
            heartbeat_interval: Some(Duration::from_secs(25)),
            reconnect: BackoffPolicy::default(),
            scope: StreamScope::Enforced,
        }
    }
}

impl SyncConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(raw) = env::var("LIVESYNC_URL") {
            config.url = Some(Url::parse(&raw).map_err(|_| ConfigError::InvalidUrl(raw))?);
        }
        if let Some(ms) = millis_var("LIVESYNC_LOAD_TIMEOUT_MS")? {
            config.load_timeout = (ms > 0).then(|| Duration::from_millis(ms));
        }
        if let Some(ms) = millis_var("LIVESYNC_HEARTBEAT_MS")? {
            config.heartbeat_interval = (ms > 0).then(|| Duration::from_millis(ms));
        }
        if let Some(ms) = millis_var("LIVESYNC_RECONNECT_INITIAL_MS")? {
            config.reconnect.initial = Duration::from_millis(ms);
        }
        if let Some(ms) = millis_var("LIVESYNC_RECONNECT_MAX_MS")? {
            config.reconnect.max = Duration::from_millis(ms);
        }
        if let Ok(raw) = env::var("LIVESYNC_RECONNECT_ATTEMPTS") {
            let attempts: u32 = raw
                .parse()
                .map_err(|_| ConfigError::InvalidNumber("LIVESYNC_RECONNECT_ATTEMPTS", raw))?;
            config.reconnect.max_attempts = (attempts > 0).then_some(attempts);
        }
        if let Ok(raw) = env::var("LIVESYNC_STREAM_SCOPE") {
            config.scope = StreamScope::parse(&raw).ok_or(ConfigError::InvalidScope(raw))?;
        }

        Ok(config)
    }

    /// Use the given backend URL.
    pub fn with_url(mut self, url: Url) -> Self {
        self.url = Some(url);
        self
    }
}

fn millis_var(name: &'static str) -> Result<Option<u64>, ConfigError> {
    match env::var(name) {
        Ok(raw) => raw
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidNumber(name, raw)),
        Err(_) => Ok(None),
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("LIVESYNC_URL is required")]
    MissingUrl,

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Invalid number for {0}: {1}")]
    InvalidNumber(&'static str, String),

    #[error("Invalid LIVESYNC_STREAM_SCOPE value: {0} (expected enforced or trusted)")]
    InvalidScope(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_and_caps() {
        let policy = BackoffPolicy {
            initial: Duration::from_millis(100),
            max: Duration::from_millis(500),
            multiplier: 2.0,
            max_attempts: Some(5),
        };

        assert_eq!(policy.delay(0), Some(Duration::from_millis(100)));
        assert_eq!(policy.delay(1), Some(Duration::from_millis(200)));
        assert_eq!(policy.delay(2), Some(Duration::from_millis(400)));
        assert_eq!(policy.delay(3), Some(Duration::from_millis(500)));
        assert_eq!(policy.delay(5), None);
    }

    #[test]
    fn unlimited_backoff_never_exhausts() {
        let policy = BackoffPolicy {
            max_attempts: None,
            ..BackoffPolicy::default()
        };
        assert_eq!(policy.delay(1000), Some(policy.max));
    }

    #[test]
    fn defaults_enforce_scope() {
        let config = SyncConfig::default();
        assert_eq!(config.scope, StreamScope::Enforced);
        assert!(config.url.is_none());
    }
}
