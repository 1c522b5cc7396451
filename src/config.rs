//! Enforcement configuration and its property-key parser.

use crate::error::{Error, Result};
use std::time::Duration;

/// Master authorization toggle.
pub const AUTHORIZATION_ENABLED: &str = "authorization.enabled";
/// Toggles the privilege cache and its background refresh.
pub const CACHE_ENABLED: &str = "authorization.cache.enabled";
/// Period between background refresh passes.
pub const CACHE_REFRESH_INTERVAL: &str = "authorization.cache.refresh-interval";
/// Whether a cache miss fetches the principal's privileges.
pub const CACHE_FETCH_ON_MISS: &str = "authorization.cache.fetch-on-miss";
/// Upper bound on concurrent backend calls during a refresh pass.
pub const CACHE_REFRESH_PARALLELISM: &str = "authorization.cache.refresh-parallelism";
/// Limit applied to every backend call.
pub const BACKEND_TIMEOUT: &str = "authorization.backend.timeout";

const KEY_PREFIX: &str = "authorization.";

/// Enforcement settings.
///
/// Defaults match the recognized property keys: authorization off, caching on,
/// five minute refresh, lazy fetch on, 16 parallel refreshes, ten second
/// backend timeout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnforcementConfig {
    authorization_enabled: bool,
    cache_enabled: bool,
    refresh_interval: Duration,
    fetch_on_miss: bool,
    refresh_parallelism: usize,
    backend_timeout: Duration,
}

impl Default for EnforcementConfig {
    fn default() -> Self {
        Self {
            authorization_enabled: false,
            cache_enabled: true,
            refresh_interval: Duration::from_secs(300),
            fetch_on_miss: true,
            refresh_parallelism: 16,
            backend_timeout: Duration::from_secs(10),
        }
    }
}

impl EnforcementConfig {
    /// Creates the default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses a flat property map such as a loaded site configuration.
    ///
    /// Keys outside `authorization.` are ignored so the whole platform
    /// configuration can be passed in. Unknown `authorization.*` keys and
    /// malformed values are rejected.
    pub fn from_properties<I, K, V>(properties: I) -> Result<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut config = Self::default();
        for (key, value) in properties {
            let key = key.as_ref().trim();
            let value = value.as_ref();
            match key {
                AUTHORIZATION_ENABLED => config.authorization_enabled = parse_bool(key, value)?,
                CACHE_ENABLED => config.cache_enabled = parse_bool(key, value)?,
                CACHE_REFRESH_INTERVAL => config.refresh_interval = parse_duration(key, value)?,
                CACHE_FETCH_ON_MISS => config.fetch_on_miss = parse_bool(key, value)?,
                CACHE_REFRESH_PARALLELISM => {
                    config.refresh_parallelism = value.trim().parse().map_err(|_| {
                        Error::Configuration(format!("{key}: `{value}` is not a positive integer"))
                    })?;
                }
                BACKEND_TIMEOUT => config.backend_timeout = parse_duration(key, value)?,
                other if other.starts_with(KEY_PREFIX) => {
                    return Err(Error::Configuration(format!("unknown key `{other}`")));
                }
                _ => {}
            }
        }
        config.validate()?;
        Ok(config)
    }

    /// Enables or disables authorization.
    pub fn with_authorization_enabled(mut self, on: bool) -> Self {
        self.authorization_enabled = on;
        self
    }

    /// Enables or disables privilege caching.
    pub fn with_cache_enabled(mut self, on: bool) -> Self {
        self.cache_enabled = on;
        self
    }

    /// Sets the background refresh period.
    pub fn with_refresh_interval(mut self, interval: Duration) -> Self {
        self.refresh_interval = interval;
        self
    }

    /// Enables or disables fetching privileges on a cache miss.
    pub fn with_fetch_on_miss(mut self, on: bool) -> Self {
        self.fetch_on_miss = on;
        self
    }

    /// Sets the maximum number of concurrent refreshes per pass.
    pub fn with_refresh_parallelism(mut self, parallelism: usize) -> Self {
        self.refresh_parallelism = parallelism;
        self
    }

    /// Sets the timeout applied to each backend call.
    pub fn with_backend_timeout(mut self, timeout: Duration) -> Self {
        self.backend_timeout = timeout;
        self
    }

    /// Checks value ranges.
    pub fn validate(&self) -> Result<()> {
        if self.refresh_interval.is_zero() {
            return Err(Error::Configuration(format!(
                "{CACHE_REFRESH_INTERVAL} must be greater than zero"
            )));
        }
        if self.refresh_parallelism == 0 {
            return Err(Error::Configuration(format!(
                "{CACHE_REFRESH_PARALLELISM} must be greater than zero"
            )));
        }
        if self.backend_timeout.is_zero() {
            return Err(Error::Configuration(format!(
                "{BACKEND_TIMEOUT} must be greater than zero"
            )));
        }
        Ok(())
    }

    pub fn authorization_enabled(&self) -> bool {
        self.authorization_enabled
    }

    pub fn cache_enabled(&self) -> bool {
        self.cache_enabled
    }

    /// True when enforcement goes through the cache.
    pub fn caching_active(&self) -> bool {
        self.authorization_enabled && self.cache_enabled
    }

    pub fn refresh_interval(&self) -> Duration {
        self.refresh_interval
    }

    pub fn fetch_on_miss(&self) -> bool {
        self.fetch_on_miss
    }

    pub fn refresh_parallelism(&self) -> usize {
        self.refresh_parallelism
    }

    pub fn backend_timeout(&self) -> Duration {
        self.backend_timeout
    }
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" => Ok(true),
        "false" => Ok(false),
        _ => Err(Error::Configuration(format!(
            "{key}: `{value}` is not a boolean"
        ))),
    }
}

// A bare integer is read as seconds.
fn parse_duration(key: &str, value: &str) -> Result<Duration> {
    let value = value.trim();
    if let Ok(secs) = value.parse::<u64>() {
        return Ok(Duration::from_secs(secs));
    }
    humantime::parse_duration(value)
        .map_err(|err| Error::Configuration(format!("{key}: `{value}` is not a duration: {err}")))
}
