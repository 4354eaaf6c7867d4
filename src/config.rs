//! Runtime configuration, read from the environment via figment.
//!
//! Keys map one-to-one onto environment variables (`REDIS_HOST` → `redis_host`).
//! Duration values accept human-readable strings such as `5s` or `250ms`; a bare
//! number is taken as seconds.

use anyhow::Context;
use figment::Figment;
use figment::providers::Env;
use serde::{Deserialize, Deserializer};
use std::fmt;
use std::time::Duration;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreKind {
    #[default]
    Redis,
    Memory,
}

impl fmt::Display for StoreKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            StoreKind::Redis => "redis",
            StoreKind::Memory => "memory",
        })
    }
}

#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub log_level: String,

    pub redis_enabled: bool,
    pub cache_store: StoreKind,
    pub redis_host: String,
    pub redis_port: u16,
    pub redis_password: Option<String>,
    pub redis_database: u8,
    #[serde(deserialize_with = "deserialize_duration")]
    pub redis_timeout: Duration,
    pub redis_pool_max_total: usize,
    /// Accepted so existing deployments keep parsing, but not applied: deadpool keeps
    /// every returned connection up to `redis_pool_max_total` and has no idle cap.
    pub redis_pool_max_idle: usize,
    /// Connections opened at startup to warm the pool.
    pub redis_pool_min_idle: usize,

    pub cache_key_prefix: String,
    pub cache_default_ttl_seconds: u32,
    pub cache_compression_enabled: bool,
    pub cache_fail_open: bool,
    pub cache_stats_enabled: bool,
    #[serde(deserialize_with = "deserialize_duration")]
    pub cache_stats_ttl: Duration,
    pub cache_coalescing_enabled: bool,
    #[serde(deserialize_with = "deserialize_duration")]
    pub cache_coalescing_timeout: Duration,
    #[serde(deserialize_with = "deserialize_duration")]
    pub cache_coalescing_stale_threshold: Duration,
    #[serde(deserialize_with = "deserialize_duration")]
    pub cache_coalescing_cleanup_interval: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: "info".to_owned(),
            redis_enabled: false,
            cache_store: StoreKind::Redis,
            redis_host: "localhost".to_owned(),
            redis_port: 6379,
            redis_password: None,
            redis_database: 0,
            redis_timeout: Duration::from_secs(5),
            redis_pool_max_total: 20,
            redis_pool_max_idle: 10,
            redis_pool_min_idle: 5,
            cache_key_prefix: "qtt:cache:".to_owned(),
            cache_default_ttl_seconds: 3600,
            cache_compression_enabled: true,
            cache_fail_open: true,
            cache_stats_enabled: true,
            cache_stats_ttl: Duration::from_secs(5),
            cache_coalescing_enabled: true,
            cache_coalescing_timeout: Duration::from_secs(30),
            cache_coalescing_stale_threshold: Duration::from_secs(120),
            cache_coalescing_cleanup_interval: Duration::from_secs(60),
        }
    }
}

// Keeps the password out of logs.
impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("log_level", &self.log_level)
            .field("redis_enabled", &self.redis_enabled)
            .field("cache_store", &self.cache_store)
            .field("redis_host", &self.redis_host)
            .field("redis_port", &self.redis_port)
            .field("redis_password", &self.redis_password.as_ref().map(|_| "***"))
            .field("redis_database", &self.redis_database)
            .field("redis_timeout", &self.redis_timeout)
            .field("redis_pool_max_total", &self.redis_pool_max_total)
            .field("redis_pool_max_idle", &self.redis_pool_max_idle)
            .field("redis_pool_min_idle", &self.redis_pool_min_idle)
            .field("cache_key_prefix", &self.cache_key_prefix)
            .field("cache_default_ttl_seconds", &self.cache_default_ttl_seconds)
            .field("cache_compression_enabled", &self.cache_compression_enabled)
            .field("cache_fail_open", &self.cache_fail_open)
            .field("cache_stats_enabled", &self.cache_stats_enabled)
            .field("cache_stats_ttl", &self.cache_stats_ttl)
            .field("cache_coalescing_enabled", &self.cache_coalescing_enabled)
            .field("cache_coalescing_timeout", &self.cache_coalescing_timeout)
            .field(
                "cache_coalescing_stale_threshold",
                &self.cache_coalescing_stale_threshold,
            )
            .field(
                "cache_coalescing_cleanup_interval",
                &self.cache_coalescing_cleanup_interval,
            )
            .finish()
    }
}

impl Config {
    /// Load configuration from the process environment.
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_figment(Figment::new().merge(Env::raw()))
    }

    pub fn from_figment(figment: Figment) -> anyhow::Result<Self> {
        figment.extract().context("Failed to load config")
    }
}

/// Accepts `"5s"`, `"250ms"`, `"2m"`, or a bare number of seconds.
fn deserialize_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Seconds(u64),
        Text(String),
    }

    match Raw::deserialize(deserializer)? {
        Raw::Seconds(secs) => Ok(Duration::from_secs(secs)),
        Raw::Text(text) => fundu::parse_duration(text.trim())
            .map_err(|e| serde::de::Error::custom(format!("invalid duration '{text}': {e}"))),
    }
}
