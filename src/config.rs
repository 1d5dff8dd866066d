use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::{net::SocketAddr, time::Duration};

use crate::{
    error::{RateLimitError, Result},
    redis::RedisConfig,
    window::TenantLimitConfig,
};

/// Top-level settings, layered from defaults, an optional file and the
/// `RATELIMIT__*` environment (e.g. `RATELIMIT__LIMITER__WINDOW_SECS=60`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub server: ServerSettings,
    pub limiter: LimiterSettings,
    pub cache: CacheSettings,
    pub store: StoreSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub http_addr: SocketAddr,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            http_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
        }
    }
}

/// Limiter policy fixed at construction time
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LimiterSettings {
    /// Applied when a tenant row has no `api_rate_limit`
    pub default_hourly_limit: u64,
    /// Applied when a tenant row has no `api_burst_limit`
    pub default_burst_allowance: u64,
    pub window_secs: u64,
    pub config_cache_ttl_secs: u64,
    pub block_ttl_secs: u64,
    /// Fail closed when a check takes longer than this
    pub check_timeout_ms: Option<u64>,
    /// How long an unused key lock is kept around
    pub key_lock_idle_secs: u64,
}

impl Default for LimiterSettings {
    fn default() -> Self {
        let defaults = TenantLimitConfig::default();
        Self {
            default_hourly_limit: defaults.hourly_limit,
            default_burst_allowance: defaults.burst_allowance,
            window_secs: 3600,
            config_cache_ttl_secs: 3600,
            block_ttl_secs: 86400,
            check_timeout_ms: None,
            key_lock_idle_secs: 60,
        }
    }
}

impl LimiterSettings {
    pub fn default_limits(&self) -> TenantLimitConfig {
        TenantLimitConfig {
            hourly_limit: self.default_hourly_limit,
            burst_allowance: self.default_burst_allowance,
        }
    }

    pub fn check_timeout(&self) -> Option<Duration> {
        self.check_timeout_ms.map(Duration::from_millis)
    }

    pub fn validate(&self) -> Result<()> {
        if self.default_hourly_limit == 0 {
            return Err(RateLimitError::Config(
                "default_hourly_limit must be positive".to_string(),
            ));
        }
        if self.window_secs == 0 {
            return Err(RateLimitError::Config("window_secs must be positive".to_string()));
        }
        if self.block_ttl_secs == 0 || self.config_cache_ttl_secs == 0 {
            return Err(RateLimitError::Config(
                "cache TTLs must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheBackend {
    Memory,
    Redis,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    pub backend: CacheBackend,
    pub redis: RedisConfig,
    /// Entry bound for the in-process cache
    pub local_capacity: u64,
    /// Prepended to every cache key as `{prefix}:`
    pub key_prefix: String,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            backend: CacheBackend::Memory,
            redis: RedisConfig::default(),
            local_capacity: 100_000,
            key_prefix: String::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    Memory,
    Sqlite,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreSettings {
    pub backend: StoreBackend,
    pub database_url: String,
    pub max_connections: u32,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Memory,
            database_url: "sqlite://ratelimit.db".to_string(),
            max_connections: 5,
        }
    }
}

impl Settings {
    /// Load settings from an optional file plus the environment
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::with_name(path));
        }
        builder = builder.add_source(
            Environment::with_prefix("RATELIMIT")
                .separator("__")
                .try_parsing(true),
        );

        let settings: Settings = builder.build()?.try_deserialize()?;
        settings.limiter.validate()?;
        Ok(settings)
    }

    /// Parse settings from a YAML document
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let settings: Settings = Config::builder()
            .add_source(File::from_str(yaml, FileFormat::Yaml))
            .build()?
            .try_deserialize()?;
        settings.limiter.validate()?;
        Ok(settings)
    }
}
