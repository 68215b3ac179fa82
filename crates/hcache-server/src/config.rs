use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

use hcache_core::{
    CacheConfiguration, CacheOptions, L2WritePolicy, LevelSettings, NearCacheConfig,
};
use hcache_redis::RedisConfig;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Near cache (L1) sizing
    #[serde(default)]
    pub near: NearConfig,
    /// Redis (L2) configuration
    #[serde(default)]
    pub redis: RedisConfig,
    /// Handling of failed L2 writes
    #[serde(default)]
    pub write_policy: WritePolicyConfig,
    /// Settings shared by caches with the same `cache_level`
    #[serde(default)]
    pub levels: HashMap<String, LevelSettings>,
    /// Named caches created at startup
    #[serde(default)]
    pub caches: HashMap<String, CacheConfiguration>,
}

impl AppConfig {
    pub fn validate(&self) -> Result<(), String> {
        // Server validations
        if self.server.port == 0 {
            return Err("server.port must be > 0".into());
        }
        // Logging validation
        let lvl = self.logging.level.to_ascii_lowercase();
        let valid_levels = ["trace", "debug", "info", "warn", "error", "off"];
        if !valid_levels.contains(&lvl.as_str()) {
            return Err(format!("logging.level must be one of {valid_levels:?}"));
        }
        // Near cache validations
        if self.near.maximum_size == 0 {
            return Err("near.maximum_size must be > 0".into());
        }
        if self.near.shards == 0 {
            return Err("near.shards must be > 0".into());
        }
        if self.near.lock_timeout_ms == 0 {
            return Err("near.lock_timeout_ms must be > 0".into());
        }
        self.redis.validate()?;
        if self.redis.timeout_ms == 0 {
            return Err("redis.timeout_ms must be > 0".into());
        }
        if self.write_policy.mode == WritePolicyMode::Retry && self.write_policy.max_attempts == 0 {
            return Err("write_policy.max_attempts must be > 0 when mode = \"retry\"".into());
        }
        for (level, settings) in &self.levels {
            if settings.maximum_size == Some(0) {
                return Err(format!("levels.{level}.maximum_size must be > 0"));
            }
        }
        for (name, cache) in &self.caches {
            if !cache.name.is_empty() && cache.name != *name {
                return Err(format!(
                    "caches.{name}.name must match its table key, got '{}'",
                    cache.name
                ));
            }
            let mut cache = cache.clone();
            cache.name = name.clone();
            cache.validate().map_err(|e| format!("caches.{name}: {e}"))?;
        }
        Ok(())
    }

    pub fn addr(&self) -> SocketAddr {
        use std::net::{IpAddr, Ipv4Addr};
        let host: IpAddr = self
            .server
            .host
            .parse()
            .unwrap_or(IpAddr::V4(Ipv4Addr::new(0, 0, 0, 0)));
        SocketAddr::from((host, self.server.port))
    }

    /// Options shared by every cache.
    pub fn cache_options(&self) -> CacheOptions {
        CacheOptions {
            key_prefix: self.redis.key_prefix.clone(),
            near: NearCacheConfig {
                maximum_size: self.near.maximum_size,
                shards: self.near.shards,
                lock_timeout: Duration::from_millis(self.near.lock_timeout_ms),
            },
            l2_timeout: Duration::from_millis(self.redis.timeout_ms),
            write_policy: self.write_policy.policy(),
            sweep_interval: (self.near.sweep_interval_secs > 0)
                .then(|| Duration::from_secs(self.near.sweep_interval_secs)),
            levels: self.levels.clone(),
        }
    }

    /// Named cache configurations, with names taken from their table keys.
    pub fn cache_configurations(&self) -> Vec<CacheConfiguration> {
        let mut caches: Vec<CacheConfiguration> = self
            .caches
            .iter()
            .map(|(name, cache)| CacheConfiguration {
                name: name.clone(),
                ..cache.clone()
            })
            .collect();
        caches.sort_by(|a, b| a.name.cmp(&b.name));
        caches
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_host() -> String {
    "0.0.0.0".into()
}
fn default_port() -> u16 {
    8080
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}
fn default_log_level() -> String {
    "info".into()
}
impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NearConfig {
    /// Maximum entries per cache (default: 10000)
    #[serde(default = "default_near_maximum_size")]
    pub maximum_size: usize,
    #[serde(default = "default_near_shards")]
    pub shards: usize,
    /// Expired-entry sweep interval; 0 disables the sweeper
    #[serde(default = "default_near_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
    #[serde(default = "default_near_lock_timeout_ms")]
    pub lock_timeout_ms: u64,
}

fn default_near_maximum_size() -> usize {
    10_000
}
fn default_near_shards() -> usize {
    16
}
fn default_near_sweep_interval_secs() -> u64 {
    60
}
fn default_near_lock_timeout_ms() -> u64 {
    50
}

impl Default for NearConfig {
    fn default() -> Self {
        Self {
            maximum_size: default_near_maximum_size(),
            shards: default_near_shards(),
            sweep_interval_secs: default_near_sweep_interval_secs(),
            lock_timeout_ms: default_near_lock_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum WritePolicyMode {
    #[default]
    Drop,
    Retry,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WritePolicyConfig {
    #[serde(default)]
    pub mode: WritePolicyMode,
    #[serde(default = "default_retry_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_retry_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
}

fn default_retry_max_attempts() -> u32 {
    3
}
fn default_retry_initial_backoff_ms() -> u64 {
    100
}

impl Default for WritePolicyConfig {
    fn default() -> Self {
        Self {
            mode: WritePolicyMode::default(),
            max_attempts: default_retry_max_attempts(),
            initial_backoff_ms: default_retry_initial_backoff_ms(),
        }
    }
}

impl WritePolicyConfig {
    pub fn policy(&self) -> L2WritePolicy {
        match self.mode {
            WritePolicyMode::Drop => L2WritePolicy::Drop,
            WritePolicyMode::Retry => L2WritePolicy::Retry {
                max_attempts: self.max_attempts,
                initial_backoff: Duration::from_millis(self.initial_backoff_ms),
            },
        }
    }
}

pub mod loader {
    use super::AppConfig;
    use config::{Config, Environment, File};
    use std::path::PathBuf;

    /// Default configuration file, read when no path is given.
    pub const DEFAULT_CONFIG_FILE: &str = "hcache.toml";

    pub fn load_config(path: Option<&str>) -> Result<AppConfig, String> {
        let mut builder = Config::builder();
        let pathbuf = PathBuf::from(path.unwrap_or(DEFAULT_CONFIG_FILE));
        if pathbuf.exists() {
            builder = builder.add_source(File::from(pathbuf));
        }
        // Environment variable overrides, e.g., HCACHE__REDIS__ENABLED=true
        builder = builder.add_source(
            Environment::with_prefix("HCACHE")
                .try_parsing(true)
                .separator("__"),
        );
        let cfg = builder
            .build()
            .map_err(|e| format!("config build error: {e}"))?;
        let merged: AppConfig = cfg
            .try_deserialize()
            .map_err(|e| format!("config deserialize error: {e}"))?;
        // Validate
        merged.validate()?;
        Ok(merged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let cfg = AppConfig::default();
        assert!(cfg.validate().is_ok());
        let options = cfg.cache_options();
        assert_eq!(options.near.maximum_size, 10_000);
        assert_eq!(options.l2_timeout, Duration::from_millis(3000));
        assert_eq!(options.sweep_interval, Some(Duration::from_secs(60)));
        assert_eq!(options.write_policy, L2WritePolicy::Drop);
    }

    #[test]
    fn test_retry_policy_requires_attempts() {
        let mut cfg = AppConfig::default();
        cfg.write_policy.mode = WritePolicyMode::Retry;
        cfg.write_policy.max_attempts = 0;
        assert!(cfg.validate().is_err());

        cfg.write_policy.max_attempts = 2;
        assert!(cfg.validate().is_ok());
        assert_eq!(
            cfg.cache_options().write_policy,
            L2WritePolicy::Retry {
                max_attempts: 2,
                initial_backoff: Duration::from_millis(100),
            }
        );
    }

    #[test]
    fn test_cache_names_come_from_table_keys() {
        let mut cfg = AppConfig::default();
        cfg.caches
            .insert("users".into(), CacheConfiguration::named(""));
        let caches = cfg.cache_configurations();
        assert_eq!(caches[0].name, "users");
        assert!(cfg.validate().is_ok());

        cfg.caches
            .insert("orders".into(), CacheConfiguration::named("other"));
        assert!(cfg.validate().unwrap_err().contains("must match its table key"));
    }
}
