use serde::{Deserialize, Serialize};

use hcache_core::DEFAULT_KEY_PREFIX;

/// Redis connection settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RedisConfig {
    /// Enable the far tier. Without it every cache runs L1-only.
    #[serde(default = "default_redis_enabled")]
    pub enabled: bool,

    /// Redis URL (e.g., "redis://localhost:6379")
    #[serde(default = "default_redis_address", alias = "url")]
    pub address: String,

    /// Password, when not embedded in `address`.
    #[serde(default)]
    pub password: Option<String>,

    /// Connection pool size
    #[serde(default = "default_redis_pool_size")]
    pub pool_size: usize,

    /// Connections opened at startup and returned to the pool.
    #[serde(default = "default_redis_minimum_idle_size")]
    pub minimum_idle_size: usize,

    /// Connection and request timeout in milliseconds
    #[serde(default = "default_redis_timeout_ms")]
    pub timeout_ms: u64,

    /// First segment of every key written to Redis.
    #[serde(default = "default_redis_key_prefix")]
    pub key_prefix: String,
}

fn default_redis_enabled() -> bool {
    false
}

fn default_redis_address() -> String {
    "redis://127.0.0.1:6379".to_string()
}

fn default_redis_pool_size() -> usize {
    64
}

fn default_redis_minimum_idle_size() -> usize {
    10
}

fn default_redis_timeout_ms() -> u64 {
    3000
}

fn default_redis_key_prefix() -> String {
    DEFAULT_KEY_PREFIX.to_string()
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            enabled: default_redis_enabled(),
            address: default_redis_address(),
            password: None,
            pool_size: default_redis_pool_size(),
            minimum_idle_size: default_redis_minimum_idle_size(),
            timeout_ms: default_redis_timeout_ms(),
            key_prefix: default_redis_key_prefix(),
        }
    }
}

impl RedisConfig {
    /// Connection URL with `password` applied when the address carries no
    /// credentials of its own.
    pub fn connection_url(&self) -> String {
        let Some(password) = self.password.as_deref().filter(|p| !p.is_empty()) else {
            return self.address.clone();
        };
        match self.address.split_once("://") {
            Some((scheme, rest)) if !rest.contains('@') => {
                format!("{scheme}://:{password}@{rest}")
            }
            _ => self.address.clone(),
        }
    }

    /// Validate the settings of an enabled far tier. A disabled one is never
    /// connected, so its connection settings are not checked.
    pub fn validate(&self) -> Result<(), String> {
        if !self.enabled {
            return Ok(());
        }
        self.validate_connection()
    }

    /// Check the settings a connection attempt depends on, regardless of
    /// `enabled`.
    pub fn validate_connection(&self) -> Result<(), String> {
        if !(self.address.starts_with("redis://") || self.address.starts_with("rediss://")) {
            return Err("redis.address must start with redis:// or rediss://".into());
        }
        if self.pool_size == 0 {
            return Err("redis.pool_size must be > 0".into());
        }
        if self.minimum_idle_size > self.pool_size {
            return Err("redis.minimum_idle_size must be <= redis.pool_size".into());
        }
        if self.timeout_ms == 0 {
            return Err("redis.timeout_ms must be > 0".into());
        }
        Ok(())
    }
}
