//! Per-cache configuration and service-wide options.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{CacheError, CacheResult};
use crate::key::{DEFAULT_KEY_PREFIX, KeyTemplate, validate_segment};
use crate::near::NearCacheConfig;

/// Level name used when a cache does not pick one.
pub const DEFAULT_CACHE_LEVEL: &str = "default";

/// Settings for one named cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheConfiguration {
    /// Logical cache name. When loaded from a keyed table the key fills this in.
    #[serde(default, alias = "value")]
    pub name: String,

    /// Key expression with `{arg}` or `{0}` placeholders.
    #[serde(default)]
    pub key: Option<String>,

    /// Argument names used as search parameters, paired with `levels`.
    #[serde(default)]
    pub parameters: Vec<String>,

    /// Hierarchy level of each entry in `parameters`.
    #[serde(default)]
    pub levels: Vec<i32>,

    #[serde(default = "default_cache_level")]
    pub cache_level: String,

    /// Entry lifetime in minutes; `-1` means no expiry.
    #[serde(default = "default_ttl_minutes")]
    pub ttl_minutes: i64,

    #[serde(default = "default_true")]
    pub enable_l1: bool,

    #[serde(default = "default_true")]
    pub enable_l2: bool,
}

fn default_cache_level() -> String {
    DEFAULT_CACHE_LEVEL.to_string()
}

fn default_ttl_minutes() -> i64 {
    -1
}

fn default_true() -> bool {
    true
}

impl CacheConfiguration {
    /// Default configuration for `name`: both tiers, no expiry.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            key: None,
            parameters: Vec::new(),
            levels: Vec::new(),
            cache_level: default_cache_level(),
            ttl_minutes: default_ttl_minutes(),
            enable_l1: true,
            enable_l2: true,
        }
    }

    pub fn with_key(mut self, expression: impl Into<String>) -> Self {
        self.key = Some(expression.into());
        self
    }

    pub fn with_ttl_minutes(mut self, minutes: i64) -> Self {
        self.ttl_minutes = minutes;
        self
    }

    pub fn with_cache_level(mut self, level: impl Into<String>) -> Self {
        self.cache_level = level.into();
        self
    }

    pub fn with_tiers(mut self, enable_l1: bool, enable_l2: bool) -> Self {
        self.enable_l1 = enable_l1;
        self.enable_l2 = enable_l2;
        self
    }

    /// Append a search parameter bound to the argument `name` at `level`.
    pub fn with_parameter(mut self, name: impl Into<String>, level: i32) -> Self {
        self.parameters.push(name.into());
        self.levels.push(level);
        self
    }

    /// Entry lifetime, `None` when entries never expire.
    pub fn ttl(&self) -> Option<Duration> {
        (self.ttl_minutes > 0).then(|| Duration::from_secs(self.ttl_minutes as u64 * 60))
    }

    /// Parsed key expression, if any.
    pub fn key_template(&self) -> CacheResult<Option<KeyTemplate>> {
        self.key.as_deref().map(KeyTemplate::parse).transpose()
    }

    /// Parameter names paired with their levels.
    pub fn parameter_levels(&self) -> impl Iterator<Item = (&str, i32)> {
        self.parameters
            .iter()
            .zip(self.levels.iter().copied())
            .map(|(name, level)| (name.trim_start_matches('#'), level))
    }

    pub fn validate(&self) -> CacheResult<()> {
        validate_segment("cache name", &self.name)?;
        validate_segment("cache level", &self.cache_level)?;
        if self.ttl_minutes == 0 || self.ttl_minutes < -1 {
            return Err(CacheError::configuration(format!(
                "cache '{}': ttl_minutes must be -1 or positive, got {}",
                self.name, self.ttl_minutes
            )));
        }
        if self.levels.len() != self.parameters.len() {
            return Err(CacheError::configuration(format!(
                "cache '{}': {} levels given for {} parameters",
                self.name,
                self.levels.len(),
                self.parameters.len()
            )));
        }
        if self.parameters.iter().any(|p| p.trim_start_matches('#').is_empty()) {
            return Err(CacheError::configuration(format!(
                "cache '{}': empty parameter name",
                self.name
            )));
        }
        self.key_template().map_err(|e| {
            CacheError::configuration(format!("cache '{}': {e}", self.name))
        })?;
        Ok(())
    }

    /// Whether two configurations store entries the same way. Key hints may
    /// differ between operations sharing a cache; storage settings may not.
    pub fn same_storage(&self, other: &Self) -> bool {
        self.name == other.name
            && self.cache_level == other.cache_level
            && self.ttl_minutes == other.ttl_minutes
            && self.enable_l1 == other.enable_l1
            && self.enable_l2 == other.enable_l2
    }
}

/// Overrides applied to every cache with a given `cache_level`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LevelSettings {
    /// L1 capacity for caches at this level.
    #[serde(default)]
    pub maximum_size: Option<usize>,
    #[serde(default = "default_true")]
    pub enable_l1: bool,
    #[serde(default = "default_true")]
    pub enable_l2: bool,
}

impl Default for LevelSettings {
    fn default() -> Self {
        Self {
            maximum_size: None,
            enable_l1: true,
            enable_l2: true,
        }
    }
}

/// What to do when an L2 write or delete fails after L1 already changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum L2WritePolicy {
    /// Record the failure and move on. L2 catches up on the next write or
    /// when the stale entry expires.
    #[default]
    Drop,
    /// Retry in the background with exponential backoff.
    Retry {
        max_attempts: u32,
        initial_backoff: Duration,
    },
}

/// Options shared by every cache a manager creates.
#[derive(Debug, Clone)]
pub struct CacheOptions {
    /// First segment of every physical key.
    pub key_prefix: String,
    /// Default L1 sizing; `LevelSettings::maximum_size` overrides capacity.
    pub near: NearCacheConfig,
    /// Upper bound for a single L2 call.
    pub l2_timeout: Duration,
    pub write_policy: L2WritePolicy,
    /// Background L1 expiry sweep interval; `None` relies on lazy expiry only.
    pub sweep_interval: Option<Duration>,
    /// Settings keyed by `cache_level`.
    pub levels: HashMap<String, LevelSettings>,
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self {
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            near: NearCacheConfig::default(),
            l2_timeout: Duration::from_millis(3000),
            write_policy: L2WritePolicy::default(),
            sweep_interval: None,
            levels: HashMap::new(),
        }
    }
}

/// Effective tier layout of one cache after level settings are applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ResolvedTiers {
    pub enable_l1: bool,
    pub enable_l2: bool,
    pub near: NearCacheConfig,
}

impl CacheOptions {
    /// Combine cache flags with level settings. A tier is enabled only when
    /// both the cache and its level allow it.
    pub(crate) fn resolve(&self, config: &CacheConfiguration) -> ResolvedTiers {
        let level = self
            .levels
            .get(&config.cache_level)
            .cloned()
            .unwrap_or_default();
        let mut near = self.near.clone();
        if let Some(maximum_size) = level.maximum_size {
            near.maximum_size = maximum_size;
        }
        ResolvedTiers {
            enable_l1: config.enable_l1 && level.enable_l1,
            enable_l2: config.enable_l2 && level.enable_l2,
            near,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ttl_conversion() {
        assert_eq!(CacheConfiguration::named("a").ttl(), None);
        assert_eq!(
            CacheConfiguration::named("a").with_ttl_minutes(2).ttl(),
            Some(Duration::from_secs(120))
        );
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        assert!(CacheConfiguration::named("").validate().is_err());
        assert!(CacheConfiguration::named("a:b").validate().is_err());
        assert!(
            CacheConfiguration::named("a")
                .with_ttl_minutes(0)
                .validate()
                .is_err()
        );
        assert!(
            CacheConfiguration::named("a")
                .with_key("{unterminated")
                .validate()
                .unwrap_err()
                .is_configuration()
        );
        assert!(CacheConfiguration::named("a").validate().is_ok());
    }

    #[test]
    fn test_parameter_levels() {
        let mut config = CacheConfiguration::named("a")
            .with_parameter("#tenant", 1)
            .with_parameter("region", 2);
        let levels: Vec<_> = config.parameter_levels().collect();
        assert_eq!(levels, vec![("tenant", 1), ("region", 2)]);
        assert!(config.validate().is_ok());

        config.parameters.push("extra".into());
        assert!(config.validate().unwrap_err().is_configuration());
    }

    #[test]
    fn test_resolve_combines_flags_and_capacity() {
        let mut options = CacheOptions::default();
        options.levels.insert(
            "hot".into(),
            LevelSettings {
                maximum_size: Some(100),
                enable_l1: true,
                enable_l2: false,
            },
        );

        let config = CacheConfiguration::named("a").with_cache_level("hot");
        let tiers = options.resolve(&config);
        assert!(tiers.enable_l1);
        assert!(!tiers.enable_l2);
        assert_eq!(tiers.near.maximum_size, 100);

        let config = CacheConfiguration::named("b").with_tiers(false, true);
        let tiers = options.resolve(&config);
        assert!(!tiers.enable_l1);
        assert!(tiers.enable_l2);
        assert_eq!(tiers.near.maximum_size, 10_000);
    }

    #[test]
    fn test_deserialize_with_defaults() {
        let config: CacheConfiguration =
            serde_json::from_str(r#"{"name": "users", "ttl_minutes": 5}"#).unwrap();
        assert_eq!(config.cache_level, "default");
        assert!(config.enable_l1 && config.enable_l2);
        assert_eq!(config.ttl(), Some(Duration::from_secs(300)));
    }
}
