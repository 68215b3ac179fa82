//! # hcache-redis
//!
//! Redis implementation of the HCache far tier.
//!
//! [`create_far_cache`] builds the connection pool, pre-opens the configured
//! number of idle connections and pings the server. When Redis is disabled or
//! unreachable it returns `None` and the caller runs every cache L1-only.

mod config;
mod far;

use std::sync::Arc;
use std::time::Duration;

use hcache_core::{DynFarCache, FarCache, TierError};

pub use config::RedisConfig;
pub use far::RedisFarCache;

impl RedisFarCache {
    /// Build the pool and verify the server answers.
    pub async fn connect(config: &RedisConfig) -> Result<Self, TierError> {
        config
            .validate_connection()
            .map_err(TierError::l2_misconfigured)?;
        let timeout = Duration::from_millis(config.timeout_ms);

        let mut redis_config = deadpool_redis::Config::from_url(config.connection_url());
        let pool_config = redis_config
            .pool
            .get_or_insert_with(|| deadpool_redis::PoolConfig::new(config.pool_size));
        pool_config.max_size = config.pool_size;
        pool_config.timeouts.wait = Some(timeout);
        pool_config.timeouts.create = Some(timeout);
        pool_config.timeouts.recycle = Some(timeout);

        let pool = redis_config
            .create_pool(Some(deadpool_redis::Runtime::Tokio1))
            .map_err(|e| TierError::l2_unreachable(format!("failed to create Redis pool: {e}")))?;

        // Open the idle floor up front; dropping the guards returns them to the pool.
        let warm = config.minimum_idle_size.clamp(1, config.pool_size);
        let mut idle = Vec::with_capacity(warm);
        for _ in 0..warm {
            match pool.get().await {
                Ok(conn) => idle.push(conn),
                Err(e) if idle.is_empty() => {
                    return Err(TierError::l2_unreachable(format!(
                        "failed to connect to Redis: {e}"
                    )));
                }
                Err(e) => {
                    tracing::warn!(error = %e, opened = idle.len(), "Redis pool pre-warm stopped early");
                    break;
                }
            }
        }
        drop(idle);

        let far = Self::new(pool);
        tokio::time::timeout(timeout, far.ping())
            .await
            .map_err(|_| TierError::l2_timeout(timeout))??;
        Ok(far)
    }
}

/// Create the far cache described by `config`.
///
/// Returns `None` when Redis is disabled or cannot be reached; caches then run
/// with L1 only.
pub async fn create_far_cache(config: &RedisConfig) -> Option<DynFarCache> {
    if !config.enabled {
        tracing::info!("Redis disabled, using local cache only");
        return None;
    }

    tracing::info!(address = %config.address, "Connecting to Redis");

    match RedisFarCache::connect(config).await {
        Ok(far) => {
            tracing::info!(pool_size = config.pool_size, "Connected to Redis successfully");
            Some(Arc::new(far))
        }
        Err(e) => {
            tracing::warn!(
                error = %e,
                "Failed to connect to Redis. Falling back to local cache."
            );
            None
        }
    }
}
