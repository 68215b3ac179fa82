//! Wiring of the cache stack from configuration.
//!
//! Dependencies are built here and passed down explicitly: the far cache into
//! the manager, the manager into the HTTP state.

use std::sync::Arc;

use anyhow::Context;
use hcache_core::CacheManager;
use hcache_redis::create_far_cache;

use crate::config::AppConfig;

/// Build the cache manager and create every configured cache.
///
/// An unreachable Redis is not an error: caches run L1-only. Invalid cache
/// configuration is.
pub async fn build_cache_manager(cfg: &AppConfig) -> anyhow::Result<Arc<CacheManager>> {
    let far = create_far_cache(&cfg.redis).await;
    let configurations = cfg.cache_configurations();
    let names: Vec<String> = configurations.iter().map(|c| c.name.clone()).collect();

    let manager = CacheManager::with_configurations(cfg.cache_options(), far, configurations)
        .context("invalid cache configuration")?;

    for name in &names {
        manager
            .get_cache(name)
            .with_context(|| format!("failed to create cache '{name}'"))?;
    }

    tracing::info!(
        caches = names.len(),
        far_cache = manager.has_far_cache(),
        "cache manager ready"
    );
    Ok(Arc::new(manager))
}
