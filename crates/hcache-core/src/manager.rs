//! Registry of named caches.

use std::collections::BTreeMap;
use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use parking_lot::Mutex;
use tokio::task::JoinHandle;

use crate::config::{CacheConfiguration, CacheOptions};
use crate::error::{CacheError, CacheResult};
use crate::far::DynFarCache;
use crate::service::HierarchicalCacheService;
use crate::stats::CacheStatisticsSnapshot;

/// Shared handle to a named cache.
pub type CacheHandle = Arc<HierarchicalCacheService>;

/// Creates and hands out one [`HierarchicalCacheService`] per name.
///
/// Every service shares the injected far cache. A name that was never
/// registered gets [`CacheConfiguration::named`] defaults on first use. Once a
/// name has a service, its storage settings are fixed.
pub struct CacheManager {
    far: Option<DynFarCache>,
    options: CacheOptions,
    configurations: DashMap<String, CacheConfiguration>,
    caches: DashMap<String, CacheHandle>,
    sweepers: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for CacheManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheManager")
            .field("far", &self.far.as_ref().map(|far| far.backend_name()))
            .field("caches", &self.caches.len())
            .finish()
    }
}

impl CacheManager {
    pub fn new(options: CacheOptions, far: Option<DynFarCache>) -> Self {
        Self {
            far,
            options,
            configurations: DashMap::new(),
            caches: DashMap::new(),
            sweepers: Mutex::new(Vec::new()),
        }
    }

    /// Build a manager with pre-registered configurations.
    pub fn with_configurations(
        options: CacheOptions,
        far: Option<DynFarCache>,
        configurations: impl IntoIterator<Item = CacheConfiguration>,
    ) -> CacheResult<Self> {
        let manager = Self::new(options, far);
        for config in configurations {
            manager.register(config)?;
        }
        Ok(manager)
    }

    pub fn options(&self) -> &CacheOptions {
        &self.options
    }

    /// `true` when a far cache was injected.
    pub fn has_far_cache(&self) -> bool {
        self.far.is_some()
    }

    /// Register settings for a cache name. Re-registering is allowed until
    /// the cache is first used; afterwards only identical storage settings
    /// are accepted.
    pub fn register(&self, config: CacheConfiguration) -> CacheResult<()> {
        config.validate()?;
        if let Some(existing) = self.caches.get(&config.name) {
            if !existing.config().same_storage(&config) {
                return Err(CacheError::configuration(format!(
                    "cache '{}' is already in use with different settings",
                    config.name
                )));
            }
            return Ok(());
        }
        tracing::debug!(cache = %config.name, "cache configuration registered");
        self.configurations.insert(config.name.clone(), config);
        Ok(())
    }

    /// Return the cache for `name`, creating it on first use.
    pub fn get_cache(&self, name: &str) -> CacheResult<CacheHandle> {
        if let Some(cache) = self.caches.get(name) {
            return Ok(Arc::clone(cache.value()));
        }
        let config = self
            .configurations
            .get(name)
            .map(|config| config.clone())
            .unwrap_or_else(|| CacheConfiguration::named(name));
        self.create(config)
    }

    /// Return the cache for `config.name`, registering `config` if the name
    /// is new. Fails if the cache exists with different storage settings.
    pub fn get_or_register(&self, config: &CacheConfiguration) -> CacheResult<CacheHandle> {
        if let Some(cache) = self.caches.get(&config.name) {
            if cache.config().same_storage(config) {
                return Ok(Arc::clone(cache.value()));
            }
            return Err(CacheError::configuration(format!(
                "cache '{}' is already in use with different settings",
                config.name
            )));
        }
        let config = match self.configurations.get(&config.name) {
            Some(registered) if !registered.same_storage(config) => {
                return Err(CacheError::configuration(format!(
                    "cache '{}' is registered with different settings",
                    config.name
                )));
            }
            Some(registered) => registered.clone(),
            None => config.clone(),
        };
        self.create(config)
    }

    fn create(&self, config: CacheConfiguration) -> CacheResult<CacheHandle> {
        match self.caches.entry(config.name.clone()) {
            Entry::Occupied(existing) => Ok(Arc::clone(existing.get())),
            Entry::Vacant(slot) => {
                let cache = Arc::new(HierarchicalCacheService::new(
                    config,
                    &self.options,
                    self.far.clone(),
                )?);
                self.start_sweeper(&cache);
                tracing::info!(
                    cache = %cache.name(),
                    l1 = cache.is_l1_enabled(),
                    l2 = cache.is_l2_enabled(),
                    "cache initialized"
                );
                slot.insert(Arc::clone(&cache));
                Ok(cache)
            }
        }
    }

    fn start_sweeper(&self, cache: &HierarchicalCacheService) {
        let (Some(interval), Some(near)) = (self.options.sweep_interval, cache.near()) else {
            return;
        };
        if tokio::runtime::Handle::try_current().is_err() {
            tracing::debug!(cache = %cache.name(), "no runtime, L1 sweeper not started");
            return;
        }
        self.sweepers.lock().push(near.spawn_sweeper(interval));
    }

    /// Existing cache for `name`, without creating one.
    pub fn lookup(&self, name: &str) -> Option<CacheHandle> {
        self.caches.get(name).map(|cache| Arc::clone(cache.value()))
    }

    /// Names of caches in use, sorted.
    pub fn cache_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.caches.iter().map(|c| c.key().clone()).collect();
        names.sort();
        names
    }

    /// Clear one cache. Returns `false` if no cache has that name.
    pub async fn clear(&self, name: &str) -> bool {
        match self.lookup(name) {
            Some(cache) => {
                cache.clear().await;
                true
            }
            None => false,
        }
    }

    /// Clear every cache.
    pub async fn clear_all(&self) {
        let caches: Vec<CacheHandle> = self.caches.iter().map(|c| Arc::clone(c.value())).collect();
        for cache in caches {
            cache.clear().await;
        }
    }

    /// Remove one logical key from a cache. Returns `Ok(false)` if no cache
    /// has that name.
    pub async fn evict(&self, name: &str, logical_key: &str) -> CacheResult<bool> {
        let Some(cache) = self.lookup(name) else {
            return Ok(false);
        };
        let key = cache.key(logical_key)?;
        cache.delete(&key).await;
        Ok(true)
    }

    pub fn snapshot(&self, name: &str) -> Option<CacheStatisticsSnapshot> {
        self.lookup(name).map(|cache| cache.snapshot())
    }

    /// Snapshots of every cache, keyed by name.
    pub fn snapshots(&self) -> BTreeMap<String, CacheStatisticsSnapshot> {
        self.caches
            .iter()
            .map(|c| (c.key().clone(), c.value().snapshot()))
            .collect()
    }

    /// Reset statistics of one cache. `hard` also restarts its creation time.
    pub fn reset_statistics(&self, name: &str, hard: bool) -> bool {
        match self.lookup(name) {
            Some(cache) if hard => {
                cache.hard_reset_statistics();
                true
            }
            Some(cache) => {
                cache.reset_statistics();
                true
            }
            None => false,
        }
    }

    /// Whether the far cache answers a ping. `None` when none is configured.
    pub async fn far_available(&self) -> Option<bool> {
        let far = self.far.as_ref()?;
        let reachable = matches!(
            tokio::time::timeout(self.options.l2_timeout, far.ping()).await,
            Ok(Ok(()))
        );
        Some(reachable)
    }

    /// Stop background sweepers.
    pub fn shutdown(&self) {
        for handle in self.sweepers.lock().drain(..) {
            handle.abort();
        }
    }
}

impl Drop for CacheManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::far::MemoryFarCache;

    fn manager() -> CacheManager {
        let far: DynFarCache = Arc::new(MemoryFarCache::new());
        CacheManager::new(CacheOptions::default(), Some(far))
    }

    #[test]
    fn test_one_service_per_name() {
        let manager = manager();
        let a = manager.get_cache("users").unwrap();
        let b = manager.get_cache("users").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(manager.cache_names(), vec!["users".to_string()]);
    }

    #[test]
    fn test_registered_configuration_is_used() {
        let manager = manager();
        manager
            .register(CacheConfiguration::named("local").with_tiers(true, false))
            .unwrap();
        let cache = manager.get_cache("local").unwrap();
        assert!(cache.is_l1_enabled());
        assert!(!cache.is_l2_enabled());
    }

    #[test]
    fn test_conflicting_registration_after_use_fails() {
        let manager = manager();
        manager.get_cache("users").unwrap();
        let err = manager
            .register(CacheConfiguration::named("users").with_ttl_minutes(5))
            .unwrap_err();
        assert!(err.is_configuration());
        assert!(manager.register(CacheConfiguration::named("users")).is_ok());
    }

    #[test]
    fn test_invalid_name_rejected() {
        assert!(manager().get_cache("a:b").unwrap_err().is_configuration());
    }

    #[tokio::test]
    async fn test_evict_and_clear() {
        let manager = manager();
        let cache = manager.get_cache("users").unwrap();
        let key = cache.key("1").unwrap();
        cache.put(&key, b"v".to_vec(), None).await;

        assert!(manager.evict("users", "1").await.unwrap());
        assert!(cache.get(&key).await.is_none());
        assert!(!manager.evict("missing", "1").await.unwrap());

        cache.put(&key, b"v".to_vec(), None).await;
        assert!(manager.clear("users").await);
        assert!(cache.get(&key).await.is_none());
        assert!(!manager.clear("missing").await);
    }

    #[tokio::test]
    async fn test_far_available() {
        assert_eq!(manager().far_available().await, Some(true));
        let local = CacheManager::new(CacheOptions::default(), None);
        assert_eq!(local.far_available().await, None);
    }
}
