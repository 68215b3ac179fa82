//! Two-tier cache coordination for a single named cache.

use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::config::{CacheConfiguration, CacheOptions, L2WritePolicy};
use crate::entry::Tier;
use crate::error::{CacheResult, TierError};
use crate::far::{DynFarCache, FarCache};
use crate::index::ParameterIndex;
use crate::key::{CacheKey, KeyDeriver, SearchParameter, canonical_parameters, hierarchical_patterns};
use crate::metrics;
use crate::near::NearCache;
use crate::retry::{RetryLedger, RetrySlot};
use crate::stats::{CacheStatistics, CacheStatisticsSnapshot};

/// Upper bound for the backoff between background L2 retries.
const MAX_RETRY_BACKOFF: Duration = Duration::from_secs(30);

/// Near L1 + far L2 cache for one logical name.
///
/// ## Lookup Order
///
/// 1. L1, when enabled. A live entry is returned directly.
/// 2. L2, when enabled. A hit is backfilled into L1 with the cache TTL.
/// 3. Miss.
///
/// ## Writes
///
/// `put` writes L1 synchronously, then L2 bounded by the request timeout.
/// `delete` removes from both tiers independently. L2 failures never reach
/// the caller: they are counted, logged, and handled per [`L2WritePolicy`].
/// A background retry is dropped once a later write to the same key reaches
/// L2, or once the cache is cleared.
///
/// ## Parameter Index
///
/// [`put_with_parameters`](Self::put_with_parameters) registers an entry
/// under every hierarchical pattern of its parameters, both in a local index
/// and in one L2 set per pattern. [`get_by_parameters`](Self::get_by_parameters)
/// and [`invalidate_by_parameters`](Self::invalidate_by_parameters) resolve
/// patterns back to entries.
///
/// There is no stampede protection: concurrent misses on the same key may
/// each run their computation.
pub struct HierarchicalCacheService {
    name: String,
    config: Arc<CacheConfiguration>,
    keys: KeyDeriver,
    near: Option<Arc<NearCache>>,
    far: Option<DynFarCache>,
    stats: Arc<CacheStatistics>,
    l2_timeout: Duration,
    write_policy: L2WritePolicy,
    retries: Arc<RetryLedger>,
    index: ParameterIndex,
}

impl std::fmt::Debug for HierarchicalCacheService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HierarchicalCacheService")
            .field("name", &self.name)
            .field("l1", &self.near.is_some())
            .field("l2", &self.far.as_ref().map(|far| far.backend_name()))
            .field("write_policy", &self.write_policy)
            .finish()
    }
}

/// An L2 mutation that can be replayed by the retry task.
#[derive(Debug, Clone)]
enum FarWrite {
    Put {
        key: String,
        data: Arc<Vec<u8>>,
        ttl: Option<Duration>,
    },
    Delete {
        key: String,
    },
    Expire {
        key: String,
        ttl: Duration,
    },
    DeletePrefix {
        prefix: String,
    },
}

impl FarWrite {
    fn target(&self) -> &str {
        match self {
            FarWrite::Put { key, .. } | FarWrite::Delete { key } | FarWrite::Expire { key, .. } => {
                key
            }
            FarWrite::DeletePrefix { prefix } => prefix,
        }
    }

    fn op(&self) -> &'static str {
        match self {
            FarWrite::Put { .. } => "put",
            FarWrite::Delete { .. } => "delete",
            FarWrite::Expire { .. } => "expire",
            FarWrite::DeletePrefix { .. } => "clear",
        }
    }

    /// Returns whether the write touched an existing entry.
    async fn apply(&self, far: &dyn FarCache) -> Result<bool, TierError> {
        match self {
            FarWrite::Put { key, data, ttl } => far.put(key, data, *ttl).await.map(|()| true),
            FarWrite::Delete { key } => far.delete(key).await,
            FarWrite::Expire { key, ttl } => far.expire(key, *ttl).await,
            FarWrite::DeletePrefix { prefix } => far.delete_prefix(prefix).await.map(|n| n > 0),
        }
    }
}

impl HierarchicalCacheService {
    /// Build a service for `config`. The far cache is injected; pass `None`
    /// to run L1-only. Tier flags are combined with the level settings in
    /// `options`.
    pub fn new(
        config: CacheConfiguration,
        options: &CacheOptions,
        far: Option<DynFarCache>,
    ) -> CacheResult<Self> {
        config.validate()?;
        let tiers = options.resolve(&config);
        let keys = KeyDeriver::new(&options.key_prefix, &config.name, &config.cache_level)?;

        let near = if tiers.enable_l1 {
            Some(Arc::new(NearCache::new(&tiers.near)?))
        } else {
            None
        };
        let far = if tiers.enable_l2 { far } else { None };

        tracing::debug!(
            cache = %config.name,
            l1 = near.is_some(),
            l2 = far.as_ref().map(|far| far.backend_name()).unwrap_or("disabled"),
            "cache created"
        );

        Ok(Self {
            name: config.name.clone(),
            config: Arc::new(config),
            keys,
            near,
            far,
            stats: Arc::new(CacheStatistics::new()),
            l2_timeout: options.l2_timeout,
            write_policy: options.write_policy,
            retries: Arc::new(RetryLedger::default()),
            index: ParameterIndex::default(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CacheConfiguration {
        &self.config
    }

    pub fn is_l1_enabled(&self) -> bool {
        self.near.is_some()
    }

    pub fn is_l2_enabled(&self) -> bool {
        self.far.is_some()
    }

    /// Handle to the near tier, for sweepers and diagnostics.
    pub fn near(&self) -> Option<&Arc<NearCache>> {
        self.near.as_ref()
    }

    /// Number of entries currently held in L1.
    pub fn l1_size(&self) -> usize {
        self.near.as_ref().map_or(0, |near| near.len())
    }

    /// Derive the physical key for a logical key.
    pub fn key(&self, logical: &str) -> CacheResult<CacheKey> {
        self.keys.derive(logical)
    }

    /// Derive the physical key for a logical key scoped by search parameters.
    pub fn key_with(&self, logical: &str, parameters: &[SearchParameter]) -> CacheResult<CacheKey> {
        self.keys.derive_with(logical, parameters)
    }

    pub fn statistics(&self) -> &Arc<CacheStatistics> {
        &self.stats
    }

    pub fn snapshot(&self) -> CacheStatisticsSnapshot {
        self.stats.snapshot()
    }

    /// Zero counters, keeping the creation time.
    pub fn reset_statistics(&self) {
        self.stats.reset();
    }

    /// Zero counters and restart the creation time.
    pub fn hard_reset_statistics(&self) {
        self.stats.hard_reset();
    }

    async fn far_call<T>(
        &self,
        call: impl Future<Output = Result<T, TierError>>,
    ) -> Result<T, TierError> {
        match tokio::time::timeout(self.l2_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(TierError::l2_timeout(self.l2_timeout)),
        }
    }

    fn record_far_failure(&self, op: &'static str, key: &str, error: &TierError) {
        self.stats.increment_l2_errors();
        metrics::record_l2_error(&self.name, error.metric_label());
        tracing::warn!(cache = %self.name, key = %key, op, error = %error, "L2 call failed, continuing without it");
    }

    /// Apply a key write to L2 after any retry in flight for the same key.
    /// `None` when the L2 call failed.
    async fn write_far(&self, far: &DynFarCache, write: FarWrite) -> Option<bool> {
        let sequence = self.retries.next_sequence();
        let slot = self.retries.slot(write.target());
        let result = match &slot {
            Some(slot) => {
                let mut latest = slot.lock().await;
                *latest = (*latest).max(sequence);
                self.far_call(write.apply(far.as_ref())).await
            }
            None => self.far_call(write.apply(far.as_ref())).await,
        };

        match result {
            Ok(existed) => {
                if let Some(slot) = slot {
                    self.retries.release(write.target(), &slot);
                }
                Some(existed)
            }
            Err(e) => {
                self.record_far_failure(write.op(), write.target(), &e);
                self.schedule_key_retry(write, slot, sequence).await;
                None
            }
        }
    }

    fn store_near(&self, near: &NearCache, key: &CacheKey, data: Arc<Vec<u8>>, ttl: Option<Duration>) {
        if let Some(evicted) = near.put(key.as_str(), data, ttl) {
            self.index.forget(&evicted);
            self.stats.increment_l1_evictions();
            metrics::record_l1_eviction(&self.name);
            tracing::trace!(cache = %self.name, key = %evicted, "L1 eviction");
        }
        self.stats.increment_l1_puts();
        metrics::set_l1_entries(&self.name, near.len());
    }

    /// Look up `key`, consulting L1 then L2.
    ///
    /// Returns `Arc<Vec<u8>>` for zero-copy access to cached data.
    pub async fn get(&self, key: &CacheKey) -> Option<Arc<Vec<u8>>> {
        if let Some(near) = &self.near {
            if let Some(data) = near.get(key.as_str()) {
                tracing::debug!(cache = %self.name, key = %key, "cache hit (L1)");
                self.stats.increment_l1_hits();
                self.stats.increment_hits();
                metrics::record_hit(&self.name, Tier::Near);
                return Some(data);
            }
            self.stats.increment_l1_misses();
        }

        if let Some(far) = &self.far {
            match self.far_call(far.get(key.as_str())).await {
                Ok(Some(data)) => {
                    tracing::debug!(cache = %self.name, key = %key, "cache hit (L2)");
                    self.stats.increment_l2_hits();
                    self.stats.increment_hits();
                    metrics::record_hit(&self.name, Tier::Far);

                    let data = Arc::new(data);
                    if let Some(near) = &self.near {
                        self.store_near(near, key, Arc::clone(&data), self.config.ttl());
                    }
                    return Some(data);
                }
                Ok(None) => self.stats.increment_l2_misses(),
                Err(e) => self.record_far_failure("get", key.as_str(), &e),
            }
        }

        tracing::debug!(cache = %self.name, key = %key, "cache miss");
        self.stats.increment_misses();
        metrics::record_miss(&self.name);
        None
    }

    /// Store `value` under `key`. `None` TTL stores without expiry.
    pub async fn put(&self, key: &CacheKey, value: Vec<u8>, ttl: Option<Duration>) {
        self.put_shared(key, Arc::new(value), ttl).await;
    }

    async fn put_shared(&self, key: &CacheKey, data: Arc<Vec<u8>>, ttl: Option<Duration>) {
        if let Some(near) = &self.near {
            self.store_near(near, key, Arc::clone(&data), ttl);
        }

        if let Some(far) = &self.far {
            let write = FarWrite::Put {
                key: key.to_string(),
                data,
                ttl,
            };
            if self.write_far(far, write).await.is_some() {
                self.stats.increment_l2_puts();
                tracing::debug!(cache = %self.name, key = %key, ttl = ?ttl, "cache set (L1+L2)");
            }
        }

        self.stats.increment_keys();
        self.stats.increment_values();
    }

    /// Remove `key` from both tiers.
    pub async fn delete(&self, key: &CacheKey) {
        self.remove(key).await;
    }

    /// Returns whether either tier held the key.
    async fn remove(&self, key: &CacheKey) -> bool {
        let mut removed = false;
        self.index.forget(key.as_str());
        if let Some(near) = &self.near {
            removed |= near.delete(key.as_str());
            metrics::set_l1_entries(&self.name, near.len());
        }

        if let Some(far) = &self.far {
            let write = FarWrite::Delete {
                key: key.to_string(),
            };
            removed |= self.write_far(far, write).await.unwrap_or(false);
        }

        if removed {
            self.stats.decrement_keys();
            self.stats.decrement_values();
        }
        tracing::debug!(cache = %self.name, key = %key, removed, "cache delete");
        removed
    }

    /// Re-bound the lifetime of `key` on both tiers.
    pub async fn expire(&self, key: &CacheKey, ttl: Duration) {
        if let Some(near) = &self.near {
            near.expire(key.as_str(), ttl);
        }
        if let Some(far) = &self.far {
            let write = FarWrite::Expire {
                key: key.to_string(),
                ttl,
            };
            self.write_far(far, write).await;
        }
    }

    /// Drop every entry of this cache from both tiers. Retries scheduled
    /// before the call are abandoned.
    pub async fn clear(&self) {
        self.retries.advance_epoch();
        self.retries.drain().await;

        self.index.clear();
        if let Some(near) = &self.near {
            near.clear();
            metrics::set_l1_entries(&self.name, 0);
        }
        if let Some(far) = &self.far {
            let prefix = self.keys.namespace_prefix();
            match self.far_call(far.delete_prefix(&prefix)).await {
                Ok(removed) => {
                    tracing::info!(cache = %self.name, removed, "L2 entries cleared");
                }
                Err(e) => {
                    self.record_far_failure("clear", &prefix, &e);
                    self.schedule_retry(FarWrite::DeletePrefix { prefix }, None);
                }
            }
        }
        self.stats.clear_key_counts();
    }

    /// Store `value` under `key` and register it under every hierarchical
    /// pattern of `parameters`.
    pub async fn put_with_parameters(
        &self,
        key: &CacheKey,
        parameters: &[SearchParameter],
        value: Vec<u8>,
        ttl: Option<Duration>,
    ) {
        self.put(key, value, ttl).await;
        self.link_parameters(key, parameters).await;
    }

    /// Register an existing entry under every hierarchical pattern of
    /// `parameters`. A failed L2 registration is logged and not retried.
    pub async fn link_parameters(&self, key: &CacheKey, parameters: &[SearchParameter]) {
        let patterns = hierarchical_patterns(parameters);
        if patterns.is_empty() {
            return;
        }
        if self.near.is_some() {
            self.index.register(key.as_str(), &patterns);
        }
        if let Some(far) = &self.far {
            let indexes: Vec<String> = patterns
                .iter()
                .map(|pattern| self.keys.parameter_index_key(pattern))
                .collect();
            if let Err(e) = self.far_call(far.index_add(&indexes, key.as_str())).await {
                self.record_far_failure("index", key.as_str(), &e);
            }
        }
        tracing::debug!(cache = %self.name, key = %key, patterns = patterns.len(), "entry linked to parameters");
    }

    /// Every live entry registered under the exact parameter set.
    ///
    /// Parameters are matched as one pattern, so a query for a contiguous run
    /// of levels also finds entries stored with more levels. L1 answers when
    /// every indexed key is still held there; otherwise the L2 set is read
    /// and members whose entry has gone are pruned from it. One search
    /// counts as one hit or one miss.
    pub async fn get_by_parameters(&self, parameters: &[SearchParameter]) -> Vec<Arc<Vec<u8>>> {
        if parameters.is_empty() {
            self.stats.increment_misses();
            metrics::record_miss(&self.name);
            return Vec::new();
        }
        let pattern = canonical_parameters(parameters);

        if let Some(near) = &self.near {
            let members = self.index.members(&pattern);
            let mut found = Vec::with_capacity(members.len());
            let mut complete = true;
            for member in &members {
                match near.get(member) {
                    Some(data) => found.push(data),
                    None => {
                        self.index.forget(member);
                        complete = false;
                    }
                }
            }
            if !found.is_empty() && (complete || self.far.is_none()) {
                tracing::debug!(cache = %self.name, pattern = %pattern, entries = found.len(), "parameter search hit (L1)");
                self.stats.increment_l1_hits();
                self.stats.increment_hits();
                metrics::record_hit(&self.name, Tier::Near);
                return found;
            }
            self.stats.increment_l1_misses();
        }

        if let Some(far) = &self.far {
            let found = self.far_parameter_search(far, &pattern).await;
            if !found.is_empty() {
                tracing::debug!(cache = %self.name, pattern = %pattern, entries = found.len(), "parameter search hit (L2)");
                self.stats.increment_l2_hits();
                self.stats.increment_hits();
                metrics::record_hit(&self.name, Tier::Far);
                return found;
            }
            self.stats.increment_l2_misses();
        }

        tracing::debug!(cache = %self.name, pattern = %pattern, "parameter search miss");
        self.stats.increment_misses();
        metrics::record_miss(&self.name);
        Vec::new()
    }

    async fn far_parameter_search(&self, far: &DynFarCache, pattern: &str) -> Vec<Arc<Vec<u8>>> {
        let index = self.keys.parameter_index_key(pattern);
        let members = match self.far_call(far.index_members(&index)).await {
            Ok(members) => members,
            Err(e) => {
                self.record_far_failure("index", &index, &e);
                return Vec::new();
            }
        };

        let mut found = Vec::with_capacity(members.len());
        let mut stale = Vec::new();
        for member in members {
            match self.far_call(far.get(&member)).await {
                Ok(Some(data)) => {
                    let data = Arc::new(data);
                    if let Some(near) = &self.near {
                        let key = CacheKey::from_physical(&member);
                        self.store_near(near, &key, Arc::clone(&data), self.config.ttl());
                        self.index.register(&member, &[pattern.to_string()]);
                    }
                    found.push(data);
                }
                Ok(None) => stale.push(member),
                Err(e) => self.record_far_failure("get", &member, &e),
            }
        }

        if !stale.is_empty() {
            match self.far_call(far.index_remove(&index, &stale)).await {
                Ok(pruned) => tracing::debug!(cache = %self.name, index = %index, pruned, "pruned stale index members"),
                Err(e) => self.record_far_failure("index", &index, &e),
            }
        }
        found
    }

    /// Remove from both tiers every entry that
    /// [`get_by_parameters`](Self::get_by_parameters) would return for
    /// `parameters`, whether or not this node has seen it. Returns the number
    /// of entries removed.
    pub async fn invalidate_by_parameters(&self, parameters: &[SearchParameter]) -> usize {
        if parameters.is_empty() {
            return 0;
        }
        let pattern = canonical_parameters(parameters);
        let mut keys: BTreeSet<String> = self.index.members(&pattern).into_iter().collect();

        if let Some(far) = &self.far {
            let index = self.keys.parameter_index_key(&pattern);
            match self.far_call(far.index_members(&index)).await {
                Ok(members) => {
                    if let Err(e) = self.far_call(far.index_remove(&index, &members)).await {
                        self.record_far_failure("index", &index, &e);
                    }
                    keys.extend(members);
                }
                Err(e) => self.record_far_failure("index", &index, &e),
            }
        }

        let mut removed = 0;
        for key in &keys {
            if self.remove(&CacheKey::from_physical(key)).await {
                removed += 1;
            }
        }
        tracing::debug!(cache = %self.name, pattern = %pattern, removed, "invalidated by parameters");
        removed
    }

    /// Check whether the far tier answers within the request timeout.
    /// `None` when L2 is disabled for this cache.
    pub async fn ping_far(&self) -> Option<bool> {
        let far = self.far.as_ref()?;
        Some(self.far_call(far.ping()).await.is_ok())
    }

    /// Return the cached bytes, or run `compute` and cache its result.
    ///
    /// Errors from `compute` propagate unchanged and nothing is cached.
    pub async fn get_or_compute<F, Fut, E>(&self, key: &CacheKey, compute: F) -> Result<Arc<Vec<u8>>, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Vec<u8>, E>>,
    {
        if let Some(hit) = self.get(key).await {
            return Ok(hit);
        }
        let data = Arc::new(compute().await?);
        self.put_shared(key, Arc::clone(&data), self.config.ttl()).await;
        Ok(data)
    }

    /// Typed lookup. An entry that fails to decode is removed and reported
    /// as a miss.
    pub async fn get_value<T: DeserializeOwned>(&self, key: &CacheKey) -> Option<T> {
        let data = self.get(key).await?;
        match rmp_serde::from_slice::<T>(&data) {
            Ok(value) => Some(value),
            Err(e) => {
                tracing::warn!(cache = %self.name, key = %key, error = %e, "discarding undecodable cache entry");
                self.delete(key).await;
                None
            }
        }
    }

    /// Typed store using the cache TTL.
    pub async fn put_value<T: Serialize + ?Sized>(&self, key: &CacheKey, value: &T) -> CacheResult<()> {
        let data = rmp_serde::to_vec_named(value)?;
        self.put(key, data, self.config.ttl()).await;
        Ok(())
    }

    /// Typed variant of [`get_or_compute`](Self::get_or_compute). A computed
    /// value that cannot be encoded is returned without being cached.
    pub async fn get_or_compute_value<T, F, Fut, E>(&self, key: &CacheKey, compute: F) -> Result<T, E>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        if let Some(hit) = self.get_value::<T>(key).await {
            return Ok(hit);
        }
        let value = compute().await?;
        if let Err(e) = self.put_value(key, &value).await {
            tracing::warn!(cache = %self.name, key = %key, error = %e, "computed value not cached");
        }
        Ok(value)
    }

    fn retry_policy(&self) -> Option<(u32, Duration)> {
        match self.write_policy {
            L2WritePolicy::Retry {
                max_attempts,
                initial_backoff,
            } => Some((max_attempts, initial_backoff)),
            L2WritePolicy::Drop => None,
        }
    }

    /// Register `sequence` as the newest write of its key and hand the write
    /// to a retry task.
    async fn schedule_key_retry(&self, write: FarWrite, slot: Option<RetrySlot>, sequence: u64) {
        if self.retry_policy().is_none() {
            if let Some(slot) = slot {
                self.retries.release(write.target(), &slot);
            }
            return;
        }
        let slot = match slot {
            Some(slot) => slot,
            None => {
                let slot = self.retries.claim(write.target());
                let mut latest = slot.lock().await;
                *latest = (*latest).max(sequence);
                drop(latest);
                slot
            }
        };
        self.schedule_retry(write, Some((slot, sequence)));
    }

    fn schedule_retry(&self, write: FarWrite, claim: Option<(RetrySlot, u64)>) {
        let release = |claim: Option<(RetrySlot, u64)>| {
            if let Some((slot, _)) = claim {
                self.retries.release(write.target(), &slot);
            }
        };
        let Some((max_attempts, initial_backoff)) = self.retry_policy() else {
            release(claim);
            return;
        };
        let Some(far) = self.far.clone() else {
            release(claim);
            return;
        };
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::warn!(cache = %self.name, key = %write.target(), "no runtime for L2 retry, dropping write");
            release(claim);
            return;
        };

        let name = self.name.clone();
        let timeout = self.l2_timeout;
        let retries = Arc::clone(&self.retries);
        let epoch = retries.epoch();
        runtime.spawn(async move {
            let mut backoff = initial_backoff;
            let mut outcome = "exhausted";
            for attempt in 1..=max_attempts {
                tokio::time::sleep(backoff).await;

                // Held across the replay so no newer write can land first.
                let latest = match &claim {
                    Some((slot, _)) => Some(slot.lock().await),
                    None => None,
                };
                let superseded = retries.epoch() != epoch
                    || matches!((&latest, &claim), (Some(latest), Some((_, sequence))) if **latest != *sequence);
                if superseded {
                    outcome = "superseded";
                    break;
                }

                let result = match tokio::time::timeout(timeout, write.apply(far.as_ref())).await {
                    Ok(result) => result,
                    Err(_) => Err(TierError::l2_timeout(timeout)),
                };
                match result {
                    Ok(_) => {
                        tracing::debug!(cache = %name, key = %write.target(), attempt, "L2 retry succeeded");
                        outcome = "succeeded";
                        break;
                    }
                    Err(e) => {
                        tracing::debug!(cache = %name, key = %write.target(), attempt, error = %e, "L2 retry failed");
                        backoff = (backoff * 2).min(MAX_RETRY_BACKOFF);
                    }
                }
            }

            if let Some((slot, _)) = &claim {
                retries.release(write.target(), slot);
            }
            match outcome {
                "exhausted" => tracing::warn!(
                    cache = %name,
                    key = %write.target(),
                    max_attempts,
                    "L2 retries exhausted, tiers may diverge until expiry"
                ),
                "superseded" => tracing::debug!(
                    cache = %name,
                    key = %write.target(),
                    "L2 retry dropped, a newer write took over"
                ),
                _ => {}
            }
            metrics::record_l2_retry(&name, outcome);
        });
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::far::MemoryFarCache;
    use crate::near::NearCacheConfig;

    fn options() -> CacheOptions {
        CacheOptions {
            near: NearCacheConfig::with_capacity(16),
            l2_timeout: Duration::from_millis(100),
            ..CacheOptions::default()
        }
    }

    fn service(far: &Arc<MemoryFarCache>) -> HierarchicalCacheService {
        let far: DynFarCache = far.clone();
        HierarchicalCacheService::new(CacheConfiguration::named("users"), &options(), Some(far)).unwrap()
    }

    #[tokio::test]
    async fn test_put_then_get_hits_l1() {
        let far = Arc::new(MemoryFarCache::new());
        let cache = service(&far);
        let key = cache.key("1").unwrap();

        cache.put(&key, b"alice".to_vec(), None).await;
        assert_eq!(cache.get(&key).await.unwrap().as_slice(), b"alice");
        assert!(far.contains_key(key.as_str()));

        let stats = cache.statistics();
        assert_eq!(stats.l1_hits(), 1);
        assert_eq!(stats.l2_hits(), 0);
        assert_eq!(stats.l2_puts(), 1);
        assert_eq!(stats.total_keys(), 1);
    }

    #[tokio::test]
    async fn test_l2_hit_backfills_l1() {
        let far = Arc::new(MemoryFarCache::new());
        let cache = service(&far);
        let key = cache.key("1").unwrap();
        far.put(key.as_str(), b"bob", None).await.unwrap();

        assert_eq!(cache.get(&key).await.unwrap().as_slice(), b"bob");
        assert_eq!(cache.statistics().l2_hits(), 1);
        assert!(cache.near().unwrap().contains(key.as_str()));

        assert!(cache.get(&key).await.is_some());
        assert_eq!(cache.statistics().l1_hits(), 1);
    }

    #[tokio::test]
    async fn test_l2_failure_degrades_to_l1() {
        let far = Arc::new(MemoryFarCache::new());
        let cache = service(&far);
        let key = cache.key("1").unwrap();
        far.set_available(false);

        cache.put(&key, b"v".to_vec(), None).await;
        assert_eq!(cache.get(&key).await.unwrap().as_slice(), b"v");
        cache.delete(&key).await;
        assert!(cache.get(&key).await.is_none());

        // put, delete and the final get each failed on L2.
        assert_eq!(cache.statistics().l2_errors(), 3);
        assert_eq!(cache.statistics().misses(), 1);
    }

    #[tokio::test]
    async fn test_l1_only_cache_never_touches_l2() {
        let far = Arc::new(MemoryFarCache::new());
        let dyn_far: DynFarCache = far.clone();
        let config = CacheConfiguration::named("local").with_tiers(true, false);
        let cache = HierarchicalCacheService::new(config, &options(), Some(dyn_far)).unwrap();
        let key = cache.key("k").unwrap();

        cache.put(&key, b"v".to_vec(), None).await;
        assert!(far.is_empty());
        assert!(!cache.is_l2_enabled());
        assert_eq!(cache.ping_far().await, None);
    }

    #[tokio::test]
    async fn test_get_or_compute_caches_success_only() {
        let far = Arc::new(MemoryFarCache::new());
        let cache = service(&far);
        let key = cache.key("k").unwrap();

        let failed = cache
            .get_or_compute(&key, || async { Err::<Vec<u8>, _>("boom") })
            .await;
        assert_eq!(failed.unwrap_err(), "boom");
        assert!(cache.get(&key).await.is_none());

        let calls = AtomicUsize::new(0);
        for _ in 0..2 {
            let value = cache
                .get_or_compute(&key, || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, &str>(b"v".to_vec())
                })
                .await
                .unwrap();
            assert_eq!(value.as_slice(), b"v");
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_undecodable_entry_is_a_miss() {
        let far = Arc::new(MemoryFarCache::new());
        let cache = service(&far);
        let key = cache.key("k").unwrap();
        cache.put(&key, vec![0xc1], None).await;

        assert_eq!(cache.get_value::<String>(&key).await, None);
        assert!(!far.contains_key(key.as_str()));
    }

    #[tokio::test]
    async fn test_typed_round_trip() {
        let far = Arc::new(MemoryFarCache::new());
        let cache = service(&far);
        let key = cache.key("k").unwrap();

        cache.put_value(&key, &vec![1u32, 2, 3]).await.unwrap();
        assert_eq!(cache.get_value::<Vec<u32>>(&key).await, Some(vec![1, 2, 3]));
    }

    #[tokio::test]
    async fn test_clear_removes_only_this_cache() {
        let far = Arc::new(MemoryFarCache::new());
        let cache = service(&far);
        let key = cache.key("1").unwrap();
        cache.put(&key, b"v".to_vec(), None).await;
        far.put("hcache:orders:default:1", b"o", None).await.unwrap();

        cache.clear().await;
        assert!(cache.get(&key).await.is_none());
        assert!(far.contains_key("hcache:orders:default:1"));
    }

    fn retrying_service(far: &Arc<MemoryFarCache>) -> HierarchicalCacheService {
        let dyn_far: DynFarCache = far.clone();
        let options = CacheOptions {
            write_policy: L2WritePolicy::Retry {
                max_attempts: 3,
                initial_backoff: Duration::from_millis(100),
            },
            ..options()
        };
        HierarchicalCacheService::new(CacheConfiguration::named("users"), &options, Some(dyn_far)).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_policy_replays_failed_put() {
        let far = Arc::new(MemoryFarCache::new());
        let cache = retrying_service(&far);
        let key = cache.key("1").unwrap();

        far.set_available(false);
        cache.put(&key, b"v".to_vec(), None).await;
        assert!(!far.contains_key(key.as_str()));

        far.set_available(true);
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(far.contains_key(key.as_str()));
        assert_eq!(cache.retries.pending(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_delete_after_failed_put_stays_deleted() {
        let far = Arc::new(MemoryFarCache::new());
        let cache = retrying_service(&far);
        let key = cache.key("1").unwrap();

        far.set_available(false);
        cache.put(&key, b"v".to_vec(), None).await;
        far.set_available(true);
        cache.delete(&key).await;

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(cache.get(&key).await.is_none());
        assert!(!far.contains_key(key.as_str()));
        assert_eq!(cache.retries.pending(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_newer_put_wins_over_retried_put() {
        let far = Arc::new(MemoryFarCache::new());
        let cache = retrying_service(&far);
        let key = cache.key("1").unwrap();

        far.set_available(false);
        cache.put(&key, b"v1".to_vec(), None).await;
        far.set_available(true);
        cache.put(&key, b"v2".to_vec(), None).await;

        tokio::time::sleep(Duration::from_millis(1000)).await;
        assert_eq!(far.get(key.as_str()).await.unwrap().unwrap(), b"v2");
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_newer_put_replaces_older_retry() {
        let far = Arc::new(MemoryFarCache::new());
        let cache = retrying_service(&far);
        let key = cache.key("1").unwrap();

        far.set_available(false);
        cache.put(&key, b"v1".to_vec(), None).await;
        cache.put(&key, b"v2".to_vec(), None).await;
        far.set_available(true);

        tokio::time::sleep(Duration::from_millis(1000)).await;
        assert_eq!(far.get(key.as_str()).await.unwrap().unwrap(), b"v2");
        assert_eq!(cache.retries.pending(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_clear_abandons_pending_retries() {
        let far = Arc::new(MemoryFarCache::new());
        let cache = retrying_service(&far);
        let key = cache.key("1").unwrap();

        far.set_available(false);
        cache.put(&key, b"v".to_vec(), None).await;
        far.set_available(true);
        cache.clear().await;

        tokio::time::sleep(Duration::from_millis(1000)).await;
        assert!(cache.get(&key).await.is_none());
        assert!(far.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_clear_is_retried() {
        let far = Arc::new(MemoryFarCache::new());
        let cache = retrying_service(&far);
        let key = cache.key("1").unwrap();
        cache.put(&key, b"v".to_vec(), None).await;

        far.set_available(false);
        cache.clear().await;
        far.set_available(true);

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(!far.contains_key(key.as_str()));
    }

    fn tenant_region(tenant: &str, region: &str) -> Vec<SearchParameter> {
        vec![
            SearchParameter::new("tenant", tenant, 1),
            SearchParameter::new("region", region, 2),
        ]
    }

    #[tokio::test]
    async fn test_get_by_parameters_matches_hierarchy() {
        let far = Arc::new(MemoryFarCache::new());
        let cache = service(&far);
        let eu = tenant_region("acme", "eu");
        let us = tenant_region("acme", "us");
        let eu_key = cache.key_with("list", &eu).unwrap();
        let us_key = cache.key_with("list", &us).unwrap();

        cache.put_with_parameters(&eu_key, &eu, b"eu".to_vec(), None).await;
        cache.put_with_parameters(&us_key, &us, b"us".to_vec(), None).await;

        let exact = cache.get_by_parameters(&eu).await;
        assert_eq!(exact.len(), 1);
        assert_eq!(exact[0].as_slice(), b"eu");

        let tenant = [SearchParameter::new("tenant", "acme", 1)];
        let mut all: Vec<Vec<u8>> = cache
            .get_by_parameters(&tenant)
            .await
            .iter()
            .map(|data| data.to_vec())
            .collect();
        all.sort();
        assert_eq!(all, vec![b"eu".to_vec(), b"us".to_vec()]);

        assert!(cache.get_by_parameters(&tenant_region("other", "eu")).await.is_empty());
        assert!(cache.get_by_parameters(&[]).await.is_empty());

        let stats = cache.statistics();
        assert_eq!(stats.l1_hits(), 2);
        assert_eq!(stats.misses(), 2);
    }

    #[tokio::test]
    async fn test_get_by_parameters_falls_back_to_l2() {
        let far = Arc::new(MemoryFarCache::new());
        let writer = service(&far);
        let reader = service(&far);
        let eu = tenant_region("acme", "eu");
        let key = writer.key_with("list", &eu).unwrap();
        writer.put_with_parameters(&key, &eu, b"eu".to_vec(), None).await;

        let found = reader.get_by_parameters(&eu).await;
        assert_eq!(found.len(), 1);
        assert_eq!(reader.statistics().l2_hits(), 1);

        // Backfilled into L1 and the local index.
        assert_eq!(reader.get_by_parameters(&eu).await.len(), 1);
        assert_eq!(reader.statistics().l1_hits(), 1);
    }

    #[tokio::test]
    async fn test_get_by_parameters_prunes_deleted_members() {
        let far = Arc::new(MemoryFarCache::new());
        let cache = service(&far);
        let eu = tenant_region("acme", "eu");
        let key = cache.key_with("list", &eu).unwrap();
        cache.put_with_parameters(&key, &eu, b"eu".to_vec(), None).await;
        far.delete(key.as_str()).await.unwrap();
        cache.near().unwrap().delete(key.as_str());

        assert!(cache.get_by_parameters(&eu).await.is_empty());
        let index = cache.keys.parameter_index_key(&canonical_parameters(&eu));
        assert!(far.index_members(&index).await.unwrap().is_empty());
        assert_eq!(cache.index.len(), 0);
    }

    #[tokio::test]
    async fn test_invalidate_by_parameters_removes_matching_entries() {
        let far = Arc::new(MemoryFarCache::new());
        let cache = service(&far);
        let eu = tenant_region("acme", "eu");
        let other = tenant_region("globex", "us");
        let eu_key = cache.key_with("list", &eu).unwrap();
        let other_key = cache.key_with("list", &other).unwrap();
        cache.put_with_parameters(&eu_key, &eu, b"eu".to_vec(), None).await;
        cache.put_with_parameters(&other_key, &other, b"us".to_vec(), None).await;

        let removed = cache
            .invalidate_by_parameters(&[SearchParameter::new("tenant", "acme", 1)])
            .await;
        assert_eq!(removed, 1);
        assert!(cache.get(&eu_key).await.is_none());
        assert!(!far.contains_key(eu_key.as_str()));
        assert!(cache.get(&other_key).await.is_some());
        assert!(cache.get_by_parameters(&eu).await.is_empty());
        assert_eq!(cache.get_by_parameters(&other).await.len(), 1);
        assert_eq!(cache.statistics().total_keys(), 1);
    }

    #[tokio::test]
    async fn test_invalidate_by_parameters_reaches_other_nodes_entries() {
        let far = Arc::new(MemoryFarCache::new());
        let writer = service(&far);
        let other_node = service(&far);
        let eu = tenant_region("acme", "eu");
        let key = writer.key_with("list", &eu).unwrap();
        writer.put_with_parameters(&key, &eu, b"eu".to_vec(), None).await;

        assert_eq!(other_node.invalidate_by_parameters(&eu).await, 1);
        assert!(!far.contains_key(key.as_str()));
        assert!(other_node.get_by_parameters(&eu).await.is_empty());
    }

    #[tokio::test]
    async fn test_l1_eviction_unlinks_index() {
        let far = Arc::new(MemoryFarCache::new());
        let dyn_far: DynFarCache = far.clone();
        let options = CacheOptions {
            near: NearCacheConfig::with_capacity(1),
            ..options()
        };
        let cache =
            HierarchicalCacheService::new(CacheConfiguration::named("users"), &options, Some(dyn_far)).unwrap();
        let eu = tenant_region("acme", "eu");
        let us = tenant_region("acme", "us");
        let eu_key = cache.key_with("list", &eu).unwrap();
        let us_key = cache.key_with("list", &us).unwrap();

        cache.put_with_parameters(&eu_key, &eu, b"eu".to_vec(), None).await;
        cache.put_with_parameters(&us_key, &us, b"us".to_vec(), None).await;
        assert_eq!(cache.index.len(), 1);
    }

    #[tokio::test]
    async fn test_clear_drops_parameter_index() {
        let far = Arc::new(MemoryFarCache::new());
        let cache = service(&far);
        let eu = tenant_region("acme", "eu");
        let key = cache.key_with("list", &eu).unwrap();
        cache.put_with_parameters(&key, &eu, b"eu".to_vec(), None).await;

        cache.clear().await;
        assert_eq!(cache.index.len(), 0);
        assert!(far.is_empty());
        assert!(cache.get_by_parameters(&eu).await.is_empty());
    }

    #[tokio::test]
    async fn test_clear_resets_key_counts() {
        let far = Arc::new(MemoryFarCache::new());
        let cache = service(&far);
        for id in ["1", "2"] {
            let key = cache.key(id).unwrap();
            cache.put(&key, b"v".to_vec(), None).await;
        }
        assert_eq!(cache.statistics().total_keys(), 2);

        cache.clear().await;
        assert_eq!(cache.statistics().total_keys(), 0);
        assert_eq!(cache.statistics().total_values(), 0);
    }
}
