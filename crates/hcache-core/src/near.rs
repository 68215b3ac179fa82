//! In-process near cache (L1).
//!
//! A fixed number of shards, each an LRU guarded by a `parking_lot` mutex.
//! Keys are spread over shards by hash, which keeps lock hold times short
//! under concurrent access. Reads take the shard lock with a timeout and
//! degrade to a miss when contended; writes always wait for the lock so a
//! completed `put` is visible to the next `get`.

use std::collections::hash_map::RandomState;
use std::hash::BuildHasher;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use lru::LruCache;
use parking_lot::{Mutex, MutexGuard};
use tokio::task::JoinHandle;

use crate::entry::{CacheEntry, Tier};
use crate::error::{CacheError, CacheResult, TierError};

/// Near cache sizing and locking.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NearCacheConfig {
    /// Upper bound on entries across all shards.
    pub maximum_size: usize,
    /// Number of independently locked shards.
    pub shards: usize,
    /// How long a read waits for a shard lock before treating L1 as unavailable.
    pub lock_timeout: Duration,
}

fn default_maximum_size() -> usize {
    10_000
}

fn default_shards() -> usize {
    16
}

fn default_lock_timeout() -> Duration {
    Duration::from_millis(50)
}

impl Default for NearCacheConfig {
    fn default() -> Self {
        Self {
            maximum_size: default_maximum_size(),
            shards: default_shards(),
            lock_timeout: default_lock_timeout(),
        }
    }
}

impl NearCacheConfig {
    /// Single-shard configuration with the given capacity. Eviction order is
    /// exact LRU across the whole cache.
    pub fn with_capacity(maximum_size: usize) -> Self {
        Self {
            maximum_size,
            shards: 1,
            ..Self::default()
        }
    }
}

/// Sharded LRU near cache.
pub struct NearCache {
    shards: Box<[Mutex<LruCache<String, CacheEntry>>]>,
    hasher: RandomState,
    lock_timeout: Duration,
    capacity: usize,
    /// Stored entries across all shards. Only changed while the owning
    /// shard's lock is held.
    entries: AtomicUsize,
}

impl std::fmt::Debug for NearCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NearCache")
            .field("shards", &self.shards.len())
            .field("capacity", &self.capacity)
            .field("lock_timeout", &self.lock_timeout)
            .finish()
    }
}

impl NearCache {
    /// Build a near cache. Capacity is split evenly across shards, so the
    /// effective bound is `maximum_size` rounded up to a multiple of the shard
    /// count.
    pub fn new(config: &NearCacheConfig) -> CacheResult<Self> {
        if config.maximum_size == 0 {
            return Err(CacheError::configuration(
                "near cache maximum_size must be greater than zero",
            ));
        }
        let shard_count = config.shards.clamp(1, config.maximum_size);
        let per_shard = NonZeroUsize::new(config.maximum_size.div_ceil(shard_count))
            .ok_or_else(|| CacheError::configuration("near cache shard capacity is zero"))?;

        let shards = (0..shard_count)
            .map(|_| Mutex::new(LruCache::new(per_shard)))
            .collect::<Vec<_>>()
            .into_boxed_slice();

        Ok(Self {
            shards,
            hasher: RandomState::new(),
            lock_timeout: config.lock_timeout,
            capacity: per_shard.get() * shard_count,
            entries: AtomicUsize::new(0),
        })
    }

    /// Total entry capacity.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn shard_for(&self, key: &str) -> &Mutex<LruCache<String, CacheEntry>> {
        let idx = (self.hasher.hash_one(key) as usize) % self.shards.len();
        &self.shards[idx]
    }

    fn try_lock(&self, key: &str) -> Result<MutexGuard<'_, LruCache<String, CacheEntry>>, TierError> {
        self.shard_for(key)
            .try_lock_for(self.lock_timeout)
            .ok_or_else(|| {
                TierError::l1_unavailable(format!(
                    "shard lock not acquired within {:?}",
                    self.lock_timeout
                ))
            })
    }

    /// Look up a live entry. Expired entries are removed on sight. Lock
    /// contention past the configured timeout is reported as a miss.
    pub fn get(&self, key: &str) -> Option<Arc<Vec<u8>>> {
        let mut shard = match self.try_lock(key) {
            Ok(shard) => shard,
            Err(e) => {
                tracing::debug!(key = %key, error = %e, "L1 lookup skipped");
                return None;
            }
        };

        let expired = shard.peek(key)?.is_expired();
        if expired {
            if shard.pop(key).is_some() {
                self.entries.fetch_sub(1, Ordering::Relaxed);
            }
            return None;
        }
        shard.get(key).map(|entry| Arc::clone(&entry.data))
    }

    /// Insert or overwrite an entry, marking it most recently used.
    ///
    /// Returns the key evicted to make room, if any.
    pub fn put(
        &self,
        key: &str,
        data: impl Into<Arc<Vec<u8>>>,
        ttl: Option<Duration>,
    ) -> Option<String> {
        let entry = CacheEntry::new(data, ttl, Tier::Near);
        let mut shard = self.shard_for(key).lock();
        match shard.push(key.to_string(), entry) {
            Some((old_key, _)) if old_key != key => Some(old_key),
            Some(_) => None,
            None => {
                self.entries.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Remove an entry. Returns `true` if a live entry was removed.
    pub fn delete(&self, key: &str) -> bool {
        let mut shard = self.shard_for(key).lock();
        let removed = shard.pop(key);
        if removed.is_some() {
            self.entries.fetch_sub(1, Ordering::Relaxed);
        }
        removed.is_some_and(|entry| !entry.is_expired())
    }

    /// Re-bound the lifetime of an existing entry. Returns `true` if the key
    /// was present.
    pub fn expire(&self, key: &str, ttl: Duration) -> bool {
        let mut shard = self.shard_for(key).lock();
        match shard.peek_mut(key) {
            Some(entry) if !entry.is_expired() => {
                entry.expire_in(ttl);
                true
            }
            _ => false,
        }
    }

    /// Check for a live entry without touching recency.
    pub fn contains(&self, key: &str) -> bool {
        let shard = self.shard_for(key).lock();
        shard.peek(key).is_some_and(|entry| !entry.is_expired())
    }

    /// Number of stored entries, including expired ones not yet swept.
    /// Read without taking any shard lock.
    pub fn len(&self) -> usize {
        self.entries.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every entry.
    pub fn clear(&self) {
        for shard in self.shards.iter() {
            let mut shard = shard.lock();
            self.entries.fetch_sub(shard.len(), Ordering::Relaxed);
            shard.clear();
        }
    }

    /// Remove all expired entries. Returns the number removed.
    pub fn purge_expired(&self) -> usize {
        let mut removed = 0;
        for shard in self.shards.iter() {
            let mut shard = shard.lock();
            let expired: Vec<String> = shard
                .iter()
                .filter(|(_, entry)| entry.is_expired())
                .map(|(key, _)| key.clone())
                .collect();
            for key in &expired {
                shard.pop(key.as_str());
            }
            self.entries.fetch_sub(expired.len(), Ordering::Relaxed);
            removed += expired.len();
        }
        removed
    }

    /// Periodically purge expired entries. The task ends once the cache is
    /// dropped.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let cache: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(cache) = cache.upgrade() else {
                    break;
                };
                let removed = cache.purge_expired();
                if removed > 0 {
                    tracing::debug!(removed, "L1 sweep removed expired entries");
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache(capacity: usize) -> NearCache {
        NearCache::new(&NearCacheConfig::with_capacity(capacity)).unwrap()
    }

    #[test]
    fn test_put_then_get() {
        let near = cache(4);
        assert!(near.put("k", b"v".to_vec(), None).is_none());
        assert_eq!(near.get("k").unwrap().as_slice(), b"v");
        assert_eq!(near.len(), 1);
    }

    #[test]
    fn test_lru_eviction_prefers_least_recently_used() {
        let near = cache(2);
        near.put("a", b"1".to_vec(), None);
        near.put("b", b"2".to_vec(), None);
        // Touch "a" so "b" becomes the eviction candidate.
        assert!(near.get("a").is_some());

        let evicted = near.put("c", b"3".to_vec(), None);
        assert_eq!(evicted.as_deref(), Some("b"));
        assert!(near.get("b").is_none());
        assert!(near.get("a").is_some());
        assert!(near.get("c").is_some());
    }

    #[test]
    fn test_overwrite_is_not_an_eviction() {
        let near = cache(1);
        near.put("a", b"1".to_vec(), None);
        assert!(near.put("a", b"2".to_vec(), None).is_none());
        assert_eq!(near.get("a").unwrap().as_slice(), b"2");
    }

    #[test]
    fn test_expired_entry_is_a_miss() {
        let near = cache(4);
        near.put("k", b"v".to_vec(), Some(Duration::ZERO));
        assert!(near.get("k").is_none());
        assert_eq!(near.len(), 0);
    }

    #[test]
    fn test_expire_and_purge() {
        let near = cache(4);
        near.put("a", b"1".to_vec(), None);
        near.put("b", b"2".to_vec(), None);
        assert!(near.expire("a", Duration::ZERO));
        assert!(!near.expire("missing", Duration::ZERO));

        assert_eq!(near.purge_expired(), 1);
        assert!(!near.contains("a"));
        assert!(near.contains("b"));
    }

    #[test]
    fn test_delete_and_clear() {
        let near = NearCache::new(&NearCacheConfig::default()).unwrap();
        near.put("a", b"1".to_vec(), None);
        near.put("b", b"2".to_vec(), None);
        assert!(near.delete("a"));
        assert!(!near.delete("a"));

        near.clear();
        assert!(near.is_empty());
    }

    #[test]
    fn test_len_tracks_inserts_evictions_and_removals() {
        let near = cache(2);
        near.put("a", b"1".to_vec(), None);
        near.put("a", b"2".to_vec(), None);
        assert_eq!(near.len(), 1);

        near.put("b", b"1".to_vec(), None);
        near.put("c", b"1".to_vec(), None);
        assert_eq!(near.len(), 2);

        assert!(near.delete("c"));
        assert_eq!(near.len(), 1);

        near.put("d", b"1".to_vec(), Some(Duration::ZERO));
        assert!(near.get("d").is_none());
        assert_eq!(near.len(), 1);

        near.put("e", b"1".to_vec(), Some(Duration::ZERO));
        assert_eq!(near.purge_expired(), 1);
        assert_eq!(near.len(), 1);

        near.clear();
        assert_eq!(near.len(), 0);
    }

    #[test]
    fn test_len_does_not_wait_for_shard_locks() {
        let near = NearCache::new(&NearCacheConfig {
            maximum_size: 4,
            shards: 1,
            lock_timeout: Duration::from_millis(10),
        })
        .unwrap();
        near.put("a", b"1".to_vec(), None);

        let _held = near.shards[0].lock();
        assert_eq!(near.len(), 1);
        assert!(!near.is_empty());
    }

    #[test]
    fn test_zero_capacity_rejected() {
        let err = NearCache::new(&NearCacheConfig::with_capacity(0)).unwrap_err();
        assert!(err.is_configuration());
    }

    #[test]
    fn test_shards_never_exceed_capacity() {
        let near = NearCache::new(&NearCacheConfig {
            maximum_size: 3,
            shards: 16,
            lock_timeout: Duration::from_millis(10),
        })
        .unwrap();
        assert_eq!(near.capacity(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_purges_expired_entries() {
        let near = Arc::new(cache(4));
        near.put("k", b"v".to_vec(), Some(Duration::ZERO));
        let handle = near.spawn_sweeper(Duration::from_secs(1));

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(near.is_empty());
        handle.abort();
    }
}
