use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;

use super::FarCache;
use crate::entry::{CacheEntry, Tier};
use crate::error::TierError;

/// In-memory far cache backed by a `DashMap`.
///
/// Useful for single-process deployments and for exercising the two-tier
/// paths without a Redis server. Availability and latency can be toggled at
/// runtime to simulate an unreachable or slow L2.
#[derive(Debug)]
pub struct MemoryFarCache {
    data: DashMap<String, CacheEntry>,
    sets: DashMap<String, HashSet<String>>,
    available: AtomicBool,
    latency_ms: AtomicU64,
}

impl Default for MemoryFarCache {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryFarCache {
    pub fn new() -> Self {
        Self {
            data: DashMap::new(),
            sets: DashMap::new(),
            available: AtomicBool::new(true),
            latency_ms: AtomicU64::new(0),
        }
    }

    /// When `false`, every call fails with `L2Unreachable`.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::Relaxed);
    }

    /// Delay applied before every call.
    pub fn set_latency(&self, latency: Duration) {
        self.latency_ms
            .store(latency.as_millis() as u64, Ordering::Relaxed);
    }

    /// Number of stored keys, including expired ones.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// `true` when neither entries nor index sets are stored.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty() && self.sets.is_empty()
    }

    /// Check for a live key.
    pub fn contains_key(&self, key: &str) -> bool {
        self.data
            .get(key)
            .is_some_and(|entry| !entry.is_expired())
    }

    async fn enter(&self) -> Result<(), TierError> {
        let latency = self.latency_ms.load(Ordering::Relaxed);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }
        if self.available.load(Ordering::Relaxed) {
            Ok(())
        } else {
            Err(TierError::l2_unreachable("memory far cache marked unavailable"))
        }
    }
}

#[async_trait]
impl FarCache for MemoryFarCache {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, TierError> {
        self.enter().await?;
        let expired = match self.data.get(key) {
            Some(entry) if !entry.is_expired() => return Ok(Some(entry.data.to_vec())),
            Some(_) => true,
            None => false,
        };
        if expired {
            self.data.remove_if(key, |_, entry| entry.is_expired());
        }
        Ok(None)
    }

    async fn put(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> Result<(), TierError> {
        self.enter().await?;
        self.data
            .insert(key.to_string(), CacheEntry::new(value.to_vec(), ttl, Tier::Far));
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, TierError> {
        self.enter().await?;
        Ok(self
            .data
            .remove(key)
            .is_some_and(|(_, entry)| !entry.is_expired()))
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, TierError> {
        self.enter().await?;
        match self.data.get_mut(key) {
            Some(mut entry) if !entry.is_expired() => {
                entry.expire_in(ttl);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<u64, TierError> {
        self.enter().await?;
        let before = self.data.len() + self.sets.len();
        self.data.retain(|key, _| !key.starts_with(prefix));
        self.sets.retain(|key, _| !key.starts_with(prefix));
        let after = self.data.len() + self.sets.len();
        Ok(before.saturating_sub(after) as u64)
    }

    async fn index_add(&self, indexes: &[String], member: &str) -> Result<(), TierError> {
        self.enter().await?;
        for index in indexes {
            self.sets
                .entry(index.clone())
                .or_default()
                .insert(member.to_string());
        }
        Ok(())
    }

    async fn index_members(&self, index: &str) -> Result<Vec<String>, TierError> {
        self.enter().await?;
        Ok(self
            .sets
            .get(index)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn index_remove(&self, index: &str, members: &[String]) -> Result<u64, TierError> {
        self.enter().await?;
        let mut removed = 0;
        if let Some(mut set) = self.sets.get_mut(index) {
            for member in members {
                if set.remove(member) {
                    removed += 1;
                }
            }
        }
        self.sets.remove_if(index, |_, set| set.is_empty());
        Ok(removed)
    }

    async fn ping(&self) -> Result<(), TierError> {
        self.enter().await
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}
