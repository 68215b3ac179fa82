//! # hcache-core
//!
//! Two-tier cache: an in-process near cache (L1) in front of a shared far
//! cache (L2).
//!
//! ## Overview
//!
//! - [`NearCache`]: sharded LRU with per-entry TTL, local to the process.
//! - [`FarCache`]: trait for the shared tier. `hcache-redis` provides the
//!   Redis implementation; [`MemoryFarCache`] is an in-memory stand-in.
//! - [`HierarchicalCacheService`]: coordinates both tiers for one named
//!   cache. Reads go L1, then L2 with backfill into L1. L2 failures degrade
//!   to misses and are never surfaced to callers. Entries tagged with
//!   [`SearchParameter`]s can be found and invalidated by parameter pattern.
//! - [`CacheManager`]: one service per cache name, sharing the far tier.
//! - [`Cacheable`]: wraps an async computation with cache lookup and store.
//! - [`CacheStatistics`]: lock-free counters with point-in-time snapshots.
//!
//! ## Example
//!
//! ```ignore
//! use hcache_core::{CacheManager, CacheOptions, MemoryFarCache};
//!
//! let far: DynFarCache = Arc::new(MemoryFarCache::new());
//! let manager = CacheManager::new(CacheOptions::default(), Some(far));
//!
//! let users = manager.get_cache("users")?;
//! let key = users.key("42")?;
//! users.put(&key, b"alice".to_vec(), None).await;
//! assert!(users.get(&key).await.is_some());
//! ```

mod config;
mod entry;
mod error;
pub mod far;
mod index;
mod interceptor;
mod key;
mod manager;
pub mod metrics;
mod near;
mod retry;
mod service;
mod stats;

pub use config::{
    CacheConfiguration, CacheOptions, DEFAULT_CACHE_LEVEL, L2WritePolicy, LevelSettings,
};
pub use entry::{CacheEntry, Tier};
pub use error::{CacheError, CacheResult, TierError};
pub use far::{DynFarCache, FarCache, MemoryFarCache};
pub use interceptor::{Cacheable, KeyFn};
pub use key::{
    CacheKey, CallArgs, DEFAULT_KEY_PREFIX, KeyDeriver, KeyTemplate, SearchParameter,
    canonical_parameters, default_logical_key, hierarchical_patterns, parameter_digest,
};
pub use manager::{CacheHandle, CacheManager};
pub use near::{NearCache, NearCacheConfig};
pub use service::HierarchicalCacheService;
pub use stats::{CacheStatistics, CacheStatisticsSnapshot};
