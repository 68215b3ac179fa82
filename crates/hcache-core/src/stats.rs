//! Statistics recorder for a hierarchical cache.
//!
//! Counters are plain atomics so hot-path lookups never contend with each
//! other or with readers. The `created_at`/`last_reset_at` pair lives behind an
//! [`ArcSwap`] and is replaced as a whole, so a reader never observes one
//! timestamp from before a reset and the other from after it.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use arc_swap::ArcSwap;
use serde::Serialize;
use time::OffsetDateTime;

#[derive(Debug, Clone, Copy)]
struct Lifetime {
    created_at: OffsetDateTime,
    last_reset_at: OffsetDateTime,
}

impl Lifetime {
    fn starting_now() -> Self {
        let now = OffsetDateTime::now_utc();
        Self {
            created_at: now,
            last_reset_at: now,
        }
    }
}

/// Thread-safe hit/miss/eviction counters for both tiers.
#[derive(Debug)]
pub struct CacheStatistics {
    hits: AtomicU64,
    misses: AtomicU64,
    total_keys: AtomicU64,
    total_values: AtomicU64,
    evictions: AtomicU64,

    l1_hits: AtomicU64,
    l1_misses: AtomicU64,
    l1_puts: AtomicU64,
    l1_evictions: AtomicU64,

    l2_hits: AtomicU64,
    l2_misses: AtomicU64,
    l2_puts: AtomicU64,
    l2_errors: AtomicU64,

    lifetime: ArcSwap<Lifetime>,
}

impl Default for CacheStatistics {
    fn default() -> Self {
        Self::new()
    }
}

impl CacheStatistics {
    pub fn new() -> Self {
        Self {
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            total_keys: AtomicU64::new(0),
            total_values: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            l1_hits: AtomicU64::new(0),
            l1_misses: AtomicU64::new(0),
            l1_puts: AtomicU64::new(0),
            l1_evictions: AtomicU64::new(0),
            l2_hits: AtomicU64::new(0),
            l2_misses: AtomicU64::new(0),
            l2_puts: AtomicU64::new(0),
            l2_errors: AtomicU64::new(0),
            lifetime: ArcSwap::from_pointee(Lifetime::starting_now()),
        }
    }

    // ==================== Overall ====================

    pub fn increment_hits(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_misses(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_keys(&self) {
        self.total_keys.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_values(&self) {
        self.total_values.fetch_add(1, Ordering::Relaxed);
    }

    /// Decrement the key count, never going below zero.
    pub fn decrement_keys(&self) {
        saturating_decrement(&self.total_keys);
    }

    /// Decrement the value count, never going below zero.
    pub fn decrement_values(&self) {
        saturating_decrement(&self.total_values);
    }

    /// Zero the key and value counts after the cache was emptied. Lookup
    /// counters are kept.
    pub fn clear_key_counts(&self) {
        self.total_keys.store(0, Ordering::Relaxed);
        self.total_values.store(0, Ordering::Relaxed);
    }

    // ==================== L1 ====================

    pub fn increment_l1_hits(&self) {
        self.l1_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_l1_misses(&self) {
        self.l1_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_l1_puts(&self) {
        self.l1_puts.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an L1 capacity eviction. Also counts towards total evictions.
    pub fn increment_l1_evictions(&self) {
        self.l1_evictions.fetch_add(1, Ordering::Relaxed);
        self.evictions.fetch_add(1, Ordering::Relaxed);
    }

    // ==================== L2 ====================

    pub fn increment_l2_hits(&self) {
        self.l2_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_l2_misses(&self) {
        self.l2_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_l2_puts(&self) {
        self.l2_puts.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an absorbed L2 failure. Kept apart from misses on purpose.
    pub fn increment_l2_errors(&self) {
        self.l2_errors.fetch_add(1, Ordering::Relaxed);
    }

    // ==================== Getters ====================

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    pub fn total_keys(&self) -> u64 {
        self.total_keys.load(Ordering::Relaxed)
    }

    pub fn total_values(&self) -> u64 {
        self.total_values.load(Ordering::Relaxed)
    }

    pub fn evictions(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }

    pub fn l1_hits(&self) -> u64 {
        self.l1_hits.load(Ordering::Relaxed)
    }

    pub fn l1_misses(&self) -> u64 {
        self.l1_misses.load(Ordering::Relaxed)
    }

    pub fn l1_puts(&self) -> u64 {
        self.l1_puts.load(Ordering::Relaxed)
    }

    pub fn l1_evictions(&self) -> u64 {
        self.l1_evictions.load(Ordering::Relaxed)
    }

    pub fn l2_hits(&self) -> u64 {
        self.l2_hits.load(Ordering::Relaxed)
    }

    pub fn l2_misses(&self) -> u64 {
        self.l2_misses.load(Ordering::Relaxed)
    }

    pub fn l2_puts(&self) -> u64 {
        self.l2_puts.load(Ordering::Relaxed)
    }

    pub fn l2_errors(&self) -> u64 {
        self.l2_errors.load(Ordering::Relaxed)
    }

    pub fn total_requests(&self) -> u64 {
        self.hits() + self.misses()
    }

    /// `hits / (hits + misses)`, or `0.0` before the first lookup.
    pub fn hit_ratio(&self) -> f64 {
        ratio(self.hits(), self.total_requests())
    }

    pub fn created_at(&self) -> OffsetDateTime {
        self.lifetime.load().created_at
    }

    pub fn last_reset_at(&self) -> OffsetDateTime {
        self.lifetime.load().last_reset_at
    }

    // ==================== Reset / Snapshot ====================

    /// Zero every counter and stamp `last_reset_at`. `created_at` is kept.
    pub fn reset(&self) {
        self.zero_counters();
        let created_at = self.created_at();
        self.lifetime.store(Arc::new(Lifetime {
            created_at,
            last_reset_at: OffsetDateTime::now_utc(),
        }));
    }

    /// Full re-initialisation: counters zeroed, and `created_at` and
    /// `last_reset_at` both set to the same new instant.
    pub fn hard_reset(&self) {
        self.zero_counters();
        self.lifetime.store(Arc::new(Lifetime::starting_now()));
    }

    /// Immutable point-in-time copy of every counter.
    pub fn snapshot(&self) -> CacheStatisticsSnapshot {
        let lifetime = **self.lifetime.load();
        let hits = self.hits();
        let misses = self.misses();
        let l1_hits = self.l1_hits();
        let l1_misses = self.l1_misses();
        let l2_hits = self.l2_hits();
        let l2_misses = self.l2_misses();
        let total_keys = self.total_keys();
        let total_values = self.total_values();

        CacheStatisticsSnapshot {
            hits,
            misses,
            total_requests: hits + misses,
            hit_ratio: ratio(hits, hits + misses),
            miss_ratio: ratio(misses, hits + misses),
            l1_hits,
            l1_misses,
            l1_puts: self.l1_puts(),
            l1_evictions: self.l1_evictions(),
            l1_hit_ratio: ratio(l1_hits, l1_hits + l1_misses),
            l2_hits,
            l2_misses,
            l2_puts: self.l2_puts(),
            l2_errors: self.l2_errors(),
            l2_hit_ratio: ratio(l2_hits, l2_hits + l2_misses),
            evictions: self.evictions(),
            total_keys,
            total_values,
            keys_to_values_ratio: ratio(total_keys, total_values),
            created_at: lifetime.created_at,
            last_reset_at: lifetime.last_reset_at,
            snapshot_at: OffsetDateTime::now_utc(),
        }
    }

    fn zero_counters(&self) {
        for counter in [
            &self.hits,
            &self.misses,
            &self.total_keys,
            &self.total_values,
            &self.evictions,
            &self.l1_hits,
            &self.l1_misses,
            &self.l1_puts,
            &self.l1_evictions,
            &self.l2_hits,
            &self.l2_misses,
            &self.l2_puts,
            &self.l2_errors,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

fn saturating_decrement(counter: &AtomicU64) {
    let _ = counter.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| v.checked_sub(1));
}

fn ratio(part: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        part as f64 / total as f64
    }
}

/// Point-in-time copy of [`CacheStatistics`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStatisticsSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub total_requests: u64,
    pub hit_ratio: f64,
    pub miss_ratio: f64,
    pub l1_hits: u64,
    pub l1_misses: u64,
    pub l1_puts: u64,
    pub l1_evictions: u64,
    pub l1_hit_ratio: f64,
    pub l2_hits: u64,
    pub l2_misses: u64,
    pub l2_puts: u64,
    pub l2_errors: u64,
    pub l2_hit_ratio: f64,
    pub evictions: u64,
    pub total_keys: u64,
    pub total_values: u64,
    pub keys_to_values_ratio: f64,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub last_reset_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub snapshot_at: OffsetDateTime,
}
