//! Cache metrics emitted through the `metrics` facade.
//!
//! Nothing is recorded unless the embedding application installs a recorder.

use metrics::{counter, gauge};

use crate::entry::Tier;

/// Metric names as constants for consistency.
pub mod names {
    pub const HITS_TOTAL: &str = "hcache_hits_total";
    pub const MISSES_TOTAL: &str = "hcache_misses_total";
    pub const L2_ERRORS_TOTAL: &str = "hcache_l2_errors_total";
    pub const L1_EVICTIONS_TOTAL: &str = "hcache_l1_evictions_total";
    pub const L1_ENTRIES: &str = "hcache_l1_entries";
    pub const L2_RETRIES_TOTAL: &str = "hcache_l2_retries_total";
}

/// Record a hit served by `tier`.
pub fn record_hit(cache: &str, tier: Tier) {
    counter!(names::HITS_TOTAL, "cache" => cache.to_string(), "tier" => tier.as_str()).increment(1);
}

/// Record a miss on both tiers.
pub fn record_miss(cache: &str) {
    counter!(names::MISSES_TOTAL, "cache" => cache.to_string()).increment(1);
}

/// Record a failed L2 call. `kind` is a low-cardinality error label.
pub fn record_l2_error(cache: &str, kind: &'static str) {
    counter!(names::L2_ERRORS_TOTAL, "cache" => cache.to_string(), "kind" => kind).increment(1);
}

pub fn record_l1_eviction(cache: &str) {
    counter!(names::L1_EVICTIONS_TOTAL, "cache" => cache.to_string()).increment(1);
}

/// Update the L1 entry gauge.
pub fn set_l1_entries(cache: &str, count: usize) {
    gauge!(names::L1_ENTRIES, "cache" => cache.to_string()).set(count as f64);
}

/// Record the final outcome of a background L2 retry: `succeeded`,
/// `exhausted`, or `superseded` when a newer write or a clear took over.
pub fn record_l2_retry(cache: &str, outcome: &'static str) {
    counter!(names::L2_RETRIES_TOTAL, "cache" => cache.to_string(), "outcome" => outcome)
        .increment(1);
}
