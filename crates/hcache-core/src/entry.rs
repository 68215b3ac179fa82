//! Cache entries owned by a single tier.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use time::OffsetDateTime;

/// Cache tier tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Tier {
    /// In-process near cache.
    #[serde(rename = "L1")]
    Near,
    /// Shared far cache.
    #[serde(rename = "L2")]
    Far,
}

impl Tier {
    /// Label used in logs and metrics.
    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Near => "L1",
            Tier::Far => "L2",
        }
    }
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A cached value with its lifetime bookkeeping.
///
/// The payload is wrapped in `Arc` so hits can hand it out without copying.
/// Each tier builds its own entry from the raw bytes, so L1 and L2 never share
/// an entry.
#[derive(Clone, Debug)]
pub struct CacheEntry {
    pub data: Arc<Vec<u8>>,
    /// Wall-clock creation time, for reporting.
    pub created_at: OffsetDateTime,
    /// Monotonic creation time, for expiry.
    pub cached_at: Instant,
    /// `None` means the entry never expires.
    pub expires_at: Option<Instant>,
    pub origin: Tier,
}

impl CacheEntry {
    /// Create a new entry. A `None` TTL means no expiry.
    pub fn new(data: impl Into<Arc<Vec<u8>>>, ttl: Option<Duration>, origin: Tier) -> Self {
        let cached_at = Instant::now();
        Self {
            data: data.into(),
            created_at: OffsetDateTime::now_utc(),
            cached_at,
            expires_at: ttl.map(|ttl| cached_at + ttl),
            origin,
        }
    }

    /// Check if this entry has expired.
    pub fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|at| Instant::now() >= at)
    }

    /// Re-bound the entry lifetime, counting from now.
    pub fn expire_in(&mut self, ttl: Duration) {
        self.expires_at = Some(Instant::now() + ttl);
    }

    /// Time left before expiry; `None` for entries without a TTL.
    pub fn remaining_ttl(&self) -> Option<Duration> {
        self.expires_at
            .map(|at| at.saturating_duration_since(Instant::now()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_without_ttl_never_expires() {
        let entry = CacheEntry::new(b"v".to_vec(), None, Tier::Near);
        assert!(!entry.is_expired());
        assert_eq!(entry.remaining_ttl(), None);
    }

    #[test]
    fn test_entry_expires() {
        let mut entry = CacheEntry::new(b"v".to_vec(), Some(Duration::from_secs(60)), Tier::Far);
        assert!(!entry.is_expired());

        entry.expire_in(Duration::ZERO);
        assert!(entry.is_expired());
        assert_eq!(entry.remaining_ttl(), Some(Duration::ZERO));
    }

    #[test]
    fn test_tier_labels() {
        assert_eq!(Tier::Near.to_string(), "L1");
        assert_eq!(Tier::Far.as_str(), "L2");
    }
}
