//! Far cache (L2) abstraction.
//!
//! A far cache is shared across processes and reached over the network, so
//! every call may fail or stall. Implementations report failures as
//! [`TierError`]; the service bounds each call with its request timeout and
//! absorbs the error.
//!
//! Values cross this boundary as owned byte buffers: L2 never holds a
//! reference to an L1 entry.
//!
//! Besides plain entries a far cache keeps string sets, used as the shared
//! parameter index. Index sets have no expiry; members whose entry is gone
//! are pruned by readers.

mod memory;

pub use memory::MemoryFarCache;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::TierError;

/// Shared, networked key/value tier.
#[async_trait]
pub trait FarCache: Send + Sync {
    /// Fetch the bytes stored under `key`.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, TierError>;

    /// Store `value` under `key`. `None` TTL stores without expiry.
    async fn put(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> Result<(), TierError>;

    /// Remove `key`. Returns `true` if the key existed.
    async fn delete(&self, key: &str) -> Result<bool, TierError>;

    /// Re-bound the lifetime of `key`. Returns `true` if the key existed.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, TierError>;

    /// Remove every key starting with `prefix`. Returns the number removed.
    async fn delete_prefix(&self, prefix: &str) -> Result<u64, TierError>;

    /// Add `member` to each index set in `indexes`.
    async fn index_add(&self, indexes: &[String], member: &str) -> Result<(), TierError>;

    /// Members of the index set `index`. Empty when the set does not exist.
    async fn index_members(&self, index: &str) -> Result<Vec<String>, TierError>;

    /// Remove `members` from the index set `index`. Returns the number removed.
    async fn index_remove(&self, index: &str, members: &[String]) -> Result<u64, TierError>;

    /// Round-trip health check.
    async fn ping(&self) -> Result<(), TierError>;

    /// Short backend name for logs.
    fn backend_name(&self) -> &'static str;
}

/// Type-erased far cache handle.
pub type DynFarCache = Arc<dyn FarCache>;
