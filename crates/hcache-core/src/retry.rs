//! Ordering of background L2 retries against later writes.
//!
//! Every L2 write takes a sequence number. A key that has a retry in flight
//! owns a slot holding the newest sequence number that touched it. Writes to
//! such a key hold the slot lock around their L2 call, and a retry replays
//! only while the slot still carries its own sequence number. `clear` moves
//! the epoch forward, which retires every retry scheduled before it.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use tokio::sync::Mutex as AsyncMutex;

/// Newest write sequence number seen for one key.
pub(crate) type RetrySlot = Arc<AsyncMutex<u64>>;

#[derive(Debug, Default)]
pub(crate) struct RetryLedger {
    sequence: AtomicU64,
    epoch: AtomicU64,
    slots: DashMap<String, RetrySlot>,
}

impl RetryLedger {
    pub(crate) fn next_sequence(&self) -> u64 {
        self.sequence.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub(crate) fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::Acquire)
    }

    /// Retire every retry scheduled so far. Returns the new epoch.
    pub(crate) fn advance_epoch(&self) -> u64 {
        self.epoch.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Slot of a key with a retry in flight.
    pub(crate) fn slot(&self, key: &str) -> Option<RetrySlot> {
        self.slots.get(key).map(|slot| Arc::clone(slot.value()))
    }

    /// Slot for `key`, created when absent.
    pub(crate) fn claim(&self, key: &str) -> RetrySlot {
        let slot = self
            .slots
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(0)));
        Arc::clone(slot.value())
    }

    /// Drop the caller's interest in `slot`. The slot leaves the map once no
    /// writer or retry task holds it any more.
    pub(crate) fn release(&self, key: &str, slot: &RetrySlot) {
        self.slots
            .remove_if(key, |_, held| Arc::ptr_eq(held, slot) && Arc::strong_count(held) == 2);
    }

    /// Wait until no retry is in the middle of an L2 call.
    pub(crate) async fn drain(&self) {
        let slots: Vec<RetrySlot> = self.slots.iter().map(|slot| Arc::clone(slot.value())).collect();
        for slot in slots {
            drop(slot.lock().await);
        }
    }

    pub(crate) fn pending(&self) -> usize {
        self.slots.len()
    }
}
